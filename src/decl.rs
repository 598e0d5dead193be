//! The declaration parser (spec.md §4.4).
//!
//! Declarator composition (`int *a[3]` vs `int (*a)[3]`) is built the same
//! way the evaluator builds expressions out of token input: a small set of
//! mutually recursive parsing functions, here producing `Box<dyn FnOnce>`
//! type-building closures instead of an `Expr` tree, since a declarator's
//! outer suffix has to be spliced into whatever its (possibly
//! parenthesized, possibly still-unparsed) inner declarator eventually
//! wraps, rather than applied directly to the base type. Everything here
//! takes `types`/`symbols` the same way `eval.rs`'s parser functions do —
//! there is no bundled "parser context" struct, per Design Note §9's
//! rejection of a single global parser-state owner. Only the two top-level
//! entry points (`external_declaration`, `function_definition`) touch a
//! full `Compilation`, since only they own a definitions buffer or a
//! sandbox to evaluate file-scope constant initializers against.

use crate::diag::{self, Diagnostic, Span};
use crate::eval::{self, Expr, UnaryOp};
use crate::ir::{BlockId, Cfg, Definition, Terminator, Var};
use crate::symbol::Symbol;
use crate::symtab::{Linkage, SymbolKind, SymbolTable};
use crate::token::{TokenKind, TokenStream};
use crate::types::{self, Param, Qualifier, Type, TypeKind, Types};
use crate::Compilation;

fn kw(s: &str) -> Symbol { crate::symbol::intern(s) }

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StorageClass { Typedef, Extern, Static, Auto, Register }

/// The resolved type plus storage class from a `declaration_specifiers`
/// parse (spec.md §4.4).
pub struct DeclSpec<'a> {
    pub ty: Type<'a>,
    pub storage: Option<StorageClass>,
}

#[derive(Default)]
struct BasicSpec {
    void: u8, char_: u8, short: u8, int: u8,
    signed: u8, unsigned: u8, long: u8, float: u8, double: u8,
}

fn is_basic_keyword(s: Symbol) -> bool {
    s == kw("void") || s == kw("char") || s == kw("short") || s == kw("int")
        || s == kw("signed") || s == kw("unsigned") || s == kw("long")
        || s == kw("float") || s == kw("double")
}

/// Resolve an accumulated specifier combination to a canonical C89 basic
/// type (spec.md §4.4 "declaration_specifiers"). Floating types ignore
/// `long double` as a distinct width (Non-goal: no extended-precision
/// float support) and fold it into `double`.
fn resolve_basic<'a>(types: &Types<'a>, b: &BasicSpec, span: Span) -> diag::Result<Type<'a>> {
    if b.void > 0 { return Ok(types.void) }
    if b.float > 0 { return Ok(types.float) }
    if b.double > 0 { return Ok(types.double) }
    if b.char_ > 0 {
        return Ok(if b.signed > 0 { types.schar } else if b.unsigned > 0 { types.uchar } else { types.char_ });
    }
    if b.long >= 2 { return Ok(if b.unsigned > 0 { types.ulonglong } else { types.longlong }) }
    if b.long == 1 { return Ok(if b.unsigned > 0 { types.ulong } else { types.long }) }
    if b.short > 0 { return Ok(if b.unsigned > 0 { types.ushort } else { types.short }) }
    if b.unsigned > 0 { return Ok(types.uint) }
    if b.int > 0 || b.signed > 0 { return Ok(types.int) }
    Err(Diagnostic::semantic(span, "no type specifiers given in a declaration"))
}

fn set_storage(storage: &mut Option<StorageClass>, sc: StorageClass, span: Span) -> diag::Result<()> {
    if storage.is_some() { return Err(Diagnostic::semantic(span, "duplicate storage-class specifier")) }
    *storage = Some(sc);
    Ok(())
}

/// `declaration_specifiers` (spec.md §4.4): accumulate basic-type
/// specifiers into a bitset, track at most one storage class and one of
/// each qualifier, and dispatch `struct`/`union`/`enum`/a typedef name to
/// their own sub-parsers. Stops at the first token that cannot extend the
/// specifier list, leaving it for `declarator` to consume.
pub fn declaration_specifiers<'a>(
    ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>,
) -> diag::Result<DeclSpec<'a>> {
    let mut basic = BasicSpec::default();
    let mut storage: Option<StorageClass> = None;
    let mut qualifier = Qualifier::empty();
    let mut user_type: Option<Type<'a>> = None;
    let mut saw_any = false;

    loop {
        let span = ts.peek().span;
        match &ts.peek().kind {
            TokenKind::Keyword(s) => {
                let s = *s;
                if is_basic_keyword(s) && user_type.is_some() {
                    return Err(Diagnostic::semantic(span, "cannot combine a basic type specifier with a tagged type"));
                }
                if s == kw("void") { ts.next(); basic.void += 1; saw_any = true; }
                else if s == kw("char") { ts.next(); basic.char_ += 1; saw_any = true; }
                else if s == kw("short") { ts.next(); basic.short += 1; saw_any = true; }
                else if s == kw("int") { ts.next(); basic.int += 1; saw_any = true; }
                else if s == kw("long") { ts.next(); basic.long += 1; saw_any = true; }
                else if s == kw("float") { ts.next(); basic.float += 1; saw_any = true; }
                else if s == kw("double") { ts.next(); basic.double += 1; saw_any = true; }
                else if s == kw("signed") { ts.next(); basic.signed += 1; saw_any = true; }
                else if s == kw("unsigned") { ts.next(); basic.unsigned += 1; saw_any = true; }
                else if s == kw("const") {
                    ts.next();
                    if qualifier.contains(Qualifier::CONST) { return Err(Diagnostic::semantic(span, "duplicate 'const' qualifier")) }
                    qualifier |= Qualifier::CONST;
                }
                else if s == kw("volatile") {
                    ts.next();
                    if qualifier.contains(Qualifier::VOLATILE) { return Err(Diagnostic::semantic(span, "duplicate 'volatile' qualifier")) }
                    qualifier |= Qualifier::VOLATILE;
                }
                else if s == kw("typedef") { ts.next(); set_storage(&mut storage, StorageClass::Typedef, span)?; }
                else if s == kw("extern") { ts.next(); set_storage(&mut storage, StorageClass::Extern, span)?; }
                else if s == kw("static") { ts.next(); set_storage(&mut storage, StorageClass::Static, span)?; }
                else if s == kw("auto") { ts.next(); set_storage(&mut storage, StorageClass::Auto, span)?; }
                else if s == kw("register") { ts.next(); set_storage(&mut storage, StorageClass::Register, span)?; }
                else if s == kw("struct") || s == kw("union") {
                    if saw_any || user_type.is_some() {
                        return Err(Diagnostic::semantic(span, "cannot combine a basic type specifier with a struct/union specifier"));
                    }
                    let is_struct = s == kw("struct");
                    ts.next();
                    user_type = Some(struct_or_union_declaration(ts, types, symbols, is_struct)?);
                    saw_any = true;
                }
                else if s == kw("enum") {
                    if saw_any || user_type.is_some() {
                        return Err(Diagnostic::semantic(span, "cannot combine a basic type specifier with an enum specifier"));
                    }
                    ts.next();
                    user_type = Some(enum_declaration(ts, types, symbols)?);
                    saw_any = true;
                }
                else { break }
            }
            TokenKind::Identifier(name) => {
                let name = *name;
                if saw_any || user_type.is_some() { break }
                match symbols.lookup_ident(name) {
                    Some(sym) if symbols.get(sym).kind == SymbolKind::Typedef => {
                        ts.next();
                        user_type = Some(symbols.get(sym).ty);
                        saw_any = true;
                    }
                    _ => break,
                }
            }
            _ => break,
        }
    }

    if !saw_any {
        return Err(Diagnostic::semantic(ts.peek().span, "expected a type specifier"));
    }
    let base = match user_type {
        Some(t) => t,
        None => resolve_basic(types, &basic, ts.peek().span)?,
    };
    let ty = if qualifier.is_empty() { base } else { types.with_qualifier(base, qualifier) };
    Ok(DeclSpec { ty, storage })
}

/// `struct_or_union_declaration` (spec.md §4.4): binds or extends a tag in
/// the tag namespace. An anonymous aggregate (`struct { ... }`) never
/// touches the tag namespace at all.
fn struct_or_union_declaration<'a>(
    ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>, is_struct: bool,
) -> diag::Result<Type<'a>> {
    let tag = match &ts.peek().kind {
        TokenKind::Identifier(s) => { let s = *s; ts.next(); Some(s) }
        _ => None,
    };
    let has_body = matches!(&ts.peek().kind, TokenKind::Punct('{'));

    if let Some(name) = tag {
        if let Some(existing) = symbols.lookup_tag(name) {
            let existing_ty = symbols.get(existing).ty;
            let existing_is_struct = matches!(&types::unwrapped(existing_ty).kind, TypeKind::Struct(_));
            if existing_is_struct != is_struct {
                return Err(Diagnostic::semantic(ts.peek().span, "tag redeclared as a different kind of aggregate"));
            }
            if has_body {
                if types::nmembers(existing_ty) > 0 {
                    return Err(Diagnostic::semantic(ts.peek().span, "redefinition of a struct/union tag"));
                }
                ts.next();
                parse_member_list(ts, types, symbols, existing_ty)?;
                expect_punct(ts, '}')?;
            }
            return Ok(types.tagged_copy(existing_ty, name));
        }
        let ty = if is_struct { types.new_struct() } else { types.new_union() };
        symbols.add_tag(name, ty);
        if has_body {
            ts.next();
            parse_member_list(ts, types, symbols, ty)?;
            expect_punct(ts, '}')?;
        }
        return Ok(types.tagged_copy(ty, name));
    }

    if !has_body {
        return Err(Diagnostic::syntax(ts.peek().span, "expected '{' or a tag name after struct/union"));
    }
    ts.next();
    let ty = if is_struct { types.new_struct() } else { types.new_union() };
    parse_member_list(ts, types, symbols, ty)?;
    expect_punct(ts, '}')?;
    Ok(ty)
}

fn parse_member_list<'a>(
    ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>, ty: Type<'a>,
) -> diag::Result<()> {
    while !matches!(&ts.peek().kind, TokenKind::Punct('}')) {
        let spec = declaration_specifiers(ts, types, symbols)?;
        loop {
            let (name, mty) = declarator(ts, types, spec.ty, symbols)?;
            let name = name.ok_or_else(|| Diagnostic::syntax(ts.peek().span, "expected a member name"))?;
            types.add_member(ty, Param::Named(name, mty));
            if matches!(&ts.peek().kind, TokenKind::Punct(',')) { ts.next(); continue }
            break;
        }
        expect_punct(ts, ';')?;
    }
    Ok(())
}

/// `enumerator_list` (spec.md §4.4): sequential values from zero, each
/// overridable by `= constant-expression`; every enumerator is an `int`.
fn enum_declaration<'a>(
    ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>,
) -> diag::Result<Type<'a>> {
    let tag = match &ts.peek().kind {
        TokenKind::Identifier(s) => { let s = *s; ts.next(); Some(s) }
        _ => None,
    };
    if matches!(&ts.peek().kind, TokenKind::Punct('{')) {
        ts.next();
        let mut next_value: i64 = 0;
        loop {
            let name = expect_identifier(ts)?;
            if matches!(&ts.peek().kind, TokenKind::Punct('=')) {
                ts.next();
                let expr = eval::parse_assignment(ts, types, symbols)?;
                next_value = const_eval(symbols, &expr)?;
            }
            let sym = symbols.add_ident(name, SymbolKind::EnumConstant, Linkage::None, types.int);
            symbols.get_mut(sym).payload.enum_value = Some(next_value);
            next_value = next_value.wrapping_add(1);
            if matches!(&ts.peek().kind, TokenKind::Punct(',')) {
                ts.next();
                if matches!(&ts.peek().kind, TokenKind::Punct('}')) { break }
                continue;
            }
            break;
        }
        expect_punct(ts, '}')?;
    }
    if let Some(name) = tag { symbols.add_tag(name, types.int); }
    Ok(types.int)
}

/// Fold a constant expression at parse time (array dimensions,
/// enumerator values): a pure walk over `Expr`, never touching a `Cfg`.
/// Only literals, enum constants, and operators closed over them are
/// legal — anything naming a runtime value is a semantic error.
pub(crate) fn const_eval<'a>(symbols: &SymbolTable<'a>, expr: &Expr<'a>) -> diag::Result<i64> {
    match expr {
        Expr::IntLiteral(v, _) => Ok(*v),
        Expr::Ident(sym, _) => symbols.get(*sym).payload.enum_value
            .ok_or_else(|| Diagnostic::semantic(Span::default(), "expected a constant expression")),
        Expr::Unary { op, expr } => {
            let v = const_eval(symbols, expr)?;
            match op {
                UnaryOp::Neg => Ok(v.wrapping_neg()),
                UnaryOp::BitNot => Ok(!v),
                UnaryOp::Not => Ok(i64::from(v == 0)),
                UnaryOp::Addr | UnaryOp::Deref => Err(Diagnostic::semantic(Span::default(), "expected a constant expression")),
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let a = const_eval(symbols, lhs)?;
            let b = const_eval(symbols, rhs)?;
            Ok(op.fold(a, b))
        }
        Expr::LogicalAnd(lhs, rhs) => Ok(i64::from(const_eval(symbols, lhs)? != 0 && const_eval(symbols, rhs)? != 0)),
        Expr::LogicalOr(lhs, rhs) => Ok(i64::from(const_eval(symbols, lhs)? != 0 || const_eval(symbols, rhs)? != 0)),
        Expr::Conditional { cond, then, else_ } =>
            if const_eval(symbols, cond)? != 0 { const_eval(symbols, then) } else { const_eval(symbols, else_) },
        _ => Err(Diagnostic::semantic(Span::default(), "expected a constant expression")),
    }
}

/// `parameter_list` (spec.md §4.4): a lone `void` means no parameters; the
/// token stream's single-token `peek` still resolves this without two-token
/// lookahead by tentatively consuming `void` and checking what follows —
/// if it isn't `)`, the consumed `void` was this parameter's type.
pub fn parameter_list<'a>(
    ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>,
) -> diag::Result<Vec<Param<'a>>> {
    let mut params = Vec::new();
    if matches!(&ts.peek().kind, TokenKind::Punct(')')) { return Ok(params) }

    if matches!(&ts.peek().kind, TokenKind::Keyword(s) if *s == kw("void")) {
        ts.next();
        if matches!(&ts.peek().kind, TokenKind::Punct(')')) { return Ok(params) }
        let (name, ty) = declarator(ts, types, types.void, symbols)?;
        params.push(Param::Named(name.unwrap_or_else(|| kw("")), ty));
        if matches!(&ts.peek().kind, TokenKind::Punct(',')) { ts.next(); } else { return Ok(params) }
    }

    loop {
        if matches!(&ts.peek().kind, TokenKind::Dots) {
            ts.next();
            params.push(Param::Ellipsis);
            if matches!(&ts.peek().kind, TokenKind::Punct(',')) {
                return Err(Diagnostic::syntax(ts.peek().span, "'...' must be the last parameter"));
            }
            break;
        }
        let spec = declaration_specifiers(ts, types, symbols)?;
        let (name, ty) = declarator(ts, types, spec.ty, symbols)?;
        params.push(Param::Named(name.unwrap_or_else(|| kw("")), ty));
        if matches!(&ts.peek().kind, TokenKind::Punct(',')) { ts.next(); continue }
        break;
    }
    Ok(params)
}

/// A type-building step, composed outer-to-inner as a declarator's pieces
/// are discovered (spec.md §4.4 "nested declarators stitched by splicing
/// the outer suffix into the inner declarator's tail").
type DeclFn<'t, 'a> = Box<dyn FnOnce(Type<'a>) -> Type<'a> + 't>;

/// `declarator(base, name?)` (spec.md §4.4): apply the composed
/// pointer/suffix chain to `base`.
pub fn declarator<'a>(
    ts: &mut dyn TokenStream, types: &Types<'a>, base: Type<'a>, symbols: &mut SymbolTable<'a>,
) -> diag::Result<(Option<Symbol>, Type<'a>)> {
    let (name, f) = declarator_fn(ts, types, symbols)?;
    Ok((name, f(base)))
}

fn declarator_fn<'t, 'a>(
    ts: &mut dyn TokenStream, types: &'t Types<'a>, symbols: &mut SymbolTable<'a>,
) -> diag::Result<(Option<Symbol>, DeclFn<'t, 'a>)> {
    let mut ptr_quals = Vec::new();
    while matches!(&ts.peek().kind, TokenKind::Punct('*')) {
        ts.next();
        let mut q = Qualifier::empty();
        loop {
            match &ts.peek().kind {
                TokenKind::Keyword(s) if *s == kw("const") => {
                    if q.contains(Qualifier::CONST) { return Err(Diagnostic::semantic(ts.peek().span, "duplicate 'const' qualifier")) }
                    ts.next(); q |= Qualifier::CONST;
                }
                TokenKind::Keyword(s) if *s == kw("volatile") => {
                    if q.contains(Qualifier::VOLATILE) { return Err(Diagnostic::semantic(ts.peek().span, "duplicate 'volatile' qualifier")) }
                    ts.next(); q |= Qualifier::VOLATILE;
                }
                _ => break,
            }
        }
        ptr_quals.push(q);
    }
    let (name, direct) = direct_declarator(ts, types, symbols)?;

    // The star closest to the base type wraps first (innermost); each
    // later star wraps the previous result, matching `int * const * p`
    // ("p is a pointer to a const pointer to int").
    let mut ptrs_fn: DeclFn<'t, 'a> = Box::new(|x| x);
    for q in ptr_quals {
        let prev = ptrs_fn;
        ptrs_fn = Box::new(move |x| {
            let p = types.pointer(prev(x));
            if q.is_empty() { p } else { types.with_qualifier(p, q) }
        });
    }
    let composed: DeclFn<'t, 'a> = Box::new(move |x| direct(ptrs_fn(x)));
    Ok((name, composed))
}

/// `direct_declarator` (spec.md §4.4): an identifier or a parenthesized
/// sub-declarator, followed by any number of array/function suffixes. For
/// `(declarator)`, the outer suffixes apply to the type the *parentheses*
/// receive, and the inner declarator's own composed function wraps that
/// result — not the other way around, which is what makes `int (*a)[3]`
/// (pointer to array) come out differently from `int *a[3]` (array of
/// pointer).
fn direct_declarator<'t, 'a>(
    ts: &mut dyn TokenStream, types: &'t Types<'a>, symbols: &mut SymbolTable<'a>,
) -> diag::Result<(Option<Symbol>, DeclFn<'t, 'a>)> {
    match &ts.peek().kind {
        TokenKind::Identifier(s) => {
            let name = *s;
            ts.next();
            let suffix_fn = parse_suffixes(ts, types, symbols)?;
            Ok((Some(name), suffix_fn))
        }
        TokenKind::Punct('(') => {
            ts.next();
            let (name, inner) = declarator_fn(ts, types, symbols)?;
            expect_punct(ts, ')')?;
            let suffix_fn = parse_suffixes(ts, types, symbols)?;
            let combined: DeclFn<'t, 'a> = Box::new(move |x| inner(suffix_fn(x)));
            Ok((name, combined))
        }
        _ => {
            let suffix_fn = parse_suffixes(ts, types, symbols)?;
            Ok((None, suffix_fn))
        }
    }
}

enum Suffix<'a> { Array(Option<u64>), Function(Vec<Param<'a>>) }

/// Array/function suffixes (spec.md §4.4): only the outermost array
/// dimension may be left unspecified — an `a[][3]` inner dimension must be
/// given, since each inner element's size must be known to index the
/// outer array, a rule this function does not itself re-check (the element
/// type, built by the recursive suffix closer below, would simply stay
/// incomplete and later trip `types::is_complete` at the use site).
fn parse_suffixes<'t, 'a>(
    ts: &mut dyn TokenStream, types: &'t Types<'a>, symbols: &mut SymbolTable<'a>,
) -> diag::Result<DeclFn<'t, 'a>> {
    let mut suffixes: Vec<Suffix<'a>> = Vec::new();
    loop {
        match &ts.peek().kind {
            TokenKind::Punct('[') => {
                ts.next();
                let count = if matches!(&ts.peek().kind, TokenKind::Punct(']')) {
                    None
                } else {
                    let expr = eval::parse_assignment(ts, types, symbols)?;
                    let v = const_eval(symbols, &expr)?;
                    if v < 0 { return Err(Diagnostic::semantic(ts.peek().span, "array size must not be negative")) }
                    Some(v as u64)
                };
                expect_punct(ts, ']')?;
                suffixes.push(Suffix::Array(count));
            }
            TokenKind::Punct('(') => {
                ts.next();
                let params = parameter_list(ts, types, symbols)?;
                expect_punct(ts, ')')?;
                suffixes.push(Suffix::Function(params));
            }
            _ => break,
        }
    }
    let mut f: DeclFn<'t, 'a> = Box::new(|x| x);
    for s in suffixes.into_iter().rev() {
        let prev = f;
        f = match s {
            Suffix::Array(count) => Box::new(move |x| types.array(prev(x), count)),
            Suffix::Function(params) => Box::new(move |x| {
                let ft = types.new_function(prev(x));
                for p in params { types.add_member(ft, p); }
                ft
            }),
        };
    }
    Ok(f)
}

/// An initializer tree (spec.md §4.4): either a scalar expression or a
/// brace-enclosed list, recursively.
#[derive(Clone, Debug)]
pub enum Initializer<'a> {
    Scalar(Expr<'a>),
    List(Vec<Initializer<'a>>),
}

pub fn parse_initializer<'a>(
    ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>,
) -> diag::Result<Initializer<'a>> {
    if matches!(&ts.peek().kind, TokenKind::Punct('{')) {
        ts.next();
        let mut items = Vec::new();
        if !matches!(&ts.peek().kind, TokenKind::Punct('}')) {
            loop {
                items.push(parse_initializer(ts, types, symbols)?);
                if matches!(&ts.peek().kind, TokenKind::Punct(',')) {
                    ts.next();
                    if matches!(&ts.peek().kind, TokenKind::Punct('}')) { break }
                    continue;
                }
                break;
            }
        }
        expect_punct(ts, '}')?;
        Ok(Initializer::List(items))
    } else {
        Ok(Initializer::Scalar(eval::parse_assignment(ts, types, symbols)?))
    }
}

fn scalar_leaf_expr<'a>(init: &Initializer<'a>) -> diag::Result<Expr<'a>> {
    match init {
        Initializer::Scalar(e) => Ok(e.clone()),
        Initializer::List(items) if items.len() == 1 => scalar_leaf_expr(&items[0]),
        Initializer::List(_) => Err(Diagnostic::semantic(Span::default(), "braces around scalar initializer")),
    }
}

/// Zero-initialization (spec.md §4.4 "zero-initialization as recursive
/// plain assignments"): synthesize a same-shape initializer of all-zero
/// leaves, reused both for an aggregate's true zero-init and for trailing
/// members an explicit initializer list didn't cover.
fn zero_initializer<'a>(types: &Types<'a>, ty: Type<'a>) -> Initializer<'a> {
    match &types::unwrapped(ty).kind {
        TypeKind::Array { elem, count } => {
            let n = count.get().unwrap_or(0);
            Initializer::List((0..n).map(|_| zero_initializer(types, *elem)).collect())
        }
        TypeKind::Struct(m) => {
            let members: Vec<_> = m.borrow().members().to_vec();
            Initializer::List(members.iter().map(|mem| zero_initializer(types, mem.ty)).collect())
        }
        TypeKind::Union(m) => {
            let list = m.borrow();
            match list.members().first() {
                Some(first) => Initializer::List(vec![zero_initializer(types, first.ty)]),
                None => Initializer::List(vec![]),
            }
        }
        _ => Initializer::Scalar(Expr::IntLiteral(0, ty)),
    }
}

/// Apply an initializer to `target` (spec.md §4.4's initializer rules,
/// taken together). Aggregate cases recurse member-by-member / element-by-
/// element, filling any tail the initializer list didn't reach with
/// `zero_initializer`. `constant_only` enforces "file-scope (and static)
/// initializers must be constant expressions" by routing scalar leaves
/// through `const_eval` instead of emitting a `Store`; populating the
/// resulting bytes into an ELF data section is the ELF writer's concern,
/// not this parser's, so the folded value itself is discarded once its
/// constancy is confirmed.
pub fn assign_initializer<'a>(
    types: &Types<'a>, symbols: &mut SymbolTable<'a>, cfg: &mut Cfg<'_, 'a>, mut block: BlockId,
    target: Var<'a>, init: &Initializer<'a>, constant_only: bool,
) -> diag::Result<BlockId> {
    match &types::unwrapped(target.ty).kind {
        TypeKind::Array { elem, count } => {
            let elem = *elem;
            if let Initializer::Scalar(Expr::StringLiteral(_, str_ty)) = init {
                if types::is_integer(elem) && types::size_of(elem) == 1 {
                    if count.get().is_none() {
                        types.complete_array(target.ty, types::size_of(*str_ty));
                    }
                    return Ok(block);
                }
            }
            let items: &[Initializer<'a>] = match init {
                Initializer::List(items) => items.as_slice(),
                Initializer::Scalar(_) =>
                    return Err(Diagnostic::semantic(Span::default(), "array initializer must be a brace-enclosed list or a string literal")),
            };
            if count.get().is_none() {
                types.complete_array(target.ty, items.len() as u64);
            }
            let n = types::size_of(target.ty) / types::size_of(elem).max(1);
            if items.len() as u64 > n {
                return Err(Diagnostic::semantic(Span::default(), "excess elements in array initializer"));
            }
            let stride = types::size_of(elem) as i64;
            for i in 0..n {
                let elem_target = Var { ty: elem, offset: target.offset + (i as i64) * stride, ..target };
                block = match items.get(i as usize) {
                    Some(sub) => assign_initializer(types, symbols, cfg, block, elem_target, sub, constant_only)?,
                    None => assign_initializer(types, symbols, cfg, block, elem_target, &zero_initializer(types, elem), constant_only)?,
                };
            }
            Ok(block)
        }
        TypeKind::Struct(m) => {
            let members: Vec<_> = m.borrow().members().to_vec();
            let owned_single;
            let items: &[Initializer<'a>] = match init {
                Initializer::List(items) => items.as_slice(),
                Initializer::Scalar(_) => { owned_single = [init.clone()]; &owned_single }
            };
            if items.len() > members.len() {
                return Err(Diagnostic::semantic(Span::default(), "excess elements in struct initializer"));
            }
            for (i, member) in members.iter().enumerate() {
                let member_target = Var { ty: member.ty, offset: target.offset + member.offset as i64, ..target };
                block = match items.get(i) {
                    Some(sub) => assign_initializer(types, symbols, cfg, block, member_target, sub, constant_only)?,
                    None => assign_initializer(types, symbols, cfg, block, member_target, &zero_initializer(types, member.ty), constant_only)?,
                };
            }
            Ok(block)
        }
        TypeKind::Union(m) => {
            // Only the first member may be initialized (spec.md §4.4
            // "union-first-member-only"); if it is smaller than the union,
            // the whole union is zero-filled first (spec.md §4.4) by
            // recursing through a byte-array view of it, the same
            // recursive-assignment shape `zero_initializer` already uses
            // for array/struct trailing members.
            let first = { let list = m.borrow(); *list.members().first().expect("union has at least one member") };
            let union_size = types::size_of(target.ty);
            let first_size = types::size_of(first.ty);
            if first_size < union_size {
                let byte_ty = types.array(types.uchar, Some(union_size));
                let zero_target = Var { ty: byte_ty, offset: target.offset, ..target };
                block = assign_initializer(types, symbols, cfg, block, zero_target, &zero_initializer(types, byte_ty), constant_only)?;
            }
            let leaf = match init {
                Initializer::List(items) if items.len() > 1 =>
                    return Err(Diagnostic::semantic(Span::default(), "excess elements in union initializer")),
                Initializer::List(items) => items.first().cloned(),
                Initializer::Scalar(_) => Some(init.clone()),
            };
            let member_target = Var { ty: first.ty, offset: target.offset, ..target };
            match leaf {
                Some(sub) => assign_initializer(types, symbols, cfg, block, member_target, &sub, constant_only),
                None => Ok(block),
            }
        }
        _ => {
            let expr = scalar_leaf_expr(init)?;
            if constant_only {
                const_eval(symbols, &expr)?;
                Ok(block)
            } else {
                let assign_expr = Expr::Assign { target: Box::new(Expr::Place(target)), value: Box::new(expr) };
                let ev = eval::Evaluator::new(types);
                let result = ev.eval(symbols, cfg, block, &assign_expr);
                Ok(result.block)
            }
        }
    }
}

fn expect_punct(ts: &mut dyn TokenStream, c: char) -> diag::Result<()> {
    let tok = ts.next();
    if matches!(tok.kind, TokenKind::Punct(p) if p == c) { return Ok(()) }
    Err(Diagnostic::syntax(tok.span, format!("expected '{c}', found {:?}", tok.kind)))
}

fn expect_identifier(ts: &mut dyn TokenStream) -> diag::Result<Symbol> {
    let tok = ts.next();
    match tok.kind {
        TokenKind::Identifier(s) => Ok(s),
        other => Err(Diagnostic::syntax(tok.span, format!("expected an identifier, found {other:?}"))),
    }
}

/// A block-scope declaration (spec.md §4.5's compound statement grammar
/// allows declarations at the head of a block): shares every sub-parser
/// above with file scope, but initializers for non-`static` locals emit
/// real `Store` IR against the enclosing function's live `cfg`/`block`
/// rather than being constant-folded.
pub fn block_declaration<'a>(
    ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>,
    cfg: &mut Cfg<'_, 'a>, mut block: BlockId,
) -> diag::Result<BlockId> {
    let spec = declaration_specifiers(ts, types, symbols)?;
    if matches!(&ts.peek().kind, TokenKind::Punct(';')) {
        ts.next();
        return Ok(block);
    }
    loop {
        let (name, ty) = declarator(ts, types, spec.ty, symbols)?;
        let name = name.ok_or_else(|| Diagnostic::syntax(ts.peek().span, "expected a declarator name"))?;

        if spec.storage == Some(StorageClass::Typedef) {
            symbols.add_ident(name, SymbolKind::Typedef, Linkage::None, ty);
        } else {
            let linkage = if spec.storage == Some(StorageClass::Extern) { Linkage::Extern } else { Linkage::None };
            let sym = symbols.add_ident(name, SymbolKind::Definition, linkage, ty);
            if matches!(&ts.peek().kind, TokenKind::Punct('=')) {
                ts.next();
                let init = parse_initializer(ts, types, symbols)?;
                let constant_only = spec.storage == Some(StorageClass::Static);
                let target = Var::direct(ty, sym, true);
                block = assign_initializer(types, symbols, cfg, block, target, &init, constant_only)?;
            }
        }
        if matches!(&ts.peek().kind, TokenKind::Punct(',')) { ts.next(); continue }
        break;
    }
    expect_punct(ts, ';')?;
    Ok(block)
}

/// A file-scope declaration (spec.md §4.4 entry point): one or more
/// comma-separated declarators sharing a `declaration_specifiers`, each
/// either a plain object declaration (with an optional, constant-only
/// initializer validated against a scratch `Cfg` over the compilation's
/// sandbox definition) or — when a function-typed declarator is
/// immediately followed by `{` — a full function definition.
pub fn external_declaration<'a>(ts: &mut dyn TokenStream, comp: &mut Compilation<'a>) -> diag::Result<()> {
    let spec = declaration_specifiers(ts, &comp.types, &mut comp.symbols)?;
    if matches!(&ts.peek().kind, TokenKind::Punct(';')) {
        ts.next();
        return Ok(());
    }
    loop {
        let (name, ty) = declarator(ts, &comp.types, spec.ty, &mut comp.symbols)?;
        let name = name.ok_or_else(|| Diagnostic::syntax(ts.peek().span, "expected a declarator name"))?;

        if spec.storage == Some(StorageClass::Typedef) {
            comp.symbols.add_ident(name, SymbolKind::Typedef, Linkage::None, ty);
        } else if matches!(&types::unwrapped(ty).kind, TypeKind::Function { .. }) && matches!(&ts.peek().kind, TokenKind::Punct('{')) {
            return function_definition(ts, comp, name, ty);
        } else {
            let linkage = if spec.storage == Some(StorageClass::Static) { Linkage::Intern } else { Linkage::Extern };
            let sym = comp.symbols.add_ident(name, SymbolKind::Declaration, linkage, ty);
            if matches!(&ts.peek().kind, TokenKind::Punct('=')) {
                ts.next();
                let init = parse_initializer(ts, &comp.types, &mut comp.symbols)?;
                let target = Var::direct(ty, sym, true);
                let mut cfg = Cfg::new(&mut comp.sandbox);
                let block = cfg.new_block();
                assign_initializer(&comp.types, &mut comp.symbols, &mut cfg, block, target, &init, true)?;
            }
        }
        if matches!(&ts.peek().kind, TokenKind::Punct(',')) { ts.next(); continue }
        break;
    }
    expect_punct(ts, ';')?;
    Ok(())
}

/// A function definition's `{` and beyond (spec.md §4.4 "function
/// definitions"): pushes a scope, binds parameters and `__func__`, and
/// delegates the body to the statement parser.
fn function_definition<'a>(
    ts: &mut dyn TokenStream, comp: &mut Compilation<'a>, name: Symbol, func_ty: Type<'a>,
) -> diag::Result<()> {
    let func_sym = comp.symbols.add_ident(name, SymbolKind::Definition, Linkage::Extern, func_ty);
    comp.symbols.push_scope();

    let mut def = Definition::new(func_sym);
    let param_members: Vec<_> = match &types::unwrapped(func_ty).kind {
        TypeKind::Function { params, .. } => params.borrow().members().to_vec(),
        _ => unreachable!("function_definition called on a non-function type"),
    };
    for member in &param_members {
        let sym = comp.symbols.add_ident(member.name, SymbolKind::Definition, Linkage::None, member.ty);
        def.params.push(sym);
    }

    let func_name_bytes: Box<[u8]> = crate::symbol::with_str(name, |s| s.as_bytes().to_vec().into_boxed_slice());
    let func_name_ty = comp.types.array(comp.types.char_, Some(func_name_bytes.len() as u64 + 1));
    let func_name_sym = comp.symbols.add_ident(
        crate::symbol::intern(crate::symbol::FUNC_NAME), SymbolKind::StringValue, Linkage::Intern, func_name_ty,
    );
    comp.symbols.get_mut(func_name_sym).payload.string_value = Some(func_name_bytes);

    let ret_ty = match &types::unwrapped(func_ty).kind { TypeKind::Function { ret, .. } => *ret, _ => unreachable!() };
    let mut cfg = Cfg::new(&mut def);
    let entry = cfg.new_block();
    let fallthrough = crate::stmt::parse_compound(ts, &comp.types, &mut comp.symbols, &mut cfg, entry)?;
    if !cfg.is_terminated(fallthrough) {
        if matches!(&types::unwrapped(ret_ty).kind, TypeKind::Void) {
            cfg.terminate(fallthrough, Terminator::ReturnVoid);
        } else {
            cfg.terminate(fallthrough, Terminator::Return(Var::immediate(ret_ty, 0)));
        }
    }

    comp.symbols.pop_scope();
    comp.push_definition(def);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symtab::SymbolTable;
    use typed_arena::Arena;

    fn tokens(kinds: Vec<TokenKind>) -> crate::token::VecTokenStream {
        use crate::diag::Span;
        crate::token::VecTokenStream::new(
            kinds.into_iter().map(|kind| crate::token::Token { kind, span: Span::default() }).collect(),
        )
    }

    fn ident(s: &str) -> TokenKind { TokenKind::Identifier(crate::symbol::intern(s)) }
    fn keyword(s: &str) -> TokenKind { TokenKind::Keyword(crate::symbol::intern(s)) }

    #[test]
    fn declaration_specifiers_resolves_unsigned_long() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let mut ts = tokens(vec![keyword("unsigned"), keyword("long"), keyword("int")]);
        let spec = declaration_specifiers(&mut ts, &types, &mut tab).unwrap();
        assert!(types::type_equal(spec.ty, types.ulong));
        assert!(spec.storage.is_none());
    }

    #[test]
    fn declaration_specifiers_rejects_duplicate_storage_class() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let mut ts = tokens(vec![keyword("static"), keyword("extern"), keyword("int")]);
        assert!(declaration_specifiers(&mut ts, &types, &mut tab).is_err());
    }

    #[test]
    fn declarator_builds_array_of_pointer() {
        // int *a[3]
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let mut ts = tokens(vec![
            TokenKind::Punct('*'), ident("a"), TokenKind::Punct('['), TokenKind::Number(3), TokenKind::Punct(']'),
        ]);
        let (name, ty) = declarator(&mut ts, &types, types.int, &mut tab).unwrap();
        assert_eq!(name, Some(crate::symbol::intern("a")));
        match &ty.kind {
            TypeKind::Array { elem, count } => {
                assert_eq!(count.get(), Some(3));
                assert!(matches!(&elem.kind, TypeKind::Pointer(p) if types::type_equal(*p, types.int)));
            }
            other => panic!("expected an array type, got {other:?}"),
        }
    }

    #[test]
    fn declarator_builds_pointer_to_array() {
        // int (*a)[3]
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let mut ts = tokens(vec![
            TokenKind::Punct('('), TokenKind::Punct('*'), ident("a"), TokenKind::Punct(')'),
            TokenKind::Punct('['), TokenKind::Number(3), TokenKind::Punct(']'),
        ]);
        let (name, ty) = declarator(&mut ts, &types, types.int, &mut tab).unwrap();
        assert_eq!(name, Some(crate::symbol::intern("a")));
        match &ty.kind {
            TypeKind::Pointer(p) => {
                assert!(matches!(&p.kind, TypeKind::Array { count, .. } if count.get() == Some(3)));
            }
            other => panic!("expected a pointer type, got {other:?}"),
        }
    }

    #[test]
    fn struct_member_list_assigns_natural_offsets() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        // struct { int x; char y; }
        let mut ts = tokens(vec![
            TokenKind::Punct('{'),
            keyword("int"), ident("x"), TokenKind::Punct(';'),
            keyword("char"), ident("y"), TokenKind::Punct(';'),
            TokenKind::Punct('}'),
        ]);
        let ty = struct_or_union_declaration(&mut ts, &types, &mut tab, true).unwrap();
        assert_eq!(types::size_of(ty), 8);
        let member = types::get_member(ty, crate::symbol::intern("y")).unwrap();
        assert_eq!(member.offset, 4);
    }

    #[test]
    fn enum_declaration_assigns_sequential_and_overridden_values() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        // enum { A, B = 5, C }
        let mut ts = tokens(vec![
            TokenKind::Punct('{'),
            ident("A"), TokenKind::Punct(','),
            ident("B"), TokenKind::Punct('='), TokenKind::Number(5), TokenKind::Punct(','),
            ident("C"),
            TokenKind::Punct('}'),
        ]);
        enum_declaration(&mut ts, &types, &mut tab).unwrap();
        let a = tab.lookup_ident(crate::symbol::intern("A")).unwrap();
        let b = tab.lookup_ident(crate::symbol::intern("B")).unwrap();
        let c = tab.lookup_ident(crate::symbol::intern("C")).unwrap();
        assert_eq!(tab.get(a).payload.enum_value, Some(0));
        assert_eq!(tab.get(b).payload.enum_value, Some(5));
        assert_eq!(tab.get(c).payload.enum_value, Some(6));
    }

    #[test]
    fn parameter_list_treats_lone_void_as_empty() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let mut ts = tokens(vec![keyword("void"), TokenKind::Punct(')')]);
        let params = parameter_list(&mut ts, &types, &mut tab).unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn parameter_list_parses_variadic_tail() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        // int fmt, ...
        let mut ts = tokens(vec![
            keyword("int"), ident("fmt"), TokenKind::Punct(','), TokenKind::Dots, TokenKind::Punct(')'),
        ]);
        let params = parameter_list(&mut ts, &types, &mut tab).unwrap();
        assert_eq!(params.len(), 2);
        assert!(matches!(&params[1], Param::Ellipsis));
    }

    #[test]
    fn array_initializer_zero_fills_trailing_elements() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let f = tab.add_ident(crate::symbol::intern("f"), SymbolKind::Definition, Linkage::Extern, types.int);
        let arr_ty = types.array(types.int, Some(3));
        let a = tab.add_ident(crate::symbol::intern("a"), SymbolKind::Definition, Linkage::None, arr_ty);
        let mut def = Definition::new(f);
        let mut cfg = Cfg::new(&mut def);
        let b = cfg.new_block();
        let init = Initializer::List(vec![Initializer::Scalar(Expr::IntLiteral(1, types.int))]);
        let target = Var::direct(arr_ty, a, true);
        let result_block = assign_initializer(&types, &mut tab, &mut cfg, b, target, &init, false).unwrap();
        assert_eq!(result_block, b);
        // one Store per element (3), each preceded by a Convert only when types differ (they don't here)
        assert_eq!(def.block(b).ops().len(), 3);
    }

    #[test]
    fn file_scope_initializer_rejects_non_constant_expression() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let g = tab.add_ident(crate::symbol::intern("g"), SymbolKind::Declaration, Linkage::Extern, types.int);
        let x = tab.add_ident(crate::symbol::intern("x"), SymbolKind::Declaration, Linkage::Extern, types.int);
        let mut def = Definition::new(x);
        let mut cfg = Cfg::new(&mut def);
        let b = cfg.new_block();
        let init = Initializer::Scalar(Expr::Ident(g, types.int));
        let target = Var::direct(types.int, x, true);
        assert!(assign_initializer(&types, &mut tab, &mut cfg, b, target, &init, true).is_err());
    }

    #[test]
    fn declaration_specifiers_rejects_bare_struct_and_int_combination() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let mut ts = tokens(vec![
            keyword("struct"), TokenKind::Punct('{'),
            keyword("int"), ident("x"), TokenKind::Punct(';'),
            TokenKind::Punct('}'), keyword("int"),
        ]);
        assert!(declaration_specifiers(&mut ts, &types, &mut tab).is_err());
    }
}
