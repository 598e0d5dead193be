//! Statement parser (spec.md §4.5): `if`/`while`/`do`/`for`/`switch`,
//! `break`/`continue`/`goto`/`return`, labeled and compound statements,
//! lowered directly into the `Cfg` built so far rather than into an
//! intermediate statement AST — the same posture `eval.rs` takes for
//! expressions (spec.md §4.3, Design Note §9).
//!
//! `break`/`continue` targets are tracked as a pair of stacks, one push per
//! enclosing loop or `switch`; `goto` targets are tracked as a map from
//! label name to the block created for it, lazily on first mention by
//! either a `goto` or the label itself. Both are scoped to the whole
//! function body, not to the innermost block — C89 labels live in a
//! function-wide namespace — so a single [`Ctx`] is created once by
//! [`parse_compound`] and threaded through every nested statement.

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::diag::{self, Diagnostic, Span};
use crate::eval::{self, Evaluator, Expr};
use crate::ir::{BlockId, Cfg, Opcode, Operation, Terminator, Var};
use crate::symbol::Symbol;
use crate::symtab::{SymbolKind, SymbolTable};
use crate::token::{TokenKind, TokenStream};
use crate::types::{self, TypeKind, Types};

fn kw(s: &str) -> Symbol { crate::symbol::intern(s) }

struct Ctx {
    break_targets: SmallVec<[BlockId; 4]>,
    continue_targets: SmallVec<[BlockId; 4]>,
    labels: HashMap<Symbol, BlockId>,
}

impl Ctx {
    fn new() -> Self {
        Ctx { break_targets: SmallVec::new(), continue_targets: SmallVec::new(), labels: HashMap::new() }
    }
}

/// Entry point for a function body (spec.md §4.5): consumes the opening
/// `{` itself and returns the fallthrough block, matching the contract
/// `decl.rs::function_definition` already assumes.
pub fn parse_compound<'a>(
    ts: &mut dyn TokenStream,
    types: &Types<'a>,
    symbols: &mut SymbolTable<'a>,
    cfg: &mut Cfg<'_, 'a>,
    block: BlockId,
) -> diag::Result<BlockId> {
    let mut ctx = Ctx::new();
    compound_statement(ts, types, symbols, cfg, &mut ctx, block)
}

fn compound_statement<'a>(
    ts: &mut dyn TokenStream,
    types: &Types<'a>,
    symbols: &mut SymbolTable<'a>,
    cfg: &mut Cfg<'_, 'a>,
    ctx: &mut Ctx,
    mut block: BlockId,
) -> diag::Result<BlockId> {
    expect_punct(ts, '{')?;
    symbols.push_scope();
    while !matches!(&ts.peek().kind, TokenKind::Punct('}')) {
        if starts_declaration(ts, symbols) {
            block = crate::decl::block_declaration(ts, types, symbols, cfg, block)?;
        } else {
            block = statement(ts, types, symbols, cfg, ctx, block)?;
        }
    }
    expect_punct(ts, '}')?;
    symbols.pop_scope();
    Ok(block)
}

fn starts_declaration<'a>(ts: &mut dyn TokenStream, symbols: &SymbolTable<'a>) -> bool {
    match &ts.peek().kind {
        TokenKind::Keyword(s) => {
            let s = *s;
            s == kw("void") || s == kw("char") || s == kw("short") || s == kw("int") || s == kw("long")
                || s == kw("float") || s == kw("double") || s == kw("signed") || s == kw("unsigned")
                || s == kw("const") || s == kw("volatile") || s == kw("typedef") || s == kw("extern")
                || s == kw("static") || s == kw("auto") || s == kw("register")
                || s == kw("struct") || s == kw("union") || s == kw("enum")
        }
        TokenKind::Identifier(name) => {
            matches!(symbols.lookup_ident(*name), Some(sym) if symbols.get(sym).kind == SymbolKind::Typedef)
        }
        _ => false,
    }
}

fn statement<'a>(
    ts: &mut dyn TokenStream,
    types: &Types<'a>,
    symbols: &mut SymbolTable<'a>,
    cfg: &mut Cfg<'_, 'a>,
    ctx: &mut Ctx,
    block: BlockId,
) -> diag::Result<BlockId> {
    match &ts.peek().kind {
        TokenKind::Punct('{') => compound_statement(ts, types, symbols, cfg, ctx, block),
        TokenKind::Punct(';') => { ts.next(); Ok(block) }
        TokenKind::Keyword(s) if *s == kw("if") => if_statement(ts, types, symbols, cfg, ctx, block),
        TokenKind::Keyword(s) if *s == kw("while") => while_statement(ts, types, symbols, cfg, ctx, block),
        TokenKind::Keyword(s) if *s == kw("do") => do_while_statement(ts, types, symbols, cfg, ctx, block),
        TokenKind::Keyword(s) if *s == kw("for") => for_statement(ts, types, symbols, cfg, ctx, block),
        TokenKind::Keyword(s) if *s == kw("switch") => switch_statement(ts, types, symbols, cfg, ctx, block),
        TokenKind::Keyword(s) if *s == kw("break") => break_statement(ts, cfg, ctx, block),
        TokenKind::Keyword(s) if *s == kw("continue") => continue_statement(ts, cfg, ctx, block),
        TokenKind::Keyword(s) if *s == kw("goto") => goto_statement(ts, cfg, ctx, block),
        TokenKind::Keyword(s) if *s == kw("return") => return_statement(ts, types, symbols, cfg, block),
        TokenKind::Identifier(name) => {
            let name = *name;
            let span = ts.peek().span;
            ts.next();
            if matches!(&ts.peek().kind, TokenKind::Punct(':')) {
                ts.next();
                let target = *ctx.labels.entry(name).or_insert_with(|| cfg.new_block());
                if !cfg.is_terminated(block) {
                    cfg.terminate(block, Terminator::Jump(target));
                }
                return statement(ts, types, symbols, cfg, ctx, target);
            }
            let expr = ident_expression_statement(ts, types, symbols, name, span)?;
            expect_punct(ts, ';')?;
            let ev = Evaluator::new(types);
            let r = ev.eval(symbols, cfg, block, &expr);
            Ok(r.block)
        }
        _ => {
            if starts_declaration(ts, symbols) {
                return Err(Diagnostic::syntax(ts.peek().span, "a declaration is not allowed here; expected a statement"));
            }
            expression_statement(ts, types, symbols, cfg, block)
        }
    }
}

/// Resumes expression parsing from an identifier already consumed while
/// disambiguating a labeled statement from an expression statement — the
/// token stream contract has no two-token lookahead, so the identifier has
/// to be taken before we know whether a `:` follows. Mirrors the relevant
/// cases of `eval::parse_postfix`/`parse_assignment`'s top level rather
/// than reusing them, since those start by consuming their own leading
/// token.
fn ident_expression_statement<'a>(
    ts: &mut dyn TokenStream,
    types: &Types<'a>,
    symbols: &mut SymbolTable<'a>,
    name: Symbol,
    span: Span,
) -> diag::Result<Expr<'a>> {
    let sym = symbols.lookup_ident(name).ok_or_else(|| {
        Diagnostic::semantic(span, format!("use of undeclared identifier '{}'", crate::symbol::with_str(name, str::to_owned)))
    })?;
    let ty = symbols.get(sym).ty;
    let mut expr = Expr::Ident(sym, ty);
    loop {
        match &ts.peek().kind {
            TokenKind::Punct('[') => {
                ts.next();
                let index = eval::parse_assignment(ts, types, symbols)?;
                expect_punct(ts, ']')?;
                expr = Expr::Index { base: Box::new(expr), index: Box::new(index) };
            }
            TokenKind::Punct('(') => {
                let (func, ret) = match &expr {
                    Expr::Ident(sym, _) => {
                        let ret = match &types::unwrapped(symbols.get(*sym).ty).kind {
                            TypeKind::Function { ret, .. } => *ret,
                            _ => return Err(Diagnostic::semantic(span, "call of a non-function identifier")),
                        };
                        (*sym, ret)
                    }
                    _ => return Err(Diagnostic::semantic(span, "only direct calls through a named function are supported")),
                };
                ts.next();
                let mut args = Vec::new();
                if !matches!(&ts.peek().kind, TokenKind::Punct(')')) {
                    loop {
                        args.push(eval::parse_assignment(ts, types, symbols)?);
                        if matches!(&ts.peek().kind, TokenKind::Punct(',')) { ts.next(); } else { break }
                    }
                }
                expect_punct(ts, ')')?;
                expr = Expr::Call { func, ret, args };
            }
            TokenKind::Punct('.') => {
                ts.next();
                let member = expect_identifier(ts)?;
                expr = Expr::Member { base: Box::new(expr), name: member, arrow: false };
            }
            TokenKind::Op("->") => {
                ts.next();
                let member = expect_identifier(ts)?;
                expr = Expr::Member { base: Box::new(expr), name: member, arrow: true };
            }
            _ => break,
        }
    }
    if matches!(&ts.peek().kind, TokenKind::Punct('=')) {
        ts.next();
        let rhs = eval::parse_assignment(ts, types, symbols)?;
        return Ok(Expr::Assign { target: Box::new(expr), value: Box::new(rhs) });
    }
    if let Some(op) = eval::compound_assign_op(&ts.peek().kind) {
        ts.next();
        let rhs = eval::parse_assignment(ts, types, symbols)?;
        let combined = Expr::Binary { op, lhs: Box::new(expr.clone()), rhs: Box::new(rhs) };
        return Ok(Expr::Assign { target: Box::new(expr), value: Box::new(combined) });
    }
    Ok(expr)
}

fn expression_statement<'a>(
    ts: &mut dyn TokenStream,
    types: &Types<'a>,
    symbols: &mut SymbolTable<'a>,
    cfg: &mut Cfg<'_, 'a>,
    block: BlockId,
) -> diag::Result<BlockId> {
    let expr = eval::parse_assignment(ts, types, symbols)?;
    expect_punct(ts, ';')?;
    let ev = Evaluator::new(types);
    let r = ev.eval(symbols, cfg, block, &expr);
    Ok(r.block)
}

fn if_statement<'a>(
    ts: &mut dyn TokenStream,
    types: &Types<'a>,
    symbols: &mut SymbolTable<'a>,
    cfg: &mut Cfg<'_, 'a>,
    ctx: &mut Ctx,
    block: BlockId,
) -> diag::Result<BlockId> {
    ts.next();
    expect_punct(ts, '(')?;
    let cond_expr = eval::parse_assignment(ts, types, symbols)?;
    expect_punct(ts, ')')?;
    let ev = Evaluator::new(types);
    let c = ev.eval(symbols, cfg, block, &cond_expr);
    let cond_var = ev.rvalue(symbols, cfg, c.block, c.value);
    let then_blk = cfg.new_block();
    let else_blk = cfg.new_block();
    let merge = cfg.new_block();
    cfg.terminate(c.block, Terminator::Branch { cond: cond_var, then_blk, else_blk });

    let then_end = statement(ts, types, symbols, cfg, ctx, then_blk)?;
    if !cfg.is_terminated(then_end) {
        cfg.terminate(then_end, Terminator::Jump(merge));
    }

    if matches!(&ts.peek().kind, TokenKind::Keyword(s) if *s == kw("else")) {
        ts.next();
        let else_end = statement(ts, types, symbols, cfg, ctx, else_blk)?;
        if !cfg.is_terminated(else_end) {
            cfg.terminate(else_end, Terminator::Jump(merge));
        }
    } else {
        cfg.terminate(else_blk, Terminator::Jump(merge));
    }
    Ok(merge)
}

fn while_statement<'a>(
    ts: &mut dyn TokenStream,
    types: &Types<'a>,
    symbols: &mut SymbolTable<'a>,
    cfg: &mut Cfg<'_, 'a>,
    ctx: &mut Ctx,
    block: BlockId,
) -> diag::Result<BlockId> {
    ts.next();
    expect_punct(ts, '(')?;
    let header = cfg.new_block();
    cfg.terminate(block, Terminator::Jump(header));
    let cond_expr = eval::parse_assignment(ts, types, symbols)?;
    expect_punct(ts, ')')?;
    let ev = Evaluator::new(types);
    let c = ev.eval(symbols, cfg, header, &cond_expr);
    let cond_var = ev.rvalue(symbols, cfg, c.block, c.value);
    let body = cfg.new_block();
    let after = cfg.new_block();
    cfg.terminate(c.block, Terminator::Branch { cond: cond_var, then_blk: body, else_blk: after });

    ctx.break_targets.push(after);
    ctx.continue_targets.push(header);
    let body_end = statement(ts, types, symbols, cfg, ctx, body)?;
    ctx.break_targets.pop();
    ctx.continue_targets.pop();
    if !cfg.is_terminated(body_end) {
        cfg.terminate(body_end, Terminator::Jump(header));
    }
    Ok(after)
}

fn do_while_statement<'a>(
    ts: &mut dyn TokenStream,
    types: &Types<'a>,
    symbols: &mut SymbolTable<'a>,
    cfg: &mut Cfg<'_, 'a>,
    ctx: &mut Ctx,
    block: BlockId,
) -> diag::Result<BlockId> {
    ts.next();
    let body = cfg.new_block();
    cfg.terminate(block, Terminator::Jump(body));
    let header = cfg.new_block();
    let after = cfg.new_block();

    ctx.break_targets.push(after);
    ctx.continue_targets.push(header);
    let body_end = statement(ts, types, symbols, cfg, ctx, body)?;
    ctx.break_targets.pop();
    ctx.continue_targets.pop();
    if !cfg.is_terminated(body_end) {
        cfg.terminate(body_end, Terminator::Jump(header));
    }

    if !matches!(&ts.peek().kind, TokenKind::Keyword(s) if *s == kw("while")) {
        return Err(Diagnostic::syntax(ts.peek().span, "expected 'while' after 'do' statement body"));
    }
    ts.next();
    expect_punct(ts, '(')?;
    let cond_expr = eval::parse_assignment(ts, types, symbols)?;
    expect_punct(ts, ')')?;
    expect_punct(ts, ';')?;
    let ev = Evaluator::new(types);
    let c = ev.eval(symbols, cfg, header, &cond_expr);
    let cond_var = ev.rvalue(symbols, cfg, c.block, c.value);
    cfg.terminate(c.block, Terminator::Branch { cond: cond_var, then_blk: body, else_blk: after });
    Ok(after)
}

fn for_statement<'a>(
    ts: &mut dyn TokenStream,
    types: &Types<'a>,
    symbols: &mut SymbolTable<'a>,
    cfg: &mut Cfg<'_, 'a>,
    ctx: &mut Ctx,
    mut block: BlockId,
) -> diag::Result<BlockId> {
    ts.next();
    expect_punct(ts, '(')?;
    if !matches!(&ts.peek().kind, TokenKind::Punct(';')) {
        let init_expr = eval::parse_assignment(ts, types, symbols)?;
        let ev = Evaluator::new(types);
        let r = ev.eval(symbols, cfg, block, &init_expr);
        block = r.block;
    }
    expect_punct(ts, ';')?;

    let header = cfg.new_block();
    cfg.terminate(block, Terminator::Jump(header));
    let body = cfg.new_block();
    let after = cfg.new_block();

    if !matches!(&ts.peek().kind, TokenKind::Punct(';')) {
        let cond_expr = eval::parse_assignment(ts, types, symbols)?;
        let ev = Evaluator::new(types);
        let c = ev.eval(symbols, cfg, header, &cond_expr);
        let cond_var = ev.rvalue(symbols, cfg, c.block, c.value);
        cfg.terminate(c.block, Terminator::Branch { cond: cond_var, then_blk: body, else_blk: after });
    } else {
        cfg.terminate(header, Terminator::Jump(body));
    }
    expect_punct(ts, ';')?;

    let post_start = cfg.new_block();
    if !matches!(&ts.peek().kind, TokenKind::Punct(')')) {
        let post_expr = eval::parse_assignment(ts, types, symbols)?;
        let ev = Evaluator::new(types);
        let r = ev.eval(symbols, cfg, post_start, &post_expr);
        cfg.terminate(r.block, Terminator::Jump(header));
    } else {
        cfg.terminate(post_start, Terminator::Jump(header));
    }
    expect_punct(ts, ')')?;

    ctx.break_targets.push(after);
    ctx.continue_targets.push(post_start);
    let body_end = statement(ts, types, symbols, cfg, ctx, body)?;
    ctx.break_targets.pop();
    ctx.continue_targets.pop();
    if !cfg.is_terminated(body_end) {
        cfg.terminate(body_end, Terminator::Jump(post_start));
    }
    Ok(after)
}

/// `switch` (spec.md §4.5) lowers to a linear chain of equality tests
/// against the switch value, built only after the whole body has been
/// scanned for `case`/`default` labels — no jump table, per the Non-goal
/// on dense dispatch. `case`/`default` are handled exactly like a labeled
/// statement (splice a Jump from whatever block preceded them), with the
/// label's value recorded alongside its block for the dispatch chain.
fn switch_statement<'a>(
    ts: &mut dyn TokenStream,
    types: &Types<'a>,
    symbols: &mut SymbolTable<'a>,
    cfg: &mut Cfg<'_, 'a>,
    ctx: &mut Ctx,
    block: BlockId,
) -> diag::Result<BlockId> {
    ts.next();
    expect_punct(ts, '(')?;
    let switch_expr = eval::parse_assignment(ts, types, symbols)?;
    expect_punct(ts, ')')?;
    let ev = Evaluator::new(types);
    let s = ev.eval(symbols, cfg, block, &switch_expr);
    let tmp = ev.rvalue(symbols, cfg, s.block, s.value);

    let after = cfg.new_block();
    ctx.break_targets.push(after);
    let body_start = cfg.new_block();
    let mut cases: Vec<(Option<i64>, BlockId)> = Vec::new();
    let body_end = switch_body(ts, types, symbols, cfg, ctx, body_start, &mut cases)?;
    ctx.break_targets.pop();
    if !cfg.is_terminated(body_end) {
        cfg.terminate(body_end, Terminator::Jump(after));
    }

    let default_blk = cases.iter().find(|(v, _)| v.is_none()).map(|&(_, b)| b).unwrap_or(after);
    let mut dispatch = s.block;
    for &(value, target) in &cases {
        let Some(value) = value else { continue };
        let next = cfg.new_block();
        let eq_sym = symbols.create_tmp(types.int);
        let eq = Var::direct(types.int, eq_sym, false);
        cfg.push_op(dispatch, Operation { target: eq, opcode: Opcode::Eq, lhs: tmp, rhs: Some(Var::immediate(tmp.ty, value)) });
        cfg.terminate(dispatch, Terminator::Branch { cond: eq, then_blk: target, else_blk: next });
        dispatch = next;
    }
    cfg.terminate(dispatch, Terminator::Jump(default_blk));
    Ok(after)
}

fn switch_body<'a>(
    ts: &mut dyn TokenStream,
    types: &Types<'a>,
    symbols: &mut SymbolTable<'a>,
    cfg: &mut Cfg<'_, 'a>,
    ctx: &mut Ctx,
    mut block: BlockId,
    cases: &mut Vec<(Option<i64>, BlockId)>,
) -> diag::Result<BlockId> {
    expect_punct(ts, '{')?;
    symbols.push_scope();
    while !matches!(&ts.peek().kind, TokenKind::Punct('}')) {
        let kind = ts.peek().kind.clone();
        match &kind {
            TokenKind::Keyword(s) if *s == kw("case") => {
                ts.next();
                let expr = eval::parse_assignment(ts, types, symbols)?;
                let value = crate::decl::const_eval(symbols, &expr)?;
                expect_punct(ts, ':')?;
                let case_blk = cfg.new_block();
                if !cfg.is_terminated(block) {
                    cfg.terminate(block, Terminator::Jump(case_blk));
                }
                cases.push((Some(value), case_blk));
                block = case_blk;
            }
            TokenKind::Keyword(s) if *s == kw("default") => {
                ts.next();
                expect_punct(ts, ':')?;
                let case_blk = cfg.new_block();
                if !cfg.is_terminated(block) {
                    cfg.terminate(block, Terminator::Jump(case_blk));
                }
                cases.push((None, case_blk));
                block = case_blk;
            }
            _ if starts_declaration(ts, symbols) => {
                block = crate::decl::block_declaration(ts, types, symbols, cfg, block)?;
            }
            _ => {
                block = statement(ts, types, symbols, cfg, ctx, block)?;
            }
        }
    }
    expect_punct(ts, '}')?;
    symbols.pop_scope();
    Ok(block)
}

fn break_statement<'a>(ts: &mut dyn TokenStream, cfg: &mut Cfg<'_, 'a>, ctx: &mut Ctx, block: BlockId) -> diag::Result<BlockId> {
    let span = ts.peek().span;
    ts.next();
    expect_punct(ts, ';')?;
    let target = *ctx.break_targets.last().ok_or_else(|| Diagnostic::semantic(span, "'break' outside a loop or switch"))?;
    if !cfg.is_terminated(block) {
        cfg.terminate(block, Terminator::Jump(target));
    }
    Ok(cfg.new_block())
}

fn continue_statement<'a>(ts: &mut dyn TokenStream, cfg: &mut Cfg<'_, 'a>, ctx: &mut Ctx, block: BlockId) -> diag::Result<BlockId> {
    let span = ts.peek().span;
    ts.next();
    expect_punct(ts, ';')?;
    let target = *ctx.continue_targets.last().ok_or_else(|| Diagnostic::semantic(span, "'continue' outside a loop"))?;
    if !cfg.is_terminated(block) {
        cfg.terminate(block, Terminator::Jump(target));
    }
    Ok(cfg.new_block())
}

fn goto_statement<'a>(ts: &mut dyn TokenStream, cfg: &mut Cfg<'_, 'a>, ctx: &mut Ctx, block: BlockId) -> diag::Result<BlockId> {
    ts.next();
    let name = expect_identifier(ts)?;
    expect_punct(ts, ';')?;
    let target = *ctx.labels.entry(name).or_insert_with(|| cfg.new_block());
    if !cfg.is_terminated(block) {
        cfg.terminate(block, Terminator::Jump(target));
    }
    Ok(cfg.new_block())
}

fn return_statement<'a>(
    ts: &mut dyn TokenStream,
    types: &Types<'a>,
    symbols: &mut SymbolTable<'a>,
    cfg: &mut Cfg<'_, 'a>,
    block: BlockId,
) -> diag::Result<BlockId> {
    ts.next();
    if matches!(&ts.peek().kind, TokenKind::Punct(';')) {
        ts.next();
        cfg.terminate(block, Terminator::ReturnVoid);
    } else {
        let expr = eval::parse_assignment(ts, types, symbols)?;
        expect_punct(ts, ';')?;
        let ev = Evaluator::new(types);
        let r = ev.eval(symbols, cfg, block, &expr);
        let v = ev.rvalue(symbols, cfg, r.block, r.value);
        cfg.terminate(r.block, Terminator::Return(v));
    }
    Ok(cfg.new_block())
}

fn expect_punct(ts: &mut dyn TokenStream, c: char) -> diag::Result<()> {
    let tok = ts.next();
    if matches!(tok.kind, TokenKind::Punct(p) if p == c) {
        return Ok(());
    }
    Err(Diagnostic::syntax(tok.span, format!("expected '{c}', found {:?}", tok.kind)))
}

fn expect_identifier(ts: &mut dyn TokenStream) -> diag::Result<Symbol> {
    let tok = ts.next();
    match tok.kind {
        TokenKind::Identifier(s) => Ok(s),
        other => Err(Diagnostic::syntax(tok.span, format!("expected an identifier, found {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Cfg, Definition};
    use crate::symtab::{Linkage, SymbolKind};
    use crate::token::VecTokenStream;

    fn tokens(kinds: Vec<TokenKind>) -> VecTokenStream {
        VecTokenStream::new(kinds.into_iter().map(|kind| crate::token::Token { kind, span: Span::default() }).collect())
    }

    fn ident(s: &str) -> TokenKind { TokenKind::Identifier(crate::symbol::intern(s)) }
    fn keyword(s: &str) -> TokenKind { TokenKind::Keyword(crate::symbol::intern(s)) }

    #[test]
    fn if_else_both_branches_merge_into_one_block() {
        let arena: &'static typed_arena::Arena<_> = Box::leak(Box::new(typed_arena::Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut symbols = SymbolTable::new();
        let x = symbols.add_ident(crate::symbol::intern("x"), SymbolKind::Definition, Linkage::None, types.int);
        let mut def = Definition::new(symbols.create_tmp(types.void));
        let mut cfg = Cfg::new(&mut def);
        let entry = cfg.new_block();
        let _ = x;

        let mut ts = tokens(vec![
            keyword("if"), TokenKind::Punct('('), ident("x"), TokenKind::Punct(')'),
            ident("x"), TokenKind::Punct('='), TokenKind::Number(1), TokenKind::Punct(';'),
            keyword("else"),
            ident("x"), TokenKind::Punct('='), TokenKind::Number(2), TokenKind::Punct(';'),
        ]);
        let mut ctx = Ctx::new();
        let merge = if_statement(&mut ts, &types, &mut symbols, &mut cfg, &mut ctx, entry).unwrap();
        assert!(!cfg.is_terminated(merge));
        assert!(cfg.is_terminated(entry));
    }

    #[test]
    fn while_loop_wires_break_and_continue_targets() {
        let arena: &'static typed_arena::Arena<_> = Box::leak(Box::new(typed_arena::Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut symbols = SymbolTable::new();
        symbols.add_ident(crate::symbol::intern("x"), SymbolKind::Definition, Linkage::None, types.int);
        let mut def = Definition::new(symbols.create_tmp(types.void));
        let mut cfg = Cfg::new(&mut def);
        let entry = cfg.new_block();

        let mut ts = tokens(vec![
            keyword("while"), TokenKind::Punct('('), ident("x"), TokenKind::Punct(')'),
            TokenKind::Punct('{'),
            keyword("if"), TokenKind::Punct('('), ident("x"), TokenKind::Punct(')'),
            keyword("break"), TokenKind::Punct(';'),
            keyword("continue"), TokenKind::Punct(';'),
            TokenKind::Punct('}'),
        ]);
        let mut ctx = Ctx::new();
        let after = while_statement(&mut ts, &types, &mut symbols, &mut cfg, &mut ctx, entry).unwrap();
        assert!(ctx.break_targets.is_empty());
        assert!(ctx.continue_targets.is_empty());
        assert!(!cfg.is_terminated(after));
    }

    #[test]
    fn for_loop_without_clauses_forms_an_infinite_back_edge() {
        let arena: &'static typed_arena::Arena<_> = Box::leak(Box::new(typed_arena::Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut symbols = SymbolTable::new();
        let mut def = Definition::new(symbols.create_tmp(types.void));
        let mut cfg = Cfg::new(&mut def);
        let entry = cfg.new_block();

        let mut ts = tokens(vec![
            keyword("for"), TokenKind::Punct('('), TokenKind::Punct(';'), TokenKind::Punct(';'), TokenKind::Punct(')'),
            keyword("break"), TokenKind::Punct(';'),
        ]);
        let mut ctx = Ctx::new();
        let after = for_statement(&mut ts, &types, &mut symbols, &mut cfg, &mut ctx, entry).unwrap();
        assert!(!cfg.is_terminated(after));
    }

    #[test]
    fn switch_dispatches_on_case_values_with_a_default_fallback() {
        let arena: &'static typed_arena::Arena<_> = Box::leak(Box::new(typed_arena::Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut symbols = SymbolTable::new();
        symbols.add_ident(crate::symbol::intern("x"), SymbolKind::Definition, Linkage::None, types.int);
        let mut def = Definition::new(symbols.create_tmp(types.void));
        let mut cfg = Cfg::new(&mut def);
        let entry = cfg.new_block();

        let mut ts = tokens(vec![
            keyword("switch"), TokenKind::Punct('('), ident("x"), TokenKind::Punct(')'),
            TokenKind::Punct('{'),
            keyword("case"), TokenKind::Number(1), TokenKind::Punct(':'),
            keyword("break"), TokenKind::Punct(';'),
            keyword("default"), TokenKind::Punct(':'),
            keyword("break"), TokenKind::Punct(';'),
            TokenKind::Punct('}'),
        ]);
        let mut ctx = Ctx::new();
        let after = switch_statement(&mut ts, &types, &mut symbols, &mut cfg, &mut ctx, entry).unwrap();
        assert!(!cfg.is_terminated(after));
        assert!(cfg.is_terminated(entry));
    }

    #[test]
    fn forward_goto_resolves_to_a_later_label() {
        let arena: &'static typed_arena::Arena<_> = Box::leak(Box::new(typed_arena::Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut symbols = SymbolTable::new();
        let mut def = Definition::new(symbols.create_tmp(types.void));
        let mut cfg = Cfg::new(&mut def);
        let entry = cfg.new_block();

        let mut ts = tokens(vec![
            TokenKind::Punct('{'),
            keyword("goto"), ident("done"), TokenKind::Punct(';'),
            ident("done"), TokenKind::Punct(':'),
            keyword("return"), TokenKind::Punct(';'),
            TokenKind::Punct('}'),
        ]);
        let end = parse_compound(&mut ts, &types, &mut symbols, &mut cfg, entry).unwrap();
        assert!(cfg.is_terminated(entry));
        assert!(cfg.is_terminated(end) || end != entry);
    }

    #[test]
    fn return_statement_terminates_with_the_given_value() {
        let arena: &'static typed_arena::Arena<_> = Box::leak(Box::new(typed_arena::Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut symbols = SymbolTable::new();
        let mut def = Definition::new(symbols.create_tmp(types.void));
        let mut cfg = Cfg::new(&mut def);
        let entry = cfg.new_block();

        let mut ts = tokens(vec![keyword("return"), TokenKind::Number(7), TokenKind::Punct(';')]);
        return_statement(&mut ts, &types, &mut symbols, &mut cfg, entry).unwrap();
        assert!(matches!(def.block(entry).terminator(), Terminator::Return(_)));
    }

    #[test]
    fn break_outside_a_loop_is_a_semantic_error() {
        let arena: &'static typed_arena::Arena<_> = Box::leak(Box::new(typed_arena::Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut symbols = SymbolTable::new();
        let mut def = Definition::new(symbols.create_tmp(types.void));
        let mut cfg = Cfg::new(&mut def);
        let entry = cfg.new_block();
        let mut ctx = Ctx::new();

        let mut ts = tokens(vec![keyword("break"), TokenKind::Punct(';')]);
        assert!(break_statement(&mut ts, &mut cfg, &mut ctx, entry).is_err());
    }

    #[test]
    fn expression_statement_starting_with_an_identifier_assigns() {
        let arena: &'static typed_arena::Arena<_> = Box::leak(Box::new(typed_arena::Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut symbols = SymbolTable::new();
        symbols.add_ident(crate::symbol::intern("x"), SymbolKind::Definition, Linkage::None, types.int);
        let mut def = Definition::new(symbols.create_tmp(types.void));
        let mut cfg = Cfg::new(&mut def);
        let entry = cfg.new_block();
        let mut ctx = Ctx::new();

        let mut ts = tokens(vec![ident("x"), TokenKind::Punct('='), TokenKind::Number(5), TokenKind::Punct(';')]);
        let next = statement(&mut ts, &types, &mut symbols, &mut cfg, &mut ctx, entry).unwrap();
        assert_eq!(next, entry);
        assert_eq!(def.block(entry).ops().len(), 1);
    }
}
