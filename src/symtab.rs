//! Scoped symbol table (spec.md §3 "Symbol", §4.2).
//!
//! Two disjoint namespaces — identifiers and tags — each a stack of
//! scopes. The scoping shape mirrors the teacher's per-generation variable
//! maps in `build_mir.rs` (`GenMap { dominator, value, cache }`,
//! `cur_gen`/`gen_vars`): there, a tree of "generations" tracks which
//! bindings are visible at a point in the CFG; here, a flat depth-indexed
//! stack of scopes does the same job for plain lexical C scoping.

use hashbrown::HashMap;
use crate::idx::{mk_idx, IdxVec};
use crate::symbol::Symbol;
use crate::types::Type;

mk_idx! {
    /// Stable identity for a [`Symbol`] binding; IR operands and type tags
    /// reference symbols by this id rather than by name so that shadowing
    /// and renaming never invalidate a previously captured reference
    /// (spec.md §3: "a pointer that remains stable for the symbol's
    /// lifetime").
    pub struct SymbolId;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SymbolKind {
    Declaration,
    Tentative,
    Definition,
    Typedef,
    StringValue,
    EnumConstant,
    Label,
    Temporary,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Linkage {
    None,
    Intern,
    Extern,
}

/// Extra payload carried by some symbol kinds (spec.md §3: "payloads for
/// string constants, enum values, and `__func__`").
#[derive(Clone, Debug, Default)]
pub struct SymbolPayload {
    pub string_value: Option<Box<[u8]>>,
    pub enum_value: Option<i64>,
}

pub struct SymbolData<'a> {
    pub name: Symbol,
    pub kind: SymbolKind,
    pub linkage: Linkage,
    pub depth: u32,
    pub ty: Type<'a>,
    pub payload: SymbolPayload,
}

/// One namespace's scope stack (spec.md §4.2: "Each namespace is a stack
/// of scopes").
struct Namespace {
    scopes: Vec<HashMap<Symbol, SymbolId>>,
}

impl Namespace {
    fn new() -> Self { Namespace { scopes: vec![HashMap::new()] } }
    fn push(&mut self) { self.scopes.push(HashMap::new()) }
    fn pop(&mut self) { assert!(self.scopes.len() > 1, "cannot pop the file scope"); self.scopes.pop(); }
    fn depth(&self) -> u32 { u32::try_from(self.scopes.len() - 1).expect("scope depth overflow") }
    fn insert(&mut self, name: Symbol, id: SymbolId) {
        self.scopes.last_mut().expect("at least one scope").insert(name, id);
    }
    fn lookup(&self, name: Symbol) -> Option<SymbolId> {
        self.scopes.iter().rev().find_map(|s| s.get(&name).copied())
    }
}

/// The two-namespace symbol table (spec.md §4.2).
pub struct SymbolTable<'a> {
    symbols: IdxVec<SymbolId, SymbolData<'a>>,
    identifiers: Namespace,
    tags: Namespace,
    tmp_counter: u32,
    label_counter: u32,
}

impl<'a> Default for SymbolTable<'a> {
    fn default() -> Self { Self::new() }
}

impl<'a> SymbolTable<'a> {
    #[must_use]
    pub fn new() -> Self {
        SymbolTable {
            symbols: IdxVec::new(),
            identifiers: Namespace::new(),
            tags: Namespace::new(),
            tmp_counter: 0,
            label_counter: 0,
        }
    }

    #[must_use] pub fn depth(&self) -> u32 { self.identifiers.depth() }

    /// `push_scope` (spec.md §4.2), applied to both namespaces together:
    /// C89 scoping always opens/closes identifier and tag scope in lockstep
    /// (a block `{ }` or a function parameter list).
    pub fn push_scope(&mut self) {
        self.identifiers.push();
        self.tags.push();
        log::trace!("push_scope: depth {}", self.identifiers.depth());
    }

    /// `pop_scope` (spec.md §4.2): discards all bindings opened since the
    /// matching `push_scope`. The table keeps dead `SymbolData` around
    /// (arena-style: anyone still holding a `SymbolId`, e.g. IR operands
    /// referencing a local that has since gone out of scope at the AST
    /// level, can still resolve it), only the name->id lookup entry dies.
    pub fn pop_scope(&mut self) {
        self.identifiers.pop();
        self.tags.pop();
        log::trace!("pop_scope: depth {}", self.identifiers.depth());
    }

    /// `sym_add` into the identifier namespace at the current scope.
    pub fn add_ident(&mut self, name: Symbol, kind: SymbolKind, linkage: Linkage, ty: Type<'a>) -> SymbolId {
        let depth = self.identifiers.depth();
        let id = self.symbols.push(SymbolData { name, kind, linkage, depth, ty, payload: SymbolPayload::default() });
        self.identifiers.insert(name, id);
        id
    }

    /// `sym_add` into the tag namespace (struct/union/enum tag names).
    pub fn add_tag(&mut self, name: Symbol, ty: Type<'a>) -> SymbolId {
        let depth = self.tags.depth();
        let id = self.symbols.push(SymbolData {
            name, kind: SymbolKind::Declaration, linkage: Linkage::None, depth, ty,
            payload: SymbolPayload::default(),
        });
        self.tags.insert(name, id);
        id
    }

    /// `sym_lookup` (spec.md §4.2): most recent binding by name across all
    /// live scopes.
    #[must_use] pub fn lookup_ident(&self, name: Symbol) -> Option<SymbolId> { self.identifiers.lookup(name) }
    #[must_use] pub fn lookup_tag(&self, name: Symbol) -> Option<SymbolId> { self.tags.lookup(name) }

    #[must_use] pub fn get(&self, id: SymbolId) -> &SymbolData<'a> { &self.symbols[id] }
    pub fn get_mut(&mut self, id: SymbolId) -> &mut SymbolData<'a> { &mut self.symbols[id] }

    /// `sym_create_tmp` (spec.md §4.2): an anonymous compiler-generated
    /// temporary, never reachable by name lookup.
    pub fn create_tmp(&mut self, ty: Type<'a>) -> SymbolId {
        self.tmp_counter += 1;
        let name = crate::symbol::intern(&format!(".T{}", self.tmp_counter));
        let depth = self.identifiers.depth();
        self.symbols.push(SymbolData {
            name, kind: SymbolKind::Temporary, linkage: Linkage::None, depth, ty,
            payload: SymbolPayload::default(),
        })
    }

    /// A string-literal constant (spec.md §3: "payloads for string
    /// constants"). Each occurrence in the token stream gets its own
    /// symbol — literals are values, not bindings, so there is nothing to
    /// deduplicate against by name.
    pub fn create_string_literal(&mut self, ty: Type<'a>, bytes: Box<[u8]>) -> SymbolId {
        let name = crate::symbol::intern(".str");
        let depth = self.identifiers.depth();
        self.symbols.push(SymbolData {
            name, kind: SymbolKind::StringValue, linkage: Linkage::Intern, depth, ty,
            payload: SymbolPayload { string_value: Some(bytes), enum_value: None },
        })
    }

    /// Every string-literal (and `__func__`) constant registered so far
    /// (spec.md §8 scenario 3), paired with its byte payload, in the order
    /// they were created. Used to place their bytes into `.data` ahead of
    /// codegen.
    pub fn string_literals(&self) -> impl Iterator<Item = (SymbolId, &[u8])> + use<'_, 'a> {
        self.symbols.enumerate().filter_map(|(id, data)| {
            if data.kind != SymbolKind::StringValue { return None }
            data.payload.string_value.as_deref().map(|bytes| (id, bytes))
        })
    }

    /// `sym_create_label` (spec.md §4.2): a fresh block label, also never
    /// reachable by name lookup (labels live in their own C namespace that
    /// this simplified symbol table does not model positionally, since the
    /// statement parser resolves `goto` targets through its own label map
    /// — see `src/stmt.rs`).
    pub fn create_label(&mut self, void: Type<'a>) -> SymbolId {
        self.label_counter += 1;
        let name = crate::symbol::intern(&format!(".L{}", self.label_counter));
        let depth = self.identifiers.depth();
        self.symbols.push(SymbolData {
            name, kind: SymbolKind::Label, linkage: Linkage::None, depth, ty: void,
            payload: SymbolPayload::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use typed_arena::Arena;

    #[test]
    fn lookup_finds_most_recent_shadowing_binding() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = crate::types::Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let x = crate::symbol::intern("x");
        let outer = tab.add_ident(x, SymbolKind::Definition, Linkage::None, types.int);
        tab.push_scope();
        let inner = tab.add_ident(x, SymbolKind::Definition, Linkage::None, types.char_);
        assert_eq!(tab.lookup_ident(x), Some(inner));
        tab.pop_scope();
        assert_eq!(tab.lookup_ident(x), Some(outer));
    }

    #[test]
    fn identifiers_and_tags_are_disjoint_namespaces() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = crate::types::Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let p = crate::symbol::intern("P");
        let s = types.new_struct();
        tab.add_tag(p, s);
        tab.add_ident(p, SymbolKind::Definition, Linkage::None, types.int);
        assert!(tab.lookup_tag(p).is_some());
        assert!(tab.lookup_ident(p).is_some());
        assert_ne!(tab.lookup_tag(p), tab.lookup_ident(p));
    }

    #[test]
    fn temporaries_and_labels_are_not_name_lookupable() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = crate::types::Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let t1 = tab.create_tmp(types.int);
        let t2 = tab.create_tmp(types.int);
        assert_ne!(t1, t2);
        let l1 = tab.create_label(types.void);
        assert_eq!(tab.get(l1).kind, SymbolKind::Label);
    }
}
