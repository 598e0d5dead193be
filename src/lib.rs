//! A self-hosting C89 compiler core: a type system, a scoped symbol
//! table, a typed three-address IR organized as a per-function CFG, a
//! System-V AMD64 ABI classifier, and a direct-to-ELF x86-64 instruction
//! encoder. The lexer/preprocessor, the dot-graph viewer's consumer, and
//! the command-line driver sit outside this crate's core and are wired
//! together in `src/bin/mmccc.rs`.

pub mod abi;
pub mod codegen;
pub mod decl;
pub mod diag;
pub mod elf;
pub mod encode;
pub mod eval;
pub mod idx;
pub mod ir;
pub mod stmt;
pub mod symbol;
pub mod symtab;
pub mod token;
pub mod types;

use typed_arena::Arena;

use crate::idx::Idx;
use crate::ir::{DefId, Definition};
use crate::symtab::SymbolTable;
use crate::types::{TypeNode, Types};

/// The explicit compilation context threaded through the parser modules
/// (Design Note §9 "Global parser state", resolved in SPEC_FULL.md's Open
/// Questions: no single static `defs` buffer, no fallback owner). Owns the
/// type/member-list arenas, the symbol table, the buffered definitions
/// list, and a dedicated sandbox definition used for constant evaluation
/// that happens outside any function body (e.g. `enum { A = 1 << k };`
/// when `k` is itself a constant expression).
pub struct Compilation<'a> {
    pub types: Types<'a>,
    pub symbols: SymbolTable<'a>,
    defs: idx::IdxVec<DefId, Definition<'a>>,
    /// Next definition to hand to the driver's `parse()` loop.
    next_to_emit: usize,
    pub sandbox: Definition<'a>,
}

impl<'a> Compilation<'a> {
    #[must_use]
    pub fn new(type_arena: &'a Arena<TypeNode<'a>>, bump: &'a bumpalo::Bump) -> Self {
        let types = Types::new(type_arena, bump);
        let mut symbols = SymbolTable::new();
        let sandbox_sym = symbols.create_tmp(types.void);
        Compilation {
            types, symbols,
            defs: idx::IdxVec::new(),
            next_to_emit: 0,
            sandbox: Definition::new(sandbox_sym),
        }
    }

    /// Buffer a finished top-level definition (spec.md §5: "the
    /// definitions buffer is append-only").
    pub fn push_definition(&mut self, def: Definition<'a>) -> DefId { self.defs.push(def) }

    /// `parse()`'s consumer side (spec.md §2 "Control flow"): hand back
    /// the next buffered definition, in order, or `None` once the buffer
    /// is drained.
    pub fn take_next(&mut self) -> Option<&Definition<'a>> {
        if self.next_to_emit >= self.defs.len() { return None }
        let id = DefId::from_usize(self.next_to_emit);
        self.next_to_emit += 1;
        Some(&self.defs[id])
    }

    #[must_use] pub fn definitions(&self) -> impl Iterator<Item = &Definition<'a>> { self.defs.iter() }

    /// Walk every buffered definition, handing the back-end `symbols` and
    /// `types` alongside each one. A plain `for def in comp.definitions()`
    /// loop cannot also reach `comp.symbols` mutably (codegen needs to mint
    /// fresh label symbols) since the iterator borrows all of `self`; this
    /// splits the borrow across `defs` and `symbols` the way `take_next`'s
    /// caller would have to do by hand otherwise.
    pub fn for_each_definition(&mut self, mut f: impl FnMut(&mut SymbolTable<'a>, &Types<'a>, &Definition<'a>)) {
        for def in self.defs.iter() {
            f(&mut self.symbols, &self.types, def);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symtab::{Linkage, SymbolKind};

    #[test]
    fn definitions_drain_in_push_order() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let mut comp = Compilation::new(arena, bump);
        let f = comp.symbols.add_ident(crate::symbol::intern("f"), SymbolKind::Definition, Linkage::Extern, comp.types.int);
        let g = comp.symbols.add_ident(crate::symbol::intern("g"), SymbolKind::Definition, Linkage::Extern, comp.types.int);
        comp.push_definition(Definition::new(f));
        comp.push_definition(Definition::new(g));
        assert_eq!(comp.take_next().unwrap().symbol, f);
        assert_eq!(comp.take_next().unwrap().symbol, g);
        assert!(comp.take_next().is_none());
    }
}
