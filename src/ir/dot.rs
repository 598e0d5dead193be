//! Graphviz `dot` debug dump of a [`Definition`]'s CFG (spec.md §6
//! "dot debug dump", SPEC_FULL.md §16), in the same "pure formatting
//! function over an already-built structure" spirit as the teacher's
//! `write_elf`/`InstSink` being plain functions over a finished
//! `LinkedCode` rather than methods that mutate state as they print.

use std::fmt::Write as _;

use crate::idx::Idx;
use super::{Definition, Terminator};

/// Render `def`'s CFG as a `dot` graph: one labeled node per block, one
/// edge per terminator target. Call-site-supplied `name` becomes the
/// graph's title (normally the definition's symbol name).
#[must_use]
pub fn write_dot(name: &str, def: &Definition<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{name}\" {{");
    for (id, block) in def.blocks() {
        let _ = writeln!(out, "  b{} [label=\"b{} ({} op{})\"];",
            id.into_usize(), id.into_usize(), block.ops().len(),
            if block.ops().len() == 1 { "" } else { "s" });
    }
    for (id, block) in def.blocks() {
        match block.terminator() {
            Terminator::Jump(target) => {
                let _ = writeln!(out, "  b{} -> b{};", id.into_usize(), target.into_usize());
            }
            Terminator::Branch { then_blk, else_blk, .. } => {
                let _ = writeln!(out, "  b{} -> b{} [label=\"true\"];", id.into_usize(), then_blk.into_usize());
                let _ = writeln!(out, "  b{} -> b{} [label=\"false\"];", id.into_usize(), else_blk.into_usize());
            }
            Terminator::Return(_) | Terminator::ReturnVoid => {
                let _ = writeln!(out, "  b{} -> ret;", id.into_usize());
            }
        }
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Cfg, Var};
    use crate::symtab::{Linkage, SymbolKind, SymbolTable};
    use typed_arena::Arena;

    #[test]
    fn renders_one_node_per_block_and_branch_edges() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = crate::types::Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let f = tab.add_ident(crate::symbol::intern("f"), SymbolKind::Definition, Linkage::Extern, types.int);
        let mut def = Definition::new(f);
        let mut cfg = Cfg::new(&mut def);
        let entry = cfg.new_block();
        let then_blk = cfg.new_block();
        let else_blk = cfg.new_block();
        let cond = Var::immediate(types.int, 1);
        cfg.terminate(entry, Terminator::Branch { cond, then_blk, else_blk });
        cfg.terminate(then_blk, Terminator::ReturnVoid);
        cfg.terminate(else_blk, Terminator::ReturnVoid);
        let dot = write_dot("f", &def);
        assert!(dot.starts_with("digraph \"f\" {"));
        assert!(dot.contains("b0 -> b1 [label=\"true\"]"));
        assert!(dot.contains("b0 -> b2 [label=\"false\"]"));
        assert!(dot.contains("b1 -> ret;"));
    }
}
