//! The System-V AMD64 ABI classifier (spec.md §4.6).
//!
//! The teacher crate performs no ABI classification of its own (its ISA is
//! stack-machine-flavored MIR lowered by a later pass not in the retrieved
//! pack), so this module's *algorithm* is grounded directly in spec.md
//! §4.6's merge rules. Its *enum/newtype shape* — a `Class` plus a
//! small merge operator folding a per-eightbyte class vector — follows the
//! idiom visible in `rustc_target::abi`
//! (`examples/other_examples/343bbef9_...abi-mod.rs.rs`,
//! `83a8375c_...abi-mod.rs.rs`): small `Copy` enums combined by an
//! explicit, total merge function rather than ad hoc integer flags.

use smallvec::SmallVec;

use crate::types::{self, Type, TypeKind};

/// One eight-byte's ABI class (spec.md §4.6, GLOSSARY).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Class {
    NoClass,
    Integer,
    Sse,
    Memory,
}

impl Class {
    /// The merge operator from spec.md §4.6: `NO_CLASS⊕X = X`,
    /// `MEMORY⊕X = MEMORY`, `INTEGER⊕X = INTEGER`, `SSE⊕SSE = SSE`.
    #[must_use]
    fn merge(self, other: Class) -> Class {
        match (self, other) {
            (Class::NoClass, x) | (x, Class::NoClass) => x,
            (Class::Memory, _) | (_, Class::Memory) => Class::Memory,
            (Class::Integer, _) | (_, Class::Integer) => Class::Integer,
            (Class::Sse, Class::Sse) => Class::Sse,
        }
    }
}

/// Up to four eight-bytes before an aggregate collapses to `[MEMORY]`.
pub type ClassVec = SmallVec<[Class; 4]>;

/// `classify(t)` (spec.md §4.6).
#[must_use]
pub fn classify<'a>(t: Type<'a>) -> ClassVec {
    let t = types::unwrapped(t);
    match &t.kind {
        TypeKind::Int { .. } | TypeKind::Pointer(_) => SmallVec::from_slice(&[Class::Integer]),
        TypeKind::Real { .. } => SmallVec::from_slice(&[Class::Sse]),
        TypeKind::Struct(_) | TypeKind::Union(_) | TypeKind::Array { .. } => classify_aggregate(t),
        TypeKind::Void | TypeKind::Function { .. } | TypeKind::Tagged { .. } =>
            unreachable!("void/function/tagged types are never classified directly"),
    }
}

fn classify_aggregate<'a>(t: Type<'a>) -> ClassVec {
    let size = types::size_of(t);
    let eightbytes = usize::try_from(size.div_ceil(8)).expect("type too large to classify");
    if eightbytes == 0 || eightbytes > 4 || has_unnatural_offset(t, 0) {
        return SmallVec::from_slice(&[Class::Memory]);
    }
    let mut slots = SmallVec::from_elem(Class::NoClass, eightbytes);
    flatten(t, 0, &mut slots);
    if slots.iter().any(|&c| c == Class::Memory) {
        return SmallVec::from_slice(&[Class::Memory]);
    }
    slots
}

/// spec.md §4.6: "aggregates ... with any member at an unnatural offset ->
/// MEMORY". The declaration parser's own layout (`Types::add_member`)
/// always produces naturally aligned offsets, so this only ever fires on
/// a hand-built type that violates that invariant — defensive, not load
/// bearing in the normal parse path.
fn has_unnatural_offset<'a>(t: Type<'a>, base: u64) -> bool {
    match &types::unwrapped(t).kind {
        TypeKind::Struct(m) | TypeKind::Union(m) => m.borrow().members().iter().any(|member| {
            let off = base + member.offset;
            off % types::type_alignment(member.ty) != 0 || has_unnatural_offset(member.ty, off)
        }),
        TypeKind::Array { elem, .. } => {
            let stride = types::size_of(*elem);
            let count = types::size_of(t) / stride.max(1);
            (0..count).any(|i| has_unnatural_offset(*elem, base + i * stride))
        }
        _ => false,
    }
}

fn flatten<'a>(t: Type<'a>, base: u64, slots: &mut [Class]) {
    match &types::unwrapped(t).kind {
        TypeKind::Int { .. } | TypeKind::Pointer(_) => merge_slot(slots, base, Class::Integer),
        TypeKind::Real { .. } => merge_slot(slots, base, Class::Sse),
        TypeKind::Array { elem, .. } => {
            let stride = types::size_of(*elem);
            let count = if stride == 0 { 0 } else { types::size_of(t) / stride };
            for i in 0..count { flatten(*elem, base + i * stride, slots) }
        }
        TypeKind::Struct(m) | TypeKind::Union(m) => {
            for member in m.borrow().members() { flatten(member.ty, base + member.offset, slots) }
        }
        TypeKind::Void | TypeKind::Function { .. } | TypeKind::Tagged { .. } => unreachable!("unwrapped"),
    }
}

fn merge_slot(slots: &mut [Class], base: u64, class: Class) {
    let i = usize::try_from(base / 8).expect("offset too large");
    slots[i] = slots[i].merge(class);
}

/// The integer registers this core ever assigns, argument and return
/// positions alike (they name the same physical register either way —
/// `DX` is both the third argument register and the second return
/// eightbyte).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reg { Ax, Di, Si, Dx, Cx, R8, R9 }

const INT_ARG_REGS: [Reg; 6] = [Reg::Di, Reg::Si, Reg::Dx, Reg::Cx, Reg::R8, Reg::R9];
const INT_RET_REGS: [Reg; 2] = [Reg::Ax, Reg::Dx];

/// Where one argument (or the return value) ends up (spec.md §4.6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    /// One integer register per consumed eight-byte, in order.
    Integer(SmallVec<[Reg; 2]>),
    /// One SSE register (`XMM0`-`XMM7` for arguments, `XMM0`/`XMM1` for the
    /// return value); this core does not lower float codegen (non-goal),
    /// so this variant only records the classification.
    Sse(u8),
    /// Spilled entirely to the stack.
    Memory,
}

/// `classify_call`'s result: the return location plus one location per
/// argument, in argument order.
#[derive(Debug)]
pub struct CallClassification {
    pub ret: Option<Location>,
    /// Set when the return is `[MEMORY]`: a hidden pointer argument is
    /// reserved in `DI` before any real argument is assigned.
    pub hidden_return_pointer: bool,
    pub args: Vec<Location>,
}

/// `classify_call(args, ret, n, res)` (spec.md §4.6). `ret = None` models a
/// `void` return.
#[must_use]
pub fn classify_call<'a>(args: &[Type<'a>], ret: Option<Type<'a>>) -> CallClassification {
    let ret_classes = ret.map(classify);
    let hidden_return_pointer = matches!(ret_classes.as_deref(), Some([Class::Memory]));
    let ret_loc = ret_classes.map(|classes| locate(&classes, &INT_RET_REGS, &mut 0));

    let mut next_int = usize::from(hidden_return_pointer); // DI reserved for the hidden pointer
    let mut next_sse = 0u8;
    let mut arg_locs = Vec::with_capacity(args.len());
    for &arg in args {
        let classes = classify(arg);
        let loc = locate_args(&classes, &mut next_int, &mut next_sse);
        arg_locs.push(loc);
    }

    CallClassification { ret: ret_loc, hidden_return_pointer, args: arg_locs }
}

/// Assign registers to one already-classified value out of a fixed
/// register list starting at `*cursor` (used for the return value, which
/// always starts at `AX`/`XMM0` regardless of argument consumption).
fn locate(classes: &[Class], int_regs: &[Reg], cursor: &mut u8) -> Location {
    if classes == [Class::Memory] { return Location::Memory }
    let int_slots = classes.iter().filter(|&&c| c == Class::Integer).count();
    if int_slots > 0 {
        return Location::Integer(int_regs.iter().take(int_slots).copied().collect());
    }
    let reg = *cursor;
    *cursor += 1;
    Location::Sse(reg)
}

/// Assign registers to one argument, consuming from the shared argument
/// register pools. Per spec.md §4.6, an argument that cannot fit entirely
/// in the remaining integer registers spills wholly to memory rather than
/// partially filling registers.
fn locate_args(classes: &[Class], next_int: &mut usize, next_sse: &mut u8) -> Location {
    if classes == [Class::Memory] { return Location::Memory }
    let int_slots = classes.iter().filter(|&&c| c == Class::Integer).count();
    if int_slots > 0 {
        if *next_int + int_slots > INT_ARG_REGS.len() { return Location::Memory }
        let taken: SmallVec<[Reg; 2]> = INT_ARG_REGS[*next_int..*next_int + int_slots].to_vec().into();
        *next_int += int_slots;
        return Location::Integer(taken);
    }
    let reg = *next_sse;
    *next_sse += 1;
    Location::Sse(reg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Param, Types};
    use typed_arena::Arena;

    #[test]
    fn scalars_classify_directly() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        assert_eq!(classify(types.int).as_slice(), [Class::Integer]);
        assert_eq!(classify(types.pointer(types.int)).as_slice(), [Class::Integer]);
        assert_eq!(classify(types.double).as_slice(), [Class::Sse]);
    }

    #[test]
    fn small_struct_of_two_ints_is_one_integer_eightbyte() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let s = types.new_struct();
        let x = crate::symbol::intern("x");
        let y = crate::symbol::intern("y");
        types.add_member(s, Param::Named(x, types.int));
        types.add_member(s, Param::Named(y, types.int));
        let classes = classify(s);
        assert_eq!(classes.as_slice(), [Class::Integer]);
    }

    #[test]
    fn struct_over_four_eightbytes_is_memory() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let s = types.new_struct();
        for i in 0..5 {
            let name = crate::symbol::intern(&format!("f{i}"));
            types.add_member(s, Param::Named(name, types.long));
        }
        assert_eq!(classify(s).as_slice(), [Class::Memory]);
    }

    #[test]
    fn class_vector_length_matches_spec_invariant() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let s = types.new_struct();
        let a = crate::symbol::intern("a");
        let b = crate::symbol::intern("b");
        let c = crate::symbol::intern("c");
        types.add_member(s, Param::Named(a, types.long));
        types.add_member(s, Param::Named(b, types.long));
        types.add_member(s, Param::Named(c, types.int));
        let classes = classify(s);
        let expected = types::size_of(s).div_ceil(8);
        assert_eq!(classes.len() as u64, expected);
    }

    #[test]
    fn two_int_params_classify_into_di_and_si() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let call = classify_call(&[types.int, types.int], Some(types.int));
        assert_eq!(call.args[0], Location::Integer(SmallVec::from_slice(&[Reg::Di])));
        assert_eq!(call.args[1], Location::Integer(SmallVec::from_slice(&[Reg::Si])));
        assert!(!call.hidden_return_pointer);
    }

    #[test]
    fn memory_return_reserves_di_for_hidden_pointer() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let s = types.new_struct();
        for i in 0..5 {
            let name = crate::symbol::intern(&format!("g{i}"));
            types.add_member(s, Param::Named(name, types.long));
        }
        let call = classify_call(&[types.int], Some(s));
        assert!(call.hidden_return_pointer);
        assert_eq!(call.args[0], Location::Integer(SmallVec::from_slice(&[Reg::Si])));
    }
}
