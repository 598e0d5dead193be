//! The type system (spec.md §3 "Type node", "Member list", and §4.1).
//!
//! Nodes are allocated out of a `typed_arena::Arena`, the pattern spec.md's
//! Design Note §9 calls for ("Arenas vs per-node ownership") and which the
//! teacher crate already depends on (`typed-arena = "2.0"`). Per-node
//! mutable state (`size`, a struct/union's growing member list) lives
//! behind `Cell`/`RefCell` so that `&'a TypeNode<'a>` references handed out
//! by earlier `type_add_member` calls stay valid while later calls mutate
//! the same node in place — the arena gives address stability, the cells
//! give the interior mutability a growable node needs. Member lists
//! themselves are `bumpalo::collections::Vec`s drawn from a `Bump` with
//! the same arena lifetime, matching the teacher's other arena dependency
//! (`bumpalo`).

use std::cell::{Cell, RefCell};
use bitflags::bitflags;
use typed_arena::Arena;
use crate::symbol::Symbol;

bitflags! {
    /// `qualifier` bitset from spec.md §3.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Qualifier: u8 {
        const CONST    = 0b01;
        const VOLATILE = 0b10;
    }
}

/// A single `{name, type, offset}` entry from spec.md §3 "Member list".
#[derive(Clone, Copy, Debug)]
pub struct Member<'a> {
    pub name: Symbol,
    pub ty: Type<'a>,
    /// Byte offset within the owning struct (always 0 for union members,
    /// and unused — left at 0 — for function parameters).
    pub offset: u64,
}

/// An ordered member list: struct/union fields in declaration order, or a
/// function's parameters in parameter order, with a distinguished
/// "ellipsis" tail flag standing in for the source's sentinel-name trick
/// (spec.md §4.1: "a name equal to the ellipsis sentinel sets the
/// variadic flag").
#[derive(Debug)]
pub struct MemberList<'a> {
    members: bumpalo::collections::Vec<'a, Member<'a>>,
    variadic: bool,
    /// Running max alignment among inserted members, used to round up a
    /// struct's final size (spec.md §3 invariant (d)) without rescanning.
    max_align: u64,
}

impl<'a> MemberList<'a> {
    fn new_in(bump: &'a bumpalo::Bump) -> Self {
        MemberList { members: bumpalo::collections::Vec::new_in(bump), variadic: false, max_align: 1 }
    }

    #[must_use] pub fn members(&self) -> &[Member<'a>] { &self.members }
    #[must_use] pub fn is_variadic(&self) -> bool { self.variadic }
    #[must_use] pub fn get(&self, name: Symbol) -> Option<&Member<'a>> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// One parameter in a `parameter_list` (spec.md §4.4), distinguishing a
/// named parameter from a trailing `...`.
pub enum Param<'a> {
    Named(Symbol, Type<'a>),
    Ellipsis,
}

#[derive(Debug)]
pub enum TypeKind<'a> {
    Void,
    Int { signed: bool, size: u8 },
    Real { size: u8 },
    Pointer(Type<'a>),
    Array { elem: Type<'a>, count: Cell<Option<u64>> },
    Struct(RefCell<MemberList<'a>>),
    Union(RefCell<MemberList<'a>>),
    Function { ret: Type<'a>, params: RefCell<MemberList<'a>> },
    /// A non-owning alias of a struct/union definition (spec.md §3
    /// invariant (a), §4.1 `type_tagged_copy`). Qualifiers attach to the
    /// tagged node, never mutating the node it aliases.
    Tagged { name: Symbol, def: Type<'a> },
}

#[derive(Debug)]
pub struct TypeNode<'a> {
    pub kind: TypeKind<'a>,
    size: Cell<u64>,
    qualifier: Cell<Qualifier>,
}

/// A type reference: stable for the lifetime of the owning [`Types`] arena.
pub type Type<'a> = &'a TypeNode<'a>;

pub struct Types<'a> {
    arena: &'a Arena<TypeNode<'a>>,
    bump: &'a bumpalo::Bump,
    pub void: Type<'a>,
    pub char_: Type<'a>,
    pub schar: Type<'a>,
    pub uchar: Type<'a>,
    pub short: Type<'a>,
    pub ushort: Type<'a>,
    pub int: Type<'a>,
    pub uint: Type<'a>,
    pub long: Type<'a>,
    pub ulong: Type<'a>,
    pub longlong: Type<'a>,
    pub ulonglong: Type<'a>,
    pub float: Type<'a>,
    pub double: Type<'a>,
}

impl<'a> Types<'a> {
    /// Build the C89 basic types in a fresh `Types` context. The caller
    /// owns `arena` and `bump` (typically as local variables in `main`, a
    /// test, or a `Compilation`) and lends them here, the standard
    /// `typed_arena` usage pattern: the arena must outlive every `Type<'a>`
    /// handed out, so it cannot itself live inside the struct that hands
    /// those references out.
    #[must_use]
    pub fn new(arena: &'a Arena<TypeNode<'a>>, bump: &'a bumpalo::Bump) -> Self {
        macro_rules! alloc {
            ($k:expr) => {
                arena.alloc(TypeNode { kind: $k, size: Cell::new(0), qualifier: Cell::new(Qualifier::empty()) })
            };
        }
        let void = alloc!(TypeKind::Void);
        let char_ = alloc!(TypeKind::Int { signed: true, size: 1 });
        char_.size.set(1);
        let schar = alloc!(TypeKind::Int { signed: true, size: 1 });
        schar.size.set(1);
        let uchar = alloc!(TypeKind::Int { signed: false, size: 1 });
        uchar.size.set(1);
        let short = alloc!(TypeKind::Int { signed: true, size: 2 });
        short.size.set(2);
        let ushort = alloc!(TypeKind::Int { signed: false, size: 2 });
        ushort.size.set(2);
        let int = alloc!(TypeKind::Int { signed: true, size: 4 });
        int.size.set(4);
        let uint = alloc!(TypeKind::Int { signed: false, size: 4 });
        uint.size.set(4);
        let long = alloc!(TypeKind::Int { signed: true, size: 8 });
        long.size.set(8);
        let ulong = alloc!(TypeKind::Int { signed: false, size: 8 });
        ulong.size.set(8);
        let longlong = alloc!(TypeKind::Int { signed: true, size: 8 });
        longlong.size.set(8);
        let ulonglong = alloc!(TypeKind::Int { signed: false, size: 8 });
        ulonglong.size.set(8);
        let float = alloc!(TypeKind::Real { size: 4 });
        float.size.set(4);
        let double = alloc!(TypeKind::Real { size: 8 });
        double.size.set(8);
        Types {
            arena, bump, void, char_, schar, uchar, short, ushort, int, uint,
            long, ulong, longlong, ulonglong, float, double,
        }
    }

    /// `type_init` (spec.md §4.1) for a fresh pointer type.
    pub fn pointer(&self, pointee: Type<'a>) -> Type<'a> {
        let t = self.arena.alloc(TypeNode {
            kind: TypeKind::Pointer(pointee),
            size: Cell::new(8),
            qualifier: Cell::new(Qualifier::empty()),
        });
        t
    }

    /// `type_init` for an array; `count = None` means an incomplete array
    /// (spec.md §3 invariant (c)).
    pub fn array(&self, elem: Type<'a>, count: Option<u64>) -> Type<'a> {
        let size = count.map_or(0, |n| size_of(elem) * n);
        self.arena.alloc(TypeNode {
            kind: TypeKind::Array { elem, count: Cell::new(count) },
            size: Cell::new(size),
            qualifier: Cell::new(Qualifier::empty()),
        })
    }

    /// Write back a completed array size, per spec.md §4.4's "Array with
    /// incomplete size" and "String literal initializing an incomplete
    /// array" rules. Panics (kind-3 invariant violation) if `t` is not an
    /// incomplete array.
    pub fn complete_array(&self, t: Type<'a>, count: u64) {
        match &t.kind {
            TypeKind::Array { elem, count: c } => {
                assert!(c.get().is_none(), "array already complete");
                c.set(Some(count));
                t.size.set(size_of(elem) * count);
            }
            _ => panic!("complete_array on non-array type"),
        }
    }

    /// `type_init` for a fresh, empty struct; members are added with
    /// [`Types::add_member`].
    pub fn new_struct(&self) -> Type<'a> {
        self.arena.alloc(TypeNode {
            kind: TypeKind::Struct(RefCell::new(MemberList::new_in(self.bump))),
            size: Cell::new(0),
            qualifier: Cell::new(Qualifier::empty()),
        })
    }

    pub fn new_union(&self) -> Type<'a> {
        self.arena.alloc(TypeNode {
            kind: TypeKind::Union(RefCell::new(MemberList::new_in(self.bump))),
            size: Cell::new(0),
            qualifier: Cell::new(Qualifier::empty()),
        })
    }

    pub fn new_function(&self, ret: Type<'a>) -> Type<'a> {
        self.arena.alloc(TypeNode {
            kind: TypeKind::Function { ret, params: RefCell::new(MemberList::new_in(self.bump)) },
            size: Cell::new(0),
            qualifier: Cell::new(Qualifier::empty()),
        })
    }

    /// `type_tagged_copy` (spec.md §4.1): a lightweight alias so qualifiers
    /// on one use-site never mutate the defining struct/union.
    pub fn tagged_copy(&self, def: Type<'a>, name: Symbol) -> Type<'a> {
        debug_assert!(matches!(def.kind, TypeKind::Struct(_) | TypeKind::Union(_)),
            "tagged_copy requires a struct/union definition");
        self.arena.alloc(TypeNode {
            kind: TypeKind::Tagged { name, def },
            size: Cell::new(0),
            qualifier: Cell::new(Qualifier::empty()),
        })
    }

    pub fn with_qualifier(&self, t: Type<'a>, q: Qualifier) -> Type<'a> {
        if t.qualifier.get() == q { return t }
        let n = self.arena.alloc(TypeNode {
            kind: clone_kind_shallow(t),
            size: Cell::new(t.size.get()),
            qualifier: Cell::new(q),
        });
        n
    }

    /// `type_add_member` (spec.md §4.1). `param` distinguishes a named
    /// member/parameter from a trailing `...`.
    pub fn add_member(&self, t: Type<'a>, param: Param<'a>) {
        match &t.kind {
            TypeKind::Function { params, .. } => {
                let mut list = params.borrow_mut();
                match param {
                    Param::Ellipsis => list.variadic = true,
                    Param::Named(name, ty) => {
                        // array parameters decay to pointer-to-element on insertion
                        let ty = match &ty.kind {
                            TypeKind::Array { elem, .. } => self.pointer(*elem),
                            _ => ty,
                        };
                        list.members.push(Member { name, ty, offset: 0 });
                    }
                }
            }
            TypeKind::Struct(members) => {
                let Param::Named(name, ty) = param else {
                    panic!("ellipsis is not valid in a struct member list")
                };
                let mut list = members.borrow_mut();
                let align = type_alignment(ty);
                let cur = t.size.get();
                let offset = align_to(cur, align);
                list.members.push(Member { name, ty, offset });
                list.max_align = list.max_align.max(align);
                let new_size = offset + size_of(ty);
                t.size.set(align_to(new_size, list.max_align));
            }
            TypeKind::Union(members) => {
                let Param::Named(name, ty) = param else {
                    panic!("ellipsis is not valid in a union member list")
                };
                let mut list = members.borrow_mut();
                list.members.push(Member { name, ty, offset: 0 });
                list.max_align = list.max_align.max(type_alignment(ty));
                t.size.set(t.size.get().max(size_of(ty)));
            }
            _ => panic!("add_member on a type with no member list"),
        }
    }
}

fn clone_kind_shallow<'a>(t: Type<'a>) -> TypeKind<'a> {
    // Only ever invoked to re-qualify a node; struct/union/function bodies
    // are shared by reference through `Tagged`/`Pointer`-style indirection
    // everywhere else, so a qualified copy of an aggregate should itself be
    // represented as a `Tagged` alias rather than duplicating member lists.
    match &t.kind {
        TypeKind::Void => TypeKind::Void,
        TypeKind::Int { signed, size } => TypeKind::Int { signed: *signed, size: *size },
        TypeKind::Real { size } => TypeKind::Real { size: *size },
        TypeKind::Pointer(p) => TypeKind::Pointer(*p),
        TypeKind::Array { elem, count } => TypeKind::Array { elem: *elem, count: Cell::new(count.get()) },
        TypeKind::Tagged { name, def } => TypeKind::Tagged { name: *name, def: *def },
        TypeKind::Struct(_) | TypeKind::Union(_) | TypeKind::Function { .. } =>
            panic!("qualify an aggregate/function through a Tagged alias instead"),
    }
}

/// `unwrapped` (spec.md §4.1): dereference through a tag node.
#[must_use]
pub fn unwrapped<'a>(t: Type<'a>) -> Type<'a> {
    match &t.kind {
        TypeKind::Tagged { def, .. } => *def,
        _ => t,
    }
}

fn align_to(off: u64, align: u64) -> u64 {
    if align == 0 { return off }
    (off + align - 1) & !(align - 1)
}

/// `size_of` (spec.md §4.1): dereferences through a tag first.
#[must_use]
pub fn size_of<'a>(t: Type<'a>) -> u64 { unwrapped(t).size.get() }

/// `type_alignment` (spec.md §4.1).
#[must_use]
pub fn type_alignment<'a>(t: Type<'a>) -> u64 {
    match &unwrapped(t).kind {
        TypeKind::Void => 1,
        TypeKind::Array { elem, .. } => type_alignment(*elem),
        TypeKind::Struct(m) | TypeKind::Union(m) => m.borrow().max_align,
        TypeKind::Function { .. } => 1,
        TypeKind::Tagged { .. } => unreachable!("unwrapped"),
        TypeKind::Int { .. } | TypeKind::Real { .. } | TypeKind::Pointer(_) => size_of(t),
    }
}

#[must_use]
pub fn nmembers<'a>(t: Type<'a>) -> usize {
    match &unwrapped(t).kind {
        TypeKind::Struct(m) | TypeKind::Union(m) => m.borrow().members.len(),
        TypeKind::Function { params, .. } => params.borrow().members.len(),
        _ => 0,
    }
}

#[must_use]
pub fn get_member<'a>(t: Type<'a>, name: Symbol) -> Option<Member<'a>> {
    match &unwrapped(t).kind {
        TypeKind::Struct(m) | TypeKind::Union(m) => m.borrow().get(name).copied(),
        TypeKind::Function { params, .. } => params.borrow().get(name).copied(),
        _ => None,
    }
}

#[must_use]
pub fn is_vararg<'a>(t: Type<'a>) -> bool {
    match &unwrapped(t).kind {
        TypeKind::Function { params, .. } => params.borrow().variadic,
        _ => false,
    }
}

#[must_use]
pub fn is_integer<'a>(t: Type<'a>) -> bool { matches!(unwrapped(t).kind, TypeKind::Int { .. }) }

#[must_use]
pub fn is_signed<'a>(t: Type<'a>) -> bool {
    matches!(unwrapped(t).kind, TypeKind::Int { signed: true, .. })
}

#[must_use]
pub fn is_scalar<'a>(t: Type<'a>) -> bool {
    matches!(unwrapped(t).kind, TypeKind::Int { .. } | TypeKind::Real { .. } | TypeKind::Pointer(_))
}

#[must_use]
pub fn is_aggregate<'a>(t: Type<'a>) -> bool {
    matches!(unwrapped(t).kind, TypeKind::Struct(_) | TypeKind::Union(_) | TypeKind::Array { .. })
}

#[must_use]
pub fn is_complete<'a>(t: Type<'a>) -> bool {
    match &unwrapped(t).kind {
        TypeKind::Array { count, .. } => count.get().is_some(),
        TypeKind::Void => false,
        _ => true,
    }
}

/// `type_equal` (spec.md §4.1): ignores qualifiers and parameter names;
/// tagged pairs compare by `next` (here: `def`) pointer identity.
#[must_use]
pub fn type_equal<'a>(a: Type<'a>, b: Type<'a>) -> bool {
    if let (TypeKind::Tagged { def: da, .. }, TypeKind::Tagged { def: db, .. }) = (&a.kind, &b.kind) {
        return std::ptr::eq(*da, *db)
    }
    let a = unwrapped(a);
    let b = unwrapped(b);
    if std::ptr::eq(a, b) { return true }
    match (&a.kind, &b.kind) {
        (TypeKind::Void, TypeKind::Void) => true,
        (TypeKind::Int { signed: s1, size: z1 }, TypeKind::Int { signed: s2, size: z2 }) =>
            s1 == s2 && z1 == z2,
        (TypeKind::Real { size: z1 }, TypeKind::Real { size: z2 }) => z1 == z2,
        (TypeKind::Pointer(p1), TypeKind::Pointer(p2)) => type_equal(*p1, *p2),
        (TypeKind::Array { elem: e1, count: c1 }, TypeKind::Array { elem: e2, count: c2 }) =>
            type_equal(*e1, *e2) && c1.get() == c2.get(),
        (TypeKind::Struct(m1), TypeKind::Struct(m2)) | (TypeKind::Union(m1), TypeKind::Union(m2)) => {
            let (m1, m2) = (m1.borrow(), m2.borrow());
            m1.members.len() == m2.members.len() &&
                m1.members.iter().zip(m2.members.iter())
                    .all(|(x, y)| x.name == y.name && type_equal(x.ty, y.ty))
        }
        (TypeKind::Function { ret: r1, params: p1 }, TypeKind::Function { ret: r2, params: p2 }) => {
            let (p1, p2) = (p1.borrow(), p2.borrow());
            type_equal(*r1, *r2) && p1.variadic == p2.variadic &&
                p1.members.len() == p2.members.len() &&
                p1.members.iter().zip(p2.members.iter()).all(|(x, y)| type_equal(x.ty, y.ty))
        }
        _ => false,
    }
}

/// spec.md §8: "`is_compatible(a,b) == type_equal(a,b)`" — this core has no
/// separate notion of type compatibility beyond structural equality.
#[must_use]
pub fn is_compatible<'a>(a: Type<'a>, b: Type<'a>) -> bool { type_equal(a, b) }

/// `promote_integer` (spec.md §4.1).
#[must_use]
pub fn promote_integer<'a>(types: &Types<'a>, t: Type<'a>) -> Type<'a> {
    if size_of(t) < 4 { types.int } else { t }
}

/// `usual_arithmetic_conversion` (spec.md §4.1): floating types are
/// elided (non-goal); both operands are integer-promoted, the wider type
/// wins, ties favor unsigned.
#[must_use]
pub fn usual_arithmetic_conversion<'a>(types: &Types<'a>, a: Type<'a>, b: Type<'a>) -> Type<'a> {
    let a = promote_integer(types, a);
    let b = promote_integer(types, b);
    let (sa, za) = match &unwrapped(a).kind { TypeKind::Int { signed, size } => (*signed, *size), _ => (true, 4) };
    let (sb, zb) = match &unwrapped(b).kind { TypeKind::Int { signed, size } => (*signed, *size), _ => (true, 4) };
    match za.cmp(&zb) {
        std::cmp::Ordering::Greater => a,
        std::cmp::Ordering::Less => b,
        std::cmp::Ordering::Equal => if sa && sb { a } else if !sa { a } else { b },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_layout_matches_natural_alignment() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let s = types.new_struct();
        let x = crate::symbol::intern("x");
        let y = crate::symbol::intern("y");
        types.add_member(s, Param::Named(x, types.int));
        types.add_member(s, Param::Named(y, types.char_));
        assert_eq!(size_of(s), 8);
        assert_eq!(type_alignment(s), 4);
        let members = match &s.kind { TypeKind::Struct(m) => m.borrow(), _ => unreachable!() };
        assert_eq!(members.members()[0].offset, 0);
        assert_eq!(members.members()[1].offset, 4);
    }

    #[test]
    fn union_size_is_max_member() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let u = types.new_union();
        let a = crate::symbol::intern("a");
        let b = crate::symbol::intern("b");
        types.add_member(u, Param::Named(a, types.char_));
        types.add_member(u, Param::Named(b, types.long));
        assert_eq!(size_of(u), 8);
        let members = match &u.kind { TypeKind::Union(m) => m.borrow(), _ => unreachable!() };
        assert!(members.members().iter().all(|m| m.offset == 0));
    }

    #[test]
    fn type_equal_is_reflexive_and_symmetric() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let p1 = types.pointer(types.int);
        let p2 = types.pointer(types.int);
        assert!(type_equal(p1, p1));
        assert!(type_equal(p1, p2));
        assert!(type_equal(p2, p1));
        assert_eq!(is_compatible(p1, p2), type_equal(p1, p2));
        assert!(!type_equal(p1, types.pointer(types.char_)));
    }

    #[test]
    fn tagged_alias_does_not_mutate_definition() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let s = types.new_struct();
        let tag = crate::symbol::intern("Point");
        let alias = types.tagged_copy(s, tag);
        let qualified = types.with_qualifier(alias, Qualifier::CONST);
        assert_eq!(qualified.qualifier.get(), Qualifier::CONST);
        assert_eq!(alias.qualifier.get(), Qualifier::empty());
        assert!(std::ptr::eq(unwrapped(qualified), s));
    }

    #[test]
    fn usual_arithmetic_conversion_matches_spec_examples() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        assert!(type_equal(usual_arithmetic_conversion(&types, types.char_, types.char_), types.int));
        assert!(type_equal(usual_arithmetic_conversion(&types, types.ushort, types.int), types.int));
        assert!(type_equal(usual_arithmetic_conversion(&types, types.uint, types.long), types.long));
        // ties on width favor unsigned
        assert!(type_equal(usual_arithmetic_conversion(&types, types.uint, types.int), types.uint));
    }

    #[test]
    fn incomplete_array_completion_writes_back_size() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let arr = types.array(types.int, None);
        assert!(!is_complete(arr));
        types.complete_array(arr, 3);
        assert!(is_complete(arr));
        assert_eq!(size_of(arr), 12);
    }
}
