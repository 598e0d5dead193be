//! Process-wide string interner.
//!
//! The teacher crate's `types/entity.rs` is written against a `Symbol`/
//! `Interner` API (`intern`, `init_dense_symbol_map`, `Symbol::into_usize`)
//! supplied by the `mm0_util` path dependency, which isn't available
//! outside the `mm0-rs` workspace. This module reconstructs that surface
//! directly: a small `Copy` handle backed by a grow-only table.

use hashbrown::HashMap;
use std::cell::RefCell;

/// A cheap, `Copy` handle to an interned string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol(u32);

impl Symbol {
    #[must_use] pub fn into_usize(self) -> usize { self.0 as usize }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        INTERNER.with(|i| write!(f, "{:?}", i.borrow().resolve(*self)))
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        INTERNER.with(|i| write!(f, "{}", i.borrow().resolve(*self)))
    }
}

#[derive(Default)]
pub struct Interner {
    map: HashMap<Box<str>, Symbol>,
    strings: Vec<Box<str>>,
}

impl Interner {
    pub fn intern(&mut self, s: &str) -> Symbol {
        if let Some(&sym) = self.map.get(s) { return sym }
        let sym = Symbol(u32::try_from(self.strings.len()).expect("too many symbols"));
        let boxed: Box<str> = s.into();
        self.strings.push(boxed.clone());
        self.map.insert(boxed, sym);
        sym
    }

    #[must_use] pub fn resolve(&self, sym: Symbol) -> &str { &self.strings[sym.into_usize()] }
}

thread_local! {
    static INTERNER: RefCell<Interner> = RefCell::new(Interner::default());
}

/// Intern `s` in the process-wide table, returning a stable [`Symbol`].
pub fn intern(s: &str) -> Symbol { INTERNER.with(|i| i.borrow_mut().intern(s)) }

/// Resolve a [`Symbol`] back to its string contents.
///
/// The closure form avoids handing out a borrow that outlives a later
/// `intern` call on the same thread.
pub fn with_str<R>(sym: Symbol, f: impl FnOnce(&str) -> R) -> R {
    INTERNER.with(|i| f(i.borrow().resolve(sym)))
}

/// Build a dense `Symbol -> T` lookup table, following the teacher's
/// `init_dense_symbol_map` helper referenced from `types/entity.rs`: used
/// to turn a small static list of `(Symbol, T)` pairs keyed by freshly
/// interned keyword strings into O(1) lookup by symbol id.
#[must_use]
pub fn init_dense_symbol_map<T: Copy>(pairs: &[(Symbol, T)]) -> Box<[Option<T>]> {
    let len = pairs.iter().map(|(s, _)| s.into_usize() + 1).max().unwrap_or(0);
    let mut out = vec![None; len].into_boxed_slice();
    for &(s, v) in pairs { out[s.into_usize()] = Some(v) }
    out
}

/// `__func__`'s spelling, the one C99-ism spec.md explicitly keeps in scope.
pub const FUNC_NAME: &str = "__func__";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable_and_deduplicates() {
        let a = intern("foo");
        let b = intern("bar");
        let c = intern("foo");
        assert_eq!(a, c);
        assert_ne!(a, b);
        with_str(a, |s| assert_eq!(s, "foo"));
        with_str(b, |s| assert_eq!(s, "bar"));
    }

    #[test]
    fn dense_map_looks_up_interned_keys() {
        let add = intern("+");
        let sub = intern("-");
        let map = init_dense_symbol_map(&[(add, 1), (sub, 2)]);
        assert_eq!(map[add.into_usize()], Some(1));
        assert_eq!(map[sub.into_usize()], Some(2));
    }
}
