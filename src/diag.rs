//! Diagnostics and the error-handling policy from spec.md §7.
//!
//! The teacher has no `thiserror`/`anyhow` dependency; diagnostics in the
//! surrounding `mm0-rs` codebase are plain `FileSpan`-tagged values
//! propagated by hand, and invariant violations are plain `.expect()`
//! panics (see `InstSink::rip_relative_block`'s `"jump out of range"` and
//! `push_u32`'s `"instruction overflow"` in the teacher's `codegen.rs`).
//! We follow both conventions instead of reaching for a derive crate.

use std::fmt;

/// A location in the source file being compiled, minimal stand-in for the
/// `mm0_util::FileSpan` the teacher's files are written against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// The four error kinds named in spec.md §7. Kinds 1 and 2 are fatal
/// diagnostics formatted with source location; kind 3 is a programmer
/// invariant violation and is raised via `panic!`/`assert!` instead (it
/// never reaches this enum); kind 4 wraps [`std::io::Error`] unchanged.
#[derive(Debug)]
pub enum Diagnostic {
    /// Lexical/syntactic: mismatched punctuator, missing name, unexpected EOF.
    Syntax { span: Span, message: String },
    /// Type/semantic: incomplete type used as complete, duplicate specifier,
    /// incompatible tag kind, non-integer where integer required,
    /// assignment to non-lvalue, excess initializers, ...
    Semantic { span: Span, message: String },
    /// I/O failure at the ELF-writer boundary, surfaced unchanged.
    Io(std::io::Error),
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::Syntax { span, message } => write!(f, "{span}: error: {message}"),
            Diagnostic::Semantic { span, message } => write!(f, "{span}: error: {message}"),
            Diagnostic::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Diagnostic {}

impl From<std::io::Error> for Diagnostic {
    fn from(e: std::io::Error) -> Self { Diagnostic::Io(e) }
}

pub type Result<T> = std::result::Result<T, Diagnostic>;

/// Helper constructors, used pervasively by the parser modules.
impl Diagnostic {
    pub fn syntax(span: Span, message: impl Into<String>) -> Self {
        Diagnostic::Syntax { span, message: message.into() }
    }
    pub fn semantic(span: Span, message: impl Into<String>) -> Self {
        Diagnostic::Semantic { span, message: message.into() }
    }
}
