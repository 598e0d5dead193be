//! The command-line driver (spec.md §6 "CLI surface", SPEC_FULL.md §14):
//! reads one C89 source file, drives it through the library's parser and
//! back-end, and writes either an ELF relocatable object or a `dot` debug
//! dump of each function's CFG.
//!
//! This is also the one place the lexer lives: `token::TokenStream` states
//! only the contract the parser modules are written against (spec.md §6
//! treats tokenizing as an external collaborator), so turning raw source
//! text into `Token`s is the driver's job, not the library's.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use mmcc_lite::diag::Span;
use mmcc_lite::idx::Idx;
use mmcc_lite::token::{Token, TokenKind, TokenStream};
use mmcc_lite::{codegen, decl, elf::ElfWriter, ir, Compilation};

/// C89 keywords (plus `sizeof`), matched by the parser modules via
/// `TokenKind::Keyword(interned_spelling)`. Anything else that looks like
/// an identifier lexes as `TokenKind::Identifier`.
const KEYWORDS: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do",
    "double", "else", "enum", "extern", "float", "for", "goto", "if", "int",
    "long", "register", "return", "short", "signed", "sizeof", "static",
    "struct", "switch", "typedef", "union", "unsigned", "void", "volatile",
    "while",
];

/// Parse a C89 source file into x86-64 ELF objects.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// input source file
    input: PathBuf,
    /// compile to assembly (unsupported: this core has no textual
    /// assembly printer, only a direct-to-object encoder; falls back to
    /// object emission)
    #[arg(short = 'S', long = "asm")]
    emit_asm: bool,
    /// compile to an object file without linking (the only mode this core
    /// actually performs; accepted for command-line compatibility with a
    /// real `cc`-style driver)
    #[arg(short = 'c', long = "compile")]
    compile_only: bool,
    /// run the preprocessor only (unsupported: preprocessing is an
    /// external collaborator out of this core's scope, spec.md §1)
    #[arg(short = 'E', long = "preprocess")]
    preprocess_only: bool,
    /// output path
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,
    /// add a header search path (accepted, unused: no `#include` handling
    /// without a preprocessor)
    #[arg(short = 'I', value_name = "path")]
    include: Vec<PathBuf>,
    /// define a macro `name` or `name=value` (accepted, unused)
    #[arg(short = 'D', value_name = "name[=val]")]
    define: Vec<String>,
    /// undefine a macro (accepted, unused)
    #[arg(short = 'U', value_name = "name")]
    undef: Vec<String>,
    /// emit a Graphviz `dot` dump of each function's CFG instead of an object
    #[arg(long)]
    dot: bool,
}

fn main() -> ExitCode {
    simplelog::SimpleLogger::init(log::LevelFilter::Warn, simplelog::Config::default())
        .expect("logger already initialized");
    let args = Args::parse();

    if args.preprocess_only {
        log::warn!("-E requested but this core has no preprocessor; ignoring and continuing");
    }
    if args.emit_asm {
        log::warn!("-S requested but this core has no assembly printer; emitting an object instead");
    }
    for path in &args.include { log::warn!("-I {} accepted but unused: no #include support", path.display()) }
    for d in &args.define { log::warn!("-D {d} accepted but unused: no macro expansion") }
    for u in &args.undef { log::warn!("-U {u} accepted but unused: no macro expansion") }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(diagnostic) => {
            eprintln!("mmccc: {diagnostic}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> mmcc_lite::diag::Result<()> {
    let source = fs::read_to_string(&args.input)?;

    // Leaked rather than stack-allocated: `TypeNode` is invariant and
    // self-referential over its arena's lifetime, which makes dropck
    // require the arena to strictly outlive itself if it's ever
    // (implicitly) dropped in this scope. `mmccc` is a one-shot process
    // that exits right after `run` returns, so the OS reclaims this memory
    // regardless; leaking it here just sidesteps that dropck requirement.
    let type_arena: &'static typed_arena::Arena<mmcc_lite::types::TypeNode<'static>> =
        Box::leak(Box::new(typed_arena::Arena::new()));
    let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
    let mut comp = Compilation::new(type_arena, bump);

    let mut lexer = Lexer::new(&source);
    while !matches!(&lexer.peek().kind, TokenKind::End) {
        decl::external_declaration(&mut lexer, &mut comp)?;
    }

    let output = args.output.clone().unwrap_or_else(|| default_output(&args.input, args.dot));

    if args.dot {
        let mut combined = String::new();
        comp.for_each_definition(|symbols, _types, def| {
            let name = mmcc_lite::symbol::with_str(symbols.get(def.symbol).name, str::to_string);
            combined.push_str(&ir::dot::write_dot(&name, def));
        });
        fs::write(&output, combined)?;
        return Ok(());
    }

    let mut writer = ElfWriter::new();
    // String-literal (and `__func__`) bytes go into `.data` before any
    // function is lowered, so every reference to one is a plain
    // already-placed RIP-relative symbol rather than a forward reference
    // (spec.md §8 scenario 3).
    let literals: Vec<(mmcc_lite::symtab::SymbolId, Vec<u8>)> =
        comp.symbols.string_literals().map(|(id, bytes)| (id, bytes.to_vec())).collect();
    for (id, bytes) in literals {
        writer.define_data_symbol(id, format!(".LC{}", id.into_usize()));
        writer.push_data(&bytes);
    }
    comp.for_each_definition(|symbols, types, def| {
        let name = mmcc_lite::symbol::with_str(symbols.get(def.symbol).name, str::to_string);
        codegen::lower_definition(def, symbols, types, &mut writer, &name);
    });
    let mut file = fs::File::create(&output)?;
    writer.write_elf(&mut file)?;
    Ok(())
}

fn default_output(input: &std::path::Path, dot: bool) -> PathBuf {
    input.with_extension(if dot { "dot" } else { "o" })
}

/// A minimal hand-rolled C89 lexer: the one piece spec.md leaves to "the
/// preprocessor" (§1) but the binary needs something concrete to drive
/// the parser modules with.
struct Lexer<'s> {
    bytes: &'s [u8],
    pos: usize,
    line: u32,
    col: u32,
    current: Token,
    /// `KEYWORDS`, interned once and laid out as a dense `Symbol`-indexed
    /// table so `scan_word` classifies a word in O(1) instead of scanning
    /// the list on every identifier.
    keywords: Box<[Option<()>]>,
}

impl<'s> Lexer<'s> {
    fn new(src: &'s str) -> Self {
        let pairs: Vec<(mmcc_lite::symbol::Symbol, ())> =
            KEYWORDS.iter().map(|&k| (mmcc_lite::symbol::intern(k), ())).collect();
        let keywords = mmcc_lite::symbol::init_dense_symbol_map(&pairs);
        let mut lexer = Lexer {
            bytes: src.as_bytes(), pos: 0, line: 1, col: 1,
            current: Token { kind: TokenKind::End, span: Span::default() }, keywords,
        };
        lexer.current = lexer.scan();
        lexer
    }

    fn span(&self) -> Span { Span { line: self.line, col: self.col } }

    fn byte_at(&self, offset: usize) -> Option<u8> { self.bytes.get(self.pos + offset).copied() }

    fn advance(&mut self) -> Option<u8> {
        let b = self.byte_at(0)?;
        self.pos += 1;
        if b == b'\n' { self.line += 1; self.col = 1 } else { self.col += 1 }
        Some(b)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.byte_at(0) {
                Some(b' ' | b'\t' | b'\r' | b'\n') => { self.advance(); }
                Some(b'/') if self.byte_at(1) == Some(b'/') => {
                    while !matches!(self.byte_at(0), None | Some(b'\n')) { self.advance(); }
                }
                Some(b'/') if self.byte_at(1) == Some(b'*') => {
                    self.advance(); self.advance();
                    while !(self.byte_at(0).is_none() || (self.byte_at(0) == Some(b'*') && self.byte_at(1) == Some(b'/'))) {
                        self.advance();
                    }
                    self.advance(); self.advance();
                }
                _ => break,
            }
        }
    }

    fn scan(&mut self) -> Token {
        self.skip_trivia();
        let span = self.span();
        let Some(b) = self.byte_at(0) else { return Token { kind: TokenKind::End, span } };

        if b.is_ascii_digit() { return self.scan_number(span) }
        if b == b'_' || b.is_ascii_alphabetic() { return self.scan_word(span) }
        if b == b'"' { return self.scan_string(span) }
        if b == b'\'' { return self.scan_char(span) }
        self.scan_punct(span)
    }

    fn scan_number(&mut self, span: Span) -> Token {
        let start = self.pos;
        let radix = if self.byte_at(0) == Some(b'0') && matches!(self.byte_at(1), Some(b'x' | b'X')) {
            self.advance(); self.advance();
            16
        } else if self.byte_at(0) == Some(b'0') {
            8
        } else {
            10
        };
        let digit_start = self.pos;
        while self.byte_at(0).is_some_and(|c| (c as char).is_digit(radix)) { self.advance(); }
        let digits = if self.pos > digit_start { &self.bytes[digit_start..self.pos] } else { &self.bytes[start..start] };
        let text = std::str::from_utf8(digits).unwrap_or("0");
        let value = i64::from_str_radix(if text.is_empty() { "0" } else { text }, radix).unwrap_or(0);
        // integer suffixes (u/U/l/L, any combination): accepted, not tracked
        while matches!(self.byte_at(0), Some(b'u' | b'U' | b'l' | b'L')) { self.advance(); }
        Token { kind: TokenKind::Number(value), span }
    }

    fn scan_word(&mut self, span: Span) -> Token {
        let start = self.pos;
        while self.byte_at(0).is_some_and(|c| c == b'_' || c.is_ascii_alphanumeric()) { self.advance(); }
        let word = std::str::from_utf8(&self.bytes[start..self.pos]).expect("source is valid UTF-8");
        let sym = mmcc_lite::symbol::intern(word);
        let is_keyword = self.keywords.get(sym.into_usize()).copied().flatten().is_some();
        let kind = if is_keyword { TokenKind::Keyword(sym) } else { TokenKind::Identifier(sym) };
        Token { kind, span }
    }

    fn scan_escape(&mut self) -> u8 {
        match self.advance() {
            Some(b'n') => b'\n', Some(b't') => b'\t', Some(b'r') => b'\r',
            Some(b'0') => 0, Some(b'\\') => b'\\', Some(b'\'') => b'\'', Some(b'"') => b'"',
            Some(other) => other,
            None => 0,
        }
    }

    fn scan_string(&mut self, span: Span) -> Token {
        self.advance(); // opening quote
        let mut bytes = Vec::new();
        loop {
            match self.byte_at(0) {
                None | Some(b'"') => break,
                Some(b'\\') => { self.advance(); bytes.push(self.scan_escape()) }
                Some(_) => bytes.push(self.advance().unwrap()),
            }
        }
        self.advance(); // closing quote
        Token { kind: TokenKind::String(bytes.into_boxed_slice()), span }
    }

    fn scan_char(&mut self, span: Span) -> Token {
        self.advance(); // opening quote
        let value = match self.byte_at(0) {
            Some(b'\\') => { self.advance(); self.scan_escape() }
            Some(_) => self.advance().unwrap(),
            None => 0,
        };
        if self.byte_at(0) == Some(b'\'') { self.advance(); }
        Token { kind: TokenKind::Number(i64::from(value)), span }
    }

    /// Three-, two-, then one-character punctuators, longest match first
    /// (spec.md §6's `Op` vs `Punct` split).
    fn scan_punct(&mut self, span: Span) -> Token {
        const THREE: &[&str] = &["<<=", ">>="];
        const TWO: &[&str] = &[
            "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=",
            "==", "!=", "<=", ">=", "<<", ">>", "&&", "||", "->",
        ];
        if self.byte_at(0) == Some(b'.') && self.byte_at(1) == Some(b'.') && self.byte_at(2) == Some(b'.') {
            self.advance(); self.advance(); self.advance();
            return Token { kind: TokenKind::Dots, span }
        }
        if let (Some(a), Some(b), Some(c)) = (self.byte_at(0), self.byte_at(1), self.byte_at(2)) {
            let s = [a, b, c];
            if let Some(&op) = THREE.iter().find(|op| op.as_bytes() == &s[..]) {
                self.advance(); self.advance(); self.advance();
                return Token { kind: TokenKind::Op(op), span }
            }
        }
        if let (Some(a), Some(b)) = (self.byte_at(0), self.byte_at(1)) {
            let s = [a, b];
            if let Some(&op) = TWO.iter().find(|op| op.as_bytes() == &s[..]) {
                self.advance(); self.advance();
                return Token { kind: TokenKind::Op(op), span }
            }
        }
        let c = self.advance().expect("scan_punct called at end of input") as char;
        Token { kind: TokenKind::Punct(c), span }
    }
}

impl TokenStream for Lexer<'_> {
    fn peek(&mut self) -> &Token { &self.current }

    fn next(&mut self) -> Token {
        let tok = self.current.clone();
        if !matches!(tok.kind, TokenKind::End) { self.current = self.scan() }
        tok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next();
            let end = matches!(tok.kind, TokenKind::End);
            out.push(tok.kind);
            if end { break }
        }
        out
    }

    #[test]
    fn lexes_a_tiny_function() {
        let ks = kinds("int add(int a, int b) { return a + b; }");
        assert!(matches!(ks[0], TokenKind::Keyword(_)));
        assert!(ks.contains(&TokenKind::Punct('(')));
        assert!(ks.contains(&TokenKind::Punct('{')));
        assert_eq!(*ks.last().unwrap(), TokenKind::End);
    }

    #[test]
    fn recognizes_multi_char_operators_by_longest_match() {
        let ks = kinds("a <<= b >> c");
        assert!(ks.contains(&TokenKind::Op("<<=")));
        assert!(ks.contains(&TokenKind::Op(">>")));
    }

    #[test]
    fn distinguishes_keywords_from_identifiers() {
        let ks = kinds("int intx");
        assert!(matches!(ks[0], TokenKind::Keyword(_)));
        assert!(matches!(ks[1], TokenKind::Identifier(_)));
    }

    #[test]
    fn parses_hex_octal_and_decimal_numbers() {
        assert_eq!(kinds("0x1F")[0], TokenKind::Number(31));
        assert_eq!(kinds("017")[0], TokenKind::Number(15));
        assert_eq!(kinds("42")[0], TokenKind::Number(42));
    }

    #[test]
    fn skips_line_and_block_comments() {
        let ks = kinds("/* c */ a // trailing\nb");
        assert_eq!(ks.len(), 3); // a, b, End
    }

    #[test]
    fn reads_escaped_string_and_char_literals() {
        assert_eq!(kinds("\"a\\nb\"")[0], TokenKind::String(b"a\nb".to_vec().into_boxed_slice()));
        assert_eq!(kinds("'\\n'")[0], TokenKind::Number(10));
    }
}
