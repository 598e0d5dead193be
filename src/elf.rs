//! The ELF writer (spec.md §6 "ELF writer"; an external collaborator per
//! §1, implemented concretely here since spec.md states its contract
//! precisely enough to do so — SPEC_FULL.md §10).
//!
//! Byte-level header assembly is grounded on the teacher's own
//! `LinkedCode::write_elf` in `src/codegen.rs`: raw field-by-field writes
//! through `byteorder::WriteBytesExt`, generalized from the teacher's
//! fixed single-segment `ET_EXEC` layout to a full `ET_REL` object with
//! `.text`/`.data`/`.rela.text`/`.symtab`/`.strtab` sections. Section-header
//! field layout and the `SHT_*`/`SHN_*` constants follow
//! `examples/other_examples/38427b76_m4b-goblin__src-elf-section_header.rs.rs`.

use std::collections::HashMap;
use std::io::{self, Write};

use byteorder::{WriteBytesExt, LE};

use crate::encode::RelocSink;
use crate::symtab::SymbolId;

pub const SHT_NULL: u32 = 0;
pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;

pub const SHN_UNDEF: u16 = 0;

const EI_NIDENT: usize = 16;
const ET_REL: u16 = 1;
const EM_X86_64: u16 = 0x3e;

/// The three relocation kinds named in spec.md §6.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RelocKind {
    /// `R_X86_64_PC32`.
    Pc32,
    /// `R_X86_64_32S`.
    Abs32Signed,
    /// `R_X86_64_64`.
    Abs64,
}

impl RelocKind {
    fn elf_type(self) -> u32 {
        match self {
            RelocKind::Pc32 => 2,
            RelocKind::Abs32Signed => 11,
            RelocKind::Abs64 => 1,
        }
    }
}

struct Reloc {
    symbol: SymbolId,
    kind: RelocKind,
    text_offset: u32,
    addend: i64,
}

/// Append-only section buffers plus the pending relocation list (spec.md
/// §5: "ELF sections ... are append-only byte buffers with explicit
/// offsets").
#[derive(Default)]
pub struct ElfWriter {
    pub text: Vec<u8>,
    pub data: Vec<u8>,
    relocs: Vec<Reloc>,
    /// Symbols already placed in the text section, by text offset.
    defined: HashMap<SymbolId, u32>,
    /// Symbols already placed in the data section, by data offset (spec.md
    /// §8 scenario 3: string-literal bytes live here, addressed RIP-relative
    /// from `.text` rather than through a stack slot).
    data_defined: HashMap<SymbolId, u32>,
    /// Declaration order, used to build `.symtab`/`.strtab` at write time.
    symbol_order: Vec<SymbolId>,
    symbol_name: HashMap<SymbolId, String>,
}

impl ElfWriter {
    #[must_use] pub fn new() -> Self { Self::default() }

    pub fn push_text_u8(&mut self, b: u8) { self.text.push(b) }
    pub fn push_text(&mut self, bytes: &[u8]) { self.text.extend_from_slice(bytes) }
    pub fn push_data(&mut self, bytes: &[u8]) { self.data.extend_from_slice(bytes) }

    #[must_use] pub fn text_len(&self) -> u32 { u32::try_from(self.text.len()).expect("text section too large") }

    /// Record that `sym` is defined at the current end of the text
    /// section (spec.md §5: "symbol definitions must be placed into the
    /// symbol table before any relocation referencing them is resolved").
    pub fn define_text_symbol(&mut self, sym: SymbolId, name: impl Into<String>) {
        let offset = self.text_len();
        self.defined.insert(sym, offset);
        if !self.symbol_name.contains_key(&sym) {
            self.symbol_order.push(sym);
        }
        self.symbol_name.insert(sym, name.into());
    }

    /// Record that `sym` is defined at the current end of the data section
    /// (spec.md §8 scenario 3): the counterpart to [`Self::define_text_symbol`]
    /// for symbols whose bytes live in `.data` rather than `.text`, e.g. a
    /// string literal's payload placed there by [`Self::push_data`].
    pub fn define_data_symbol(&mut self, sym: SymbolId, name: impl Into<String>) {
        let offset = u32::try_from(self.data.len()).expect("data section too large");
        self.data_defined.insert(sym, offset);
        if !self.symbol_name.contains_key(&sym) {
            self.symbol_order.push(sym);
        }
        self.symbol_name.insert(sym, name.into());
    }

    /// `elf_add_reloc_text` (spec.md §6).
    pub fn add_reloc_text(&mut self, sym: SymbolId, kind: RelocKind, text_offset: u32, addend: i64) {
        log::trace!("add_reloc_text: sym={sym:?} kind={kind:?} offset={text_offset}");
        self.relocs.push(Reloc { symbol: sym, kind, text_offset, addend });
    }

    /// `elf_text_displacement` (spec.md §6): resolved symbols return their
    /// real signed displacement; forward references return `0` and leave
    /// the relocation already registered by the caller (the encoder) to
    /// be patched at link time.
    #[must_use]
    pub fn text_displacement(&self, sym: SymbolId, field_offset: u32) -> i32 {
        match self.defined.get(&sym) {
            Some(&target) => i32::try_from(i64::from(target) - i64::from(field_offset)).expect("jump out of range"),
            None => 0,
        }
    }

    /// Write a complete `ET_REL`/`EM_X86_64` object: ELF header, `.text`,
    /// `.data`, `.rela.text`, `.symtab`, `.strtab`, and the section header
    /// table. Symbols not placed by `define_text_symbol` become `SHN_UNDEF`
    /// entries for the linker to resolve.
    pub fn write_elf(&self, w: &mut impl Write) -> io::Result<()> {
        let shstrtab: &[u8] = b"\0.text\0.data\0.rela.text\0.symtab\0.strtab\0.shstrtab\0";
        let (text_off, data_off, rela_off, symtab_off, strtab_off, shstrtab_off);

        let header_len = 0x40u64;
        text_off = header_len;
        data_off = text_off + self.text.len() as u64;
        let rela_entries = self.relocs.len() as u64;
        let rela_size = rela_entries * 24;
        rela_off = data_off + self.data.len() as u64;

        let (strtab, symtab) = self.build_symtab_strtab();
        symtab_off = rela_off + rela_size;
        strtab_off = symtab_off + symtab.len() as u64;
        shstrtab_off = strtab_off + strtab.len() as u64;
        let sh_off = shstrtab_off + shstrtab.len() as u64;

        self.write_header(w, sh_off)?;
        w.write_all(&self.text)?;
        w.write_all(&self.data)?;
        self.write_rela(w)?;
        w.write_all(&symtab)?;
        w.write_all(&strtab)?;
        w.write_all(shstrtab)?;
        self.write_section_headers(w, text_off, data_off, rela_off, rela_entries, symtab_off, symtab.len() as u64, strtab_off, strtab.len() as u64, shstrtab_off, shstrtab.len() as u64)
    }

    fn write_header(&self, w: &mut impl Write, sh_off: u64) -> io::Result<()> {
        let mut ident = [0u8; EI_NIDENT];
        ident[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        ident[4] = 2; // ELFCLASS64
        ident[5] = 1; // ELFDATA2LSB
        ident[6] = 1; // EV_CURRENT
        w.write_all(&ident)?;
        w.write_u16::<LE>(ET_REL)?;
        w.write_u16::<LE>(EM_X86_64)?;
        w.write_u32::<LE>(1)?; // e_version
        w.write_u64::<LE>(0)?; // e_entry: none, ET_REL
        w.write_u64::<LE>(0)?; // e_phoff: no program headers
        w.write_u64::<LE>(sh_off)?;
        w.write_u32::<LE>(0)?; // e_flags
        w.write_u16::<LE>(0x40)?; // e_ehsize
        w.write_u16::<LE>(0)?; // e_phentsize
        w.write_u16::<LE>(0)?; // e_phnum
        w.write_u16::<LE>(0x40)?; // e_shentsize
        w.write_u16::<LE>(7)?; // e_shnum: null, text, data, rela.text, symtab, strtab, shstrtab
        w.write_u16::<LE>(6)?; // e_shstrndx
        Ok(())
    }

    /// Build `.symtab`/`.strtab` contents. Entry 0 is the mandatory null
    /// symbol; the rest follow `symbol_order`.
    fn build_symtab_strtab(&self) -> (Vec<u8>, Vec<u8>) {
        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; 24]; // null entry
        for &sym in &self.symbol_order {
            let name = self.symbol_name.get(&sym).map_or("", String::as_str);
            let name_off = u32::try_from(strtab.len()).expect("strtab too large");
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            // `.text` takes priority: no symbol is ever placed in both.
            let (value, shndx, st_info) = if let Some(&v) = self.defined.get(&sym) {
                (v, 1u16, 0x10) // GLOBAL FUNC, section .text
            } else if let Some(&v) = self.data_defined.get(&sym) {
                (v, 2u16, 0x11) // GLOBAL OBJECT, section .data
            } else {
                (0, SHN_UNDEF, 0x10)
            };
            symtab.extend_from_slice(&name_off.to_le_bytes());
            symtab.push(st_info);
            symtab.push(0); // st_other
            symtab.extend_from_slice(&shndx.to_le_bytes());
            symtab.extend_from_slice(&u64::from(value).to_le_bytes());
            symtab.extend_from_slice(&0u64.to_le_bytes()); // st_size
        }
        (strtab, symtab)
    }

    fn write_rela(&self, w: &mut impl Write) -> io::Result<()> {
        for reloc in &self.relocs {
            let sym_index = self.symbol_order.iter().position(|&s| s == reloc.symbol)
                .map_or(0, |i| i + 1);
            w.write_u64::<LE>(u64::from(reloc.text_offset))?;
            let info = (u64::try_from(sym_index).unwrap() << 32) | u64::from(reloc.kind.elf_type());
            w.write_u64::<LE>(info)?;
            w.write_i64::<LE>(reloc.addend)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_section_headers(
        &self, w: &mut impl Write,
        text_off: u64, data_off: u64,
        rela_off: u64, rela_entries: u64,
        symtab_off: u64, symtab_size: u64,
        strtab_off: u64, strtab_size: u64,
        shstrtab_off: u64, shstrtab_size: u64,
    ) -> io::Result<()> {
        // name offsets into `.shstrtab` as laid out in `write_elf`
        let names = [0u32, 1, 7, 13, 24, 32, 40];
        write_section_header(w, names[0], SHT_NULL, 0, 0, 0, 0, 0, 0, 0)?;
        write_section_header(w, names[1], SHT_PROGBITS, 0x6, text_off, self.text.len() as u64, 0, 0, 16, 0)?;
        write_section_header(w, names[2], SHT_PROGBITS, 0x3, data_off, self.data.len() as u64, 0, 0, 8, 0)?;
        write_section_header(w, names[3], SHT_RELA, 0, rela_off, rela_entries * 24, 4, 1, 8, 24)?;
        write_section_header(w, names[4], SHT_SYMTAB, 0, symtab_off, symtab_size, 5, 1, 8, 24)?;
        write_section_header(w, names[5], SHT_STRTAB, 0, strtab_off, strtab_size, 0, 0, 1, 0)?;
        write_section_header(w, names[6], SHT_STRTAB, 0, shstrtab_off, shstrtab_size, 0, 0, 1, 0)
    }
}

/// Bridges to `encode::RelocSink` so `codegen.rs` can hand an `ElfWriter`
/// straight to `encode::encode` as its relocation collaborator, without
/// the encoder needing to know about sections, symtab order, or anything
/// else ELF-specific.
impl RelocSink for ElfWriter {
    fn add_reloc_text(&mut self, sym: SymbolId, kind: RelocKind, text_offset: u32, addend: i64) {
        self.relocs.push(Reloc { symbol: sym, kind, text_offset, addend });
    }

    fn text_displacement(&mut self, sym: SymbolId, field_offset: u32) -> i32 {
        match self.defined.get(&sym) {
            Some(&target) => i32::try_from(i64::from(target) - i64::from(field_offset)).expect("jump out of range"),
            None => 0,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_section_header(
    w: &mut impl Write, name: u32, ty: u32, flags: u64, offset: u64, size: u64,
    link: u32, info: u32, align: u64, entsize: u64,
) -> io::Result<()> {
    w.write_u32::<LE>(name)?;
    w.write_u32::<LE>(ty)?;
    w.write_u64::<LE>(flags)?;
    w.write_u64::<LE>(0)?; // sh_addr: unlinked object
    w.write_u64::<LE>(offset)?;
    w.write_u64::<LE>(size)?;
    w.write_u32::<LE>(link)?;
    w.write_u32::<LE>(info)?;
    w.write_u64::<LE>(align)?;
    w.write_u64::<LE>(entsize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symtab::{Linkage, SymbolKind, SymbolTable};

    #[test]
    fn written_object_starts_with_elf_magic_and_et_rel() {
        let mut tab = SymbolTable::new();
        let arena: &'static typed_arena::Arena<_> = Box::leak(Box::new(typed_arena::Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = crate::types::Types::new(arena, bump);
        let f = tab.add_ident(crate::symbol::intern("add"), SymbolKind::Definition, Linkage::Extern, types.int);
        let mut elf = ElfWriter::new();
        elf.define_text_symbol(f, "add");
        elf.push_text(&[0xC3]);
        let mut buf = Vec::new();
        elf.write_elf(&mut buf).unwrap();
        assert_eq!(&buf[0..4], b"\x7fELF");
        assert_eq!(buf[4], 2); // ELFCLASS64
        assert_eq!(u16::from_le_bytes([buf[16], buf[17]]), ET_REL);
    }

    #[test]
    fn forward_reference_relocation_resolves_to_zero_until_defined() {
        let mut tab = SymbolTable::new();
        let arena: &'static typed_arena::Arena<_> = Box::leak(Box::new(typed_arena::Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = crate::types::Types::new(arena, bump);
        let f = tab.add_ident(crate::symbol::intern("later"), SymbolKind::Definition, Linkage::Extern, types.int);
        let elf = ElfWriter::new();
        assert_eq!(elf.text_displacement(f, 0), 0);
    }

    #[test]
    fn relocation_records_text_offset_at_registration_time() {
        let mut tab = SymbolTable::new();
        let arena: &'static typed_arena::Arena<_> = Box::leak(Box::new(typed_arena::Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = crate::types::Types::new(arena, bump);
        let f = tab.add_ident(crate::symbol::intern("g"), SymbolKind::Definition, Linkage::Extern, types.int);
        let mut elf = ElfWriter::new();
        elf.push_text(&[0xE8, 0, 0, 0, 0]);
        elf.add_reloc_text(f, RelocKind::Pc32, 1, -4);
        assert_eq!(elf.relocs.len(), 1);
        assert_eq!(elf.relocs[0].text_offset, 1);
    }
}
