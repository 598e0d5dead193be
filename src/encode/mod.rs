//! The x86-64 instruction encoder (spec.md §4.7).
//!
//! Grounded directly on the teacher's `InstSink` in `src/codegen.rs`: a
//! small byte-buffer sink (`push_u8`/`push_u32`/`push_u64`/`set_rex`) that one
//! instruction writes itself into, with relocation bookkeeping
//! (`rip_relative_block`/`rip_relative_proc`) kept on the side rather than
//! folded into the byte-pushing calls. `Sink` below is that same shape,
//! generalized from "jump to a `BlockId`/`ProcId` in the same linked
//! object" to "register a relocation against a `SymbolId`, to be resolved
//! by the ELF collaborator" (spec.md §6).
//!
//! Per Design Note §9, this module follows the SDM rather than the
//! source's `sar`/`shr` opcode conflation or `not`'s unconditional-REX
//! stub for 8-bit operands.

use arrayvec::ArrayVec;

use crate::elf::RelocKind;
use crate::symtab::SymbolId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Width { W8, W16, W32, W64 }

impl Width {
    #[must_use] fn is_64(self) -> bool { self == Width::W64 }
    #[must_use] fn is_16(self) -> bool { self == Width::W16 }
}

/// The 16 general-purpose registers, `Rax`..`R15`, in encoding order (low
/// three bits plus the REX extension bit for `R8`-`R15`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[allow(clippy::upper_case_acronyms)]
pub enum Reg {
    Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi,
    R8, R9, R10, R11, R12, R13, R14, R15,
}

impl Reg {
    fn index(self) -> u8 { self as u8 }
    fn low3(self) -> u8 { self.index() & 0x7 }
    fn is_extended(self) -> bool { self.index() >= 8 }
    /// Whether this register's 8-bit form requires `REX` to address
    /// `SIL`/`DIL`/`BPL`/`SPL` instead of `AH`/`CH`/`DH`/`BH` (SDM §2.2.1.2;
    /// Design Note §9's instruction to follow the SDM here, not the
    /// source's unconditional-REX stub).
    fn needs_rex_for_8bit(self) -> bool { matches!(self, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi) }
}

/// A memory operand: either `base + disp`, or a symbol referenced
/// RIP-relative (spec.md §4.7 ModR/M rule).
#[derive(Clone, Copy, Debug)]
pub enum Mem {
    BaseDisp { base: Reg, disp: i32 },
    RipRelative { symbol: SymbolId },
}

#[derive(Clone, Copy, Debug)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    Mem(Mem),
    /// An immediate address (spec.md §4.7 `IMM_ADDR`): emits an
    /// `R_X86_64_32S` relocation in place of the immediate bytes.
    ImmAddr(SymbolId),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cond { E, Ne, L, Le, G, Ge }

impl Cond {
    /// The `0F 8x` condition-code nibble (SDM Vol.2 Table B-2).
    fn code(self) -> u8 {
        match self {
            Cond::E => 0x4, Cond::Ne => 0x5,
            Cond::L => 0xC, Cond::Ge => 0xD,
            Cond::Le => 0xE, Cond::G => 0xF,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mnemonic {
    Mov, Add, Sub, And, Or, Xor, Cmp, Test,
    Sar, Shr, Shl,
    Neg, Not,
    Lea,
    Push, Pop,
    Call, Ret,
    Jmp, Jcc(Cond),
    RepMovsq,
    MovapsLoad,
    /// Two-operand `imul r, r/m` (SDM `0F AF /r`), the multiply form this
    /// core needs: a fixed-register baseline codegen never has a spare
    /// `rdx:rax` pair to dedicate to the one-operand form.
    IMul,
    /// One-operand `idiv r/m` (`F7 /7`, or `F6 /7` at 8-bit width); divides
    /// `rdx:rax` by the operand, quotient in `rax`, remainder in `rdx`.
    /// Callers must sign-extend into `rdx` with `Cqo` first.
    IDiv,
    /// Sign-extend `rax`/`eax` into `rdx:rax`/`edx:eax` ahead of `IDiv`
    /// (`99`, `48 99` at 64-bit width).
    Cqo,
}

#[derive(Clone, Copy, Debug)]
pub struct Instruction {
    pub mnemonic: Mnemonic,
    pub width: Width,
    pub dst: Option<Operand>,
    pub src: Option<Operand>,
}

/// Collaborator the encoder registers relocations through (spec.md §6
/// "ELF writer", narrowed to the two operations the encoder itself needs).
pub trait RelocSink {
    fn add_reloc_text(&mut self, sym: SymbolId, kind: RelocKind, text_offset: u32, addend: i64);
    /// Signed 32-bit displacement from `field_offset` (text-relative) to
    /// `sym`'s text address, or `0` with a pending relocation recorded if
    /// `sym` is a forward reference not yet placed.
    fn text_displacement(&mut self, sym: SymbolId, field_offset: u32) -> i32;
}

/// One instruction's encoded bytes, mirroring the teacher's `InstSink.buf:
/// ArrayVec<u8, 15>` (spec.md §4.7: "length ≤ 16").
pub struct Code {
    buf: ArrayVec<u8, 16>,
}

impl Code {
    #[must_use] pub fn bytes(&self) -> &[u8] { &self.buf }
    fn push_u8(&mut self, n: u8) { self.buf.push(n) }
    fn push_i32(&mut self, n: i32) { self.buf.try_extend_from_slice(&n.to_le_bytes()).expect("instruction overflow") }
    fn push_i64(&mut self, n: i64) { self.buf.try_extend_from_slice(&n.to_le_bytes()).expect("instruction overflow") }
}

/// `encode(instr)` (spec.md §4.7): a pure function of its inputs except for
/// relocation registration through `sink`. `text_offset` is the position
/// in the text section this instruction's first byte will occupy, needed
/// both for jump-displacement math and for relocation bookkeeping (spec.md
/// §5: "relocations ... must record the current text offset at the moment
/// the four-byte placeholder is reserved").
pub fn encode(instr: &Instruction, text_offset: u32, sink: &mut dyn RelocSink) -> Code {
    let mut code = Code { buf: ArrayVec::new() };
    if instr.width.is_16() { code.push_u8(0x66) }

    match instr.mnemonic {
        Mnemonic::Ret => { code.push_u8(0xC3); return code }
        Mnemonic::RepMovsq => {
            code.push_u8(0xF3);
            code.push_u8(0x48);
            code.push_u8(0xA5);
            return code
        }
        _ => {}
    }

    match (instr.mnemonic, instr.dst, instr.src) {
        (Mnemonic::Mov, Some(Operand::Reg(dst)), Some(Operand::Imm(imm))) if instr.width.is_64() => {
            // `MOV r64, imm64` (teacher's testable scenario 6: `mov
            // $0x12345678, %rax` => `48 C7 C0 78 56 34 12`): this core
            // always takes the shorter sign-extended `C7 /0 imm32` form
            // when the immediate fits, matching the concrete example in
            // spec.md §8.
            if let Ok(imm32) = i32::try_from(imm) {
                emit_rex(&mut code, instr.width, false, false, dst.is_extended());
                code.push_u8(0xC7);
                emit_modrm_reg(&mut code, 0, dst);
                code.push_i32(imm32);
            } else {
                emit_rex(&mut code, instr.width, false, false, dst.is_extended());
                code.push_u8(0xB8 + dst.low3());
                code.push_i64(imm);
            }
        }
        (Mnemonic::Mov, Some(Operand::Reg(dst)), Some(Operand::Reg(src))) => {
            emit_rex(&mut code, instr.width, src.is_extended(), false, dst.is_extended());
            code.push_u8(0x89);
            emit_modrm_reg(&mut code, src.low3(), dst);
        }
        (Mnemonic::Mov, Some(Operand::Reg(dst)), Some(Operand::Mem(mem))) => {
            // `mov r, r/m` (`8B /r`): the load half of the stack-slot
            // shuttle every `Direct`/`Deref` operand goes through.
            emit_rex(&mut code, instr.width, dst.is_extended(), false, mem_base_extended(mem));
            code.push_u8(0x8B);
            emit_modrm_mem(&mut code, dst.low3(), mem, text_offset, sink);
        }
        (Mnemonic::Mov, Some(Operand::Mem(mem)), Some(Operand::Reg(src))) => {
            // `mov r/m, r` (`89 /r`): the store half.
            emit_rex(&mut code, instr.width, src.is_extended(), false, mem_base_extended(mem));
            code.push_u8(0x89);
            emit_modrm_mem(&mut code, src.low3(), mem, text_offset, sink);
        }
        (Mnemonic::IMul, Some(Operand::Reg(dst)), Some(Operand::Reg(src))) => {
            emit_rex(&mut code, instr.width, dst.is_extended(), false, src.is_extended());
            code.push_u8(0x0F);
            code.push_u8(0xAF);
            emit_modrm_reg(&mut code, dst.low3(), src);
        }
        (Mnemonic::IDiv, Some(Operand::Reg(src)), None) => {
            emit_rex(&mut code, instr.width, false, false, src.is_extended());
            code.push_u8(if instr.width == Width::W8 { 0xF6 } else { 0xF7 });
            emit_modrm_reg(&mut code, 7, src);
        }
        (Mnemonic::Cqo, None, None) => {
            if instr.width.is_64() { code.push_u8(0x48) }
            code.push_u8(0x99);
        }
        (Mnemonic::Lea, Some(Operand::Reg(dst)), Some(Operand::Mem(mem))) => {
            emit_rex(&mut code, instr.width, dst.is_extended(), false, mem_base_extended(mem));
            code.push_u8(0x8D);
            emit_modrm_mem(&mut code, dst.low3(), mem, text_offset, sink);
        }
        (Mnemonic::MovapsLoad, Some(Operand::Reg(dst)), Some(Operand::Mem(mem))) => {
            // `movaps xmm,m128` (spec.md §4.7): `0F 29 /r`, `reg = r-XMM0`.
            emit_rex_if_needed(&mut code, dst.is_extended(), mem_base_extended(mem));
            code.push_u8(0x0F);
            code.push_u8(0x29);
            emit_modrm_mem(&mut code, dst.low3(), mem, text_offset, sink);
        }
        (Mnemonic::Add | Mnemonic::Sub | Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Cmp,
            Some(Operand::Reg(dst)), Some(Operand::Reg(src))) => {
            emit_rex(&mut code, instr.width, src.is_extended(), false, dst.is_extended());
            code.push_u8(arith_opcode(instr.mnemonic));
            emit_modrm_reg(&mut code, src.low3(), dst);
        }
        (Mnemonic::Add | Mnemonic::Sub | Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Cmp,
            Some(Operand::Reg(dst)), Some(Operand::Imm(imm))) => {
            emit_rex(&mut code, instr.width, false, false, dst.is_extended());
            code.push_u8(if instr.width == Width::W8 { 0x80 } else { 0x81 });
            emit_modrm_reg(&mut code, arith_reg_field(instr.mnemonic), dst);
            let imm32 = i32::try_from(imm).expect("arith immediate does not fit in 32 bits");
            if instr.width == Width::W8 { code.push_u8(imm32 as i8 as u8) } else { code.push_i32(imm32) }
        }
        (Mnemonic::Neg, Some(Operand::Reg(dst)), None) => {
            emit_rex(&mut code, instr.width, false, false, dst.is_extended());
            code.push_u8(0xF7);
            emit_modrm_reg(&mut code, 3, dst);
        }
        (Mnemonic::Not, Some(Operand::Reg(dst)), None) => {
            // REX is forced only when the operand truly needs it: a
            // 64-bit width, an extended register, or (8-bit operand) one
            // of RSP/RBP/RSI/RDI needing SIL/DIL/BPL/SPL (Design Note §9).
            let force_rex = instr.width.is_64() || dst.is_extended()
                || (instr.width == Width::W8 && dst.needs_rex_for_8bit());
            if force_rex { emit_rex(&mut code, instr.width, false, false, dst.is_extended()) }
            code.push_u8(if instr.width == Width::W8 { 0xF6 } else { 0xF7 });
            emit_modrm_reg(&mut code, 2, dst);
        }
        (Mnemonic::Sar | Mnemonic::Shr | Mnemonic::Shl, Some(Operand::Reg(dst)), Some(Operand::Reg(Reg::Rcx))) => {
            // shift count must be `CL` (spec.md §4.7).
            emit_rex(&mut code, instr.width, false, false, dst.is_extended());
            code.push_u8(if instr.width == Width::W8 { 0xD2 } else { 0xD3 });
            let ext = match instr.mnemonic { Mnemonic::Shl => 4, Mnemonic::Shr => 5, Mnemonic::Sar => 7, _ => unreachable!() };
            emit_modrm_reg(&mut code, ext, dst);
        }
        (Mnemonic::Push, Some(Operand::Reg(r)), None) => {
            emit_rex_if_needed(&mut code, false, r.is_extended());
            code.push_u8(0x50 + r.low3());
        }
        (Mnemonic::Pop, Some(Operand::Reg(r)), None) => {
            emit_rex_if_needed(&mut code, false, r.is_extended());
            code.push_u8(0x58 + r.low3());
        }
        (Mnemonic::Call, Some(Operand::ImmAddr(sym)), None) => {
            code.push_u8(0xE8);
            let reloc_offset = text_offset + u32::try_from(code.buf.len()).unwrap();
            sink.add_reloc_text(sym, RelocKind::Pc32, reloc_offset, -4);
            code.push_i32(0);
        }
        (Mnemonic::Jmp | Mnemonic::Jcc(_), Some(Operand::ImmAddr(sym)), None) => {
            if let Mnemonic::Jcc(cond) = instr.mnemonic {
                code.push_u8(0x0F);
                code.push_u8(0x80 | cond.code());
            } else {
                code.push_u8(0xE9);
            }
            let field_offset = text_offset + u32::try_from(code.buf.len()).unwrap();
            let disp = sink.text_displacement(sym, field_offset) - 4;
            // Always registered, not only for not-yet-placed targets
            // (unlike `Call`'s hidden-pointer style relocation, an
            // intra-function branch's target may already be defined):
            // link-time resolution is out of scope (spec.md §1), so this
            // core never commits to its own best-effort displacement
            // being final and instead leaves every branch target for the
            // linker to confirm or patch, exactly as it already does for
            // calls.
            sink.add_reloc_text(sym, RelocKind::Pc32, field_offset, -4);
            code.push_i32(disp);
        }
        (mnemonic, dst, src) => panic!("encode: unsupported operand combination {mnemonic:?}({dst:?}, {src:?})"),
    }
    code
}

fn arith_opcode(m: Mnemonic) -> u8 {
    match m {
        Mnemonic::Add => 0x01, Mnemonic::Sub => 0x29, Mnemonic::And => 0x21,
        Mnemonic::Or => 0x09, Mnemonic::Xor => 0x31, Mnemonic::Cmp => 0x39,
        _ => unreachable!(),
    }
}

fn arith_reg_field(m: Mnemonic) -> u8 {
    match m {
        Mnemonic::Add => 0, Mnemonic::Sub => 5, Mnemonic::And => 4,
        Mnemonic::Or => 1, Mnemonic::Xor => 6, Mnemonic::Cmp => 7,
        _ => unreachable!(),
    }
}

fn mem_base_extended(mem: Mem) -> bool {
    match mem { Mem::BaseDisp { base, .. } => base.is_extended(), Mem::RipRelative { .. } => false }
}

/// `REX = 0x40 | W<<3 | R<<2 | X<<1 | B` (spec.md §4.7). Always emitted
/// when `width` is 64-bit or either register operand is extended.
fn emit_rex(code: &mut Code, width: Width, reg_ext: bool, index_ext: bool, base_ext: bool) {
    if width.is_64() || reg_ext || index_ext || base_ext {
        let rex = 0x40 | (u8::from(width.is_64()) << 3) | (u8::from(reg_ext) << 2)
            | (u8::from(index_ext) << 1) | u8::from(base_ext);
        code.push_u8(rex);
    }
}

fn emit_rex_if_needed(code: &mut Code, reg_ext: bool, base_ext: bool) {
    if reg_ext || base_ext {
        code.push_u8(0x40 | (u8::from(reg_ext) << 2) | u8::from(base_ext));
    }
}

/// `ModR/M` for a register destination: `mod=11`.
fn emit_modrm_reg(code: &mut Code, reg_field: u8, rm: Reg) {
    code.push_u8(0xC0 | (reg_field << 3) | rm.low3());
}

/// `ModR/M` for a memory operand (spec.md §4.7): RIP-relative when the
/// operand names an external symbol, else `base + disp` with `mod`
/// selected by whether the displacement is zero / fits a signed byte /
/// needs all 32 bits.
fn emit_modrm_mem(code: &mut Code, reg_field: u8, mem: Mem, text_offset: u32, sink: &mut dyn RelocSink) {
    match mem {
        Mem::RipRelative { symbol } => {
            code.push_u8((reg_field << 3) | 0b101);
            let field_offset = text_offset + u32::try_from(code.buf.len()).unwrap();
            sink.add_reloc_text(symbol, RelocKind::Pc32, field_offset, -4);
            code.push_i32(0);
        }
        Mem::BaseDisp { base, disp } => {
            if disp == 0 && base.low3() != 0b101 {
                code.push_u8((reg_field << 3) | base.low3());
            } else if let Ok(d8) = i8::try_from(disp) {
                code.push_u8(0x40 | (reg_field << 3) | base.low3());
                code.push_u8(d8 as u8);
            } else {
                code.push_u8(0x80 | (reg_field << 3) | base.low3());
                code.push_i32(disp);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRelocSink;
    impl RelocSink for NoRelocSink {
        fn add_reloc_text(&mut self, _sym: SymbolId, _kind: RelocKind, _off: u32, _addend: i64) {}
        fn text_displacement(&mut self, _sym: SymbolId, _off: u32) -> i32 { 0 }
    }

    #[test]
    fn mov_imm32_sign_extended_matches_spec_example() {
        let instr = Instruction {
            mnemonic: Mnemonic::Mov, width: Width::W64,
            dst: Some(Operand::Reg(Reg::Rax)), src: Some(Operand::Imm(0x1234_5678)),
        };
        let code = encode(&instr, 0, &mut NoRelocSink);
        assert_eq!(code.bytes(), &[0x48, 0xC7, 0xC0, 0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn ret_is_a_single_byte() {
        let instr = Instruction { mnemonic: Mnemonic::Ret, width: Width::W64, dst: None, src: None };
        assert_eq!(encode(&instr, 0, &mut NoRelocSink).bytes(), &[0xC3]);
    }

    #[test]
    fn rep_movsq_matches_spec_example() {
        let instr = Instruction { mnemonic: Mnemonic::RepMovsq, width: Width::W64, dst: None, src: None };
        assert_eq!(encode(&instr, 0, &mut NoRelocSink).bytes(), &[0xF3, 0x48, 0xA5]);
    }

    #[test]
    fn sar_and_shr_use_distinct_modrm_extensions() {
        let sar = Instruction {
            mnemonic: Mnemonic::Sar, width: Width::W32,
            dst: Some(Operand::Reg(Reg::Rax)), src: Some(Operand::Reg(Reg::Rcx)),
        };
        let shr = Instruction { mnemonic: Mnemonic::Shr, ..sar };
        let sar_bytes = encode(&sar, 0, &mut NoRelocSink);
        let shr_bytes = encode(&shr, 0, &mut NoRelocSink);
        assert_eq!(sar_bytes.bytes(), &[0xD3, 0xF8]);
        assert_eq!(shr_bytes.bytes(), &[0xD3, 0xE8]);
        assert_ne!(sar_bytes.bytes(), shr_bytes.bytes());
    }

    #[test]
    fn not_on_rsp_8bit_forces_rex_for_spl() {
        let instr = Instruction {
            mnemonic: Mnemonic::Not, width: Width::W8, dst: Some(Operand::Reg(Reg::Rsp)), src: None,
        };
        let code = encode(&instr, 0, &mut NoRelocSink);
        assert_eq!(code.bytes()[0] & 0xF0, 0x40);
    }

    #[test]
    fn encoding_is_deterministic() {
        let instr = Instruction {
            mnemonic: Mnemonic::Add, width: Width::W32,
            dst: Some(Operand::Reg(Reg::Rax)), src: Some(Operand::Reg(Reg::Rcx)),
        };
        let a = encode(&instr, 0, &mut NoRelocSink);
        let b = encode(&instr, 0, &mut NoRelocSink);
        assert_eq!(a.bytes(), b.bytes());
    }

    #[test]
    fn mov_round_trips_through_a_stack_slot() {
        let store = Instruction {
            mnemonic: Mnemonic::Mov, width: Width::W64,
            dst: Some(Operand::Mem(Mem::BaseDisp { base: Reg::Rbp, disp: -8 })),
            src: Some(Operand::Reg(Reg::Rax)),
        };
        let load = Instruction {
            mnemonic: Mnemonic::Mov, width: Width::W64,
            dst: Some(Operand::Reg(Reg::Rcx)),
            src: Some(Operand::Mem(Mem::BaseDisp { base: Reg::Rbp, disp: -8 })),
        };
        assert_eq!(encode(&store, 0, &mut NoRelocSink).bytes(), &[0x48, 0x89, 0x45, 0xF8]);
        assert_eq!(encode(&load, 0, &mut NoRelocSink).bytes(), &[0x48, 0x8B, 0x4D, 0xF8]);
    }

    #[test]
    fn cqo_sign_extends_rax_before_idiv() {
        let cqo = Instruction { mnemonic: Mnemonic::Cqo, width: Width::W64, dst: None, src: None };
        let idiv = Instruction {
            mnemonic: Mnemonic::IDiv, width: Width::W64,
            dst: Some(Operand::Reg(Reg::Rcx)), src: None,
        };
        assert_eq!(encode(&cqo, 0, &mut NoRelocSink).bytes(), &[0x48, 0x99]);
        assert_eq!(encode(&idiv, 0, &mut NoRelocSink).bytes(), &[0x48, 0xF7, 0xF9]);
    }

    #[test]
    fn imul_uses_the_two_operand_0f_af_form() {
        let instr = Instruction {
            mnemonic: Mnemonic::IMul, width: Width::W32,
            dst: Some(Operand::Reg(Reg::Rax)), src: Some(Operand::Reg(Reg::Rcx)),
        };
        assert_eq!(encode(&instr, 0, &mut NoRelocSink).bytes(), &[0x0F, 0xAF, 0xC1]);
    }
}
