//! Lowers one function's CFG into x86-64 instructions and writes them into
//! an `ElfWriter`'s text section: the missing link spec.md §5's pipeline
//! ("IR -> ABI-classify -> encode -> ELF object") needs between
//! `ir::Definition` and `encode::encode`, exercised end-to-end by
//! `src/bin/mmccc.rs`.
//!
//! No register allocator (spec.md §1 non-goal: "register allocation beyond
//! fixed ABI assignment"). Every symbol a definition's CFG touches gets its
//! own fixed stack slot below `rbp`, assigned in first-reference order —
//! the simplest frame layout that needs no liveness analysis, grounded on
//! the same "no optimization passes" posture spec.md §1 states for the
//! rest of this core. Every slot is a full eight bytes and every value is
//! shuttled through `rax`/`rcx`/`rdx` at 64-bit width regardless of its C
//! type's declared width: this core does not model narrow-width overflow
//! or truncation (correct for `int`/`long`/pointer arithmetic, a known
//! simplification for `char`/`short`, consistent with carrying no
//! optimizer or second codegen pass to clean it up later).

use hashbrown::HashMap;

use crate::abi::{self, Location};
use crate::idx::Idx;
use crate::elf::ElfWriter;
use crate::encode::{self, Cond, Instruction, Mem, Mnemonic, Operand, Reg};
use crate::ir::{BlockId, Definition, Opcode, Terminator, Var, VarKind};
use crate::symtab::{SymbolId, SymbolKind, SymbolTable};
use crate::types::{self, Type, TypeKind, Types};

const W64: encode::Width = encode::Width::W64;

fn abi_reg(r: abi::Reg) -> Reg {
    match r {
        abi::Reg::Ax => Reg::Rax,
        abi::Reg::Di => Reg::Rdi,
        abi::Reg::Si => Reg::Rsi,
        abi::Reg::Dx => Reg::Rdx,
        abi::Reg::Cx => Reg::Rcx,
        abi::Reg::R8 => Reg::R8,
        abi::Reg::R9 => Reg::R9,
    }
}

fn emit(elf: &mut ElfWriter, instr: Instruction) {
    let offset = elf.text_len();
    let code = encode::encode(&instr, offset, elf);
    elf.push_text(code.bytes());
}

fn mov_imm(reg: Reg, imm: i64) -> Instruction {
    Instruction { mnemonic: Mnemonic::Mov, width: W64, dst: Some(Operand::Reg(reg)), src: Some(Operand::Imm(imm)) }
}

fn mov_from_slot(reg: Reg, disp: i32) -> Instruction {
    Instruction { mnemonic: Mnemonic::Mov, width: W64, dst: Some(Operand::Reg(reg)), src: Some(Operand::Mem(Mem::BaseDisp { base: Reg::Rbp, disp })) }
}

fn mov_to_slot(disp: i32, reg: Reg) -> Instruction {
    Instruction { mnemonic: Mnemonic::Mov, width: W64, dst: Some(Operand::Mem(Mem::BaseDisp { base: Reg::Rbp, disp })), src: Some(Operand::Reg(reg)) }
}

fn mov_reg(dst: Reg, src: Reg) -> Instruction {
    Instruction { mnemonic: Mnemonic::Mov, width: W64, dst: Some(Operand::Reg(dst)), src: Some(Operand::Reg(src)) }
}

fn jmp_to(sym: SymbolId) -> Instruction {
    Instruction { mnemonic: Mnemonic::Jmp, width: W64, dst: Some(Operand::ImmAddr(sym)), src: None }
}

fn jcc_to(cond: Cond, sym: SymbolId) -> Instruction {
    Instruction { mnemonic: Mnemonic::Jcc(cond), width: W64, dst: Some(Operand::ImmAddr(sym)), src: None }
}

/// Whether `sym` names a value that lives in `.data` rather than on the
/// stack (spec.md §8 scenario 3): a string literal's bytes are placed once,
/// ahead of codegen, and every reference addresses them RIP-relative.
fn is_static_storage(symbols: &SymbolTable<'_>, sym: SymbolId) -> bool {
    symbols.get(sym).kind == SymbolKind::StringValue
}

/// Every symbol a definition's CFG references, mapped to a `rbp`-relative
/// stack slot in first-reference order (params, then each block's
/// operations and terminator in block-creation order).
struct Frame {
    slots: HashMap<SymbolId, i32>,
    size: i32,
}

impl Frame {
    fn build<'a>(def: &Definition<'a>, symbols: &SymbolTable<'a>) -> Self {
        let mut slots = HashMap::new();
        let mut size = 0i32;
        let mut note = |slots: &mut HashMap<SymbolId, i32>, size: &mut i32, sym: SymbolId| {
            if slots.contains_key(&sym) || is_static_storage(symbols, sym) { return }
            let slot_size = i32::try_from(types::size_of(symbols.get(sym).ty).max(8)).expect("frame too large");
            *size = (*size + slot_size + 7) & !7;
            slots.insert(sym, -*size);
        };
        for &p in &def.params { note(&mut slots, &mut size, p); }
        for (_, block) in def.blocks() {
            for op in block.ops() {
                if let Some(s) = op.target.symbol { note(&mut slots, &mut size, s); }
                if let Some(s) = op.lhs.symbol { note(&mut slots, &mut size, s); }
                if let Some(s) = op.rhs.and_then(|v| v.symbol) { note(&mut slots, &mut size, s); }
            }
            match block.terminator() {
                Terminator::Branch { cond, .. } => if let Some(s) = cond.symbol { note(&mut slots, &mut size, s); },
                Terminator::Return(v) => if let Some(s) = v.symbol { note(&mut slots, &mut size, s); },
                Terminator::Jump(_) | Terminator::ReturnVoid => {}
            }
        }
        Frame { slots, size: (size + 15) & !15 }
    }

    fn offset(&self, sym: SymbolId) -> i32 {
        *self.slots.get(&sym).expect("symbol was not seen while building the frame")
    }
}

fn load_into(elf: &mut ElfWriter, frame: &Frame, symbols: &SymbolTable<'_>, v: &Var<'_>, reg: Reg) {
    match v.kind {
        VarKind::Immediate => emit(elf, mov_imm(reg, v.imm)),
        VarKind::Direct => emit(elf, mov_from_slot(reg, frame.offset(v.symbol.expect("direct var has a symbol")))),
        VarKind::Deref => {
            emit(elf, mov_from_slot(reg, frame.offset(v.symbol.expect("deref var has a base symbol"))));
            let disp = i32::try_from(v.offset).expect("deref offset out of range");
            emit(elf, Instruction {
                mnemonic: Mnemonic::Mov, width: W64,
                dst: Some(Operand::Reg(reg)), src: Some(Operand::Mem(Mem::BaseDisp { base: reg, disp })),
            });
        }
        VarKind::Address => {
            let sym = v.symbol.expect("address var has a symbol");
            let mem = if is_static_storage(symbols, sym) {
                Mem::RipRelative { symbol: sym }
            } else {
                let disp = frame.offset(sym) + i32::try_from(v.offset).expect("address offset out of range");
                Mem::BaseDisp { base: Reg::Rbp, disp }
            };
            emit(elf, Instruction { mnemonic: Mnemonic::Lea, width: W64, dst: Some(Operand::Reg(reg)), src: Some(Operand::Mem(mem)) });
        }
    }
}

/// Store `reg` into `v`, an l-value target (`Direct` or `Deref`).
fn store_from(elf: &mut ElfWriter, frame: &Frame, v: &Var<'_>, reg: Reg) {
    match v.kind {
        VarKind::Direct => emit(elf, mov_to_slot(frame.offset(v.symbol.expect("direct var has a symbol")), reg)),
        VarKind::Deref => {
            let ptr_reg = if reg == Reg::Rdx { Reg::Rcx } else { Reg::Rdx };
            emit(elf, mov_from_slot(ptr_reg, frame.offset(v.symbol.expect("deref var has a base symbol"))));
            let disp = i32::try_from(v.offset).expect("deref offset out of range");
            emit(elf, Instruction {
                mnemonic: Mnemonic::Mov, width: W64,
                dst: Some(Operand::Mem(Mem::BaseDisp { base: ptr_reg, disp })), src: Some(Operand::Reg(reg)),
            });
        }
        VarKind::Immediate | VarKind::Address => unreachable!("not a valid store target"),
    }
}

fn arith_mnemonic(op: Opcode) -> Option<Mnemonic> {
    match op {
        Opcode::Add => Some(Mnemonic::Add),
        Opcode::Sub => Some(Mnemonic::Sub),
        Opcode::BitAnd => Some(Mnemonic::And),
        Opcode::BitOr => Some(Mnemonic::Or),
        Opcode::BitXor => Some(Mnemonic::Xor),
        _ => None,
    }
}

fn cmp_cond(op: Opcode) -> Option<Cond> {
    match op {
        Opcode::Eq => Some(Cond::E),
        Opcode::Ne => Some(Cond::Ne),
        Opcode::Lt => Some(Cond::L),
        Opcode::Le => Some(Cond::Le),
        Opcode::Gt => Some(Cond::G),
        Opcode::Ge => Some(Cond::Ge),
        _ => None,
    }
}

/// Lower every `Operation` in `block`, leaving `pending_args` threaded in
/// from (and out to) the caller: `Param` accumulates into it, `Call`
/// drains it, matching spec.md §3's "arguments having already been pushed
/// by preceding `Param` ops".
fn lower_block_ops<'a>(
    elf: &mut ElfWriter, frame: &Frame, symbols: &mut SymbolTable<'a>, types: &Types<'a>,
    ops: &[crate::ir::Operation<'a>], pending_args: &mut Vec<Var<'a>>,
) {
    for operation in ops {
        match operation.opcode {
            Opcode::Param => pending_args.push(operation.lhs),
            Opcode::Call => {
                let args: Vec<Var<'a>> = pending_args.drain(..).collect();
                let ret = if matches!(operation.target.ty.kind, TypeKind::Void) { None } else { Some(operation.target.ty) };
                let arg_types: Vec<Type<'a>> = args.iter().map(|v| v.ty).collect();
                let classification = abi::classify_call(&arg_types, ret);
                for (arg, loc) in args.iter().zip(&classification.args) {
                    match loc {
                        Location::Integer(regs) if !regs.is_empty() => load_into(elf, frame, symbols, arg, abi_reg(regs[0])),
                        _ => log::warn!("call argument classified as {loc:?}; this core only moves the first integer eightbyte"),
                    }
                }
                let callee = operation.lhs.symbol.expect("call target names the callee symbol");
                emit(elf, Instruction { mnemonic: Mnemonic::Call, width: W64, dst: Some(Operand::ImmAddr(callee)), src: None });
                if ret.is_some() { store_from(elf, frame, &operation.target, Reg::Rax) }
            }
            Opcode::Load | Opcode::Store | Opcode::Addr | Opcode::Convert => {
                // `Convert` tracks no sub-64-bit width (module doc comment),
                // so it lowers to the same plain value copy as `Load`/`Store`/
                // `Addr`: the kind distinction already lives in how `lhs`
                // and `target` were built as `Var`s (Direct/Deref/Address).
                load_into(elf, frame, symbols, &operation.lhs, Reg::Rax);
                store_from(elf, frame, &operation.target, Reg::Rax);
            }
            Opcode::Neg | Opcode::BitNot => {
                load_into(elf, frame, symbols, &operation.lhs, Reg::Rax);
                let mnemonic = if operation.opcode == Opcode::Neg { Mnemonic::Neg } else { Mnemonic::Not };
                emit(elf, Instruction { mnemonic, width: W64, dst: Some(Operand::Reg(Reg::Rax)), src: None });
                store_from(elf, frame, &operation.target, Reg::Rax);
            }
            Opcode::Shl | Opcode::Shr => {
                load_into(elf, frame, symbols, &operation.lhs, Reg::Rax);
                load_into(elf, frame, symbols, &operation.rhs.expect("shift has a count operand"), Reg::Rcx);
                let mnemonic = match operation.opcode {
                    Opcode::Shl => Mnemonic::Shl,
                    // The encoder deliberately keeps `Sar`/`Shr` distinct
                    // (its own doc comment); pick the signed form by the
                    // shifted value's type rather than conflating them.
                    Opcode::Shr if types::is_signed(operation.lhs.ty) => Mnemonic::Sar,
                    Opcode::Shr => Mnemonic::Shr,
                    _ => unreachable!(),
                };
                emit(elf, Instruction { mnemonic, width: W64, dst: Some(Operand::Reg(Reg::Rax)), src: Some(Operand::Reg(Reg::Rcx)) });
                store_from(elf, frame, &operation.target, Reg::Rax);
            }
            Opcode::Mul => {
                load_into(elf, frame, symbols, &operation.lhs, Reg::Rax);
                load_into(elf, frame, symbols, &operation.rhs.expect("mul has a second operand"), Reg::Rcx);
                emit(elf, Instruction { mnemonic: Mnemonic::IMul, width: W64, dst: Some(Operand::Reg(Reg::Rax)), src: Some(Operand::Reg(Reg::Rcx)) });
                store_from(elf, frame, &operation.target, Reg::Rax);
            }
            Opcode::Div | Opcode::Mod => {
                load_into(elf, frame, symbols, &operation.lhs, Reg::Rax);
                load_into(elf, frame, symbols, &operation.rhs.expect("div/mod has a divisor operand"), Reg::Rcx);
                emit(elf, Instruction { mnemonic: Mnemonic::Cqo, width: W64, dst: None, src: None });
                emit(elf, Instruction { mnemonic: Mnemonic::IDiv, width: W64, dst: Some(Operand::Reg(Reg::Rcx)), src: None });
                let result = if operation.opcode == Opcode::Div { Reg::Rax } else { Reg::Rdx };
                store_from(elf, frame, &operation.target, result);
            }
            code if arith_mnemonic(code).is_some() => {
                lower_binary_arith(elf, frame, symbols, operation, arith_mnemonic(code).unwrap());
            }
            code if cmp_cond(code).is_some() => {
                lower_comparison(elf, frame, operation, symbols, types, cmp_cond(code).unwrap());
            }
            _ => unreachable!("every Opcode variant is handled above"),
        }
    }
}

fn lower_binary_arith<'a>(elf: &mut ElfWriter, frame: &Frame, symbols: &SymbolTable<'a>, op: &crate::ir::Operation<'a>, mnemonic: Mnemonic) {
    load_into(elf, frame, symbols, &op.lhs, Reg::Rax);
    load_into(elf, frame, symbols, &op.rhs.expect("binary op has a second operand"), Reg::Rcx);
    emit(elf, Instruction { mnemonic, width: W64, dst: Some(Operand::Reg(Reg::Rax)), src: Some(Operand::Reg(Reg::Rcx)) });
    store_from(elf, frame, &op.target, Reg::Rax);
}

/// A comparison materializes a 0/1 result (spec.md §3: "comparisons
/// (producing 0/1)"). No `setcc` mnemonic exists in this core's encoder
/// (spec.md §4.7's testable scenarios never named one), so the result is
/// built with a short conditional-branch sequence instead.
fn lower_comparison<'a>(
    elf: &mut ElfWriter, frame: &Frame, op: &crate::ir::Operation<'a>,
    symbols: &mut SymbolTable<'a>, types: &Types<'a>, cond: Cond,
) {
    load_into(elf, frame, symbols, &op.lhs, Reg::Rax);
    load_into(elf, frame, symbols, &op.rhs.expect("comparison has a second operand"), Reg::Rcx);
    emit(elf, Instruction { mnemonic: Mnemonic::Cmp, width: W64, dst: Some(Operand::Reg(Reg::Rax)), src: Some(Operand::Reg(Reg::Rcx)) });
    let true_label = symbols.create_label(types.void);
    let end_label = symbols.create_label(types.void);
    emit(elf, jcc_to(cond, true_label));
    emit(elf, mov_imm(Reg::Rax, 0));
    emit(elf, jmp_to(end_label));
    elf.define_text_symbol(true_label, format!(".L{}", true_label.into_usize()));
    emit(elf, mov_imm(Reg::Rax, 1));
    elf.define_text_symbol(end_label, format!(".L{}", end_label.into_usize()));
    store_from(elf, frame, &op.target, Reg::Rax);
}

fn block_label<'a>(symbols: &mut SymbolTable<'a>, types: &Types<'a>) -> SymbolId {
    symbols.create_label(types.void)
}

/// Lower `def`'s whole CFG into `elf.text`, under the external name
/// `name`. The prologue reserves the frame computed by [`Frame::build`]
/// and copies each incoming argument out of its ABI register into its
/// slot; the epilogue restores `rsp`/`rbp` before every `ret`.
pub fn lower_definition<'a>(
    def: &Definition<'a>, symbols: &mut SymbolTable<'a>, types: &Types<'a>, elf: &mut ElfWriter, name: &str,
) {
    log::debug!("codegen: lowering {name}");
    if def.is_object() {
        // A file-scope object has no CFG to lower; its storage lives in
        // `.data`/`.bss`, written by the caller from its initializer
        // rather than through this function.
        return
    }
    let frame = Frame::build(def, symbols);
    let param_types: Vec<Type<'a>> = def.params.iter().map(|&p| symbols.get(p).ty).collect();
    let ret_ty = match &symbols.get(def.symbol).ty.kind {
        TypeKind::Function { ret, .. } if !matches!(ret.kind, TypeKind::Void) => Some(*ret),
        _ => None,
    };
    let classification = abi::classify_call(&param_types, ret_ty);

    let mut labels: HashMap<BlockId, SymbolId> = HashMap::new();
    for (id, _) in def.blocks() { labels.insert(id, block_label(symbols, types)); }

    elf.define_text_symbol(def.symbol, name.to_string());
    emit(elf, Instruction { mnemonic: Mnemonic::Push, width: W64, dst: Some(Operand::Reg(Reg::Rbp)), src: None });
    emit(elf, mov_reg(Reg::Rbp, Reg::Rsp));
    if frame.size > 0 {
        emit(elf, Instruction {
            mnemonic: Mnemonic::Sub, width: W64,
            dst: Some(Operand::Reg(Reg::Rsp)), src: Some(Operand::Imm(i64::from(frame.size))),
        });
    }
    for (i, &param) in def.params.iter().enumerate() {
        match &classification.args[i] {
            Location::Integer(regs) if !regs.is_empty() => emit(elf, mov_to_slot(frame.offset(param), abi_reg(regs[0]))),
            loc => log::warn!("parameter {i} of {name} classified as {loc:?}; this core only loads the first integer eightbyte"),
        }
    }

    for (id, block) in def.blocks() {
        elf.define_text_symbol(labels[&id], format!(".{name}.b{}", id.into_usize()));
        let mut pending_args = Vec::new();
        lower_block_ops(elf, &frame, symbols, types, block.ops(), &mut pending_args);
        match block.terminator() {
            Terminator::Jump(target) => emit(elf, jmp_to(labels[target])),
            Terminator::Branch { cond, then_blk, else_blk } => {
                load_into(elf, &frame, symbols, cond, Reg::Rax);
                emit(elf, Instruction { mnemonic: Mnemonic::Cmp, width: W64, dst: Some(Operand::Reg(Reg::Rax)), src: Some(Operand::Imm(0)) });
                emit(elf, jcc_to(Cond::Ne, labels[then_blk]));
                emit(elf, jmp_to(labels[else_blk]));
            }
            Terminator::Return(v) => {
                load_into(elf, &frame, symbols, v, Reg::Rax);
                emit_epilogue(elf);
            }
            Terminator::ReturnVoid => emit_epilogue(elf),
        }
    }
}

fn emit_epilogue(elf: &mut ElfWriter) {
    emit(elf, mov_reg(Reg::Rsp, Reg::Rbp));
    emit(elf, Instruction { mnemonic: Mnemonic::Pop, width: W64, dst: Some(Operand::Reg(Reg::Rbp)), src: None });
    emit(elf, Instruction { mnemonic: Mnemonic::Ret, width: W64, dst: None, src: None });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Cfg, Var};
    use crate::symtab::{Linkage, SymbolKind};
    use typed_arena::Arena;

    fn setup<'a>(arena: &'a Arena<crate::types::TypeNode<'a>>, bump: &'a bumpalo::Bump) -> (Types<'a>, SymbolTable<'a>) {
        (Types::new(arena, bump), SymbolTable::new())
    }

    #[test]
    fn returning_a_constant_produces_a_ret_terminated_function() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let (types, mut tab) = setup(arena, bump);
        let f = tab.add_ident(crate::symbol::intern("answer"), SymbolKind::Definition, Linkage::Extern, types.int);
        let mut def = Definition::new(f);
        let mut cfg = Cfg::new(&mut def);
        let entry = cfg.new_block();
        cfg.terminate(entry, Terminator::Return(Var::immediate(types.int, 42)));
        let mut elf = ElfWriter::new();
        lower_definition(&def, &mut tab, &types, &mut elf, "answer");
        assert!(elf.text.last() == Some(&0xC3));
        assert!(elf.text.contains(&0x55)); // push rbp
    }

    #[test]
    fn add_of_two_locals_stores_the_result_back() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let (types, mut tab) = setup(arena, bump);
        let f = tab.add_ident(crate::symbol::intern("add"), SymbolKind::Definition, Linkage::Extern, types.int);
        let a = tab.add_ident(crate::symbol::intern("a"), SymbolKind::Definition, Linkage::None, types.int);
        let b = tab.add_ident(crate::symbol::intern("b"), SymbolKind::Definition, Linkage::None, types.int);
        let mut def = Definition::new(f);
        def.params.push(a);
        def.params.push(b);
        let mut cfg = Cfg::new(&mut def);
        let entry = cfg.new_block();
        let target = Var::direct(types.int, a, true);
        cfg.push_op(entry, crate::ir::Operation {
            target, opcode: Opcode::Add, lhs: Var::direct(types.int, a, false), rhs: Some(Var::direct(types.int, b, false)),
        });
        cfg.terminate(entry, Terminator::Return(target));
        let mut elf = ElfWriter::new();
        lower_definition(&def, &mut tab, &types, &mut elf, "add");
        assert!(!elf.text.is_empty());
        assert_eq!(*elf.text.last().unwrap(), 0xC3);
    }

    #[test]
    fn an_object_definition_emits_no_code() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let (types, mut tab) = setup(arena, bump);
        let g = tab.add_ident(crate::symbol::intern("g"), SymbolKind::Definition, Linkage::Extern, types.int);
        let def = Definition::new(g);
        let mut elf = ElfWriter::new();
        lower_definition(&def, &mut tab, &types, &mut elf, "g");
        assert!(elf.text.is_empty());
    }
}
