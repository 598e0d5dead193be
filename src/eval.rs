//! The expression evaluator (spec.md §4.3).
//!
//! Grounded on spec.md §4.3's bullet list directly; the recursive,
//! match-on-expression-shape structure follows the teacher's
//! `Translate`/`TranslateBase` style in `build_mir.rs`, which likewise
//! recurses over an expression tree emitting IR ops into a "current
//! block" threaded through the call chain. Nested-option matching (e.g.
//! "is this var already an immediate of the right shape") uses `if_chain`
//! the way the teacher's own code reaches for it rather than deeply
//! nested `if let`.

use if_chain::if_chain;

use crate::diag::{self, Diagnostic};
use crate::ir::{BlockId, Cfg, Opcode, Operation, Terminator, Var};
use crate::symtab::{SymbolId, SymbolTable};
use crate::token::{TokenKind, TokenStream};
use crate::types::{self, Type, TypeKind, Types};

/// The expression grammar this evaluator walks. Parsing C89's token
/// stream into this tree is the declaration/statement parsers' job
/// (spec.md §4.4/§4.5 "drive expression evaluation"); this module only
/// ever consumes an already-built `Expr`.
#[derive(Clone, Debug)]
pub enum Expr<'a> {
    IntLiteral(i64, Type<'a>),
    StringLiteral(SymbolId, Type<'a>),
    Ident(SymbolId, Type<'a>),
    Unary { op: UnaryOp, expr: Box<Expr<'a>> },
    Binary { op: BinOp, lhs: Box<Expr<'a>>, rhs: Box<Expr<'a>> },
    Assign { target: Box<Expr<'a>>, value: Box<Expr<'a>> },
    LogicalAnd(Box<Expr<'a>>, Box<Expr<'a>>),
    LogicalOr(Box<Expr<'a>>, Box<Expr<'a>>),
    Conditional { cond: Box<Expr<'a>>, then: Box<Expr<'a>>, else_: Box<Expr<'a>> },
    Call { func: SymbolId, ret: Type<'a>, args: Vec<Expr<'a>> },
    Index { base: Box<Expr<'a>>, index: Box<Expr<'a>> },
    Member { base: Box<Expr<'a>>, name: SymbolName, arrow: bool },
    /// An already-resolved l-value, never produced by the parser: the
    /// declaration parser's initializer handling synthesizes one to
    /// reuse `eval_assign` for each aggregate-initializer leaf it visits.
    Place(Var<'a>),
}

/// A struct/union member name, kept distinct from [`SymbolId`] — it names
/// a field in a type's member list, not a binding in the symbol table.
pub type SymbolName = crate::symbol::Symbol;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnaryOp { Neg, BitNot, Not, Addr, Deref }

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinOp {
    Add, Sub, Mul, Div, Mod,
    BitAnd, BitOr, BitXor, Shl, Shr,
    Eq, Ne, Lt, Le, Gt, Ge,
}

impl BinOp {
    fn opcode(self) -> Opcode {
        match self {
            BinOp::Add => Opcode::Add, BinOp::Sub => Opcode::Sub, BinOp::Mul => Opcode::Mul,
            BinOp::Div => Opcode::Div, BinOp::Mod => Opcode::Mod,
            BinOp::BitAnd => Opcode::BitAnd, BinOp::BitOr => Opcode::BitOr, BinOp::BitXor => Opcode::BitXor,
            BinOp::Shl => Opcode::Shl, BinOp::Shr => Opcode::Shr,
            BinOp::Eq => Opcode::Eq, BinOp::Ne => Opcode::Ne,
            BinOp::Lt => Opcode::Lt, BinOp::Le => Opcode::Le, BinOp::Gt => Opcode::Gt, BinOp::Ge => Opcode::Ge,
        }
    }

    fn is_comparison(self) -> bool {
        matches!(self, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
    }

    /// Constant folding (spec.md §4.3): both sides immediate, no IR op
    /// emitted. Division/modulo by a folded-zero divisor falls back to
    /// zero rather than panicking the compiler itself — the division is
    /// still undefined behavior in the compiled program, but a constant
    /// expression containing it must not crash the compiler evaluating it.
    pub(crate) fn fold(self, a: i64, b: i64) -> i64 {
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => if b == 0 { 0 } else { a.wrapping_div(b) },
            BinOp::Mod => if b == 0 { 0 } else { a.wrapping_rem(b) },
            BinOp::BitAnd => a & b, BinOp::BitOr => a | b, BinOp::BitXor => a ^ b,
            BinOp::Shl => a.wrapping_shl(b as u32), BinOp::Shr => a.wrapping_shr(b as u32),
            BinOp::Eq => i64::from(a == b), BinOp::Ne => i64::from(a != b),
            BinOp::Lt => i64::from(a < b), BinOp::Le => i64::from(a <= b),
            BinOp::Gt => i64::from(a > b), BinOp::Ge => i64::from(a >= b),
        }
    }
}

/// One step of evaluation: the resulting value plus the block execution
/// continues in (short-circuit operators and `?:` leave the caller in a
/// freshly spliced merge block, not the block evaluation started in).
pub struct Evaluated<'a> {
    pub value: Var<'a>,
    pub block: BlockId,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VaListField { GpOffset, FpOffset, OverflowArgArea, RegSaveArea }

/// `eval` dispatches on `Expr` shape exactly as spec.md §4.3 describes
/// each operator's contract.
pub struct Evaluator<'types, 'a> {
    pub types: &'types Types<'a>,
}

impl<'types, 'a> Evaluator<'types, 'a> {
    #[must_use] pub fn new(types: &'types Types<'a>) -> Self { Evaluator { types } }

    pub fn eval(
        &self, symbols: &mut crate::symtab::SymbolTable<'a>, cfg: &mut Cfg<'_, 'a>,
        block: BlockId, expr: &Expr<'a>,
    ) -> Evaluated<'a> {
        match expr {
            Expr::IntLiteral(v, ty) => Evaluated { value: Var::immediate(*ty, *v), block },
            Expr::StringLiteral(sym, ty) => {
                // Decays exactly like `Expr::Ident` (spec.md §4.3 array
                // decay): a string literal's type is always an array, so
                // this always yields the address of its first byte.
                let decayed = self.decay_array(*ty);
                if std::ptr::eq(decayed, *ty) {
                    Evaluated { value: Var::direct(*ty, *sym, false), block }
                } else {
                    Evaluated { value: Var::address(decayed, *sym, 0), block }
                }
            }
            Expr::Ident(sym, ty) => {
                let decayed = self.decay_array(*ty);
                if std::ptr::eq(decayed, *ty) {
                    Evaluated { value: Var::direct(*ty, *sym, true), block }
                } else {
                    Evaluated { value: Var::address(decayed, *sym, 0), block }
                }
            }
            Expr::Unary { op, expr } => self.eval_unary(symbols, cfg, block, *op, expr),
            Expr::Binary { op, lhs, rhs } => self.eval_binary(symbols, cfg, block, *op, lhs, rhs),
            Expr::Assign { target, value } => {
                let t = self.eval(symbols, cfg, block, target);
                let v = self.eval(symbols, cfg, t.block, value);
                let result = self.eval_assign(symbols, cfg, v.block, t.value, v.value);
                Evaluated { value: result, block: v.block }
            }
            Expr::LogicalAnd(lhs, rhs) => self.eval_logical(symbols, cfg, block, true, lhs, rhs),
            Expr::LogicalOr(lhs, rhs) => self.eval_logical(symbols, cfg, block, false, lhs, rhs),
            Expr::Conditional { cond, then, else_ } => self.eval_conditional(symbols, cfg, block, cond, then, else_),
            Expr::Call { func, ret, args } => self.eval_call(symbols, cfg, block, *func, *ret, args),
            Expr::Index { base, index } => self.eval_index(symbols, cfg, block, base, index),
            Expr::Member { base, name, arrow } => self.eval_member(symbols, cfg, block, base, *name, *arrow),
            Expr::Place(v) => Evaluated { value: *v, block },
        }
    }

    /// Array decay (spec.md §4.3): an array-typed r-value decays to
    /// pointer-to-element.
    fn decay_array(&self, ty: Type<'a>) -> Type<'a> {
        match &types::unwrapped(ty).kind {
            TypeKind::Array { elem, .. } => self.types.pointer(*elem),
            _ => ty,
        }
    }

    /// l-to-r-value conversion (spec.md §4.3): materialize a load unless
    /// the value is already an r-value. `pub(crate)` so the statement
    /// parser can convert an `if`/`while`/`for`/`do` condition's evaluated
    /// value into the plain r-value `Terminator::Branch` expects.
    pub(crate) fn rvalue(&self, symbols: &mut crate::symtab::SymbolTable<'a>, cfg: &mut Cfg<'_, 'a>, block: BlockId, v: Var<'a>) -> Var<'a> {
        if !v.lvalue { return v }
        let decayed = self.decay_array(v.ty);
        let tmp = symbols.create_tmp(decayed);
        let target = Var::direct(decayed, tmp, false);
        cfg.push_op(block, Operation { target, opcode: Opcode::Load, lhs: v, rhs: None });
        target
    }

    fn eval_unary(
        &self, symbols: &mut crate::symtab::SymbolTable<'a>, cfg: &mut Cfg<'_, 'a>,
        block: BlockId, op: UnaryOp, expr: &Expr<'a>,
    ) -> Evaluated<'a> {
        let operand = self.eval(symbols, cfg, block, expr);
        match op {
            UnaryOp::Addr => {
                // `eval_addr` (spec.md §4.3): requires an l-value.
                assert!(operand.value.lvalue, "address-of requires an l-value");
                let sym = operand.value.symbol.expect("l-value carries a symbol");
                let ptr_ty = self.types.pointer(operand.value.ty);
                let value = Var::address(ptr_ty, sym, operand.value.offset);
                Evaluated { value, block: operand.block }
            }
            UnaryOp::Deref => {
                // `eval_deref` (spec.md §4.3): requires pointer-typed,
                // yields an l-value of the pointee.
                let v = self.rvalue(symbols, cfg, operand.block, operand.value);
                let pointee = match &v.ty.kind {
                    TypeKind::Pointer(p) => *p,
                    _ => panic!("deref of non-pointer type"),
                };
                let sym = v.symbol.expect("deref operand must carry a pointer-holding symbol");
                Evaluated { value: Var::deref(pointee, sym, v.offset), block: operand.block }
            }
            UnaryOp::Neg | UnaryOp::BitNot | UnaryOp::Not => {
                let v = self.rvalue(symbols, cfg, operand.block, operand.value);
                if v.is_immediate() {
                    let folded = match op {
                        UnaryOp::Neg => v.imm.wrapping_neg(),
                        UnaryOp::BitNot => !v.imm,
                        UnaryOp::Not => i64::from(v.imm == 0),
                        UnaryOp::Addr | UnaryOp::Deref => unreachable!(),
                    };
                    let result_ty = if op == UnaryOp::Not { self.types.int } else { v.ty };
                    return Evaluated { value: Var::immediate(result_ty, folded), block: operand.block };
                }
                if op == UnaryOp::Not {
                    let target = Var::direct(self.types.int, symbols.create_tmp(self.types.int), false);
                    cfg.push_op(operand.block, Operation { target, opcode: Opcode::Eq, lhs: v, rhs: Some(Var::immediate(v.ty, 0)) });
                    return Evaluated { value: target, block: operand.block };
                }
                let target = Var::direct(v.ty, symbols.create_tmp(v.ty), false);
                let opcode = if op == UnaryOp::Neg { Opcode::Neg } else { Opcode::BitNot };
                cfg.push_op(operand.block, Operation { target, opcode, lhs: v, rhs: None });
                Evaluated { value: target, block: operand.block }
            }
        }
    }

    fn eval_binary(
        &self, symbols: &mut crate::symtab::SymbolTable<'a>, cfg: &mut Cfg<'_, 'a>,
        block: BlockId, op: BinOp, lhs: &Expr<'a>, rhs: &Expr<'a>,
    ) -> Evaluated<'a> {
        let l = self.eval(symbols, cfg, block, lhs);
        let l_val = self.rvalue(symbols, cfg, l.block, l.value);
        let r = self.eval(symbols, cfg, l.block, rhs);
        let r_val = self.rvalue(symbols, cfg, r.block, r.value);

        let conv_ty = types::usual_arithmetic_conversion(self.types, l_val.ty, r_val.ty);
        let l_conv = self.convert(symbols, cfg, r.block, l_val, conv_ty);
        let r_conv = self.convert(symbols, cfg, r.block, r_val, conv_ty);

        if_chain! {
            if l_conv.is_immediate();
            if r_conv.is_immediate();
            then {
                let result_ty = if op.is_comparison() { self.types.int } else { conv_ty };
                let folded = op.fold(l_conv.imm, r_conv.imm);
                return Evaluated { value: Var::immediate(result_ty, folded), block: r.block };
            }
        }

        let result_ty = if op.is_comparison() { self.types.int } else { conv_ty };
        let tmp = symbols.create_tmp(result_ty);
        let target = Var::direct(result_ty, tmp, false);
        cfg.push_op(r.block, Operation { target, opcode: op.opcode(), lhs: l_conv, rhs: Some(r_conv) });
        Evaluated { value: target, block: r.block }
    }

    /// Convert `v` to `ty`: a re-tag when `v` is already an immediate,
    /// otherwise an explicit `Convert` op (truncation/extension, sign or
    /// zero per the target's signedness).
    fn convert(&self, symbols: &mut crate::symtab::SymbolTable<'a>, cfg: &mut Cfg<'_, 'a>, block: BlockId, v: Var<'a>, ty: Type<'a>) -> Var<'a> {
        if types::type_equal(v.ty, ty) { return v }
        if v.is_immediate() { return Var::immediate(ty, v.imm) }
        let tmp = symbols.create_tmp(ty);
        let target = Var::direct(ty, tmp, false);
        cfg.push_op(block, Operation { target, opcode: Opcode::Convert, lhs: v, rhs: None });
        target
    }

    /// `eval_assign(block, target, source)` (spec.md §4.3).
    fn eval_assign(&self, symbols: &mut crate::symtab::SymbolTable<'a>, cfg: &mut Cfg<'_, 'a>, block: BlockId, target: Var<'a>, source: Var<'a>) -> Var<'a> {
        assert!(target.lvalue, "assignment target must be an l-value");
        let source = self.rvalue(symbols, cfg, block, source);
        let converted = self.convert(symbols, cfg, block, source, target.ty);
        cfg.push_op(block, Operation { target, opcode: Opcode::Store, lhs: converted, rhs: None });
        let mut result = converted;
        result.lvalue = false;
        result
    }

    /// `&&`/`||` (spec.md §4.3): short-circuit by splicing the CFG. The
    /// left operand's block branches into either the right sub-graph or a
    /// constant-result block; both sides converge at a fresh merge block
    /// whose value is the 0/1 `int` result.
    fn eval_logical(
        &self, symbols: &mut crate::symtab::SymbolTable<'a>, cfg: &mut Cfg<'_, 'a>,
        block: BlockId, is_and: bool, lhs: &Expr<'a>, rhs: &Expr<'a>,
    ) -> Evaluated<'a> {
        let l = self.eval(symbols, cfg, block, lhs);
        let l_val = self.rvalue(symbols, cfg, l.block, l.value);

        let rhs_block = cfg.new_block();
        let short_block = cfg.new_block();
        let merge = cfg.new_block();
        let (then_blk, else_blk) = if is_and { (rhs_block, short_block) } else { (short_block, rhs_block) };
        cfg.terminate(l.block, Terminator::Branch { cond: l_val, then_blk, else_blk });

        let tmp = symbols.create_tmp(self.types.int);

        let r = self.eval(symbols, cfg, rhs_block, rhs);
        let r_val = self.rvalue(symbols, cfg, r.block, r.value);
        let r_bool = self.to_bool(symbols, cfg, r.block, r_val);
        cfg.push_op(r.block, Operation { target: Var::direct(self.types.int, tmp, false), opcode: Opcode::Convert, lhs: r_bool, rhs: None });
        cfg.terminate(r.block, Terminator::Jump(merge));

        let short_value = Var::immediate(self.types.int, i64::from(!is_and));
        cfg.push_op(short_block, Operation { target: Var::direct(self.types.int, tmp, false), opcode: Opcode::Convert, lhs: short_value, rhs: None });
        cfg.terminate(short_block, Terminator::Jump(merge));

        Evaluated { value: Var::direct(self.types.int, tmp, false), block: merge }
    }

    fn to_bool(&self, symbols: &mut crate::symtab::SymbolTable<'a>, cfg: &mut Cfg<'_, 'a>, block: BlockId, v: Var<'a>) -> Var<'a> {
        if v.is_immediate() { return Var::immediate(self.types.int, i64::from(v.imm != 0)) }
        let tmp = symbols.create_tmp(self.types.int);
        let target = Var::direct(self.types.int, tmp, false);
        cfg.push_op(block, Operation { target, opcode: Opcode::Ne, lhs: v, rhs: Some(Var::immediate(v.ty, 0)) });
        target
    }

    /// `?:` (spec.md §4.3): both arms fall through to a common merge
    /// block whose value is the converted result.
    fn eval_conditional(
        &self, symbols: &mut crate::symtab::SymbolTable<'a>, cfg: &mut Cfg<'_, 'a>,
        block: BlockId, cond: &Expr<'a>, then: &Expr<'a>, else_: &Expr<'a>,
    ) -> Evaluated<'a> {
        let c = self.eval(symbols, cfg, block, cond);
        let c_val = self.rvalue(symbols, cfg, c.block, c.value);

        let then_blk = cfg.new_block();
        let else_blk = cfg.new_block();
        let merge = cfg.new_block();
        cfg.terminate(c.block, Terminator::Branch { cond: c_val, then_blk, else_blk });

        let t = self.eval(symbols, cfg, then_blk, then);
        let t_val = self.rvalue(symbols, cfg, t.block, t.value);
        let e = self.eval(symbols, cfg, else_blk, else_);
        let e_val = self.rvalue(symbols, cfg, e.block, e.value);

        let result_ty = types::usual_arithmetic_conversion(self.types, t_val.ty, e_val.ty);
        let tmp = symbols.create_tmp(result_ty);
        let t_conv = self.convert(symbols, cfg, t.block, t_val, result_ty);
        cfg.push_op(t.block, Operation { target: Var::direct(result_ty, tmp, false), opcode: Opcode::Convert, lhs: t_conv, rhs: None });
        cfg.terminate(t.block, Terminator::Jump(merge));
        let e_conv = self.convert(symbols, cfg, e.block, e_val, result_ty);
        cfg.push_op(e.block, Operation { target: Var::direct(result_ty, tmp, false), opcode: Opcode::Convert, lhs: e_conv, rhs: None });
        cfg.terminate(e.block, Terminator::Jump(merge));

        Evaluated { value: Var::direct(result_ty, tmp, false), block: merge }
    }

    /// Calls (spec.md §4.3): `param()` pushes arguments left-to-right,
    /// `eval_call` materializes the call and produces a temporary of the
    /// return type (or a void non-value for a `void`-returning call).
    fn eval_call(
        &self, symbols: &mut crate::symtab::SymbolTable<'a>, cfg: &mut Cfg<'_, 'a>,
        mut block: BlockId, func: SymbolId, ret: Type<'a>, args: &[Expr<'a>],
    ) -> Evaluated<'a> {
        for arg in args {
            let a = self.eval(symbols, cfg, block, arg);
            let v = self.rvalue(symbols, cfg, a.block, a.value);
            block = a.block;
            cfg.push_op(block, Operation { target: v, opcode: Opcode::Param, lhs: v, rhs: None });
        }
        let func_var = Var::direct(ret, func, false);
        if types::is_complete(ret) && !matches!(&ret.kind, TypeKind::Void) {
            let tmp = symbols.create_tmp(ret);
            let target = Var::direct(ret, tmp, false);
            cfg.push_op(block, Operation { target, opcode: Opcode::Call, lhs: func_var, rhs: None });
            Evaluated { value: target, block }
        } else {
            cfg.push_op(block, Operation { target: func_var, opcode: Opcode::Call, lhs: func_var, rhs: None });
            Evaluated { value: Var::immediate(self.types.void, 0), block }
        }
    }

    /// `a[i]` (spec.md §4.3 "postfix"): always desugared through pointer
    /// arithmetic rather than folded into a `Deref` offset, since the index
    /// is in general a runtime value — `a + i*sizeof(*a)` computed into a
    /// fresh pointer temporary, then dereferenced at offset zero.
    fn eval_index(
        &self, symbols: &mut crate::symtab::SymbolTable<'a>, cfg: &mut Cfg<'_, 'a>,
        block: BlockId, base: &Expr<'a>, index: &Expr<'a>,
    ) -> Evaluated<'a> {
        let b = self.eval(symbols, cfg, block, base);
        let b_ptr = self.rvalue(symbols, cfg, b.block, b.value);
        let pointee = match &b_ptr.ty.kind {
            TypeKind::Pointer(p) => *p,
            _ => panic!("index of non-pointer type"),
        };
        let i = self.eval(symbols, cfg, b.block, index);
        let i_val = self.rvalue(symbols, cfg, i.block, i.value);

        let elem_size = types::size_of(pointee) as i64;
        let scaled = if i_val.is_immediate() {
            Var::immediate(self.types.long, i_val.imm.wrapping_mul(elem_size))
        } else {
            let tmp = symbols.create_tmp(self.types.long);
            let target = Var::direct(self.types.long, tmp, false);
            cfg.push_op(i.block, Operation { target, opcode: Opcode::Mul, lhs: i_val, rhs: Some(Var::immediate(self.types.long, elem_size)) });
            target
        };
        let ptr_tmp = symbols.create_tmp(b_ptr.ty);
        let ptr_target = Var::direct(b_ptr.ty, ptr_tmp, false);
        cfg.push_op(i.block, Operation { target: ptr_target, opcode: Opcode::Add, lhs: b_ptr, rhs: Some(scaled) });
        Evaluated { value: Var::deref(pointee, ptr_tmp, 0), block: i.block }
    }

    /// `s.field` / `p->field` (spec.md §4.3 "postfix"): a constant-offset
    /// adjustment to the base l-value's header, not a fresh addressing
    /// mode — `->` first dereferences the pointer, then both cases add the
    /// member's offset onto whatever `(kind, symbol, offset)` the base
    /// already carries.
    fn eval_member(
        &self, symbols: &mut crate::symtab::SymbolTable<'a>, cfg: &mut Cfg<'_, 'a>,
        block: BlockId, base: &Expr<'a>, name: SymbolName, arrow: bool,
    ) -> Evaluated<'a> {
        let b = self.eval(symbols, cfg, block, base);
        let struct_var = if arrow {
            let ptr = self.rvalue(symbols, cfg, b.block, b.value);
            let pointee = match &ptr.ty.kind {
                TypeKind::Pointer(p) => *p,
                _ => panic!("-> on non-pointer type"),
            };
            let sym = ptr.symbol.expect("pointer value carries a symbol");
            Var::deref(pointee, sym, ptr.offset)
        } else {
            assert!(b.value.lvalue, "member access requires an l-value");
            b.value
        };
        let member = types::get_member(struct_var.ty, name).expect("unknown member name");
        let result = Var { ty: member.ty, offset: struct_var.offset + member.offset as i64, ..struct_var };
        Evaluated { value: result, block: b.block }
    }

    /// `__builtin_va_start`/`__builtin_va_arg` (spec.md §4.3): expand to
    /// direct field accesses on the ABI `va_list` layout
    /// (`gp_offset`, `fp_offset`, `overflow_arg_area`, `reg_save_area`)
    /// rather than to library calls. `va_list_sym` is the local `va_list`
    /// object; `field` names which word of the struct to touch.
    #[must_use]
    pub fn eval_va_field(&self, va_list_sym: SymbolId, field: VaListField) -> Var<'a> {
        let offset = match field {
            VaListField::GpOffset => 0,
            VaListField::FpOffset => 4,
            VaListField::OverflowArgArea => 8,
            VaListField::RegSaveArea => 16,
        };
        let ty = if matches!(field, VaListField::GpOffset | VaListField::FpOffset) {
            self.types.uint
        } else {
            self.types.pointer(self.types.void)
        };
        Var::deref(ty, va_list_sym, offset)
    }
}

/// Token-stream-to-`Expr` parsing (spec.md §4.4/§4.5 "drive expression
/// evaluation"): ordinary C89 precedence climbing, one function per
/// precedence level, bottoming out at `parse_postfix`/`parse_primary`.
/// Kept in this module rather than `decl.rs`/`stmt.rs` since it is built
/// entirely out of the `Expr`/`BinOp`/`UnaryOp` vocabulary defined above;
/// the declaration and statement parsers call into it, never the reverse.
/// The comma operator is not implemented: nothing in this core's call
/// sites (initializers, `if`/`while` conditions, `for`-clauses) needs it,
/// and C89 gives each of those contexts its own comma-free grammar already.
pub fn parse_assignment<'a>(ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>) -> diag::Result<Expr<'a>> {
    let lhs = parse_conditional(ts, types, symbols)?;
    if matches!(&ts.peek().kind, TokenKind::Punct('=')) {
        ts.next();
        let rhs = parse_assignment(ts, types, symbols)?;
        return Ok(Expr::Assign { target: Box::new(lhs), value: Box::new(rhs) });
    }
    if let Some(op) = compound_assign_op(&ts.peek().kind) {
        ts.next();
        let rhs = parse_assignment(ts, types, symbols)?;
        let combined = Expr::Binary { op, lhs: Box::new(lhs.clone()), rhs: Box::new(rhs) };
        return Ok(Expr::Assign { target: Box::new(lhs), value: Box::new(combined) });
    }
    Ok(lhs)
}

/// `pub(crate)` so the statement parser's expression-statement handling
/// (which resumes parsing from an already-consumed leading identifier, to
/// tell a label from an expression statement with only one token of
/// lookahead) can recognize a compound-assignment operator the same way
/// `parse_assignment` does, without duplicating the operator table.
pub(crate) fn compound_assign_op(kind: &TokenKind) -> Option<BinOp> {
    match kind {
        TokenKind::Op("+=") => Some(BinOp::Add), TokenKind::Op("-=") => Some(BinOp::Sub),
        TokenKind::Op("*=") => Some(BinOp::Mul), TokenKind::Op("/=") => Some(BinOp::Div),
        TokenKind::Op("%=") => Some(BinOp::Mod), TokenKind::Op("&=") => Some(BinOp::BitAnd),
        TokenKind::Op("|=") => Some(BinOp::BitOr), TokenKind::Op("^=") => Some(BinOp::BitXor),
        TokenKind::Op("<<=") => Some(BinOp::Shl), TokenKind::Op(">>=") => Some(BinOp::Shr),
        _ => None,
    }
}

fn parse_conditional<'a>(ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>) -> diag::Result<Expr<'a>> {
    let cond = parse_logical_or(ts, types, symbols)?;
    if matches!(&ts.peek().kind, TokenKind::Punct('?')) {
        ts.next();
        let then = parse_assignment(ts, types, symbols)?;
        expect_punct(ts, ':')?;
        let else_ = parse_conditional(ts, types, symbols)?;
        return Ok(Expr::Conditional { cond: Box::new(cond), then: Box::new(then), else_: Box::new(else_) });
    }
    Ok(cond)
}

fn parse_logical_or<'a>(ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>) -> diag::Result<Expr<'a>> {
    let mut lhs = parse_logical_and(ts, types, symbols)?;
    while matches!(&ts.peek().kind, TokenKind::Op("||")) {
        ts.next();
        let rhs = parse_logical_and(ts, types, symbols)?;
        lhs = Expr::LogicalOr(Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_logical_and<'a>(ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>) -> diag::Result<Expr<'a>> {
    let mut lhs = parse_bitor(ts, types, symbols)?;
    while matches!(&ts.peek().kind, TokenKind::Op("&&")) {
        ts.next();
        let rhs = parse_bitor(ts, types, symbols)?;
        lhs = Expr::LogicalAnd(Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

/// Shared machinery for every left-associative binary precedence level:
/// keep folding `lhs op rhs` while the next token matches one of `toks`.
macro_rules! binop_level {
    ($name:ident, $next:ident, [$($pat:pat => $op:expr),+ $(,)?]) => {
        fn $name<'a>(ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>) -> diag::Result<Expr<'a>> {
            let mut lhs = $next(ts, types, symbols)?;
            loop {
                let op = match &ts.peek().kind { $($pat => $op,)+ _ => break };
                ts.next();
                let rhs = $next(ts, types, symbols)?;
                lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
            }
            Ok(lhs)
        }
    };
}

binop_level!(parse_bitor, parse_bitxor, [TokenKind::Punct('|') => BinOp::BitOr]);
binop_level!(parse_bitxor, parse_bitand, [TokenKind::Punct('^') => BinOp::BitXor]);
binop_level!(parse_bitand, parse_equality, [TokenKind::Punct('&') => BinOp::BitAnd]);
binop_level!(parse_equality, parse_relational, [
    TokenKind::Op("==") => BinOp::Eq,
    TokenKind::Op("!=") => BinOp::Ne,
]);
binop_level!(parse_relational, parse_shift, [
    TokenKind::Op("<=") => BinOp::Le,
    TokenKind::Op(">=") => BinOp::Ge,
    TokenKind::Punct('<') => BinOp::Lt,
    TokenKind::Punct('>') => BinOp::Gt,
]);
binop_level!(parse_shift, parse_additive, [
    TokenKind::Op("<<") => BinOp::Shl,
    TokenKind::Op(">>") => BinOp::Shr,
]);
binop_level!(parse_additive, parse_multiplicative, [
    TokenKind::Punct('+') => BinOp::Add,
    TokenKind::Punct('-') => BinOp::Sub,
]);
binop_level!(parse_multiplicative, parse_unary, [
    TokenKind::Punct('*') => BinOp::Mul,
    TokenKind::Punct('/') => BinOp::Div,
    TokenKind::Punct('%') => BinOp::Mod,
]);

fn parse_unary<'a>(ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>) -> diag::Result<Expr<'a>> {
    let op = match &ts.peek().kind {
        TokenKind::Punct('-') => Some(UnaryOp::Neg),
        TokenKind::Punct('~') => Some(UnaryOp::BitNot),
        TokenKind::Punct('!') => Some(UnaryOp::Not),
        TokenKind::Punct('&') => Some(UnaryOp::Addr),
        TokenKind::Punct('*') => Some(UnaryOp::Deref),
        _ => None,
    };
    if let Some(op) = op {
        ts.next();
        let expr = parse_unary(ts, types, symbols)?;
        return Ok(Expr::Unary { op, expr: Box::new(expr) });
    }
    if matches!(&ts.peek().kind, TokenKind::Keyword(s) if *s == crate::symbol::intern("sizeof")) {
        // `sizeof(type-name)` is not supported: this token stream has no
        // two-token lookahead to disambiguate a parenthesized type-name
        // from a parenthesized expression before committing to a parse.
        // `sizeof expr` and `sizeof(expr)` (the latter via the ordinary
        // parenthesized-primary rule) both work.
        ts.next();
        let operand = parse_unary(ts, types, symbols)?;
        let size = types::size_of(expr_static_type(&operand));
        return Ok(Expr::IntLiteral(size as i64, types.ulong));
    }
    parse_postfix(ts, types, symbols)
}

/// The static type of an already-parsed `Expr`, needed only by `sizeof`
/// (which never evaluates its operand, per C89 §3.3.3.4).
fn expr_static_type<'a>(e: &Expr<'a>) -> Type<'a> {
    match e {
        Expr::IntLiteral(_, t) | Expr::StringLiteral(_, t) | Expr::Ident(_, t) => *t,
        Expr::Unary { op: UnaryOp::Deref, expr } => match &expr_static_type(expr).kind {
            TypeKind::Pointer(p) => *p,
            _ => panic!("sizeof *non-pointer"),
        },
        Expr::Unary { expr, .. } => expr_static_type(expr),
        Expr::Binary { lhs, .. } => expr_static_type(lhs),
        Expr::Assign { target, .. } => expr_static_type(target),
        Expr::LogicalAnd(..) | Expr::LogicalOr(..) => unreachable!("sizeof of an int-typed expr"),
        Expr::Conditional { then, .. } => expr_static_type(then),
        Expr::Call { ret, .. } => *ret,
        Expr::Index { base, .. } => match &expr_static_type(base).kind {
            TypeKind::Pointer(p) => *p,
            _ => panic!("sizeof index of non-pointer type"),
        },
        Expr::Member { .. } => panic!("sizeof of a member access requires carrying its Type, not recomputing it"),
        Expr::Place(v) => v.ty,
    }
}

fn parse_postfix<'a>(ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>) -> diag::Result<Expr<'a>> {
    let mut expr = parse_primary(ts, types, symbols)?;
    loop {
        match &ts.peek().kind {
            TokenKind::Punct('[') => {
                ts.next();
                let index = parse_assignment(ts, types, symbols)?;
                expect_punct(ts, ']')?;
                expr = Expr::Index { base: Box::new(expr), index: Box::new(index) };
            }
            TokenKind::Punct('(') => {
                let (func, ret) = match &expr {
                    Expr::Ident(sym, _) => {
                        let ret = match &types::unwrapped(symbols.get(*sym).ty).kind {
                            TypeKind::Function { ret, .. } => *ret,
                            _ => panic!("call of a non-function identifier"),
                        };
                        (*sym, ret)
                    }
                    _ => panic!("only direct calls through a named function are supported"),
                };
                ts.next();
                let mut args = Vec::new();
                if !matches!(&ts.peek().kind, TokenKind::Punct(')')) {
                    loop {
                        args.push(parse_assignment(ts, types, symbols)?);
                        if matches!(&ts.peek().kind, TokenKind::Punct(',')) { ts.next(); } else { break }
                    }
                }
                expect_punct(ts, ')')?;
                expr = Expr::Call { func, ret, args };
            }
            TokenKind::Punct('.') => {
                ts.next();
                let name = expect_identifier(ts)?;
                expr = Expr::Member { base: Box::new(expr), name, arrow: false };
            }
            TokenKind::Op("->") => {
                ts.next();
                let name = expect_identifier(ts)?;
                expr = Expr::Member { base: Box::new(expr), name, arrow: true };
            }
            _ => break,
        }
    }
    Ok(expr)
}

fn parse_primary<'a>(ts: &mut dyn TokenStream, types: &Types<'a>, symbols: &mut SymbolTable<'a>) -> diag::Result<Expr<'a>> {
    let tok = ts.next();
    match tok.kind {
        TokenKind::Number(n) => Ok(Expr::IntLiteral(n, types.int)),
        TokenKind::String(bytes) => {
            let ty = types.array(types.char_, Some(bytes.len() as u64 + 1));
            let sym = symbols.create_string_literal(ty, bytes);
            Ok(Expr::StringLiteral(sym, ty))
        }
        TokenKind::Identifier(name) => {
            let sym = symbols.lookup_ident(name).ok_or_else(|| {
                Diagnostic::semantic(tok.span, format!("use of undeclared identifier '{}'", crate::symbol::with_str(name, str::to_owned)))
            })?;
            let ty = symbols.get(sym).ty;
            Ok(Expr::Ident(sym, ty))
        }
        TokenKind::Punct('(') => {
            let inner = parse_assignment(ts, types, symbols)?;
            expect_punct(ts, ')')?;
            Ok(inner)
        }
        other => Err(Diagnostic::syntax(tok.span, format!("expected an expression, found {other:?}"))),
    }
}

fn expect_punct(ts: &mut dyn TokenStream, c: char) -> diag::Result<()> {
    let tok = ts.next();
    if matches!(tok.kind, TokenKind::Punct(p) if p == c) { return Ok(()) }
    Err(Diagnostic::syntax(tok.span, format!("expected '{c}', found {:?}", tok.kind)))
}

fn expect_identifier(ts: &mut dyn TokenStream) -> diag::Result<SymbolName> {
    let tok = ts.next();
    match tok.kind {
        TokenKind::Identifier(s) => Ok(s),
        other => Err(Diagnostic::syntax(tok.span, format!("expected an identifier, found {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Cfg, Definition};
    use crate::symtab::{Linkage, SymbolKind, SymbolTable};
    use typed_arena::Arena;

    #[test]
    fn constant_folding_emits_no_op() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let f = tab.add_ident(crate::symbol::intern("f"), SymbolKind::Definition, Linkage::Extern, types.int);
        let mut def = Definition::new(f);
        let mut cfg = Cfg::new(&mut def);
        let b = cfg.new_block();
        let ev = Evaluator::new(&types);
        let expr = Expr::Binary {
            op: BinOp::Add,
            lhs: Box::new(Expr::IntLiteral(2, types.int)),
            rhs: Box::new(Expr::IntLiteral(3, types.int)),
        };
        let result = ev.eval(&mut tab, &mut cfg, b, &expr);
        assert!(result.value.is_immediate());
        assert_eq!(result.value.imm, 5);
    }

    #[test]
    fn assignment_converts_and_stores() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let f = tab.add_ident(crate::symbol::intern("f"), SymbolKind::Definition, Linkage::Extern, types.int);
        let x = tab.add_ident(crate::symbol::intern("x"), SymbolKind::Definition, Linkage::None, types.char_);
        let mut def = Definition::new(f);
        let mut cfg = Cfg::new(&mut def);
        let b = cfg.new_block();
        let ev = Evaluator::new(&types);
        let expr = Expr::Assign {
            target: Box::new(Expr::Ident(x, types.char_)),
            value: Box::new(Expr::IntLiteral(65, types.int)),
        };
        let result = ev.eval(&mut tab, &mut cfg, b, &expr);
        assert!(!result.value.lvalue);
        assert!(types::type_equal(result.value.ty, types.char_));
    }

    #[test]
    fn logical_and_splices_extra_blocks_and_merges_in_int() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let f = tab.add_ident(crate::symbol::intern("f"), SymbolKind::Definition, Linkage::Extern, types.int);
        let a = tab.add_ident(crate::symbol::intern("a"), SymbolKind::Definition, Linkage::None, types.int);
        let b_sym = tab.add_ident(crate::symbol::intern("b"), SymbolKind::Definition, Linkage::None, types.int);
        let mut def = Definition::new(f);
        let mut cfg = Cfg::new(&mut def);
        let entry = cfg.new_block();
        let ev = Evaluator::new(&types);
        let expr = Expr::LogicalAnd(
            Box::new(Expr::Ident(a, types.int)),
            Box::new(Expr::Ident(b_sym, types.int)),
        );
        let result = ev.eval(&mut tab, &mut cfg, entry, &expr);
        assert!(types::type_equal(result.value.ty, types.int));
        assert_ne!(result.block, entry);
        assert!(cfg.is_terminated(entry));
    }

    #[test]
    fn conditional_merges_differing_arithmetic_types() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let f = tab.add_ident(crate::symbol::intern("f"), SymbolKind::Definition, Linkage::Extern, types.int);
        let mut def = Definition::new(f);
        let mut cfg = Cfg::new(&mut def);
        let entry = cfg.new_block();
        let ev = Evaluator::new(&types);
        let expr = Expr::Conditional {
            cond: Box::new(Expr::IntLiteral(1, types.int)),
            then: Box::new(Expr::IntLiteral(1, types.char_)),
            else_: Box::new(Expr::IntLiteral(2, types.uint)),
        };
        let result = ev.eval(&mut tab, &mut cfg, entry, &expr);
        assert!(types::type_equal(result.value.ty, types.uint));
    }

    #[test]
    fn call_with_void_return_yields_no_temporary() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let f = tab.add_ident(crate::symbol::intern("f"), SymbolKind::Definition, Linkage::Extern, types.int);
        let g = tab.add_ident(crate::symbol::intern("g"), SymbolKind::Definition, Linkage::Extern, types.void);
        let mut def = Definition::new(f);
        let mut cfg = Cfg::new(&mut def);
        let b = cfg.new_block();
        let ev = Evaluator::new(&types);
        let expr = Expr::Call { func: g, ret: types.void, args: vec![Expr::IntLiteral(1, types.int)] };
        let result = ev.eval(&mut tab, &mut cfg, b, &expr);
        assert!(types::type_equal(result.value.ty, types.void));
        assert_eq!(def.block(b).ops().len(), 2);
    }

    #[test]
    fn index_dereferences_scaled_pointer_arithmetic() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let f = tab.add_ident(crate::symbol::intern("f"), SymbolKind::Definition, Linkage::Extern, types.int);
        let arr_ty = types.array(types.int, Some(4));
        let a = tab.add_ident(crate::symbol::intern("a"), SymbolKind::Definition, Linkage::None, arr_ty);
        let mut def = Definition::new(f);
        let mut cfg = Cfg::new(&mut def);
        let b = cfg.new_block();
        let ev = Evaluator::new(&types);
        let expr = Expr::Index {
            base: Box::new(Expr::Ident(a, arr_ty)),
            index: Box::new(Expr::IntLiteral(2, types.int)),
        };
        let result = ev.eval(&mut tab, &mut cfg, b, &expr);
        assert!(types::type_equal(result.value.ty, types.int));
        assert!(result.value.lvalue);
        assert_eq!(def.block(b).ops().len(), 2); // Mul then Add
    }

    #[test]
    fn member_access_adds_field_offset() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let f = tab.add_ident(crate::symbol::intern("f"), SymbolKind::Definition, Linkage::Extern, types.int);
        let s = types.new_struct();
        let x = crate::symbol::intern("x");
        let y = crate::symbol::intern("y");
        types.add_member(s, crate::types::Param::Named(x, types.int));
        types.add_member(s, crate::types::Param::Named(y, types.char_));
        let v = tab.add_ident(crate::symbol::intern("v"), SymbolKind::Definition, Linkage::None, s);
        let mut def = Definition::new(f);
        let mut cfg = Cfg::new(&mut def);
        let b = cfg.new_block();
        let ev = Evaluator::new(&types);
        let expr = Expr::Member { base: Box::new(Expr::Ident(v, s)), name: y, arrow: false };
        let result = ev.eval(&mut tab, &mut cfg, b, &expr);
        assert!(types::type_equal(result.value.ty, types.char_));
        assert_eq!(result.value.offset, 4);
        assert!(result.value.lvalue);
    }

    fn tokens(kinds: Vec<TokenKind>) -> crate::token::VecTokenStream {
        use crate::diag::Span;
        crate::token::VecTokenStream::new(
            kinds.into_iter().map(|kind| crate::token::Token { kind, span: Span::default() }).collect(),
        )
    }

    #[test]
    fn precedence_climbing_binds_multiplication_tighter_than_addition() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        // 1 + 2 * 3
        let mut ts = tokens(vec![
            TokenKind::Number(1), TokenKind::Punct('+'), TokenKind::Number(2),
            TokenKind::Punct('*'), TokenKind::Number(3),
        ]);
        let expr = parse_assignment(&mut ts, &types, &mut tab).unwrap();
        match expr {
            Expr::Binary { op: BinOp::Add, rhs, .. } => {
                assert!(matches!(*rhs, Expr::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("expected a top-level '+', got {other:?}"),
        }
    }

    #[test]
    fn call_parses_argument_list_and_resolves_return_type() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let func_ty = types.new_function(types.int);
        let g = tab.add_ident(crate::symbol::intern("g"), SymbolKind::Definition, Linkage::Extern, func_ty);
        let mut ts = tokens(vec![
            TokenKind::Identifier(crate::symbol::intern("g")), TokenKind::Punct('('),
            TokenKind::Number(1), TokenKind::Punct(','), TokenKind::Number(2), TokenKind::Punct(')'),
        ]);
        let expr = parse_assignment(&mut ts, &types, &mut tab).unwrap();
        match expr {
            Expr::Call { func, ret, args } => {
                assert_eq!(func, g);
                assert!(types::type_equal(ret, types.int));
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected a call, got {other:?}"),
        }
    }

    #[test]
    fn undeclared_identifier_is_a_semantic_diagnostic() {
        let arena: &'static Arena<_> = Box::leak(Box::new(Arena::new()));
        let bump: &'static bumpalo::Bump = Box::leak(Box::new(bumpalo::Bump::new()));
        let types = Types::new(arena, bump);
        let mut tab = SymbolTable::new();
        let mut ts = tokens(vec![TokenKind::Identifier(crate::symbol::intern("nope"))]);
        let err = parse_assignment(&mut ts, &types, &mut tab).unwrap_err();
        assert!(matches!(err, Diagnostic::Semantic { .. }));
    }
}
