//! The single-pass lowering driver.
//!
//! One [`FunctionCodegen`] owns everything needed to turn a function body
//! into machine instructions: the instruction list under construction, the
//! register manager, the stack-frame planner and the stacked value-location
//! table. Helpers take the whole context by `&mut self`; in particular,
//! spilling is something the context does on the allocator's behalf, not
//! something the register table can do on its own.

use crate::abi;
use crate::branch::Branch;
use crate::debug::DebugInfoOutput;
use crate::frame::{align_up, StackFrame};
use crate::link::LinkFile;
use crate::mir::{Cond, Inst as MirInst, Mir, MirIdx, UNDEFINED_TARGET};
use crate::regalloc::RegisterManager;
use crate::registers::{register_alias, Register, ALLOCATABLE_REGS, FP, LR};
use crate::value::MachineValue;
use crate::Target;
use air::ir::InstDiscriminants as AirTag;
use air::{Air, CallConv, CmpOp, Inst as AirInst, InstIdx, Liveness, Ref, Type, Value, BPI};
use derive_more::Display;
use failure::Fail;
use std::collections::HashMap;

/// Source location attached to reported failures.
#[derive(Debug, Clone, PartialEq, Display)]
#[display(fmt = "{}:{}", line, column)]
pub struct SrcLoc {
    pub line: u32,
    pub column: u32,
}

/// The function being lowered, as the caller describes it.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    /// Must be a `Type::Fn`.
    pub ty: Type,
    /// This function's own linker atom, referenced by relocation pseudos.
    pub atom_index: u32,
    pub src_loc: SrcLoc,
    /// Position of the closing brace, carried by the final line marker.
    pub rbrace_src: SrcLoc,
}

#[derive(Debug, Fail)]
pub enum CodegenError {
    /// The allocator found no spillable victim. A compiler bug: the fixed
    /// freeze windows are small enough that this must not happen.
    #[fail(display = "{}: code generation ran out of registers", src_loc)]
    OutOfRegisters { src_loc: SrcLoc },
    #[fail(display = "{}: {}", src_loc, msg)]
    CodegenFail { src_loc: SrcLoc, msg: String },
}

/// Error currency inside the pass. The message of a `CodegenFail` lives in
/// the context's single `err_msg` slot; the first failure sticks.
#[derive(Debug, Clone, Copy, PartialEq)]
enum InnerError {
    OutOfRegisters,
    CodegenFail,
}

type InnerResult<T> = Result<T, InnerError>;

/// Per-`block` state: the machine value every `br` agrees on (the first
/// value-carrying `br` decides) and the forward jumps to patch at the end.
#[derive(Debug)]
struct BlockData {
    mcv: MachineValue,
    relocs: Vec<MirIdx>,
}

/// The sole public entry: lower `function`'s body into an instruction
/// stream for the downstream emit stage.
pub fn generate(
    function: &Function,
    air: &Air,
    liveness: Liveness,
    target: Target,
    link_file: &mut LinkFile,
    debug_output: &mut DebugInfoOutput,
) -> Result<Mir, CodegenError> {
    let mut codegen = FunctionCodegen {
        air,
        liveness,
        function,
        target,
        link_file,
        debug_output,
        mir: Vec::new(),
        err_msg: None,
        args: Vec::new(),
        arg_index: 0,
        ret_mv: MachineValue::None,
        fn_ret_ty: Type::Void,
        register_manager: RegisterManager::new(),
        frame: StackFrame::new(),
        branch_stack: vec![Branch::new()],
        blocks: HashMap::new(),
        exitlude_jump_relocs: Vec::new(),
    };
    match codegen.gen() {
        Ok(()) => Ok(Mir { instructions: codegen.mir }),
        Err(InnerError::OutOfRegisters) => {
            Err(CodegenError::OutOfRegisters { src_loc: function.src_loc.clone() })
        }
        Err(InnerError::CodegenFail) => Err(CodegenError::CodegenFail {
            src_loc: function.src_loc.clone(),
            msg: codegen
                .err_msg
                .take()
                .unwrap_or_else(|| "code generation failed".to_string()),
        }),
    }
}

struct FunctionCodegen<'a> {
    air: &'a Air,
    liveness: Liveness,
    function: &'a Function,
    target: Target,
    link_file: &'a mut LinkFile,
    debug_output: &'a mut DebugInfoOutput,

    mir: Vec<MirInst>,
    err_msg: Option<String>,

    /// Parameter locations as classified on entry, consumed in order by the
    /// `arg` lowerer.
    args: Vec<MachineValue>,
    arg_index: usize,
    ret_mv: MachineValue,
    fn_ret_ty: Type,

    register_manager: RegisterManager,
    frame: StackFrame,
    branch_stack: Vec<Branch>,
    blocks: HashMap<InstIdx, BlockData>,
    exitlude_jump_relocs: Vec<MirIdx>,
}

impl<'a> FunctionCodegen<'a> {
    fn gen(&mut self) -> InnerResult<()> {
        let air = self.air;
        let function = self.function;
        let fn_info = match function.ty.fn_info() {
            Some(info) => info,
            None => return Err(self.fail("generate called on a non-function".to_string())),
        };
        let call_mvs = match abi::classify(fn_info, &self.target) {
            Ok(mvs) => mvs,
            Err(err) => return Err(self.fail(err.to_string())),
        };
        self.args = call_mvs.args;
        self.ret_mv = call_mvs.return_value;
        self.fn_ret_ty = fn_info.ret.clone();

        if fn_info.cc == CallConv::Naked {
            self.push(MirInst::DbgPrologueEnd);
            self.gen_body(air.main_body())?;
            self.push(MirInst::DbgEpilogueBegin);
        } else {
            self.push(MirInst::StpPreIndex { rt: FP, rt2: LR, rn: Register::Sp, offset: -16 });
            let backpatch_push_regs = self.push(MirInst::Nop);
            self.push(MirInst::MovToFromSp { rd: FP, rn: Register::Sp });
            let backpatch_sub_sp = self.push(MirInst::Nop);
            self.push(MirInst::DbgPrologueEnd);

            self.gen_body(air.main_body())?;

            // Now that the body told us which callee-preserved registers it
            // touched and how deep the slot area got, fill in the
            // placeholders.
            let saved_mask = self.register_manager.allocated_mask();
            let saved_regs_space = align_up(16 + 8 * saved_mask.count_ones(), 16);
            let total = align_up(self.frame.max_end() + saved_regs_space, self.frame.align());
            let stack_size = total - saved_regs_space;
            if stack_size > 0xfff {
                return Err(self.fail(format!("stack frame too large ({} bytes)", stack_size)));
            }
            self.mir[backpatch_push_regs as usize] = MirInst::PushRegs { mask: saved_mask };
            self.mir[backpatch_sub_sp as usize] = MirInst::SubImmediate {
                rd: Register::Sp,
                rn: Register::Sp,
                imm12: stack_size as u16,
            };

            self.push(MirInst::DbgEpilogueBegin);
            // A return directly before the epilogue would jump a single
            // instruction ahead; drop that jump instead of patching it.
            if let Some(last) = self.exitlude_jump_relocs.last().cloned() {
                if last as usize == self.mir.len() - 2 {
                    self.mir.remove(last as usize);
                    self.exitlude_jump_relocs.pop();
                }
            }
            let epilogue_target = self.mir.len() as MirIdx;
            for reloc in std::mem::replace(&mut self.exitlude_jump_relocs, Vec::new()) {
                self.patch_target(reloc, epilogue_target);
            }

            self.push(MirInst::AddImmediate {
                rd: Register::Sp,
                rn: Register::Sp,
                imm12: stack_size as u16,
            });
            self.push(MirInst::PopRegs { mask: saved_mask });
            self.push(MirInst::LdpPostIndex { rt: FP, rt2: LR, rn: Register::Sp, offset: 16 });
            self.push(MirInst::Ret { rn: LR });
        }

        self.push(MirInst::DbgLine {
            line: self.function.rbrace_src.line,
            column: self.function.rbrace_src.column,
        });
        Ok(())
    }

    fn gen_body(&mut self, body: &'a [InstIdx]) -> InnerResult<()> {
        for &inst in body {
            self.gen_inst(inst)?;
            debug_assert!(
                !self.register_manager.frozen_regs_exist(),
                "a freeze outlived its instruction"
            );
        }
        Ok(())
    }

    fn gen_inst(&mut self, inst: InstIdx) -> InnerResult<()> {
        let air = self.air;
        log::debug!("lowering {}", inst);
        match air.get(inst) {
            AirInst::Arg { ty, name } => self.gen_arg(inst, ty, name),
            AirInst::Add { lhs, rhs }
            | AirInst::Sub { lhs, rhs }
            | AirInst::Mul { lhs, rhs }
            | AirInst::BitAnd { lhs, rhs }
            | AirInst::BitOr { lhs, rhs }
            | AirInst::Xor { lhs, rhs }
            | AirInst::BoolAnd { lhs, rhs }
            | AirInst::BoolOr { lhs, rhs }
            | AirInst::PtrAdd { lhs, rhs }
            | AirInst::PtrSub { lhs, rhs } => {
                let tag = AirTag::from(air.get(inst));
                if self.liveness.is_unused(inst) {
                    return self.finish(inst, MachineValue::Dead, &[*lhs, *rhs]);
                }
                let result = self.bin_op(Some(inst), tag, *lhs, *rhs)?;
                self.finish(inst, result, &[*lhs, *rhs])
            }
            AirInst::Not { operand } => self.gen_not(inst, *operand),
            AirInst::Cmp { op, lhs, rhs } => self.gen_cmp(inst, *op, *lhs, *rhs),
            AirInst::Bitcast { operand, .. } => self.gen_bitcast(inst, *operand),
            AirInst::IntCast { operand, .. } => self.gen_int_cast(inst, *operand),
            AirInst::Trunc { operand, .. } => self.gen_trunc(inst, *operand),
            AirInst::Alloc { .. } => self.gen_alloc(inst),
            AirInst::Load { ptr } => self.gen_load(inst, *ptr),
            AirInst::Store { ptr, value } => self.gen_store(inst, *ptr, *value),
            AirInst::StructFieldPtr { base, field, .. } => {
                self.gen_struct_field_ptr(inst, *base, *field)
            }
            AirInst::SlicePtr { operand } => self.gen_slice_field(inst, *operand, 0),
            AirInst::SliceLen { operand } => self.gen_slice_field(inst, *operand, 1),
            AirInst::IsErr { operand } => self.gen_is_err(inst, *operand, false),
            AirInst::IsNonErr { operand } => self.gen_is_err(inst, *operand, true),
            AirInst::WrapOptional { operand, .. } => self.gen_wrap_optional(inst, *operand),
            AirInst::OptionalPayload { operand, .. } => self.gen_optional_payload(inst, *operand),
            AirInst::Call { callee, args } => self.gen_call(inst, *callee, args),
            AirInst::Ret { operand } => self.gen_ret(inst, *operand),
            AirInst::RetLoad { .. } => {
                Err(self.fail("TODO implement codegen for ret_load".to_string()))
            }
            AirInst::Block { body, .. } => self.gen_block(inst, body),
            AirInst::Br { block, operand } => self.gen_br(inst, *block, *operand),
            AirInst::Loop { body } => self.gen_loop(inst, body),
            AirInst::CondBr { cond, then_body, else_body } => {
                self.gen_cond_br(inst, *cond, then_body, else_body)
            }
            AirInst::SwitchBr { .. } => {
                Err(self.fail("TODO implement codegen for switch branches".to_string()))
            }
            AirInst::Unreach => Ok(()),
            AirInst::Breakpoint => {
                self.push(MirInst::Brk { imm16: 1 });
                Ok(())
            }
            AirInst::DbgStmt { line, column } => {
                self.push(MirInst::DbgLine { line: *line, column: *column });
                Ok(())
            }
            AirInst::Assembly { template, outputs, inputs } => {
                self.gen_assembly(inst, template, outputs, inputs)
            }
        }
    }

    // ------------------------------------------------------------------
    // Per-op lowerers
    // ------------------------------------------------------------------

    fn gen_arg(&mut self, inst: InstIdx, ty: &Type, name: &str) -> InnerResult<()> {
        let arg_index = self.arg_index;
        self.arg_index += 1;
        let result = self.args[arg_index];
        let mcv = match result {
            MachineValue::Register(reg) => {
                // Copy the register into its parameter home so the value
                // survives the argument registers being clobbered.
                let size = ty.abi_size() as u32;
                let align = ty.abi_alignment();
                let offset = self.frame.alloc(Some(inst), size, align);
                self.gen_set_stack(ty, offset, MachineValue::Register(reg))?;
                MachineValue::StackOffset(offset)
            }
            MachineValue::StackOffset(_) => {
                return Err(self.fail("TODO implement stack-passed parameters".to_string()));
            }
            other => other,
        };
        self.debug_output.add_arg(name, ty, mcv);
        self.finish(inst, mcv, &[])
    }

    fn bin_op(
        &mut self,
        dst_inst: Option<InstIdx>,
        tag: AirTag,
        lhs_ref: Ref,
        rhs_ref: Ref,
    ) -> InnerResult<MachineValue> {
        let air = self.air;
        let lhs_ty = air.type_of(lhs_ref);

        let size = match tag {
            AirTag::PtrAdd | AirTag::PtrSub => {
                let elem_size = lhs_ty.child_type().abi_size();
                if elem_size != 1 {
                    return Err(self.fail(format!(
                        "TODO implement pointer arithmetic for element size {}",
                        elem_size
                    )));
                }
                8
            }
            _ => {
                let info = match int_like_info(&lhs_ty) {
                    Some(info) => info,
                    None => {
                        return Err(self.fail(format!(
                            "TODO implement binary operations for {:?}",
                            lhs_ty
                        )))
                    }
                };
                if info.bits > 64 {
                    return Err(self
                        .fail("TODO implement arithmetic on integers wider than 64 bits".to_string()));
                }
                lhs_ty.abi_size()
            }
        };

        let lhs = self.resolve_inst(lhs_ref)?;
        let rhs = self.resolve_inst(rhs_ref)?;

        match tag {
            AirTag::Add | AirTag::Sub | AirTag::PtrAdd | AirTag::PtrSub => {
                if let MachineValue::Immediate(imm) = rhs {
                    if imm <= 0xfff {
                        return self
                            .bin_op_immediate(dst_inst, tag, lhs_ref, lhs, imm as u16, size, 0);
                    }
                }
                // Addition commutes, so a small left immediate can swap
                // into the immediate field.
                let commutes = match tag {
                    AirTag::Add | AirTag::PtrAdd => true,
                    _ => false,
                };
                if commutes {
                    if let MachineValue::Immediate(imm) = lhs {
                        if imm <= 0xfff {
                            return self
                                .bin_op_immediate(dst_inst, tag, rhs_ref, rhs, imm as u16, size, 1);
                        }
                    }
                }
                self.bin_op_register(dst_inst, tag, lhs_ref, lhs, rhs_ref, rhs, size)
            }
            AirTag::Mul
            | AirTag::BitAnd
            | AirTag::BitOr
            | AirTag::Xor
            | AirTag::BoolAnd
            | AirTag::BoolOr => self.bin_op_register(dst_inst, tag, lhs_ref, lhs, rhs_ref, rhs, size),
            _ => unreachable!("bin_op on non-binary tag {:?}", tag),
        }
    }

    /// Immediate form of add/sub. `reg_operand_*` is the non-immediate side;
    /// `op_index` is its position for operand-reuse bookkeeping.
    fn bin_op_immediate(
        &mut self,
        dst_inst: Option<InstIdx>,
        tag: AirTag,
        reg_operand_ref: Ref,
        reg_operand: MachineValue,
        imm12: u16,
        size: u64,
        op_index: u32,
    ) -> InnerResult<MachineValue> {
        let operand_is_register = reg_operand.is_register();
        let mut locks = Vec::new();
        let op_reg = match reg_operand {
            MachineValue::Register(reg) => {
                locks.push(self.register_manager.freeze_regs(&[reg]));
                reg
            }
            _ => {
                let ty = self.air.type_of(reg_operand_ref);
                let reg = self.copy_to_tmp_register(&ty, reg_operand)?;
                locks.push(self.register_manager.freeze_regs(&[reg]));
                reg
            }
        };

        let dst_reg = match dst_inst {
            Some(inst)
                if operand_is_register
                    && self.reuse_operand(inst, reg_operand_ref, op_index, reg_operand) =>
            {
                op_reg
            }
            Some(inst) => self.alloc_reg(Some(inst))?,
            None => self.alloc_reg(None)?,
        };

        let rd = register_alias(dst_reg, size);
        let rn = register_alias(op_reg, size);
        match tag {
            AirTag::Add | AirTag::PtrAdd => self.push(MirInst::AddImmediate { rd, rn, imm12 }),
            AirTag::Sub | AirTag::PtrSub => self.push(MirInst::SubImmediate { rd, rn, imm12 }),
            _ => unreachable!("no immediate form for {:?}", tag),
        };
        for lock in locks {
            self.register_manager.unfreeze_regs(lock);
        }
        Ok(MachineValue::Register(dst_reg.to_x()))
    }

    fn bin_op_register(
        &mut self,
        dst_inst: Option<InstIdx>,
        tag: AirTag,
        lhs_ref: Ref,
        lhs: MachineValue,
        rhs_ref: Ref,
        rhs: MachineValue,
        size: u64,
    ) -> InnerResult<MachineValue> {
        let lhs_is_register = lhs.is_register();
        let rhs_is_register = rhs.is_register();
        let mut locks = Vec::new();

        let lhs_reg = match lhs {
            MachineValue::Register(reg) => reg,
            _ => {
                let ty = self.air.type_of(lhs_ref);
                self.copy_to_tmp_register(&ty, lhs)?
            }
        };
        locks.push(self.register_manager.freeze_regs(&[lhs_reg]));
        let rhs_reg = match rhs {
            MachineValue::Register(reg) => reg,
            _ => {
                let ty = self.air.type_of(rhs_ref);
                self.copy_to_tmp_register(&ty, rhs)?
            }
        };
        locks.push(self.register_manager.freeze_regs(&[rhs_reg]));

        let commutative = match tag {
            AirTag::Add | AirTag::Mul | AirTag::BitAnd | AirTag::BitOr | AirTag::Xor
            | AirTag::BoolAnd | AirTag::BoolOr => true,
            _ => false,
        };
        let dst_reg = match dst_inst {
            Some(inst) if lhs_is_register && self.reuse_operand(inst, lhs_ref, 0, lhs) => lhs_reg,
            Some(inst)
                if commutative
                    && rhs_is_register
                    && self.reuse_operand(inst, rhs_ref, 1, rhs) =>
            {
                rhs_reg
            }
            Some(inst) => self.alloc_reg(Some(inst))?,
            None => self.alloc_reg(None)?,
        };

        let rd = register_alias(dst_reg, size);
        let rn = register_alias(lhs_reg, size);
        let rm = register_alias(rhs_reg, size);
        match tag {
            AirTag::Add | AirTag::PtrAdd => {
                self.push(MirInst::AddShiftedRegister { rd, rn, rm, imm6: 0 })
            }
            AirTag::Sub | AirTag::PtrSub => {
                self.push(MirInst::SubShiftedRegister { rd, rn, rm, imm6: 0 })
            }
            AirTag::Mul => self.push(MirInst::Mul { rd, rn, rm }),
            AirTag::BitAnd | AirTag::BoolAnd => {
                self.push(MirInst::AndShiftedRegister { rd, rn, rm, imm6: 0 })
            }
            AirTag::BitOr | AirTag::BoolOr => {
                self.push(MirInst::OrrShiftedRegister { rd, rn, rm, imm6: 0 })
            }
            AirTag::Xor => self.push(MirInst::EorShiftedRegister { rd, rn, rm, imm6: 0 }),
            _ => unreachable!("no register form for {:?}", tag),
        };
        for lock in locks {
            self.register_manager.unfreeze_regs(lock);
        }
        Ok(MachineValue::Register(dst_reg.to_x()))
    }

    fn gen_not(&mut self, inst: InstIdx, operand_ref: Ref) -> InnerResult<()> {
        if self.liveness.is_unused(inst) {
            return self.finish(inst, MachineValue::Dead, &[operand_ref]);
        }
        let operand_ty = self.air.type_of(operand_ref);
        let operand = self.resolve_inst(operand_ref)?;

        let result = match operand {
            // The operator inverts in place; the flags themselves are fine.
            MachineValue::CompareFlagsSigned(op) => MachineValue::CompareFlagsSigned(op.invert()),
            MachineValue::CompareFlagsUnsigned(op) => {
                MachineValue::CompareFlagsUnsigned(op.invert())
            }
            _ => match &operand_ty {
                Type::Bool => {
                    let (op_reg, dst_reg, locks) =
                        self.unary_op_regs(inst, operand_ref, operand, &operand_ty)?;
                    self.push(MirInst::EorImmediate {
                        rd: register_alias(dst_reg, 1),
                        rn: register_alias(op_reg, 1),
                        imm: 1,
                    });
                    for lock in locks {
                        self.register_manager.unfreeze_regs(lock);
                    }
                    MachineValue::Register(dst_reg.to_x())
                }
                Type::Int(info) if info.bits <= 64 => {
                    let size = operand_ty.abi_size();
                    let (op_reg, dst_reg, locks) =
                        self.unary_op_regs(inst, operand_ref, operand, &operand_ty)?;
                    self.push(MirInst::Mvn {
                        rd: register_alias(dst_reg, size),
                        rm: register_alias(op_reg, size),
                        imm6: 0,
                    });
                    for lock in locks {
                        self.register_manager.unfreeze_regs(lock);
                    }
                    MachineValue::Register(dst_reg.to_x())
                }
                other => {
                    return Err(self.fail(format!("TODO implement bitwise not for {:?}", other)))
                }
            },
        };
        self.finish(inst, result, &[operand_ref])
    }

    /// Put a unary operand into a register and pick a destination,
    /// preferring to reuse the operand's register if it dies here.
    fn unary_op_regs(
        &mut self,
        inst: InstIdx,
        operand_ref: Ref,
        operand: MachineValue,
        operand_ty: &Type,
    ) -> InnerResult<(Register, Register, Vec<crate::regalloc::FrozenRegs>)> {
        let operand_is_register = operand.is_register();
        let mut locks = Vec::new();
        let op_reg = match operand {
            MachineValue::Register(reg) => reg,
            _ => self.copy_to_tmp_register(operand_ty, operand)?,
        };
        locks.push(self.register_manager.freeze_regs(&[op_reg]));
        let dst_reg = if operand_is_register && self.reuse_operand(inst, operand_ref, 0, operand) {
            op_reg
        } else {
            self.alloc_reg(Some(inst))?
        };
        Ok((op_reg, dst_reg, locks))
    }

    fn gen_cmp(&mut self, inst: InstIdx, op: CmpOp, lhs_ref: Ref, rhs_ref: Ref) -> InnerResult<()> {
        if self.liveness.is_unused(inst) {
            return self.finish(inst, MachineValue::Dead, &[lhs_ref, rhs_ref]);
        }
        let lhs_ty = self.air.type_of(lhs_ref);
        let info = match int_like_info(&lhs_ty) {
            Some(info) => info,
            None => {
                return Err(self.fail(format!("TODO implement comparisons for {:?}", lhs_ty)))
            }
        };
        if info.bits > 64 {
            return Err(self
                .fail("TODO implement comparisons on integers wider than 64 bits".to_string()));
        }
        let size = lhs_ty.abi_size();

        let lhs = self.resolve_inst(lhs_ref)?;
        let rhs = self.resolve_inst(rhs_ref)?;

        let mut locks = Vec::new();
        let lhs_reg = match lhs {
            MachineValue::Register(reg) => reg,
            _ => self.copy_to_tmp_register(&lhs_ty, lhs)?,
        };
        locks.push(self.register_manager.freeze_regs(&[lhs_reg]));

        match rhs {
            MachineValue::Immediate(imm) if imm <= 0xfff => {
                self.push(MirInst::CmpImmediate {
                    rn: register_alias(lhs_reg, size),
                    imm12: imm as u16,
                });
            }
            _ => {
                let rhs_reg = match rhs {
                    MachineValue::Register(reg) => reg,
                    _ => self.copy_to_tmp_register(&lhs_ty, rhs)?,
                };
                locks.push(self.register_manager.freeze_regs(&[rhs_reg]));
                self.push(MirInst::CmpShiftedRegister {
                    rn: register_alias(lhs_reg, size),
                    rm: register_alias(rhs_reg, size),
                    imm6: 0,
                });
            }
        }
        for lock in locks {
            self.register_manager.unfreeze_regs(lock);
        }

        let result = match info.signedness {
            air::Signedness::Signed => MachineValue::CompareFlagsSigned(op),
            air::Signedness::Unsigned => MachineValue::CompareFlagsUnsigned(op),
        };
        self.finish(inst, result, &[lhs_ref, rhs_ref])
    }

    fn gen_bitcast(&mut self, inst: InstIdx, operand_ref: Ref) -> InnerResult<()> {
        if self.liveness.is_unused(inst) {
            return self.finish(inst, MachineValue::Dead, &[operand_ref]);
        }
        let operand = self.resolve_inst(operand_ref)?;
        self.finish(inst, operand, &[operand_ref])
    }

    fn gen_int_cast(&mut self, inst: InstIdx, operand_ref: Ref) -> InnerResult<()> {
        if self.liveness.is_unused(inst) {
            return self.finish(inst, MachineValue::Dead, &[operand_ref]);
        }
        let operand_info = self.air.type_of(operand_ref).int_info();
        let dest_info = self.air.type_of_index(inst).int_info();
        if operand_info.signedness != dest_info.signedness {
            return Err(self.fail("TODO implement integer casts that change signedness".to_string()));
        }
        if operand_info.bits == dest_info.bits {
            let operand = self.resolve_inst(operand_ref)?;
            return self.finish(inst, operand, &[operand_ref]);
        }
        Err(self.fail(format!(
            "TODO implement integer casts from {} to {} bits",
            operand_info.bits, dest_info.bits
        )))
    }

    fn gen_trunc(&mut self, inst: InstIdx, operand_ref: Ref) -> InnerResult<()> {
        if self.liveness.is_unused(inst) {
            return self.finish(inst, MachineValue::Dead, &[operand_ref]);
        }
        let operand_ty = self.air.type_of(operand_ref);
        let dest_ty = self.air.type_of_index(inst);
        let operand_info = operand_ty.int_info();
        let dest_info = dest_ty.int_info();
        if operand_info.bits > 64 || dest_info.bits > 64 {
            return Err(self
                .fail("TODO implement truncation of integers wider than 64 bits".to_string()));
        }
        let operand = self.resolve_inst(operand_ref)?;
        if operand_info.bits == dest_info.bits {
            return self.finish(inst, operand, &[operand_ref]);
        }
        if dest_info.signedness == air::Signedness::Signed {
            return Err(self.fail("TODO implement signed truncation".to_string()));
        }
        // Mask down to the destination width so later sub-word uses see
        // clean high bits.
        let dest_size = dest_ty.abi_size();
        let (op_reg, dst_reg, locks) = self.unary_op_regs(inst, operand_ref, operand, &operand_ty)?;
        self.push(MirInst::AndImmediate {
            rd: register_alias(dst_reg, dest_size),
            rn: register_alias(op_reg, dest_size),
            imm: if dest_info.bits == 64 {
                u64::max_value()
            } else {
                (1u64 << dest_info.bits) - 1
            },
        });
        for lock in locks {
            self.register_manager.unfreeze_regs(lock);
        }
        self.finish(inst, MachineValue::Register(dst_reg.to_x()), &[operand_ref])
    }

    fn gen_alloc(&mut self, inst: InstIdx) -> InnerResult<()> {
        if self.liveness.is_unused(inst) {
            return self.finish(inst, MachineValue::Dead, &[]);
        }
        let ptr_ty = self.air.type_of_index(inst);
        let elem_ty = ptr_ty.child_type();
        let size = elem_ty.abi_size() as u32;
        let align = elem_ty.abi_alignment();
        let offset = self.frame.alloc(Some(inst), size, align);
        self.finish(inst, MachineValue::PtrStackOffset(offset), &[])
    }

    fn gen_load(&mut self, inst: InstIdx, ptr_ref: Ref) -> InnerResult<()> {
        let elem_ty = self.air.type_of_index(inst);
        if !elem_ty.has_runtime_bits() {
            return self.finish(inst, MachineValue::None, &[ptr_ref]);
        }
        if self.liveness.is_unused(inst) {
            return self.finish(inst, MachineValue::Dead, &[ptr_ref]);
        }
        let ptr_ty = self.air.type_of(ptr_ref);
        let ptr = self.resolve_inst(ptr_ref)?;
        let dst: MachineValue = match ptr {
            // A dying pointer's location can hold the loaded value itself.
            MachineValue::Register(_) | MachineValue::StackOffset(_)
                if self.reuse_operand(inst, ptr_ref, 0, ptr) =>
            {
                ptr
            }
            _ => self.alloc_reg_or_mem(inst, true)?,
        };
        self.load(dst, ptr, &ptr_ty)?;
        self.finish(inst, dst, &[ptr_ref])
    }

    fn gen_store(&mut self, inst: InstIdx, ptr_ref: Ref, value_ref: Ref) -> InnerResult<()> {
        let ptr_ty = self.air.type_of(ptr_ref);
        let value_ty = self.air.type_of(value_ref);
        let ptr = self.resolve_inst(ptr_ref)?;
        let value = self.resolve_inst(value_ref)?;
        self.store(ptr, value, &ptr_ty, &value_ty)?;
        self.finish(inst, MachineValue::Dead, &[ptr_ref, value_ref])
    }

    fn gen_struct_field_ptr(
        &mut self,
        inst: InstIdx,
        base_ref: Ref,
        field: u32,
    ) -> InnerResult<()> {
        if self.liveness.is_unused(inst) {
            return self.finish(inst, MachineValue::Dead, &[base_ref]);
        }
        let base_ty = self.air.type_of(base_ref);
        let field_offset = base_ty.child_type().struct_field_offset(field as usize);
        let base = self.resolve_inst(base_ref)?;
        let result = match base {
            MachineValue::PtrStackOffset(offset) => {
                MachineValue::PtrStackOffset(offset - field_offset as u32)
            }
            MachineValue::Memory(addr) => MachineValue::Memory(addr + field_offset),
            MachineValue::Register(_) => {
                if field_offset > 0xfff {
                    return Err(self
                        .fail(format!("TODO implement field offsets over 4095 ({})", field_offset)));
                }
                let (op_reg, dst_reg, locks) =
                    self.unary_op_regs(inst, base_ref, base, &base_ty)?;
                self.push(MirInst::AddImmediate {
                    rd: dst_reg.to_x(),
                    rn: op_reg.to_x(),
                    imm12: field_offset as u16,
                });
                for lock in locks {
                    self.register_manager.unfreeze_regs(lock);
                }
                MachineValue::Register(dst_reg.to_x())
            }
            other => {
                return Err(self.fail(format!("TODO implement field pointers into {:?}", other)))
            }
        };
        self.finish(inst, result, &[base_ref])
    }

    /// Project the pointer (`word == 0`) or length (`word == 1`) out of a
    /// slice that lives in memory.
    fn gen_slice_field(&mut self, inst: InstIdx, operand_ref: Ref, word: u32) -> InnerResult<()> {
        if self.liveness.is_unused(inst) {
            return self.finish(inst, MachineValue::Dead, &[operand_ref]);
        }
        let operand = self.resolve_inst(operand_ref)?;
        let result = match operand {
            MachineValue::StackOffset(offset) => MachineValue::StackOffset(offset - word * 8),
            MachineValue::Memory(addr) => MachineValue::Memory(addr + u64::from(word) * 8),
            other => {
                return Err(self.fail(format!("TODO implement slice fields of {:?}", other)))
            }
        };
        self.finish(inst, result, &[operand_ref])
    }

    fn gen_is_err(&mut self, inst: InstIdx, operand_ref: Ref, invert: bool) -> InnerResult<()> {
        if self.liveness.is_unused(inst) {
            return self.finish(inst, MachineValue::Dead, &[operand_ref]);
        }
        let operand_ty = self.air.type_of(operand_ref);
        let payload_ty = operand_ty.error_union_payload();
        if payload_ty.has_runtime_bits() {
            return Err(self
                .fail("TODO implement error checks on error unions with payloads".to_string()));
        }
        let size = operand_ty.abi_size();
        let operand = self.resolve_inst(operand_ref)?;

        let mut locks = Vec::new();
        let reg = match operand {
            MachineValue::Register(reg) => reg,
            _ => {
                let reg = self.copy_to_tmp_register(&operand_ty, operand)?;
                locks.push(self.register_manager.freeze_regs(&[reg]));
                reg
            }
        };
        // Error codes are nonzero, so "is an error" is an unsigned
        // comparison against zero.
        self.push(MirInst::CmpImmediate { rn: register_alias(reg, size), imm12: 0 });
        for lock in locks {
            self.register_manager.unfreeze_regs(lock);
        }
        let op = if invert { CmpOp::Lte } else { CmpOp::Gt };
        self.finish(inst, MachineValue::CompareFlagsUnsigned(op), &[operand_ref])
    }

    fn gen_wrap_optional(&mut self, inst: InstIdx, operand_ref: Ref) -> InnerResult<()> {
        if self.liveness.is_unused(inst) {
            return self.finish(inst, MachineValue::Dead, &[operand_ref]);
        }
        let optional_ty = self.air.type_of_index(inst);
        let payload_ty = optional_ty.optional_payload();
        let result = if !payload_ty.has_runtime_bits() {
            // The optional is just its non-null tag.
            MachineValue::Immediate(1)
        } else if payload_ty.is_pointer_like() {
            self.resolve_inst(operand_ref)?
        } else {
            return Err(self.fail("TODO implement wrapping optionals with payloads".to_string()));
        };
        self.finish(inst, result, &[operand_ref])
    }

    fn gen_optional_payload(&mut self, inst: InstIdx, operand_ref: Ref) -> InnerResult<()> {
        if self.liveness.is_unused(inst) {
            return self.finish(inst, MachineValue::Dead, &[operand_ref]);
        }
        let payload_ty = self.air.type_of_index(inst);
        let result = if !payload_ty.has_runtime_bits() {
            MachineValue::None
        } else if payload_ty.is_pointer_like() {
            self.resolve_inst(operand_ref)?
        } else {
            return Err(self
                .fail("TODO implement unwrapping optionals with payloads".to_string()));
        };
        self.finish(inst, result, &[operand_ref])
    }

    fn gen_call(&mut self, inst: InstIdx, callee: Ref, args: &'a [Ref]) -> InnerResult<()> {
        let air = self.air;
        let fn_ty = air.type_of(callee);
        let fn_info = match fn_ty.fn_info() {
            Some(info) => info.clone(),
            None => {
                return Err(self.fail("TODO implement calls through function pointers".to_string()))
            }
        };
        let info = match abi::classify(&fn_info, &self.target) {
            Ok(info) => info,
            Err(err) => return Err(self.fail(err.to_string())),
        };

        for (arg_ref, mc_arg) in args.iter().zip(info.args.iter()) {
            let arg_ty = air.type_of(*arg_ref);
            let arg_mv = self.resolve_inst(*arg_ref)?;
            match mc_arg {
                MachineValue::None => {}
                MachineValue::Register(reg) => {
                    self.gen_set_reg(&arg_ty, *reg, arg_mv)?;
                }
                MachineValue::StackOffset(_) => {
                    return Err(self
                        .fail("TODO implement calling with parameters in memory".to_string()));
                }
                _ => unreachable!("bad parameter classification"),
            }
        }

        // Load the callee address into the link register, then branch
        // through it. How the address materializes depends on the output
        // format.
        match air.value(callee) {
            Some(tv) => match &tv.val {
                Value::Function(atom) => {
                    let callee_mv = match &*self.link_file {
                        LinkFile::MachO(_) => MachineValue::GotLoad(*atom),
                        other => MachineValue::Memory(
                            other.got().unwrap().entry_address(*atom),
                        ),
                    };
                    self.gen_set_reg(&Type::Usize, LR, callee_mv)?;
                    self.push(MirInst::Blr { rn: LR });
                }
                Value::ExternFn(name) => {
                    let is_macho = match self.link_file {
                        LinkFile::MachO(_) => true,
                        _ => false,
                    };
                    if !is_macho {
                        return Err(self.fail(format!(
                            "TODO implement calling extern functions on {}",
                            self.link_file.format_name()
                        )));
                    }
                    let sym_index = match &mut *self.link_file {
                        LinkFile::MachO(macho) => macho.extern_fn_index(name),
                        _ => unreachable!(),
                    };
                    self.push(MirInst::CallExtern {
                        atom_index: self.function.atom_index,
                        sym_index,
                    });
                }
                _ => {
                    return Err(self.fail("TODO implement calling bitcasted values".to_string()))
                }
            },
            None => {
                return Err(self
                    .fail("TODO implement calling runtime-known function pointers".to_string()))
            }
        }

        let result = match info.return_value {
            MachineValue::Register(reg) if reg.alloc_index().is_none() => {
                if self.liveness.is_unused(inst) {
                    MachineValue::Dead
                } else {
                    // Move the result out of the caller-saved return
                    // register so it survives the next call.
                    let ret_ty = fn_info.ret.clone();
                    self.copy_to_new_register(inst, &ret_ty, MachineValue::Register(reg))?
                }
            }
            other => other,
        };

        let total_ops = 1 + args.len();
        if total_ops <= (BPI - 1) as usize {
            let mut ops = Vec::with_capacity(total_ops);
            ops.push(callee);
            ops.extend(args.iter().cloned());
            self.finish(inst, result, &ops)
        } else {
            let deaths: Vec<bool> = {
                let mut bt = self.liveness.big_tomb(inst);
                (0..total_ops).map(|_| bt.feed()).collect()
            };
            for (op, dies) in std::iter::once(&callee).chain(args.iter()).zip(&deaths) {
                if *dies {
                    if let Ref::Inst(op_inst) = op {
                        self.process_death(*op_inst);
                    }
                }
            }
            self.finish_result(inst, result);
            Ok(())
        }
    }

    fn gen_ret(&mut self, inst: InstIdx, operand: Option<Ref>) -> InnerResult<()> {
        if let Some(op_ref) = operand {
            let operand_mv = self.resolve_inst(op_ref)?;
            let ret_mv = self.ret_mv;
            let ret_ty = self.fn_ret_ty.clone();
            self.set_reg_or_mem(&ret_ty, ret_mv, operand_mv)?;
        }
        let reloc = self.push(MirInst::B { target: UNDEFINED_TARGET });
        self.exitlude_jump_relocs.push(reloc);
        let ops: Vec<Ref> = operand.into_iter().collect();
        self.finish(inst, MachineValue::Dead, &ops)
    }

    fn gen_block(&mut self, inst: InstIdx, body: &'a [InstIdx]) -> InnerResult<()> {
        self.blocks
            .insert(inst, BlockData { mcv: MachineValue::None, relocs: Vec::new() });
        self.gen_body(body)?;
        let data = self.blocks.remove(&inst).unwrap();
        let mut relocs = data.relocs;
        // A break that would jump one instruction ahead is dropped instead
        // of patched.
        if let Some(last) = relocs.last().cloned() {
            if last as usize == self.mir.len() - 1 {
                self.mir.pop();
                relocs.pop();
            }
        }
        let target = self.mir.len() as MirIdx;
        for reloc in relocs {
            self.patch_target(reloc, target);
        }
        self.finish(inst, data.mcv, &[])
    }

    fn gen_br(&mut self, inst: InstIdx, block: InstIdx, operand: Option<Ref>) -> InnerResult<()> {
        let block_ty = self.air.type_of_index(block);
        if let Some(op_ref) = operand {
            if block_ty.has_runtime_bits() {
                let operand_mv = self.resolve_inst(op_ref)?;
                let block_mcv = self.blocks.get(&block).unwrap().mcv;
                if block_mcv == MachineValue::None {
                    // The first break decides where the block's value lives.
                    let chosen = match operand_mv {
                        MachineValue::None | MachineValue::Dead | MachineValue::Unreach => {
                            unreachable!("break operand without a value")
                        }
                        MachineValue::Register(_)
                        | MachineValue::StackOffset(_)
                        | MachineValue::Memory(_) => operand_mv,
                        _ => {
                            let new_mv = self.alloc_reg_or_mem(block, true)?;
                            self.set_reg_or_mem(&block_ty, new_mv, operand_mv)?;
                            new_mv
                        }
                    };
                    self.blocks.get_mut(&block).unwrap().mcv = chosen;
                } else {
                    self.set_reg_or_mem(&block_ty, block_mcv, operand_mv)?;
                }
            }
        }
        let reloc = self.push(MirInst::B { target: UNDEFINED_TARGET });
        self.blocks.get_mut(&block).unwrap().relocs.push(reloc);
        let ops: Vec<Ref> = operand.into_iter().collect();
        self.finish(inst, MachineValue::Dead, &ops)
    }

    fn gen_loop(&mut self, inst: InstIdx, body: &'a [InstIdx]) -> InnerResult<()> {
        let start = self.mir.len() as MirIdx;
        self.gen_body(body)?;
        self.push(MirInst::B { target: start });
        self.finish(inst, MachineValue::Unreach, &[])
    }

    fn gen_cond_br(
        &mut self,
        inst: InstIdx,
        cond_ref: Ref,
        then_body: &'a [InstIdx],
        else_body: &'a [InstIdx],
    ) -> InnerResult<()> {
        let cond_ty = self.air.type_of(cond_ref);
        let cond_mv = self.resolve_inst(cond_ref)?;
        let reloc = self.cond_br(&cond_ty, cond_mv)?;

        // If the condition dies here, free it before the branches so both
        // sides plan around the same register file.
        if self.liveness.operand_dies(inst, 0) {
            if let Ref::Inst(cond_inst) = cond_ref {
                self.process_death(cond_inst);
            }
        }

        let (then_deaths, else_deaths): (Vec<u32>, Vec<u32>) = {
            let deaths = self.liveness.get_cond_br(inst);
            (deaths.then_deaths.to_vec(), deaths.else_deaths.to_vec())
        };

        let parent_frame = self.frame.snapshot();
        let parent_regs = self.register_manager.snapshot();

        self.branch_stack.push(Branch::new());
        for death in &then_deaths {
            self.process_death(InstIdx(*death));
        }
        self.gen_body(then_body)?;
        let saved_then_branch = self.branch_stack.pop().unwrap();

        self.register_manager.restore(parent_regs);
        self.frame.restore(parent_frame);
        self.perform_reloc(reloc);

        self.branch_stack.push(Branch::new());
        for death in &else_deaths {
            self.process_death(InstIdx(*death));
        }
        self.gen_body(else_body)?;
        let else_branch = self.branch_stack.pop().unwrap();

        self.reconcile_branches(saved_then_branch, else_branch)?;
        self.finish(inst, MachineValue::Unreach, &[])
    }

    /// Join reconciliation: after both sides ran, make every value that
    /// survives the conditional live in one agreed location, emitting the
    /// relocating moves on the else path (the one we are still on).
    fn reconcile_branches(
        &mut self,
        mut saved_then_branch: Branch,
        else_branch: Branch,
    ) -> InnerResult<()> {
        for (&key, &else_mv) in else_branch.iter() {
            let canon_mv = match saved_then_branch.remove(key) {
                Some(then_mv) => {
                    // Overridden in both branches; the then side's choice
                    // is canonical.
                    if else_mv == MachineValue::Dead {
                        debug_assert!(then_mv == MachineValue::Dead);
                        self.branch_stack.last_mut().unwrap().insert(key, MachineValue::Dead);
                        continue;
                    }
                    self.branch_stack.last_mut().unwrap().insert(key, then_mv);
                    then_mv
                }
                None => {
                    if else_mv == MachineValue::Dead {
                        self.branch_stack.last_mut().unwrap().insert(key, MachineValue::Dead);
                        continue;
                    }
                    // Overridden in the else branch only; relocate back to
                    // wherever the value lived before the conditional.
                    let parent_mv = self.resolved_inst_value(key);
                    debug_assert!(parent_mv != MachineValue::Dead);
                    parent_mv
                }
            };
            if canon_mv != else_mv {
                log::debug!("join: moving {} from {:?} to {:?}", key, else_mv, canon_mv);
                let ty = self.air.type_of_index(key);
                self.set_reg_or_mem(&ty, canon_mv, else_mv)?;
            }
        }
        let remaining: Vec<(InstIdx, MachineValue)> =
            saved_then_branch.iter().map(|(k, v)| (*k, *v)).collect();
        for (key, then_mv) in remaining {
            // Overridden in the then branch only. The else path left the
            // value where the parent had it; move it into the then side's
            // location before falling through to the join.
            // TODO: check the destination is not already occupied before
            // relocating into it.
            if then_mv == MachineValue::Dead {
                self.branch_stack.last_mut().unwrap().insert(key, MachineValue::Dead);
                continue;
            }
            let parent_mv = self.resolved_inst_value(key);
            debug_assert!(parent_mv != MachineValue::Dead);
            self.branch_stack.last_mut().unwrap().insert(key, then_mv);
            if then_mv != parent_mv {
                log::debug!("join: moving {} from {:?} to {:?}", key, parent_mv, then_mv);
                let ty = self.air.type_of_index(key);
                self.set_reg_or_mem(&ty, then_mv, parent_mv)?;
            }
        }
        Ok(())
    }

    /// Emit the branch that skips to the else side when the condition does
    /// not hold, returning its index for patching.
    fn cond_br(&mut self, cond_ty: &Type, cond_mv: MachineValue) -> InnerResult<MirIdx> {
        Ok(match cond_mv {
            MachineValue::CompareFlagsSigned(op) => {
                let cond = Cond::from_cmp_op_signed(op).negate();
                self.push(MirInst::BCond { cond, target: UNDEFINED_TARGET })
            }
            MachineValue::CompareFlagsUnsigned(op) => {
                let cond = Cond::from_cmp_op_unsigned(op).negate();
                self.push(MirInst::BCond { cond, target: UNDEFINED_TARGET })
            }
            _ => {
                let reg = match cond_mv {
                    MachineValue::Register(reg) => reg,
                    _ => self.copy_to_tmp_register(cond_ty, cond_mv)?,
                };
                self.push(MirInst::Cbz {
                    rt: register_alias(reg, cond_ty.abi_size()),
                    target: UNDEFINED_TARGET,
                })
            }
        })
    }

    fn gen_assembly(
        &mut self,
        inst: InstIdx,
        template: &str,
        outputs: &'a [(String, Type)],
        inputs: &'a [(String, Ref)],
    ) -> InnerResult<()> {
        let air = self.air;
        for (constraint, input_ref) in inputs {
            if !(constraint.starts_with('{') && constraint.ends_with('}')) {
                return Err(self.fail(format!(
                    "TODO implement non-register asm input constraints ({})",
                    constraint
                )));
            }
            let name = &constraint[1..constraint.len() - 1];
            let reg: Register = match name.parse() {
                Ok(reg) => reg,
                Err(()) => return Err(self.fail(format!("unrecognized register: {}", name))),
            };
            let ty = air.type_of(*input_ref);
            let mv = self.resolve_inst(*input_ref)?;
            self.gen_set_reg(&ty, reg, mv)?;
        }

        let trimmed = template.trim();
        if let Some(rest) = strip_prefix(trimmed, "svc #") {
            let imm = if let Some(hex) = strip_prefix(rest, "0x") {
                u16::from_str_radix(hex, 16)
            } else {
                rest.parse()
            };
            match imm {
                Ok(imm16) => {
                    self.push(MirInst::Svc { imm16 });
                }
                Err(_) => {
                    return Err(self
                        .fail(format!("unrecognized immediate in assembly: {}", trimmed)))
                }
            }
        } else {
            return Err(self.fail("TODO implement a full inline assembly parser".to_string()));
        }

        let result = match outputs.first() {
            None => MachineValue::None,
            Some((constraint, _)) => {
                if !(constraint.starts_with("={") && constraint.ends_with('}')) {
                    return Err(self.fail(format!(
                        "TODO implement non-register asm output constraints ({})",
                        constraint
                    )));
                }
                let name = &constraint[2..constraint.len() - 1];
                match name.parse::<Register>() {
                    Ok(reg) => MachineValue::Register(reg.to_x()),
                    Err(()) => {
                        return Err(self.fail(format!("unrecognized register: {}", name)))
                    }
                }
            }
        };

        if inputs.len() <= (BPI - 1) as usize {
            let ops: Vec<Ref> = inputs.iter().map(|(_, r)| *r).collect();
            self.finish(inst, result, &ops)
        } else {
            let deaths: Vec<bool> = {
                let mut bt = self.liveness.big_tomb(inst);
                (0..inputs.len()).map(|_| bt.feed()).collect()
            };
            for ((_, op), dies) in inputs.iter().zip(&deaths) {
                if *dies {
                    if let Ref::Inst(op_inst) = op {
                        self.process_death(*op_inst);
                    }
                }
            }
            self.finish_result(inst, result);
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Value movers
    // ------------------------------------------------------------------

    /// Materialize `value` into `loc`, whatever shapes both have.
    fn set_reg_or_mem(
        &mut self,
        ty: &Type,
        loc: MachineValue,
        value: MachineValue,
    ) -> InnerResult<()> {
        match loc {
            MachineValue::None => Ok(()),
            MachineValue::Register(reg) => self.gen_set_reg(ty, reg, value),
            MachineValue::StackOffset(offset) => self.gen_set_stack(ty, offset, value),
            MachineValue::Memory(_) => {
                Err(self.fail("TODO implement storing to absolute addresses".to_string()))
            }
            other => unreachable!("cannot write a value into {:?}", other),
        }
    }

    fn gen_set_reg(&mut self, ty: &Type, reg: Register, value: MachineValue) -> InnerResult<()> {
        let size = ty.abi_size();
        match value {
            MachineValue::Dead => unreachable!("moving a dead value"),
            MachineValue::None | MachineValue::Unreach => Ok(()),
            MachineValue::Undef => {
                // Write the recognizable debug pattern.
                self.gen_set_reg(ty, reg, MachineValue::Immediate(0xaaaa_aaaa_aaaa_aaaa))
            }
            MachineValue::CompareFlagsSigned(op) => {
                let cond = Cond::from_cmp_op_signed(op);
                self.push(MirInst::Cset {
                    rd: register_alias(reg, size),
                    cond: cond.negate(),
                });
                Ok(())
            }
            MachineValue::CompareFlagsUnsigned(op) => {
                let cond = Cond::from_cmp_op_unsigned(op);
                self.push(MirInst::Cset {
                    rd: register_alias(reg, size),
                    cond: cond.negate(),
                });
                Ok(())
            }
            MachineValue::Immediate(imm) => {
                let imm = if size <= 4 { imm & 0xffff_ffff } else { imm };
                let rd = register_alias(reg, size.max(4));
                self.push(MirInst::Movz { rd, imm16: imm as u16, hw: 0 });
                for hw in 1..4 {
                    let chunk = (imm >> (16 * hw)) as u16;
                    if chunk != 0 {
                        self.push(MirInst::Movk { rd, imm16: chunk, hw: hw as u8 });
                    }
                }
                Ok(())
            }
            MachineValue::Register(src) => {
                if src.id() == reg.id() {
                    return Ok(());
                }
                self.push(MirInst::MovRegister {
                    rd: register_alias(reg, size),
                    rm: register_alias(src, size),
                });
                Ok(())
            }
            MachineValue::PtrStackOffset(offset) => {
                if offset > 0xfff {
                    return Err(self
                        .fail(format!("TODO implement stack addresses beyond 4095 ({})", offset)));
                }
                self.push(MirInst::SubImmediate {
                    rd: reg.to_x(),
                    rn: FP,
                    imm12: offset as u16,
                });
                Ok(())
            }
            MachineValue::PtrEmbeddedInCode(_) | MachineValue::EmbeddedInCode(_) => {
                Err(self.fail("TODO implement values embedded in the code stream".to_string()))
            }
            MachineValue::Memory(addr) => {
                // The absolute address first, then a load through it.
                self.gen_set_reg(&Type::Usize, reg, MachineValue::Immediate(addr))?;
                self.push(MirInst::Ldr {
                    rt: register_alias(reg, size),
                    rn: reg.to_x(),
                    offset: 0,
                });
                Ok(())
            }
            MachineValue::GotLoad(sym_index) => {
                self.push(MirInst::LoadMemoryGot {
                    rt: reg.to_x(),
                    atom_index: self.function.atom_index,
                    sym_index,
                });
                Ok(())
            }
            MachineValue::DirectLoad(sym_index) => {
                self.push(MirInst::LoadMemoryDirect {
                    rt: reg.to_x(),
                    atom_index: self.function.atom_index,
                    sym_index,
                });
                Ok(())
            }
            MachineValue::StackOffset(offset) => match size {
                1 => {
                    self.push(MirInst::Ldrb {
                        rt: register_alias(reg, size),
                        rn: FP,
                        offset: -(offset as i32),
                    });
                    Ok(())
                }
                2 => {
                    self.push(MirInst::Ldrh {
                        rt: register_alias(reg, size),
                        rn: FP,
                        offset: -(offset as i32),
                    });
                    Ok(())
                }
                4 | 8 => {
                    self.push(MirInst::Ldr {
                        rt: register_alias(reg, size),
                        rn: FP,
                        offset: -(offset as i32),
                    });
                    Ok(())
                }
                3 | 5 | 6 | 7 => {
                    Err(self.fail(format!("TODO implement loads of {} byte values", size)))
                }
                _ => unreachable!("{} byte value cannot live in a register", size),
            },
        }
    }

    fn gen_set_stack(&mut self, ty: &Type, offset: u32, value: MachineValue) -> InnerResult<()> {
        let size = ty.abi_size();
        match value {
            MachineValue::Dead => unreachable!("moving a dead value"),
            MachineValue::None | MachineValue::Unreach => Ok(()),
            MachineValue::Undef => {
                let pattern = match size {
                    1 => 0xaa,
                    2 => 0xaaaa,
                    4 => 0xaaaa_aaaa,
                    8 => 0xaaaa_aaaa_aaaa_aaaa,
                    _ => {
                        return Err(self
                            .fail(format!("TODO implement memset for {} byte undefs", size)))
                    }
                };
                self.gen_set_stack(ty, offset, MachineValue::Immediate(pattern))
            }
            MachineValue::Immediate(_)
            | MachineValue::PtrStackOffset(_)
            | MachineValue::PtrEmbeddedInCode(_)
            | MachineValue::CompareFlagsSigned(_)
            | MachineValue::CompareFlagsUnsigned(_) => {
                let reg = self.copy_to_tmp_register(ty, value)?;
                let lock = self.register_manager.freeze_regs(&[reg]);
                let result = self.gen_set_stack(ty, offset, MachineValue::Register(reg));
                self.register_manager.unfreeze_regs(lock);
                result
            }
            MachineValue::Register(reg) => match size {
                1 => {
                    self.push(MirInst::Strb {
                        rt: register_alias(reg, size),
                        rn: FP,
                        offset: -(offset as i32),
                    });
                    Ok(())
                }
                2 => {
                    self.push(MirInst::Strh {
                        rt: register_alias(reg, size),
                        rn: FP,
                        offset: -(offset as i32),
                    });
                    Ok(())
                }
                4 | 8 => {
                    self.push(MirInst::Str {
                        rt: register_alias(reg, size),
                        rn: FP,
                        offset: -(offset as i32),
                    });
                    Ok(())
                }
                3 | 5 | 6 | 7 => {
                    Err(self.fail(format!("TODO implement stores of {} byte values", size)))
                }
                _ => unreachable!("{} byte value cannot live in a register", size),
            },
            MachineValue::StackOffset(src_offset) if src_offset == offset => Ok(()),
            MachineValue::StackOffset(_)
            | MachineValue::Memory(_)
            | MachineValue::EmbeddedInCode(_)
            | MachineValue::GotLoad(_)
            | MachineValue::DirectLoad(_) => {
                if size <= 8 {
                    let reg = self.copy_to_tmp_register(ty, value)?;
                    let lock = self.register_manager.freeze_regs(&[reg]);
                    let result = self.gen_set_stack(ty, offset, MachineValue::Register(reg));
                    self.register_manager.unfreeze_regs(lock);
                    return result;
                }
                // Large copies go through an inline byte loop on five
                // scratch registers obtained in one shot.
                let regs = self.alloc_regs(&[None; 5])?;
                let (src, dst, len, count, tmp) = (regs[0], regs[1], regs[2], regs[3], regs[4]);
                let lock = self.register_manager.freeze_regs(&regs);
                let result = (|| -> InnerResult<()> {
                    self.value_address_into_reg(value, src)?;
                    if offset > 0xfff {
                        return Err(self.fail(format!(
                            "TODO implement stack addresses beyond 4095 ({})",
                            offset
                        )));
                    }
                    self.push(MirInst::SubImmediate {
                        rd: dst,
                        rn: FP,
                        imm12: offset as u16,
                    });
                    self.gen_set_reg(&Type::Usize, len, MachineValue::Immediate(size))?;
                    self.gen_inline_memcpy(src, dst, len, count, tmp);
                    Ok(())
                })();
                self.register_manager.unfreeze_regs(lock);
                result
            }
        }
    }

    /// Materialize the *address* of a memory-resident value.
    fn value_address_into_reg(&mut self, value: MachineValue, reg: Register) -> InnerResult<()> {
        match value {
            MachineValue::StackOffset(offset) => {
                self.gen_set_reg(&Type::Usize, reg, MachineValue::PtrStackOffset(offset))
            }
            MachineValue::Memory(addr) => {
                self.gen_set_reg(&Type::Usize, reg, MachineValue::Immediate(addr))
            }
            MachineValue::GotLoad(sym_index) => {
                self.push(MirInst::LoadMemoryPtrGot {
                    rt: reg.to_x(),
                    atom_index: self.function.atom_index,
                    sym_index,
                });
                Ok(())
            }
            MachineValue::DirectLoad(sym_index) => {
                self.push(MirInst::LoadMemoryPtrDirect {
                    rt: reg.to_x(),
                    atom_index: self.function.atom_index,
                    sym_index,
                });
                Ok(())
            }
            other => Err(self.fail(format!("TODO implement taking the address of {:?}", other))),
        }
    }

    /// The canonical inline byte-copy loop.
    fn gen_inline_memcpy(
        &mut self,
        src: Register,
        dst: Register,
        len: Register,
        count: Register,
        tmp: Register,
    ) {
        self.push(MirInst::Movz { rd: count, imm16: 0, hw: 0 });
        let loop_start = self.mir.len() as MirIdx;
        self.push(MirInst::CmpShiftedRegister { rn: count, rm: len, imm6: 0 });
        let exit = self.push(MirInst::BCond { cond: Cond::Ge, target: UNDEFINED_TARGET });
        self.push(MirInst::LdrbRegister { rt: tmp.to_w(), rn: src, rm: count });
        self.push(MirInst::StrbRegister { rt: tmp.to_w(), rn: dst, rm: count });
        self.push(MirInst::AddImmediate { rd: count, rn: count, imm12: 1 });
        self.push(MirInst::B { target: loop_start });
        self.perform_reloc(exit);
    }

    /// Read the value behind `ptr` into `dst`.
    fn load(&mut self, dst: MachineValue, ptr: MachineValue, ptr_ty: &Type) -> InnerResult<()> {
        let elem_ty = ptr_ty.child_type().clone();
        match ptr {
            MachineValue::None
            | MachineValue::Unreach
            | MachineValue::Dead
            | MachineValue::Undef => unreachable!("load through {:?}", ptr),
            MachineValue::CompareFlagsSigned(_) | MachineValue::CompareFlagsUnsigned(_) => {
                unreachable!("a pointer cannot live in the condition flags")
            }
            MachineValue::Immediate(addr) => self.load(dst, MachineValue::Memory(addr), ptr_ty),
            MachineValue::PtrStackOffset(offset) => {
                self.set_reg_or_mem(&elem_ty, dst, MachineValue::StackOffset(offset))
            }
            MachineValue::PtrEmbeddedInCode(offset) => {
                self.set_reg_or_mem(&elem_ty, dst, MachineValue::EmbeddedInCode(offset))
            }
            MachineValue::Register(addr_reg) => {
                let lock = self.register_manager.freeze_regs(&[addr_reg]);
                let result = self.load_from_reg(dst, addr_reg, &elem_ty);
                self.register_manager.unfreeze_regs(lock);
                result
            }
            MachineValue::StackOffset(_)
            | MachineValue::Memory(_)
            | MachineValue::EmbeddedInCode(_)
            | MachineValue::GotLoad(_)
            | MachineValue::DirectLoad(_) => {
                let addr_reg = self.copy_to_tmp_register(ptr_ty, ptr)?;
                let lock = self.register_manager.freeze_regs(&[addr_reg]);
                let result = self.load_from_reg(dst, addr_reg, &elem_ty);
                self.register_manager.unfreeze_regs(lock);
                result
            }
        }
    }

    fn load_from_reg(
        &mut self,
        dst: MachineValue,
        addr_reg: Register,
        elem_ty: &Type,
    ) -> InnerResult<()> {
        let elem_size = elem_ty.abi_size();
        match dst {
            MachineValue::Register(dst_reg) => self.gen_ldr_register(dst_reg, addr_reg, elem_ty),
            MachineValue::StackOffset(offset) => {
                if elem_size <= 8 {
                    let tmp = self.alloc_reg(None)?;
                    let lock = self.register_manager.freeze_regs(&[tmp]);
                    let result = (|| -> InnerResult<()> {
                        self.gen_ldr_register(tmp, addr_reg, elem_ty)?;
                        self.gen_set_stack(elem_ty, offset, MachineValue::Register(tmp))
                    })();
                    self.register_manager.unfreeze_regs(lock);
                    result
                } else {
                    let regs = self.alloc_regs(&[None; 4])?;
                    let (dst_addr, len, count, tmp) = (regs[0], regs[1], regs[2], regs[3]);
                    let lock = self.register_manager.freeze_regs(&regs);
                    let result = (|| -> InnerResult<()> {
                        self.value_address_into_reg(MachineValue::StackOffset(offset), dst_addr)?;
                        self.gen_set_reg(&Type::Usize, len, MachineValue::Immediate(elem_size))?;
                        self.gen_inline_memcpy(addr_reg, dst_addr, len, count, tmp);
                        Ok(())
                    })();
                    self.register_manager.unfreeze_regs(lock);
                    result
                }
            }
            other => unreachable!("load destination {:?}", other),
        }
    }

    /// Write `value` through the pointer `ptr`.
    fn store(
        &mut self,
        ptr: MachineValue,
        value: MachineValue,
        ptr_ty: &Type,
        value_ty: &Type,
    ) -> InnerResult<()> {
        match ptr {
            MachineValue::None
            | MachineValue::Unreach
            | MachineValue::Dead
            | MachineValue::Undef => unreachable!("store through {:?}", ptr),
            MachineValue::CompareFlagsSigned(_) | MachineValue::CompareFlagsUnsigned(_) => {
                unreachable!("a pointer cannot live in the condition flags")
            }
            MachineValue::Immediate(addr) => {
                self.store(MachineValue::Memory(addr), value, ptr_ty, value_ty)
            }
            MachineValue::PtrStackOffset(offset) => self.gen_set_stack(value_ty, offset, value),
            MachineValue::PtrEmbeddedInCode(_) | MachineValue::EmbeddedInCode(_) => {
                Err(self.fail("TODO implement stores into the code stream".to_string()))
            }
            MachineValue::Register(addr_reg) => {
                let lock = self.register_manager.freeze_regs(&[addr_reg]);
                let result = self.store_to_reg(addr_reg, value, value_ty);
                self.register_manager.unfreeze_regs(lock);
                result
            }
            MachineValue::StackOffset(_)
            | MachineValue::Memory(_)
            | MachineValue::GotLoad(_)
            | MachineValue::DirectLoad(_) => {
                let addr_reg = self.copy_to_tmp_register(ptr_ty, ptr)?;
                let lock = self.register_manager.freeze_regs(&[addr_reg]);
                let result = self.store_to_reg(addr_reg, value, value_ty);
                self.register_manager.unfreeze_regs(lock);
                result
            }
        }
    }

    fn store_to_reg(
        &mut self,
        addr_reg: Register,
        value: MachineValue,
        value_ty: &Type,
    ) -> InnerResult<()> {
        let size = value_ty.abi_size();
        match value {
            MachineValue::Register(value_reg) => {
                self.gen_str_register(value_reg, addr_reg, value_ty)
            }
            _ if size <= 8 => {
                let tmp = self.copy_to_tmp_register(value_ty, value)?;
                let lock = self.register_manager.freeze_regs(&[tmp]);
                let result = self.gen_str_register(tmp, addr_reg, value_ty);
                self.register_manager.unfreeze_regs(lock);
                result
            }
            _ => {
                let regs = self.alloc_regs(&[None; 4])?;
                let (src, len, count, tmp) = (regs[0], regs[1], regs[2], regs[3]);
                let lock = self.register_manager.freeze_regs(&regs);
                let result = (|| -> InnerResult<()> {
                    self.value_address_into_reg(value, src)?;
                    self.gen_set_reg(&Type::Usize, len, MachineValue::Immediate(size))?;
                    self.gen_inline_memcpy(src, addr_reg, len, count, tmp);
                    Ok(())
                })();
                self.register_manager.unfreeze_regs(lock);
                result
            }
        }
    }

    fn gen_ldr_register(
        &mut self,
        dst_reg: Register,
        addr_reg: Register,
        ty: &Type,
    ) -> InnerResult<()> {
        let size = ty.abi_size();
        let rt = register_alias(dst_reg, size.min(8));
        let rn = addr_reg.to_x();
        match size {
            1 => {
                self.push(MirInst::Ldrb { rt, rn, offset: 0 });
                Ok(())
            }
            2 => {
                self.push(MirInst::Ldrh { rt, rn, offset: 0 });
                Ok(())
            }
            4 | 8 => {
                self.push(MirInst::Ldr { rt, rn, offset: 0 });
                Ok(())
            }
            3 | 5 | 6 | 7 => Err(self.fail(format!("TODO implement loads of {} byte values", size))),
            _ => unreachable!("{} byte value cannot load into a register", size),
        }
    }

    fn gen_str_register(
        &mut self,
        value_reg: Register,
        addr_reg: Register,
        ty: &Type,
    ) -> InnerResult<()> {
        let size = ty.abi_size();
        let rt = register_alias(value_reg, size.min(8));
        let rn = addr_reg.to_x();
        match size {
            1 => {
                self.push(MirInst::Strb { rt, rn, offset: 0 });
                Ok(())
            }
            2 => {
                self.push(MirInst::Strh { rt, rn, offset: 0 });
                Ok(())
            }
            4 | 8 => {
                self.push(MirInst::Str { rt, rn, offset: 0 });
                Ok(())
            }
            3 | 5 | 6 | 7 => {
                Err(self.fail(format!("TODO implement stores of {} byte values", size)))
            }
            _ => unreachable!("{} byte value cannot store from a register", size),
        }
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn push(&mut self, inst: MirInst) -> MirIdx {
        self.mir.push(inst);
        (self.mir.len() - 1) as MirIdx
    }

    fn perform_reloc(&mut self, reloc: MirIdx) {
        let target = self.mir.len() as MirIdx;
        self.patch_target(reloc, target);
    }

    fn patch_target(&mut self, reloc: MirIdx, new_target: MirIdx) {
        match &mut self.mir[reloc as usize] {
            MirInst::B { target }
            | MirInst::BCond { target, .. }
            | MirInst::Cbz { target, .. } => {
                debug_assert!(*target == UNDEFINED_TARGET);
                *target = new_target;
            }
            other => unreachable!("relocating non-branch {:?}", other),
        }
    }

    fn fail(&mut self, msg: String) -> InnerError {
        debug_assert!(self.err_msg.is_none(), "second failure: {}", msg);
        if self.err_msg.is_none() {
            self.err_msg = Some(msg);
        }
        InnerError::CodegenFail
    }

    /// Current machine value of `inst`, looked up through the branch stack.
    fn resolved_inst_value(&self, inst: InstIdx) -> MachineValue {
        for branch in self.branch_stack.iter().rev() {
            if let Some(mv) = branch.get(inst) {
                return *mv;
            }
        }
        unreachable!("no machine value recorded for {}", inst)
    }

    fn resolve_inst(&mut self, operand: Ref) -> InnerResult<MachineValue> {
        match operand {
            Ref::Inst(inst) => Ok(self.resolved_inst_value(inst)),
            Ref::Value(_) => {
                let air = self.air;
                let tv = air.value(operand).unwrap();
                if !tv.ty.has_runtime_bits() {
                    return Ok(MachineValue::None);
                }
                match &tv.val {
                    Value::Undef => Ok(MachineValue::Undef),
                    Value::Int(x) => {
                        if tv.ty.abi_size() <= 8 {
                            Ok(MachineValue::Immediate(*x))
                        } else {
                            Err(self.fail("TODO implement constants wider than a register".to_string()))
                        }
                    }
                    Value::Function(atom) | Value::Symbol(atom) => Ok(match &*self.link_file {
                        LinkFile::MachO(_) => MachineValue::GotLoad(*atom),
                        other => {
                            MachineValue::Memory(other.got().unwrap().entry_address(*atom))
                        }
                    }),
                    Value::ExternFn(_) => Err(self.fail(
                        "TODO implement extern functions outside call targets".to_string(),
                    )),
                }
            }
        }
    }

    /// Process the tomb bits of up to `BPI - 1` operands, then record the
    /// result.
    fn finish(
        &mut self,
        inst: InstIdx,
        result: MachineValue,
        operands: &[Ref],
    ) -> InnerResult<()> {
        debug_assert!(operands.len() <= (BPI - 1) as usize);
        let tomb_bits = self.liveness.get_tomb_bits(inst);
        for (i, operand) in operands.iter().enumerate() {
            if tomb_bits & (1 << i) == 0 {
                continue;
            }
            if let Ref::Inst(op_inst) = operand {
                self.process_death(*op_inst);
            }
        }
        self.finish_result(inst, result);
        Ok(())
    }

    fn finish_result(&mut self, inst: InstIdx, result: MachineValue) {
        if self.liveness.is_unused(inst) {
            return;
        }
        self.branch_stack.last_mut().unwrap().insert(inst, result);
        if let MachineValue::Register(reg) = result {
            // An operand may have died and freed the very register the
            // result reuses; claim it back under the new owner.
            if reg.alloc_index().is_some() && self.register_manager.is_free(reg) {
                self.register_manager.get_assume_free(reg, inst);
            }
        }
    }

    fn process_death(&mut self, inst: InstIdx) {
        let prev = self.resolved_inst_value(inst);
        log::debug!("death of {} ({:?})", inst, prev);
        self.branch_stack.last_mut().unwrap().insert(inst, MachineValue::Dead);
        if let MachineValue::Register(reg) = prev {
            self.register_manager.free_reg(reg);
        }
    }

    /// If the operand dies here and sits somewhere reusable, take over its
    /// storage and take over the death bookkeeping with it.
    fn reuse_operand(
        &mut self,
        inst: InstIdx,
        operand_ref: Ref,
        op_index: u32,
        mv: MachineValue,
    ) -> bool {
        let op_inst = match operand_ref {
            Ref::Inst(op_inst) => op_inst,
            Ref::Value(_) => return false,
        };
        if !self.liveness.operand_dies(inst, op_index) {
            return false;
        }
        match mv {
            MachineValue::Register(reg) => {
                self.register_manager.set_owner(reg, inst);
                log::debug!("{} reuses {} from {}", inst, reg, op_inst);
            }
            MachineValue::StackOffset(_) => {}
            _ => return false,
        }
        // The generic death processing must not free the storage we just
        // took over.
        self.liveness.clear_operand_death(inst, op_index);
        self.branch_stack.last_mut().unwrap().insert(op_inst, MachineValue::Dead);
        true
    }

    /// Allocate one register, spilling a victim if the pool is dry.
    fn alloc_reg(&mut self, owner: Option<InstIdx>) -> InnerResult<Register> {
        if let Some(reg) = self.register_manager.try_alloc(owner) {
            return Ok(reg);
        }
        self.spill_one_victim()?;
        match self.register_manager.try_alloc(owner) {
            Some(reg) => Ok(reg),
            None => Err(InnerError::OutOfRegisters),
        }
    }

    fn alloc_regs(&mut self, owners: &[Option<InstIdx>]) -> InnerResult<Vec<Register>> {
        loop {
            if let Some(regs) = self.register_manager.try_alloc_many(owners) {
                return Ok(regs);
            }
            self.spill_one_victim()?;
        }
    }

    /// Deterministic spill: the first pool register whose owner is a live
    /// instruction and which nobody has frozen.
    fn spill_one_victim(&mut self) -> InnerResult<()> {
        for reg in ALLOCATABLE_REGS.iter() {
            if self.register_manager.is_frozen(*reg) {
                continue;
            }
            let victim = match self.register_manager.owner(*reg) {
                Some(victim) => victim,
                None => continue,
            };
            self.spill_instruction(*reg, victim)?;
            self.register_manager.free_reg(*reg);
            return Ok(());
        }
        Err(InnerError::OutOfRegisters)
    }

    /// Move a register-resident value out to a fresh stack slot and point
    /// the location table at it.
    fn spill_instruction(&mut self, reg: Register, inst: InstIdx) -> InnerResult<()> {
        let ty = self.air.type_of_index(inst);
        let size = ty.abi_size() as u32;
        let align = ty.abi_alignment();
        let offset = self.frame.alloc(Some(inst), size, align);
        log::debug!("spilling {} from {} to fp-{}", inst, reg, offset);
        self.branch_stack
            .last_mut()
            .unwrap()
            .insert(inst, MachineValue::StackOffset(offset));
        self.gen_set_stack(&ty, offset, MachineValue::Register(reg))
    }

    /// A register for momentary use holding `value`. The caller must freeze
    /// it before anything else can allocate.
    fn copy_to_tmp_register(&mut self, ty: &Type, value: MachineValue) -> InnerResult<Register> {
        let reg = self.alloc_reg(None)?;
        self.gen_set_reg(ty, reg, value)?;
        Ok(reg)
    }

    fn copy_to_new_register(
        &mut self,
        owner: InstIdx,
        ty: &Type,
        value: MachineValue,
    ) -> InnerResult<MachineValue> {
        let reg = self.alloc_reg(Some(owner))?;
        self.gen_set_reg(ty, reg, value)?;
        Ok(MachineValue::Register(reg.to_x()))
    }

    /// A register for the result if the type fits and one is free,
    /// otherwise a stack slot.
    fn alloc_reg_or_mem(&mut self, inst: InstIdx, reg_ok: bool) -> InnerResult<MachineValue> {
        let ty = self.air.type_of_index(inst);
        if !ty.has_runtime_bits() {
            return Ok(MachineValue::None);
        }
        let size = ty.abi_size();
        if reg_ok && size <= 8 {
            if let Some(reg) = self.register_manager.try_alloc(Some(inst)) {
                return Ok(MachineValue::Register(reg));
            }
        }
        let offset = self.frame.alloc(Some(inst), size as u32, ty.abi_alignment());
        Ok(MachineValue::StackOffset(offset))
    }
}

/// The integer interpretation the comparison and arithmetic lowerers work
/// on, if the type has one.
fn int_like_info(ty: &Type) -> Option<air::IntInfo> {
    match ty {
        Type::Bool | Type::Int(_) | Type::Usize | Type::Pointer(_) | Type::ErrorSet => {
            Some(ty.int_info())
        }
        _ => None,
    }
}

fn strip_prefix<'s>(s: &'s str, prefix: &str) -> Option<&'s str> {
    if s.starts_with(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{GotTable, MachOFile};
    use crate::registers::Register as R;
    use crate::Os;
    use air::{Builder, FnInfo, Signedness, TypedValue};

    fn function(ret: Type, params: Vec<Type>, cc: CallConv) -> Function {
        Function {
            name: "test_fn".to_string(),
            ty: Type::Fn(Box::new(FnInfo { params, ret, cc })),
            atom_index: 7,
            src_loc: SrcLoc { line: 1, column: 1 },
            rbrace_src: SrcLoc { line: 9, column: 2 },
        }
    }

    fn gen_on(
        function: &Function,
        air: &Air,
        link_file: &mut LinkFile,
        os: Os,
    ) -> Result<Mir, CodegenError> {
        let liveness = Liveness::analyze(air);
        let mut debug = DebugInfoOutput::None;
        generate(function, air, liveness, Target { os }, link_file, &mut debug)
    }

    fn gen_elf(function: &Function, air: &Air) -> Result<Mir, CodegenError> {
        let mut link = LinkFile::Elf(GotTable::new(0x8000));
        gen_on(function, air, &mut link, Os::Linux)
    }

    fn u32_ty() -> Type {
        Type::int(Signedness::Unsigned, 32)
    }

    #[test]
    fn a_function_of_only_unreachable_emits_just_the_frame() {
        let mut b = Builder::new();
        let un = b.push(AirInst::Unreach);
        let air = b.finish(vec![un]);
        let f = function(Type::Void, vec![], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap();
        assert_eq!(
            mir.instructions,
            vec![
                MirInst::StpPreIndex { rt: FP, rt2: LR, rn: R::Sp, offset: -16 },
                MirInst::PushRegs { mask: 0 },
                MirInst::MovToFromSp { rd: FP, rn: R::Sp },
                MirInst::SubImmediate { rd: R::Sp, rn: R::Sp, imm12: 0 },
                MirInst::DbgPrologueEnd,
                MirInst::DbgEpilogueBegin,
                MirInst::AddImmediate { rd: R::Sp, rn: R::Sp, imm12: 0 },
                MirInst::PopRegs { mask: 0 },
                MirInst::LdpPostIndex { rt: FP, rt2: LR, rn: R::Sp, offset: 16 },
                MirInst::Ret { rn: LR },
                MirInst::DbgLine { line: 9, column: 2 },
            ],
        );
    }

    #[test]
    fn naked_functions_have_no_frame() {
        let mut b = Builder::new();
        let un = b.push(AirInst::Unreach);
        let air = b.finish(vec![un]);
        let f = function(Type::Void, vec![], CallConv::Naked);
        let mir = gen_elf(&f, &air).unwrap();
        assert_eq!(
            mir.instructions,
            vec![
                MirInst::DbgPrologueEnd,
                MirInst::DbgEpilogueBegin,
                MirInst::DbgLine { line: 9, column: 2 },
            ],
        );
    }

    #[test]
    fn returning_an_argument_homes_it_on_the_stack() {
        let mut b = Builder::new();
        let x = b.push(AirInst::Arg { ty: Type::i32(), name: "x".to_string() });
        let ret = b.push(AirInst::Ret { operand: Some(Ref::Inst(x)) });
        let air = b.finish(vec![x, ret]);
        let f = function(Type::i32(), vec![Type::i32()], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap().instructions;

        // The parameter home: written on entry, read back for the return.
        assert_eq!(mir[5], MirInst::Str { rt: R::w0, rn: FP, offset: -4 });
        assert_eq!(mir[6], MirInst::Ldr { rt: R::w0, rn: FP, offset: -4 });
        assert_eq!(mir[3], MirInst::SubImmediate { rd: R::Sp, rn: R::Sp, imm12: 16 });
        // The lone exit jump lands on the next instruction and is elided.
        assert!(mir.iter().all(|inst| match inst {
            MirInst::B { .. } => false,
            _ => true,
        }));
    }

    #[test]
    fn additions_with_small_immediates_use_the_immediate_form() {
        for &(imm, folds) in &[(4095u64, true), (4096u64, false)] {
            let mut b = Builder::new();
            let x = b.push(AirInst::Arg { ty: Type::i32(), name: "x".to_string() });
            let one = b.value(TypedValue::int(Type::i32(), 1));
            let base = b.push(AirInst::Add { lhs: Ref::Inst(x), rhs: one });
            let big = b.value(TypedValue::int(Type::i32(), imm));
            let sum = b.push(AirInst::Add { lhs: Ref::Inst(base), rhs: big });
            let ret = b.push(AirInst::Ret { operand: Some(Ref::Inst(sum)) });
            let air = b.finish(vec![x, base, sum, ret]);
            let f = function(Type::i32(), vec![Type::i32()], CallConv::C);
            let mir = gen_elf(&f, &air).unwrap().instructions;

            if folds {
                // The destination reuses the dying left operand's register.
                assert!(mir.contains(&MirInst::AddImmediate {
                    rd: R::w20,
                    rn: R::w20,
                    imm12: 4095,
                }));
            } else {
                assert!(mir.contains(&MirInst::AddShiftedRegister {
                    rd: R::w20,
                    rn: R::w20,
                    rm: R::w19,
                    imm6: 0,
                }));
            }
        }
    }

    #[test]
    fn conditional_values_agree_on_a_join_location() {
        let mut b = Builder::new();
        let c = b.push(AirInst::Arg { ty: Type::Bool, name: "c".to_string() });
        let block = b.reserve();
        let cond_br = b.reserve();
        let one = b.value(TypedValue::int(Type::i32(), 1));
        let two = b.value(TypedValue::int(Type::i32(), 2));
        let br1 = b.push(AirInst::Br { block, operand: Some(one) });
        let br2 = b.push(AirInst::Br { block, operand: Some(two) });
        b.set(cond_br, AirInst::CondBr {
            cond: Ref::Inst(c),
            then_body: vec![br1],
            else_body: vec![br2],
        });
        b.set(block, AirInst::Block { ty: Type::i32(), body: vec![cond_br] });
        let ret = b.push(AirInst::Ret { operand: Some(Ref::Inst(block)) });
        let air = b.finish(vec![c, block, ret]);
        let f = function(Type::i32(), vec![Type::Bool], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap().instructions;

        // Both sides materialize their constant into the block's register.
        let movz: Vec<(Register, u16)> = mir
            .iter()
            .filter_map(|inst| match inst {
                MirInst::Movz { rd, imm16, .. } => Some((*rd, *imm16)),
                _ => None,
            })
            .collect();
        assert!(movz.contains(&(R::w19, 1)));
        assert!(movz.contains(&(R::w19, 2)));
        assert!(mir.iter().any(|inst| match inst {
            MirInst::Cbz { .. } => true,
            _ => false,
        }));
        // The agreed register feeds the return.
        assert!(mir.contains(&MirInst::MovRegister { rd: R::w0, rm: R::w19 }));
    }

    #[test]
    fn comparisons_branch_on_the_negated_condition() {
        let mut b = Builder::new();
        let x = b.push(AirInst::Arg { ty: u32_ty(), name: "x".to_string() });
        let y = b.push(AirInst::Arg { ty: u32_ty(), name: "y".to_string() });
        let cmp = b.push(AirInst::Cmp { op: CmpOp::Lt, lhs: Ref::Inst(x), rhs: Ref::Inst(y) });
        let ret_then = b.push(AirInst::Ret { operand: None });
        let ret_else = b.push(AirInst::Ret { operand: None });
        let cb = b.push(AirInst::CondBr {
            cond: Ref::Inst(cmp),
            then_body: vec![ret_then],
            else_body: vec![ret_else],
        });
        let air = b.finish(vec![x, y, cmp, cb]);
        let f = function(Type::Void, vec![u32_ty(), u32_ty()], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap().instructions;

        // The skip-to-else branch tests the complement of unsigned `<`.
        assert!(mir.iter().any(|inst| match inst {
            MirInst::BCond { cond: Cond::Cs, .. } => true,
            _ => false,
        }));
        // One exit jump survives (the other fell through to the epilogue);
        // it lands on the stack teardown.
        let exits: Vec<u32> = mir
            .iter()
            .filter_map(|inst| match inst {
                MirInst::B { target } => Some(*target),
                _ => None,
            })
            .collect();
        assert_eq!(exits.len(), 1);
        assert_eq!(
            mir[exits[0] as usize],
            MirInst::AddImmediate { rd: R::Sp, rn: R::Sp, imm12: 16 },
        );
    }

    #[test]
    fn double_negation_of_flags_emits_no_extra_code() {
        let mut b = Builder::new();
        let x = b.push(AirInst::Arg { ty: u32_ty(), name: "x".to_string() });
        let y = b.push(AirInst::Arg { ty: u32_ty(), name: "y".to_string() });
        let cmp = b.push(AirInst::Cmp { op: CmpOp::Lt, lhs: Ref::Inst(x), rhs: Ref::Inst(y) });
        let n1 = b.push(AirInst::Not { operand: Ref::Inst(cmp) });
        let n2 = b.push(AirInst::Not { operand: Ref::Inst(n1) });
        let ret = b.push(AirInst::Ret { operand: Some(Ref::Inst(n2)) });
        let air = b.finish(vec![x, y, cmp, n1, n2, ret]);
        let f = function(Type::Bool, vec![u32_ty(), u32_ty()], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap().instructions;

        let csets: Vec<&MirInst> = mir
            .iter()
            .filter(|inst| match inst {
                MirInst::Cset { .. } => true,
                _ => false,
            })
            .collect();
        assert_eq!(csets.len(), 1);
        // Unsigned `<` is cc; the stored condition is its negation.
        assert_eq!(*csets[0], MirInst::Cset { rd: R::w0, cond: Cond::Cs });
        assert!(mir.iter().all(|inst| match inst {
            MirInst::EorImmediate { .. } | MirInst::Mvn { .. } => false,
            _ => true,
        }));
    }

    #[test]
    fn boolean_not_flips_the_low_bit() {
        let mut b = Builder::new();
        let x = b.push(AirInst::Arg { ty: Type::Bool, name: "x".to_string() });
        let n = b.push(AirInst::Not { operand: Ref::Inst(x) });
        let ret = b.push(AirInst::Ret { operand: Some(Ref::Inst(n)) });
        let air = b.finish(vec![x, n, ret]);
        let f = function(Type::Bool, vec![Type::Bool], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap().instructions;
        assert!(mir.iter().any(|inst| match inst {
            MirInst::EorImmediate { imm: 1, .. } => true,
            _ => false,
        }));
    }

    #[test]
    fn error_checks_compare_the_code_against_zero() {
        let eu = Type::ErrorUnion { payload: Box::new(Type::Void) };
        for &(invert, stored_cond) in &[(false, Cond::Ls), (true, Cond::Hi)] {
            let mut b = Builder::new();
            let e = b.push(AirInst::Arg { ty: eu.clone(), name: "e".to_string() });
            let check = if invert {
                b.push(AirInst::IsNonErr { operand: Ref::Inst(e) })
            } else {
                b.push(AirInst::IsErr { operand: Ref::Inst(e) })
            };
            let ret = b.push(AirInst::Ret { operand: Some(Ref::Inst(check)) });
            let air = b.finish(vec![e, check, ret]);
            let f = function(Type::Bool, vec![eu.clone()], CallConv::C);
            let mir = gen_elf(&f, &air).unwrap().instructions;

            assert!(mir.contains(&MirInst::CmpImmediate { rn: R::w19, imm12: 0 }));
            assert!(mir.contains(&MirInst::Cset { rd: R::w0, cond: stored_cond }));
        }
    }

    #[test]
    fn register_pressure_forces_a_spill_to_the_stack() {
        let mut b = Builder::new();
        let x = b.push(AirInst::Arg { ty: Type::i32(), name: "x".to_string() });
        let mut body = vec![x];
        let mut vals = Vec::new();
        for i in 1..=11 {
            let c = b.value(TypedValue::int(Type::i32(), i));
            let v = b.push(AirInst::Add { lhs: Ref::Inst(x), rhs: c });
            vals.push(v);
            body.push(v);
        }
        let mut acc = vals[0];
        for v in &vals[1..] {
            acc = b.push(AirInst::Add { lhs: Ref::Inst(acc), rhs: Ref::Inst(*v) });
            body.push(acc);
        }
        let ret = b.push(AirInst::Ret { operand: Some(Ref::Inst(acc)) });
        body.push(ret);
        let air = b.finish(body);
        let f = function(Type::i32(), vec![Type::i32()], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap().instructions;

        // Every pool register was touched, so every one is saved.
        assert_eq!(mir[1], MirInst::PushRegs { mask: 0x3ff });
        // Something had to move out to the frame to make room.
        assert!(mir.iter().any(|inst| match inst {
            MirInst::Str { rt: R::w20, rn, .. } => *rn == FP,
            _ => false,
        }));
    }

    #[test]
    fn loops_branch_back_to_their_first_instruction() {
        let mut b = Builder::new();
        let p = b.push(AirInst::Alloc { ty: Type::Pointer(Box::new(Type::i32())) });
        let zero = b.value(TypedValue::int(Type::i32(), 0));
        let init = b.push(AirInst::Store { ptr: Ref::Inst(p), value: zero });
        let ld = b.push(AirInst::Load { ptr: Ref::Inst(p) });
        let one = b.value(TypedValue::int(Type::i32(), 1));
        let inc = b.push(AirInst::Add { lhs: Ref::Inst(ld), rhs: one });
        let st = b.push(AirInst::Store { ptr: Ref::Inst(p), value: Ref::Inst(inc) });
        let lp = b.push(AirInst::Loop { body: vec![ld, inc, st] });
        let air = b.finish(vec![p, init, lp]);
        let f = function(Type::Void, vec![], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap().instructions;

        let back_edge = mir
            .iter()
            .find_map(|inst| match inst {
                MirInst::B { target } => Some(*target),
                _ => None,
            })
            .unwrap();
        // The back edge lands on the counter reload.
        assert!(match &mir[back_edge as usize] {
            MirInst::Ldr { rn, .. } => *rn == FP,
            _ => false,
        });
    }

    fn big_frame(slots: usize) -> (Function, Air) {
        let mut b = Builder::new();
        let zero = b.value(TypedValue::int(Type::u64(), 0));
        let mut body = Vec::new();
        for _ in 0..slots {
            let p = b.push(AirInst::Alloc { ty: Type::Pointer(Box::new(Type::u64())) });
            let st = b.push(AirInst::Store { ptr: Ref::Inst(p), value: zero });
            body.push(p);
            body.push(st);
        }
        let un = b.push(AirInst::Unreach);
        body.push(un);
        (function(Type::Void, vec![], CallConv::C), b.finish(body))
    }

    #[test]
    fn frames_must_fit_the_subtract_immediate() {
        let (f, air) = big_frame(510); // 4080 bytes of locals
        assert!(gen_elf(&f, &air).is_ok());

        let (f, air) = big_frame(512); // 4096 bytes of locals
        match gen_elf(&f, &air) {
            Err(CodegenError::CodegenFail { msg, .. }) => {
                assert!(msg.contains("stack frame too large"), "message was: {}", msg)
            }
            other => panic!("expected a frame-size failure, got {:?}", other),
        }
    }

    #[test]
    fn calls_load_the_callee_address_into_the_link_register() {
        let mut b = Builder::new();
        let callee_ty = Type::Fn(Box::new(FnInfo {
            params: vec![],
            ret: Type::Void,
            cc: CallConv::C,
        }));
        let callee = b.value(TypedValue::new(callee_ty, Value::Function(2)));
        let call = b.push(AirInst::Call { callee, args: vec![] });
        let ret = b.push(AirInst::Ret { operand: None });
        let air = b.finish(vec![call, ret]);
        let f = function(Type::Void, vec![], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap().instructions;

        // GOT base 0x8000, atom 2: a void call is address setup plus blr,
        // nothing else.
        assert_eq!(mir[4], MirInst::DbgPrologueEnd);
        assert_eq!(mir[5], MirInst::Movz { rd: R::x30, imm16: 0x8010, hw: 0 });
        assert_eq!(mir[6], MirInst::Ldr { rt: R::x30, rn: R::x30, offset: 0 });
        assert_eq!(mir[7], MirInst::Blr { rn: R::x30 });
        assert_eq!(mir[8], MirInst::DbgEpilogueBegin);
    }

    #[test]
    fn extern_calls_on_mach_o_defer_to_relocations() {
        let mut b = Builder::new();
        let s = b.value(TypedValue::new(
            Type::Pointer(Box::new(Type::u8())),
            Value::Symbol(5),
        ));
        let callee_ty = Type::Fn(Box::new(FnInfo {
            params: vec![Type::Pointer(Box::new(Type::u8()))],
            ret: Type::i32(),
            cc: CallConv::C,
        }));
        let callee = b.value(TypedValue::new(callee_ty, Value::ExternFn("puts".to_string())));
        let call = b.push(AirInst::Call { callee, args: vec![s] });
        let ret = b.push(AirInst::Ret { operand: Some(Ref::Inst(call)) });
        let air = b.finish(vec![call, ret]);
        let f = function(Type::i32(), vec![], CallConv::C);
        let mut link = LinkFile::MachO(MachOFile::new());
        let mir = gen_on(&f, &air, &mut link, Os::Macos).unwrap().instructions;

        assert!(mir.contains(&MirInst::LoadMemoryGot {
            rt: R::x0,
            atom_index: 7,
            sym_index: 5,
        }));
        assert!(mir.contains(&MirInst::CallExtern { atom_index: 7, sym_index: 0 }));
        // The result moves out of x0 to survive later calls, then back for
        // the return.
        assert!(mir.contains(&MirInst::MovRegister { rd: R::w19, rm: R::w0 }));
        assert!(mir.contains(&MirInst::MovRegister { rd: R::w0, rm: R::w19 }));
    }

    #[test]
    fn inline_assembly_supports_supervisor_calls() {
        let mut b = Builder::new();
        let nr = b.value(TypedValue::int(Type::u64(), 64));
        let asm = b.push(AirInst::Assembly {
            template: "svc #0x80".to_string(),
            outputs: vec![],
            inputs: vec![("{x8}".to_string(), nr)],
        });
        let un = b.push(AirInst::Unreach);
        let air = b.finish(vec![asm, un]);
        let f = function(Type::Void, vec![], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap().instructions;

        assert!(mir.contains(&MirInst::Movz { rd: R::x8, imm16: 64, hw: 0 }));
        assert!(mir.contains(&MirInst::Svc { imm16: 0x80 }));
    }

    #[test]
    fn unknown_asm_registers_are_rejected() {
        let mut b = Builder::new();
        let nr = b.value(TypedValue::int(Type::u64(), 64));
        let asm = b.push(AirInst::Assembly {
            template: "svc #0".to_string(),
            outputs: vec![],
            inputs: vec![("{q0}".to_string(), nr)],
        });
        let air = b.finish(vec![asm]);
        let f = function(Type::Void, vec![], CallConv::C);
        match gen_elf(&f, &air) {
            Err(CodegenError::CodegenFail { msg, .. }) => {
                assert_eq!(msg, "unrecognized register: q0")
            }
            other => panic!("expected a failure, got {:?}", other),
        }
    }

    #[test]
    fn unimplemented_operations_report_structured_errors() {
        let mut b = Builder::new();
        let x = b.push(AirInst::Arg { ty: Type::i32(), name: "x".to_string() });
        let sw = b.push(AirInst::SwitchBr { operand: Ref::Inst(x) });
        let air = b.finish(vec![x, sw]);
        let f = function(Type::Void, vec![Type::i32()], CallConv::C);
        match gen_elf(&f, &air) {
            Err(CodegenError::CodegenFail { msg, src_loc }) => {
                assert!(msg.contains("switch"), "message was: {}", msg);
                assert_eq!(src_loc.to_string(), "1:1");
            }
            other => panic!("expected a failure, got {:?}", other),
        }
    }

    #[test]
    fn values_survive_a_store_load_round_trip() {
        let mut b = Builder::new();
        let p = b.push(AirInst::Alloc { ty: Type::Pointer(Box::new(Type::i32())) });
        let seven = b.value(TypedValue::int(Type::i32(), 7));
        let st = b.push(AirInst::Store { ptr: Ref::Inst(p), value: seven });
        let ld = b.push(AirInst::Load { ptr: Ref::Inst(p) });
        let ret = b.push(AirInst::Ret { operand: Some(Ref::Inst(ld)) });
        let air = b.finish(vec![p, st, ld, ret]);
        let f = function(Type::i32(), vec![], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap().instructions;

        assert!(mir.iter().any(|inst| match inst {
            MirInst::Movz { imm16: 7, .. } => true,
            _ => false,
        }));
        assert!(mir.contains(&MirInst::Str { rt: R::w19, rn: FP, offset: -4 }));
        assert!(mir.contains(&MirInst::Ldr { rt: R::w19, rn: FP, offset: -4 }));
        assert!(mir.contains(&MirInst::MovRegister { rd: R::w0, rm: R::w19 }));
    }

    #[test]
    fn undefined_values_write_the_recognizable_pattern() {
        let mut b = Builder::new();
        let p = b.push(AirInst::Alloc { ty: Type::Pointer(Box::new(Type::i32())) });
        let undef = b.value(TypedValue::new(Type::i32(), Value::Undef));
        let st = b.push(AirInst::Store { ptr: Ref::Inst(p), value: undef });
        let un = b.push(AirInst::Unreach);
        let air = b.finish(vec![p, st, un]);
        let f = function(Type::Void, vec![], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap().instructions;

        assert!(mir.iter().any(|inst| match inst {
            MirInst::Movz { imm16: 0xaaaa, hw: 0, .. } => true,
            _ => false,
        }));
        assert!(mir.iter().any(|inst| match inst {
            MirInst::Movk { imm16: 0xaaaa, hw: 1, .. } => true,
            _ => false,
        }));
    }

    #[test]
    fn optionals_with_zero_sized_payloads_wrap_as_their_tag() {
        let opt = Type::Optional(Box::new(Type::Void));
        let mut b = Builder::new();
        let payload = b.value(TypedValue::int(Type::Void, 0));
        let wrapped = b.push(AirInst::WrapOptional { ty: opt.clone(), operand: payload });
        let ret = b.push(AirInst::Ret { operand: Some(Ref::Inst(wrapped)) });
        let air = b.finish(vec![wrapped, ret]);
        let f = function(opt, vec![], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap().instructions;

        assert!(mir.contains(&MirInst::Movz { rd: R::w0, imm16: 1, hw: 0 }));
    }

    #[test]
    fn truncation_masks_to_the_target_width() {
        let mut b = Builder::new();
        let x = b.push(AirInst::Arg { ty: Type::u64(), name: "x".to_string() });
        let t = b.push(AirInst::Trunc { ty: Type::u8(), operand: Ref::Inst(x) });
        let ret = b.push(AirInst::Ret { operand: Some(Ref::Inst(t)) });
        let air = b.finish(vec![x, t, ret]);
        let f = function(Type::u8(), vec![Type::u64()], CallConv::C);
        let mir = gen_elf(&f, &air).unwrap().instructions;

        assert!(mir.iter().any(|inst| match inst {
            MirInst::AndImmediate { imm: 0xff, .. } => true,
            _ => false,
        }));
    }
}
