//! The per-function, SSA-like intermediate representation handed to the
//! backend. Instructions live in one dense arena; bodies (the main body,
//! block bodies, branch bodies) are ordered lists of instruction indices.

use crate::types::Type;
use crate::value::TypedValue;
use std::fmt;
use strum_macros::*;

/// Dense index of an instruction within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstIdx(pub u32);

impl fmt::Display for InstIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Index into the constant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueIdx(pub u32);

/// An operand: either another instruction or a typed constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ref {
    Inst(InstIdx),
    Value(ValueIdx),
}

/// Comparison operator carried by `Cmp` instructions and by the
/// condition-flag machine values derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Lte,
    Eq,
    Gte,
    Gt,
    Neq,
}

impl CmpOp {
    /// The complementary operator: `a op b == !(a op.invert() b)`.
    pub fn invert(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Gte,
            CmpOp::Lte => CmpOp::Gt,
            CmpOp::Eq => CmpOp::Neq,
            CmpOp::Gte => CmpOp::Lt,
            CmpOp::Gt => CmpOp::Lte,
            CmpOp::Neq => CmpOp::Eq,
        }
    }
}

#[derive(Debug, Clone, EnumDiscriminants)]
pub enum Inst {
    /// The `index`-th runtime parameter of the function.
    Arg { ty: Type, name: String },
    Add { lhs: Ref, rhs: Ref },
    Sub { lhs: Ref, rhs: Ref },
    Mul { lhs: Ref, rhs: Ref },
    BitAnd { lhs: Ref, rhs: Ref },
    BitOr { lhs: Ref, rhs: Ref },
    Xor { lhs: Ref, rhs: Ref },
    BoolAnd { lhs: Ref, rhs: Ref },
    BoolOr { lhs: Ref, rhs: Ref },
    /// Pointer offset by element count; the result is the pointer type.
    PtrAdd { lhs: Ref, rhs: Ref },
    PtrSub { lhs: Ref, rhs: Ref },
    Not { operand: Ref },
    Cmp { op: CmpOp, lhs: Ref, rhs: Ref },
    Bitcast { ty: Type, operand: Ref },
    IntCast { ty: Type, operand: Ref },
    Trunc { ty: Type, operand: Ref },
    /// Reserve a stack slot; `ty` is the resulting pointer type.
    Alloc { ty: Type },
    Load { ptr: Ref },
    Store { ptr: Ref, value: Ref },
    /// Pointer to field `field` of the struct behind `base`; `ty` is the
    /// resulting pointer type.
    StructFieldPtr { ty: Type, base: Ref, field: u32 },
    SlicePtr { operand: Ref },
    SliceLen { operand: Ref },
    IsErr { operand: Ref },
    IsNonErr { operand: Ref },
    WrapOptional { ty: Type, operand: Ref },
    OptionalPayload { ty: Type, operand: Ref },
    Call { callee: Ref, args: Vec<Ref> },
    Ret { operand: Option<Ref> },
    RetLoad { ptr: Ref },
    Block { ty: Type, body: Vec<InstIdx> },
    Br { block: InstIdx, operand: Option<Ref> },
    Loop { body: Vec<InstIdx> },
    /// Always the final instruction of its enclosing body.
    CondBr { cond: Ref, then_body: Vec<InstIdx>, else_body: Vec<InstIdx> },
    SwitchBr { operand: Ref },
    Unreach,
    Breakpoint,
    DbgStmt { line: u32, column: u32 },
    Assembly {
        template: String,
        outputs: Vec<(String, Type)>,
        inputs: Vec<(String, Ref)>,
    },
}

impl Inst {
    /// All operand references, in the order their tomb bits are assigned.
    pub fn operands(&self) -> Vec<Ref> {
        use self::Inst::*;
        match self {
            Arg { .. } | Alloc { .. } | Unreach | Breakpoint | DbgStmt { .. } => vec![],
            Add { lhs, rhs }
            | Sub { lhs, rhs }
            | Mul { lhs, rhs }
            | BitAnd { lhs, rhs }
            | BitOr { lhs, rhs }
            | Xor { lhs, rhs }
            | BoolAnd { lhs, rhs }
            | BoolOr { lhs, rhs }
            | PtrAdd { lhs, rhs }
            | PtrSub { lhs, rhs }
            | Cmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Not { operand }
            | Bitcast { operand, .. }
            | IntCast { operand, .. }
            | Trunc { operand, .. }
            | Load { ptr: operand }
            | RetLoad { ptr: operand }
            | SlicePtr { operand }
            | SliceLen { operand }
            | IsErr { operand }
            | IsNonErr { operand }
            | WrapOptional { operand, .. }
            | OptionalPayload { operand, .. }
            | SwitchBr { operand }
            | CondBr { cond: operand, .. } => vec![*operand],
            StructFieldPtr { base, .. } => vec![*base],
            Store { ptr, value } => vec![*ptr, *value],
            Call { callee, args } => {
                let mut ops = Vec::with_capacity(1 + args.len());
                ops.push(*callee);
                ops.extend(args.iter().cloned());
                ops
            }
            Ret { operand } | Br { operand, .. } => operand.iter().cloned().collect(),
            Block { .. } | Loop { .. } => vec![],
            Assembly { inputs, .. } => inputs.iter().map(|(_, r)| *r).collect(),
        }
    }

    /// Instructions that must be generated even when their result is unused.
    pub fn has_side_effects(&self) -> bool {
        use self::Inst::*;
        match self {
            Store { .. } | Call { .. } | Ret { .. } | RetLoad { .. } | Br { .. }
            | Block { .. } | Loop { .. } | CondBr { .. } | SwitchBr { .. } | Unreach
            | Breakpoint | DbgStmt { .. } | Assembly { .. } => true,
            _ => false,
        }
    }
}

/// A function body in IR form.
#[derive(Debug)]
pub struct Air {
    instructions: Vec<Inst>,
    values: Vec<TypedValue>,
    main_body: Vec<InstIdx>,
}

impl Air {
    pub fn get(&self, inst: InstIdx) -> &Inst {
        &self.instructions[inst.0 as usize]
    }

    pub fn inst_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn main_body(&self) -> &[InstIdx] {
        &self.main_body
    }

    /// The constant behind `operand`, if it refers to one.
    pub fn value(&self, operand: Ref) -> Option<&TypedValue> {
        match operand {
            Ref::Value(idx) => Some(&self.values[idx.0 as usize]),
            Ref::Inst(_) => None,
        }
    }

    pub fn type_of(&self, operand: Ref) -> Type {
        match operand {
            Ref::Inst(idx) => self.type_of_index(idx),
            Ref::Value(idx) => self.values[idx.0 as usize].ty.clone(),
        }
    }

    /// Result type of the instruction at `idx`.
    pub fn type_of_index(&self, idx: InstIdx) -> Type {
        use self::Inst::*;
        match self.get(idx) {
            Arg { ty, .. } => ty.clone(),
            Add { lhs, .. }
            | Sub { lhs, .. }
            | Mul { lhs, .. }
            | BitAnd { lhs, .. }
            | BitOr { lhs, .. }
            | Xor { lhs, .. }
            | BoolAnd { lhs, .. }
            | BoolOr { lhs, .. }
            | PtrAdd { lhs, .. }
            | PtrSub { lhs, .. } => self.type_of(*lhs),
            Not { operand } => self.type_of(*operand),
            Cmp { .. } | IsErr { .. } | IsNonErr { .. } => Type::Bool,
            Bitcast { ty, .. }
            | IntCast { ty, .. }
            | Trunc { ty, .. }
            | Alloc { ty }
            | StructFieldPtr { ty, .. }
            | WrapOptional { ty, .. }
            | OptionalPayload { ty, .. }
            | Block { ty, .. } => ty.clone(),
            Load { ptr } => self.type_of(*ptr).child_type().clone(),
            SlicePtr { operand } => self.type_of(*operand).slice_ptr_field_type(),
            SliceLen { .. } => Type::Usize,
            Call { callee, .. } => match self.type_of(*callee).fn_info() {
                Some(info) => info.ret.clone(),
                None => unreachable!("call through non-function type"),
            },
            Assembly { outputs, .. } => match outputs.first() {
                Some((_, ty)) => ty.clone(),
                None => Type::Void,
            },
            Store { .. } | DbgStmt { .. } | Breakpoint => Type::Void,
            Ret { .. } | RetLoad { .. } | Br { .. } | CondBr { .. } | SwitchBr { .. }
            | Loop { .. } | Unreach => Type::NoReturn,
        }
    }
}

/// Assembles an [`Air`] body. The backend never builds IR itself; this is
/// for the upstream pipeline and for tests.
#[derive(Debug, Default)]
pub struct Builder {
    instructions: Vec<Inst>,
    values: Vec<TypedValue>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Intern a constant and return an operand referring to it.
    pub fn value(&mut self, value: TypedValue) -> Ref {
        if let Some(pos) = self.values.iter().position(|v| *v == value) {
            return Ref::Value(ValueIdx(pos as u32));
        }
        self.values.push(value);
        Ref::Value(ValueIdx((self.values.len() - 1) as u32))
    }

    pub fn push(&mut self, inst: Inst) -> InstIdx {
        self.instructions.push(inst);
        InstIdx((self.instructions.len() - 1) as u32)
    }

    /// Reserve an index for an instruction whose operands are not built
    /// yet, e.g. a block and the breaks that target it.
    pub fn reserve(&mut self) -> InstIdx {
        self.push(Inst::Unreach)
    }

    pub fn set(&mut self, idx: InstIdx, inst: Inst) {
        self.instructions[idx.0 as usize] = inst;
    }

    pub fn finish(self, main_body: Vec<InstIdx>) -> Air {
        Air { instructions: self.instructions, values: self.values, main_body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Signedness;

    #[test]
    fn result_types_follow_operands() {
        let mut b = Builder::new();
        let x = b.push(Inst::Arg { ty: Type::i32(), name: "x".to_string() });
        let seven = b.value(TypedValue::int(Type::i32(), 7));
        let sum = b.push(Inst::Add { lhs: Ref::Inst(x), rhs: seven });
        let cmp = b.push(Inst::Cmp { op: CmpOp::Lt, lhs: Ref::Inst(sum), rhs: seven });
        let air = b.finish(vec![x, sum, cmp]);

        assert_eq!(air.type_of_index(sum), Type::i32());
        assert_eq!(air.type_of_index(cmp), Type::Bool);
        assert!(air.value(Ref::Inst(sum)).is_none());
        assert_eq!(air.value(seven).unwrap().ty, Type::i32());
    }

    #[test]
    fn interned_constants_are_deduplicated() {
        let mut b = Builder::new();
        let a = b.value(TypedValue::int(Type::u8(), 1));
        let c = b.value(TypedValue::int(Type::u8(), 1));
        let d = b.value(TypedValue::int(Type::int(Signedness::Unsigned, 8), 2));
        assert_eq!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn operator_inversion_is_an_involution() {
        for op in &[CmpOp::Lt, CmpOp::Lte, CmpOp::Eq, CmpOp::Gte, CmpOp::Gt, CmpOp::Neq] {
            assert_eq!(op.invert().invert(), *op);
        }
    }
}
