//! The structural type model consumed by the backend, together with the
//! ABI layout queries (size, alignment, integer info) it needs to lower
//! typed values onto an AArch64 frame.

/// Width of a pointer on the target, in bytes.
pub const PTR_SIZE: u64 = 8;
/// Alignment of a pointer on the target, in bytes.
pub const PTR_ALIGN: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signedness {
    Signed,
    Unsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntInfo {
    pub signedness: Signedness,
    pub bits: u16,
}

/// Calling convention of a function type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// The platform C convention (AAPCS64 on this target).
    C,
    /// No parameters, no return value, no frame setup.
    Naked,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FnInfo {
    pub params: Vec<Type>,
    pub ret: Type,
    pub cc: CallConv,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    Int(IntInfo),
    Usize,
    Pointer(Box<Type>),
    Slice(Box<Type>),
    Array { elem: Box<Type>, len: u64 },
    Struct(Vec<Type>),
    Optional(Box<Type>),
    ErrorSet,
    ErrorUnion { payload: Box<Type> },
    Fn(Box<FnInfo>),
    NoReturn,
}

impl Type {
    pub fn int(signedness: Signedness, bits: u16) -> Type {
        Type::Int(IntInfo { signedness, bits })
    }

    pub fn i32() -> Type {
        Type::int(Signedness::Signed, 32)
    }

    pub fn u8() -> Type {
        Type::int(Signedness::Unsigned, 8)
    }

    pub fn u64() -> Type {
        Type::int(Signedness::Unsigned, 64)
    }

    /// Size of a value of this type in memory, in bytes.
    pub fn abi_size(&self) -> u64 {
        match self {
            Type::Void | Type::NoReturn => 0,
            Type::Bool => 1,
            Type::Int(info) => int_abi_size(info.bits),
            Type::Usize | Type::Pointer(_) | Type::Fn(_) => PTR_SIZE,
            Type::Slice(_) => 2 * PTR_SIZE,
            Type::Array { elem, len } => elem.abi_size() * len,
            Type::Struct(fields) => {
                let mut size = 0;
                for field in fields {
                    size = align_up(size, u64::from(field.abi_alignment()));
                    size += field.abi_size();
                }
                align_up(size, u64::from(self.abi_alignment()))
            }
            Type::Optional(payload) => {
                if !payload.has_runtime_bits() {
                    1
                } else if payload.is_pointer_like() {
                    PTR_SIZE
                } else {
                    align_up(payload.abi_size() + 1, u64::from(payload.abi_alignment()))
                }
            }
            Type::ErrorSet => 2,
            Type::ErrorUnion { payload } => {
                if !payload.has_runtime_bits() {
                    2
                } else {
                    let align = u64::from(self.abi_alignment());
                    align_up(
                        align_up(2, u64::from(payload.abi_alignment())) + payload.abi_size(),
                        align,
                    )
                }
            }
        }
    }

    /// Required alignment of a value of this type, in bytes.
    pub fn abi_alignment(&self) -> u32 {
        match self {
            Type::Void | Type::NoReturn => 1,
            Type::Bool => 1,
            Type::Int(info) => int_abi_size(info.bits).min(16) as u32,
            Type::Usize | Type::Pointer(_) | Type::Fn(_) | Type::Slice(_) => PTR_ALIGN,
            Type::Array { elem, .. } => elem.abi_alignment(),
            Type::Struct(fields) => fields.iter().map(Type::abi_alignment).max().unwrap_or(1),
            Type::Optional(payload) => {
                if !payload.has_runtime_bits() {
                    1
                } else if payload.is_pointer_like() {
                    PTR_ALIGN
                } else {
                    payload.abi_alignment()
                }
            }
            Type::ErrorSet => 2,
            Type::ErrorUnion { payload } => {
                if !payload.has_runtime_bits() {
                    2
                } else {
                    payload.abi_alignment().max(2)
                }
            }
        }
    }

    /// Does a value of this type occupy any bits at runtime?
    pub fn has_runtime_bits(&self) -> bool {
        match self {
            Type::Void | Type::NoReturn => false,
            Type::Int(info) => info.bits != 0,
            Type::Array { elem, len } => *len != 0 && elem.has_runtime_bits(),
            Type::Struct(fields) => fields.iter().any(Type::has_runtime_bits),
            _ => true,
        }
    }

    /// Integer interpretation of this type. Panics for types that have none;
    /// callers are expected to reject those beforehand.
    pub fn int_info(&self) -> IntInfo {
        match self {
            Type::Bool => IntInfo { signedness: Signedness::Unsigned, bits: 1 },
            Type::Int(info) => *info,
            Type::Usize | Type::Pointer(_) | Type::Fn(_) => {
                IntInfo { signedness: Signedness::Unsigned, bits: 64 }
            }
            Type::ErrorSet => IntInfo { signedness: Signedness::Unsigned, bits: 16 },
            other => unreachable!("int_info on non-integer type {:?}", other),
        }
    }

    pub fn is_signed_int(&self) -> bool {
        match self {
            Type::Int(info) => info.signedness == Signedness::Signed,
            _ => false,
        }
    }

    /// Pointee of a pointer type.
    pub fn child_type(&self) -> &Type {
        match self {
            Type::Pointer(elem) => elem,
            other => unreachable!("child_type on non-pointer type {:?}", other),
        }
    }

    /// Element type of an array or slice.
    pub fn elem_type(&self) -> &Type {
        match self {
            Type::Array { elem, .. } | Type::Slice(elem) | Type::Pointer(elem) => elem,
            other => unreachable!("elem_type on non-sequence type {:?}", other),
        }
    }

    /// Byte offset of field `index` in a struct.
    pub fn struct_field_offset(&self, index: usize) -> u64 {
        match self {
            Type::Struct(fields) => {
                let mut offset = 0;
                for field in &fields[..index] {
                    offset = align_up(offset, u64::from(field.abi_alignment()));
                    offset += field.abi_size();
                }
                align_up(offset, u64::from(fields[index].abi_alignment()))
            }
            other => unreachable!("struct_field_offset on non-struct type {:?}", other),
        }
    }

    pub fn error_union_payload(&self) -> &Type {
        match self {
            Type::ErrorUnion { payload } => payload,
            other => unreachable!("error_union_payload on {:?}", other),
        }
    }

    pub fn optional_payload(&self) -> &Type {
        match self {
            Type::Optional(payload) => payload,
            other => unreachable!("optional_payload on {:?}", other),
        }
    }

    /// The type of the pointer field of a slice.
    pub fn slice_ptr_field_type(&self) -> Type {
        match self {
            Type::Slice(elem) => Type::Pointer(elem.clone()),
            other => unreachable!("slice_ptr_field_type on {:?}", other),
        }
    }

    pub fn fn_info(&self) -> Option<&FnInfo> {
        match self {
            Type::Fn(info) => Some(info),
            _ => None,
        }
    }

    /// True for types whose runtime representation is a single pointer,
    /// which lets an optional wrap them with the null address as its tag.
    pub fn is_pointer_like(&self) -> bool {
        match self {
            Type::Pointer(_) | Type::Fn(_) => true,
            _ => false,
        }
    }
}

/// ABI size of an integer with the given bit width.
fn int_abi_size(bits: u16) -> u64 {
    let bytes = (u64::from(bits) + 7) / 8;
    bytes.next_power_of_two()
}

pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}
