//! Classification of parameters and return values into AAPCS64 locations.

use crate::registers::{C_ABI_INT_PARAM_REGS, C_ABI_INT_RETURN_REG};
use crate::value::MachineValue;
use crate::Target;
use air::types::align_up;
use air::{CallConv, FnInfo};
use std::fmt;

/// Where each parameter and the return value of a call live.
#[derive(Debug)]
pub struct CallMachineValues {
    pub args: Vec<MachineValue>,
    pub return_value: MachineValue,
    /// Bytes of stack the arguments occupy at the call site.
    pub stack_byte_count: u32,
    pub stack_align: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbiError {
    NotYetImplemented(&'static str),
}

impl fmt::Display for AbiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbiError::NotYetImplemented(what) => write!(f, "TODO implement {}", what),
        }
    }
}

/// Assign every parameter a core register or a stacked-argument offset,
/// tracking NCRN (next core register number) and NSAA (next stacked
/// argument address) per the procedure call standard.
pub fn classify(fn_info: &FnInfo, target: &Target) -> Result<CallMachineValues, AbiError> {
    if fn_info.cc == CallConv::Naked {
        debug_assert!(fn_info.params.is_empty());
        return Ok(CallMachineValues {
            args: Vec::new(),
            return_value: MachineValue::Unreach,
            stack_byte_count: 0,
            stack_align: 1,
        });
    }

    let mut args = Vec::with_capacity(fn_info.params.len());
    let mut ncrn: u32 = 0;
    let mut nsaa: u32 = 0;

    for param in &fn_info.params {
        if !param.has_runtime_bits() {
            args.push(MachineValue::None);
            continue;
        }
        let size = param.abi_size() as u32;
        let align = param.abi_alignment();

        if align == 16 && !target.is_apple() {
            ncrn = (ncrn + 1) & !1;
        }

        let needed_regs = (size + 7) / 8;
        if needed_regs <= 8 - ncrn {
            if size <= 8 {
                args.push(MachineValue::Register(C_ABI_INT_PARAM_REGS[ncrn as usize]));
                ncrn += 1;
            } else {
                return Err(AbiError::NotYetImplemented("multi-register parameters"));
            }
        } else if ncrn < 8 && nsaa == 0 {
            return Err(AbiError::NotYetImplemented("register/stack split parameters"));
        } else {
            ncrn = 8;
            if target.is_apple() {
                nsaa = align_up(u64::from(nsaa), u64::from(align)) as u32;
            } else {
                nsaa = align_up(u64::from(nsaa), u64::from(align.max(8))) as u32;
            }
            args.push(MachineValue::StackOffset(nsaa));
            nsaa += size;
        }
    }

    let ret = &fn_info.ret;
    let return_value = if *ret == air::Type::NoReturn {
        MachineValue::Unreach
    } else if !ret.has_runtime_bits() {
        MachineValue::None
    } else if ret.abi_size() <= 8 {
        MachineValue::Register(C_ABI_INT_RETURN_REG)
    } else {
        return Err(AbiError::NotYetImplemented("return values larger than a register"));
    };

    Ok(CallMachineValues {
        args,
        return_value,
        stack_byte_count: align_up(u64::from(nsaa), 16) as u32,
        stack_align: 16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Register as R;
    use crate::Os;
    use air::Type;

    fn fn_info(params: Vec<Type>, ret: Type) -> FnInfo {
        FnInfo { params, ret, cc: CallConv::C }
    }

    const LINUX: Target = Target { os: Os::Linux };
    const MACOS: Target = Target { os: Os::Macos };

    #[test]
    fn the_first_eight_words_go_to_registers() {
        let info = fn_info(vec![Type::u64(); 9], Type::i32());
        let mvs = classify(&info, &LINUX).unwrap();
        assert_eq!(mvs.args[0], MachineValue::Register(R::x0));
        assert_eq!(mvs.args[7], MachineValue::Register(R::x7));
        assert_eq!(mvs.args[8], MachineValue::StackOffset(0));
        assert_eq!(mvs.return_value, MachineValue::Register(R::x0));
        assert_eq!(mvs.stack_byte_count, 16);
    }

    #[test]
    fn stacked_bytes_pack_naturally_on_apple_targets() {
        let mut params = vec![Type::u64(); 8];
        params.push(Type::u8());
        params.push(Type::u8());
        let info = fn_info(params, Type::Void);

        let apple = classify(&info, &MACOS).unwrap();
        assert_eq!(apple.args[8], MachineValue::StackOffset(0));
        assert_eq!(apple.args[9], MachineValue::StackOffset(1));

        let other = classify(&info, &LINUX).unwrap();
        assert_eq!(other.args[8], MachineValue::StackOffset(0));
        assert_eq!(other.args[9], MachineValue::StackOffset(8));
        assert_eq!(other.stack_byte_count, 16);
    }

    #[test]
    fn zero_sized_parameters_take_no_location() {
        let info = fn_info(vec![Type::Void, Type::i32()], Type::Void);
        let mvs = classify(&info, &LINUX).unwrap();
        assert_eq!(mvs.args[0], MachineValue::None);
        assert_eq!(mvs.args[1], MachineValue::Register(R::x0));
        assert_eq!(mvs.return_value, MachineValue::None);
    }

    #[test]
    fn oversized_values_are_reported_not_guessed() {
        let big = Type::int(air::Signedness::Unsigned, 128);
        assert_eq!(
            classify(&fn_info(vec![big.clone()], Type::Void), &LINUX).unwrap_err(),
            AbiError::NotYetImplemented("multi-register parameters"),
        );
        assert_eq!(
            classify(&fn_info(vec![], big), &LINUX).unwrap_err(),
            AbiError::NotYetImplemented("return values larger than a register"),
        );
    }

    #[test]
    fn naked_functions_have_no_locations() {
        let info = FnInfo { params: vec![], ret: Type::Void, cc: CallConv::Naked };
        let mvs = classify(&info, &LINUX).unwrap();
        assert!(mvs.args.is_empty());
        assert_eq!(mvs.return_value, MachineValue::Unreach);
    }
}
