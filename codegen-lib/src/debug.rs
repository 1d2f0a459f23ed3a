//! Debug-info side channels fed while a function is generated.
//!
//! Line stepping goes into the instruction stream itself as `dbg_line`
//! pseudos; this module only collects the per-function DWARF bytes for
//! variable info. Type references are interned and left as relocations for
//! the DWARF writer to resolve once all types have info entries.

use crate::value::MachineValue;
use air::Type;

/// `DW_TAG_formal_parameter` abbreviation code used by the debug-info
/// writer downstream.
const ABBREV_PARAMETER: u8 = 0x05;
const DW_OP_BREG29: u8 = 0x8d;
const DW_OP_REG0: u8 = 0x50;

/// A 4-byte placeholder inside `dbg_info` that must be patched with the
/// offset of `ty`'s debug-info entry.
#[derive(Debug)]
pub struct TypeReloc {
    pub ty: Type,
    pub offset: u32,
}

#[derive(Debug, Default)]
pub struct DwarfInfo {
    pub dbg_info: Vec<u8>,
    pub type_relocs: Vec<TypeReloc>,
}

/// Where debug info goes; [`DebugInfoOutput::None`] turns every hook into
/// a no-op.
#[derive(Debug)]
pub enum DebugInfoOutput {
    Dwarf(DwarfInfo),
    None,
}

impl DebugInfoOutput {
    /// Record a formal parameter at its resolved location.
    pub fn add_arg(&mut self, name: &str, ty: &Type, mv: MachineValue) {
        let dw = match self {
            DebugInfoOutput::Dwarf(dw) => dw,
            DebugInfoOutput::None => return,
        };
        dw.dbg_info.push(ABBREV_PARAMETER);
        match mv {
            MachineValue::StackOffset(offset) => {
                let mut expr = vec![DW_OP_BREG29];
                write_sleb128(&mut expr, -i64::from(offset));
                write_uleb128(&mut dw.dbg_info, expr.len() as u64);
                dw.dbg_info.extend(expr);
            }
            MachineValue::Register(reg) => {
                dw.dbg_info.push(1);
                dw.dbg_info.push(DW_OP_REG0 + reg.id());
            }
            _ => {
                dw.dbg_info.push(0);
            }
        }
        dw.add_type_reloc(ty);
        dw.dbg_info.extend(name.as_bytes());
        dw.dbg_info.push(0);
    }
}

impl DwarfInfo {
    /// Intern `ty` and leave a placeholder for its entry offset.
    fn add_type_reloc(&mut self, ty: &Type) {
        let offset = self.dbg_info.len() as u32;
        self.dbg_info.extend(&[0, 0, 0, 0]);
        self.type_relocs.push(TypeReloc { ty: ty.clone(), offset });
    }
}

fn write_uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_sleb128(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign_clear = byte & 0x40 == 0;
        if (value == 0 && sign_clear) || (value == -1 && !sign_clear) {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leb128_encodings_match_known_vectors() {
        let mut buf = Vec::new();
        write_uleb128(&mut buf, 624485);
        assert_eq!(buf, vec![0xe5, 0x8e, 0x26]);

        buf.clear();
        write_sleb128(&mut buf, -4);
        assert_eq!(buf, vec![0x7c]);

        buf.clear();
        write_sleb128(&mut buf, -123456);
        assert_eq!(buf, vec![0xc0, 0xbb, 0x78]);
    }

    #[test]
    fn stack_parameters_get_frame_relative_locations() {
        let mut out = DebugInfoOutput::Dwarf(DwarfInfo::default());
        out.add_arg("x", &Type::i32(), MachineValue::StackOffset(4));
        let dw = match out {
            DebugInfoOutput::Dwarf(dw) => dw,
            DebugInfoOutput::None => unreachable!(),
        };
        assert_eq!(dw.dbg_info[0], 0x05);
        assert_eq!(dw.dbg_info[2], DW_OP_BREG29);
        assert_eq!(dw.type_relocs.len(), 1);
        assert_eq!(dw.type_relocs[0].ty, Type::i32());
        // Entry ends with the NUL-terminated name.
        assert_eq!(&dw.dbg_info[dw.dbg_info.len() - 2..], &b"x\0"[..]);
    }

    #[test]
    fn the_null_sink_records_nothing() {
        let mut out = DebugInfoOutput::None;
        out.add_arg("x", &Type::i32(), MachineValue::StackOffset(4));
    }
}
