//! Single-pass AArch64 code generation: lowers one typed IR function body
//! at a time into a stream of target instructions, planning the stack
//! frame, allocating registers on the fly and reconciling value locations
//! across control flow while walking the IR exactly once.
#![warn(rust_2018_idioms)]

pub mod abi;
pub mod branch;
pub mod codegen;
pub mod debug;
pub mod frame;
pub mod link;
pub mod mir;
pub mod regalloc;
pub mod registers;
pub mod value;

pub use crate::codegen::{generate, CodegenError, Function, SrcLoc};
pub use crate::debug::DebugInfoOutput;
pub use crate::link::LinkFile;
pub use crate::mir::Mir;

/// Operating systems the backend can target; only the ABI variant and the
/// object format hang off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Macos,
    Windows,
    Plan9,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub os: Os,
}

impl Target {
    pub fn is_apple(&self) -> bool {
        self.os == Os::Macos
    }
}
