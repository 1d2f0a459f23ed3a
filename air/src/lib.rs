//! Typed, SSA-like per-function IR together with the liveness and type
//! layout queries a target backend needs to lower it.
#![warn(rust_2018_idioms)]

pub mod ir;
pub mod liveness;
pub mod types;
pub mod value;

pub use crate::ir::{Air, Builder, CmpOp, Inst, InstIdx, Ref, ValueIdx};
pub use crate::liveness::{BigTomb, Liveness, BPI};
pub use crate::types::{CallConv, FnInfo, IntInfo, Signedness, Type};
pub use crate::value::{AtomIndex, TypedValue, Value};
