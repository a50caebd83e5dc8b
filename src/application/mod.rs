//! Application layer: the fix loop use case.

pub mod fix_loop;

pub use fix_loop::{FixLoop, LoopConfig, LoopOutcome, LoopReport, LoopState, StateKind};
