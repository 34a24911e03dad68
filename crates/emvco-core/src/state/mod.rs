//! State machine module.

pub mod machine;

pub use machine::{EmvcoMode, ModeCell, ModeResponse, RejectReason};
