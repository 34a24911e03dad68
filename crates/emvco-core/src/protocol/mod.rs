//! Protocol module - wire constants, frame codec and status decoding.

pub mod constants;
pub mod frame;
pub mod status;

pub use constants::*;
pub use frame::{CommandFrame, Frame, FrameError, ParseResult, encode, try_parse};
pub use status::{ChipState, Status};
