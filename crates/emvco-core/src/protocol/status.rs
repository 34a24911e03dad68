//! Response status and chip state decoding.

use std::fmt;

use super::constants::*;

/// Status byte of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Chip-reported error code.
    Error(u8),
}

impl Status {
    pub fn from_byte(b: u8) -> Self {
        if b == STATUS_OK {
            Status::Ok
        } else {
            Status::Error(b)
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    pub fn code(&self) -> u8 {
        match self {
            Status::Ok => STATUS_OK,
            Status::Error(code) => *code,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Error(STATUS_REJECTED) => write!(f, "REJECTED"),
            Status::Error(STATUS_FAILED) => write!(f, "FAILED"),
            Status::Error(STATUS_NOT_INITIALIZED) => write!(f, "NOT_INITIALIZED"),
            Status::Error(STATUS_SYNTAX_ERROR) => write!(f, "SYNTAX_ERROR"),
            Status::Error(STATUS_SEMANTIC_ERROR) => write!(f, "SEMANTIC_ERROR"),
            Status::Error(code) => write!(f, "ERROR(0x{:02X})", code),
        }
    }
}

/// Controller state reported out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipState {
    Off,
    TurningOff,
    On,
    TurningOn,
    Unknown(u8),
}

impl ChipState {
    pub fn from_byte(b: u8) -> Self {
        match b {
            CHIP_STATE_OFF => ChipState::Off,
            CHIP_STATE_TURNING_OFF => ChipState::TurningOff,
            CHIP_STATE_ON => ChipState::On,
            CHIP_STATE_TURNING_ON => ChipState::TurningOn,
            other => ChipState::Unknown(other),
        }
    }

    /// Decode the payload of a chip state notification.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        payload.first().map(|&b| Self::from_byte(b))
    }
}

impl fmt::Display for ChipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChipState::Off => write!(f, "OFF"),
            ChipState::TurningOff => write!(f, "TURNING_OFF"),
            ChipState::On => write!(f, "ON"),
            ChipState::TurningOn => write!(f, "TURNING_ON"),
            ChipState::Unknown(b) => write!(f, "UNKNOWN(0x{:02X})", b),
        }
    }
}
