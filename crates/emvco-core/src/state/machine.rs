//! EMVCo mode states and the atomic cell that holds the current one.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

use crate::exchange::ExchangeError;
use crate::protocol::Status;

/// EMVCo polling mode of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmvcoMode {
    /// Not polling. Initial state.
    #[default]
    Idle,
    /// Start requested, waiting for the controller to confirm.
    Starting,
    /// Controller confirmed EMVCo polling.
    Active,
    /// Stop requested, waiting for the controller to confirm.
    Stopping,
}

impl fmt::Display for EmvcoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmvcoMode::Idle => write!(f, "IDLE"),
            EmvcoMode::Starting => write!(f, "STARTING"),
            EmvcoMode::Active => write!(f, "ACTIVE"),
            EmvcoMode::Stopping => write!(f, "STOPPING"),
        }
    }
}

impl EmvcoMode {
    /// Check if this is a confirmed state.
    pub fn is_stable(&self) -> bool {
        matches!(self, EmvcoMode::Idle | EmvcoMode::Active)
    }

    /// Check if a command for this mode is in flight.
    pub fn is_transitional(&self) -> bool {
        !self.is_stable()
    }

    fn to_u8(self) -> u8 {
        match self {
            EmvcoMode::Idle => 0,
            EmvcoMode::Starting => 1,
            EmvcoMode::Active => 2,
            EmvcoMode::Stopping => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => EmvcoMode::Starting,
            2 => EmvcoMode::Active,
            3 => EmvcoMode::Stopping,
            _ => EmvcoMode::Idle,
        }
    }
}

/// Lock-free holder of the authoritative mode.
#[derive(Debug, Default)]
pub struct ModeCell(AtomicU8);

impl ModeCell {
    pub fn new(mode: EmvcoMode) -> Self {
        Self(AtomicU8::new(mode.to_u8()))
    }

    pub fn load(&self) -> EmvcoMode {
        EmvcoMode::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to` if and only if the cell still holds `from`.
    /// On failure returns the mode actually observed.
    pub fn transition(&self, from: EmvcoMode, to: EmvcoMode) -> Result<(), EmvcoMode> {
        self.0
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| {
                tracing::info!(from = %from, to = %to, "Mode transition");
            })
            .map_err(EmvcoMode::from_u8)
    }
}

/// Why a mode request was not carried out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("Another exchange is in flight")]
    Busy,

    #[error("No response within {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Controller returned status {status} for opcode 0x{opcode:02X}")]
    Status { opcode: u8, status: Status },

    #[error("Response to opcode 0x{opcode:02X} carried no status")]
    MissingStatus { opcode: u8 },

    #[error("Payload too large: {size} bytes, max {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("A {0} transition is in progress")]
    TransitionInProgress(EmvcoMode),
}

impl From<ExchangeError> for RejectReason {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::Busy => RejectReason::Busy,
            ExchangeError::TimedOut { timeout_ms } => RejectReason::TimedOut { timeout_ms },
            ExchangeError::PayloadTooLarge { size, max } => {
                RejectReason::PayloadTooLarge { size, max }
            }
            other => RejectReason::Transport(other.to_string()),
        }
    }
}

/// Outcome of `start_mode` / `stop_mode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeResponse {
    Accepted,
    Rejected(RejectReason),
    AlreadyActive,
    AlreadyIdle,
}

impl ModeResponse {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ModeResponse::Accepted)
    }
}

impl fmt::Display for ModeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeResponse::Accepted => write!(f, "accepted"),
            ModeResponse::Rejected(reason) => write!(f, "rejected: {}", reason),
            ModeResponse::AlreadyActive => write!(f, "already active"),
            ModeResponse::AlreadyIdle => write!(f, "already idle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_cell_starts_idle() {
        assert_eq!(ModeCell::default().load(), EmvcoMode::Idle);
    }

    #[test]
    fn test_mode_cell_transition() {
        let cell = ModeCell::new(EmvcoMode::Idle);
        assert!(cell.transition(EmvcoMode::Idle, EmvcoMode::Starting).is_ok());
        assert_eq!(cell.load(), EmvcoMode::Starting);

        // Stale expectation is refused and reports what is actually there.
        assert_eq!(
            cell.transition(EmvcoMode::Idle, EmvcoMode::Starting),
            Err(EmvcoMode::Starting)
        );
    }

    #[test]
    fn test_stable_states() {
        assert!(EmvcoMode::Idle.is_stable());
        assert!(EmvcoMode::Active.is_stable());
        assert!(EmvcoMode::Starting.is_transitional());
        assert!(EmvcoMode::Stopping.is_transitional());
    }

    #[test]
    fn test_exchange_error_mapping() {
        assert_eq!(RejectReason::from(ExchangeError::Busy), RejectReason::Busy);
        assert_eq!(
            RejectReason::from(ExchangeError::TimedOut { timeout_ms: 500 }),
            RejectReason::TimedOut { timeout_ms: 500 }
        );
    }
}
