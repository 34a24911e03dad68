//! Event system for the application layer.
//!
//! The controller reports mode transitions and out-of-band chip state
//! through a single registered [`ControlListener`].

use std::sync::mpsc;

use crate::protocol::ChipState;
use crate::state::machine::{EmvcoMode, RejectReason};

/// Events delivered to the registered listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// A confirmed mode transition.
    ModeChanged { from: EmvcoMode, to: EmvcoMode },
    /// A start or stop failed; the mode was reverted.
    ModeTransitionFailed {
        target: EmvcoMode,
        reverted_to: EmvcoMode,
        reason: RejectReason,
    },
    /// Controller reported a new state out of band.
    ChipStateChanged { state: ChipState },
    /// A frame that matched neither the pending exchange nor a known notification.
    Unsolicited { opcode: u8, payload: Vec<u8> },
    /// The reader lost the transport.
    TransportLost,
}

/// Listener for control-layer events.
///
/// Implement this trait in the application layer to receive updates.
/// Calls arrive on the thread that detected the event; keep them short.
pub trait ControlListener: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &ControlEvent);
}

/// No-op listener that discards all events.
pub struct NullListener;

impl ControlListener for NullListener {
    fn on_event(&self, _event: &ControlEvent) {}
}

/// Listener that logs events using tracing.
pub struct TracingListener;

impl ControlListener for TracingListener {
    fn on_event(&self, event: &ControlEvent) {
        match event {
            ControlEvent::ModeChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "EMVCo mode changed");
            }
            ControlEvent::ModeTransitionFailed {
                target,
                reverted_to,
                reason,
            } => {
                tracing::warn!(
                    target_mode = %target,
                    reverted_to = %reverted_to,
                    "EMVCo transition failed: {}",
                    reason
                );
            }
            ControlEvent::ChipStateChanged { state } => {
                tracing::info!(state = %state, "Chip state changed");
            }
            ControlEvent::Unsolicited { opcode, payload } => {
                tracing::debug!(
                    opcode = %format!("0x{:02X}", opcode),
                    len = payload.len(),
                    "Unsolicited frame"
                );
            }
            ControlEvent::TransportLost => {
                tracing::error!("Transport lost");
            }
        }
    }
}

/// Listener that forwards events into a channel.
pub struct ChannelListener {
    sender: mpsc::Sender<ControlEvent>,
}

impl ChannelListener {
    pub fn new(sender: mpsc::Sender<ControlEvent>) -> Self {
        Self { sender }
    }

    /// Create a listener together with the receiving end.
    pub fn channel() -> (Self, mpsc::Receiver<ControlEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self::new(tx), rx)
    }
}

impl ControlListener for ChannelListener {
    fn on_event(&self, event: &ControlEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.sender.send(event.clone());
    }
}
