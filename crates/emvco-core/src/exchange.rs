//! Command/response exchange engine.
//!
//! Turns the controller's single asynchronous byte channel into blocking,
//! timeout-bounded request/response calls. At most one exchange is in
//! flight; inbound frames that do not answer it are routed to the
//! listener registry as out-of-band events.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::events::ControlEvent;
use crate::protocol::ChipState;
use crate::protocol::constants::{MAX_PAYLOAD_SIZE, NTF_CHIP_STATE};
use crate::protocol::frame::{CommandFrame, Frame, FrameError, ParseResult, try_parse};
use crate::registry::ListenerRegistry;
use crate::transport::{NfccTransport, TransportError};

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Another exchange is in flight")]
    Busy,

    #[error("No response within {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    #[error("Payload too large: {size} bytes, max {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Opcode 0x{0:02X} is reserved for mode control")]
    ReservedOpcode(u8),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<FrameError> for ExchangeError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::PayloadTooLarge { size, max } => {
                ExchangeError::PayloadTooLarge { size, max }
            }
        }
    }
}

/// Framing and correlation parameters.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Largest payload accepted in either direction.
    pub max_payload: usize,
    /// Added (wrapping) to a command opcode to get its response opcode.
    pub response_opcode_offset: u8,
    /// Opcode of out-of-band chip state notifications.
    pub chip_state_opcode: u8,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_SIZE,
            response_opcode_offset: 0,
            chip_state_opcode: NTF_CHIP_STATE,
        }
    }
}

/// The one outstanding command.
#[derive(Debug)]
struct PendingExchange {
    command: CommandFrame,
    expected: u8,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<PendingExchange>,
    completion: Option<Result<Frame, TransportError>>,
    /// Out-of-band events held back until the pending exchange ends.
    deferred: Vec<ControlEvent>,
}

impl Slot {
    /// End the pending exchange and hand back the events it held back.
    fn settle(&mut self) -> Vec<ControlEvent> {
        self.pending = None;
        std::mem::take(&mut self.deferred)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pairs each command with its correlated response.
pub struct ExchangeEngine<T: NfccTransport> {
    transport: Arc<T>,
    registry: Arc<ListenerRegistry>,
    config: ExchangeConfig,
    /// Held from write until resolution; serialises the half-duplex channel.
    channel: Mutex<()>,
    slot: Mutex<Slot>,
    resolved: Condvar,
    /// Bytes received but not yet forming a complete frame.
    rx_buf: Mutex<Vec<u8>>,
}

impl<T: NfccTransport> ExchangeEngine<T> {
    pub fn new(transport: Arc<T>, registry: Arc<ListenerRegistry>, config: ExchangeConfig) -> Self {
        Self {
            transport,
            registry,
            config,
            channel: Mutex::new(()),
            slot: Mutex::new(Slot::default()),
            resolved: Condvar::new(),
            rx_buf: Mutex::new(Vec::new()),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Response opcode that answers `opcode`.
    pub fn expected_response(&self, opcode: u8) -> u8 {
        opcode.wrapping_add(self.config.response_opcode_offset)
    }

    /// Whether a command is waiting for its response.
    pub fn is_pending(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }

    /// Send one command and block until its response, the deadline, or a
    /// transport failure. Never retries.
    #[instrument(
        skip(self, payload),
        fields(opcode = %format!("0x{:02X}", opcode), len = payload.len())
    )]
    pub fn exchange(
        &self,
        opcode: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Frame, ExchangeError> {
        let channel = match self.channel.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!("Exchange refused, channel busy");
                return Err(ExchangeError::Busy);
            }
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        let command = CommandFrame::new(opcode, payload, self.config.max_payload)?;
        let bytes = command.to_bytes();

        // A response always starts on a frame boundary.
        self.discard_partial("new command");

        let deadline = Instant::now() + timeout;
        {
            let mut slot = lock(&self.slot);
            slot.completion = None;
            slot.pending = Some(PendingExchange {
                command,
                expected: self.expected_response(opcode),
                deadline,
            });
        }

        let (result, deferred) = match self.transport.write(&bytes) {
            Ok(_) => {
                debug!(bytes = bytes.len(), "Command sent");
                self.wait_for_completion(deadline, timeout)
            }
            Err(e) => {
                warn!(error = %e, "Command write failed");
                let mut slot = lock(&self.slot);
                slot.completion = None;
                (Err(e.into()), slot.settle())
            }
        };

        drop(channel);
        self.dispatch(deferred);
        result
    }

    fn wait_for_completion(
        &self,
        deadline: Instant,
        timeout: Duration,
    ) -> (Result<Frame, ExchangeError>, Vec<ControlEvent>) {
        let mut slot = lock(&self.slot);
        loop {
            if let Some(done) = slot.completion.take() {
                return (done.map_err(ExchangeError::from), slot.settle());
            }
            let now = Instant::now();
            if now >= deadline {
                if let Some(p) = &slot.pending {
                    warn!(
                        opcode = %format!("0x{:02X}", p.command.opcode()),
                        timeout_ms = timeout.as_millis() as u64,
                        "Exchange timed out"
                    );
                }
                let deferred = slot.settle();
                drop(slot);
                self.discard_partial("timed out exchange");
                let err = ExchangeError::TimedOut {
                    timeout_ms: timeout.as_millis() as u64,
                };
                return (Err(err), deferred);
            }
            let (guard, _) = self
                .resolved
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }

    /// Issue the transport reset while no exchange is in flight.
    #[instrument(skip(self))]
    pub fn reset(&self, arg: Option<u64>) -> Result<(), ExchangeError> {
        let _channel = match self.channel.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(ExchangeError::Busy),
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };
        match arg {
            Some(arg) => self.transport.reset_with(arg)?,
            None => self.transport.reset()?,
        }
        // Anything half-received before the reset is stale.
        lock(&self.rx_buf).clear();
        info!("Controller reset");
        Ok(())
    }

    /// Push inbound bytes. Called from the reader context.
    ///
    /// Completed frames either resolve the pending exchange or become
    /// listener events. Events seen while an exchange is pending are held
    /// until it resolves, times out or fails, so a slow listener never
    /// delays the response. Delivery happens with no engine lock held.
    pub fn feed(&self, bytes: &[u8]) {
        let frames = self.parse_frames(bytes);
        if frames.is_empty() {
            return;
        }

        let events = {
            let mut slot = lock(&self.slot);
            for frame in frames {
                let correlated = slot
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.expected == frame.opcode);
                if correlated {
                    if let Some(p) = slot.pending.take() {
                        let remaining = p.deadline.saturating_duration_since(Instant::now());
                        debug!(
                            opcode = %format!("0x{:02X}", frame.opcode),
                            remaining_ms = remaining.as_millis() as u64,
                            "Response correlated"
                        );
                    }
                    slot.completion = Some(Ok(frame));
                    self.resolved.notify_all();
                } else {
                    let event = self.classify(frame);
                    slot.deferred.push(event);
                }
            }
            if slot.pending.is_some() {
                Vec::new()
            } else {
                std::mem::take(&mut slot.deferred)
            }
        };

        self.dispatch(events);
    }

    /// Resolve the pending exchange with a transport failure seen by the reader.
    pub fn fail_pending(&self, error: TransportError) {
        let deferred = {
            let mut slot = lock(&self.slot);
            if slot.pending.is_none() {
                return;
            }
            warn!(error = %error, "Pending exchange failed by transport");
            slot.completion = Some(Err(error));
            self.resolved.notify_all();
            slot.settle()
        };
        self.dispatch(deferred);
    }

    fn dispatch(&self, events: Vec<ControlEvent>) {
        for event in events {
            self.registry.notify(&event);
        }
    }

    /// Drop bytes of a frame that never completed.
    fn discard_partial(&self, context: &str) {
        let mut buf = lock(&self.rx_buf);
        if !buf.is_empty() {
            warn!(bytes = buf.len(), context, "Discarding incomplete frame");
            buf.clear();
        }
    }

    fn parse_frames(&self, bytes: &[u8]) -> Vec<Frame> {
        let mut buf = lock(&self.rx_buf);
        buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut offset = 0;
        loop {
            match try_parse(&buf[offset..], self.config.max_payload) {
                ParseResult::Incomplete => break,
                ParseResult::Frame(frame, used) => {
                    debug!(?frame, "Frame received");
                    offset += used;
                    frames.push(frame);
                }
                ParseResult::Malformed(discard) => {
                    warn!(
                        length_byte = %format!("0x{:02X}", buf[offset]),
                        "Malformed frame prefix, discarding"
                    );
                    offset += discard;
                }
            }
        }
        buf.drain(..offset);
        frames
    }

    fn classify(&self, frame: Frame) -> ControlEvent {
        if frame.opcode == self.config.chip_state_opcode
            && let Some(state) = ChipState::from_payload(&frame.payload)
        {
            info!(state = %state, "Chip state notification");
            return ControlEvent::ChipStateChanged { state };
        }
        debug!(?frame, "Unsolicited frame");
        ControlEvent::Unsolicited {
            opcode: frame.opcode,
            payload: frame.payload,
        }
    }
}
