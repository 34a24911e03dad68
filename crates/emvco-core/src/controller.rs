//! EMVCo controller - mode state machine over the exchange engine.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ControllerConfig, EmvcoConfig};
use crate::events::{ControlEvent, ControlListener};
use crate::exchange::{ExchangeEngine, ExchangeError};
use crate::protocol::{Frame, Status};
use crate::reader::Reader;
use crate::registry::ListenerRegistry;
use crate::state::machine::{EmvcoMode, ModeCell, ModeResponse, RejectReason};
use crate::transport::NfccTransport;

/// Drives EMVCo start/stop through the exchange engine and owns the mode.
pub struct EmvcoController<T: NfccTransport> {
    config: ControllerConfig,
    engine: Arc<ExchangeEngine<T>>,
    registry: Arc<ListenerRegistry>,
    mode: ModeCell,
    reader: Option<Reader>,
}

#[cfg(unix)]
impl EmvcoController<crate::transport::DeviceTransport> {
    /// Open the configured device node and start reading from it.
    pub fn open(config: ControllerConfig) -> Result<Self> {
        let transport = crate::transport::DeviceTransport::open(&config.device_path)?
            .with_read_timeout(config.read_poll_timeout_ms);
        Self::spawn(Arc::new(transport), config)
    }
}

impl<T: NfccTransport + 'static> EmvcoController<T> {
    /// Create a controller with a background reader on `transport`.
    pub fn spawn(transport: Arc<T>, config: ControllerConfig) -> Result<Self> {
        let mut controller = Self::new(transport, config)?;
        controller.reader = Some(Reader::spawn(
            controller.engine.clone(),
            controller.registry.clone(),
            controller.config.read_chunk,
        )?);
        Ok(controller)
    }

    /// Create a controller without a reader; inbound bytes must be pushed
    /// through [`ExchangeEngine::feed`].
    pub fn new(transport: Arc<T>, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ListenerRegistry::new());
        let engine = Arc::new(ExchangeEngine::new(
            transport,
            registry.clone(),
            config.exchange_config(),
        ));
        Ok(Self {
            config,
            engine,
            registry,
            mode: ModeCell::new(EmvcoMode::Idle),
            reader: None,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ExchangeEngine<T>> {
        &self.engine
    }

    /// Whether the background reader is alive.
    pub fn is_reading(&self) -> bool {
        self.reader.as_ref().is_some_and(Reader::is_running)
    }

    /// Register the state-change listener, replacing any previous one.
    ///
    /// Mode operations work without a listener; their events are dropped.
    pub fn register_listener(&self, listener: Arc<dyn ControlListener>) -> bool {
        if self.registry.register(listener).is_some() {
            debug!("Replaced previously registered listener");
        }
        true
    }

    /// Remove the listener. Returns whether one was registered.
    pub fn unregister_listener(&self) -> bool {
        self.registry.unregister().is_some()
    }

    /// Current mode. Never blocks on an in-flight exchange.
    pub fn current_mode(&self) -> EmvcoMode {
        self.mode.load()
    }

    /// Start EMVCo polling.
    #[instrument(skip(self))]
    pub fn start_mode(&self, emvco: &EmvcoConfig) -> ModeResponse {
        if let Err(msg) = emvco.validate() {
            warn!(reason = %msg, "Start refused, invalid configuration");
            return ModeResponse::Rejected(RejectReason::InvalidConfig(msg));
        }

        if let Err(current) = self.mode.transition(EmvcoMode::Idle, EmvcoMode::Starting) {
            return match current {
                EmvcoMode::Active | EmvcoMode::Starting => ModeResponse::AlreadyActive,
                other => ModeResponse::Rejected(RejectReason::TransitionInProgress(other)),
            };
        }

        let result = self.run_mode_command(self.config.opcodes.start, &emvco.to_bytes());
        self.finish(EmvcoMode::Idle, EmvcoMode::Starting, EmvcoMode::Active, result)
    }

    /// Stop EMVCo polling.
    #[instrument(skip(self))]
    pub fn stop_mode(&self) -> ModeResponse {
        if let Err(current) = self.mode.transition(EmvcoMode::Active, EmvcoMode::Stopping) {
            return match current {
                EmvcoMode::Idle | EmvcoMode::Stopping => ModeResponse::AlreadyIdle,
                other => ModeResponse::Rejected(RejectReason::TransitionInProgress(other)),
            };
        }

        let result = self.run_mode_command(self.config.opcodes.stop, &[]);
        self.finish(EmvcoMode::Active, EmvcoMode::Stopping, EmvcoMode::Idle, result)
    }

    /// Send a vendor extension command over the same channel.
    ///
    /// Shares the single in-flight slot with mode commands; returns `Busy`
    /// rather than waiting. Mode opcodes are refused here.
    #[instrument(skip(self, payload), fields(opcode = %format!("0x{:02X}", opcode)))]
    pub fn send_ext_command(&self, opcode: u8, payload: &[u8]) -> Result<Frame, ExchangeError> {
        let ops = &self.config.opcodes;
        if opcode == ops.start || opcode == ops.stop {
            return Err(ExchangeError::ReservedOpcode(opcode));
        }
        self.engine
            .exchange(opcode, payload, self.config.exchange_timeout())
    }

    /// Reset the controller through the transport. Mode is not altered.
    pub fn reset_chip(&self) -> Result<(), ExchangeError> {
        self.warn_if_active();
        self.engine.reset(None)
    }

    /// Reset the controller with an explicit power argument.
    pub fn reset_chip_with(&self, arg: u64) -> Result<(), ExchangeError> {
        self.warn_if_active();
        self.engine.reset(Some(arg))
    }

    fn warn_if_active(&self) {
        let mode = self.current_mode();
        if mode != EmvcoMode::Idle {
            warn!(mode = %mode, "Resetting controller while EMVCo mode is not idle");
        }
    }

    fn run_mode_command(&self, opcode: u8, payload: &[u8]) -> Result<(), RejectReason> {
        let frame = self.exchange_retrying_busy(opcode, payload)?;
        match frame.status() {
            Some(Status::Ok) => Ok(()),
            Some(status) => Err(RejectReason::Status { opcode, status }),
            None => Err(RejectReason::MissingStatus { opcode }),
        }
    }

    /// `Busy` means nothing was written, so retrying it is safe.
    /// Timeouts and failures are never retried: the chip may have acted.
    fn exchange_retrying_busy(&self, opcode: u8, payload: &[u8]) -> Result<Frame, ExchangeError> {
        let mut attempt = 0;
        loop {
            match self
                .engine
                .exchange(opcode, payload, self.config.exchange_timeout())
            {
                Err(ExchangeError::Busy) if attempt < self.config.busy_retries => {
                    attempt += 1;
                    debug!(attempt, "Channel busy, retrying");
                    thread::sleep(Duration::from_millis(self.config.busy_backoff_ms));
                }
                other => return other,
            }
        }
    }

    fn finish(
        &self,
        stable: EmvcoMode,
        transitional: EmvcoMode,
        target: EmvcoMode,
        result: Result<(), RejectReason>,
    ) -> ModeResponse {
        match result {
            Ok(()) => {
                if let Err(current) = self.mode.transition(transitional, target) {
                    error!(
                        expected = %transitional,
                        current = %current,
                        "Mode changed underneath a transition"
                    );
                }
                info!(mode = %target, "EMVCo mode confirmed");
                self.registry.notify(&ControlEvent::ModeChanged {
                    from: stable,
                    to: target,
                });
                ModeResponse::Accepted
            }
            Err(reason) => {
                if let Err(current) = self.mode.transition(transitional, stable) {
                    error!(
                        expected = %transitional,
                        current = %current,
                        "Mode changed underneath a transition"
                    );
                }
                warn!(
                    target_mode = %target,
                    reverted_to = %stable,
                    reason = %reason,
                    "EMVCo transition failed"
                );
                self.registry.notify(&ControlEvent::ModeTransitionFailed {
                    target,
                    reverted_to: stable,
                    reason: reason.clone(),
                });
                ModeResponse::Rejected(reason)
            }
        }
    }
}
