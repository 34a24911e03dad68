//! EMVCo-Core: EMVCo mode control for NFC controllers in Rust.
//!
//! This crate drives the contact-card "EMVCo mode" of an NFC controller
//! (NFCC) over its control channel: it sends mode commands, correlates
//! the controller's asynchronous responses, and reports state changes to
//! a single registered listener.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, frame codec, status and chip state decoding
//! - **Transport**: Byte channel abstraction (device node, mock)
//! - **Exchange**: One-at-a-time command/response correlation
//! - **Reader**: Background thread feeding inbound bytes to the exchange
//! - **State**: EMVCo mode states
//! - **Controller**: Start/stop orchestration over the exchange
//! - **Events / Registry**: Listener trait and the single listener slot
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use emvco_core::{ControllerConfig, EmvcoController, TracingListener};
//!
//! let config = ControllerConfig::default();
//! let controller = EmvcoController::open(config.clone()).expect("open failed");
//! controller.register_listener(Arc::new(TracingListener));
//!
//! let response = controller.start_mode(&config.emvco);
//! println!("start: {}", response);
//! ```

pub mod config;
pub mod controller;
pub mod events;
pub mod exchange;
pub mod protocol;
pub mod reader;
pub mod registry;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use config::{ControllerConfig, EmvcoConfig, OpcodeConfig};
pub use controller::EmvcoController;
pub use events::{ChannelListener, ControlEvent, ControlListener, NullListener, TracingListener};
pub use exchange::{ExchangeConfig, ExchangeEngine, ExchangeError};
pub use protocol::{ChipState, Frame, FrameError, ParseResult, Status};
pub use reader::Reader;
pub use registry::ListenerRegistry;
pub use state::{EmvcoMode, ModeResponse, RejectReason};
#[cfg(unix)]
pub use transport::DeviceTransport;
pub use transport::{MockTransport, NfccTransport, TransportError};
