//! Transport layer module.

#[cfg(unix)]
pub mod device;
pub mod mock;
pub mod traits;

#[cfg(unix)]
pub use device::DeviceTransport;
pub use mock::MockTransport;
pub use traits::{NfccTransport, TransportError};
