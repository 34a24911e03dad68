//! NFCC transport abstraction.
//!
//! Defines the `NfccTransport` trait for the controller's byte channel,
//! allowing different implementations (device node, mock, etc.).

use thiserror::Error;

use crate::protocol::constants::{NFC_SET_PWR, NFC_VEN_RESET};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {path}: {message}")]
    OpenFailed { path: String, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("ioctl 0x{request:08X} failed: {message}")]
    IoctlFailed { request: u64, message: String },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract NFCC transport interface.
///
/// `read` must be bounded: an implementation returns
/// [`TransportError::Timeout`] when nothing arrives within its poll window.
pub trait NfccTransport: Send + Sync {
    /// Write raw bytes to the controller.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes from the controller.
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Issue a device control request with zero or one argument.
    ///
    /// These are the `ioctl(fd, request)` and `ioctl(fd, request, arg)`
    /// forms; anything longer fails with [`TransportError::Unsupported`].
    fn ioctl(&self, request: u64, args: &[u64]) -> Result<i32, TransportError>;

    /// Reset the controller.
    fn reset(&self) -> Result<(), TransportError> {
        self.ioctl(NFC_SET_PWR, &[NFC_VEN_RESET]).map(|_| ())
    }

    /// Reset the controller with an explicit power argument.
    fn reset_with(&self, arg: u64) -> Result<(), TransportError> {
        self.ioctl(NFC_SET_PWR, &[arg]).map(|_| ())
    }

    /// Check if the channel is still usable.
    fn is_connected(&self) -> bool;
}

/// Reject control requests outside the one- and two-argument forms.
pub(crate) fn check_ioctl_arity(request: u64, args: &[u64]) -> Result<(), TransportError> {
    if args.len() > 1 {
        return Err(TransportError::Unsupported(format!(
            "ioctl 0x{:08X} with {} arguments",
            request,
            args.len()
        )));
    }
    Ok(())
}
