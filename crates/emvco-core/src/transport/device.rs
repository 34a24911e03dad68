//! Device-node transport (e.g. `/dev/nxpnfc`).

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, instrument};

use super::traits::{NfccTransport, TransportError, check_ioctl_arity};
use crate::protocol::constants::READ_POLL_TIMEOUT_MS;

/// Transport over a character device exposed by the NFCC kernel driver.
pub struct DeviceTransport {
    file: File,
    read_timeout_ms: u64,
    connected: AtomicBool,
}

impl DeviceTransport {
    /// Open the device node read/write.
    #[instrument(level = "info")]
    pub fn open(path: &str) -> Result<Self, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| TransportError::OpenFailed {
                path: path.to_string(),
                message: e.to_string(),
            })?;

        info!(path = %path, fd = file.as_raw_fd(), "Device node opened");

        Ok(Self {
            file,
            read_timeout_ms: READ_POLL_TIMEOUT_MS,
            connected: AtomicBool::new(true),
        })
    }

    /// Bound on each `read` call.
    pub fn with_read_timeout(mut self, timeout_ms: u64) -> Self {
        self.read_timeout_ms = timeout_ms;
        self
    }

    /// Wait for the descriptor to become readable.
    fn wait_readable(&self) -> Result<(), TransportError> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = self.read_timeout_ms.min(i32::MAX as u64) as libc::c_int;

        // SAFETY: `pfd` is a valid pollfd for one open descriptor owned by `self.file`.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout) };

        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Err(TransportError::Timeout {
                    timeout_ms: self.read_timeout_ms,
                });
            }
            return Err(TransportError::ReadFailed(err.to_string()));
        }
        if rc == 0 {
            return Err(TransportError::Timeout {
                timeout_ms: self.read_timeout_ms,
            });
        }
        if pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0
            && pfd.revents & libc::POLLIN == 0
        {
            self.connected.store(false, Ordering::Release);
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

impl NfccTransport for DeviceTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        (&self.file)
            .write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        self.wait_readable()?;

        let mut buf = vec![0u8; max_len];
        let n = (&self.file)
            .read(&mut buf)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        if n == 0 {
            self.connected.store(false, Ordering::Release);
            return Err(TransportError::Disconnected);
        }

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    #[instrument(skip(self), fields(request = %format!("0x{:08X}", request)))]
    fn ioctl(&self, request: u64, args: &[u64]) -> Result<i32, TransportError> {
        check_ioctl_arity(request, args)?;
        let fd = self.file.as_raw_fd();

        // SAFETY: `fd` is open for the lifetime of `self`; the driver's control
        // requests take either no argument or a single integer by value.
        let rc = unsafe {
            match args {
                [] => libc::ioctl(fd, request as _),
                [arg] => libc::ioctl(fd, request as _, *arg as libc::c_ulong),
                _ => unreachable!("arity checked above"),
            }
        };

        if rc < 0 {
            return Err(TransportError::IoctlFailed {
                request,
                message: std::io::Error::last_os_error().to_string(),
            });
        }
        debug!(rc, "ioctl complete");
        Ok(rc)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
