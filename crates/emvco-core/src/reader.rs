//! Background reader feeding inbound bytes into the exchange engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::events::ControlEvent;
use crate::exchange::ExchangeEngine;
use crate::protocol::constants::READ_ERROR_BACKOFF_MS;
use crate::registry::ListenerRegistry;
use crate::transport::{NfccTransport, TransportError};

/// Owns the reader thread. Dropping it stops and joins the thread.
pub struct Reader {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Reader {
    /// Spawn the reader loop for `engine`.
    pub fn spawn<T: NfccTransport + 'static>(
        engine: Arc<ExchangeEngine<T>>,
        registry: Arc<ListenerRegistry>,
        read_chunk: usize,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let handle = thread::Builder::new()
            .name("nfcc-reader".into())
            .spawn(move || run(&engine, &registry, read_chunk, &flag))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Whether the loop is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and wait for it to exit.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Reader thread panicked");
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<T: NfccTransport>(
    engine: &ExchangeEngine<T>,
    registry: &ListenerRegistry,
    read_chunk: usize,
    stop: &AtomicBool,
) {
    info!("Reader started");
    while !stop.load(Ordering::Acquire) {
        match engine.transport().read(read_chunk) {
            Ok(bytes) => {
                if !bytes.is_empty() {
                    debug!(len = bytes.len(), "Bytes received");
                    engine.feed(&bytes);
                }
            }
            Err(TransportError::Timeout { .. }) => continue,
            Err(TransportError::Disconnected) => {
                warn!("Transport disconnected, reader stopping");
                engine.fail_pending(TransportError::Disconnected);
                registry.notify(&ControlEvent::TransportLost);
                break;
            }
            Err(e) => {
                warn!(error = %e, "Read error");
                engine.fail_pending(e);
                thread::sleep(Duration::from_millis(READ_ERROR_BACKOFF_MS));
            }
        }
    }
    info!("Reader stopped");
}
