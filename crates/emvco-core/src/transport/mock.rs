//! Mock NFCC transport for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::traits::{NfccTransport, TransportError, check_ioctl_arity};
use crate::protocol::constants::{LENGTH_FIELD_SIZE, MAX_PAYLOAD_SIZE};
use crate::protocol::frame::encode;

/// How long an empty `read` waits before reporting a timeout.
const MOCK_READ_TIMEOUT_MS: u64 = 10;

/// Mock transport for exercising the engine and state machine.
///
/// Writes are captured. Replies can be scripted per written opcode: every
/// write of that opcode pops the next scripted reply onto the read queue,
/// which is how a controller answering a command looks from the host side.
pub struct MockTransport {
    /// Bytes waiting to be returned by `read`.
    read_queue: Mutex<VecDeque<Vec<u8>>>,
    readable: Condvar,
    /// Scripted replies, keyed by the opcode of the triggering write.
    replies: Mutex<HashMap<u8, VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Mutex<Vec<Vec<u8>>>,
    /// Captured ioctls.
    ioctl_log: Mutex<Vec<(u64, Vec<u64>)>>,
    fail_writes: Mutex<bool>,
    fail_next_read: Mutex<bool>,
    connected: Mutex<bool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            read_queue: Mutex::new(VecDeque::new()),
            readable: Condvar::new(),
            replies: Mutex::new(HashMap::new()),
            write_log: Mutex::new(Vec::new()),
            ioctl_log: Mutex::new(Vec::new()),
            fail_writes: Mutex::new(false),
            fail_next_read: Mutex::new(false),
            connected: Mutex::new(true),
        }
    }

    /// Queue raw bytes to be returned on a later read.
    pub fn queue_read(&self, bytes: &[u8]) {
        self.read_queue.lock().unwrap().push_back(bytes.to_vec());
        self.readable.notify_all();
    }

    /// Queue an encoded frame to be returned on a later read.
    pub fn queue_frame(&self, opcode: u8, payload: &[u8]) {
        let bytes = encode(opcode, payload, MAX_PAYLOAD_SIZE).unwrap();
        self.queue_read(&bytes);
    }

    /// Script raw bytes to be made readable after the next write of `opcode`.
    pub fn reply_to(&self, opcode: u8, bytes: &[u8]) {
        self.replies
            .lock()
            .unwrap()
            .entry(opcode)
            .or_default()
            .push_back(bytes.to_vec());
    }

    /// Script a response frame for the next write of `opcode`.
    pub fn reply_frame(&self, opcode: u8, response_opcode: u8, payload: &[u8]) {
        let bytes = encode(response_opcode, payload, MAX_PAYLOAD_SIZE).unwrap();
        self.reply_to(opcode, &bytes);
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Opcodes of all captured writes, in order.
    pub fn written_opcodes(&self) -> Vec<u8> {
        self.write_log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|w| w.get(LENGTH_FIELD_SIZE).copied())
            .collect()
    }

    /// Get all captured ioctls.
    pub fn get_ioctls(&self) -> Vec<(u64, Vec<u64>)> {
        self.ioctl_log.lock().unwrap().clone()
    }

    /// Make every write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }

    /// Make the next read fail with a read error.
    pub fn fail_next_read(&self) {
        *self.fail_next_read.lock().unwrap() = true;
        self.readable.notify_all();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
        self.readable.notify_all();
    }

    /// Whether every queued read has been consumed.
    pub fn reads_drained(&self) -> bool {
        self.read_queue.lock().unwrap().is_empty()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl NfccTransport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        if *self.fail_writes.lock().unwrap() {
            return Err(TransportError::WriteFailed("injected failure".into()));
        }
        self.write_log.lock().unwrap().push(data.to_vec());

        if let Some(&opcode) = data.get(LENGTH_FIELD_SIZE) {
            let reply = self
                .replies
                .lock()
                .unwrap()
                .get_mut(&opcode)
                .and_then(|q| q.pop_front());
            if let Some(bytes) = reply {
                self.queue_read(&bytes);
            }
        }
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        {
            let mut fail = self.fail_next_read.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(TransportError::ReadFailed("injected failure".into()));
            }
        }

        let queue = self.read_queue.lock().unwrap();
        let (mut queue, _) = self
            .readable
            .wait_timeout_while(
                queue,
                Duration::from_millis(MOCK_READ_TIMEOUT_MS),
                |q| q.is_empty(),
            )
            .unwrap();

        let Some(mut bytes) = queue.pop_front() else {
            return Err(TransportError::Timeout {
                timeout_ms: MOCK_READ_TIMEOUT_MS,
            });
        };
        if bytes.len() > max_len {
            let rest = bytes.split_off(max_len);
            queue.push_front(rest);
        }
        Ok(bytes)
    }

    fn ioctl(&self, request: u64, args: &[u64]) -> Result<i32, TransportError> {
        check_ioctl_arity(request, args)?;
        self.ioctl_log
            .lock()
            .unwrap()
            .push((request, args.to_vec()));
        Ok(0)
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }
}
