//! Controller and EMVCo start configuration.

use std::time::Duration;

use anyhow::{Result, bail};
use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::exchange::ExchangeConfig;
use crate::protocol::constants::*;

/// Opcodes used on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcodeConfig {
    pub start: u8,
    pub stop: u8,
    pub chip_state: u8,
}

impl Default for OpcodeConfig {
    fn default() -> Self {
        Self {
            start: OP_EMVCO_START,
            stop: OP_EMVCO_STOP,
            chip_state: NTF_CHIP_STATE,
        }
    }
}

/// Parameters of an EMVCo start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmvcoConfig {
    /// Polling technologies bitmask (`TECH_NFC_*`).
    pub technologies: u8,
    /// Polling loop period in milliseconds.
    pub poll_period_ms: u16,
}

impl Default for EmvcoConfig {
    fn default() -> Self {
        Self {
            technologies: TECH_NFC_A | TECH_NFC_B,
            poll_period_ms: 500,
        }
    }
}

impl EmvcoConfig {
    pub const SIZE: usize = 3;

    pub fn new(technologies: u8, poll_period_ms: u16) -> Self {
        Self {
            technologies,
            poll_period_ms,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.technologies == 0 {
            return Err("no polling technology selected".into());
        }
        if self.technologies & !TECH_ALL != 0 {
            return Err(format!(
                "unknown technology bits 0x{:02X}",
                self.technologies & !TECH_ALL
            ));
        }
        Ok(())
    }

    /// Start command payload: `[tech_mask][period_le:2]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(self.technologies);
        buf.write_u16::<LittleEndian>(self.poll_period_ms)
            .expect("writing to a Vec cannot fail");
        buf
    }
}

/// Configuration of the control layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Device node of the controller.
    pub device_path: String,
    /// Bound on each command/response exchange.
    pub exchange_timeout_ms: u64,
    /// How many times a `Busy` exchange is retried before giving up.
    pub busy_retries: u32,
    /// Sleep between `Busy` retries.
    pub busy_backoff_ms: u64,
    /// Largest payload accepted in either direction.
    pub max_payload: usize,
    /// Added to a command opcode to get its response opcode.
    pub response_opcode_offset: u8,
    /// Bytes requested per transport read.
    pub read_chunk: usize,
    /// Bound on each device read, so the reader notices shutdown.
    pub read_poll_timeout_ms: u64,
    pub opcodes: OpcodeConfig,
    /// Default start parameters.
    pub emvco: EmvcoConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            device_path: DEFAULT_DEVICE_PATH.to_string(),
            exchange_timeout_ms: DEFAULT_EXCHANGE_TIMEOUT_MS,
            busy_retries: 2,
            busy_backoff_ms: 20,
            max_payload: MAX_PAYLOAD_SIZE,
            response_opcode_offset: 0,
            read_chunk: 256,
            read_poll_timeout_ms: READ_POLL_TIMEOUT_MS,
            opcodes: OpcodeConfig::default(),
            emvco: EmvcoConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ControllerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.exchange_timeout_ms == 0 {
            bail!("exchange_timeout_ms must be greater than zero");
        }
        if self.max_payload == 0 || self.max_payload > MAX_PAYLOAD_SIZE {
            bail!(
                "max_payload must be between 1 and {}, got {}",
                MAX_PAYLOAD_SIZE,
                self.max_payload
            );
        }
        if self.read_chunk == 0 {
            bail!("read_chunk must be greater than zero");
        }
        if self.read_poll_timeout_ms == 0 {
            bail!("read_poll_timeout_ms must be greater than zero");
        }
        let op = &self.opcodes;
        if op.start == op.stop {
            bail!("start and stop opcodes must differ");
        }
        for (name, opcode) in [("start", op.start), ("stop", op.stop)] {
            if opcode.wrapping_add(self.response_opcode_offset) == op.chip_state {
                bail!(
                    "{} response opcode collides with chip state opcode 0x{:02X}",
                    name,
                    op.chip_state
                );
            }
        }
        if let Err(msg) = self.emvco.validate() {
            bail!("emvco: {}", msg);
        }
        Ok(())
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn exchange_config(&self) -> ExchangeConfig {
        ExchangeConfig {
            max_payload: self.max_payload,
            response_opcode_offset: self.response_opcode_offset,
            chip_state_opcode: self.opcodes.chip_state,
        }
    }
}
