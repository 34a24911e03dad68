//! Protocol constants for the NFCC EMVCo control channel.
//!
//! Opcodes and ioctl values match the NXP PN5xx kernel driver conventions.

// ============================================================================
// Framing
// ============================================================================

/// Size of the length prefix (1 byte).
pub const LENGTH_FIELD_SIZE: usize = 1;

/// Size of the opcode field (1 byte).
pub const OPCODE_FIELD_SIZE: usize = 1;

/// Largest payload a one-byte length field can describe (length counts the opcode).
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize - OPCODE_FIELD_SIZE;

/// Largest frame on the wire.
pub const MAX_FRAME_SIZE: usize = LENGTH_FIELD_SIZE + OPCODE_FIELD_SIZE + MAX_PAYLOAD_SIZE;

// ============================================================================
// Opcodes (Host -> NFCC)
// ============================================================================

/// Start EMVCo polling mode.
pub const OP_EMVCO_START: u8 = 0x01;

/// Stop EMVCo polling mode.
pub const OP_EMVCO_STOP: u8 = 0x02;

// ============================================================================
// Notifications (NFCC -> Host)
// ============================================================================

/// Out-of-band controller state notification.
pub const NTF_CHIP_STATE: u8 = 0x60;

// ============================================================================
// Status codes (first payload byte of a response)
// ============================================================================

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_REJECTED: u8 = 0x01;
pub const STATUS_FAILED: u8 = 0x03;
pub const STATUS_NOT_INITIALIZED: u8 = 0x04;
pub const STATUS_SYNTAX_ERROR: u8 = 0x05;
pub const STATUS_SEMANTIC_ERROR: u8 = 0x06;

// ============================================================================
// Chip states carried by NTF_CHIP_STATE
// ============================================================================

pub const CHIP_STATE_OFF: u8 = 0x01;
pub const CHIP_STATE_TURNING_OFF: u8 = 0x02;
pub const CHIP_STATE_ON: u8 = 0x03;
pub const CHIP_STATE_TURNING_ON: u8 = 0x04;

// ============================================================================
// EMVCo polling technologies (start command bitmask)
// ============================================================================

pub const TECH_NFC_A: u8 = 0x01;
pub const TECH_NFC_B: u8 = 0x02;
pub const TECH_NFC_F: u8 = 0x04;
pub const TECH_NFC_V: u8 = 0x08;

/// All technologies the controller understands.
pub const TECH_ALL: u8 = TECH_NFC_A | TECH_NFC_B | TECH_NFC_F | TECH_NFC_V;

// ============================================================================
// Device node ioctls
// ============================================================================

/// `_IOW(0xE9, 0x01, long)` - power control on the NFC device node.
pub const NFC_SET_PWR: u64 = 0x4008_E901;

pub const NFC_POWER_OFF: u64 = 0;
pub const NFC_POWER_ON: u64 = 1;
pub const NFC_FW_DOWNLOAD: u64 = 2;
pub const NFC_VEN_RESET: u64 = 3;

/// Default device node for the NFCC.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/nxpnfc";

// ============================================================================
// Timing
// ============================================================================

/// Default bound on a single command/response exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT_MS: u64 = 500;

/// Bound on a single transport read, so the reader can observe shutdown.
pub const READ_POLL_TIMEOUT_MS: u64 = 100;

/// Back-off after a transient read failure.
pub const READ_ERROR_BACKOFF_MS: u64 = 50;
