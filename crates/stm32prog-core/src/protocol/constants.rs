//! Protocol constants shared by the serial and USB programming paths.
//!
//! Values must match the host programming tool byte for byte.

// ============================================================================
// Phase Identifiers
// ============================================================================

/// Phase receiving the flash layout.
pub const PHASE_FLASHLAYOUT: u16 = 0x00;
/// First id usable by a layout partition.
pub const PHASE_FIRST_USER: u16 = 0x01;
/// Last id usable by a layout partition.
pub const PHASE_LAST_USER: u16 = 0xF0;
/// Virtual command channel.
pub const PHASE_CMD: u16 = 0xF1;
/// One-time-programmable memory.
pub const PHASE_OTP: u16 = 0xF2;
/// PMIC non-volatile configuration.
pub const PHASE_PMIC: u16 = 0xF4;
/// All selected partitions transferred.
pub const PHASE_END: u16 = 0xFE;
/// Session stopped, waiting for the host to request a reset.
pub const PHASE_RESET: u16 = 0xFF;
/// Reset requested; never sent on the wire as such.
pub const PHASE_DO_RESET: u16 = 0x1FF;

/// Address reported when no destination applies.
pub const DEFAULT_ADDRESS: u32 = 0xFFFF_FFFF;

// ============================================================================
// Serial Control Bytes
// ============================================================================

/// Connection request from the host.
pub const INIT_BYTE: u8 = 0x7F;
/// Acknowledge.
pub const ACK_BYTE: u8 = 0x79;
/// Not acknowledged, the host may retry.
pub const NACK_BYTE: u8 = 0x1F;
/// Abort, the destination is broken and retrying is pointless.
pub const ABORT_BYTE: u8 = 0x5F;

// ============================================================================
// Serial Commands
// ============================================================================

pub const GET_CMD_COMMAND: u8 = 0x00;
pub const GET_VER_COMMAND: u8 = 0x01;
pub const GET_ID_COMMAND: u8 = 0x02;
pub const PHASE_COMMAND: u8 = 0x03;
pub const READ_COMMAND: u8 = 0x11;
pub const READ_PART_COMMAND: u8 = 0x12;
pub const START_COMMAND: u8 = 0x21;
pub const DOWNLOAD_COMMAND: u8 = 0x31;

/// Protocol version reported by get-capabilities.
pub const USART_BL_VERSION: u8 = 0x40;
/// Bootloader version reported by get-version.
pub const UBOOT_BL_VERSION: u8 = 0x03;
/// Product identifier reported by get-id.
pub const DEVICE_ID: u16 = 0x0500;

/// Size of the serial packet buffer; a packet carries at most this many bytes.
pub const USART_RAM_BUFFER_SIZE: usize = 256;

/// Wait after a checksum error so a slow host finishes sending the packet.
pub const CHECKSUM_GUARD_DELAY_MS: u32 = 30;

// ============================================================================
// Sizes
// ============================================================================

/// Size of the command virtual channel.
pub const CMD_SIZE: usize = 512;
/// OTP image size when served by the secure monitor.
pub const OTP_SIZE_SMC: usize = 1024;
/// OTP image size when served by the trusted application.
pub const OTP_SIZE_TA: usize = 776;
/// PMIC non-volatile memory size.
pub const PMIC_SIZE: usize = 8;

/// Minimum reply size of a command channel read.
pub const PHASE_MIN_SIZE: usize = 9;

/// Maximum number of storage devices referenced by one layout.
pub const STM32PROG_MAX_DEV: usize = 5;

/// Default size of the RAM region receiving the flash layout.
pub const FLASHLAYOUT_MAX_SIZE: usize = 0x40000;

/// Blocks reserved for a primary GPT with 128 entries (17 KiB).
pub const GPT_HEADER_SZ: u64 = 34;
