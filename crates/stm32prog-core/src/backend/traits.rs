//! Collaborator interfaces.
//!
//! Storage drivers, the partition-table service, the DFU medium layer, the
//! OTP/PMIC services and the platform itself live outside this crate. The
//! engines only reach them through these traits.

use thiserror::Error;

use crate::alt::AltSetting;
use crate::layout::{HwPartition, Target};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("{0} device not found")]
    DeviceNotFound(Target),

    #[error("Couldn't find part {index} on device {target}")]
    PartitionNotFound { target: Target, index: u32 },

    #[error("access out of range: 0x{offset:x}+0x{len:x} > 0x{limit:x}")]
    OutOfRange { offset: u64, len: u64, limit: u64 },

    #[error("command '{command}' failed: {reason}")]
    Command { command: String, reason: String },

    #[error("{operation} failed: {reason}")]
    Io {
        operation: &'static str,
        reason: String,
    },

    #[error("{0} not supported")]
    Unsupported(&'static str),
}

/// Geometry reported by a block device driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    /// Bytes per block.
    pub block_size: u64,
    /// Number of blocks in the user area.
    pub blocks: u64,
    /// Erase group, in blocks.
    pub erase_group_blocks: u64,
    /// Size of each hardware boot partition, in bytes.
    pub boot_size: u64,
}

impl BlockGeometry {
    pub fn capacity(&self) -> u64 {
        self.blocks * self.block_size
    }

    pub fn erase_size(&self) -> u64 {
        self.erase_group_blocks * self.block_size
    }
}

/// Existing entry of a device partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub name: String,
    pub start: u64,
    pub size: u64,
}

pub trait BlockDevice {
    /// Probe the device and return its geometry.
    fn geometry(&mut self, target: Target) -> Result<BlockGeometry, BackendError>;

    /// Entry `index` (1-based) of the partition table currently on the device.
    fn partition_info(&mut self, target: Target, index: u32)
    -> Result<PartitionInfo, BackendError>;

    /// Erase a byte range of the user area or of a hardware boot partition.
    fn erase(
        &mut self,
        target: Target,
        hw: Option<HwPartition>,
        offset: u64,
        len: u64,
    ) -> Result<(), BackendError>;

    /// Make `hw` the partition the boot ROM loads from.
    fn select_boot_partition(
        &mut self,
        target: Target,
        hw: HwPartition,
    ) -> Result<(), BackendError>;
}

pub trait PartitionTable {
    /// Run a textual table definition (`gpt write mmc N "..."`).
    fn commit_table(&mut self, target: Target, command: &str) -> Result<(), BackendError>;

    /// Reload the partition table of the device after a commit.
    fn reprobe(&mut self, target: Target) -> Result<(), BackendError>;
}

/// DFU medium operations, keyed by alternate setting.
pub trait DfuMedium {
    fn medium_write(
        &mut self,
        alt: &AltSetting,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;

    /// Read into `buf`, returning the number of bytes available.
    fn medium_read(
        &mut self,
        alt: &AltSetting,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, BackendError>;

    /// End of transfer on `alt`.
    fn medium_flush(&mut self, alt: &AltSetting) -> Result<(), BackendError>;
}

/// Whole-image access to a small non-volatile memory (OTP, PMIC).
pub trait NvmBackend {
    fn size(&self) -> usize;

    fn read_all(&mut self, buf: &mut [u8]) -> Result<(), BackendError>;

    fn write_all(&mut self, data: &[u8]) -> Result<(), BackendError>;
}

pub trait Platform {
    /// Jump to `address`. Returning at all means the image gave control back.
    fn execute(&mut self, address: u32) -> Result<(), BackendError>;

    fn delay_ms(&mut self, ms: u32);

    /// Polled at the top of the serial loop (interrupt key).
    fn cancel_requested(&mut self) -> bool {
        false
    }

    /// Raw memory read for the read-memory command.
    fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<(), BackendError>;
}

/// Everything a programming session needs from the board.
pub trait Board: BlockDevice + PartitionTable + DfuMedium + Platform {
    fn otp(&mut self) -> Option<&mut dyn NvmBackend>;

    fn pmic(&mut self) -> Option<&mut dyn NvmBackend>;

    /// Size of the OTP image, if OTP is available.
    fn otp_size(&mut self) -> Option<usize> {
        self.otp().map(|otp| otp.size())
    }

    fn has_pmic(&mut self) -> bool {
        self.pmic().is_some()
    }
}
