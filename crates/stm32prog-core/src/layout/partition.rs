//! Partition descriptors produced by the flash layout parser.

use std::fmt;

use crate::state::Phase;

/// Option column bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartOptions(u8);

impl PartOptions {
    /// `P`: partition is programmed.
    pub const SELECT: u8 = 1 << 0;
    /// `E`: partition is kept empty, nothing is written.
    pub const EMPTY: u8 = 1 << 1;
    /// `D`: partition is erased before programming.
    pub const DELETE: u8 = 1 << 2;

    pub const fn none() -> Self {
        PartOptions(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        PartOptions(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn insert(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub const fn is_select(self) -> bool {
        self.0 & Self::SELECT != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 & Self::EMPTY != 0
    }

    pub const fn is_delete(self) -> bool {
        self.0 & Self::DELETE != 0
    }

    /// Selected and not marked empty: data will be transferred.
    pub const fn is_programmed(self) -> bool {
        self.is_select() && !self.is_empty()
    }
}

/// Type column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartType {
    /// Raw binary such as a boot stage.
    Binary,
    /// Bootable system partition.
    System,
    /// Filesystem image.
    FileSystem,
    /// Image of the whole device starting at offset 0.
    RawImage,
}

impl PartType {
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "Binary" => Some(PartType::Binary),
            "System" => Some(PartType::System),
            "FileSystem" => Some(PartType::FileSystem),
            "RawImage" => Some(PartType::RawImage),
            _ => None,
        }
    }
}

impl fmt::Display for PartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartType::Binary => write!(f, "Binary"),
            PartType::System => write!(f, "System"),
            PartType::FileSystem => write!(f, "FileSystem"),
            PartType::RawImage => write!(f, "RawImage"),
        }
    }
}

/// Ip column: storage class and device index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Not stored anywhere; the line only documents the layout.
    None,
    /// eMMC or SD card with its MMC controller index.
    Mmc(u8),
}

impl Target {
    pub fn dev_id(self) -> u8 {
        match self {
            Target::None => 0,
            Target::Mmc(dev_id) => dev_id,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::None => write!(f, "none"),
            Target::Mmc(dev_id) => write!(f, "mmc{}", dev_id),
        }
    }
}

/// eMMC hardware boot partition, outside the logical partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HwPartition {
    Boot1,
    Boot2,
}

impl HwPartition {
    /// Index used by the MMC layer to select the hardware partition.
    pub const fn index(self) -> u8 {
        match self {
            HwPartition::Boot1 => 1,
            HwPartition::Boot2 => 2,
        }
    }
}

/// Offset column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartAddress {
    /// Absolute byte offset on the device.
    Offset(u64),
    /// Hardware boot partition, addressed from its start.
    Boot(HwPartition),
}

/// Index of a device in the session device table.
pub type DeviceIndex = usize;

/// One layout line, plus the fields resolved by the model builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub option: PartOptions,
    pub id: u8,
    pub name: String,
    pub part_type: PartType,
    pub target: Target,
    pub address: PartAddress,
    /// Layout line the descriptor came from.
    pub line: usize,

    /// Resolved byte size.
    pub size: u64,
    /// Dense 1-based index in the logical partition table.
    pub part_index: Option<u32>,
    /// Owning device.
    pub device: Option<DeviceIndex>,
    /// Transport alternate setting.
    pub alt_id: Option<u8>,
}

impl PartitionDescriptor {
    pub fn phase(&self) -> Phase {
        Phase::user(self.id)
    }

    /// Start offset on the device; hardware boot partitions start at 0.
    pub fn addr(&self) -> u64 {
        match self.address {
            PartAddress::Offset(addr) => addr,
            PartAddress::Boot(_) => 0,
        }
    }

    pub fn hw_partition(&self) -> Option<HwPartition> {
        match self.address {
            PartAddress::Boot(hw) => Some(hw),
            PartAddress::Offset(_) => None,
        }
    }

    pub fn is_boot_partition(&self) -> bool {
        self.hw_partition().is_some()
    }

    pub fn is_raw_image(&self) -> bool {
        self.part_type == PartType::RawImage
    }

    /// Part of the logical partition table of its device.
    pub fn is_logical(&self) -> bool {
        !self.is_boot_partition() && !self.is_raw_image()
    }
}

impl fmt::Display for PartitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name, self.id)
    }
}
