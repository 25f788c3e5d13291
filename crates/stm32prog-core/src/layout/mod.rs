//! Flash layout module - partition descriptors and the text parser.

pub mod parser;
pub mod partition;

pub use parser::{LayoutError, PART_NAME_SIZE, parse_flash_layout};
pub use partition::{
    DeviceIndex, HwPartition, PartAddress, PartOptions, PartType, PartitionDescriptor, Target,
};
