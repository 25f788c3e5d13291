//! Board collaborators: storage, partition table, DFU medium, NVM, platform.

pub mod mock;
pub mod traits;

pub use mock::{MemoryBoard, MemoryNvm};
pub use traits::{
    BackendError, BlockDevice, BlockGeometry, Board, DfuMedium, NvmBackend, PartitionInfo,
    PartitionTable, Platform,
};
