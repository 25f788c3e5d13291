//! Session-level error type.

use thiserror::Error;

use crate::backend::BackendError;
use crate::device::ModelError;
use crate::layout::LayoutError;
use crate::nvm::NvmError;
use crate::state::{Phase, TransferError};

/// Any failure of a session operation.
///
/// Its text is what the host reads back through get-phase or the command
/// channel once the session is in phase `Reset`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProgramError {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Nvm(#[from] NvmError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("invalid received phase id {requested}, current phase is {current}")]
    InvalidPhase { requested: u8, current: Phase },

    #[error("phase 0x{0:02x} not found")]
    UnknownPhase(u8),

    #[error("Invalid partition id 0x{0:02x}")]
    UnknownPartition(u8),

    #[error("invalid alternate setting {0}")]
    UnknownAlt(u8),

    #[error("no partition for phase {0}")]
    NoPartition(Phase),

    #[error("FlashLayout too large: 0x{offset:x} > 0x{max:x}")]
    LayoutOverflow { offset: u64, max: usize },

    #[error("Application at 0x{address:08x} terminated")]
    ExecuteReturned { address: u32 },

    #[error("invalid request size {len}, minimum {min}")]
    ShortRequest { len: usize, min: usize },

    #[error("invalid offset 0x{0:x}")]
    InvalidOffset(u64),
}

pub type Result<T> = std::result::Result<T, ProgramError>;
