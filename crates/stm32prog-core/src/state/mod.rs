//! State machine module.

pub mod machine;
pub mod phase;
pub mod transfer;

pub use machine::{ERROR_TEXT_MAX, ProgramSession};
pub use phase::Phase;
pub use transfer::{Transfer, TransferError};
