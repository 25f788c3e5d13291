//! Protocol module - wire constants, command decoding and the image header.

pub mod command;
pub mod constants;
pub mod header;

pub use command::{FramingError, SerialCommand, xor_checksum};
pub use constants::*;
pub use header::{BL_HEADER_SIZE, ChecksumMismatch, HeaderError, ImageHeader, payload_checksum};
