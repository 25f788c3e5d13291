//! stm32prog-core: STM32MP field programming over UART and USB DFU.
//!
//! This crate implements the device side of the STM32MP programming
//! protocol: it receives a flash layout, builds the partition model of the
//! attached storage, commits the partition tables and then streams each
//! image to its partition while stepping through the programming phases.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, serial command codes, image header codec
//! - **Layout**: Flash layout parser and partition descriptors
//! - **Device / GPT / Alt**: Device model, partition table commit, DFU alternate settings
//! - **State**: Programming session and phase state machine
//! - **NVM**: OTP and PMIC image buffering
//! - **Transport**: Serial port abstraction (stream, mock)
//! - **Backend**: Board collaborators (storage, NVM, platform) and an in-memory board
//! - **Serial / USB**: The two protocol engines
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stm32prog_core::{
//!     BoardConfig, MemoryBoard, ProgramSession, SerialEngine, StreamPort, TracingObserver,
//! };
//!
//! let config = BoardConfig::default();
//! let mut board = MemoryBoard::from_config(&config);
//! let mut session = ProgramSession::new(config.session.clone(), &mut board);
//!
//! let stream = std::net::TcpStream::connect("127.0.0.1:5555").unwrap();
//! let port = StreamPort::new(stream);
//! let mut engine = SerialEngine::new(port, board, Arc::new(TracingObserver));
//! engine.run(&mut session).expect("serial line failed");
//! ```

pub mod alt;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod gpt;
pub mod layout;
pub mod nvm;
pub mod protocol;
pub mod serial;
pub mod state;
pub mod transport;
pub mod usb;

// Re-exports for convenience
pub use alt::{AltConfig, AltSetting, AltTarget, build_alt_settings};
pub use backend::{BackendError, Board, MemoryBoard, MemoryNvm};
pub use config::{BoardConfig, MmcConfig, SessionConfig};
pub use device::{Device, ModelError, build_devices};
pub use error::ProgramError;
pub use events::{
    Channel, LogLevel, NullObserver, ProgramEvent, ProgramObserver, RecordingObserver,
    TracingObserver,
};
pub use gpt::{commit_partition_tables, gpt_command};
pub use layout::{LayoutError, PartitionDescriptor, Target, parse_flash_layout};
pub use nvm::{NvmError, NvmKind};
pub use protocol::{ImageHeader, SerialCommand};
pub use serial::{LoopExit, SerialEngine};
pub use state::{Phase, ProgramSession};
pub use transport::{MockSerial, SerialPort, StreamPort, TransportError};
pub use usb::UsbEngine;
