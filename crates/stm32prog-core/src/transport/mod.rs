//! Transport layer module.

pub mod mock;
pub mod stream;
pub mod traits;

pub use mock::MockSerial;
pub use stream::StreamPort;
pub use traits::{SerialPort, TransportError};
