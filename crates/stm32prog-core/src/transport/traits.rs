//! Serial transport abstraction.
//!
//! Defines the `SerialPort` trait used by the serial engine, so the same
//! engine runs on a UART, a TCP socket or a scripted mock.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Receive overrun")]
    Overrun,

    #[error("Parity error")]
    Parity,

    #[error("Line disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Errors after which the next byte can still be read.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Overrun | TransportError::Parity)
    }
}

/// Full-duplex byte stream (8 data bits, even parity, one stop bit).
///
/// Reads block until a byte arrives; there is no internal timeout.
pub trait SerialPort: Send {
    /// Read one byte.
    fn getc(&mut self) -> Result<u8, TransportError>;

    /// Write one byte.
    fn putc(&mut self, byte: u8) -> Result<(), TransportError>;

    /// Write a whole buffer.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        for &b in bytes {
            self.putc(b)?;
        }
        Ok(())
    }

    /// Drop any received byte not read yet.
    fn flush_input(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<P: SerialPort + ?Sized> SerialPort for Box<P> {
    fn getc(&mut self) -> Result<u8, TransportError> {
        (**self).getc()
    }

    fn putc(&mut self, byte: u8) -> Result<(), TransportError> {
        (**self).putc(byte)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write_all(bytes)
    }

    fn flush_input(&mut self) -> Result<(), TransportError> {
        (**self).flush_input()
    }
}
