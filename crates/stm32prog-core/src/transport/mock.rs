//! Mock serial port for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{SerialPort, TransportError};

#[derive(Debug, Clone, Copy)]
enum Rx {
    Byte(u8),
    Overrun,
}

/// Scripted serial line: queued host bytes in, captured device bytes out.
///
/// Clones share the same queues, so a test keeps a handle after moving the
/// port into an engine. Reading past the queue reports `Disconnected`.
#[derive(Clone, Default)]
pub struct MockSerial {
    rx: Arc<Mutex<VecDeque<Rx>>>,
    tx: Arc<Mutex<Vec<u8>>>,
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes sent by the host.
    pub fn queue(&self, bytes: &[u8]) {
        self.rx
            .lock()
            .unwrap()
            .extend(bytes.iter().map(|&b| Rx::Byte(b)));
    }

    /// Queue a command byte followed by its complement.
    pub fn queue_command(&self, code: u8) {
        self.queue(&[code, !code]);
    }

    /// Queue a receive overrun.
    pub fn queue_overrun(&self) {
        self.rx.lock().unwrap().push_back(Rx::Overrun);
    }

    /// Bytes written by the device so far.
    pub fn output(&self) -> Vec<u8> {
        self.tx.lock().unwrap().clone()
    }

    /// Return and clear the written bytes.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *self.tx.lock().unwrap())
    }

    pub fn pending_input(&self) -> usize {
        self.rx.lock().unwrap().len()
    }
}

impl SerialPort for MockSerial {
    fn getc(&mut self) -> Result<u8, TransportError> {
        match self.rx.lock().unwrap().pop_front() {
            Some(Rx::Byte(b)) => Ok(b),
            Some(Rx::Overrun) => Err(TransportError::Overrun),
            None => Err(TransportError::Disconnected),
        }
    }

    fn putc(&mut self, byte: u8) -> Result<(), TransportError> {
        self.tx.lock().unwrap().push(byte);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_queue_and_capture() {
        let mut port = MockSerial::new();
        let handle = port.clone();
        handle.queue(&[0x7F, 0x00]);
        handle.queue_overrun();

        assert_eq!(port.getc().unwrap(), 0x7F);
        assert_eq!(port.getc().unwrap(), 0x00);
        assert!(port.getc().unwrap_err().is_transient());
        assert!(matches!(port.getc(), Err(TransportError::Disconnected)));

        port.write_all(&[0x79, 0x1F]).unwrap();
        assert_eq!(handle.output(), vec![0x79, 0x1F]);
        assert_eq!(handle.take_output(), vec![0x79, 0x1F]);
        assert!(handle.output().is_empty());
    }
}
