//! `SerialPort` over any `std::io` stream (TCP socket, pty, tty device).

use std::io::{ErrorKind, Read, Write};

use super::traits::{SerialPort, TransportError};

pub struct StreamPort<S> {
    inner: S,
}

impl<S: Read + Write + Send> StreamPort<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Read + Write + Send> SerialPort for StreamPort<S> {
    fn getc(&mut self) -> Result<u8, TransportError> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(_) => return Ok(byte[0]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Err(TransportError::Disconnected);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn putc(&mut self, byte: u8) -> Result<(), TransportError> {
        self.write_all(&[byte])
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.inner.write_all(bytes)?;
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory duplex: reads from `input`, appends writes to `output`.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_stream_port() {
        let mut port = StreamPort::new(Duplex {
            input: Cursor::new(vec![0x7F]),
            output: Vec::new(),
        });
        assert_eq!(port.getc().unwrap(), 0x7F);
        assert!(matches!(port.getc(), Err(TransportError::Disconnected)));
        port.putc(0x79).unwrap();
        assert_eq!(port.into_inner().output, vec![0x79]);
    }
}
