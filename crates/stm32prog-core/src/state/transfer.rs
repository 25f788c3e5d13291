//! Transfer bookkeeping for the current phase.
//!
//! Tracks the write cursor and, for serial downloads, captures the first
//! [`BL_HEADER_SIZE`] bytes of the transfer (possibly spread over several
//! packets) to find an image header. Once a header is found the payload
//! checksum is accumulated so `start` can verify the whole image.

use thiserror::Error;
use tracing::debug;

use crate::protocol::header::{BL_HEADER_SIZE, ChecksumMismatch, ImageHeader, payload_checksum};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer length error: 0x{actual:x} != 0x{expected:x}")]
    Length { actual: u64, expected: u64 },

    #[error(transparent)]
    Checksum(#[from] ChecksumMismatch),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HeaderCapture {
    /// Waiting for header bytes.
    Pending(Vec<u8>),
    /// Header region complete; `None` when it held no image header.
    Resolved(Option<ImageHeader>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    cursor: u64,
    checksum: u32,
    capture: HeaderCapture,
}

impl Default for Transfer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transfer {
    pub fn new() -> Self {
        Self {
            cursor: 0,
            checksum: 0,
            capture: HeaderCapture::Pending(Vec::with_capacity(BL_HEADER_SIZE)),
        }
    }

    /// Restart from the first byte of a new transfer.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Resume at `offset`; a resumed transfer is never checked against a header.
    pub fn set_cursor(&mut self, offset: u64) {
        self.reset();
        self.cursor = offset;
        if offset != 0 {
            self.capture = HeaderCapture::Resolved(None);
        }
    }

    /// Move the cursor without looking at the data (OTP/PMIC images).
    pub fn skip(&mut self, len: usize) {
        self.cursor += len as u64;
    }

    /// Image header found at the start of the transfer, if any.
    pub fn header(&self) -> Option<&ImageHeader> {
        match &self.capture {
            HeaderCapture::Resolved(header) => header.as_ref(),
            HeaderCapture::Pending(_) => None,
        }
    }

    /// Account for `data`, written at the current cursor.
    pub fn feed(&mut self, data: &[u8]) {
        let mut payload = data;
        if let HeaderCapture::Pending(buf) = &mut self.capture {
            let take = (BL_HEADER_SIZE - buf.len()).min(payload.len());
            buf.extend_from_slice(&payload[..take]);
            payload = &payload[take..];
            if buf.len() == BL_HEADER_SIZE {
                let header = ImageHeader::detect(buf);
                if let Some(header) = &header {
                    debug!(
                        length = %format!("0x{:x}", header.image_length),
                        checksum = %format!("0x{:x}", header.image_checksum),
                        "Image header"
                    );
                }
                self.capture = HeaderCapture::Resolved(header);
            }
        }
        if self.header().is_some() {
            self.checksum = self.checksum.wrapping_add(payload_checksum(payload));
        }
        self.cursor += data.len() as u64;
    }

    /// Check the received length and checksum against the image header.
    pub fn verify(&self) -> Result<(), TransferError> {
        let Some(header) = self.header() else {
            return Ok(());
        };
        let expected = u64::from(header.image_length) + BL_HEADER_SIZE as u64;
        if self.cursor != expected {
            return Err(TransferError::Length {
                actual: self.cursor,
                expected,
            });
        }
        if self.checksum != header.image_checksum {
            return Err(ChecksumMismatch {
                computed: self.checksum,
                expected: header.image_checksum,
            }
            .into());
        }
        debug!(checksum = %format!("0x{:x}", self.checksum), "checksum OK");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_split_across_packets() {
        let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let image = ImageHeader::wrap(&payload);

        let mut transfer = Transfer::new();
        for chunk in image.chunks(100) {
            transfer.feed(chunk);
        }
        assert_eq!(transfer.cursor(), image.len() as u64);
        assert_eq!(transfer.header().unwrap().image_length, 300);
        assert_eq!(transfer.checksum(), payload_checksum(&payload));
        assert!(transfer.verify().is_ok());
    }

    #[test]
    fn test_verify_length_and_checksum() {
        let payload = vec![7u8; 64];
        let image = ImageHeader::wrap(&payload);

        let mut short = Transfer::new();
        short.feed(&image[..image.len() - 1]);
        assert_eq!(
            short.verify(),
            Err(TransferError::Length {
                actual: 319,
                expected: 320
            })
        );

        let mut corrupt = image.clone();
        corrupt[BL_HEADER_SIZE + 3] = 8;
        let mut bad = Transfer::new();
        bad.feed(&corrupt);
        assert!(matches!(bad.verify(), Err(TransferError::Checksum(_))));
    }

    #[test]
    fn test_plain_data_has_no_expectation() {
        let mut transfer = Transfer::new();
        transfer.feed(&[0u8; 200]);
        assert!(transfer.header().is_none());
        transfer.feed(&[1u8; 200]);
        assert!(transfer.header().is_none());
        assert_eq!(transfer.checksum(), 0);
        assert!(transfer.verify().is_ok());
    }

    #[test]
    fn test_resume_skips_header_check() {
        let mut transfer = Transfer::new();
        transfer.set_cursor(0x1000);
        transfer.feed(&ImageHeader::wrap(b"abc"));
        assert!(transfer.header().is_none());
        assert_eq!(transfer.cursor(), 0x1000 + 259);

        transfer.reset();
        assert_eq!(transfer.cursor(), 0);
    }
}
