//! STM32 image header (v1) detection and payload checksum.
//!
//! The header is an optional 256-byte envelope in front of any transferred
//! image. When present it declares the payload length and a 32-bit additive
//! checksum of the payload bytes.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

/// `'S' 'T' 'M' 0x32` read as a little-endian word.
pub const HEADER_MAGIC: u32 = u32::from_le_bytes([b'S', b'T', b'M', 0x32]);
/// Header format 1.0.
pub const HEADER_VERSION_V1: u32 = 0x0001_0000;
/// Envelope size, added to every transfer in front of the payload.
pub const BL_HEADER_SIZE: usize = 256;

const PADDING_LEN: usize = 83;

/// Reasons a buffer does not start with a usable envelope.
///
/// None of these are fatal: callers fall back to treating the data as raw.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Invalid magic: 0x{actual:08X}")]
    InvalidMagic { actual: u32 },
    #[error("Unsupported header version: 0x{actual:08X}")]
    UnsupportedVersion { actual: u32 },
    #[error("Reserved field is not zero")]
    ReservedNotZero,
    #[error("Padding is not zero")]
    PaddingNotZero,
}

/// Decoded v1 image header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: u32,
    pub signature: [u8; 64],
    pub image_checksum: u32,
    pub header_version: u32,
    pub image_length: u32,
    pub image_entry_point: u32,
    pub reserved1: u32,
    pub load_address: u32,
    pub reserved2: u32,
    pub version_number: u32,
    pub option_flags: u32,
    pub ecdsa_algorithm: u32,
    pub ecdsa_public_key: [u8; 64],
    pub padding: [u8; PADDING_LEN],
    pub binary_type: u8,
}

impl ImageHeader {
    pub const SIZE: usize = BL_HEADER_SIZE;

    /// Header describing `payload`, with its checksum already computed.
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            magic: HEADER_MAGIC,
            signature: [0; 64],
            image_checksum: payload_checksum(payload),
            header_version: HEADER_VERSION_V1,
            image_length: payload.len() as u32,
            image_entry_point: 0,
            reserved1: 0,
            load_address: 0,
            reserved2: 0,
            version_number: 0,
            option_flags: 0,
            ecdsa_algorithm: 0,
            ecdsa_public_key: [0; 64],
            padding: [0; PADDING_LEN],
            binary_type: 0,
        }
    }

    /// Decode and validate an envelope at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < Self::SIZE {
            return Err(HeaderError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let header = Self::decode(&data[..Self::SIZE]).map_err(|_| HeaderError::BufferTooSmall {
            expected: Self::SIZE,
            actual: data.len(),
        })?;

        if header.magic != HEADER_MAGIC {
            return Err(HeaderError::InvalidMagic {
                actual: header.magic,
            });
        }
        if header.header_version != HEADER_VERSION_V1 {
            return Err(HeaderError::UnsupportedVersion {
                actual: header.header_version,
            });
        }
        if header.reserved1 != 0 || header.reserved2 != 0 {
            return Err(HeaderError::ReservedNotZero);
        }
        if header.padding.iter().any(|&b| b != 0) {
            return Err(HeaderError::PaddingNotZero);
        }
        Ok(header)
    }

    /// Envelope at the start of `data`, if any.
    pub fn detect(data: &[u8]) -> Option<Self> {
        match Self::parse(data) {
            Ok(header) => Some(header),
            Err(e) => {
                tracing::debug!(reason = %e, "No image header");
                None
            }
        }
    }

    fn decode(data: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u32::<LittleEndian>()?;
        let mut signature = [0u8; 64];
        cursor.read_exact(&mut signature)?;
        let image_checksum = cursor.read_u32::<LittleEndian>()?;
        let header_version = cursor.read_u32::<LittleEndian>()?;
        let image_length = cursor.read_u32::<LittleEndian>()?;
        let image_entry_point = cursor.read_u32::<LittleEndian>()?;
        let reserved1 = cursor.read_u32::<LittleEndian>()?;
        let load_address = cursor.read_u32::<LittleEndian>()?;
        let reserved2 = cursor.read_u32::<LittleEndian>()?;
        let version_number = cursor.read_u32::<LittleEndian>()?;
        let option_flags = cursor.read_u32::<LittleEndian>()?;
        let ecdsa_algorithm = cursor.read_u32::<LittleEndian>()?;
        let mut ecdsa_public_key = [0u8; 64];
        cursor.read_exact(&mut ecdsa_public_key)?;
        let mut padding = [0u8; PADDING_LEN];
        cursor.read_exact(&mut padding)?;
        let binary_type = cursor.read_u8()?;

        Ok(Self {
            magic,
            signature,
            image_checksum,
            header_version,
            image_length,
            image_entry_point,
            reserved1,
            load_address,
            reserved2,
            version_number,
            option_flags,
            ecdsa_algorithm,
            ecdsa_public_key,
            padding,
            binary_type,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        buf[4..68].copy_from_slice(&self.signature);
        LittleEndian::write_u32_into(
            &[
                self.image_checksum,
                self.header_version,
                self.image_length,
                self.image_entry_point,
                self.reserved1,
                self.load_address,
                self.reserved2,
                self.version_number,
                self.option_flags,
                self.ecdsa_algorithm,
            ],
            &mut buf[68..108],
        );
        buf[108..172].copy_from_slice(&self.ecdsa_public_key);
        buf[172..255].copy_from_slice(&self.padding);
        buf[255] = self.binary_type;
        buf
    }

    /// Envelope followed by the payload it describes.
    pub fn wrap(payload: &[u8]) -> Vec<u8> {
        let mut image = Self::for_payload(payload).to_bytes();
        image.extend_from_slice(payload);
        image
    }

    /// Check `payload` against the declared length and checksum.
    ///
    /// Only the first `image_length` bytes take part in the sum.
    pub fn verify_payload(&self, payload: &[u8]) -> Result<(), ChecksumMismatch> {
        let len = (self.image_length as usize).min(payload.len());
        let computed = payload_checksum(&payload[..len]);
        if len != self.image_length as usize || computed != self.image_checksum {
            return Err(ChecksumMismatch {
                computed,
                expected: self.image_checksum,
            });
        }
        Ok(())
    }
}

/// Payload checksum disagreeing with the header.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid checksum : 0x{computed:x} expected 0x{expected:x}")]
pub struct ChecksumMismatch {
    pub computed: u32,
    pub expected: u32,
}

/// Wrapping 32-bit sum of every byte.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |sum, &b| sum.wrapping_add(u32::from(b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let payload = vec![0xA5u8; 1000];
        let image = ImageHeader::wrap(&payload);
        assert_eq!(image.len(), BL_HEADER_SIZE + payload.len());

        let header = ImageHeader::parse(&image).unwrap();
        assert_eq!(header.image_length, 1000);
        assert_eq!(header.image_checksum, 0xA5 * 1000);
        assert!(header.verify_payload(&image[BL_HEADER_SIZE..]).is_ok());
    }

    #[test]
    fn test_magic_bytes() {
        let bytes = ImageHeader::for_payload(b"x").to_bytes();
        assert_eq!(&bytes[..4], &[b'S', b'T', b'M', 0x32]);
        assert_eq!(&bytes[72..76], &[0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_encode_field_layout() {
        let mut header = ImageHeader::for_payload(b"abc");
        header.image_entry_point = 0x2FFC_2500;
        header.load_address = 0x2FFC_2400;
        header.option_flags = 1;
        header.ecdsa_public_key = [0x11; 64];
        header.binary_type = 0x10;
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), BL_HEADER_SIZE);
        assert_eq!(&bytes[88..92], &0x2FFC_2400u32.to_le_bytes());
        assert_eq!(bytes[108], 0x11);
        assert_eq!(bytes[255], 0x10);
        assert_eq!(ImageHeader::parse(&bytes), Ok(header));
    }

    #[test]
    fn test_rejects_bad_fields() {
        let good = ImageHeader::for_payload(b"abc").to_bytes();

        let mut bad = good.clone();
        bad[0] = b'X';
        assert!(matches!(
            ImageHeader::parse(&bad),
            Err(HeaderError::InvalidMagic { .. })
        ));

        let mut bad = good.clone();
        bad[74] = 0x02;
        assert!(matches!(
            ImageHeader::parse(&bad),
            Err(HeaderError::UnsupportedVersion { actual: 0x0002_0000 })
        ));

        let mut bad = good.clone();
        bad[84] = 1; // reserved1
        assert_eq!(ImageHeader::parse(&bad), Err(HeaderError::ReservedNotZero));

        let mut bad = good.clone();
        bad[200] = 1; // padding
        assert_eq!(ImageHeader::parse(&bad), Err(HeaderError::PaddingNotZero));

        assert!(matches!(
            ImageHeader::parse(&good[..100]),
            Err(HeaderError::BufferTooSmall { actual: 100, .. })
        ));
    }

    #[test]
    fn test_checksum_wraps() {
        let payload = vec![0xFFu8; 0x0101_0102];
        let sum = payload_checksum(&payload);
        assert_eq!(sum, 0xFFu32.wrapping_mul(0x0101_0102));
    }

    #[test]
    fn test_verify_detects_mismatch() {
        let header = ImageHeader::for_payload(b"hello");
        assert!(header.verify_payload(b"hellp").is_err());
        assert!(header.verify_payload(b"hell").is_err());
    }
}
