//! OTP and PMIC image buffering.
//!
//! Both regions are transferred as a whole image: byte-range writes fill a
//! session-owned buffer, reads serve a snapshot fetched at offset 0, and the
//! image is committed to the backend in one go on start (serial) or flush
//! (USB).

use thiserror::Error;
use tracing::debug;

use crate::backend::{BackendError, NvmBackend};
use crate::state::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmKind {
    Otp,
    Pmic,
}

impl NvmKind {
    pub fn phase(self) -> Phase {
        match self {
            NvmKind::Otp => Phase::OTP,
            NvmKind::Pmic => Phase::PMIC,
        }
    }

    pub fn from_phase(phase: Phase) -> Option<Self> {
        match phase {
            Phase::OTP => Some(NvmKind::Otp),
            Phase::PMIC => Some(NvmKind::Pmic),
            _ => None,
        }
    }
}

impl std::fmt::Display for NvmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NvmKind::Otp => write!(f, "OTP"),
            NvmKind::Pmic => write!(f, "PMIC"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NvmError {
    #[error("{0} update not supported")]
    Unsupported(NvmKind),
    #[error("start {0} without data")]
    NoData(NvmKind),
    #[error("{kind} offset 0x{offset:x} beyond size 0x{size:x}")]
    OutOfRange {
        kind: NvmKind,
        offset: u64,
        size: usize,
    },
    #[error("{kind} access issue: {source}")]
    Backend {
        kind: NvmKind,
        source: BackendError,
    },
}

/// Session-side image of one NVM region.
#[derive(Debug, Clone)]
pub struct NvmRegion {
    kind: NvmKind,
    image: Option<Vec<u8>>,
}

impl NvmRegion {
    pub fn new(kind: NvmKind) -> Self {
        Self { kind, image: None }
    }

    pub fn kind(&self) -> NvmKind {
        self.kind
    }

    pub fn image(&self) -> Option<&[u8]> {
        self.image.as_deref()
    }

    fn check_offset(&self, offset: u64, size: usize) -> Result<usize, NvmError> {
        usize::try_from(offset)
            .ok()
            .filter(|&o| o <= size)
            .ok_or(NvmError::OutOfRange {
                kind: self.kind,
                offset,
                size,
            })
    }

    /// Store `data` at `offset`, clamped to the region; offset 0 clears the image.
    pub fn write(
        &mut self,
        backend: &mut dyn NvmBackend,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, NvmError> {
        let size = backend.size();
        let offset = self.check_offset(offset, size)?;
        let image = self.image.get_or_insert_with(|| vec![0; size]);
        if image.len() != size {
            image.resize(size, 0);
        }
        if offset == 0 {
            image.fill(0);
        }
        let len = data.len().min(size - offset);
        image[offset..offset + len].copy_from_slice(&data[..len]);
        debug!(kind = %self.kind, offset, len, "NVM write");
        Ok(len)
    }

    /// Copy image bytes into `buf`; offset 0 fetches a fresh image first.
    pub fn read(
        &mut self,
        backend: &mut dyn NvmBackend,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, NvmError> {
        let size = backend.size();
        if offset == 0 {
            let mut image = vec![0; size];
            backend
                .read_all(&mut image)
                .map_err(|source| NvmError::Backend {
                    kind: self.kind,
                    source,
                })?;
            self.image = Some(image);
        }
        let offset = self.check_offset(offset, size)?;
        let image = self.image.as_ref().ok_or(NvmError::NoData(self.kind))?;
        let len = buf.len().min(image.len().saturating_sub(offset));
        buf[..len].copy_from_slice(&image[offset..offset + len]);
        debug!(kind = %self.kind, offset, len, "NVM read");
        Ok(len)
    }

    /// Commit the image to the backend.
    pub fn start(&mut self, backend: &mut dyn NvmBackend) -> Result<(), NvmError> {
        let image = match self.kind {
            // the OTP image is consumed by the commit
            NvmKind::Otp => self.image.take().ok_or(NvmError::NoData(self.kind))?,
            NvmKind::Pmic => self
                .image
                .clone()
                .unwrap_or_else(|| vec![0; backend.size()]),
        };
        backend
            .write_all(&image)
            .map_err(|source| NvmError::Backend {
                kind: self.kind,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryNvm;

    #[test]
    fn test_write_clears_and_clamps() {
        let mut backend = MemoryNvm::new(8);
        let mut region = NvmRegion::new(NvmKind::Pmic);
        assert_eq!(region.write(&mut backend, 0, &[1, 2, 3]).unwrap(), 3);
        assert_eq!(region.write(&mut backend, 6, &[7, 8, 9, 10]).unwrap(), 2);
        assert_eq!(region.image().unwrap(), &[1, 2, 3, 0, 0, 0, 7, 8]);

        // a new transfer starts from a blank image
        region.write(&mut backend, 0, &[5]).unwrap();
        assert_eq!(region.image().unwrap(), &[5, 0, 0, 0, 0, 0, 0, 0]);

        assert!(matches!(
            region.write(&mut backend, 9, &[1]),
            Err(NvmError::OutOfRange { offset: 9, .. })
        ));
    }

    #[test]
    fn test_read_fetches_on_first_packet() {
        let mut backend = MemoryNvm::with_data((0..16).collect());
        let mut region = NvmRegion::new(NvmKind::Otp);
        let mut buf = [0u8; 4];

        assert_eq!(region.read(&mut backend, 4, &mut buf), Err(NvmError::NoData(NvmKind::Otp)));
        assert_eq!(region.read(&mut backend, 0, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0, 1, 2, 3]);
        assert_eq!(region.read(&mut backend, 14, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[14, 15]);
    }

    #[test]
    fn test_start_commits_image() {
        let mut backend = MemoryNvm::new(4);
        let mut otp = NvmRegion::new(NvmKind::Otp);
        assert_eq!(otp.start(&mut backend), Err(NvmError::NoData(NvmKind::Otp)));

        otp.write(&mut backend, 0, &[0xAA, 0xBB]).unwrap();
        otp.start(&mut backend).unwrap();
        assert_eq!(backend.data(), &[0xAA, 0xBB, 0, 0]);
        assert_eq!(backend.writes(), 1);
        // consumed
        assert_eq!(otp.start(&mut backend), Err(NvmError::NoData(NvmKind::Otp)));

        let mut pmic = NvmRegion::new(NvmKind::Pmic);
        pmic.start(&mut backend).unwrap();
        assert_eq!(backend.data(), &[0, 0, 0, 0]);
    }
}
