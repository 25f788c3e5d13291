//! USB DFU control channel.
//!
//! The DFU gadget stack owns enumeration and the bulk transfers; this
//! engine is the set of callbacks it invokes. Partition alternate settings
//! go straight to the board's [`DfuMedium`](crate::backend::DfuMedium), the
//! flash layout setting lands in the session's RAM buffer, and the virtual
//! settings carry fixed-layout request/response buffers:
//!
//! ```text
//! command write (>= 5 bytes, offset 0):
//!   [phase:u8][address:u32 BE]
//! command read (>= 9 bytes):
//!   [phase:u8][destination:u32 LE][cursor:u32 LE][error text | layout flag]
//! ```
//!
//! OTP and PMIC settings share the same read/write contract and are
//! committed when the host flushes them.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::{debug, info, instrument, warn};

use crate::alt::{AltSetting, AltTarget};
use crate::backend::Board;
use crate::error::{ProgramError, Result};
use crate::events::{Channel, ProgramEvent, ProgramObserver};
use crate::nvm::NvmKind;
use crate::protocol::constants::*;
use crate::state::{Phase, ProgramSession};

/// Smallest command write: phase byte and address.
const CMD_WRITE_MIN_SIZE: usize = 5;

/// Where the data of an alternate setting goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Virtual(Phase),
    Layout,
    Medium,
}

fn route(session: &ProgramSession, alt_id: u8) -> Result<Route> {
    let alt = session
        .alt(alt_id)
        .ok_or(ProgramError::UnknownAlt(alt_id))?;
    Ok(match alt.target {
        AltTarget::Virtual { phase, .. } => Route::Virtual(phase),
        AltTarget::Layout { .. } => Route::Layout,
        AltTarget::Partition { .. } | AltTarget::Raw { .. } => Route::Medium,
    })
}

/// DFU callbacks over a board.
pub struct UsbEngine<B: Board, O: ProgramObserver> {
    board: B,
    observer: Arc<O>,
}

impl<B: Board, O: ProgramObserver> UsbEngine<B, O> {
    pub fn new(board: B, observer: Arc<O>) -> Self {
        Self { board, observer }
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn into_board(self) -> B {
        self.board
    }

    fn publish(&self, session: &mut ProgramSession, before: Phase) {
        for event in session.drain_events(before) {
            self.observer.on_event(&event);
        }
    }

    /// Alternate settings to enumerate.
    ///
    /// A layout received over USB is turned into the device model here, on
    /// the enumeration that follows it.
    #[instrument(skip_all, fields(phase = %session.phase()))]
    pub fn prepare_enumeration(&mut self, session: &mut ProgramSession) -> Vec<AltSetting> {
        let before = session.phase();
        if session.phase() == Phase::LAYOUT && !session.parts().is_empty() {
            if let Err(e) = session.init_devices(&mut self.board) {
                session.fail(&e);
            }
        }
        self.observer.on_event(&ProgramEvent::Connected {
            channel: Channel::Usb,
        });
        self.publish(session, before);
        info!(alts = session.alts().len(), "Enumerating");
        session.alts().to_vec()
    }

    /// Size reported for an alternate setting.
    pub fn medium_size(&self, session: &ProgramSession, alt_id: u8) -> Option<u64> {
        let alt = session.alt(alt_id)?;
        match alt.virtual_phase() {
            Some(phase) => session.virtual_size(phase).map(|size| size as u64),
            None => Some(alt.size()),
        }
    }

    /// Host to device block.
    pub fn download(
        &mut self,
        session: &mut ProgramSession,
        alt_id: u8,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let before = session.phase();
        let result = self.dispatch_download(session, alt_id, offset, data);
        if let Err(e) = &result {
            warn!(alt_id, offset, error = %e, "Download failed");
            match route(session, alt_id) {
                Ok(Route::Medium) => fail_current(session, alt_id, &e.to_string()),
                Ok(_) => session.fail(e),
                Err(_) => {}
            }
        }
        self.publish(session, before);
        result
    }

    fn dispatch_download(
        &mut self,
        session: &mut ProgramSession,
        alt_id: u8,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        match route(session, alt_id)? {
            Route::Virtual(phase) => self.write_virt(session, phase, offset, data),
            Route::Layout => {
                session.write_layout(offset, data)?;
                session.record_block(offset, data.len());
                Ok(data.len())
            }
            Route::Medium => {
                let alt = session
                    .alt(alt_id)
                    .ok_or(ProgramError::UnknownAlt(alt_id))?;
                self.board.medium_write(alt, offset, data)?;
                if session.current_alt_id() == Some(alt_id) {
                    session.record_block(offset, data.len());
                }
                Ok(data.len())
            }
        }
    }

    /// Device to host block.
    pub fn upload(
        &mut self,
        session: &mut ProgramSession,
        alt_id: u8,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let before = session.phase();
        let result = match route(session, alt_id)? {
            Route::Virtual(phase) => self.read_virt(session, phase, offset, buf),
            Route::Layout => Ok(session.read_layout(offset, buf)),
            Route::Medium => {
                let alt = session
                    .alt(alt_id)
                    .ok_or(ProgramError::UnknownAlt(alt_id))?;
                Ok(self.board.medium_read(alt, offset, buf)?)
            }
        };
        if let Err(e) = &result {
            warn!(alt_id, offset, error = %e, "Upload failed");
        }
        self.publish(session, before);
        result
    }

    /// Write to a virtual setting.
    pub fn write_virt(
        &mut self,
        session: &mut ProgramSession,
        phase: Phase,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        if phase == Phase::CMD {
            return self.write_command(session, offset, data);
        }
        let kind = NvmKind::from_phase(phase).ok_or(ProgramError::UnknownPhase(phase.wire()))?;
        session.nvm_write(&mut self.board, kind, offset, data)
    }

    fn write_command(
        &mut self,
        session: &mut ProgramSession,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        if data.len() < CMD_WRITE_MIN_SIZE {
            return Err(ProgramError::ShortRequest {
                len: data.len(),
                min: CMD_WRITE_MIN_SIZE,
            });
        }
        if offset != 0 {
            return Err(ProgramError::InvalidOffset(offset));
        }
        let phase = data[0];
        let address = BigEndian::read_u32(&data[1..5]);
        debug!(phase, address = %format!("0x{:08x}", address), "Command write");

        if u16::from(phase) == PHASE_RESET {
            session.execute(&mut self.board, address)?;
        } else {
            session.set_phase(phase, address)?;
        }
        Ok(data.len())
    }

    /// Read from a virtual setting.
    pub fn read_virt(
        &mut self,
        session: &mut ProgramSession,
        phase: Phase,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if phase == Phase::CMD {
            return read_command(session, offset, buf);
        }
        let kind = NvmKind::from_phase(phase).ok_or(ProgramError::UnknownPhase(phase.wire()))?;
        session.nvm_read(&mut self.board, kind, offset, buf)
    }

    /// End of a download on `alt_id`, `offset` being the total size.
    #[instrument(skip(self, session))]
    pub fn on_flush(&mut self, session: &mut ProgramSession, alt_id: u8, offset: u64) {
        let before = session.phase();
        match route(session, alt_id) {
            Ok(Route::Virtual(phase)) => {
                if let Some(kind) = NvmKind::from_phase(phase) {
                    if let Err(e) = session.nvm_start(&mut self.board, kind) {
                        session.fail(&e);
                    }
                }
            }
            Ok(Route::Layout) => {
                if session.phase() == Phase::LAYOUT {
                    if let Err(e) = session.end_phase(&mut self.board, offset) {
                        session.fail(&e);
                    }
                }
            }
            Ok(Route::Medium) => {
                if session.current_alt_id() == Some(alt_id) {
                    if let Err(e) = self.finish_partition(session, alt_id, offset) {
                        session.fail(&e);
                    }
                }
            }
            Err(e) => warn!(error = %e, "Flush on unknown alternate"),
        }
        self.publish(session, before);
    }

    fn finish_partition(
        &mut self,
        session: &mut ProgramSession,
        alt_id: u8,
        offset: u64,
    ) -> Result<()> {
        if let Some(alt) = session.alt(alt_id) {
            self.board.medium_flush(alt)?;
        }
        session.end_phase(&mut self.board, offset)?;
        session.advance();
        Ok(())
    }

    /// A download is starting on `alt_id`.
    ///
    /// For the current partition, returns the offset the transfer resumes at.
    pub fn on_initiated(&mut self, session: &mut ProgramSession, alt_id: u8) -> Option<u64> {
        if session.current_alt_id() != Some(alt_id) {
            return None;
        }
        session.restart_sequence();
        let cursor = session.cursor();
        debug!(alt_id, cursor, "Transfer initiated");
        Some(cursor)
    }

    /// The DFU layer reported an error on `alt_id`.
    pub fn on_error(&mut self, session: &mut ProgramSession, alt_id: u8, message: &str) {
        let before = session.phase();
        fail_current(session, alt_id, message);
        self.publish(session, before);
    }
}

/// Fail the session if `alt_id` is the partition being programmed.
fn fail_current(session: &mut ProgramSession, alt_id: u8, message: &str) {
    if session.current_alt_id() != Some(alt_id) {
        debug!(alt_id, message, "Error on inactive alternate");
        return;
    }
    session.fail(message);
}

/// Status reply of the command channel.
fn read_command(session: &mut ProgramSession, offset: u64, buf: &mut [u8]) -> Result<usize> {
    if buf.len() < PHASE_MIN_SIZE {
        return Err(ProgramError::ShortRequest {
            len: buf.len(),
            min: PHASE_MIN_SIZE,
        });
    }
    // one reply per request
    if offset != 0 {
        return Ok(0);
    }

    let phase = session.phase();
    buf[0] = phase.wire();
    LittleEndian::write_u32(&mut buf[1..5], session.destination());
    LittleEndian::write_u32(&mut buf[5..9], session.cursor() as u32);
    let mut len = PHASE_MIN_SIZE;

    if phase.is_reset() {
        let text = session.error_text().as_bytes();
        let n = text.len().min(buf.len() - len);
        buf[len..len + n].copy_from_slice(&text[..n]);
        len += n;
        session.request_reset();
    } else if phase == Phase::LAYOUT && buf.len() > len {
        buf[len] = u8::from(!session.parts().is_empty());
        len += 1;
    }
    Ok(len)
}
