//! Programming session: phase state machine and partition model.
//!
//! One `ProgramSession` lives for the whole programming run and is passed by
//! reference into the serial or USB engine. It owns the parsed partitions,
//! the device model, the alternate settings and the transfer state of the
//! current phase. Fallible operations return [`ProgramError`]; the engines
//! decide when an error ends the session through [`ProgramSession::fail`].

use std::fmt;

use tracing::{debug, error, info, instrument, warn};

use super::phase::Phase;
use super::transfer::Transfer;
use crate::alt::{AltConfig, AltSetting, AltTarget, build_alt_settings};
use crate::backend::{Board, NvmBackend};
use crate::config::SessionConfig;
use crate::device::{Device, ModelError, build_devices, delete_partition};
use crate::error::ProgramError;
use crate::events::ProgramEvent;
use crate::gpt::commit_partition_tables;
use crate::layout::{PartitionDescriptor, parse_flash_layout};
use crate::nvm::{NvmError, NvmKind, NvmRegion};
use crate::protocol::constants::*;

/// Longest error text reported to the host.
pub const ERROR_TEXT_MAX: usize = 255;

const UNSPECIFIED_ERROR: &str = "Unspecified";

fn nvm_backend<B: Board + ?Sized>(
    board: &mut B,
    kind: NvmKind,
) -> Result<&mut dyn NvmBackend, NvmError> {
    let backend = match kind {
        NvmKind::Otp => board.otp(),
        NvmKind::Pmic => board.pmic(),
    };
    backend.ok_or(NvmError::Unsupported(kind))
}

/// State of one programming session.
#[derive(Debug)]
pub struct ProgramSession {
    config: SessionConfig,
    alt_config: AltConfig,
    phase: Phase,
    /// Arena index of the partition being programmed.
    cur_part: Option<usize>,
    transfer: Transfer,
    /// Last accepted serial packet sequence number.
    packet_number: u32,
    /// Packets written to the medium in the current phase.
    dfu_seq: u32,
    error: Option<String>,
    /// RAM image of the received flash layout.
    layout: Vec<u8>,
    parts: Vec<PartitionDescriptor>,
    devices: Vec<Device>,
    alts: Vec<AltSetting>,
    otp: NvmRegion,
    pmic: NvmRegion,
    events: Vec<ProgramEvent>,
}

impl ProgramSession {
    /// Session waiting for a flash layout.
    pub fn new<B: Board + ?Sized>(config: SessionConfig, board: &mut B) -> Self {
        let alt_config = AltConfig {
            load_address: config.load_address,
            layout_size: config.layout_max_size,
            otp_size: board.otp_size(),
            pmic: board.has_pmic(),
        };
        let alts = build_alt_settings(&mut [], &[], &alt_config).unwrap_or_default();
        Self {
            config,
            alt_config,
            phase: Phase::LAYOUT,
            cur_part: None,
            transfer: Transfer::new(),
            packet_number: 0,
            dfu_seq: 0,
            error: None,
            layout: Vec::new(),
            parts: Vec::new(),
            devices: Vec::new(),
            alts,
            otp: NvmRegion::new(NvmKind::Otp),
            pmic: NvmRegion::new(NvmKind::Pmic),
            events: Vec::new(),
        }
    }

    /// Session started with a layout already loaded in RAM.
    ///
    /// A layout that does not parse is returned as an error; a layout that
    /// does not fit the devices leaves the session in phase `Reset`.
    pub fn with_layout<B: Board + ?Sized>(
        config: SessionConfig,
        board: &mut B,
        layout: &[u8],
    ) -> Result<Self, ProgramError> {
        let mut session = Self::new(config, board);
        session.write_layout(0, layout)?;
        session.complete_layout(layout.len() as u64)?;
        if let Err(e) = session.init_devices(board) {
            session.fail(&e);
        }
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn parts(&self) -> &[PartitionDescriptor] {
        &self.parts
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn alts(&self) -> &[AltSetting] {
        &self.alts
    }

    pub fn alt(&self, alt_id: u8) -> Option<&AltSetting> {
        self.alts.get(usize::from(alt_id))
    }

    pub fn current_partition(&self) -> Option<&PartitionDescriptor> {
        self.cur_part.and_then(|i| self.parts.get(i))
    }

    pub(crate) fn current_alt_id(&self) -> Option<u8> {
        self.current_partition().and_then(|part| part.alt_id)
    }

    pub fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    pub fn cursor(&self) -> u64 {
        self.transfer.cursor()
    }

    pub fn packet_number(&self) -> u32 {
        self.packet_number
    }

    pub fn dfu_seq(&self) -> u32 {
        self.dfu_seq
    }

    pub fn layout_data(&self) -> &[u8] {
        &self.layout
    }

    /// Recorded error, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Error text reported to the host.
    pub fn error_text(&self) -> &str {
        self.error.as_deref().unwrap_or(UNSPECIFIED_ERROR)
    }

    /// Address reported with the phase: the layout load address in `Layout`.
    pub fn destination(&self) -> u32 {
        if self.phase == Phase::LAYOUT {
            self.config.load_address
        } else {
            DEFAULT_ADDRESS
        }
    }

    fn set_phase_state(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = %self.phase, to = %phase, "Phase transition");
        }
        self.phase = phase;
    }

    /// Events produced since the last call, including the transitions away from `before`.
    pub fn drain_events(&mut self, before: Phase) -> Vec<ProgramEvent> {
        let mut events = std::mem::take(&mut self.events);
        let after = self.phase;
        if before == after {
            return events;
        }
        events.push(ProgramEvent::PhaseChanged {
            from: before,
            to: after,
        });
        if before == Phase::LAYOUT && !after.is_reset() {
            events.push(ProgramEvent::LayoutReady {
                partitions: self.parts.len(),
                devices: self.devices.len(),
            });
        }
        match after {
            Phase::END => events.push(ProgramEvent::Complete),
            Phase::RESET => events.push(ProgramEvent::Error {
                message: self.error_text().to_string(),
            }),
            Phase::DO_RESET => events.push(ProgramEvent::ResetRequested),
            _ => {}
        }
        events
    }

    /// Record `err` and stop the session in phase `Reset`.
    ///
    /// Only the first error is kept; the host reads it with get-phase.
    pub fn fail(&mut self, err: impl fmt::Display) {
        let message = err.to_string();
        if self.phase.is_reset() {
            debug!(error = %message, "Error ignored in reset phase");
            return;
        }
        error!("Error: {}", message);
        if self.error.is_none() {
            let mut text = message;
            if text.len() > ERROR_TEXT_MAX {
                let mut end = ERROR_TEXT_MAX;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                text.truncate(end);
            }
            self.error = Some(text);
        }
        self.set_phase_state(Phase::RESET);
    }

    /// Move from `Reset` to `DoReset`, telling the transport loop to stop.
    pub fn request_reset(&mut self) -> bool {
        if self.phase != Phase::RESET {
            return false;
        }
        info!("Reset requested");
        self.set_phase_state(Phase::DO_RESET);
        true
    }

    /// Select the next selected and not empty partition, or `End`.
    pub fn advance(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        let from = self.phase;
        self.dfu_seq = 0;
        self.cur_part = None;
        self.transfer.reset();

        let next = self
            .parts
            .iter()
            .enumerate()
            .filter(|(_, part)| {
                let id = u16::from(part.id);
                id > from.id() && id <= PHASE_LAST_USER && part.option.is_programmed()
            })
            .min_by_key(|(_, part)| part.id)
            .map(|(index, part)| (index, part.phase()));

        match next {
            Some((index, phase)) => {
                self.cur_part = Some(index);
                self.set_phase_state(phase);
                info!(phase = %phase, part = %self.parts[index], "Next partition");
            }
            None => {
                self.set_phase_state(Phase::END);
                info!("Phase=END");
            }
        }
    }

    /// Jump to a control phase requested by the host.
    pub fn force_phase(&mut self, phase: Phase) {
        self.cur_part = None;
        self.dfu_seq = 0;
        self.transfer.reset();
        self.set_phase_state(phase);
    }

    /// Make partition `id` current and resume its transfer at `offset`.
    pub fn set_phase(&mut self, id: u8, offset: u32) -> Result<(), ProgramError> {
        if u16::from(id) == self.phase.id() {
            self.transfer.set_cursor(u64::from(offset));
            self.dfu_seq = 0;
            return Ok(());
        }
        let index = self
            .parts
            .iter()
            .position(|part| part.id == id)
            .ok_or(ProgramError::UnknownPhase(id))?;
        self.cur_part = Some(index);
        self.set_phase_state(Phase::user(id));
        self.transfer.set_cursor(u64::from(offset));
        self.dfu_seq = 0;
        debug!(phase = %self.phase, offset = %format!("0x{:x}", offset), "Phase selected");
        Ok(())
    }

    pub(crate) fn restart_sequence(&mut self) {
        self.dfu_seq = 0;
    }

    /// Account for a DFU block of `len` bytes written at `offset`.
    pub(crate) fn record_block(&mut self, offset: u64, len: usize) {
        let end = offset + len as u64;
        if end > self.transfer.cursor() {
            self.transfer.set_cursor(end);
        }
        self.dfu_seq += 1;
    }

    /// Check the sequence number of an incoming serial packet.
    ///
    /// Sequence 0 starts a new transfer. Returns `false` for an unexpected
    /// number, in which case the counter is left as it was.
    pub fn begin_packet(&mut self, packet: u32) -> bool {
        if packet == 0 {
            self.packet_number = 0;
            self.transfer.reset();
        } else {
            self.packet_number = self.packet_number.wrapping_add(1);
        }
        if packet != self.packet_number {
            debug!(packet, expected = self.packet_number, "Unexpected packet number");
            self.reject_packet();
            return false;
        }
        true
    }

    /// Roll the sequence counter back so the host can resend the packet.
    pub fn reject_packet(&mut self) {
        self.packet_number = self.packet_number.wrapping_sub(1);
    }

    /// Alternate setting receiving the data of the current phase.
    pub fn current_alt(&self) -> Option<&AltSetting> {
        if self.phase == Phase::LAYOUT {
            return self
                .alts
                .first()
                .filter(|alt| matches!(alt.target, AltTarget::Layout { .. }));
        }
        self.current_alt_id().and_then(|alt_id| self.alt(alt_id))
    }

    /// Store layout bytes in the RAM buffer.
    pub fn write_layout(&mut self, offset: u64, data: &[u8]) -> Result<(), ProgramError> {
        let end = offset + data.len() as u64;
        if end > self.config.layout_max_size as u64 {
            return Err(ProgramError::LayoutOverflow {
                offset: end,
                max: self.config.layout_max_size,
            });
        }
        let (start, end) = (offset as usize, end as usize);
        if self.layout.len() < end {
            self.layout.resize(end, 0);
        }
        self.layout[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Copy layout bytes out of the RAM buffer.
    pub fn read_layout(&self, offset: u64, buf: &mut [u8]) -> usize {
        let start = (offset as usize).min(self.layout.len());
        let len = buf.len().min(self.layout.len() - start);
        buf[..len].copy_from_slice(&self.layout[start..start + len]);
        len
    }

    /// Append a serial packet to the current phase at the cursor.
    pub fn write_data<B: Board + ?Sized>(
        &mut self,
        board: &mut B,
        data: &[u8],
    ) -> Result<(), ProgramError> {
        let offset = self.transfer.cursor();
        if self.phase == Phase::LAYOUT {
            self.write_layout(offset, data)?;
        } else {
            let alt = self
                .current_alt()
                .ok_or(ProgramError::NoPartition(self.phase))?;
            board.medium_write(alt, offset, data)?;
        }
        self.transfer.feed(data);
        self.dfu_seq += 1;
        Ok(())
    }

    /// Parse the received layout.
    #[instrument(level = "debug", skip(self))]
    pub fn complete_layout(&mut self, size: u64) -> Result<(), ProgramError> {
        info!(size, "FlashLayout received");
        self.parts.clear();
        self.devices.clear();
        self.cur_part = None;
        let size = (size as usize).min(self.layout.len());
        self.parts = parse_flash_layout(&self.layout[..size])?;
        Ok(())
    }

    /// Phase specific end of transfer: parse the layout, or activate a boot partition.
    pub fn end_phase<B: Board + ?Sized>(
        &mut self,
        board: &mut B,
        offset: u64,
    ) -> Result<(), ProgramError> {
        if self.phase == Phase::LAYOUT {
            return self.complete_layout(offset);
        }
        let Some(index) = self.cur_part else {
            return Ok(());
        };
        let part = &self.parts[index];
        if let Some(hw) = part.hw_partition() {
            info!(part = %part, target = %part.target, boot = hw.index(), "Selecting boot partition");
            board.select_boot_partition(part.target, hw)?;
        }
        self.events.push(ProgramEvent::PartitionDone {
            id: part.id,
            name: part.name.clone(),
            size: offset,
        });
        Ok(())
    }

    /// Build the device model from the parsed layout, then select the first phase.
    ///
    /// On error the partitions are dropped, so only the layout channel stays
    /// exposed; the caller decides whether the error ends the session.
    #[instrument(level = "debug", skip_all, fields(parts = self.parts.len()))]
    pub fn init_devices<B: Board + ?Sized>(&mut self, board: &mut B) -> Result<(), ProgramError> {
        let result = if self.parts.is_empty() {
            Ok(())
        } else {
            self.build_model(board).map_err(ProgramError::from)
        };
        if result.is_err() {
            self.parts.clear();
            self.devices.clear();
            self.cur_part = None;
        }
        if !self.parts.is_empty() {
            self.advance();
        }
        let rebuilt = self.rebuild_alts();
        result.and(rebuilt)
    }

    fn build_model<B: Board + ?Sized>(&mut self, board: &mut B) -> Result<(), ModelError> {
        let devices = build_devices(&mut self.parts, board)?;

        // raw images are erased before the partition table is written
        for part in self
            .parts
            .iter()
            .filter(|p| p.option.is_select() && p.option.is_delete() && p.is_raw_image())
        {
            delete_partition(part, board)?;
        }
        commit_partition_tables(&devices, &self.parts, board)?;
        for part in self
            .parts
            .iter()
            .filter(|p| p.option.is_select() && p.option.is_delete() && !p.is_raw_image())
        {
            delete_partition(part, board)?;
        }

        info!(
            partitions = self.parts.len(),
            devices = devices.len(),
            "Devices initialized"
        );
        self.devices = devices;
        Ok(())
    }

    /// Recompute the alternate settings from the partition model.
    pub fn rebuild_alts(&mut self) -> Result<(), ProgramError> {
        self.alts = build_alt_settings(&mut self.parts, &self.devices, &self.alt_config)?;
        Ok(())
    }

    /// Serial `start`: control phase, end of transfer, or jump to an image.
    #[instrument(level = "debug", skip(self, board), fields(phase = %self.phase))]
    pub fn start<B: Board + ?Sized>(
        &mut self,
        board: &mut B,
        address: u32,
    ) -> Result<(), ProgramError> {
        if address < 0x100 {
            let requested = Phase::new(address as u16);
            match requested {
                Phase::OTP => return self.nvm_start(board, NvmKind::Otp),
                Phase::PMIC => return self.nvm_start(board, NvmKind::Pmic),
                Phase::RESET | Phase::END => {
                    self.force_phase(requested);
                    return Ok(());
                }
                _ if requested != self.phase => {
                    return Err(ProgramError::InvalidPhase {
                        requested: address as u8,
                        current: self.phase,
                    });
                }
                _ => {}
            }
        }

        if address == DEFAULT_ADDRESS || address == u32::from(self.phase.id()) {
            if self.phase.is_terminal() {
                self.force_phase(Phase::DO_RESET);
                return Ok(());
            }
            return self.complete_transfer(board);
        }
        self.execute(board, address)
    }

    /// Close the transfer of the current phase and move on.
    pub fn complete_transfer<B: Board + ?Sized>(
        &mut self,
        board: &mut B,
    ) -> Result<(), ProgramError> {
        let alt = self
            .current_alt()
            .ok_or(ProgramError::NoPartition(self.phase))?;
        board.medium_flush(alt)?;

        let length = self.transfer.cursor();
        info!(length = %format!("0x{:x}", length), "received length");
        self.transfer.verify()?;

        self.end_phase(board, length)?;
        if self.phase == Phase::LAYOUT {
            self.init_devices(board)
        } else {
            self.advance();
            Ok(())
        }
    }

    /// Jump to `address`. Coming back is an error.
    pub fn execute<B: Board + ?Sized>(
        &mut self,
        board: &mut B,
        address: u32,
    ) -> Result<(), ProgramError> {
        info!("## Starting application at 0x{:08x} ...", address);
        board.execute(address)?;
        warn!("## Application terminated");
        Err(ProgramError::ExecuteReturned { address })
    }

    fn region(&mut self, kind: NvmKind) -> &mut NvmRegion {
        match kind {
            NvmKind::Otp => &mut self.otp,
            NvmKind::Pmic => &mut self.pmic,
        }
    }

    /// Store NVM image bytes at `offset`.
    pub fn nvm_write<B: Board + ?Sized>(
        &mut self,
        board: &mut B,
        kind: NvmKind,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, ProgramError> {
        let backend = nvm_backend(board, kind)?;
        Ok(self.region(kind).write(backend, offset, data)?)
    }

    /// Store a serial packet of NVM image at the cursor.
    pub fn write_nvm_packet<B: Board + ?Sized>(
        &mut self,
        board: &mut B,
        kind: NvmKind,
        data: &[u8],
    ) -> Result<(), ProgramError> {
        let offset = self.transfer.cursor();
        self.nvm_write(board, kind, offset, data)?;
        self.transfer.skip(data.len());
        Ok(())
    }

    pub fn nvm_read<B: Board + ?Sized>(
        &mut self,
        board: &mut B,
        kind: NvmKind,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, ProgramError> {
        let backend = nvm_backend(board, kind)?;
        Ok(self.region(kind).read(backend, offset, buf)?)
    }

    /// Commit the buffered NVM image.
    pub fn nvm_start<B: Board + ?Sized>(
        &mut self,
        board: &mut B,
        kind: NvmKind,
    ) -> Result<(), ProgramError> {
        let backend = nvm_backend(board, kind)?;
        self.region(kind).start(backend)?;
        info!(kind = %kind, "NVM updated");
        self.events.push(ProgramEvent::NvmCommitted { phase: kind.phase() });
        Ok(())
    }

    /// Read back partition `id` through its alternate setting.
    pub fn read_partition<B: Board + ?Sized>(
        &mut self,
        board: &mut B,
        id: u8,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, ProgramError> {
        let alt = self
            .parts
            .iter()
            .find(|part| part.id == id)
            .and_then(|part| part.alt_id)
            .and_then(|alt_id| self.alt(alt_id))
            .ok_or(ProgramError::UnknownPartition(id))?;
        Ok(board.medium_read(alt, offset, buf)?)
    }

    /// Virtual channel size for the DFU layer.
    pub fn virtual_size(&self, phase: Phase) -> Option<usize> {
        match phase {
            Phase::CMD => Some(CMD_SIZE),
            Phase::OTP => self.alt_config.otp_size,
            Phase::PMIC => self.alt_config.pmic.then_some(PMIC_SIZE),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BlockGeometry, MemoryBoard, MemoryNvm};
    use crate::layout::{HwPartition, Target};
    use crate::protocol::header::ImageHeader;

    const LAYOUT: &str = "#Opt\tId\tName\tType\tIP\tOffset\n\
        P\t0x01\tfsbl1\tBinary\tmmc1\tboot1\n\
        P\t0x03\tssbl\tBinary\tmmc1\t0x00080000\n\
        PE\t0x04\tenv\tBinary\tmmc1\t0x00100000\n\
        -\t0x05\tspare\tBinary\tnone\t0x0\n\
        P\t0x10\trootfs\tFileSystem\tmmc1\t0x00200000\n";

    fn board() -> MemoryBoard {
        let mut board = MemoryBoard::new();
        board.add_mmc(
            1,
            BlockGeometry {
                block_size: 512,
                blocks: 0x10_0000,
                erase_group_blocks: 1024,
                boot_size: 0x40_0000,
            },
        );
        board.set_otp(MemoryNvm::new(OTP_SIZE_SMC));
        board.set_pmic(MemoryNvm::new(PMIC_SIZE));
        board
    }

    fn session(board: &mut MemoryBoard) -> ProgramSession {
        let mut session = ProgramSession::new(SessionConfig::default(), board);
        session.write_layout(0, LAYOUT.as_bytes()).unwrap();
        session.complete_layout(LAYOUT.len() as u64).unwrap();
        session
    }

    #[test]
    fn test_initial_state() {
        let mut b = board();
        let session = ProgramSession::new(SessionConfig::default(), &mut b);
        assert_eq!(session.phase(), Phase::LAYOUT);
        assert_eq!(session.destination(), 0xC000_0000);
        assert_eq!(session.error_text(), "Unspecified");
        assert_eq!(session.alts().len(), 4);
        assert!(session.current_alt().is_some());
    }

    #[test]
    fn test_advance_skips_unselected_and_empty() {
        let mut b = board();
        let mut session = session(&mut b);
        session.init_devices(&mut b).unwrap();

        let mut visited = vec![session.phase()];
        while !session.phase().is_terminal() {
            session.advance();
            visited.push(session.phase());
        }
        assert_eq!(
            visited,
            vec![Phase::user(0x01), Phase::user(0x03), Phase::user(0x10), Phase::END]
        );
        assert!(session.current_partition().is_none());

        // terminal phases stay put
        session.advance();
        assert_eq!(session.phase(), Phase::END);
    }

    #[test]
    fn test_init_devices_commits_table_and_maps_alts() {
        let mut b = board();
        let mut session = session(&mut b);
        session.init_devices(&mut b).unwrap();

        assert_eq!(session.devices().len(), 1);
        assert_eq!(b.committed_tables().len(), 1);
        assert_eq!(session.current_partition().unwrap().name, "fsbl1");
        // four stored partitions, command, OTP and PMIC
        assert_eq!(session.alts().len(), 7);
        assert_eq!(session.destination(), DEFAULT_ADDRESS);
        assert_eq!(session.current_alt().unwrap().alt_id, 0);
    }

    #[test]
    fn test_init_devices_error_drops_partitions() {
        let mut b = MemoryBoard::new();
        let mut session = session(&mut b);
        let err = session.init_devices(&mut b).unwrap_err();
        assert!(matches!(
            err,
            ProgramError::Model(ModelError::DeviceUnavailable { .. })
        ));
        assert!(session.parts().is_empty());
        assert_eq!(session.alts().len(), 2);
        session.fail(&err);
        assert_eq!(session.phase(), Phase::RESET);
        assert!(session.error_text().starts_with("mmc1 device not available"));
    }

    #[test]
    fn test_delete_option_erases() {
        let mut b = board();
        let layout = "PD\t0x01\tdisk\tRawImage\tmmc1\t0x0\n";
        let mut session = ProgramSession::with_layout(SessionConfig::default(), &mut b, layout.as_bytes()).unwrap();
        assert_eq!(session.phase(), Phase::user(0x01));
        assert_eq!(b.erased().len(), 1);
        assert_eq!(b.erased()[0].3, 0x10_0000 * 512);

        session.force_phase(Phase::END);
        assert!(session.current_partition().is_none());
    }

    #[test]
    fn test_with_layout_rejects_bad_text() {
        let mut b = board();
        let err = ProgramSession::with_layout(SessionConfig::default(), &mut b, b"X\t0x01\ta\tBinary\tmmc1\t0x0\n")
            .unwrap_err();
        assert!(matches!(err, ProgramError::Layout(_)));
    }

    #[test]
    fn test_fail_keeps_first_error() {
        let mut b = board();
        let mut session = ProgramSession::new(SessionConfig::default(), &mut b);
        session.fail("first");
        session.fail("second");
        assert_eq!(session.error_text(), "first");
        assert_eq!(session.destination(), DEFAULT_ADDRESS);

        assert!(session.request_reset());
        assert_eq!(session.phase(), Phase::DO_RESET);
        assert!(!session.request_reset());

        let mut session = ProgramSession::new(SessionConfig::default(), &mut b);
        session.fail("x".repeat(400));
        assert_eq!(session.error_text().len(), ERROR_TEXT_MAX);
    }

    #[test]
    fn test_sequence_rollback() {
        let mut b = board();
        let mut session = ProgramSession::new(SessionConfig::default(), &mut b);
        assert!(session.begin_packet(0));
        assert!(session.begin_packet(1));
        // duplicate
        assert!(!session.begin_packet(1));
        assert_eq!(session.packet_number(), 1);
        assert!(session.begin_packet(2));
        // out of order
        assert!(!session.begin_packet(4));
        assert_eq!(session.packet_number(), 2);
    }

    #[test]
    fn test_serial_layout_transfer() {
        let mut b = board();
        let mut session = ProgramSession::new(SessionConfig::default(), &mut b);
        let image = ImageHeader::wrap(LAYOUT.as_bytes());
        for chunk in image.chunks(256) {
            session.write_data(&mut b, chunk).unwrap();
        }
        assert_eq!(session.cursor(), image.len() as u64);
        session.start(&mut b, 0).unwrap();
        assert_eq!(session.phase(), Phase::user(0x01));
        assert_eq!(session.parts().len(), 5);

        let events = session.drain_events(Phase::LAYOUT);
        assert!(events.contains(&ProgramEvent::LayoutReady {
            partitions: 5,
            devices: 1
        }));
    }

    #[test]
    fn test_partition_transfer_and_boot_select() {
        let mut b = board();
        let mut session = session(&mut b);
        session.init_devices(&mut b).unwrap();
        session.drain_events(Phase::LAYOUT);

        assert!(session.begin_packet(0));
        session.write_data(&mut b, b"fsbl image").unwrap();
        session.start(&mut b, DEFAULT_ADDRESS).unwrap();
        assert_eq!(session.phase(), Phase::user(0x03));
        assert_eq!(b.boot_partition(Target::Mmc(1)), Some(HwPartition::Boot1));
        assert_eq!(
            b.read_back(Target::Mmc(1), Some(HwPartition::Boot1), 0, 10),
            b"fsbl image"
        );
        let events = session.drain_events(Phase::user(0x01));
        assert_eq!(
            events[0],
            ProgramEvent::PartitionDone {
                id: 0x01,
                name: "fsbl1".to_string(),
                size: 10
            }
        );

        let mut buf = [0u8; 4];
        assert_eq!(session.read_partition(&mut b, 0x01, 0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"fsbl");
        assert_eq!(
            session.read_partition(&mut b, 0x42, 0, &mut buf),
            Err(ProgramError::UnknownPartition(0x42))
        );
    }

    #[test]
    fn test_start_checks_header() {
        let mut b = board();
        let mut session = session(&mut b);
        session.init_devices(&mut b).unwrap();

        let payload = vec![0x5Au8; 600];
        let mut image = ImageHeader::wrap(&payload);
        let last = image.len() - 1;
        image[last] = 0;
        assert!(session.begin_packet(0));
        for chunk in image.chunks(256) {
            session.write_data(&mut b, chunk).unwrap();
        }
        let err = session.start(&mut b, 0x01).unwrap_err();
        assert!(matches!(err, ProgramError::Transfer(_)));
        assert_eq!(session.phase(), Phase::user(0x01));
    }

    #[test]
    fn test_start_control_phases() {
        let mut b = board();
        let mut session = session(&mut b);
        session.init_devices(&mut b).unwrap();

        assert_eq!(
            session.start(&mut b, 0x10),
            Err(ProgramError::InvalidPhase {
                requested: 0x10,
                current: Phase::user(0x01)
            })
        );
        assert_eq!(
            session.start(&mut b, 0xC000_0000),
            Err(ProgramError::ExecuteReturned {
                address: 0xC000_0000
            })
        );
        assert_eq!(b.executed(), &[0xC000_0000]);

        session.start(&mut b, u32::from(PHASE_END)).unwrap();
        assert_eq!(session.phase(), Phase::END);
        session.start(&mut b, DEFAULT_ADDRESS).unwrap();
        assert_eq!(session.phase(), Phase::DO_RESET);
    }

    #[test]
    fn test_nvm_through_session() {
        let mut b = board();
        let mut session = ProgramSession::new(SessionConfig::default(), &mut b);
        assert!(session.begin_packet(0));
        session.write_nvm_packet(&mut b, NvmKind::Pmic, &[1, 2, 3, 4]).unwrap();
        session.write_nvm_packet(&mut b, NvmKind::Pmic, &[5, 6, 7, 8, 9]).unwrap();
        assert_eq!(session.cursor(), 9);
        session.start(&mut b, u32::from(PHASE_PMIC)).unwrap();
        assert_eq!(b.pmic_image().unwrap().data(), &[1, 2, 3, 4, 5, 6, 7, 8]);

        assert!(matches!(
            session.start(&mut b, u32::from(PHASE_OTP)),
            Err(ProgramError::Nvm(NvmError::NoData(NvmKind::Otp)))
        ));

        let mut none = MemoryBoard::new();
        assert_eq!(
            session.nvm_write(&mut none, NvmKind::Otp, 0, &[1]),
            Err(ProgramError::Nvm(NvmError::Unsupported(NvmKind::Otp)))
        );
    }

    #[test]
    fn test_set_phase() {
        let mut b = board();
        let mut session = session(&mut b);
        session.init_devices(&mut b).unwrap();

        session.set_phase(0x10, 0x2000).unwrap();
        assert_eq!(session.phase(), Phase::user(0x10));
        assert_eq!(session.cursor(), 0x2000);
        assert_eq!(session.current_partition().unwrap().name, "rootfs");

        session.set_phase(0x10, 0).unwrap();
        assert_eq!(session.cursor(), 0);
        assert_eq!(session.set_phase(0x22, 0), Err(ProgramError::UnknownPhase(0x22)));
    }

    #[test]
    fn test_layout_overflow() {
        let mut b = board();
        let mut session = ProgramSession::new(SessionConfig::default(), &mut b);
        assert!(matches!(
            session.write_layout(FLASHLAYOUT_MAX_SIZE as u64 - 2, &[0; 4]),
            Err(ProgramError::LayoutOverflow { .. })
        ));
    }
}
