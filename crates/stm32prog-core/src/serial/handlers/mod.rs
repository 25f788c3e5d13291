//! Serial command handlers.
//!
//! This module is split into submodules by functionality:
//! - `info`: get-capabilities, get-version, get-id, get-phase
//! - `memory`: read-memory, read-partition
//! - `start`: start (end of transfer, control phases, execute)
//! - `download`: packet download

mod download;
mod info;
mod memory;
mod start;

use tracing::{debug, warn};

use crate::backend::Board;
use crate::events::{LogLevel, ProgramEvent, ProgramObserver};
use crate::protocol::constants::*;
use crate::protocol::{SerialCommand, xor_checksum};
use crate::state::ProgramSession;
use crate::transport::{SerialPort, TransportError};

use download::handle_download;
use info::{handle_get_capabilities, handle_get_id, handle_get_phase, handle_get_version};
use memory::{handle_read_memory, handle_read_partition};
use start::handle_start;

/// Wait before rejecting an unknown command, so the rest of it is flushed.
const UNKNOWN_COMMAND_DELAY_MS: u32 = 3;

/// Final answer sent for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    Ack,
    Nack,
    Abort,
}

impl HandleResult {
    pub fn byte(self) -> u8 {
        match self {
            HandleResult::Ack => ACK_BYTE,
            HandleResult::Nack => NACK_BYTE,
            HandleResult::Abort => ABORT_BYTE,
        }
    }
}

/// Handler context containing all resources.
pub struct HandlerContext<'a, P: SerialPort, B: Board, O: ProgramObserver> {
    pub port: &'a mut P,
    pub board: &'a mut B,
    pub observer: &'a O,
    pub session: &'a mut ProgramSession,
    pub buffer: &'a mut [u8; USART_RAM_BUFFER_SIZE],
    /// A receive error happened since the flag was last cleared.
    pub line_error: bool,
}

impl<'a, P: SerialPort, B: Board, O: ProgramObserver> HandlerContext<'a, P, B, O> {
    pub(crate) fn emit(&self, event: ProgramEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(ProgramEvent::Log {
            level,
            message: message.into(),
        });
    }

    /// Read one byte; a receive error yields 0 and raises `line_error`.
    pub(crate) fn getc(&mut self) -> Result<u8, TransportError> {
        match self.port.getc() {
            Ok(byte) => Ok(byte),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Serial receive error");
                self.line_error = true;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn putc(&mut self, byte: u8) -> Result<(), TransportError> {
        self.port.putc(byte)
    }

    pub(crate) fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(bytes)
    }

    /// Send a result byte, dropping whatever the host sent in excess.
    pub(crate) fn result(&mut self, result: HandleResult) -> Result<HandleResult, TransportError> {
        self.port.flush_input()?;
        self.port.putc(result.byte())?;
        Ok(result)
    }

    /// Four address bytes, most significant first, then their XOR.
    ///
    /// Returns `None` when the XOR does not match.
    pub(crate) fn read_address(&mut self) -> Result<Option<u32>, TransportError> {
        let mut bytes = [0u8; 4];
        for byte in bytes.iter_mut() {
            *byte = self.getc()?;
        }
        let check = self.getc()?;
        if check != xor_checksum(&bytes) {
            debug!(?bytes, check, "Address checksum error");
            return Ok(None);
        }
        Ok(Some(u32::from_be_bytes(bytes)))
    }

    /// Length byte followed by its complement. Returns the byte count.
    pub(crate) fn read_length(&mut self) -> Result<Option<usize>, TransportError> {
        let n = self.getc()?;
        let check = self.getc()?;
        if check != !n {
            debug!(n, check, "Length check error");
            return Ok(None);
        }
        Ok(Some(usize::from(n) + 1))
    }
}

/// Check the command framing, acknowledge it, and run its handler.
pub fn handle_command<P: SerialPort, B: Board, O: ProgramObserver>(
    code: u8,
    ctx: &mut HandlerContext<'_, P, B, O>,
) -> Result<HandleResult, TransportError> {
    let Ok(command) = SerialCommand::try_from(code) else {
        debug!(code = %format!("0x{:02x}", code), "Unknown command");
        ctx.board.delay_ms(UNKNOWN_COMMAND_DELAY_MS);
        return ctx.result(HandleResult::Nack);
    };
    let check = ctx.getc()?;
    if let Err(e) = SerialCommand::decode(code, check) {
        debug!(error = ?e, "Command framing error");
        ctx.board.delay_ms(UNKNOWN_COMMAND_DELAY_MS);
        return ctx.result(HandleResult::Nack);
    }
    ctx.result(HandleResult::Ack)?;
    debug!(command = %command, phase = %ctx.session.phase(), "Command");

    match command {
        SerialCommand::GetCapabilities => handle_get_capabilities(ctx),
        SerialCommand::GetVersion => handle_get_version(ctx),
        SerialCommand::GetId => handle_get_id(ctx),
        SerialCommand::GetPhase => handle_get_phase(ctx),
        SerialCommand::ReadMemory => handle_read_memory(ctx),
        SerialCommand::ReadPartition => handle_read_partition(ctx),
        SerialCommand::Start => handle_start(ctx),
        SerialCommand::Download => handle_download(ctx),
    }
}
