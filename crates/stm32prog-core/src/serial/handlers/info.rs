//! Identification and status commands.

use byteorder::{ByteOrder, LittleEndian};

use crate::backend::Board;
use crate::events::ProgramObserver;
use crate::protocol::SerialCommand;
use crate::protocol::constants::*;
use crate::state::Phase;
use crate::transport::{SerialPort, TransportError};

use super::{HandleResult, HandlerContext};

/// GET - protocol version and supported commands.
pub fn handle_get_capabilities<P: SerialPort, B: Board, O: ProgramObserver>(
    ctx: &mut HandlerContext<'_, P, B, O>,
) -> Result<HandleResult, TransportError> {
    // byte count minus one: version plus every command code
    ctx.putc(SerialCommand::ALL.len() as u8)?;
    ctx.putc(USART_BL_VERSION)?;
    for command in SerialCommand::ALL {
        ctx.putc(command.code())?;
    }
    ctx.result(HandleResult::Ack)
}

/// GET_VERSION - bootloader version and two option bytes.
pub fn handle_get_version<P: SerialPort, B: Board, O: ProgramObserver>(
    ctx: &mut HandlerContext<'_, P, B, O>,
) -> Result<HandleResult, TransportError> {
    ctx.write_all(&[UBOOT_BL_VERSION, 0x00, 0x00])?;
    ctx.result(HandleResult::Ack)
}

/// GET_ID - product identifier.
pub fn handle_get_id<P: SerialPort, B: Board, O: ProgramObserver>(
    ctx: &mut HandlerContext<'_, P, B, O>,
) -> Result<HandleResult, TransportError> {
    let id = ctx.session.config().device_id.to_be_bytes();
    ctx.write_all(&[0x01, id[0], id[1]])?;
    ctx.result(HandleResult::Ack)
}

/// GET_PHASE - current phase, destination, and the error text after a failure.
///
/// Reporting the `Reset` phase to the host is what allows the final reset.
pub fn handle_get_phase<P: SerialPort, B: Board, O: ProgramObserver>(
    ctx: &mut HandlerContext<'_, P, B, O>,
) -> Result<HandleResult, TransportError> {
    let phase = ctx.session.phase();
    let message: Vec<u8> = if phase.is_reset() {
        ctx.session.error_text().as_bytes().to_vec()
    } else {
        Vec::new()
    };
    let len = message.len().min(usize::from(u8::MAX - 5)) as u8;

    let mut reply = [0u8; 7];
    reply[0] = len + 5;
    reply[1] = phase.wire();
    LittleEndian::write_u32(&mut reply[2..6], ctx.session.destination());
    reply[6] = len;
    ctx.write_all(&reply)?;
    ctx.write_all(&message[..usize::from(len)])?;
    let result = ctx.result(HandleResult::Ack)?;

    if phase == Phase::RESET {
        ctx.session.request_reset();
    }
    Ok(result)
}
