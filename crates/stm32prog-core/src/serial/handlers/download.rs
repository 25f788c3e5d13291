use tracing::{debug, warn};

use crate::backend::Board;
use crate::events::{LogLevel, ProgramEvent, ProgramObserver};
use crate::nvm::NvmKind;
use crate::state::Phase;
use crate::transport::{SerialPort, TransportError};

use super::{HandleResult, HandlerContext};

/// DOWNLOAD - receive one packet of the current phase.
///
/// The address field carries the phase in its top byte and the packet
/// number in the low 24 bits.
pub fn handle_download<P: SerialPort, B: Board, O: ProgramObserver>(
    ctx: &mut HandlerContext<'_, P, B, O>,
) -> Result<HandleResult, TransportError> {
    let Some(address) = ctx.read_address()? else {
        return ctx.result(HandleResult::Nack);
    };
    ctx.result(HandleResult::Ack)?;

    let operation = (address >> 24) as u8;
    let packet = address & 0x00FF_FFFF;
    if !ctx.session.begin_packet(packet) {
        return ctx.result(HandleResult::Nack);
    }

    let len_byte = ctx.getc()?;
    let len = usize::from(len_byte) + 1;
    let mut checksum = len_byte;
    for i in 0..len {
        let byte = ctx.getc()?;
        ctx.buffer[i] = byte;
        checksum ^= byte;
    }
    let check = ctx.getc()?;

    if check != checksum || ctx.line_error {
        warn!(packet, check, checksum, line_error = ctx.line_error, "Packet rejected");
        let delay = ctx.session.config().checksum_guard_delay_ms;
        ctx.board.delay_ms(delay);
        ctx.session.reject_packet();
        ctx.line_error = false;
        return ctx.result(HandleResult::Nack);
    }

    let data = ctx.buffer[..len].to_vec();
    let written = match NvmKind::from_phase(Phase::new(u16::from(operation))) {
        Some(kind) => ctx
            .session
            .write_nvm_packet(&mut *ctx.board, kind, &data),
        None => ctx.session.write_data(&mut *ctx.board, &data),
    };

    match written {
        Ok(()) => {
            debug!(packet, len, cursor = ctx.session.cursor(), "Packet stored");
            let result = ctx.result(HandleResult::Ack)?;
            ctx.emit(ProgramEvent::Progress {
                phase: ctx.session.phase(),
                offset: ctx.session.cursor(),
            });
            Ok(result)
        }
        Err(e) => {
            ctx.log(LogLevel::Error, format!("download packet {}: {}", packet, e));
            ctx.session.fail(&e);
            ctx.result(HandleResult::Abort)
        }
    }
}
