use tracing::info;

use crate::backend::Board;
use crate::events::{LogLevel, ProgramObserver};
use crate::transport::{SerialPort, TransportError};

use super::{HandleResult, HandlerContext};

/// START - end the current transfer, select a control phase or jump to an image.
pub fn handle_start<P: SerialPort, B: Board, O: ProgramObserver>(
    ctx: &mut HandlerContext<'_, P, B, O>,
) -> Result<HandleResult, TransportError> {
    let Some(address) = ctx.read_address()? else {
        return ctx.result(HandleResult::Nack);
    };

    info!(address = %format!("0x{:08x}", address), phase = %ctx.session.phase(), "Start");
    match ctx.session.start(&mut *ctx.board, address) {
        Ok(()) => ctx.result(HandleResult::Ack),
        Err(e) => {
            ctx.log(LogLevel::Error, format!("start 0x{:08x}: {}", address, e));
            ctx.session.fail(&e);
            ctx.result(HandleResult::Nack)
        }
    }
}
