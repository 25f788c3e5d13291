//! Read-back commands.

use tracing::{debug, warn};

use crate::backend::Board;
use crate::events::{LogLevel, ProgramObserver};
use crate::nvm::NvmKind;
use crate::protocol::xor_checksum;
use crate::state::Phase;
use crate::transport::{SerialPort, TransportError};

use super::{HandleResult, HandlerContext};

/// READ_MEMORY - copy a RAM window to the host.
pub fn handle_read_memory<P: SerialPort, B: Board, O: ProgramObserver>(
    ctx: &mut HandlerContext<'_, P, B, O>,
) -> Result<HandleResult, TransportError> {
    let Some(address) = ctx.read_address()? else {
        return ctx.result(HandleResult::Nack);
    };
    ctx.result(HandleResult::Ack)?;

    let Some(len) = ctx.read_length()? else {
        return ctx.result(HandleResult::Nack);
    };

    let buffer = &mut ctx.buffer[..len];
    match ctx.board.read_memory(address, buffer) {
        Ok(()) => {
            ctx.result(HandleResult::Ack)?;
            let data = ctx.buffer[..len].to_vec();
            ctx.write_all(&data)?;
            Ok(HandleResult::Ack)
        }
        Err(e) => {
            warn!(address = %format!("0x{:08x}", address), len, error = %e, "Read memory refused");
            ctx.result(HandleResult::Abort)
        }
    }
}

/// READ_PARTITION - read a partition or an NVM image back to the host.
pub fn handle_read_partition<P: SerialPort, B: Board, O: ProgramObserver>(
    ctx: &mut HandlerContext<'_, P, B, O>,
) -> Result<HandleResult, TransportError> {
    let mut header = [0u8; 5];
    for byte in header.iter_mut() {
        *byte = ctx.getc()?;
    }
    let check = ctx.getc()?;
    if check != xor_checksum(&header) {
        debug!(?header, check, "Read partition checksum error");
        return ctx.result(HandleResult::Nack);
    }
    ctx.result(HandleResult::Ack)?;

    let id = header[0];
    let offset = u64::from(u32::from_be_bytes([header[1], header[2], header[3], header[4]]));

    let Some(len) = ctx.read_length()? else {
        return ctx.result(HandleResult::Nack);
    };

    ctx.buffer[..len].fill(0);
    let read = match NvmKind::from_phase(Phase::new(u16::from(id))) {
        Some(kind) => ctx
            .session
            .nvm_read(&mut *ctx.board, kind, offset, &mut ctx.buffer[..len]),
        None => ctx
            .session
            .read_partition(&mut *ctx.board, id, offset, &mut ctx.buffer[..len]),
    };

    match read {
        Ok(0) => {
            debug!(id, offset, "Nothing to read");
            ctx.result(HandleResult::Abort)
        }
        Ok(n) => {
            debug!(id, offset, n, "Partition read");
            ctx.result(HandleResult::Ack)?;
            // short reads are padded to the requested length
            let data = ctx.buffer[..len].to_vec();
            ctx.write_all(&data)?;
            Ok(HandleResult::Ack)
        }
        Err(e) => {
            ctx.log(LogLevel::Error, format!("read partition 0x{:02x}: {}", id, e));
            ctx.session.fail(&e);
            ctx.result(HandleResult::Abort)
        }
    }
}
