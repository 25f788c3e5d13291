//! UART programming engine.
//!
//! The engine waits for the host's `0x7F` sync byte, then serves one
//! command at a time: a command byte, its complement, and a payload framed
//! by XOR checksums. Every step of a command is answered with `ACK`, `NACK`
//! (resend) or `ABORT` (give up).
//!
//! ```text
//!   host                      device
//!   0x7F              ───►
//!                     ◄───    ACK
//!   cmd, !cmd         ───►
//!                     ◄───    ACK
//!   payload...        ───►
//!                     ◄───    ACK | NACK | ABORT
//! ```

pub mod handlers;

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::backend::Board;
use crate::events::{Channel, ProgramEvent, ProgramObserver};
use crate::protocol::constants::*;
use crate::state::{Phase, ProgramSession};
use crate::transport::{SerialPort, TransportError};

use handlers::{HandleResult, HandlerContext, handle_command};

/// Why the command loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The host acknowledged the final phase; the board should reset.
    Reset,
    /// The platform requested an abort.
    Cancelled,
    /// The line went away.
    Disconnected,
}

/// Serial command loop over a port and a board.
pub struct SerialEngine<P: SerialPort, B: Board, O: ProgramObserver> {
    port: P,
    board: B,
    observer: Arc<O>,
    buffer: Box<[u8; USART_RAM_BUFFER_SIZE]>,
}

impl<P: SerialPort, B: Board, O: ProgramObserver> SerialEngine<P, B, O> {
    pub fn new(port: P, board: B, observer: Arc<O>) -> Self {
        Self {
            port,
            board,
            observer,
            buffer: Box::new([0; USART_RAM_BUFFER_SIZE]),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn into_parts(self) -> (P, B) {
        (self.port, self.board)
    }

    /// Serve commands until reset, cancel or disconnection.
    ///
    /// Command failures are reported on the wire and recorded in the
    /// session; only transport failures end the loop with an error.
    #[instrument(skip_all)]
    pub fn run(&mut self, session: &mut ProgramSession) -> Result<LoopExit, TransportError> {
        info!(phase = %session.phase(), "Serial engine started");
        loop {
            if self.board.cancel_requested() {
                info!("Cancelled");
                return Ok(LoopExit::Cancelled);
            }
            if session.phase() == Phase::DO_RESET {
                info!("Reset requested by host");
                return Ok(LoopExit::Reset);
            }

            let code = match self.port.getc() {
                Ok(code) => code,
                Err(TransportError::Disconnected) => {
                    info!("Serial line disconnected");
                    return Ok(LoopExit::Disconnected);
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Serial receive error while idle");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if code == INIT_BYTE {
                debug!("Sync byte received");
                self.port.putc(ACK_BYTE)?;
                self.observer.on_event(&ProgramEvent::Connected {
                    channel: Channel::Serial,
                });
                continue;
            }

            let before = session.phase();
            let result = {
                let mut ctx = HandlerContext {
                    port: &mut self.port,
                    board: &mut self.board,
                    observer: self.observer.as_ref(),
                    session: &mut *session,
                    buffer: &mut *self.buffer,
                    line_error: false,
                };
                handle_command(code, &mut ctx)
            };
            for event in session.drain_events(before) {
                self.observer.on_event(&event);
            }

            match result {
                Ok(HandleResult::Ack) => {}
                Ok(other) => {
                    debug!(code = %format!("0x{:02x}", code), result = ?other, "Command not acknowledged")
                }
                Err(TransportError::Disconnected) => {
                    info!("Serial line disconnected");
                    return Ok(LoopExit::Disconnected);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
