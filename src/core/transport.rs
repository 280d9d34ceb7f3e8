//! Serial Line Transport
//!
//! Newline-terminated command session over any `embedded_io_async` byte
//! stream. Each line is handed to the command dispatcher and the response
//! is written back followed by `\n`.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_io_async::{Read, Write};
use embedded_storage_async::nor_flash::NorFlash;
use heapless::Vec;

use crate::commands::{CommandDispatcher, Response};
use crate::config::MAX_LINE_LEN;

const LINE_END: u8 = b'\n';

/// Serial transport errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Underlying reader failed
    Read,
    /// Underlying writer failed
    Write,
}

/// Outcome of a terminated line
#[derive(Debug, PartialEq, Eq)]
pub enum Line<'a> {
    /// Line content without the terminator
    Complete(&'a [u8]),
    /// Line exceeded `MAX_LINE_LEN` and was discarded
    Overlong,
}

/// Accumulates bytes until a line terminator
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8, MAX_LINE_LEN>,
    /// Previous push returned a complete line still borrowed from `buffer`
    ready: bool,
    /// Dropping bytes until the end of an overlong line
    discarding: bool,
}

impl LineBuffer {
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            ready: false,
            discarding: false,
        }
    }

    /// Consume one byte; returns a line when `\n` arrives
    pub fn push(&mut self, byte: u8) -> Option<Line<'_>> {
        if self.ready {
            self.buffer.clear();
            self.ready = false;
        }

        if byte == LINE_END {
            if core::mem::take(&mut self.discarding) {
                return Some(Line::Overlong);
            }
            self.ready = true;
            return Some(Line::Complete(&self.buffer));
        }

        if !self.discarding && self.buffer.push(byte).is_err() {
            warn!("UART: Line exceeds {} bytes, discarding", MAX_LINE_LEN);
            self.buffer.clear();
            self.discarding = true;
        }

        None
    }
}

async fn write_response<W: Write>(tx: &mut W, response: &Response) -> Result<(), TransportError> {
    tx.write_all(response.as_bytes()).await.map_err(|_| TransportError::Write)?;
    tx.write_all(&[LINE_END]).await.map_err(|_| TransportError::Write)?;
    tx.flush().await.map_err(|_| TransportError::Write)
}

/// Serve commands from `rx` until end of stream
///
/// A read of zero bytes ends the session cleanly.
pub async fn run_line_session<R, W, M, F>(
    rx: &mut R,
    tx: &mut W,
    dispatcher: &CommandDispatcher<'_, M, F>,
) -> Result<(), TransportError>
where
    R: Read,
    W: Write,
    M: RawMutex,
    F: NorFlash,
{
    let mut line = LineBuffer::new();
    let mut chunk = [0u8; 64];

    info!("UART: Session started");

    loop {
        let n = rx.read(&mut chunk).await.map_err(|_| TransportError::Read)?;
        if n == 0 {
            info!("UART: End of stream");
            return Ok(());
        }

        for &byte in &chunk[..n] {
            let response = match line.push(byte) {
                None => continue,
                Some(Line::Complete(command)) => dispatcher.dispatch(command).await,
                Some(Line::Overlong) => Response::SyntaxError,
            };
            write_response(tx, &response).await?;
        }
    }
}
