//! BLE Command Framing
//!
//! Commands written to the command characteristic are framed as:
//! - `STX` (0x02)
//! - payload bytes
//! - `ETX` (0x03)
//! - `BCC`: XOR of every byte from `STX` through `ETX`
//!
//! A frame may arrive split over several GATT writes, so each connection
//! owns a `FrameReassembler` that consumes bytes one at a time.

use heapless::Vec;

use crate::config::MAX_FRAME_LEN;

/// Start of text
pub const STX: u8 = 0x02;
/// End of text
pub const ETX: u8 = 0x03;

/// Reassembled frame payload (without STX, ETX and BCC)
pub type Frame = Vec<u8, MAX_FRAME_LEN>;

/// Framing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Frame exceeded the reassembly buffer and was discarded
    Overflow,
    /// Received BCC did not match the computed one
    ChecksumMismatch { expected: u8, actual: u8 },
}

/// XOR block check character over `bytes`
pub fn bcc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, &b| acc ^ b)
}

/// Wrap `payload` into a complete frame
pub fn encode_frame<const N: usize>(payload: &[u8]) -> Option<Vec<u8, N>> {
    let mut frame = Vec::new();
    frame.push(STX).ok()?;
    frame.extend_from_slice(payload).ok()?;
    frame.push(ETX).ok()?;
    let check = bcc(&frame);
    frame.push(check).ok()?;
    Some(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    /// Waiting for STX; other bytes are dropped
    Idle,
    /// Collecting payload until ETX
    Body,
    /// Next byte is the BCC
    Check,
}

/// Byte-wise frame reassembly state for one connection
#[derive(Debug, Clone)]
pub struct FrameReassembler {
    state: RxState,
    /// STX, payload and ETX as received
    buffer: Vec<u8, MAX_FRAME_LEN>,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReassembler {
    pub const fn new() -> Self {
        Self {
            state: RxState::Idle,
            buffer: Vec::new(),
        }
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.state = RxState::Idle;
        self.buffer.clear();
    }

    /// A frame has started and is not yet complete
    pub fn in_frame(&self) -> bool {
        self.state != RxState::Idle
    }

    /// Consume one byte; returns the payload when a valid frame completes
    pub fn push(&mut self, byte: u8) -> Result<Option<Frame>, FrameError> {
        match self.state {
            RxState::Idle => {
                if byte == STX {
                    self.start();
                }
                Ok(None)
            }
            RxState::Body => {
                if byte == STX {
                    // Restart on a fresh STX; the partial frame is lost
                    self.start();
                    return Ok(None);
                }
                if self.buffer.push(byte).is_err() {
                    self.reset();
                    return Err(FrameError::Overflow);
                }
                if byte == ETX {
                    self.state = RxState::Check;
                }
                Ok(None)
            }
            RxState::Check => {
                let expected = bcc(&self.buffer);
                let result = if byte == expected {
                    let mut payload = Frame::new();
                    // Payload is strictly shorter than the buffer it came from
                    let _ = payload.extend_from_slice(&self.buffer[1..self.buffer.len() - 1]);
                    Ok(Some(payload))
                } else {
                    Err(FrameError::ChecksumMismatch { expected, actual: byte })
                };
                self.reset();
                result
            }
        }
    }

    fn start(&mut self) {
        self.buffer.clear();
        // Buffer is empty, so this cannot fail
        let _ = self.buffer.push(STX);
        self.state = RxState::Body;
    }
}
