//! Core System Infrastructure
//!
//! Storage, wire framing and the serial transport. Nothing here is
//! BLE-specific.

pub mod file;
pub mod protocol;
pub mod storage;
pub mod transport;
