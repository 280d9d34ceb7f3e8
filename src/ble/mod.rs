//! BLE Protocol Implementation
//!
//! Connection tracking, command frame handling and responses over the
//! notify characteristic. Only `softdevice` touches the S140 bindings; the
//! rest is plain state driven by `BleEvent`s.

pub mod connection;
pub mod events;
pub mod manager;
pub mod notifications;
#[cfg(feature = "firmware")]
pub mod softdevice;
