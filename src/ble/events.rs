//! BLE Events
//!
//! Stack callbacks are translated into `BleEvent`s and queued; the BLE event
//! task feeds them to `BleManager::handle_event` one at a time. Nothing in
//! here depends on the SoftDevice.

use heapless::Vec;

use crate::config::MAX_WRITE_LEN;

/// Attribute handles of the registered command service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceHandles {
    /// Command characteristic value handle (write)
    pub command: u16,
    /// Response characteristic value handle (notify)
    pub notify: u16,
    /// CCCD of the response characteristic
    pub notify_cccd: u16,
}

impl ServiceHandles {
    /// Handles for a notify characteristic whose CCCD directly follows its value
    pub const fn with_adjacent_cccd(command: u16, notify: u16) -> Self {
        Self {
            command,
            notify,
            notify_cccd: notify + 1,
        }
    }
}

/// Payload of a single GATT write
pub type WriteData = Vec<u8, MAX_WRITE_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventError {
    /// Write payload exceeds `MAX_WRITE_LEN`
    DataTooLarge,
}

/// Events consumed by the BLE manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    /// GATT service is registered and may be used
    ServiceRegistered(ServiceHandles),
    /// Link `session` came up on `conn_id`
    ///
    /// The stack reuses handles, so the firmware numbers each link; a
    /// disconnect only applies to the session it names.
    Connected { conn_id: u16, session: u32 },
    Disconnected { conn_id: u16, session: u32, reason: u8 },
    /// Peer wrote to an attribute
    Written { conn_id: u16, handle: u16, data: WriteData },
    /// Stack completed the in-flight notification on `conn_id`
    NotifyAcked { conn_id: u16 },
}

impl BleEvent {
    /// Build a `Written` event, copying `data`
    pub fn written(conn_id: u16, handle: u16, data: &[u8]) -> Result<Self, EventError> {
        let data = WriteData::from_slice(data).map_err(|_| EventError::DataTooLarge)?;
        Ok(Self::Written { conn_id, handle, data })
    }
}
