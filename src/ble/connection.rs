//! Connection Management
//!
//! Fixed-capacity table of connected peers. Each slot carries the
//! per-connection notification flags and the frame reassembly state, so
//! dropping a slot on disconnect drops everything tied to that link.

use crate::config::MAX_CONNECTIONS;
use crate::core::protocol::FrameReassembler;

/// Connection id that never names a real link
pub const INVALID_CONN_ID: u16 = 0xFFFF;

/// CCCD value written by a peer to enable notifications
pub const CCCD_NOTIFY: u16 = 0x0001;

/// Decoded client characteristic configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CccdValue {
    NotificationsEnabled,
    Disabled,
}

impl CccdValue {
    pub fn from_raw(raw: u16) -> Self {
        if raw == CCCD_NOTIFY {
            Self::NotificationsEnabled
        } else {
            Self::Disabled
        }
    }

    /// Decode a CCCD write; anything but two little-endian bytes is ignored
    pub fn from_write(data: &[u8]) -> Option<Self> {
        match data {
            [lo, hi] => Some(Self::from_raw(u16::from_le_bytes([*lo, *hi]))),
            _ => None,
        }
    }

    pub fn notifications_enabled(self) -> bool {
        self == Self::NotificationsEnabled
    }
}

/// State of one connected peer
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: u16,
    /// Link this slot belongs to; a reused handle arrives with a new session
    pub session: u32,
    pub notifications_enabled: bool,
    /// A notification was started and its completion not yet seen
    pub notification_in_progress: bool,
    pub reassembler: FrameReassembler,
}

impl Connection {
    fn new(id: u16, session: u32) -> Self {
        Self {
            id,
            session,
            notifications_enabled: false,
            notification_in_progress: false,
            reassembler: FrameReassembler::new(),
        }
    }
}

/// Connection management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionError {
    /// Id is the reserved invalid id
    InvalidHandle,
    /// Id already occupies a slot
    AlreadyConnected,
    /// Every slot is taken
    RegistryFull,
    ConnectionNotFound,
    /// Disconnect names an earlier link on a handle that has been reused
    StaleSession,
}

/// Table of connected peers
pub struct ConnectionRegistry {
    slots: [Option<Connection>; MAX_CONNECTIONS],
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Track a new connection in the first free slot
    pub fn add(&mut self, conn_id: u16) -> Result<(), ConnectionError> {
        self.connect(conn_id, 0)
    }

    /// Track link `session` on handle `conn_id`
    ///
    /// A slot still holding an earlier session of the same handle is reset
    /// for the new link; the same session twice is `AlreadyConnected`.
    pub fn connect(&mut self, conn_id: u16, session: u32) -> Result<(), ConnectionError> {
        if conn_id == INVALID_CONN_ID {
            error!("CONNECTION: Invalid connection id 0x{:x}", conn_id);
            return Err(ConnectionError::InvalidHandle);
        }

        if let Some(conn) = self.get_mut(conn_id) {
            if conn.session == session {
                warn!("CONNECTION: Connection {} already registered", conn_id);
                return Err(ConnectionError::AlreadyConnected);
            }
            warn!(
                "CONNECTION: Handle {} reused before session {} disconnected, resetting",
                conn_id,
                conn.session
            );
            *conn = Connection::new(conn_id, session);
            return Ok(());
        }

        let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            error!("CONNECTION: Failed to add connection {} - registry full", conn_id);
            return Err(ConnectionError::RegistryFull);
        };

        *slot = Some(Connection::new(conn_id, session));
        debug!("CONNECTION: Added connection {} (session {})", conn_id, session);
        Ok(())
    }

    /// Forget a connection along with its flags and partial frame
    pub fn remove(&mut self, conn_id: u16) -> Result<(), ConnectionError> {
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|c| c.id == conn_id))
        else {
            warn!("CONNECTION: Attempted to remove unknown connection {}", conn_id);
            return Err(ConnectionError::ConnectionNotFound);
        };

        *slot = None;
        debug!("CONNECTION: Removed connection {}", conn_id);
        Ok(())
    }

    /// Forget `conn_id` only while it still belongs to link `session`
    pub fn disconnect(&mut self, conn_id: u16, session: u32) -> Result<(), ConnectionError> {
        match self.get(conn_id) {
            Some(conn) if conn.session == session => self.remove(conn_id),
            Some(conn) => {
                debug!(
                    "CONNECTION: Ignoring disconnect of session {} on {}, now session {}",
                    session,
                    conn_id,
                    conn.session
                );
                Err(ConnectionError::StaleSession)
            }
            None => {
                warn!("CONNECTION: Disconnect for unknown connection {}", conn_id);
                Err(ConnectionError::ConnectionNotFound)
            }
        }
    }

    pub fn set_notifications_enabled(&mut self, conn_id: u16, enabled: bool) -> Result<(), ConnectionError> {
        let conn = self.get_mut(conn_id).ok_or(ConnectionError::ConnectionNotFound)?;
        conn.notifications_enabled = enabled;
        debug!(
            "CONNECTION: Notifications {} for connection {}",
            if enabled { "enabled" } else { "disabled" },
            conn_id
        );
        Ok(())
    }

    pub fn get(&self, conn_id: u16) -> Option<&Connection> {
        self.slots.iter().flatten().find(|c| c.id == conn_id)
    }

    pub fn get_mut(&mut self, conn_id: u16) -> Option<&mut Connection> {
        self.slots.iter_mut().flatten().find(|c| c.id == conn_id)
    }

    pub fn is_connected(&self, conn_id: u16) -> bool {
        self.get(conn_id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Ids of all tracked connections, in slot order
    pub fn active_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.slots.iter().flatten().map(|c| c.id)
    }

    pub const fn capacity(&self) -> usize {
        MAX_CONNECTIONS
    }
}
