//! Notification Service
//!
//! Sends responses to peers over the notify characteristic. At most one
//! notification is in flight per connection; there is no outbound queue, so
//! a response that cannot be sent right now is dropped.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use heapless::Vec;

use crate::ble::connection::ConnectionRegistry;
use crate::config::{MAX_CONNECTIONS, MAX_NOTIFY_LEN};

/// Notification errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NotificationError {
    /// Notify characteristic has not been registered yet
    ServiceNotStarted,
    ConnectionNotFound,
    /// Peer has not enabled notifications via the CCCD
    NotificationsDisabled,
    /// Previous notification on this connection is unacknowledged
    InProgress,
    /// Stack refused to start the notification
    SendFailed,
}

/// Starts a notification on the BLE stack
///
/// Completion is reported separately through `NotificationChannel::acknowledge`.
pub trait NotifyTransport {
    type Error;

    fn start_notify(&mut self, conn_id: u16, handle: u16, payload: &[u8]) -> Result<(), Self::Error>;
}

/// Notify characteristic plus the transport that drives it
pub struct NotificationChannel<T> {
    transport: T,
    notify_handle: Option<u16>,
}

impl<T: NotifyTransport> NotificationChannel<T> {
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            notify_handle: None,
        }
    }

    /// Record the notify value handle once the service is registered
    pub fn set_notify_handle(&mut self, handle: u16) {
        info!("NOTIFY: Notify characteristic at handle {}", handle);
        self.notify_handle = Some(handle);
    }

    pub fn notify_handle(&self) -> Option<u16> {
        self.notify_handle
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Start a notification of `payload` to `conn_id`
    ///
    /// Payloads longer than `MAX_NOTIFY_LEN` are cut to the first
    /// `MAX_NOTIFY_LEN` bytes.
    pub fn send(
        &mut self,
        registry: &mut ConnectionRegistry,
        conn_id: u16,
        payload: &[u8],
    ) -> Result<(), NotificationError> {
        let handle = self.notify_handle.ok_or(NotificationError::ServiceNotStarted)?;
        let conn = registry.get_mut(conn_id).ok_or(NotificationError::ConnectionNotFound)?;

        if !conn.notifications_enabled {
            return Err(NotificationError::NotificationsDisabled);
        }
        if conn.notification_in_progress {
            return Err(NotificationError::InProgress);
        }

        let payload = if payload.len() > MAX_NOTIFY_LEN {
            warn!("NOTIFY: {} byte response cut to {}", payload.len(), MAX_NOTIFY_LEN);
            &payload[..MAX_NOTIFY_LEN]
        } else {
            payload
        };

        conn.notification_in_progress = true;
        if self.transport.start_notify(conn_id, handle, payload).is_err() {
            conn.notification_in_progress = false;
            error!("NOTIFY: Stack rejected notification to connection {}", conn_id);
            return Err(NotificationError::SendFailed);
        }

        debug!("NOTIFY: Sent {} bytes to connection {}", payload.len(), conn_id);
        Ok(())
    }

    /// Stack finished the in-flight notification for `conn_id`
    pub fn acknowledge(&mut self, registry: &mut ConnectionRegistry, conn_id: u16) {
        match registry.get_mut(conn_id) {
            Some(conn) => conn.notification_in_progress = false,
            None => trace!("NOTIFY: Ack for unknown connection {}", conn_id),
        }
    }
}

/// Notification completions waiting to be applied to the registry
///
/// The stack callback records here when the event queue has no room, so a
/// busy event task cannot lose the completion and leave a connection stuck
/// in flight. Callable from any context.
pub struct PendingAcks<M: RawMutex> {
    conns: BlockingMutex<M, RefCell<Vec<u16, MAX_CONNECTIONS>>>,
}

impl<M: RawMutex> PendingAcks<M> {
    pub fn new() -> Self {
        Self {
            conns: BlockingMutex::new(RefCell::new(Vec::new())),
        }
    }

    /// Note a completed notification on `conn_id`
    pub fn record(&self, conn_id: u16) {
        self.conns.lock(|conns| {
            let mut conns = conns.borrow_mut();
            if !conns.contains(&conn_id) && conns.push(conn_id).is_err() {
                error!("NOTIFY: Pending ack table full, completion for {} lost", conn_id);
            }
        });
    }

    /// Remove the pending completion for `conn_id`; true if there was one
    pub fn take(&self, conn_id: u16) -> bool {
        self.conns.lock(|conns| {
            let mut conns = conns.borrow_mut();
            match conns.iter().position(|&id| id == conn_id) {
                Some(index) => {
                    conns.swap_remove(index);
                    true
                }
                None => false,
            }
        })
    }
}

impl<M: RawMutex> Default for PendingAcks<M> {
    fn default() -> Self {
        Self::new()
    }
}
