//! BLE Manager
//!
//! Owns the link state (connection registry plus notification channel) and
//! applies `BleEvent`s to it. Command frames are dispatched with the link
//! lock released so flash I/O never blocks connection bookkeeping.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embedded_storage_async::nor_flash::NorFlash;
use heapless::Vec;

use crate::ble::connection::{CccdValue, ConnectionRegistry};
use crate::ble::events::{BleEvent, ServiceHandles};
use crate::ble::notifications::{NotificationChannel, NotifyTransport, PendingAcks};
use crate::commands::CommandDispatcher;
use crate::config::MAX_FRAMES_PER_WRITE;
use crate::core::protocol::Frame;

/// Everything mutated by BLE events, guarded by one lock
pub struct LinkState<T> {
    pub registry: ConnectionRegistry,
    pub notifications: NotificationChannel<T>,
    handles: Option<ServiceHandles>,
}

impl<T: NotifyTransport> LinkState<T> {
    fn new(transport: T) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            notifications: NotificationChannel::new(transport),
            handles: None,
        }
    }
}

/// BLE side of the firmware: connections, CCCD state and command responses
pub struct BleManager<'a, M: RawMutex, F, T> {
    dispatcher: CommandDispatcher<'a, M, F>,
    link: Mutex<M, LinkState<T>>,
    acks: &'a PendingAcks<M>,
}

impl<'a, M, F, T> BleManager<'a, M, F, T>
where
    M: RawMutex,
    F: NorFlash,
    T: NotifyTransport,
{
    /// `acks` holds completions the event queue had no room for
    pub fn new(dispatcher: CommandDispatcher<'a, M, F>, transport: T, acks: &'a PendingAcks<M>) -> Self {
        Self {
            dispatcher,
            link: Mutex::new(LinkState::new(transport)),
            acks,
        }
    }

    /// Run `f` with the link state locked
    pub async fn with_link<R>(&self, f: impl FnOnce(&mut LinkState<T>) -> R) -> R {
        let mut link = self.link.lock().await;
        f(&mut link)
    }

    /// Apply one event
    pub async fn handle_event(&self, event: BleEvent) {
        match event {
            BleEvent::ServiceRegistered(handles) => {
                let mut link = self.link.lock().await;
                link.handles = Some(handles);
                link.notifications.set_notify_handle(handles.notify);
                info!("BLE: Service registered (command {}, notify {})", handles.command, handles.notify);
            }
            BleEvent::Connected { conn_id, session } => {
                let mut link = self.link.lock().await;
                if link.registry.connect(conn_id, session).is_ok() {
                    // Completions recorded for an earlier link on this handle
                    self.acks.take(conn_id);
                    info!("BLE: Connected {} ({} active)", conn_id, link.registry.connection_count());
                }
            }
            BleEvent::Disconnected { conn_id, session, reason } => {
                let mut link = self.link.lock().await;
                if link.registry.disconnect(conn_id, session).is_ok() {
                    self.acks.take(conn_id);
                    info!("BLE: Disconnected {} (reason 0x{:x})", conn_id, reason);
                }
            }
            BleEvent::Written { conn_id, handle, data } => {
                let handles = self.link.lock().await.handles;
                let Some(handles) = handles else {
                    warn!("BLE: Write before service registration ignored");
                    return;
                };

                if handle == handles.notify_cccd {
                    self.on_cccd_write(conn_id, &data).await;
                } else if handle == handles.command {
                    self.on_command_write(conn_id, &data).await;
                } else {
                    trace!("BLE: Write to unhandled attribute {}", handle);
                }
            }
            BleEvent::NotifyAcked { conn_id } => {
                let mut link = self.link.lock().await;
                let LinkState { registry, notifications, .. } = &mut *link;
                self.acks.take(conn_id);
                notifications.acknowledge(registry, conn_id);
            }
        }
    }

    async fn on_cccd_write(&self, conn_id: u16, data: &[u8]) {
        let Some(value) = CccdValue::from_write(data) else {
            warn!("BLE: CCCD write of {} bytes ignored", data.len());
            return;
        };

        let mut link = self.link.lock().await;
        // Unknown connections are already logged by the registry
        let _ = link
            .registry
            .set_notifications_enabled(conn_id, value.notifications_enabled());
    }

    async fn on_command_write(&self, conn_id: u16, data: &[u8]) {
        let mut frames: Vec<Frame, MAX_FRAMES_PER_WRITE> = Vec::new();

        {
            let mut link = self.link.lock().await;
            let Some(conn) = link.registry.get_mut(conn_id) else {
                warn!("BLE: Write from unknown connection {}", conn_id);
                return;
            };

            for &byte in data {
                match conn.reassembler.push(byte) {
                    Ok(Some(frame)) => {
                        if frames.push(frame).is_err() {
                            warn!("FRAME: More than {} frames in one write, dropping", MAX_FRAMES_PER_WRITE);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("FRAME: Connection {} frame dropped: {:?}", conn_id, e),
                }
            }
        }

        for frame in frames {
            let response = self.dispatcher.dispatch(&frame).await;

            let mut link = self.link.lock().await;
            let LinkState { registry, notifications, .. } = &mut *link;
            if self.acks.take(conn_id) {
                notifications.acknowledge(registry, conn_id);
            }
            if let Err(e) = notifications.send(registry, conn_id, response.as_bytes()) {
                warn!("BLE: Response to connection {} dropped: {:?}", conn_id, e);
            }
        }
    }
}
