//! SoftDevice Adapter
//!
//! Registers the command service with the S140 SoftDevice and turns its
//! callbacks into `BleEvent`s. Callbacks run in the SoftDevice event context
//! and must not block, so events are queued with `try_send`. A notification
//! completion that finds the queue full goes to `PendingAcks` instead.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Sender;
use nrf_softdevice::ble::gatt_server::builder::ServiceBuilder;
use nrf_softdevice::ble::gatt_server::characteristic::{Attribute, Metadata, Properties};
use nrf_softdevice::ble::gatt_server::{self, NotifyValueError, RegisterError, WriteOp};
use nrf_softdevice::ble::{Connection, Uuid};
use nrf_softdevice::Softdevice;

use crate::ble::events::{BleEvent, ServiceHandles};
use crate::ble::notifications::{NotifyTransport, PendingAcks};
use crate::config::{BLE_EVENT_QUEUE, CHAR_UUID_COMMAND, CHAR_UUID_NOTIFY, MAX_NOTIFY_LEN, MAX_WRITE_LEN, SERVICE_UUID};

/// Producer side of the BLE event queue
pub type EventSender = Sender<'static, CriticalSectionRawMutex, BleEvent, BLE_EVENT_QUEUE>;

/// GATT server exposing the command and response characteristics
pub struct CommandServer {
    events: EventSender,
    acks: &'static PendingAcks<CriticalSectionRawMutex>,
}

impl CommandServer {
    /// Register the service and announce its handles on `events`
    pub fn new(
        sd: &mut Softdevice,
        events: EventSender,
        acks: &'static PendingAcks<CriticalSectionRawMutex>,
    ) -> Result<Self, RegisterError> {
        let mut sb = ServiceBuilder::new(sd, Uuid::new_16(SERVICE_UUID))?;

        let command = sb
            .add_characteristic(
                Uuid::new_16(CHAR_UUID_COMMAND),
                Attribute::new([0u8; MAX_WRITE_LEN]).variable_len(MAX_WRITE_LEN as u16),
                Metadata::new(Properties::new().write().write_without_response()),
            )?
            .build();

        let notify = sb
            .add_characteristic(
                Uuid::new_16(CHAR_UUID_NOTIFY),
                Attribute::new([0u8; MAX_NOTIFY_LEN]).variable_len(MAX_NOTIFY_LEN as u16),
                Metadata::new(Properties::new().read().notify()),
            )?
            .build();

        let _service = sb.build();

        let handles = ServiceHandles {
            command: command.value_handle,
            notify: notify.value_handle,
            notify_cccd: notify.cccd_handle,
        };
        info!(
            "BLE: Command service registered (command {}, notify {}, cccd {})",
            handles.command,
            handles.notify,
            handles.notify_cccd
        );

        if events.try_send(BleEvent::ServiceRegistered(handles)).is_err() {
            error!("BLE: Event queue full, service registration lost");
        }

        Ok(Self { events, acks })
    }

    fn queue(&self, event: BleEvent) {
        if self.events.try_send(event).is_err() {
            error!("BLE: Event queue full, event dropped");
        }
    }
}

impl gatt_server::Server for CommandServer {
    type Event = ();

    fn on_write(&self, conn: &Connection, handle: u16, _op: WriteOp, offset: usize, data: &[u8]) -> Option<Self::Event> {
        let conn_id = conn.handle()?;

        if offset != 0 {
            debug!("BLE: Offset write ({}) on handle {} ignored", offset, handle);
            return None;
        }

        match BleEvent::written(conn_id, handle, data) {
            Ok(event) => self.queue(event),
            Err(e) => error!("BLE: Write of {} bytes rejected: {:?}", data.len(), e),
        }
        None
    }

    fn on_notify_tx_complete(&self, conn: &Connection, _count: u8) -> Option<Self::Event> {
        if let Some(conn_id) = conn.handle() {
            if self.events.try_send(BleEvent::NotifyAcked { conn_id }).is_err() {
                warn!("BLE: Event queue full, ack for {} held aside", conn_id);
                self.acks.record(conn_id);
            }
        }
        None
    }
}

/// Starts notifications through `gatt_server::notify_value`
pub struct SoftdeviceNotifier;

impl NotifyTransport for SoftdeviceNotifier {
    type Error = NotifyValueError;

    fn start_notify(&mut self, conn_id: u16, handle: u16, payload: &[u8]) -> Result<(), Self::Error> {
        let conn = Connection::from_handle(conn_id).ok_or(NotifyValueError::Disconnected)?;
        gatt_server::notify_value(&conn, handle, payload)
    }
}
