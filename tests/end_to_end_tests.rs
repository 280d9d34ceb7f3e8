//! Command flows through both transports against an in-memory store

mod common;

use common::*;
use embassy_futures::block_on;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;
use nrf52820_kv_firmware::ble::events::{BleEvent, ServiceHandles};
use nrf52820_kv_firmware::ble::manager::BleManager;
use nrf52820_kv_firmware::ble::notifications::PendingAcks;
use nrf52820_kv_firmware::commands::CommandDispatcher;
use nrf52820_kv_firmware::config::MAX_NOTIFY_LEN;
use nrf52820_kv_firmware::core::protocol::STX;
use nrf52820_kv_firmware::core::transport::run_line_session;

const HANDLES: ServiceHandles = ServiceHandles::with_adjacent_cccd(0x000C, 0x000E);

type Manager<'a> = BleManager<'a, NoopRawMutex, MemFlash, MockNotifier>;

type Acks = PendingAcks<NoopRawMutex>;

/// Manager plus the completions table its stack callback would fill
fn manager_with_acks(store: &Mutex<NoopRawMutex, TestStore>) -> (Manager<'_>, &'static Acks) {
    let acks: &'static Acks = Box::leak(Box::new(PendingAcks::new()));
    (BleManager::new(CommandDispatcher::new(store), MockNotifier::default(), acks), acks)
}

fn manager(store: &Mutex<NoopRawMutex, TestStore>) -> Manager<'_> {
    manager_with_acks(store).0
}

fn send(manager: &Manager<'_>, event: BleEvent) {
    block_on(manager.handle_event(event));
}

fn write(manager: &Manager<'_>, conn_id: u16, handle: u16, data: &[u8]) {
    send(manager, BleEvent::written(conn_id, handle, data).unwrap());
}

fn enable_notifications(manager: &Manager<'_>, conn_id: u16) {
    write(manager, conn_id, HANDLES.notify_cccd, &[0x01, 0x00]);
}

/// Registered service plus one subscribed connection
fn connected(manager: &Manager<'_>, conn_id: u16) {
    send(manager, BleEvent::ServiceRegistered(HANDLES));
    send(manager, BleEvent::Connected { conn_id, session: 0 });
    enable_notifications(manager, conn_id);
}

/// Send one framed command and acknowledge its notification
fn command(manager: &Manager<'_>, conn_id: u16, command: &[u8]) {
    write(manager, conn_id, HANDLES.command, &frame(command));
    send(manager, BleEvent::NotifyAcked { conn_id });
}

fn notifications(manager: &Manager<'_>) -> Vec<Vec<u8>> {
    block_on(manager.with_link(|link| link.notifications.transport().payloads()))
}

#[test]
fn test_ble_put_get_read_all() {
    let store = shared_store();
    let m = manager(&store);
    connected(&m, 0);

    command(&m, 0, b"tf1A|hello");
    command(&m, 0, b"tf1a");
    command(&m, 0, b"tf2|x");
    command(&m, 0, b"tf#");
    command(&m, 0, b"tf@");
    command(&m, 0, b"tf#");

    assert_eq!(
        notifications(&m),
        vec![
            b"OK".to_vec(),
            b"hello".to_vec(),
            b"OK".to_vec(),
            b"c$26$hello\nc$2$x".to_vec(),
            b"OK".to_vec(),
            b"OP_ERROR".to_vec(),
        ]
    );
}

#[test]
fn test_ble_responses_go_to_notify_handle() {
    let store = shared_store();
    let m = manager(&store);
    connected(&m, 5);

    command(&m, 5, b"tf#");
    let sent = block_on(m.with_link(|link| link.notifications.transport().sent.clone()));
    assert_eq!(sent, vec![(5, HANDLES.notify, b"OP_ERROR".to_vec())]);
}

#[test]
fn test_ble_fragmented_frame() {
    let store = shared_store();
    let m = manager(&store);
    connected(&m, 0);

    let wire = frame(b"tf7|split");
    for chunk in wire.chunks(3) {
        write(&m, 0, HANDLES.command, chunk);
    }
    assert_eq!(notifications(&m), vec![b"OK".to_vec()]);
}

#[test]
fn test_ble_bad_frames_get_no_response() {
    let store = shared_store();
    let m = manager(&store);
    connected(&m, 0);

    let mut corrupt = frame(b"tf1|a");
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0xFF;
    write(&m, 0, HANDLES.command, &corrupt);
    write(&m, 0, HANDLES.command, b"tf1|a");

    assert!(notifications(&m).is_empty());
}

#[test]
fn test_ble_syntax_error_is_notified() {
    let store = shared_store();
    let m = manager(&store);
    connected(&m, 0);

    command(&m, 0, b"nonsense");
    assert_eq!(notifications(&m), vec![b"SYNTAX_ERROR".to_vec()]);
}

#[test]
fn test_ble_no_response_without_cccd() {
    let store = shared_store();
    let m = manager(&store);
    send(&m, BleEvent::ServiceRegistered(HANDLES));
    send(&m, BleEvent::Connected { conn_id: 0, session: 0 });

    // Command still executes
    command(&m, 0, b"tf3|quiet");
    assert!(notifications(&m).is_empty());

    enable_notifications(&m, 0);
    command(&m, 0, b"tf3");
    assert_eq!(notifications(&m), vec![b"quiet".to_vec()]);

    write(&m, 0, HANDLES.notify_cccd, &[0x00, 0x00]);
    command(&m, 0, b"tf3");
    assert_eq!(notifications(&m).len(), 1);
}

#[test]
fn test_ble_malformed_cccd_write_is_ignored() {
    let store = shared_store();
    let m = manager(&store);
    connected(&m, 0);

    write(&m, 0, HANDLES.notify_cccd, &[0x00]);
    command(&m, 0, b"tf#");
    assert_eq!(notifications(&m), vec![b"OP_ERROR".to_vec()]);
}

#[test]
fn test_ble_writes_before_registration_are_ignored() {
    let store = shared_store();
    let m = manager(&store);
    send(&m, BleEvent::Connected { conn_id: 0, session: 0 });

    write(&m, 0, HANDLES.notify_cccd, &[0x01, 0x00]);
    write(&m, 0, HANDLES.command, &frame(b"tf1|early"));

    send(&m, BleEvent::ServiceRegistered(HANDLES));
    enable_notifications(&m, 0);
    command(&m, 0, b"tf1");

    assert_eq!(notifications(&m), vec![b"OP_ERROR".to_vec()]);
}

#[test]
fn test_ble_second_frame_waits_for_ack() {
    let store = shared_store();
    let m = manager(&store);
    connected(&m, 0);

    let mut wire = frame(b"tf1|a");
    wire.extend(frame(b"tf1"));
    write(&m, 0, HANDLES.command, &wire);

    // Both run; the second response is dropped while the first is in flight
    assert_eq!(notifications(&m), vec![b"OK".to_vec()]);
    send(&m, BleEvent::NotifyAcked { conn_id: 0 });
    command(&m, 0, b"tf1");
    assert_eq!(notifications(&m), vec![b"OK".to_vec(), b"a".to_vec()]);
}

#[test]
fn test_ble_oversized_response_is_truncated() {
    let store = shared_store();
    let m = manager(&store);
    connected(&m, 0);

    let value = vec![b'v'; 90];
    for key in [b"tf1|", b"tf2|", b"tf3|"] {
        let mut put = key.to_vec();
        put.extend_from_slice(&value);
        command(&m, 0, &put);
    }
    command(&m, 0, b"tf#");

    let mut full = Vec::new();
    for (i, key) in [b"c$1$", b"c$2$", b"c$3$"].iter().enumerate() {
        if i > 0 {
            full.push(b'\n');
        }
        full.extend_from_slice(*key);
        full.extend_from_slice(&value);
    }
    assert!(full.len() > MAX_NOTIFY_LEN);

    let sent = notifications(&m);
    assert_eq!(sent.len(), 4);
    assert_eq!(sent[..3], [b"OK".to_vec(), b"OK".to_vec(), b"OK".to_vec()]);
    assert_eq!(sent[3], full[..MAX_NOTIFY_LEN]);
}

#[test]
fn test_ble_ack_held_aside_releases_next_response() {
    // The completion missed the event queue while more writes were queued
    let store = shared_store();
    let (m, acks) = manager_with_acks(&store);
    connected(&m, 0);

    write(&m, 0, HANDLES.command, &frame(b"tf1|a"));
    acks.record(0);
    write(&m, 0, HANDLES.command, &frame(b"tf1"));
    assert_eq!(notifications(&m), vec![b"OK".to_vec(), b"a".to_vec()]);

    // Without a completion the connection stays in flight
    write(&m, 0, HANDLES.command, &frame(b"tf#"));
    assert_eq!(notifications(&m).len(), 2);
    assert!(!acks.take(0));
}

#[test]
fn test_ble_queued_ack_consumes_held_completion() {
    let store = shared_store();
    let (m, acks) = manager_with_acks(&store);
    connected(&m, 0);

    write(&m, 0, HANDLES.command, &frame(b"tf1|a"));
    acks.record(0);
    send(&m, BleEvent::NotifyAcked { conn_id: 0 });
    assert!(!acks.take(0));

    command(&m, 0, b"tf1");
    assert_eq!(notifications(&m), vec![b"OK".to_vec(), b"a".to_vec()]);
}

#[test]
fn test_ble_held_ack_is_discarded_on_reconnect() {
    let store = shared_store();
    let (m, acks) = manager_with_acks(&store);
    connected(&m, 0);

    write(&m, 0, HANDLES.command, &frame(b"tf1|a"));
    send(&m, BleEvent::Disconnected { conn_id: 0, session: 0, reason: 0x13 });
    acks.record(0);

    send(&m, BleEvent::Connected { conn_id: 0, session: 1 });
    assert!(!acks.take(0));
}

#[test]
fn test_ble_stale_disconnect_keeps_reused_handle() {
    // Handle 0 is reused before the old link's disconnect arrives
    let store = shared_store();
    let m = manager(&store);
    connected(&m, 0);
    write(&m, 0, HANDLES.command, &[STX, b't', b'f']);

    send(&m, BleEvent::Connected { conn_id: 0, session: 1 });
    send(&m, BleEvent::Disconnected { conn_id: 0, session: 0, reason: 0x08 });
    assert!(block_on(m.with_link(|link| link.registry.is_connected(0))));

    // New link starts clean and keeps working
    enable_notifications(&m, 0);
    command(&m, 0, b"tf#");
    assert_eq!(notifications(&m), vec![b"OP_ERROR".to_vec()]);

    send(&m, BleEvent::Disconnected { conn_id: 0, session: 1, reason: 0x13 });
    assert!(!block_on(m.with_link(|link| link.registry.is_connected(0))));
}

#[test]
fn test_ble_disconnect_clears_connection_state() {
    let store = shared_store();
    let m = manager(&store);
    connected(&m, 0);

    // Partial frame and subscription are lost on disconnect
    write(&m, 0, HANDLES.command, &[STX, b't', b'f']);
    send(&m, BleEvent::Disconnected { conn_id: 0, session: 0, reason: 0x13 });
    assert!(!block_on(m.with_link(|link| link.registry.is_connected(0))));

    send(&m, BleEvent::Connected { conn_id: 0, session: 1 });
    write(&m, 0, HANDLES.command, b"#\x03");
    command(&m, 0, b"tf#");
    assert!(notifications(&m).is_empty());

    enable_notifications(&m, 0);
    command(&m, 0, b"tf#");
    assert_eq!(notifications(&m), vec![b"OP_ERROR".to_vec()]);
}

#[test]
fn test_ble_connections_are_independent() {
    let store = shared_store();
    let m = manager(&store);
    connected(&m, 0);
    send(&m, BleEvent::Connected { conn_id: 1, session: 1 });
    enable_notifications(&m, 1);

    // Interleaved halves of two frames
    let a = frame(b"tf1|from0");
    let b = frame(b"tf2|from1");
    write(&m, 0, HANDLES.command, &a[..4]);
    write(&m, 1, HANDLES.command, &b[..4]);
    write(&m, 0, HANDLES.command, &a[4..]);
    write(&m, 1, HANDLES.command, &b[4..]);

    let sent = block_on(m.with_link(|link| link.notifications.transport().sent.clone()));
    assert_eq!(sent, vec![(0, HANDLES.notify, b"OK".to_vec()), (1, HANDLES.notify, b"OK".to_vec())]);

    send(&m, BleEvent::NotifyAcked { conn_id: 1 });
    command(&m, 1, b"tf1");
    assert_eq!(notifications(&m).last().unwrap(), b"from0");
}

#[test]
fn test_ble_and_uart_share_one_store() {
    let store = shared_store();
    let m = manager(&store);
    connected(&m, 0);
    command(&m, 0, b"tfBEEF|ble");

    let dispatcher = CommandDispatcher::new(&store);
    let mut rx: &[u8] = b"tfbeef\n";
    let mut tx = Sink::default();
    block_on(run_line_session(&mut rx, &mut tx, &dispatcher)).unwrap();
    assert_eq!(tx.lines(), vec!["ble"]);
}

fn uart(store: &Mutex<NoopRawMutex, TestStore>, input: &[u8]) -> Vec<String> {
    let dispatcher = CommandDispatcher::new(store);
    let mut rx = input;
    let mut tx = Sink::default();
    block_on(run_line_session(&mut rx, &mut tx, &dispatcher)).unwrap();
    tx.lines()
}

#[test]
fn test_uart_session() {
    let store = shared_store();
    let lines = uart(&store, b"tf1|one\ntf2|two\ntf#\ntf@1\ntf1\ntf2\n");
    assert_eq!(lines, vec!["OK", "OK", "c$1$one", "c$2$two", "OK", "OP_ERROR", "two"]);
}

#[test]
fn test_uart_crlf_and_blank_lines() {
    let store = shared_store();
    let lines = uart(&store, b"tf9|v\r\n\r\n\ntf9\r\n");
    assert_eq!(lines, vec!["OK", "SYNTAX_ERROR", "SYNTAX_ERROR", "v"]);
}

#[test]
fn test_uart_overlong_line() {
    let store = shared_store();
    let mut input = b"tf1|".to_vec();
    input.extend(std::iter::repeat(b'x').take(400));
    input.extend_from_slice(b"\ntf1\n");

    assert_eq!(uart(&store, &input), vec!["SYNTAX_ERROR", "OP_ERROR"]);
}

#[test]
fn test_uart_unterminated_tail_is_not_executed() {
    let store = shared_store();
    assert_eq!(uart(&store, b"tf1|a\ntf2|b"), vec!["OK"]);
    assert_eq!(uart(&store, b"tf#\n"), vec!["c$1$a"]);
}
