#![no_std]
#![no_main]

use defmt::{error, info, unwrap, warn};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_nrf::buffered_uarte::{self, BufferedUarte};
use embassy_nrf::gpio::{Level, Output, OutputDrive};
use embassy_nrf::interrupt::{self, InterruptExt};
use embassy_nrf::{bind_interrupts, peripherals, uarte};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Timer};
use nrf_softdevice::ble::advertisement_builder::{Flag, LegacyAdvertisementBuilder, LegacyAdvertisementPayload};
use nrf_softdevice::ble::{gatt_server, peripheral, Connection};
use nrf_softdevice::{Config as SdConfig, Flash, Softdevice};
use panic_probe as _;
use static_cell::StaticCell;

use nrf52820_kv_firmware::ble::events::BleEvent;
use nrf52820_kv_firmware::ble::manager::BleManager;
use nrf52820_kv_firmware::ble::notifications::PendingAcks;
use nrf52820_kv_firmware::ble::softdevice::{CommandServer, SoftdeviceNotifier};
use nrf52820_kv_firmware::commands::CommandDispatcher;
use nrf52820_kv_firmware::config::{
    ATT_MTU, BLE_EVENT_QUEUE, BLINK_PERIOD_MS, DEVICE_NAME, SOFTDEVICE_LINKS, STORAGE_REGION_START,
    STORAGE_SLOT_SIZE, UART_BAUD,
};
use nrf52820_kv_firmware::core::file::FlashFile;
use nrf52820_kv_firmware::core::storage::KeyValueStore;
use nrf52820_kv_firmware::core::transport::run_line_session;

type SharedStore = Mutex<CriticalSectionRawMutex, KeyValueStore<Flash>>;
type Manager = BleManager<'static, CriticalSectionRawMutex, Flash, SoftdeviceNotifier>;

const CONNECTION_TASKS: usize = SOFTDEVICE_LINKS as usize;

bind_interrupts!(struct Irqs {
    UARTE0_UART0 => buffered_uarte::InterruptHandler<peripherals::UARTE0>;
});

/// SoftDevice callbacks to the BLE event task
static BLE_EVENTS: Channel<CriticalSectionRawMutex, BleEvent, BLE_EVENT_QUEUE> = Channel::new();

static ACKS: StaticCell<PendingAcks<CriticalSectionRawMutex>> = StaticCell::new();
static STORE: StaticCell<SharedStore> = StaticCell::new();
static MANAGER: StaticCell<Manager> = StaticCell::new();
static SERVER: StaticCell<CommandServer> = StaticCell::new();
static UART_RX_BUF: StaticCell<[u8; 256]> = StaticCell::new();
static UART_TX_BUF: StaticCell<[u8; 256]> = StaticCell::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Starting nRF52820 key/value firmware");

    // Keep clear of the SoftDevice reserved priorities (0, 1, 4)
    let mut nrf_config = embassy_nrf::config::Config::default();
    nrf_config.gpiote_interrupt_priority = interrupt::Priority::P2;
    nrf_config.time_interrupt_priority = interrupt::Priority::P2;
    let p = embassy_nrf::init(nrf_config);
    interrupt::UARTE0_UART0.set_priority(interrupt::Priority::P3);

    let sd_config = SdConfig {
        clock: Some(nrf_softdevice::raw::nrf_clock_lf_cfg_t {
            source: nrf_softdevice::raw::NRF_CLOCK_LF_SRC_RC as u8,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy: nrf_softdevice::raw::NRF_CLOCK_LF_ACCURACY_500_PPM as u8,
        }),
        conn_gap: Some(nrf_softdevice::raw::ble_gap_conn_cfg_t {
            conn_count: SOFTDEVICE_LINKS,
            event_length: 24,
        }),
        conn_gatt: Some(nrf_softdevice::raw::ble_gatt_conn_cfg_t { att_mtu: ATT_MTU }),
        gatts_attr_tab_size: Some(nrf_softdevice::raw::ble_gatts_cfg_attr_tab_size_t {
            attr_tab_size: 1408,
        }),
        gap_role_count: Some(nrf_softdevice::raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: SOFTDEVICE_LINKS,
            central_role_count: 0,
            central_sec_count: 0,
            _bitfield_1: Default::default(),
        }),
        ..Default::default()
    };

    let sd = Softdevice::enable(&sd_config);
    info!("SoftDevice enabled");

    let acks: &'static PendingAcks<CriticalSectionRawMutex> = ACKS.init(PendingAcks::new());

    // Service registration needs exclusive access before the SoftDevice runs
    let server = match CommandServer::new(sd, BLE_EVENTS.sender(), acks) {
        Ok(server) => SERVER.init(server),
        Err(e) => defmt::panic!("Failed to register command service: {:?}", defmt::Debug2Format(&e)),
    };
    let sd: &'static Softdevice = sd;
    unwrap!(spawner.spawn(softdevice_task(sd)));

    // Flash operations complete through SoftDevice events, so the store
    // is initialized after the SoftDevice task is running
    let mut store = KeyValueStore::new(FlashFile::new(Flash::take(sd), STORAGE_REGION_START, STORAGE_SLOT_SIZE));
    if let Err(e) = store.init().await {
        error!("Store unavailable, storage commands will fail: {:?}", e);
    }
    let store: &'static SharedStore = STORE.init(Mutex::new(store));

    let manager: &'static Manager =
        MANAGER.init(BleManager::new(CommandDispatcher::new(store), SoftdeviceNotifier, acks));
    unwrap!(spawner.spawn(ble_event_task(manager)));

    let mut uart_config = uarte::Config::default();
    uart_config.parity = uarte::Parity::EXCLUDED;
    uart_config.baudrate = unwrap!(baudrate(UART_BAUD));
    let uart = BufferedUarte::new(
        p.UARTE0,
        p.TIMER1,
        p.PPI_CH0,
        p.PPI_CH1,
        p.PPI_GROUP0,
        p.P0_05,
        p.P0_06,
        Irqs,
        uart_config,
        UART_RX_BUF.init([0; 256]),
        UART_TX_BUF.init([0; 256]),
    );
    unwrap!(spawner.spawn(uart_task(uart, store)));

    let led = Output::new(p.P0_04, Level::High, OutputDrive::Standard);
    unwrap!(spawner.spawn(blink_task(led)));

    unwrap!(spawner.spawn(advertising_task(sd, server, spawner)));

    info!("System initialized");
}

fn baudrate(baud: u32) -> Option<uarte::Baudrate> {
    match baud {
        9_600 => Some(uarte::Baudrate::BAUD9600),
        57_600 => Some(uarte::Baudrate::BAUD57600),
        115_200 => Some(uarte::Baudrate::BAUD115200),
        _ => None,
    }
}

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

/// Advertise, hand each connection to a connection task, repeat
#[embassy_executor::task]
async fn advertising_task(sd: &'static Softdevice, server: &'static CommandServer, spawner: Spawner) {
    static ADV_DATA: LegacyAdvertisementPayload = LegacyAdvertisementBuilder::new()
        .flags(&[Flag::GeneralDiscovery, Flag::LE_Only])
        .full_name(DEVICE_NAME)
        .build();

    static SCAN_DATA: LegacyAdvertisementPayload = LegacyAdvertisementBuilder::new().build();

    let mut next_session: u32 = 0;
    loop {
        let config = peripheral::Config::default();
        let adv = peripheral::ConnectableAdvertisement::ScannableUndirected {
            adv_data: &ADV_DATA,
            scan_data: &SCAN_DATA,
        };

        let conn = match peripheral::advertise_connectable(sd, adv, &config).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("BLE advertising failed: {:?}", defmt::Debug2Format(&e));
                Timer::after(Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some(conn_id) = conn.handle() else {
            continue;
        };
        let session = next_session;
        next_session = next_session.wrapping_add(1);
        BLE_EVENTS.send(BleEvent::Connected { conn_id, session }).await;

        if spawner.spawn(connection_task(conn, server, session)).is_err() {
            // Dropping the connection disconnects the peer
            warn!("No connection task free for {}", conn_id);
            BLE_EVENTS.send(BleEvent::Disconnected { conn_id, session, reason: 0 }).await;
        }
    }
}

#[embassy_executor::task(pool_size = CONNECTION_TASKS)]
async fn connection_task(conn: Connection, server: &'static CommandServer, session: u32) {
    let conn_id = conn.handle().unwrap_or(0);
    let e = gatt_server::run(&conn, server, |_| {}).await;
    info!("Connection {} closed: {:?}", conn_id, defmt::Debug2Format(&e));

    // gatt_server::run does not report the HCI reason
    BLE_EVENTS.send(BleEvent::Disconnected { conn_id, session, reason: 0 }).await;
}

#[embassy_executor::task]
async fn ble_event_task(manager: &'static Manager) {
    info!("BLE event task started");
    loop {
        let event = BLE_EVENTS.receive().await;
        manager.handle_event(event).await;
    }
}

#[embassy_executor::task]
async fn uart_task(uart: BufferedUarte<'static>, store: &'static SharedStore) {
    let dispatcher = CommandDispatcher::new(store);
    let (mut rx, mut tx) = uart.split();

    loop {
        match run_line_session(&mut rx, &mut tx, &dispatcher).await {
            Ok(()) => info!("UART session ended"),
            Err(e) => error!("UART session failed: {:?}", e),
        }
        Timer::after(Duration::from_millis(100)).await;
    }
}

#[embassy_executor::task]
async fn blink_task(mut led: Output<'static>) {
    loop {
        led.toggle();
        Timer::after(Duration::from_millis(BLINK_PERIOD_MS)).await;
    }
}
