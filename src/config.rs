//! Firmware Configuration
//!
//! Compile-time configuration for the key/value firmware. Capacities and
//! buffer bounds live here so the core modules and the device adapter agree
//! on them.

/// Advertised device name
pub const DEVICE_NAME: &str = "NRF52_KV";

/// Primary service UUID (16-bit)
pub const SERVICE_UUID: u16 = 0x00FF;

/// Command (write) characteristic UUID
pub const CHAR_UUID_COMMAND: u16 = 0xFF01;

/// Response (notify) characteristic UUID
pub const CHAR_UUID_NOTIFY: u16 = 0xFF02;

/// Maximum number of peers tracked by the connection registry
pub const MAX_CONNECTIONS: usize = 9;

/// Simultaneous peripheral links configured in the SoftDevice
pub const SOFTDEVICE_LINKS: u8 = 2;

/// ATT MTU requested from the SoftDevice
pub const ATT_MTU: u16 = 247;

/// Largest notification payload (ATT MTU minus opcode and handle)
pub const MAX_NOTIFY_LEN: usize = (ATT_MTU - 3) as usize;

/// Largest single GATT write accepted on the command characteristic
pub const MAX_WRITE_LEN: usize = (ATT_MTU - 3) as usize;

/// Reassembly buffer bound per connection (STX, payload, ETX)
pub const MAX_FRAME_LEN: usize = 256;

/// Frames dispatched from a single GATT write; extra frames are dropped
pub const MAX_FRAMES_PER_WRITE: usize = 4;

/// Longest UART command line, excluding the terminator
pub const MAX_LINE_LEN: usize = 256;

/// Largest flash file content (the whole key/value store)
pub const MAX_FILE_SIZE: usize = 2048;

/// Flash page size on the nRF52 series
pub const FLASH_PAGE_SIZE: u32 = 4096;

/// Start of the reserved storage region (last two pages of the 256 KB flash)
pub const STORAGE_REGION_START: u32 = 0x0003_E000;

/// Size of one file slot; the region holds two
pub const STORAGE_SLOT_SIZE: u32 = FLASH_PAGE_SIZE;

/// UART baud rate (8-N-1, no flow control)
pub const UART_BAUD: u32 = 115_200;

/// Status LED toggle period
pub const BLINK_PERIOD_MS: u64 = 500;

/// BLE event channel depth between SoftDevice callbacks and the event task
pub const BLE_EVENT_QUEUE: usize = 8;
