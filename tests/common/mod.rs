//! Common test utilities for the host test suite
//!
//! - In-memory NOR flash with fault injection
//! - Mock notify transport
//! - Byte sink for serial sessions
//! - Store and frame helpers

#![allow(dead_code)]

use core::convert::Infallible;

use embassy_futures::block_on;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;
use embedded_storage_async::nor_flash::{ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};

use nrf52820_kv_firmware::ble::notifications::NotifyTransport;
use nrf52820_kv_firmware::config::FLASH_PAGE_SIZE;
use nrf52820_kv_firmware::core::file::FlashFile;
use nrf52820_kv_firmware::core::protocol::{bcc, ETX, STX};
use nrf52820_kv_firmware::core::storage::KeyValueStore;

/// Slot size used by the tests (one nRF52 page)
pub const SLOT: u32 = FLASH_PAGE_SIZE;

/// Region holding both slots
pub const REGION: usize = 2 * SLOT as usize;

pub const PAGE: usize = FLASH_PAGE_SIZE as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFlashError {
    OutOfBounds,
    NotAligned,
    Injected,
}

impl NorFlashError for MemFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            MemFlashError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            MemFlashError::NotAligned => NorFlashErrorKind::NotAligned,
            MemFlashError::Injected => NorFlashErrorKind::Other,
        }
    }
}

/// NOR flash in RAM: erase sets bytes to 0xFF, writes can only clear bits
///
/// `W` is the write granularity; the nRF52 NVMC writes whole words.
pub struct MemFlash<const W: usize = 4> {
    pub data: Vec<u8>,
    /// Successful `write` calls left before every write fails
    pub writes_until_failure: Option<usize>,
    pub fail_erase: bool,
    pub write_calls: usize,
    pub erase_calls: usize,
}

impl<const W: usize> MemFlash<W> {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0xFF; size],
            writes_until_failure: None,
            fail_erase: false,
            write_calls: 0,
            erase_calls: 0,
        }
    }

    /// Let `n` more writes succeed, then fail all following ones
    pub fn fail_writes_after(&mut self, n: usize) {
        self.writes_until_failure = Some(n);
    }

    pub fn heal(&mut self) {
        self.writes_until_failure = None;
        self.fail_erase = false;
    }

    fn check(&self, offset: u32, len: usize, align: usize) -> Result<(), MemFlashError> {
        let offset = offset as usize;
        if offset % align != 0 || len % align != 0 {
            return Err(MemFlashError::NotAligned);
        }
        if offset + len > self.data.len() {
            return Err(MemFlashError::OutOfBounds);
        }
        Ok(())
    }
}

impl<const W: usize> ErrorType for MemFlash<W> {
    type Error = MemFlashError;
}

impl<const W: usize> ReadNorFlash for MemFlash<W> {
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check(offset, bytes.len(), Self::READ_SIZE)?;
        let start = offset as usize;
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl<const W: usize> NorFlash for MemFlash<W> {
    const WRITE_SIZE: usize = W;
    const ERASE_SIZE: usize = PAGE;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.erase_calls += 1;
        if self.fail_erase {
            return Err(MemFlashError::Injected);
        }
        if to < from {
            return Err(MemFlashError::OutOfBounds);
        }
        self.check(from, (to - from) as usize, Self::ERASE_SIZE)?;
        self.data[from as usize..to as usize].fill(0xFF);
        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.write_calls += 1;
        if let Some(left) = self.writes_until_failure.as_mut() {
            if *left == 0 {
                return Err(MemFlashError::Injected);
            }
            *left -= 1;
        }
        self.check(offset, bytes.len(), Self::WRITE_SIZE)?;
        let start = offset as usize;
        for (cell, &b) in self.data[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= b;
        }
        Ok(())
    }
}

pub type TestStore = KeyValueStore<MemFlash>;

pub fn blank_file() -> FlashFile<MemFlash> {
    FlashFile::new(MemFlash::new(REGION), 0, SLOT)
}

/// Initialized store over a blank region
pub fn new_store() -> TestStore {
    store_on(MemFlash::new(REGION))
}

/// Initialized store over existing flash contents
pub fn store_on(flash: MemFlash) -> TestStore {
    let mut store = KeyValueStore::new(FlashFile::new(flash, 0, SLOT));
    block_on(store.init()).expect("store init");
    store
}

pub fn shared_store() -> Mutex<NoopRawMutex, TestStore> {
    Mutex::new(new_store())
}

/// Hand the flash back, e.g. to simulate a reboot
pub fn into_flash(store: TestStore) -> MemFlash {
    store.into_inner().into_inner()
}

/// Notify transport that records every started notification
#[derive(Default)]
pub struct MockNotifier {
    pub sent: Vec<(u16, u16, Vec<u8>)>,
    pub fail: bool,
}

impl MockNotifier {
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.sent.iter().map(|(_, _, p)| p.clone()).collect()
    }
}

impl NotifyTransport for MockNotifier {
    type Error = ();

    fn start_notify(&mut self, conn_id: u16, handle: u16, payload: &[u8]) -> Result<(), Self::Error> {
        if self.fail {
            return Err(());
        }
        self.sent.push((conn_id, handle, payload.to_vec()));
        Ok(())
    }
}

/// Serial output captured into memory
#[derive(Default)]
pub struct Sink {
    pub bytes: Vec<u8>,
}

impl Sink {
    /// Output split into response lines
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.bytes)
            .split_terminator('\n')
            .map(str::to_owned)
            .collect()
    }
}

impl embedded_io_async::ErrorType for Sink {
    type Error = Infallible;
}

impl embedded_io_async::Write for Sink {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Wrap `payload` as STX payload ETX BCC
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![STX];
    out.extend_from_slice(payload);
    out.push(ETX);
    out.push(bcc(&out));
    out
}
