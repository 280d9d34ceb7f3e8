//! Flash File
//!
//! Keeps one logical file in a reserved flash region. The region is split
//! into two equal slots; every write goes to the slot that does not hold the
//! current content and its header is programmed last, so the previous
//! content stays authoritative until the new one is complete.
//!
//! Slot layout (little-endian):
//! - `[0..4]`   magic
//! - `[4..8]`   sequence number (newest valid slot wins)
//! - `[8..12]`  content length
//! - `[12..16]` CRC-32 of the content
//! - `[16..]`   content

use crc::{Crc, CRC_32_ISO_HDLC};
use embedded_storage_async::nor_flash::NorFlash;
use heapless::Vec;

use crate::config::MAX_FILE_SIZE;

/// Slot header length in bytes
pub const HEADER_LEN: usize = 16;

/// Marks a programmed slot header ("KVF1")
const FILE_MAGIC: u32 = 0x3146_564B;

/// Transfer granularity for flash reads and writes
const CHUNK_LEN: usize = 64;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Whole-file buffer
pub type FileContents = Vec<u8, MAX_FILE_SIZE>;

/// Storage errors shared by the flash file and the key/value store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// Region could not be mounted, or the store failed to initialize
    Unavailable,
    /// No valid slot holds the file
    Missing,
    /// Content does not match its checksum
    Corrupted,
    /// Content would exceed the file capacity
    Full,
    /// Value cannot be stored as a single line
    InvalidRecord,
    /// Flash driver reported an error
    Io,
}

/// Flash drivers may require word-aligned source buffers
#[repr(C, align(4))]
struct Chunk([u8; CHUNK_LEN]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotHeader {
    sequence: u32,
    len: u32,
    crc: u32,
}

impl SlotHeader {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.len.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.crc.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        if bytes.len() < HEADER_LEN || word(0) != FILE_MAGIC {
            return None;
        }

        let header = Self {
            sequence: word(4),
            len: word(8),
            crc: word(12),
        };

        if header.len as usize > MAX_FILE_SIZE {
            return None;
        }

        Some(header)
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveSlot {
    index: usize,
    header: SlotHeader,
}

/// `a` was written after `b`, tolerating sequence wrap-around
fn is_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

fn round_up(len: usize, granularity: usize) -> usize {
    len.div_ceil(granularity) * granularity
}

/// Single file stored in two alternating flash slots
pub struct FlashFile<F> {
    flash: F,
    start: u32,
    slot_size: u32,
    mounted: bool,
    active: Option<ActiveSlot>,
}

impl<F: NorFlash> FlashFile<F> {
    /// Create a file over `[start, start + 2 * slot_size)`; nothing is read until `mount`
    pub const fn new(flash: F, start: u32, slot_size: u32) -> Self {
        Self {
            flash,
            start,
            slot_size,
            mounted: false,
            active: None,
        }
    }

    /// Give the flash driver back
    pub fn into_inner(self) -> F {
        self.flash
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Whether a valid copy of the file exists
    pub fn exists(&self) -> bool {
        self.mounted && self.active.is_some()
    }

    /// Sequence number of the current content, if any
    pub fn sequence(&self) -> Option<u32> {
        self.active.map(|slot| slot.header.sequence)
    }

    /// Length of the current content, if any
    pub fn len(&self) -> Option<usize> {
        self.active.map(|slot| slot.header.len as usize)
    }

    fn slot_offset(&self, index: usize) -> u32 {
        self.start + index as u32 * self.slot_size
    }

    fn geometry_is_valid(&self) -> bool {
        let erase = F::ERASE_SIZE as u32;
        let write = F::WRITE_SIZE;
        let read = F::READ_SIZE;

        if erase == 0 || write == 0 || read == 0 {
            return false;
        }

        let region_end = (self.start as usize).checked_add(2 * self.slot_size as usize);

        self.start % erase == 0
            && self.slot_size % erase == 0
            && CHUNK_LEN % write == 0
            && HEADER_LEN % write == 0
            && CHUNK_LEN % read == 0
            && HEADER_LEN % read == 0
            && self.slot_size as usize >= HEADER_LEN + round_up(MAX_FILE_SIZE, CHUNK_LEN)
            && region_end.is_some_and(|end| end <= self.flash.capacity())
    }

    /// Validate the region and locate the newest valid slot
    pub async fn mount(&mut self) -> Result<(), StorageError> {
        if !self.geometry_is_valid() {
            error!(
                "FLASH: Region 0x{:x} (+2x{}) does not fit the flash geometry",
                self.start,
                self.slot_size
            );
            self.mounted = false;
            return Err(StorageError::Unavailable);
        }

        self.active = self.scan().await?;
        self.mounted = true;

        match self.active {
            Some(slot) => debug!(
                "FLASH: Mounted slot {} (sequence {}, {} bytes)",
                slot.index,
                slot.header.sequence,
                slot.header.len
            ),
            None => debug!("FLASH: Mounted empty region"),
        }

        Ok(())
    }

    /// Create an empty file if none exists
    pub async fn create(&mut self) -> Result<(), StorageError> {
        self.ensure_mounted()?;
        if self.active.is_some() {
            return Ok(());
        }
        self.write(&[]).await
    }

    /// Load the whole file into `out`
    pub async fn read(&mut self, out: &mut FileContents) -> Result<(), StorageError> {
        self.ensure_mounted()?;
        let slot = self.active.ok_or(StorageError::Missing)?;

        let offset = self.slot_offset(slot.index) + HEADER_LEN as u32;
        self.read_into(offset, slot.header.len as usize, out).await?;

        if CRC32.checksum(out) != slot.header.crc {
            error!("FLASH: Slot {} content failed CRC check", slot.index);
            out.clear();
            return Err(StorageError::Corrupted);
        }

        Ok(())
    }

    /// Replace the whole file with `data`
    ///
    /// The inactive slot is erased and programmed, header last. Until the
    /// header is written the previous content remains the file.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.ensure_mounted()?;
        if data.len() > MAX_FILE_SIZE {
            return Err(StorageError::Full);
        }

        let target = self.active.map_or(0, |slot| 1 - slot.index);
        let sequence = self.active.map_or(1, |slot| slot.header.sequence.wrapping_add(1));
        let offset = self.slot_offset(target);

        self.flash
            .erase(offset, offset + self.slot_size)
            .await
            .map_err(|_| StorageError::Io)?;

        self.program(offset + HEADER_LEN as u32, data).await?;

        let header = SlotHeader {
            sequence,
            len: data.len() as u32,
            crc: CRC32.checksum(data),
        };
        self.program(offset, &header.encode()).await?;

        self.active = Some(ActiveSlot { index: target, header });
        trace!("FLASH: Committed {} bytes to slot {} (sequence {})", data.len(), target, sequence);
        Ok(())
    }

    /// Erase both slots; the file no longer exists afterwards
    pub async fn remove(&mut self) -> Result<(), StorageError> {
        self.ensure_mounted()?;

        // Inactive slot first so a failure leaves the current content in place
        let first = self.active.map_or(0, |slot| 1 - slot.index);
        for index in [first, 1 - first] {
            let offset = self.slot_offset(index);
            if self.flash.erase(offset, offset + self.slot_size).await.is_err() {
                error!("FLASH: Failed to erase slot {}", index);
                self.active = self.scan().await.unwrap_or(None);
                return Err(StorageError::Io);
            }
        }

        self.active = None;
        Ok(())
    }

    fn ensure_mounted(&self) -> Result<(), StorageError> {
        if self.mounted {
            Ok(())
        } else {
            Err(StorageError::Unavailable)
        }
    }

    async fn scan(&mut self) -> Result<Option<ActiveSlot>, StorageError> {
        let mut newest: Option<ActiveSlot> = None;

        for index in 0..2 {
            let mut raw = Chunk([0; CHUNK_LEN]);
            self.flash
                .read(self.slot_offset(index), &mut raw.0[..HEADER_LEN])
                .await
                .map_err(|_| StorageError::Io)?;

            let Some(header) = SlotHeader::decode(&raw.0[..HEADER_LEN]) else {
                continue;
            };

            if !self.content_matches(index, &header).await? {
                warn!("FLASH: Slot {} has a header but its content fails CRC", index);
                continue;
            }

            newest = match newest {
                Some(current) if !is_newer(header.sequence, current.header.sequence) => Some(current),
                _ => Some(ActiveSlot { index, header }),
            };
        }

        Ok(newest)
    }

    async fn content_matches(&mut self, index: usize, header: &SlotHeader) -> Result<bool, StorageError> {
        let offset = self.slot_offset(index) + HEADER_LEN as u32;
        let len = header.len as usize;
        let mut digest = CRC32.digest();
        let mut chunk = Chunk([0; CHUNK_LEN]);
        let mut done = 0;

        while done < len {
            let take = (len - done).min(CHUNK_LEN);
            self.flash
                .read(offset + done as u32, &mut chunk.0[..round_up(take, F::READ_SIZE)])
                .await
                .map_err(|_| StorageError::Io)?;
            digest.update(&chunk.0[..take]);
            done += take;
        }

        Ok(digest.finalize() == header.crc)
    }

    async fn read_into(&mut self, offset: u32, len: usize, out: &mut FileContents) -> Result<(), StorageError> {
        out.clear();
        let mut chunk = Chunk([0; CHUNK_LEN]);
        let mut done = 0;

        while done < len {
            let take = (len - done).min(CHUNK_LEN);
            self.flash
                .read(offset + done as u32, &mut chunk.0[..round_up(take, F::READ_SIZE)])
                .await
                .map_err(|_| StorageError::Io)?;
            out.extend_from_slice(&chunk.0[..take])
                .map_err(|_| StorageError::Full)?;
            done += take;
        }

        Ok(())
    }

    async fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let mut chunk = Chunk([0xFF; CHUNK_LEN]);
        let mut done = 0;

        while done < data.len() {
            let take = (data.len() - done).min(CHUNK_LEN);
            let padded = round_up(take, F::WRITE_SIZE);
            chunk.0[..take].copy_from_slice(&data[done..done + take]);
            chunk.0[take..padded].fill(0xFF);

            if self.flash.write(offset + done as u32, &chunk.0[..padded]).await.is_err() {
                error!("FLASH: Program at 0x{:x} failed", offset + done as u32);
                return Err(StorageError::Io);
            }
            done += take;
        }

        Ok(())
    }
}
