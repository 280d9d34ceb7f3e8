//! Key/Value Store
//!
//! Records live in the flash file as newline-terminated lines of the form
//! `c$<key>$<value>`, where `<key>` is the decimal rendering of the key.
//! Every mutation loads the whole file, edits it in one buffer and writes
//! it back in full.

use core::fmt::Write as _;
use core::ops::Range;

use embedded_storage_async::nor_flash::NorFlash;
use heapless::String;

pub use crate::core::file::{FileContents, StorageError};
use crate::core::file::FlashFile;

/// Record key
pub type Key = u32;

/// First byte of every record line
pub const RECORD_MARKER: u8 = b'c';

/// Separates marker, key and value
pub const RECORD_DELIMITER: u8 = b'$';

const LINE_END: u8 = b'\n';

/// `c$` + up to ten decimal digits + `$`
type RecordPrefix = String<16>;

/// Parse a case-insensitive hexadecimal key; `None` on empty, non-hex or overflow
pub fn parse_hex_key(text: &[u8]) -> Option<Key> {
    if text.is_empty() {
        return None;
    }

    text.iter().try_fold(0 as Key, |acc, &byte| {
        let digit = (byte as char).to_digit(16)?;
        acc.checked_mul(16)?.checked_add(digit)
    })
}

fn record_prefix(key: Key) -> RecordPrefix {
    let mut prefix = RecordPrefix::new();
    // Capacity covers the longest u32
    let _ = write!(
        prefix,
        "{}{}{}{}",
        RECORD_MARKER as char,
        RECORD_DELIMITER as char,
        key,
        RECORD_DELIMITER as char
    );
    prefix
}

fn validate_value(value: &[u8]) -> Result<(), StorageError> {
    if value.is_empty() || value.iter().any(|&b| b == b'\n' || b == b'\r') {
        return Err(StorageError::InvalidRecord);
    }
    Ok(())
}

/// Byte positions of one record line inside the file contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordSpan {
    line_start: usize,
    value_start: usize,
    line_end: usize,
}

fn find_record(content: &[u8], prefix: &[u8]) -> Option<RecordSpan> {
    let mut start = 0;

    while start < content.len() {
        let end = content[start..]
            .iter()
            .position(|&b| b == LINE_END)
            .map_or(content.len(), |p| start + p);

        if content[start..end].starts_with(prefix) {
            return Some(RecordSpan {
                line_start: start,
                value_start: start + prefix.len(),
                line_end: end,
            });
        }

        start = end + 1;
    }

    None
}

/// Replace `range` of `buf` with `with`, shifting the tail in place
fn splice(buf: &mut FileContents, range: Range<usize>, with: &[u8]) -> Result<(), StorageError> {
    let old_len = buf.len();
    let removed = range.end - range.start;
    let new_len = old_len - removed + with.len();

    if new_len > buf.capacity() {
        return Err(StorageError::Full);
    }

    if with.len() > removed {
        buf.resize(new_len, 0).map_err(|_| StorageError::Full)?;
        buf.copy_within(range.end..old_len, range.start + with.len());
    } else {
        buf.copy_within(range.end..old_len, range.start + with.len());
        buf.truncate(new_len);
    }

    buf[range.start..range.start + with.len()].copy_from_slice(with);
    Ok(())
}

/// Persistent store of `Key` to single-line values
pub struct KeyValueStore<F> {
    file: FlashFile<F>,
    scratch: FileContents,
}

impl<F: NorFlash> KeyValueStore<F> {
    pub const fn new(file: FlashFile<F>) -> Self {
        Self {
            file,
            scratch: FileContents::new(),
        }
    }

    /// Give the flash file back
    pub fn into_inner(self) -> FlashFile<F> {
        self.file
    }

    /// Mount the file and create it empty when absent
    ///
    /// On failure the store stays unusable and every operation reports
    /// `StorageError::Unavailable`.
    pub async fn init(&mut self) -> Result<(), StorageError> {
        if let Err(e) = self.file.mount().await {
            error!("STORE: Mount failed: {:?}", e);
            return Err(StorageError::Unavailable);
        }

        if !self.file.exists() {
            if let Err(e) = self.file.create().await {
                error!("STORE: Could not create store file: {:?}", e);
                return Err(StorageError::Unavailable);
            }
            info!("STORE: Created empty store");
        }

        info!("STORE: Ready ({} bytes)", self.file.len().unwrap_or(0));
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.file.is_mounted()
    }

    /// Insert or replace the value for `key`
    pub async fn put(&mut self, key: Key, value: &[u8]) -> Result<(), StorageError> {
        validate_value(value)?;
        self.load().await?;

        let prefix = record_prefix(key);
        match find_record(&self.scratch, prefix.as_bytes()) {
            Some(span) => splice(&mut self.scratch, span.value_start..span.line_end, value)?,
            None => {
                let needs_break = self.scratch.last().is_some_and(|&b| b != LINE_END);
                let added = usize::from(needs_break) + prefix.len() + value.len() + 1;
                if self.scratch.len() + added > self.scratch.capacity() {
                    return Err(StorageError::Full);
                }
                if needs_break {
                    self.scratch.push(LINE_END).map_err(|_| StorageError::Full)?;
                }
                self.scratch
                    .extend_from_slice(prefix.as_bytes())
                    .map_err(|_| StorageError::Full)?;
                self.scratch.extend_from_slice(value).map_err(|_| StorageError::Full)?;
                self.scratch.push(LINE_END).map_err(|_| StorageError::Full)?;
            }
        }

        self.file.write(&self.scratch).await?;
        debug!("STORE: Put key {} ({} bytes)", key, value.len());
        Ok(())
    }

    /// Value of the first record for `key`
    pub async fn get(&mut self, key: Key) -> Result<Option<FileContents>, StorageError> {
        self.load().await?;

        let prefix = record_prefix(key);
        let Some(span) = find_record(&self.scratch, prefix.as_bytes()) else {
            return Ok(None);
        };

        let mut value = FileContents::new();
        value
            .extend_from_slice(&self.scratch[span.value_start..span.line_end])
            .map_err(|_| StorageError::Full)?;
        Ok(Some(value))
    }

    /// All non-empty lines joined by `\n`, without a trailing terminator
    pub async fn get_all(&mut self) -> Result<FileContents, StorageError> {
        self.load().await?;

        let mut out = FileContents::new();
        for line in self.scratch.split(|&b| b == LINE_END).filter(|line| !line.is_empty()) {
            if !out.is_empty() {
                out.push(LINE_END).map_err(|_| StorageError::Full)?;
            }
            out.extend_from_slice(line).map_err(|_| StorageError::Full)?;
        }

        Ok(out)
    }

    /// Drop every record, leaving an empty store
    pub async fn delete_all(&mut self) -> Result<(), StorageError> {
        if !self.file.is_mounted() {
            return Err(StorageError::Unavailable);
        }

        self.file.remove().await?;
        self.file.create().await?;
        info!("STORE: All records deleted");
        Ok(())
    }

    /// Remove the first record for `key`; `Ok(false)` if there was none
    pub async fn delete_by_key(&mut self, key: Key) -> Result<bool, StorageError> {
        self.load().await?;

        let prefix = record_prefix(key);
        let Some(span) = find_record(&self.scratch, prefix.as_bytes()) else {
            return Ok(false);
        };

        let line_end = (span.line_end + 1).min(self.scratch.len());
        splice(&mut self.scratch, span.line_start..line_end, &[])?;

        self.file.write(&self.scratch).await?;
        debug!("STORE: Deleted key {}", key);
        Ok(true)
    }

    /// Read the file into the scratch buffer; a missing file reads as empty
    async fn load(&mut self) -> Result<(), StorageError> {
        match self.file.read(&mut self.scratch).await {
            Ok(()) => Ok(()),
            Err(StorageError::Missing) => {
                self.scratch.clear();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
