//! Flash Store Commands (`tf` namespace)
//!
//! - `@`          delete every record
//! - `@<hex>`     delete one record
//! - `#`          read all records
//! - `<hex>|<v>`  store `v` under the key
//! - `<hex>`      read one record

use embedded_storage_async::nor_flash::NorFlash;

use crate::commands::{CommandError, Response};
use crate::core::storage::{parse_hex_key, Key, KeyValueStore};

const DELETE_MARKER: u8 = b'@';
const READ_ALL_MARKER: &[u8] = b"#";
const PUT_SEPARATOR: u8 = b'|';

/// Parsed storage command borrowing from the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashCommand<'a> {
    DeleteAll,
    DeleteKey(Key),
    ReadAll,
    Put { key: Key, value: &'a [u8] },
    Get(Key),
}

impl<'a> FlashCommand<'a> {
    /// Parse the payload following `tf`
    pub fn parse(payload: &'a [u8]) -> Result<Self, CommandError> {
        match payload {
            [] => Err(CommandError::Syntax),
            [DELETE_MARKER] => Ok(Self::DeleteAll),
            [DELETE_MARKER, key @ ..] => parse_hex_key(key)
                .map(Self::DeleteKey)
                .ok_or(CommandError::Syntax),
            READ_ALL_MARKER => Ok(Self::ReadAll),
            _ => match payload.iter().position(|&b| b == PUT_SEPARATOR) {
                Some(split) => {
                    let key = parse_hex_key(&payload[..split]).ok_or(CommandError::Syntax)?;
                    let value = &payload[split + 1..];
                    if value.is_empty() || value.iter().any(|&b| b == b'\r' || b == b'\n') {
                        return Err(CommandError::Syntax);
                    }
                    Ok(Self::Put { key, value })
                }
                None => parse_hex_key(payload).map(Self::Get).ok_or(CommandError::Syntax),
            },
        }
    }
}

/// Run a parsed command against the store
pub async fn execute<F: NorFlash>(
    command: FlashCommand<'_>,
    store: &mut KeyValueStore<F>,
) -> Result<Response, CommandError> {
    match command {
        FlashCommand::DeleteAll => {
            store.delete_all().await?;
            Ok(Response::Ok)
        }
        FlashCommand::DeleteKey(key) => {
            if store.delete_by_key(key).await? {
                Ok(Response::Ok)
            } else {
                debug!("CMD: Delete of absent key {}", key);
                Ok(Response::OpError)
            }
        }
        FlashCommand::ReadAll => {
            let all = store.get_all().await?;
            if all.is_empty() {
                Ok(Response::OpError)
            } else {
                Ok(Response::Payload(all))
            }
        }
        FlashCommand::Put { key, value } => {
            store.put(key, value).await?;
            Ok(Response::Ok)
        }
        FlashCommand::Get(key) => match store.get(key).await? {
            Some(value) if !value.is_empty() => Ok(Response::Payload(value)),
            _ => Ok(Response::OpError),
        },
    }
}
