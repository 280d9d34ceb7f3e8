//! Command Processing Module
//!
//! Commands are ASCII strings received over UART or BLE. The first byte
//! selects a namespace and the second a sub-namespace; the remainder is
//! handed to that namespace's handler. Every input maps to exactly one
//! `Response`.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embedded_storage_async::nor_flash::NorFlash;

use crate::core::storage::{FileContents, KeyValueStore, StorageError};

pub mod flash;

/// Status text for a successful operation without payload
pub const STATUS_OK: &[u8] = b"OK";
/// Status text for unparseable commands
pub const STATUS_SYNTAX_ERROR: &[u8] = b"SYNTAX_ERROR";
/// Status text for well-formed commands that failed
pub const STATUS_OP_ERROR: &[u8] = b"OP_ERROR";

/// Command processing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// Input does not match the command grammar
    Syntax,
    /// Storage operation failed
    Operation(StorageError),
}

impl From<StorageError> for CommandError {
    fn from(err: StorageError) -> Self {
        CommandError::Operation(err)
    }
}

/// Reply to a single command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    SyntaxError,
    OpError,
    /// Data returned verbatim
    Payload(FileContents),
}

impl Response {
    /// Bytes sent back to the peer
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Response::Ok => STATUS_OK,
            Response::SyntaxError => STATUS_SYNTAX_ERROR,
            Response::OpError => STATUS_OP_ERROR,
            Response::Payload(data) => data,
        }
    }
}

impl From<CommandError> for Response {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Syntax => Response::SyntaxError,
            CommandError::Operation(_) => Response::OpError,
        }
    }
}

/// Top-level command namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Namespace {
    /// `t`: test and maintenance commands
    Test,
}

impl Namespace {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b't' => Some(Self::Test),
            _ => None,
        }
    }
}

/// Sub-namespaces below `t`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TestCommand {
    /// `f`: key/value store
    Flash,
}

impl TestCommand {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'f' => Some(Self::Flash),
            _ => None,
        }
    }
}

fn is_padding(byte: &u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n')
}

/// Strip leading and trailing spaces, tabs, CR and LF
pub fn trim(raw: &[u8]) -> &[u8] {
    let start = raw.iter().position(|b| !is_padding(b)).unwrap_or(raw.len());
    let end = raw.iter().rposition(|b| !is_padding(b)).map_or(start, |p| p + 1);
    &raw[start..end]
}

/// Routes raw command bytes to their handler
///
/// Shared by every transport; the store is locked for the duration of one
/// command.
pub struct CommandDispatcher<'a, M: RawMutex, F> {
    store: &'a Mutex<M, KeyValueStore<F>>,
}

impl<'a, M: RawMutex, F: NorFlash> CommandDispatcher<'a, M, F> {
    pub const fn new(store: &'a Mutex<M, KeyValueStore<F>>) -> Self {
        Self { store }
    }

    /// Process one command and produce its response
    pub async fn dispatch(&self, raw: &[u8]) -> Response {
        match self.route(trim(raw)).await {
            Ok(response) => response,
            Err(e) => {
                debug!("CMD: Command failed: {:?}", e);
                e.into()
            }
        }
    }

    async fn route(&self, command: &[u8]) -> Result<Response, CommandError> {
        let (&first, rest) = command.split_first().ok_or(CommandError::Syntax)?;

        match Namespace::from_byte(first).ok_or(CommandError::Syntax)? {
            Namespace::Test => {
                let (&second, payload) = rest.split_first().ok_or(CommandError::Syntax)?;
                match TestCommand::from_byte(second).ok_or(CommandError::Syntax)? {
                    TestCommand::Flash => {
                        let command = flash::FlashCommand::parse(payload)?;
                        let mut store = self.store.lock().await;
                        flash::execute(command, &mut store).await
                    }
                }
            }
        }
    }
}
