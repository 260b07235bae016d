//! Error types for PakBus communication and data collection.
//!
//! All failures in the crate funnel into [`PakBusError`]. Variants map to the
//! distinct failure policies of the collection process:
//!
//! - **Link errors** (`NoResponse`, `Handshake`) end or retry the session
//! - **Packet errors** (`CorruptData`, `DeliveryFailure`) are handled at the
//!   message layer, usually by dropping the offending packet
//! - **Metadata errors** (`InvalidTdf`, `Parse`) trigger a table-definition
//!   refetch
//! - **I/O and storage errors** are fatal for the session or the current
//!   table respectively
//!
//! Use [`PakBusError::is_retryable`] to decide whether the session loop
//! should go another round with a longer read timeout.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for PakBus operations.
pub type Result<T, E = PakBusError> = std::result::Result<T, E>;

/// Main error type for PakBus operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PakBusError {
    /// The device stopped answering: several successive read cycles
    /// returned no bytes at all.
    #[error("No response from device")]
    NoResponse,

    /// A received packet failed its signature check.
    #[error("Signature test for packet failed")]
    CorruptData,

    /// The PakCtrl layer reported that a message could not be delivered.
    #[error("Delivery failed ({})", delivery_failure_reason(*.code))]
    DeliveryFailure { code: u8 },

    /// The link-state or Hello exchange did not produce the expected reply.
    #[error("Handshake failed in {phase}")]
    Handshake { phase: String },

    /// The logger rejected a collect command because its table definitions
    /// no longer match ours (collect response code 0x07 or 0x01).
    #[error("Logger reports invalid table definitions (code {code:#04x})")]
    InvalidTdf { code: u8 },

    /// A structural error while decoding a binary blob (TDF, record data,
    /// transaction response).
    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    /// Device or file I/O failure.
    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The serial device could not be opened or configured.
    #[error("Failed to open serial device {port}: {reason}")]
    Serial { port: String, reason: String },

    /// The writer failed to produce or finalize a data file.
    #[error("Storage error for table {table}: {details}")]
    Storage { table: String, details: String },

    /// A configured table does not exist in the logger's table definitions.
    #[error("Table '{table}' not found in table definitions")]
    TableNotFound { table: String },

    /// The configuration file is missing or malformed.
    #[error("Configuration error: {details}")]
    Config { details: String },

    /// Another process already holds the device lock.
    #[error("Device is locked by running process {pid}")]
    DeviceLocked { pid: i32 },

    /// The logger clock could not be read or adjusted.
    #[error("Clock transaction failed: {details}")]
    Clock { details: String },
}

impl PakBusError {
    /// Returns whether the session loop may retry after this error with an
    /// escalated read timeout.
    pub fn is_retryable(&self) -> bool {
        match self {
            PakBusError::NoResponse => true,
            PakBusError::Handshake { .. } => true,
            PakBusError::DeliveryFailure { .. } => true,
            PakBusError::CorruptData => true,
            PakBusError::InvalidTdf { .. } => true,
            PakBusError::Parse { .. } => true,
            PakBusError::Clock { .. } => true,
            PakBusError::Io { .. } => false,
            PakBusError::Serial { .. } => false,
            PakBusError::Storage { .. } => false,
            PakBusError::TableNotFound { .. } => false,
            PakBusError::Config { .. } => false,
            PakBusError::DeviceLocked { .. } => false,
        }
    }

    /// Helper constructor for parse errors.
    pub fn parse(context: impl Into<String>, details: impl Into<String>) -> Self {
        PakBusError::Parse { context: context.into(), details: details.into() }
    }

    /// Helper constructor for file I/O errors with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PakBusError::Io { path: path.into(), source }
    }

    /// Helper constructor for storage errors.
    pub fn storage(table: impl Into<String>, details: impl Into<String>) -> Self {
        PakBusError::Storage { table: table.into(), details: details.into() }
    }

    /// Helper constructor for handshake failures.
    pub fn handshake(phase: impl Into<String>) -> Self {
        PakBusError::Handshake { phase: phase.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(details: impl Into<String>) -> Self {
        PakBusError::Config { details: details.into() }
    }
}

impl From<std::io::Error> for PakBusError {
    fn from(err: std::io::Error) -> Self {
        PakBusError::Io { path: PathBuf::from("<unknown>"), source: err }
    }
}

/// Text for the sub-code carried in a PakCtrl delivery-failure message.
fn delivery_failure_reason(code: u8) -> &'static str {
    match code {
        0x01 => "Destination unreachable",
        0x02 => "Unreachable higher level protocol",
        0x03 => "Queue overflow",
        0x04 => "Unimplemented command or MsgType",
        0x05 => "Malformed message",
        0x06 => "Link failed",
        _ => "Unknown error",
    }
}
