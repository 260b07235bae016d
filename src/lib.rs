//! Serial PakBus collection client for Campbell-style dataloggers.
//!
//! paklink opens a serial link to a PakBus datalogger, performs the
//! link-state handshake, discovers the tables stored on the device,
//! downloads newly recorded samples, decodes their binary representation
//! and appends them to per-table TOA5 text files that roll over on a
//! configured time span. Between runs it persists each table's
//! collection cursor so downloads resume incrementally.
//!
//! # Layers
//!
//! - [`transport`] — blocking serial byte stream with a tenths-of-a-second
//!   read timeout
//! - [`frame`] — sync-byte framing, byte-stuffing, CSI signatures
//! - [`message`] — the PakBus header, link-state sub-protocol and packet
//!   classification shared by both higher protocols
//! - [`pakctrl`] / [`bmp5`] — the transaction libraries (Hello/Bye,
//!   clock, programming statistics, file upload, data collection)
//! - [`tdf`] — the table-definition model and the binary record decoder
//! - [`writer`] / [`cursor`] — TOA5 output files and the persistent
//!   collection cursor
//! - [`session`] — the orchestrator tying one collection run together
//!
//! # Example
//!
//! ```rust,no_run
//! use paklink::{CollectionConfig, CollectionSession};
//! use std::path::Path;
//!
//! fn main() -> paklink::Result<()> {
//!     let config = CollectionConfig::load(Path::new("tower1.xml"))?;
//!     CollectionSession::new(config).run()
//! }
//! ```

pub mod bmp5;
pub mod config;
pub mod cursor;
mod error;
pub mod frame;
pub mod lockfile;
pub mod message;
pub mod pakctrl;
pub mod session;
pub mod sim;
pub mod tdf;
pub mod transport;
pub mod types;
pub mod writer;

pub use bmp5::Bmp5;
pub use config::{CollectionConfig, SerialSettings};
pub use cursor::CursorStore;
pub use error::{PakBusError, Result};
pub use message::{MessageLayer, PakBusAddress, Protocol};
pub use pakctrl::PakCtrl;
pub use session::{install_signal_handlers, shutdown_requested, CollectionSession};
pub use tdf::TableSet;
pub use transport::{RetryPolicy, SerialTransport, Transport};
pub use types::{Field, FieldKind, NSec, ProgStats, Table, TableCursor, TableOptions};
pub use writer::{AsciiWriter, TableWriter};
