//! Persistent per-table collection cursors.
//!
//! Between runs the cursor of every table lives in
//! `.working/info.<TableName>`: a header comment followed by
//! `NextRecord`, `LastRecordTime.sec LastRecordTime.nsec`, `NewFileTime`
//! and `FirstSampleInFile` as whitespace-separated decimal ASCII. The
//! format is shared with earlier versions of the collector, so the
//! parser tolerates trailing whitespace and unknown trailing lines.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::types::{NSec, Table, TableCursor};

const INFO_HEADER: &str = "# NextRecord, LastRecordTime, NewFileTime, TimeOfFirstSampleInFile";

/// Loads and saves table cursors under a working path.
pub struct CursorStore {
    working_path: PathBuf,
}

impl CursorStore {
    /// A store rooted at the configured working path.
    pub fn new(working_path: impl Into<PathBuf>) -> Self {
        CursorStore { working_path: working_path.into() }
    }

    fn info_path(&self, table_name: &str) -> PathBuf {
        self.working_path.join(".working").join(format!("info.{table_name}"))
    }

    /// Load the cursor for one table. A missing or unreadable file
    /// leaves the cursor at its defaults: collection starts fresh.
    pub fn load(&self, table: &mut Table) {
        let path = self.info_path(&table.name);
        let Ok(text) = fs::read_to_string(&path) else {
            return;
        };
        match parse_cursor(&text) {
            Some(cursor) => {
                table.cursor = cursor;
                debug!(
                    "Loaded history - {}(NextRecord:{},LastRecordTime:{},NewFileTime:{},FirstSampleInFile:{})",
                    table.name,
                    cursor.next_record,
                    cursor.last_record_time,
                    cursor.new_file_time,
                    cursor.first_sample_in_file
                );
            }
            None => {
                error!("Malformed cursor file ignored: {}", path.display());
            }
        }
    }

    /// Load cursors for every table.
    pub fn load_all(&self, tables: &mut [Table]) {
        for table in tables {
            self.load(table);
        }
    }

    /// Persist the cursor of one table. Failures are logged; a lost
    /// cursor costs a re-collection, not the session.
    pub fn save(&self, table: &Table) {
        let path = self.info_path(&table.name);
        let cursor = &table.cursor;
        let text = format!(
            "{INFO_HEADER}\n{}\n{} {}\n{}\n{}\n",
            cursor.next_record,
            cursor.last_record_time.sec,
            cursor.last_record_time.nsec,
            cursor.new_file_time,
            cursor.first_sample_in_file
        );
        if fs::write(&path, text).is_err() {
            error!("Failed to store collection state for {}", table.name);
        }
    }

    /// Persist cursors for every table.
    pub fn save_all(&self, tables: &[Table]) {
        debug!("Saving history for all collected tables.");
        for table in tables {
            self.save(table);
        }
    }

    /// The working path this store is rooted at.
    pub fn working_path(&self) -> &Path {
        &self.working_path
    }
}

/// Parse a cursor file: skip the header line, then read five decimal
/// numbers in order, ignoring anything after them.
fn parse_cursor(text: &str) -> Option<TableCursor> {
    let rest = match text.split_once('\n') {
        Some((first, rest)) if first.trim_start().starts_with('#') => rest,
        _ => text,
    };
    let mut numbers = rest.split_whitespace();
    let mut next = || numbers.next()?.parse::<u32>().ok();

    let next_record = next()?;
    let sec = next()?;
    let nsec = next()?;
    let new_file_time = next()?;
    let first_sample_in_file = next()?;

    Some(TableCursor {
        next_record,
        last_record_time: NSec::new(sec, nsec),
        new_file_time,
        first_sample_in_file,
    })
}
