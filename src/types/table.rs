//! Table metadata and the per-table collection cursor.

use serde::{Deserialize, Serialize};

use super::{Field, NSec};

/// A named record stream on the logger, built from one entry of the table
/// definition file plus the mutable collection cursor this client tracks
/// across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// Table name as programmed on the logger.
    pub name: String,
    /// 1-based table number, assigned in TDF listing order.
    pub number: u16,
    /// Declared record capacity of the table's ring buffer.
    pub size: u32,
    /// Time-type code from the TDF.
    pub time_type: u8,
    /// Base time of the table.
    pub time_info: NSec,
    /// Nominal sample interval.
    pub time_interval: NSec,
    /// Ordered field list.
    pub fields: Vec<Field>,
    /// CSI signature over this table's TDF bytes; echoed in collect
    /// commands so the logger can detect definition drift.
    pub signature: u16,
    /// Mutable collection state, persisted between runs.
    pub cursor: TableCursor,
}

/// Persistent per-table collection state.
///
/// Stored in `.working/info.<TableName>` between runs so collection
/// resumes where the previous session stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCursor {
    /// 1-based index of the next record to fetch.
    pub next_record: u32,
    /// Timestamp of the last decoded record.
    pub last_record_time: NSec,
    /// Epoch-1990 second at which the currently open output file must
    /// close and a new one open. Zero when no file is in progress.
    pub new_file_time: u32,
    /// Timestamp (seconds) of the first record in the open output file.
    pub first_sample_in_file: u32,
}

impl Table {
    /// Size in bytes of one record of this table, or `None` when any
    /// field is variable-length. A variable-size record switches the
    /// collect loop to one record per request and the reassembly buffer
    /// to length-unknown mode.
    pub fn record_size(&self) -> Option<usize> {
        let mut total = 0usize;
        for field in &self.fields {
            total += field.wire_size()?;
        }
        Some(total)
    }

    /// Reset the cursor, typically after the logger's table definitions
    /// changed underneath us.
    pub fn reset_cursor(&mut self) {
        self.cursor = TableCursor::default();
    }
}

/// Datalogger programming statistics, fetched once per session and used
/// for the data file header line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgStats {
    /// Operating system version string.
    pub os_version: String,
    /// Operating system signature.
    pub os_sig: u16,
    /// Device serial number ("Unknown" when the logger reports a
    /// non-numeric value).
    pub serial_no: String,
    /// Name of the program configured to run on power-up.
    pub powerup_prog: String,
    /// Name of the currently running program.
    pub prog_name: String,
    /// Signature of the running program.
    pub prog_sig: u16,
}

/// Per-table output options from the configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOptions {
    /// Name of the table to collect.
    pub name: String,
    /// Span of one output data file in seconds.
    pub file_span_secs: u32,
    /// Expected sample interval in seconds; negative disables the
    /// early-rollover check at the end of a collection pass.
    pub sample_int_secs: i64,
}

impl TableOptions {
    /// Options with the standard defaults (hourly files, no early
    /// rollover).
    pub fn new(name: impl Into<String>) -> Self {
        TableOptions { name: name.into(), file_span_secs: 3600, sample_int_secs: -1 }
    }
}

/// Station-level identity used in data file headers.
#[derive(Debug, Clone, Default)]
pub struct StationInfo {
    /// Station name from the configuration file.
    pub station_name: String,
    /// Logger model string from the configuration file.
    pub logger_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldKind;

    fn simple_field(kind: FieldKind, dimension: u32) -> Field {
        Field {
            kind,
            name: "f".into(),
            processing: String::new(),
            unit: String::new(),
            description: String::new(),
            begin_index: 1,
            dimension,
            sub_dims: vec![],
        }
    }

    fn table_with(fields: Vec<Field>) -> Table {
        Table {
            name: "TenMin".into(),
            number: 1,
            size: 1000,
            time_type: 0x0e,
            time_info: NSec::zero(),
            time_interval: NSec::new(600, 0),
            fields,
            signature: 0x1234,
            cursor: TableCursor::default(),
        }
    }

    #[test]
    fn record_size_sums_field_widths() {
        let tbl = table_with(vec![
            simple_field(FieldKind::Ieee4, 2), // 8
            simple_field(FieldKind::Fp2, 1),   // 2
            simple_field(FieldKind::Ascii, 5), // 5
        ]);
        assert_eq!(tbl.record_size(), Some(15));
    }

    #[test]
    fn variable_field_makes_record_size_unknown() {
        let tbl = table_with(vec![
            simple_field(FieldKind::Ieee4, 1),
            simple_field(FieldKind::AsciiZ, 32),
        ]);
        assert_eq!(tbl.record_size(), None);
    }

    #[test]
    fn cursor_reset_clears_state() {
        let mut tbl = table_with(vec![]);
        tbl.cursor.next_record = 42;
        tbl.cursor.new_file_time = 600;
        tbl.reset_cursor();
        assert_eq!(tbl.cursor, TableCursor::default());
    }
}
