//! Table definition file parsing.
//!
//! The TDF is a binary blob fetched from the logger (pseudopath `.TDF`):
//! one FSL version byte followed by table entries back to back. Each
//! entry is the table name, ring-buffer capacity, time metadata and a
//! zero-terminated field list. The CSI signature of each entry's bytes
//! is kept and echoed in collect commands so the logger can detect that
//! our definitions went stale.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::frame::{calc_sig, SIG_SEED};
use crate::types::{Field, FieldKind, NSec, Table, TableCursor};
use crate::{PakBusError, Result};

/// The parsed table definition file: every table the logger stores.
#[derive(Debug, Clone)]
pub struct TableSet {
    /// Final-storage-label version byte leading the blob.
    pub fsl_version: u8,
    tables: Vec<Table>,
}

impl TableSet {
    /// Parse a TDF blob into the table model.
    ///
    /// Entries with empty names are skipped, later duplicates of a table
    /// name are ignored, and table numbers count every entry in file
    /// order, skipped or not.
    pub fn parse(blob: &[u8]) -> Result<TableSet> {
        let mut reader = Reader::new(blob);
        let fsl_version = reader.take_u8("FSL version")?;

        let mut tables = Vec::new();
        let mut table_num: u16 = 1;

        while !reader.is_empty() {
            let entry_start = reader.pos;
            let table = read_table_definition(&mut reader)?;
            let entry_bytes = &blob[entry_start..reader.pos];
            let signature = calc_sig(entry_bytes, SIG_SEED);

            if table.name.is_empty() {
                debug!(
                    "Ignoring {}-byte table definition entry with empty name",
                    entry_bytes.len()
                );
            } else if tables.iter().any(|t: &Table| t.name == table.name) {
                debug!(
                    "Duplicate entry found for [{}] in table definitions, ignoring later",
                    table.name
                );
            } else {
                tables.push(Table { number: table_num, signature, ..table });
            }
            table_num += 1;
        }

        info!("Parsed table definitions: {} tables", tables.len());
        Ok(TableSet { fsl_version, tables })
    }

    /// Load and parse the cached TDF file.
    pub fn load(path: &Path) -> Result<TableSet> {
        let blob = fs::read(path).map_err(|e| PakBusError::io(path, e))?;
        if blob.is_empty() {
            return Err(PakBusError::parse(
                "table definitions",
                "no data available for parsing",
            ));
        }
        TableSet::parse(&blob)
    }

    /// All tables in TDF order.
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// Mutable access to all tables (cursor updates).
    pub fn tables_mut(&mut self) -> &mut [Table] {
        &mut self.tables
    }

    /// Find a table by name.
    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Find a table by name for collection; a missing table is an error
    /// the caller reports and skips.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| PakBusError::TableNotFound { table: name.to_string() })
    }

    /// Write the human-readable XML dump of the parsed model.
    pub fn write_xml(&self, path: &Path) -> Result<()> {
        let mut doc = String::from("<?xml version=\"1.0\"?>\n<TDF>\n");
        for table in &self.tables {
            let record_size = match table.record_size() {
                Some(size) => size as i64,
                None => -1,
            };
            let _ = writeln!(
                doc,
                "  <TABLE Name=\"{}\" Table_Size=\"{}\" Record_Size=\"{}\" Signature=\"{}\" \
                 Time_Type=\"{}\" Time_Interval=\"{}.{}s\">",
                xml_escape(&table.name),
                table.size,
                record_size,
                table.signature,
                table.time_type,
                table.time_interval.sec,
                table.time_interval.nsec,
            );
            for field in &table.fields {
                let _ = write!(doc, "    <Field Name=\"{}\"", xml_escape(&field.name));
                if !field.unit.is_empty() {
                    let _ = write!(doc, " Unit=\"{}\"", xml_escape(&field.unit));
                }
                if !field.processing.is_empty() {
                    let _ = write!(doc, " Processing=\"{}\"", xml_escape(&field.processing));
                }
                let _ = write!(doc, " Type=\"{}\"", field.kind.description());
                if !field.description.is_empty() {
                    let _ = write!(doc, " Description=\"{}\"", xml_escape(&field.description));
                }
                let _ = writeln!(doc, " Dimension=\"{}\"/>", field.dimension);
            }
            doc.push_str("  </TABLE>\n");
        }
        doc.push_str("</TDF>\n");
        fs::write(path, doc).map_err(|e| PakBusError::io(path, e))
    }
}

/// Remove the cached TDF artifacts and each table's in-progress data
/// file, resetting all collection state for a clean refetch.
pub fn clean_cache(working_path: &Path, tables: &mut [Table]) {
    debug!("Removing table definitions cache");
    let conf = working_path.join(".working");
    let _ = fs::remove_file(conf.join("tdf.dat"));
    let _ = fs::remove_file(conf.join("tdf.xml"));

    debug!("Resetting data collection parameters");
    for table in tables.iter_mut() {
        let _ = fs::remove_file(conf.join(format!("{}.tmp", table.name)));
        table.cursor = TableCursor::default();
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn overrun(what: &str) -> PakBusError {
        PakBusError::parse("table definitions", format!("truncated while reading {what}"))
    }

    fn take_u8(&mut self, what: &str) -> Result<u8> {
        let byte = *self.buf.get(self.pos).ok_or_else(|| Self::overrun(what))?;
        self.pos += 1;
        Ok(byte)
    }

    fn peek_u8(&self, what: &str) -> Result<u8> {
        self.buf.get(self.pos).copied().ok_or_else(|| Self::overrun(what))
    }

    fn take_u32(&mut self, what: &str) -> Result<u32> {
        if self.pos + 4 > self.buf.len() {
            return Err(Self::overrun(what));
        }
        let val = crate::frame::get_uint(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(val)
    }

    fn take_cstring(&mut self, what: &str) -> Result<String> {
        let (text, consumed) = crate::frame::get_cstring(&self.buf[self.pos..])
            .ok_or_else(|| Self::overrun(what))?;
        self.pos += consumed;
        Ok(text)
    }
}

fn read_table_definition(reader: &mut Reader<'_>) -> Result<Table> {
    let name = reader.take_cstring("table name")?;
    let size = reader.take_u32("table size")?;
    let time_type = reader.take_u8("time type")?;
    let time_info = NSec::new(
        reader.take_u32("table time info")?,
        reader.take_u32("table time info")?,
    );
    let time_interval = NSec::new(
        reader.take_u32("table time interval")?,
        reader.take_u32("table time interval")?,
    );
    let fields = read_field_list(reader)?;

    Ok(Table {
        name,
        number: 0,
        size,
        time_type,
        time_info,
        time_interval,
        fields,
        signature: 0,
        cursor: TableCursor::default(),
    })
}

fn read_field_list(reader: &mut Reader<'_>) -> Result<Vec<Field>> {
    let mut fields = Vec::new();

    loop {
        if reader.peek_u8("field list")? == 0 {
            reader.take_u8("field list terminator")?;
            break;
        }

        // The top bit of the type byte flags read-only fields.
        let code = reader.take_u8("field type")? & 0x7f;
        let kind = FieldKind::from_code(code).ok_or_else(|| {
            PakBusError::parse("table definitions", format!("unknown field type code {code}"))
        })?;

        let name = reader.take_cstring("field name")?;
        // The name list carries its own extra terminator byte.
        reader.take_u8("field name terminator")?;
        let processing = reader.take_cstring("field processing")?;
        let unit = reader.take_cstring("field unit")?;
        let description = reader.take_cstring("field description")?;
        let begin_index = reader.take_u32("field begin index")?;
        let dimension = reader.take_u32("field dimension")?;

        let mut sub_dims = Vec::new();
        loop {
            let num = reader.take_u32("field sub-dimension")?;
            if num == 0 {
                break;
            }
            sub_dims.push(num);
        }

        if name.is_empty() {
            warn!("Dropping field with empty name (type code {code})");
            continue;
        }
        fields.push(Field {
            kind,
            name,
            processing,
            unit,
            description,
            begin_index,
            dimension,
            sub_dims,
        });
    }

    Ok(fields)
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}


#[cfg(test)]
mod tests {
    use super::test_blob::{push_field, push_table};
    use super::*;

    fn two_table_blob() -> Vec<u8> {
        let mut blob = vec![1u8]; // FSL version
        push_table(&mut blob, "Status", 1, 0, |b| {
            push_field(b, 9, "Battery", "Smp", "V", 1);
        });
        push_table(&mut blob, "TenMin", 500, 600, |b| {
            push_field(b, 9, "AirTemp", "Avg", "degC", 1);
            push_field(b, 7, "Wind", "Smp", "m/s", 2);
            push_field(b, 11, "SiteId", "Smp", "", 8);
        });
        blob
    }

    #[test]
    fn parses_tables_and_fields() {
        let set = TableSet::parse(&two_table_blob()).unwrap();
        assert_eq!(set.fsl_version, 1);
        assert_eq!(set.tables().len(), 2);

        let status = set.get("Status").unwrap();
        assert_eq!(status.number, 1);
        assert_eq!(status.size, 1);
        assert_eq!(status.fields.len(), 1);

        let ten_min = set.get("TenMin").unwrap();
        assert_eq!(ten_min.number, 2);
        assert_eq!(ten_min.size, 500);
        assert_eq!(ten_min.time_interval, NSec::new(600, 0));
        assert_eq!(ten_min.fields.len(), 3);
        assert_eq!(ten_min.fields[0].name, "AirTemp");
        assert_eq!(ten_min.fields[0].kind, FieldKind::Ieee4);
        assert_eq!(ten_min.fields[1].dimension, 2);
        assert_eq!(ten_min.fields[2].kind, FieldKind::Ascii);
        // 4 + 2*2 + 8 bytes
        assert_eq!(ten_min.record_size(), Some(16));
    }

    #[test]
    fn table_signature_covers_entry_bytes() {
        let blob = two_table_blob();
        let set = TableSet::parse(&blob).unwrap();
        // Recompute the first entry's signature by hand: entry starts
        // right after the version byte and the second entry starts where
        // "TenMin" begins.
        let second = blob.windows(7).position(|w| w == b"TenMin\0").unwrap();
        let expected = calc_sig(&blob[1..second], SIG_SEED);
        assert_eq!(set.get("Status").unwrap().signature, expected);
    }

    #[test]
    fn duplicate_table_keeps_first() {
        let mut blob = vec![1u8];
        push_table(&mut blob, "TenMin", 100, 600, |b| {
            push_field(b, 9, "A", "", "", 1);
        });
        push_table(&mut blob, "TenMin", 999, 600, |b| {
            push_field(b, 9, "B", "", "", 1);
        });
        let set = TableSet::parse(&blob).unwrap();
        assert_eq!(set.tables().len(), 1);
        assert_eq!(set.get("TenMin").unwrap().size, 100);
    }

    #[test]
    fn empty_table_name_is_skipped_but_numbered() {
        let mut blob = vec![1u8];
        push_table(&mut blob, "", 1, 0, |b| {
            push_field(b, 9, "A", "", "", 1);
        });
        push_table(&mut blob, "Real", 1, 0, |b| {
            push_field(b, 9, "B", "", "", 1);
        });
        let set = TableSet::parse(&blob).unwrap();
        assert_eq!(set.tables().len(), 1);
        // Numbering counts the skipped entry
        assert_eq!(set.get("Real").unwrap().number, 2);
    }

    #[test]
    fn empty_field_name_is_dropped() {
        let mut blob = vec![1u8];
        push_table(&mut blob, "T", 10, 60, |b| {
            push_field(b, 9, "", "", "", 1);
            push_field(b, 9, "Kept", "", "", 1);
        });
        let set = TableSet::parse(&blob).unwrap();
        let table = set.get("T").unwrap();
        assert_eq!(table.fields.len(), 1);
        assert_eq!(table.fields[0].name, "Kept");
    }

    #[test]
    fn truncated_blob_is_a_parse_error() {
        let blob = two_table_blob();
        for cut in [2, 10, blob.len() - 3] {
            match TableSet::parse(&blob[..cut]) {
                Err(PakBusError::Parse { .. }) => {}
                other => panic!("cut at {cut}: expected parse error, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_field_code_is_a_parse_error() {
        let mut blob = vec![1u8];
        push_table(&mut blob, "T", 10, 60, |b| {
            push_field(b, 42, "Odd", "", "", 1);
        });
        assert!(matches!(TableSet::parse(&blob), Err(PakBusError::Parse { .. })));
    }

    #[test]
    fn read_only_marker_bit_is_cleared() {
        let mut blob = vec![1u8];
        push_table(&mut blob, "T", 10, 60, |b| {
            push_field(b, 0x80 | 9, "Marked", "", "", 1);
        });
        let set = TableSet::parse(&blob).unwrap();
        assert_eq!(set.get("T").unwrap().fields[0].kind, FieldKind::Ieee4);
    }

    #[test]
    fn xml_dump_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let set = TableSet::parse(&two_table_blob()).unwrap();
        let path = dir.path().join("tdf.xml");
        set.write_xml(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("<TABLE Name=\"TenMin\""));
        assert!(text.contains("Record_Size=\"16\""));
        assert!(text.contains("<Field Name=\"AirTemp\""));
    }
}
