//! Binary record decoding.
//!
//! Turns the data section of collect responses into typed writer calls.
//! The first record of a packet carries its own 8-byte timestamp;
//! followers are stamped by adding the table's nominal interval. Field
//! values dispatch on the declared [`FieldKind`], including the two
//! Campbell float encodings.

use tracing::info;

use crate::frame::{get_cstring, get_fixed_string, get_uint};
use crate::types::{Field, FieldKind, NSec, Table};
use crate::writer::TableWriter;
use crate::{PakBusError, Result};

/// Sentinel value emitted for overflowing or undecodable samples.
pub const SENTINEL: f32 = -9999.0;

/// Decode a final-storage two-byte float.
///
/// Bit 15 is the sign, bits 13..14 the decimal exponent, bits 0..12 the
/// magnitude. Magnitudes above 6999 are out of range and collapse to the
/// sentinel.
pub fn final_storage_f32(word: u16) -> f32 {
    let negative = word >> 15 != 0;
    let exponent = (word >> 13) & 0x3;
    let magnitude = f32::from(word & 0x1fff) * 10f32.powi(-i32::from(exponent));
    if magnitude > 6999.0 {
        SENTINEL
    } else if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// Reconstruct an IEEE-754 single from its big-endian bit pattern.
pub fn ieee_f32(bits: u32) -> f32 {
    let sign = if bits >> 31 == 0 { 1.0f64 } else { -1.0 };
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = if exponent == 0 {
        f64::from((bits & 0x007f_ffff) << 1)
    } else {
        f64::from((bits & 0x007f_ffff) | 0x0080_0000)
    };
    (sign * mantissa * 2f64.powi(exponent - 150)) as f32
}

/// Read the 8-byte record timestamp at the head of a data section.
pub fn parse_record_time(data: &[u8]) -> Result<NSec> {
    if data.len() < 8 {
        return Err(PakBusError::parse("record time", "fewer than 8 bytes available"));
    }
    Ok(NSec::new(get_uint(&data[0..4]), get_uint(&data[4..8])))
}

/// Decode `nrecs` consecutive records from `data` and hand them to the
/// writer. `beg_rec_nbr` is the record index of the first record; the
/// cursor advances one index per stored record.
pub fn store_records<W: TableWriter>(
    writer: &mut W,
    table: &mut Table,
    data: &[u8],
    beg_rec_nbr: u32,
    nrecs: u32,
) -> Result<()> {
    let mut pos = 0usize;
    for rec in 0..nrecs {
        store_record(writer, table, data, &mut pos, beg_rec_nbr + rec, rec == 0)?;
    }
    Ok(())
}

/// Decode one record starting at `data[*pos]`.
///
/// When `parse_timestamp` is set the record carries its own NSec
/// timestamp; otherwise it is stamped `last_record_time +
/// time_interval`. On success the table cursor's `last_record_time` and
/// `next_record` advance.
pub fn store_record<W: TableWriter>(
    writer: &mut W,
    table: &mut Table,
    data: &[u8],
    pos: &mut usize,
    rec_num: u32,
    parse_timestamp: bool,
) -> Result<()> {
    let record_time = if parse_timestamp {
        let time = parse_record_time(&data[(*pos).min(data.len())..])?;
        *pos += 8;
        time
    } else {
        table.cursor.last_record_time + table.time_interval
    };

    writer.record_begin(&mut table.cursor, rec_num, record_time).map_err(|e| {
        PakBusError::storage(
            &table.name,
            format!(
                "failure in storing data record{{\"id\":{rec_num}, \"timestamp\":{}}}: {e}",
                record_time.record_timestamp()
            ),
        )
    })?;

    for field in &table.fields {
        for _ in 0..field.value_count() {
            decode_sample(writer, field, data, pos)?;
        }
    }

    writer.record_end()?;
    table.cursor.last_record_time = record_time;
    table.cursor.next_record = rec_num + 1;
    Ok(())
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize, field: &Field) -> Result<&'a [u8]> {
    let end = *pos + len;
    if end > data.len() {
        return Err(PakBusError::parse(
            "record decoding",
            format!("record data ends inside field '{}'", field.name),
        ));
    }
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

/// Decode one sample for `field` at the cursor and dispatch the typed
/// writer call. The cursor advances by the field's wire width even for
/// types this client cannot decode.
fn decode_sample<W: TableWriter>(
    writer: &mut W,
    field: &Field,
    data: &[u8],
    pos: &mut usize,
) -> Result<()> {
    match field.kind {
        FieldKind::UInt1 => {
            let raw = take(data, pos, 1, field)?;
            writer.store_u32(field, u32::from(raw[0]))
        }
        FieldKind::UInt2 => {
            let raw = take(data, pos, 2, field)?;
            writer.store_u32(field, get_uint(raw))
        }
        FieldKind::UInt4 => {
            let raw = take(data, pos, 4, field)?;
            writer.store_u32(field, get_uint(raw))
        }
        FieldKind::Int1 => {
            let raw = take(data, pos, 1, field)?;
            writer.store_i32(field, i32::from(raw[0] as i8))
        }
        FieldKind::Int2 => {
            let raw = take(data, pos, 2, field)?;
            writer.store_i32(field, i32::from(get_uint(raw) as u16 as i16))
        }
        FieldKind::Int4 => {
            let raw = take(data, pos, 4, field)?;
            writer.store_i32(field, get_uint(raw) as i32)
        }
        FieldKind::Fp2 => {
            let raw = take(data, pos, 2, field)?;
            writer.store_f32(field, final_storage_f32(get_uint(raw) as u16))
        }
        FieldKind::Ieee4 => {
            let raw = take(data, pos, 4, field)?;
            writer.store_f32(field, ieee_f32(get_uint(raw)))
        }
        FieldKind::Bool { .. } => {
            let raw = take(data, pos, 1, field)?;
            writer.store_bool(field, raw[0] & 0x80 != 0)
        }
        FieldKind::Sec => {
            let raw = take(data, pos, 4, field)?;
            writer.store_u32(field, get_uint(raw))
        }
        FieldKind::USec => {
            // Six bytes on the wire; the trailing two are dropped.
            let raw = take(data, pos, 6, field)?;
            writer.store_u32(field, get_uint(&raw[0..4]))
        }
        FieldKind::Flags => {
            let raw = take(data, pos, 1, field)?;
            writer.store_u32(field, u32::from(raw[0]))
        }
        FieldKind::Ascii => {
            let len = field.dimension as usize;
            let raw = take(data, pos, len, field)?;
            let text = get_fixed_string(raw, len);
            writer.store_string(field, &text)
        }
        FieldKind::AsciiZ => {
            let (text, consumed) = get_cstring(&data[*pos..]).ok_or_else(|| {
                PakBusError::parse(
                    "record decoding",
                    format!("unterminated string in field '{}'", field.name),
                )
            })?;
            *pos += consumed;
            writer.store_string(field, &text)
        }
        FieldKind::Unimplemented { code, width } => {
            take(data, pos, usize::from(width), field)?;
            log_unimplemented(field, code);
            writer.process_unimplemented(field)
        }
    }
}

/// Log the first occurrence of an undecodable field type; repeating it
/// for every sample would flood the log.
fn log_unimplemented(field: &Field, code: u8) {
    use std::cell::RefCell;
    thread_local! {
        static REPORTED: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }
    REPORTED.with(|reported| {
        let mut reported = reported.borrow_mut();
        if !reported.iter().any(|name| name == &field.name) {
            info!(
                "Cannot decode data values for field \"{}\" [{}] (type code {code})",
                field.name,
                field.kind.description()
            );
            reported.push(field.name.clone());
        }
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::TableCursor;

    /// Writer capturing every call for assertions.
    #[derive(Default)]
    pub struct RecordingWriter {
        pub events: Vec<String>,
    }

    impl TableWriter for RecordingWriter {
        fn init_write(&mut self, _table: &Table, _opts: &crate::types::TableOptions) -> Result<()> {
            self.events.push("init".into());
            Ok(())
        }
        fn record_begin(
            &mut self,
            _cursor: &mut TableCursor,
            record_idx: u32,
            record_time: NSec,
        ) -> Result<()> {
            self.events.push(format!("begin {record_idx} @{record_time}"));
            Ok(())
        }
        fn store_u32(&mut self, _f: &Field, value: u32) -> Result<()> {
            self.events.push(format!("u32 {value}"));
            Ok(())
        }
        fn store_i32(&mut self, _f: &Field, value: i32) -> Result<()> {
            self.events.push(format!("i32 {value}"));
            Ok(())
        }
        fn store_f32(&mut self, _f: &Field, value: f32) -> Result<()> {
            self.events.push(format!("f32 {value}"));
            Ok(())
        }
        fn store_bool(&mut self, _f: &Field, value: bool) -> Result<()> {
            self.events.push(format!("bool {value}"));
            Ok(())
        }
        fn store_string(&mut self, _f: &Field, value: &str) -> Result<()> {
            self.events.push(format!("str {value}"));
            Ok(())
        }
        fn process_unimplemented(&mut self, _f: &Field) -> Result<()> {
            self.events.push("unimpl".into());
            Ok(())
        }
        fn record_end(&mut self) -> Result<()> {
            self.events.push("end".into());
            Ok(())
        }
        fn finish_write(&mut self, _table: &Table) -> Result<()> {
            self.events.push("finish".into());
            Ok(())
        }
        fn flush(&mut self, _table: &Table) -> Result<()> {
            self.events.push("flush".into());
            Ok(())
        }
    }

    fn field(kind: FieldKind, name: &str, dimension: u32) -> Field {
        Field {
            kind,
            name: name.into(),
            processing: String::new(),
            unit: String::new(),
            description: String::new(),
            begin_index: 1,
            dimension,
            sub_dims: vec![],
        }
    }

    fn table(fields: Vec<Field>) -> Table {
        Table {
            name: "T".into(),
            number: 1,
            size: 100,
            time_type: 0x0e,
            time_info: NSec::zero(),
            time_interval: NSec::new(60, 0),
            fields,
            signature: 0,
            cursor: TableCursor::default(),
        }
    }

    #[test]
    fn ieee_float_vectors() {
        assert_eq!(ieee_f32(0x3f80_0000), 1.0);
        assert_eq!(ieee_f32(0xbf80_0000), -1.0);
        assert_eq!(ieee_f32(0x7f80_0000), f32::INFINITY);
        assert_eq!(ieee_f32(0x0000_0000), 0.0);
        assert_eq!(ieee_f32(0x4048_0000), 3.125);
        // Denormal: mantissa shifted, no implicit bit
        assert!(ieee_f32(0x0000_0001) > 0.0);
    }

    #[test]
    fn final_storage_vectors() {
        // 8191 * 10^0 overflows the 6999 limit
        assert_eq!(final_storage_f32(0x1fff), SENTINEL);
        assert_eq!(final_storage_f32(0x0064), 100.0);
        assert_eq!(final_storage_f32(0x8064), -100.0);
        assert_eq!(final_storage_f32(0x2064), 10.0);
        assert_eq!(final_storage_f32(0x0000), 0.0);
    }

    #[test]
    fn first_record_timestamp_then_interval() {
        let mut tbl = table(vec![field(FieldKind::UInt1, "A", 1)]);
        // Two records: 8-byte timestamp + 1 value, then just the value
        let mut data = Vec::new();
        data.extend_from_slice(&1000u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.push(7);
        data.push(8);

        let mut writer = RecordingWriter::default();
        store_records(&mut writer, &mut tbl, &data, 5, 2).unwrap();

        assert_eq!(
            writer.events,
            vec![
                "begin 5 @1000.000000000",
                "u32 7",
                "end",
                "begin 6 @1060.000000000",
                "u32 8",
                "end",
            ]
        );
        assert_eq!(tbl.cursor.next_record, 7);
        assert_eq!(tbl.cursor.last_record_time, NSec::new(1060, 0));
    }

    #[test]
    fn mixed_field_record() {
        let mut tbl = table(vec![
            field(FieldKind::Ieee4, "Temp", 1),
            field(FieldKind::Fp2, "Wind", 2),
            field(FieldKind::Int2, "Delta", 1),
            field(FieldKind::Bool { code: 10 }, "Door", 1),
            field(FieldKind::Ascii, "Site", 4),
            field(FieldKind::Unimplemented { code: 18, width: 8 }, "Wide", 1),
            field(FieldKind::UInt1, "Tail", 1),
        ]);

        let mut data = Vec::new();
        data.extend_from_slice(&900u32.to_be_bytes());
        data.extend_from_slice(&500_000_000u32.to_be_bytes());
        data.extend_from_slice(&0x3f80_0000u32.to_be_bytes()); // 1.0
        data.extend_from_slice(&0x0064u16.to_be_bytes()); // 100
        data.extend_from_slice(&0x8064u16.to_be_bytes()); // -100
        data.extend_from_slice(&(-2i16).to_be_bytes());
        data.push(0x80); // true
        data.extend_from_slice(b"AB\0Z"); // fixed string, NUL-truncated
        data.extend_from_slice(&[0u8; 8]); // unimplemented 8 bytes
        data.push(42);

        let mut writer = RecordingWriter::default();
        let mut pos = 0;
        store_record(&mut writer, &mut tbl, &data, &mut pos, 1, true).unwrap();

        assert_eq!(
            writer.events,
            vec![
                "begin 1 @900.500000000",
                "f32 1",
                "f32 100",
                "f32 -100",
                "i32 -2",
                "bool true",
                "str AB",
                "unimpl",
                "u32 42",
            ]
        );
        assert_eq!(pos, data.len());
    }

    #[test]
    fn variable_string_consumes_terminator() {
        let mut tbl = table(vec![
            field(FieldKind::AsciiZ, "Msg", 32),
            field(FieldKind::UInt1, "After", 1),
        ]);
        let mut data = Vec::new();
        data.extend_from_slice(&[0u8; 8]); // timestamp
        data.extend_from_slice(b"hello\0");
        data.push(9);

        let mut writer = RecordingWriter::default();
        let mut pos = 0;
        store_record(&mut writer, &mut tbl, &data, &mut pos, 1, true).unwrap();
        assert!(writer.events.contains(&"str hello".to_string()));
        assert!(writer.events.contains(&"u32 9".to_string()));
    }

    #[test]
    fn usec_field_skips_trailing_bytes() {
        let mut tbl = table(vec![
            field(FieldKind::USec, "Stamp", 1),
            field(FieldKind::UInt1, "After", 1),
        ]);
        let mut data = Vec::new();
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0xaa, 0xbb]); // 6 bytes
        data.push(3);

        let mut writer = RecordingWriter::default();
        let mut pos = 0;
        store_record(&mut writer, &mut tbl, &data, &mut pos, 1, true).unwrap();
        assert!(writer.events.contains(&"u32 256".to_string()));
        assert!(writer.events.contains(&"u32 3".to_string()));
    }

    #[test]
    fn truncated_record_is_a_parse_error() {
        let mut tbl = table(vec![field(FieldKind::Ieee4, "Temp", 1)]);
        let mut data = Vec::new();
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&[0x3f, 0x80]); // only half the float

        let mut writer = RecordingWriter::default();
        let mut pos = 0;
        match store_record(&mut writer, &mut tbl, &data, &mut pos, 1, true) {
            Err(PakBusError::Parse { .. }) => {}
            other => panic!("Expected parse error, got {other:?}"),
        }
    }
}
