//! Field type codes and field metadata from the table definitions.

use serde::{Deserialize, Serialize};

/// Data type of a field as declared in the table definition file.
///
/// The logger identifies field layouts by a one-byte code. Codes this
/// client can decode get their own variant; every other code in the
/// protocol's table is carried as [`FieldKind::Unimplemented`] with its
/// declared wire width so the record decoder can still step over the
/// bytes and emit the `-9999` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// Code 1: 1-byte unsigned integer
    UInt1,
    /// Code 2: 2-byte unsigned integer, MSB first
    UInt2,
    /// Code 3: 4-byte unsigned integer, MSB first
    UInt4,
    /// Code 4: 1-byte signed integer
    Int1,
    /// Code 5: 2-byte signed integer, MSB first
    Int2,
    /// Code 6: 4-byte signed integer, MSB first
    Int4,
    /// Code 7: 2-byte final-storage floating point
    Fp2,
    /// Code 9: 4-byte IEEE-754 single, MSB first
    Ieee4,
    /// Codes 10, 27, 28: boolean, bit 7 of one byte
    Bool { code: u8 },
    /// Code 11: fixed-length string; the field dimension is the length
    Ascii,
    /// Code 12: 4-byte unsigned integer, 1-second time resolution
    Sec,
    /// Code 13: 6-byte unsigned integer, 10s-of-ms resolution; only the
    /// leading 4 bytes are kept
    USec,
    /// Code 16: variable length NUL-terminated string
    AsciiZ,
    /// Code 17: byte of flags
    Flags,
    /// Any other code from the protocol table: undecodable but with a
    /// known fixed wire width
    Unimplemented { code: u8, width: u8 },
}

impl FieldKind {
    /// Map a field-type code from the table definition file. The top bit
    /// of the stored byte is a read-only marker and must be cleared by
    /// the caller. Returns `None` for codes outside the protocol table.
    pub fn from_code(code: u8) -> Option<FieldKind> {
        let kind = match code {
            1 => FieldKind::UInt1,
            2 => FieldKind::UInt2,
            3 => FieldKind::UInt4,
            4 => FieldKind::Int1,
            5 => FieldKind::Int2,
            6 => FieldKind::Int4,
            7 => FieldKind::Fp2,
            9 => FieldKind::Ieee4,
            10 | 27 | 28 => FieldKind::Bool { code },
            11 => FieldKind::Ascii,
            12 => FieldKind::Sec,
            13 => FieldKind::USec,
            16 => FieldKind::AsciiZ,
            17 => FieldKind::Flags,
            8 => FieldKind::Unimplemented { code, width: 4 },
            14 => FieldKind::Unimplemented { code, width: 8 },
            15 => FieldKind::Unimplemented { code, width: 3 },
            18 => FieldKind::Unimplemented { code, width: 8 },
            19 => FieldKind::Unimplemented { code, width: 2 },
            20 => FieldKind::Unimplemented { code, width: 4 },
            21 => FieldKind::Unimplemented { code, width: 2 },
            22 => FieldKind::Unimplemented { code, width: 4 },
            23 => FieldKind::Unimplemented { code, width: 8 },
            24 => FieldKind::Unimplemented { code, width: 4 },
            25 => FieldKind::Unimplemented { code, width: 8 },
            26 => FieldKind::Unimplemented { code, width: 4 },
            _ => return None,
        };
        Some(kind)
    }

    /// The wire code this kind was parsed from.
    pub fn code(&self) -> u8 {
        match self {
            FieldKind::UInt1 => 1,
            FieldKind::UInt2 => 2,
            FieldKind::UInt4 => 3,
            FieldKind::Int1 => 4,
            FieldKind::Int2 => 5,
            FieldKind::Int4 => 6,
            FieldKind::Fp2 => 7,
            FieldKind::Ieee4 => 9,
            FieldKind::Bool { code } => *code,
            FieldKind::Ascii => 11,
            FieldKind::Sec => 12,
            FieldKind::USec => 13,
            FieldKind::AsciiZ => 16,
            FieldKind::Flags => 17,
            FieldKind::Unimplemented { code, .. } => *code,
        }
    }

    /// Size in bytes of a single value of this kind, `None` when the
    /// size is not fixed (variable-length strings).
    pub const fn size(&self) -> Option<usize> {
        match self {
            FieldKind::UInt1 | FieldKind::Int1 => Some(1),
            FieldKind::UInt2 | FieldKind::Int2 | FieldKind::Fp2 => Some(2),
            FieldKind::UInt4 | FieldKind::Int4 | FieldKind::Ieee4 | FieldKind::Sec => Some(4),
            FieldKind::Bool { .. } | FieldKind::Flags => Some(1),
            FieldKind::USec => Some(6),
            FieldKind::Ascii => Some(1),
            FieldKind::AsciiZ => None,
            FieldKind::Unimplemented { width, .. } => Some(*width as usize),
        }
    }

    /// Whether this kind holds text rather than an array of numbers.
    /// String fields use the field dimension as string length, not as an
    /// array count.
    pub const fn is_string(&self) -> bool {
        matches!(self, FieldKind::Ascii | FieldKind::AsciiZ)
    }

    /// A human-readable description matching the protocol documentation,
    /// used in the tdf.xml dump.
    pub fn description(&self) -> &'static str {
        match self.code() {
            1 => "1-byte uint",
            2 => "2-byte unsigned integer (MSB first)",
            3 => "4-byte unsigned integer (MSB first)",
            4 => "1-byte signed integer",
            5 => "2-byte signed integer (MSB first)",
            6 => "4-byte signed integer (MSB first)",
            7 => "2-byte final storage floating point",
            8 => "4-byte final storage floating point (CSI format) - NOT IMPLEMENTED",
            9 => "4-byte floating point (IEEE standard, MSB first)",
            10 | 27 | 28 => "Boolean value",
            11 => "fixed length string of length n, unused portion filled",
            12 => "4-byte integer used for 1-sec resolution time",
            13 => "6-byte unsigned integer, 10's of ms resolution",
            14 => "2 4-byte integers, nanosecond time resolution - NOT IMPLEMENTED",
            15 => "3-byte final storage floating point - NOT IMPLEMENTED",
            16 => "variable length null-terminated string of length n+1",
            17 => "Byte of flags",
            18 => "8-byte floating point (IEEE standard, MSB first) - NOT IMPLEMENTED",
            19 => "2-byte integer (LSB first) - NOT IMPLEMENTED",
            20 => "4-byte integer (LSB first) - NOT IMPLEMENTED",
            21 => "2-byte unsigned integer (LSB first) - NOT IMPLEMENTED",
            22 => "4-byte unsigned integer (LSB first) - NOT IMPLEMENTED",
            23 => "2 longs (LSB first), seconds then nanoseconds - NOT IMPLEMENTED",
            24 => "4-byte floating point (IEEE format, LSB first) - NOT IMPLEMENTED",
            25 => "8-byte floating point (IEEE format, LSB first) - NOT IMPLEMENTED",
            26 => "4-byte floating point value - NOT IMPLEMENTED",
            _ => "Unknown",
        }
    }
}

/// A typed slot inside a table record, as declared by the table
/// definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    /// Data type of the values in this slot.
    pub kind: FieldKind,
    /// Field name as programmed on the logger.
    pub name: String,
    /// Processing tag (e.g. "Avg", "Smp").
    pub processing: String,
    /// Units of measurement.
    pub unit: String,
    /// Human-readable description.
    pub description: String,
    /// 1-based index of the first element covered by this entry.
    pub begin_index: u32,
    /// Array length; for string kinds this is the string length.
    pub dimension: u32,
    /// Optional sub-dimension list (zero-terminated on the wire).
    pub sub_dims: Vec<u32>,
}

impl Field {
    /// Size of this field within a record, `None` when variable.
    pub fn wire_size(&self) -> Option<usize> {
        let unit = self.kind.size()?;
        if self.kind.is_string() {
            // Fixed strings occupy exactly `dimension` bytes; variable
            // strings were already filtered by `size()` returning None.
            Some(self.dimension as usize)
        } else {
            Some(unit * self.dimension as usize)
        }
    }

    /// Number of values the decoder must extract for this field: one per
    /// array element, or a single string.
    pub fn value_count(&self) -> u32 {
        if self.kind.is_string() {
            1
        } else {
            self.dimension
        }
    }

    /// Quoted column caption for data file headers. Array fields get a
    /// 1-based element suffix.
    pub fn caption(&self, element: Option<u32>) -> String {
        match element {
            Some(idx) => format!("\"{}({})\"", self.name, idx),
            None => format!("\"{}\"", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_protocol_code_maps() {
        for code in 1u8..=28 {
            let kind = FieldKind::from_code(code);
            assert!(kind.is_some(), "code {code} missing from table");
            assert_eq!(kind.unwrap().code(), code);
        }
        assert!(FieldKind::from_code(0).is_none());
        assert!(FieldKind::from_code(29).is_none());
    }

    #[test]
    fn wire_widths_match_protocol_table() {
        let widths: [(u8, usize); 12] = [
            (1, 1),
            (2, 2),
            (3, 4),
            (7, 2),
            (9, 4),
            (10, 1),
            (13, 6),
            (15, 3),
            (18, 8),
            (26, 4),
            (27, 1),
            (28, 1),
        ];
        for (code, width) in widths {
            assert_eq!(FieldKind::from_code(code).unwrap().size(), Some(width), "code {code}");
        }
        assert_eq!(FieldKind::AsciiZ.size(), None);
    }

    fn field(kind: FieldKind, dimension: u32) -> Field {
        Field {
            kind,
            name: "Temp".into(),
            processing: "Avg".into(),
            unit: "degC".into(),
            description: String::new(),
            begin_index: 1,
            dimension,
            sub_dims: vec![],
        }
    }

    #[test]
    fn array_fields_scale_by_dimension() {
        assert_eq!(field(FieldKind::Ieee4, 3).wire_size(), Some(12));
        assert_eq!(field(FieldKind::Fp2, 1).wire_size(), Some(2));
    }

    #[test]
    fn string_dimension_is_length_not_count() {
        let fixed = field(FieldKind::Ascii, 24);
        assert_eq!(fixed.wire_size(), Some(24));
        assert_eq!(fixed.value_count(), 1);

        let variable = field(FieldKind::AsciiZ, 64);
        assert_eq!(variable.wire_size(), None);
        assert_eq!(variable.value_count(), 1);
    }

    #[test]
    fn captions_carry_element_index() {
        let f = field(FieldKind::Ieee4, 3);
        assert_eq!(f.caption(None), "\"Temp\"");
        assert_eq!(f.caption(Some(2)), "\"Temp(2)\"");
    }
}
