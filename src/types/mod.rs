//! Core data model: time values, field metadata, tables and cursors.

mod field;
mod nsec;
mod table;

pub use field::{Field, FieldKind};
pub use nsec::{NSec, SECS_BEFORE_1990};
pub use table::{ProgStats, StationInfo, Table, TableCursor, TableOptions};
