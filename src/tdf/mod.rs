//! Table definition model: TDF parsing and record decoding.

pub mod decode;
mod format;

pub use decode::{final_storage_f32, ieee_f32, parse_record_time, store_record, store_records, SENTINEL};
pub use format::{clean_cache, TableSet};
