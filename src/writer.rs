//! Record storage: the writer contract driven by the record decoder, and
//! the TOA5-compatible ASCII file writer.
//!
//! The decoder calls, per table: `init_write`, then for each record
//! `record_begin`, one `store_*` call per decoded value in field-list
//! order, `record_end`, and finally one `finish_write` (or `flush` when
//! the cursor is reset mid-run). The writer owns file lifecycle: data
//! accumulates in a `.working/<Table>.tmp` file which rolls over on the
//! configured span boundary and is renamed to
//! `<Table>.<YYYYMMDD>_<HHMMSS>.raw` when the segment closes.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::types::{Field, NSec, ProgStats, StationInfo, Table, TableCursor, TableOptions};
use crate::{PakBusError, Result};

/// Callback interface between the record decoder and a storage backend.
pub trait TableWriter {
    /// Called when data collection starts for a table.
    fn init_write(&mut self, table: &Table, opts: &TableOptions) -> Result<()>;

    /// Called before the values of one record are stored. The writer may
    /// roll the output file here and updates the cursor's file-tracking
    /// fields when it does.
    fn record_begin(&mut self, cursor: &mut TableCursor, record_idx: u32, record_time: NSec)
        -> Result<()>;

    /// Store an unsigned integer sample.
    fn store_u32(&mut self, field: &Field, value: u32) -> Result<()>;

    /// Store a signed integer sample.
    fn store_i32(&mut self, field: &Field, value: i32) -> Result<()>;

    /// Store a floating point sample.
    fn store_f32(&mut self, field: &Field, value: f32) -> Result<()>;

    /// Store a boolean sample.
    fn store_bool(&mut self, field: &Field, value: bool) -> Result<()>;

    /// Store a string sample.
    fn store_string(&mut self, field: &Field, value: &str) -> Result<()>;

    /// Called for a sample whose declared type this client cannot
    /// decode.
    fn process_unimplemented(&mut self, field: &Field) -> Result<()>;

    /// Called after the last value of a record.
    fn record_end(&mut self) -> Result<()>;

    /// Called once when data collection for the table completes. Leaves
    /// the in-progress file in place for the next session to append to.
    fn finish_write(&mut self, table: &Table) -> Result<()>;

    /// Close and finalize the current output file immediately, e.g. when
    /// the collection cursor was reset mid-run.
    fn flush(&mut self, table: &Table) -> Result<()>;
}

/// Close the writer's current segment for `table` and clear the cursor's
/// file-tracking state so the next record opens a fresh file.
pub fn flush_table<W: TableWriter>(writer: &mut W, table: &mut Table) -> Result<()> {
    writer.flush(table)?;
    table.cursor.new_file_time = 0;
    table.cursor.first_sample_in_file = 0;
    Ok(())
}

/// Identity block written into every data file header.
#[derive(Debug, Clone, Default)]
pub struct FileHeaderInfo {
    /// Station-level identity from the configuration file.
    pub station: StationInfo,
    /// Logger programming statistics from the current session.
    pub prog: ProgStats,
}

#[derive(Debug, Clone)]
struct TableContext {
    name: String,
    fields: Vec<Field>,
    file_span: u32,
}

/// Comma-separated ASCII writer producing TOA5-compatible data files.
pub struct AsciiWriter {
    working_path: PathBuf,
    separator: char,
    header_info: FileHeaderInfo,
    stream: Option<BufWriter<File>>,
    context: Option<TableContext>,
    record_count: u64,
}

impl AsciiWriter {
    /// Create a writer rooted at the working path.
    pub fn new(working_path: impl Into<PathBuf>, header_info: FileHeaderInfo) -> Self {
        AsciiWriter {
            working_path: working_path.into(),
            separator: ',',
            header_info,
            stream: None,
            context: None,
            record_count: 0,
        }
    }

    /// Update the programming statistics used in file headers, once they
    /// have been fetched from the logger.
    pub fn set_prog_stats(&mut self, prog: ProgStats) {
        self.header_info.prog = prog;
    }

    fn tmp_path(&self, table_name: &str) -> PathBuf {
        self.working_path.join(".working").join(format!("{table_name}.tmp"))
    }

    fn context(&self) -> Result<&TableContext> {
        self.context
            .as_ref()
            .ok_or_else(|| PakBusError::storage("?", "writer used before init_write"))
    }

    fn stream(&mut self) -> Result<&mut BufWriter<File>> {
        let name = self.context.as_ref().map(|c| c.name.clone()).unwrap_or_default();
        self.stream
            .as_mut()
            .ok_or_else(|| PakBusError::storage(name, "no open data file"))
    }

    fn report_record_count(&mut self) {
        if self.record_count > 0 {
            debug!("Wrote {} records", self.record_count);
            self.record_count = 0;
        }
    }

    /// Open the table's temporary data file. In append mode a missing or
    /// empty file silently becomes a fresh file with a new header.
    fn open_data_file(&mut self, append: bool) -> Result<()> {
        let ctx = self.context()?.clone();
        let path = self.tmp_path(&ctx.name);

        let append = append && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = if append {
            OpenOptions::new().append(true).open(&path)
        } else {
            File::create(&path)
        }
        .map_err(|e| {
            error!("Failed to open data file: {}", path.display());
            PakBusError::storage(&ctx.name, format!("failed to open {}: {e}", path.display()))
        })?;

        self.stream = Some(BufWriter::new(file));
        if !append {
            self.write_header()?;
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let ctx = self.context()?.clone();
        let info = self.header_info.clone();
        let app_tag = format!("{}-{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        let stream = self.stream()?;

        writeln!(
            stream,
            "\"TOA5\",\"{}\",\"{}\",\"{}\",\"{}\",\"{}\",\"{}\",\"{}\",\"{}\"",
            info.station.station_name,
            info.station.logger_type,
            info.prog.serial_no,
            info.prog.os_version,
            info.prog.prog_name,
            info.prog.prog_sig,
            ctx.name,
            app_tag,
        )
        .map_err(|e| PakBusError::storage(&ctx.name, e.to_string()))?;

        let names = header_line("\"TIMESTAMP\",\"RECORD\"", &ctx.fields, |f, dim| f.caption(dim));
        let units = header_line("\"TS\",\"RN\"", &ctx.fields, |f, _| format!("\"{}\"", f.unit));
        let procs = header_line("\"\",\"\"", &ctx.fields, |f, _| format!("\"{}\"", f.processing));
        for line in [names, units, procs] {
            writeln!(stream, "{line}").map_err(|e| PakBusError::storage(&ctx.name, e.to_string()))?;
        }
        Ok(())
    }

    /// Rename the temporary data file to its final timestamped name in
    /// the working path root. Zero-length temporaries are removed
    /// instead.
    fn move_raw_file(&mut self, table: &Table) -> Result<()> {
        let tmp_path = self.tmp_path(&table.name);

        let Some(stamp) = NSec::new(table.cursor.first_sample_in_file, 0).file_timestamp() else {
            return Ok(());
        };
        let final_path = self.working_path.join(format!("{}.{stamp}.raw", table.name));

        match fs::metadata(&tmp_path) {
            Ok(meta) if meta.len() == 0 => {
                info!("Removing zero-length temporary file: {}", tmp_path.display());
                let _ = fs::remove_file(&tmp_path);
                return Ok(());
            }
            Ok(_) => {}
            Err(_) => {
                warn!("Failed to validate file size for {}", tmp_path.display());
            }
        }

        match fs::rename(&tmp_path, &final_path) {
            Ok(()) => {
                let size = fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);
                info!("Created: {} ({size} bytes)", final_path.display());
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to rename {} to {}: {e}",
                    tmp_path.display(),
                    final_path.display()
                );
                Err(PakBusError::storage(&table.name, format!("rename failed: {e}")))
            }
        }
    }

    fn write_value(&mut self, text: impl std::fmt::Display) -> Result<()> {
        let sep = self.separator;
        let name = self.context.as_ref().map(|c| c.name.clone()).unwrap_or_default();
        let stream = self.stream()?;
        write!(stream, "{sep}{text}").map_err(|e| PakBusError::storage(name, e.to_string()))
    }
}

fn header_line(
    prefix: &str,
    fields: &[Field],
    fmt: impl Fn(&Field, Option<u32>) -> String,
) -> String {
    let mut line = String::from(prefix);
    for field in fields {
        if field.dimension > 1 && !field.kind.is_string() {
            for dim in 1..=field.dimension {
                line.push(',');
                line.push_str(&fmt(field, Some(dim)));
            }
        } else {
            line.push(',');
            line.push_str(&fmt(field, None));
        }
    }
    line
}

/// The rollover boundary following `sec` for a given file span.
fn next_file_boundary(sec: u32, file_span: u32) -> u32 {
    let span = file_span.max(1);
    span * (sec / span) + span
}

impl TableWriter for AsciiWriter {
    fn init_write(&mut self, table: &Table, opts: &TableOptions) -> Result<()> {
        self.context = Some(TableContext {
            name: table.name.clone(),
            fields: table.fields.clone(),
            file_span: if opts.file_span_secs == 0 { 3600 } else { opts.file_span_secs },
        });
        self.record_count = 0;
        // A live cursor means the previous run left a partial file to
        // append to; otherwise start a fresh one.
        self.open_data_file(table.cursor.new_file_time != 0)
    }

    fn record_begin(
        &mut self,
        cursor: &mut TableCursor,
        record_idx: u32,
        record_time: NSec,
    ) -> Result<()> {
        let ctx = self.context()?.clone();

        if record_time.sec >= cursor.new_file_time {
            // The record crosses the span boundary: finalize the open
            // segment and start the next file.
            if self.stream.is_some() && cursor.first_sample_in_file != 0 {
                let stream = self.stream()?;
                stream
                    .flush()
                    .map_err(|e| PakBusError::storage(&ctx.name, e.to_string()))?;
                self.stream = None;
                self.report_record_count();

                let tmp_path = self.tmp_path(&ctx.name);
                if let Some(stamp) = NSec::new(cursor.first_sample_in_file, 0).file_timestamp() {
                    let final_path = self.working_path.join(format!("{}.{stamp}.raw", ctx.name));
                    fs::rename(&tmp_path, &final_path)
                        .map_err(|e| PakBusError::storage(&ctx.name, format!("rename failed: {e}")))?;
                    let size = fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);
                    info!("Created: {} ({size} bytes)", final_path.display());
                }
                self.open_data_file(false)?;
            }
            cursor.first_sample_in_file = record_time.sec;
            cursor.new_file_time = next_file_boundary(record_time.sec, ctx.file_span);
        }

        let sep = self.separator;
        let stream = self.stream()?;
        write!(stream, "{}{sep}{record_idx}", record_time.record_timestamp())
            .map_err(|e| PakBusError::storage(&ctx.name, e.to_string()))
    }

    fn store_u32(&mut self, _field: &Field, value: u32) -> Result<()> {
        self.write_value(value)
    }

    fn store_i32(&mut self, _field: &Field, value: i32) -> Result<()> {
        self.write_value(value)
    }

    fn store_f32(&mut self, _field: &Field, value: f32) -> Result<()> {
        self.write_value(value)
    }

    fn store_bool(&mut self, _field: &Field, value: bool) -> Result<()> {
        self.write_value(if value { 1 } else { 0 })
    }

    fn store_string(&mut self, _field: &Field, value: &str) -> Result<()> {
        self.write_value(format_args!("\"{value}\""))
    }

    fn process_unimplemented(&mut self, _field: &Field) -> Result<()> {
        self.write_value("-9999")
    }

    fn record_end(&mut self) -> Result<()> {
        let name = self.context.as_ref().map(|c| c.name.clone()).unwrap_or_default();
        let stream = self.stream()?;
        writeln!(stream).map_err(|e| PakBusError::storage(name, e.to_string()))?;
        self.record_count += 1;
        Ok(())
    }

    fn finish_write(&mut self, table: &Table) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream
                .flush()
                .map_err(|e| PakBusError::storage(&table.name, format!("file closing error: {e}")))?;
        }
        self.report_record_count();
        Ok(())
    }

    fn flush(&mut self, table: &Table) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.flush();
        }
        self.move_raw_file(table)
    }
}

/// Ensure the working directory layout exists: `<path>` and
/// `<path>/.working`.
pub fn setup_working_dirs(working_path: &Path) -> Result<()> {
    for dir in [working_path.to_path_buf(), working_path.join(".working")] {
        match fs::create_dir(&dir) {
            Ok(()) => info!("Created: {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(PakBusError::io(dir, e)),
        }
    }
    Ok(())
}
