//! The incremental collect-data state machine.
//!
//! Collection of a table proceeds in two phases: a last-record query
//! (mode 0x05) to learn how far the logger has written, then a range
//! loop (mode 0x06) walking the cursor forward a few records per
//! request. Records too large for one packet arrive fragmented and are
//! reassembled with mode 0x08 continuation requests before decoding.

use tracing::{debug, error, info, warn};

use super::Bmp5;
use crate::frame::get_uint;
use crate::message::{Expected, Protocol};
use crate::tdf::{parse_record_time, store_records};
use crate::transport::Transport;
use crate::types::{NSec, Table, TableOptions};
use crate::writer::{flush_table, TableWriter};
use crate::{PakBusError, Result};

/// Collect responses carrying at least this many fragment bytes signal
/// that more fragments follow a variable-size record.
const FRAGMENT_FULL_SIZE: usize = 512;

/// Target data bytes per range request; bounds the records asked for in
/// one exchange.
const REQUEST_BUDGET: usize = 512;

/// Attempts at one record index before it is skipped.
const MAX_BAD_RECORD_ATTEMPTS: u32 = 3;

/// Collect command modes used by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectCmd {
    /// Mode 0x05: collect the most recent P1 records.
    LastRecord,
    /// Mode 0x06: collect records P1 (inclusive) to P2 (exclusive).
    Range,
    /// Mode 0x08: collect the rest of a fragmented record from byte
    /// offset P2.
    Fragment,
}

impl CollectCmd {
    fn mode_byte(self) -> u8 {
        match self {
            CollectCmd::LastRecord => 0x05,
            CollectCmd::Range => 0x06,
            CollectCmd::Fragment => 0x08,
        }
    }
}

impl<'a, T: Transport> Bmp5<'a, T> {
    /// Collect every new record of `table` and hand the decoded values
    /// to the writer, advancing the persistent cursor as records are
    /// stored.
    pub fn collect_data<W: TableWriter>(
        &mut self,
        writer: &mut W,
        table: &mut Table,
        opts: &TableOptions,
    ) -> Result<()> {
        let record_size = table.record_size();
        let recs_per_request = match record_size {
            Some(size) if size > 0 && size < REQUEST_BUDGET => (REQUEST_BUDGET / size) as u32,
            _ => 1,
        };

        if table.size > 1 {
            let mut last = None;
            for _ in 0..3 {
                if let Some(stat) = self.query_last_record(table)? {
                    last = Some(stat);
                    break;
                }
            }
            let Some((last_rec_nbr, last_rec_time)) = last else {
                error!(
                    "Failed to retrieve information about last record stored in [{}] on datalogger memory",
                    table.name
                );
                return Ok(());
            };

            debug!(
                "Record index information for {}: last stored {last_rec_nbr}, next to collect {}",
                table.name, table.cursor.next_record
            );

            let records_pending = i64::from(last_rec_nbr) - i64::from(table.cursor.next_record);

            if records_pending == -1 && table.cursor.last_record_time == last_rec_time {
                info!("No new data is available yet for: {}", table.name);
                return Ok(());
            }

            if records_pending < 0 || records_pending >= i64::from(table.size) {
                if records_pending == -1 {
                    info!(
                        "Different timestamp found for identical record id in {}: stored {}, collected {}",
                        table.name,
                        last_rec_time.record_timestamp(),
                        table.cursor.last_record_time.record_timestamp()
                    );
                } else if records_pending < -1 && table.cursor.last_record_time > last_rec_time {
                    warn!(
                        "Backward shift observed in datalogger clock; check data from table {} \
                         (last stored record {last_rec_nbr} at {})",
                        table.name,
                        last_rec_time.record_timestamp()
                    );
                }

                // The ring buffer wrapped or was reset underneath us:
                // restart from the oldest record still held.
                let new_index = i64::from(last_rec_nbr) - i64::from(table.size) + 2;
                table.cursor.next_record = new_index.max(1) as u32;
                info!(
                    "Adjusting start record index for {} (table size {}): advancing next collection record to {}",
                    table.name, table.size, table.cursor.next_record
                );
                if table.cursor.new_file_time != 0 {
                    flush_table(writer, table)?;
                }
            }

            writer.init_write(table, opts)?;
            let outcome =
                self.run_range_loop(writer, table, record_size, recs_per_request, last_rec_nbr);
            writer.finish_write(table)?;
            outcome?;
        } else {
            // Tables without a meaningful capacity are collected in one
            // shot via the last-record mode.
            writer.init_write(table, opts)?;
            let outcome = self
                .collect_exchange(writer, table, record_size, CollectCmd::LastRecord, 1, 0)
                .map(|_| ());
            writer.finish_write(table)?;
            outcome?;
        }

        // If the next expected sample would land beyond the open file's
        // boundary, close the segment now rather than leaving a stub for
        // the next run.
        if opts.sample_int_secs >= 0 && table.cursor.last_record_time.sec > 0 {
            let next_sample = i64::from(table.cursor.last_record_time.sec) + opts.sample_int_secs;
            if next_sample >= i64::from(table.cursor.new_file_time) {
                flush_table(writer, table)?;
            }
        }
        Ok(())
    }

    fn run_range_loop<W: TableWriter>(
        &mut self,
        writer: &mut W,
        table: &mut Table,
        record_size: Option<usize>,
        recs_per_request: u32,
        last_rec_nbr: u32,
    ) -> Result<()> {
        let mut last_bad_index: Option<u32> = None;
        let mut bad_attempts: u32 = 0;
        let mut collected: u64 = 0;

        while table.cursor.next_record <= last_rec_nbr {
            let beg = table.cursor.next_record;
            let got = self.collect_exchange(
                &mut *writer,
                table,
                record_size,
                CollectCmd::Range,
                beg,
                beg.saturating_add(recs_per_request),
            )?;

            match got {
                None => break,
                Some(0) => {
                    if last_bad_index != Some(beg) {
                        bad_attempts = 1;
                        last_bad_index = Some(beg);
                    } else if bad_attempts < MAX_BAD_RECORD_ATTEMPTS - 1 {
                        bad_attempts += 1;
                    } else {
                        bad_attempts = 0;
                        error!(
                            "Failed to collect record with index {beg} ({MAX_BAD_RECORD_ATTEMPTS} attempts failed)"
                        );
                        table.cursor.next_record = beg + 1;
                        info!(
                            "Advancing collection to record index: {}",
                            table.cursor.next_record
                        );
                    }
                }
                Some(n) => collected += u64::from(n),
            }
        }

        debug!("Collected {collected} records from {}", table.name);
        Ok(())
    }

    /// Query the index and timestamp of the most recent record the
    /// logger holds for `table`. Returns `None` when the response was
    /// unusable.
    fn query_last_record(&mut self, table: &Table) -> Result<Option<(u32, NSec)>> {
        let tran = self.send_collect_cmd(table, CollectCmd::LastRecord, 1, 0)?;
        let Some(payload) =
            self.link.read_response(Expected { msg_type: 0x89, tran_nbr: tran }, "collect inquiry")?
        else {
            return Ok(None);
        };

        let body = &payload[10..payload.len() - 2];
        if !check_collect_status(table, body)? {
            return Ok(None);
        }
        if body.len() < 9 {
            warn!("No data available from table - {}", table.name);
            return Ok(None);
        }

        let beg_rec_nbr = get_uint(&body[3..7]);
        let fragmented = body[7] & 0x80 != 0;
        let time_offset = if fragmented { 11 } else { 9 };
        if body.len() < time_offset + 8 {
            warn!("No data available from table - {}", table.name);
            return Ok(None);
        }
        let record_time = parse_record_time(&body[time_offset..])?;
        Ok(Some((beg_rec_nbr, record_time)))
    }

    /// One collect exchange, following fragment continuations until a
    /// complete record (or batch of records) can be decoded.
    ///
    /// Returns `Ok(None)` when the response was unusable for this table
    /// and the caller should stop, `Ok(Some(n))` with the number of
    /// records stored otherwise.
    fn collect_exchange<W: TableWriter>(
        &mut self,
        writer: &mut W,
        table: &mut Table,
        record_size: Option<usize>,
        cmd: CollectCmd,
        p1: u32,
        p2: u32,
    ) -> Result<Option<u32>> {
        let mut cmd = cmd;
        let mut p1 = p1;
        let mut p2 = p2;
        let mut reassembly: Vec<u8> = Vec::new();
        let mut accumulated = 0usize;

        loop {
            let tran = self.send_collect_cmd(table, cmd, p1, p2)?;
            let Some(payload) =
                self.link.read_response(Expected { msg_type: 0x89, tran_nbr: tran }, "collect")?
            else {
                return Ok(Some(0));
            };

            let body = &payload[10..payload.len() - 2];
            if !check_collect_status(table, body)? {
                return Ok(None);
            }
            if body.len() < 9 {
                warn!("No data available from table - {}", table.name);
                return Ok(None);
            }

            let beg_rec_nbr = get_uint(&body[3..7]);
            let fragmented = body[7] & 0x80 != 0;

            if fragmented {
                if body.len() < 11 {
                    warn!("Fragmented response too short from table - {}", table.name);
                    return Ok(None);
                }
                let offset = (get_uint(&body[7..11]) & 0x7fff_ffff) as usize;
                let data = &body[11..];

                if reassembly.len() < offset + data.len() {
                    reassembly.resize(offset + data.len(), 0);
                }
                reassembly[offset..offset + data.len()].copy_from_slice(data);
                accumulated += data.len();

                // Continue this record from the byte after what we have.
                cmd = CollectCmd::Fragment;
                p1 = beg_rec_nbr;
                p2 = (offset + data.len()) as u32;

                let complete = match record_size {
                    // Variable-size records end with a short fragment.
                    None => data.len() < FRAGMENT_FULL_SIZE,
                    Some(size) => accumulated >= size,
                };
                if complete {
                    store_records(writer, table, &reassembly, beg_rec_nbr, 1)?;
                    return Ok(Some(1));
                }
            } else {
                let nrecs = (get_uint(&body[7..9]) & 0x7fff) as u32;
                if nrecs == 0 {
                    return Ok(Some(0));
                }
                store_records(writer, table, &body[9..], beg_rec_nbr, nrecs)?;
                return Ok(Some(nrecs));
            }
        }
    }

    /// Serialize and send one collect command for `table`.
    fn send_collect_cmd(&mut self, table: &Table, cmd: CollectCmd, p1: u32, p2: u32) -> Result<u8> {
        self.link.set_priority(0x02);

        let mut body = Vec::with_capacity(17);
        body.extend_from_slice(&self.security_prefix());
        body.push(cmd.mode_byte());
        body.extend_from_slice(&(table.number).to_be_bytes());
        body.extend_from_slice(&(table.signature).to_be_bytes());
        body.extend_from_slice(&p1.to_be_bytes());
        if cmd != CollectCmd::LastRecord {
            body.extend_from_slice(&p2.to_be_bytes());
        }
        // Empty field list: collect whole records.
        body.extend_from_slice(&[0x00, 0x00]);

        let tran = self.link.next_tran_nbr();
        self.link.send_message(Protocol::Bmp5, 0x09, tran, &body)?;
        Ok(tran)
    }
}

/// Validate the fixed head of a collect response. `Ok(false)` marks a
/// soft failure (log and stop collecting this table), errors are
/// protocol-level and propagate.
fn check_collect_status(table: &Table, body: &[u8]) -> Result<bool> {
    if body.len() < 3 {
        warn!("Invalid response - data packet smaller than 12 bytes.");
        return Ok(false);
    }
    let status = body[0];
    if status != 0 {
        return Err(match status {
            // The logger's definitions no longer match ours; the caller
            // refetches the TDF and tries again.
            0x01 | 0x07 => PakBusError::InvalidTdf { code: status },
            0x02 => PakBusError::parse("collect", "insufficient resources on logger"),
            other => PakBusError::parse("collect", format!("collect error code {other:#04x}")),
        });
    }

    let table_nbr = get_uint(&body[1..3]) as u16;
    if table_nbr != table.number {
        warn!("No data available from table - {}", table.name);
        return Ok(false);
    }
    Ok(true)
}
