//! BMP5 transactions: clock, programming statistics, file upload and
//! the table/file control commands. The collect-data state machine lives
//! in [`collect`].

mod collect;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::frame::{get_cstring, get_uint, put_uint};
use crate::message::{Expected, MessageLayer, Protocol};
use crate::transport::Transport;
use crate::types::ProgStats;
use crate::{PakBusError, Result};

/// Bytes of file content requested per FileUpload exchange.
const UPLOAD_SWATH: u16 = 0x03d9;

/// Attempts at one upload offset before the transfer is abandoned.
const UPLOAD_RETRIES: u32 = 3;

/// BMP5 protocol client over a shared message layer.
pub struct Bmp5<'a, T: Transport> {
    link: &'a mut MessageLayer<T>,
}

impl<'a, T: Transport> Bmp5<'a, T> {
    /// Borrow the message layer for BMP5 transactions.
    pub fn new(link: &'a mut MessageLayer<T>) -> Self {
        Bmp5 { link }
    }

    fn security_prefix(&self) -> [u8; 2] {
        let code = self.link.peer().security_code;
        [(code >> 8) as u8, (code & 0xff) as u8]
    }

    fn clock_exchange(&mut self, secs_adj: u32, nsecs_adj: u32) -> Result<Vec<u8>> {
        self.link.set_priority(0x02);
        let mut body = [0u8; 10];
        body[0..2].copy_from_slice(&self.security_prefix());
        put_uint(&mut body[2..6], secs_adj, 4);
        put_uint(&mut body[6..10], nsecs_adj, 4);

        let tran = self.link.next_tran_nbr();
        self.link.send_message(Protocol::Bmp5, 0x17, tran, &body)?;
        self.link
            .read_response(Expected { msg_type: 0x97, tran_nbr: tran }, "Clock Transaction")?
            .ok_or_else(|| PakBusError::Clock { details: "no reply from logger".into() })
    }

    /// Query the logger clock. Returns epoch-1990 seconds.
    pub fn check_clock(&mut self) -> Result<u32> {
        let payload = self.clock_exchange(0, 0)?;
        if payload.len() < 15 {
            return Err(PakBusError::Clock { details: "short clock response".into() });
        }
        Ok(get_uint(&payload[11..15]))
    }

    /// Adjust the logger clock by `offset_secs` (negative when the
    /// logger runs ahead). Succeeds iff the response code byte is zero.
    pub fn set_clock(&mut self, offset_secs: i64) -> Result<()> {
        let payload = self.clock_exchange(offset_secs as i32 as u32, 0)?;
        match payload.get(10) {
            Some(0) => Ok(()),
            Some(code) => Err(PakBusError::Clock {
                details: format!("logger refused clock update (code {code:#04x})"),
            }),
            None => Err(PakBusError::Clock { details: "short clock response".into() }),
        }
    }

    /// Fetch the logger's programming statistics, needed for the data
    /// file header line.
    pub fn get_prog_stats(&mut self) -> Result<ProgStats> {
        self.link.set_priority(0x02);
        let body = self.security_prefix();
        let tran = self.link.next_tran_nbr();
        self.link.send_message(Protocol::Bmp5, 0x18, tran, &body)?;

        let payload = self
            .link
            .read_response(
                Expected { msg_type: 0x98, tran_nbr: tran },
                "Get Programming Statistics Transaction",
            )?
            .ok_or_else(|| {
                PakBusError::parse("prog stats", "failed to obtain programming statistics")
            })?;

        let resp_code = payload.get(10).copied().unwrap_or(0x01);
        if resp_code != 0 {
            return Err(PakBusError::parse(
                "prog stats",
                format!("logger response code {resp_code:#04x}"),
            ));
        }

        let overrun = || PakBusError::parse("prog stats", "truncated response");
        let end = payload.len() - 2;
        let body = &payload[11..end];
        let mut pos = 0usize;

        let (os_version, used) = get_cstring(&body[pos..]).ok_or_else(overrun)?;
        pos += used;
        if pos + 2 > body.len() {
            return Err(overrun());
        }
        let os_sig = get_uint(&body[pos..pos + 2]) as u16;
        pos += 2;

        let (serial_raw, used) = get_cstring(&body[pos..]).ok_or_else(overrun)?;
        pos += used;
        let serial_no = if serial_raw.parse::<i64>().is_ok() {
            serial_raw
        } else {
            String::from("Unknown")
        };

        let (powerup_prog, used) = get_cstring(&body[pos..]).ok_or_else(overrun)?;
        // A pad byte follows the power-up program name.
        pos += used + 1;
        if pos > body.len() {
            return Err(overrun());
        }

        let (prog_name, used) = get_cstring(&body[pos..]).ok_or_else(overrun)?;
        pos += used;
        if pos + 2 > body.len() {
            return Err(overrun());
        }
        let prog_sig = get_uint(&body[pos..pos + 2]) as u16;

        debug!("Logger prog stats: os {os_version}, serial {serial_no}, program {prog_name}");
        Ok(ProgStats { os_version, os_sig, serial_no, powerup_prog, prog_name, prog_sig })
    }

    /// Upload a file from the logger to `dest` on the host. Used to
    /// fetch the table definitions via the `.TDF` pseudopath.
    ///
    /// On any failure the partial destination file is removed and a
    /// final close-flag request tells the logger to drop its end of the
    /// transaction.
    pub fn file_upload(&mut self, file_name: &str, dest: &Path) -> Result<()> {
        self.upload_with_delay(file_name, dest, Duration::from_secs(1))
    }

    pub(crate) fn upload_with_delay(
        &mut self,
        file_name: &str,
        dest: &Path,
        retry_delay: Duration,
    ) -> Result<()> {
        self.link.set_priority(0x02);
        let tran = self.link.next_tran_nbr();

        let file = File::create(dest).map_err(|e| {
            error!("Failed to open: {}", dest.display());
            PakBusError::io(dest, e)
        })?;
        let mut out = BufWriter::new(file);

        let mut offset: u32 = 0;
        let mut misses: u32 = 0;
        let mut failed = false;

        loop {
            self.send_upload_request(file_name, tran, 0x00, offset, UPLOAD_SWATH)?;
            let reply = self
                .link
                .read_response(Expected { msg_type: 0x9d, tran_nbr: tran }, "File Upload Transaction");

            let payload = match reply {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    misses += 1;
                    if misses >= UPLOAD_RETRIES {
                        warn!("No data was found to read.");
                        failed = true;
                        break;
                    }
                    std::thread::sleep(retry_delay);
                    continue;
                }
                Err(PakBusError::DeliveryFailure { code }) => {
                    warn!("File upload aborted: {}", PakBusError::DeliveryFailure { code });
                    failed = true;
                    break;
                }
                Err(e) => return Err(e),
            };
            misses = 0;

            let status = payload.get(10).copied().unwrap_or(0xff);
            if status != 0 {
                let reason = match status {
                    0x01 => "Permission denied",
                    0x0d => "Invalid filename",
                    0x0e => "File currently unavailable",
                    _ => "Unknown upload error",
                };
                error!("File upload of {file_name} failed: {reason}");
                failed = true;
                break;
            }

            if payload.len() < 17 {
                warn!("Malformed upload response from logger");
                failed = true;
                break;
            }
            // Body: status, 4-byte offset echo, then file content.
            let chunk = &payload[15..payload.len() - 2];
            if out.write_all(chunk).and_then(|()| out.flush()).is_err() {
                warn!("I/O error occurred while writing to: {}", dest.display());
                failed = true;
                break;
            }
            offset += chunk.len() as u32;

            if chunk.len() < usize::from(UPLOAD_SWATH) {
                break;
            }
        }

        if failed || offset == 0 {
            // Final exchange with the close flag set so the logger can
            // release the file, then drop the partial copy.
            self.send_upload_request(file_name, tran, 0x01, offset, 0)?;
            let _ = self
                .link
                .read_response(Expected { msg_type: 0x9d, tran_nbr: tran }, "File Upload Close");
            drop(out);
            info!("Removing possibly corrupted file: {}", dest.display());
            let _ = std::fs::remove_file(dest);
            return Err(PakBusError::parse(
                "file upload",
                format!("failed to upload {file_name}"),
            ));
        }

        info!("Uploaded {file_name}: {offset} bytes");
        Ok(())
    }

    fn send_upload_request(
        &mut self,
        file_name: &str,
        tran: u8,
        close_flag: u8,
        offset: u32,
        swath: u16,
    ) -> Result<()> {
        let name = file_name.as_bytes();
        let mut body = Vec::with_capacity(name.len() + 10);
        body.extend_from_slice(&self.security_prefix());
        body.extend_from_slice(name);
        body.push(0x00);
        body.push(close_flag);
        let mut num = [0u8; 4];
        put_uint(&mut num, offset, 4);
        body.extend_from_slice(&num);
        put_uint(&mut num[0..2], u32::from(swath), 2);
        body.extend_from_slice(&num[0..2]);
        self.link.send_message(Protocol::Bmp5, 0x1d, tran, &body)
    }

    /// Administer the logger's tables: `0x01` resets a table, `0x02`
    /// rolls file-managed tables over.
    pub fn control_table(&mut self, ctrl_opt: u8) -> Result<()> {
        self.link.set_priority(0x02);
        let mut body = Vec::with_capacity(3);
        body.extend_from_slice(&self.security_prefix());
        body.push(ctrl_opt);

        let tran = self.link.next_tran_nbr();
        self.link.send_message(Protocol::Bmp5, 0x19, tran, &body)?;

        let payload = self
            .link
            .read_response(Expected { msg_type: 0x99, tran_nbr: tran }, "Control Table Transaction")?
            .ok_or_else(|| PakBusError::parse("control table", "no reply from logger"))?;

        match payload.get(10) {
            Some(0) => Ok(()),
            other => Err(PakBusError::parse(
                "control table",
                format!("logger response code {:#04x}", other.copied().unwrap_or(0xff)),
            )),
        }
    }

    /// File-control transaction: compile/run/stop/delete program files
    /// on the logger. On success the logger may request a hold-off
    /// period, which is honored before returning.
    pub fn control_file(&mut self, file_name: &str, command: u8) -> Result<()> {
        self.link.set_priority(0x02);
        let name = file_name.as_bytes();
        let mut body = Vec::with_capacity(name.len() + 4);
        body.extend_from_slice(&self.security_prefix());
        body.extend_from_slice(name);
        body.push(0x00);
        body.push(command);

        let tran = self.link.next_tran_nbr();
        self.link.send_message(Protocol::Bmp5, 0x1e, tran, &body)?;

        let payload = self
            .link
            .read_response(Expected { msg_type: 0x9e, tran_nbr: tran }, "Control File Transaction")?
            .ok_or_else(|| PakBusError::parse("control file", "no reply from logger"))?;

        match payload.get(10) {
            Some(0) => {
                let hold_off = if payload.len() >= 15 { get_uint(&payload[11..13]) } else { 0 };
                if hold_off > 0 {
                    debug!("Logger requested {hold_off}s hold-off after file control");
                    std::thread::sleep(Duration::from_secs(u64::from(hold_off)));
                }
                Ok(())
            }
            other => Err(PakBusError::parse(
                "control file",
                format!("logger response code {:#04x}", other.copied().unwrap_or(0xff)),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{PakBusAddress, LOCAL_NODE_ID, LOCAL_PHYS_ADDR};
    use crate::sim::{build_message_frame, ScriptedTransport};

    fn peer() -> PakBusAddress {
        PakBusAddress { phys_addr: 0x01, node_id: 0x01, security_code: 0x1234 }
    }

    fn reply(msg_type: u8, tran: u8, body: &[u8]) -> Vec<u8> {
        build_message_frame(
            (peer().phys_addr, peer().node_id),
            (LOCAL_PHYS_ADDR, LOCAL_NODE_ID),
            1,
            msg_type,
            tran,
            body,
        )
    }

    #[test]
    fn check_clock_returns_logger_seconds() {
        // Response body: code, then the logger's NSec time.
        let mut body = vec![0x00];
        body.extend_from_slice(&1_000_000u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        let transport = ScriptedTransport::new(vec![reply(0x97, 1, &body)]);
        let mut link = MessageLayer::new(transport, peer());

        let secs = Bmp5::new(&mut link).check_clock().unwrap();
        assert_eq!(secs, 1_000_000);

        // The request carried the security code and zero adjustment.
        let sent = link.transport_mut().sent_payloads();
        assert_eq!(sent[0][8], 0x17);
        assert_eq!(&sent[0][10..12], &[0x12, 0x34]);
        assert_eq!(&sent[0][12..20], &[0u8; 8]);
    }

    #[test]
    fn clock_set_polarity() {
        // Zero response code means the update was accepted.
        let ok = ScriptedTransport::new(vec![reply(0x97, 1, &[0x00, 0, 0, 0, 0])]);
        let mut link = MessageLayer::new(ok, peer());
        Bmp5::new(&mut link).set_clock(-3).unwrap();

        let refused = ScriptedTransport::new(vec![reply(0x97, 1, &[0x01, 0, 0, 0, 0])]);
        let mut link = MessageLayer::new(refused, peer());
        match Bmp5::new(&mut link).set_clock(-3) {
            Err(PakBusError::Clock { .. }) => {}
            other => panic!("Expected clock error, got {other:?}"),
        }
    }

    #[test]
    fn negative_clock_offset_serializes_twos_complement() {
        let ok = ScriptedTransport::new(vec![reply(0x97, 1, &[0x00])]);
        let mut link = MessageLayer::new(ok, peer());
        Bmp5::new(&mut link).set_clock(-2).unwrap();
        let sent = link.transport_mut().sent_payloads();
        assert_eq!(&sent[0][12..16], &[0xff, 0xff, 0xff, 0xfe]);
    }

    fn prog_stats_body() -> Vec<u8> {
        let mut body = vec![0x00];
        body.extend_from_slice(b"CR1000.Std.32\0");
        body.extend_from_slice(&0x0102u16.to_be_bytes());
        body.extend_from_slice(b"4527\0");
        body.extend_from_slice(b"CPU:met.cr1\0");
        body.push(0x00); // pad byte after power-up program
        body.extend_from_slice(b"CPU:met.cr1\0");
        body.extend_from_slice(&0xbeefu16.to_be_bytes());
        body
    }

    #[test]
    fn prog_stats_positional_parse() {
        let transport = ScriptedTransport::new(vec![reply(0x98, 1, &prog_stats_body())]);
        let mut link = MessageLayer::new(transport, peer());
        let stats = Bmp5::new(&mut link).get_prog_stats().unwrap();
        assert_eq!(stats.os_version, "CR1000.Std.32");
        assert_eq!(stats.os_sig, 0x0102);
        assert_eq!(stats.serial_no, "4527");
        assert_eq!(stats.powerup_prog, "CPU:met.cr1");
        assert_eq!(stats.prog_name, "CPU:met.cr1");
        assert_eq!(stats.prog_sig, 0xbeef);
    }

    #[test]
    fn prog_stats_non_numeric_serial_is_unknown() {
        let mut body = prog_stats_body();
        // Replace "4527" with a non-numeric string of the same length
        let pos = body.windows(5).position(|w| w == b"4527\0").unwrap();
        body[pos..pos + 5].copy_from_slice(b"ABCD\0");
        let transport = ScriptedTransport::new(vec![reply(0x98, 1, &body)]);
        let mut link = MessageLayer::new(transport, peer());
        let stats = Bmp5::new(&mut link).get_prog_stats().unwrap();
        assert_eq!(stats.serial_no, "Unknown");
    }

    #[test]
    fn prog_stats_nonzero_code_is_fatal() {
        let transport = ScriptedTransport::new(vec![reply(0x98, 1, &[0x03])]);
        let mut link = MessageLayer::new(transport, peer());
        assert!(Bmp5::new(&mut link).get_prog_stats().is_err());
    }

    fn upload_body(chunk: &[u8]) -> Vec<u8> {
        let mut body = vec![0x00];
        body.extend_from_slice(&0u32.to_be_bytes()); // offset echo
        body.extend_from_slice(chunk);
        body
    }

    #[test]
    fn short_chunk_completes_upload() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tdf.dat.tmp");
        let chunk = vec![0x42u8; 100]; // < swath, single exchange
        let transport = ScriptedTransport::new(vec![reply(0x9d, 1, &upload_body(&chunk))]);
        let mut link = MessageLayer::new(transport, peer());

        Bmp5::new(&mut link)
            .upload_with_delay(".TDF", &dest, Duration::ZERO)
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), chunk);

        // Request body carried the filename and the swath.
        let sent = link.transport_mut().sent_payloads();
        let body = &sent[0][10..sent[0].len() - 2];
        assert_eq!(&body[2..7], b".TDF\0");
        assert_eq!(body[7], 0x00); // close flag clear
        assert_eq!(&body[12..14], &[0x03, 0xd9]);
    }

    #[test]
    fn multi_chunk_upload_advances_offset() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tdf.dat.tmp");
        let full = vec![0x11u8; usize::from(UPLOAD_SWATH)];
        let tail = vec![0x22u8; 10];
        let transport = ScriptedTransport::new(vec![
            reply(0x9d, 1, &upload_body(&full)),
            reply(0x9d, 1, &upload_body(&tail)),
        ]);
        let mut link = MessageLayer::new(transport, peer());

        Bmp5::new(&mut link)
            .upload_with_delay(".TDF", &dest, Duration::ZERO)
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap().len(), usize::from(UPLOAD_SWATH) + 10);

        let sent = link.transport_mut().sent_payloads();
        assert_eq!(sent.len(), 2);
        // Second request asks for the next offset
        let body = &sent[1][10..sent[1].len() - 2];
        assert_eq!(&body[8..12], &u32::from(UPLOAD_SWATH).to_be_bytes());
    }

    #[test]
    fn upload_failure_removes_partial_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tdf.dat.tmp");
        // Status 0x0d: invalid filename
        let transport = ScriptedTransport::new(vec![reply(0x9d, 1, &[0x0d])]);
        let mut link = MessageLayer::new(transport, peer());

        let result = Bmp5::new(&mut link).upload_with_delay(".BAD", &dest, Duration::ZERO);
        assert!(result.is_err());
        assert!(!dest.exists());

        // A close-flag request went out after the failure.
        let sent = link.transport_mut().sent_payloads();
        assert_eq!(sent.len(), 2);
        let body = &sent[1][10..sent[1].len() - 2];
        assert_eq!(body[7], 0x01);
    }

    #[test]
    fn control_table_success_and_failure() {
        let transport = ScriptedTransport::new(vec![reply(0x99, 1, &[0x00])]);
        let mut link = MessageLayer::new(transport, peer());
        Bmp5::new(&mut link).control_table(0x02).unwrap();

        let transport = ScriptedTransport::new(vec![reply(0x99, 1, &[0x01])]);
        let mut link = MessageLayer::new(transport, peer());
        assert!(Bmp5::new(&mut link).control_table(0x02).is_err());
    }

    #[test]
    fn control_file_reports_refusal() {
        let transport = ScriptedTransport::new(vec![reply(0x9e, 1, &[0x01])]);
        let mut link = MessageLayer::new(transport, peer());
        assert!(Bmp5::new(&mut link).control_file("CPU:met.cr1", 0x06).is_err());
    }
}
