//! The collection session orchestrator.
//!
//! Drives one full collection pass: acquire the device lock, open the
//! serial link, wake and ring the logger, check its clock, load table
//! definitions, collect every configured table, and tear the link down
//! again. Transient failures restart the whole session under the
//! adaptive read-timeout back-off; I/O failures abort.
//!
//! Signal handling is flag-based: handlers only set an atomic, the
//! session polls it between steps, and the teardown path (Finished
//! handshake, Bye, lock release) runs on every exit.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::bmp5::Bmp5;
use crate::config::CollectionConfig;
use crate::lockfile::LockFile;
use crate::message::{LinkState, MessageLayer};
use crate::pakctrl::PakCtrl;
use crate::tdf::{clean_cache, TableSet};
use crate::transport::{RetryPolicy, SerialTransport, Transport};
use crate::types::SECS_BEFORE_1990;
use crate::writer::{setup_working_dirs, AsciiWriter, FileHeaderInfo};
use crate::CursorStore;
use crate::{PakBusError, Result};

/// Maximum tolerated difference between host and logger clocks, in
/// seconds, before the logger clock is adjusted.
pub const MAX_TIME_OFFSET: i64 = 1;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn shutdown_handler(_sig: libc::c_int) {
    // Async-signal-safe: a single flag store, nothing else.
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Install flag-setting handlers for the terminating signals. The
/// session loop polls [`shutdown_requested`] between steps.
pub fn install_signal_handlers() {
    unsafe {
        for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP, libc::SIGQUIT] {
            libc::signal(sig, shutdown_handler as *const () as libc::sighandler_t);
        }
    }
}

/// Whether a terminating signal has been received.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

/// One data collection run against a single logger.
pub struct CollectionSession {
    config: CollectionConfig,
    time_check_done: bool,
}

impl CollectionSession {
    /// Build a session from a loaded configuration.
    pub fn new(config: CollectionConfig) -> Self {
        CollectionSession { config, time_check_done: false }
    }

    /// Run the collection process to completion.
    ///
    /// Retries the whole session with escalating read timeouts while
    /// the failure is transient; returns the final error otherwise.
    pub fn run(&mut self) -> Result<()> {
        let app_name = env!("CARGO_PKG_NAME");
        let mut lock = match LockFile::acquire(app_name, &self.config.serial.port_name) {
            Ok(lock) => lock,
            Err(PakBusError::DeviceLocked { pid }) => {
                warn!(
                    "{app_name} is already connected to {} (PID : {pid})",
                    self.config.serial.port_name
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        setup_working_dirs(&self.config.working_path)?;
        self.time_check_done = false;

        let mut policy = RetryPolicy::new(self.config.serial.vtime);
        let result = loop {
            match self.run_serial_session(policy.vtime()) {
                Ok(()) => break Ok(()),
                Err(e) if !e.is_retryable() => break Err(e),
                Err(e) => {
                    warn!("Session attempt failed: {e}");
                    if shutdown_requested() || !policy.retry_on_fail() {
                        break Err(e);
                    }
                    info!(
                        "Retrying session with read timeout of {} tenths of a second",
                        policy.vtime()
                    );
                }
            }
        };

        lock.release();
        result
    }

    fn run_serial_session(&mut self, vtime: u32) -> Result<()> {
        info!(
            "Trying to establish PakBus session => {} [baud({}),vtime({vtime})]",
            self.config.serial.port_name, self.config.serial.baud_rate
        );
        let transport =
            SerialTransport::open(&self.config.serial.port_name, self.config.serial.baud_rate, vtime)?;
        self.run_with_transport(transport)
    }

    /// Run one session over an already-open transport. Public so
    /// scripted transports can drive a complete session in tests.
    pub fn run_with_transport<T: Transport>(&mut self, transport: T) -> Result<()> {
        let mut link = MessageLayer::new(transport, self.config.pakbus);
        let outcome = self.session_body(&mut link);

        // Teardown runs on every path, normal or not: tell the logger
        // we are done and let the transport close.
        if let Err(e) = link.handshake(LinkState::Finished) {
            debug!("Finished handshake failed during teardown: {e}");
        }
        PakCtrl::new(&mut link).bye();
        outcome
    }

    fn session_body<T: Transport>(&mut self, link: &mut MessageLayer<T>) -> Result<()> {
        link.init_comm()?;
        link.handshake(LinkState::Ring)?;
        let poll_interval = PakCtrl::new(link).hello_transaction()?;
        info!("Established PakBus session with datalogger (device poll interval {poll_interval}s)");

        self.check_logger_time(link)?;

        let prog_stats = Bmp5::new(link).get_prog_stats()?;
        let cursors = CursorStore::new(&self.config.working_path);
        let mut tables = self.load_table_definitions(link, &cursors)?;

        let mut writer = AsciiWriter::new(
            &self.config.working_path,
            FileHeaderInfo { station: self.config.station.clone(), prog: prog_stats },
        );

        let outcome = self.collect_all(link, &mut tables, &mut writer, &cursors);
        // Collected cursors persist even when a later table failed.
        cursors.save_all(tables.tables());
        outcome
    }

    fn collect_all<T: Transport>(
        &mut self,
        link: &mut MessageLayer<T>,
        tables: &mut TableSet,
        writer: &mut AsciiWriter,
        cursors: &CursorStore,
    ) -> Result<()> {
        if self.config.tables.is_empty() {
            info!("No tables listed for data collection.");
            return Ok(());
        }

        let mut tdf_reloaded = false;
        let mut idx = 0;
        while idx < self.config.tables.len() {
            if shutdown_requested() {
                info!("Shutdown requested, stopping collection");
                break;
            }
            let opts = self.config.tables[idx].clone();
            info!("Downloading data from {}", opts.name);

            let result = match tables.get_mut(&opts.name) {
                Err(e) => {
                    // A table missing from the definitions is skipped;
                    // the others still collect.
                    error!("No data was downloaded for [{}]: {e}", opts.name);
                    idx += 1;
                    continue;
                }
                Ok(table) => Bmp5::new(link).collect_data(writer, table, &opts),
            };

            match result {
                Ok(()) => idx += 1,
                Err(PakBusError::Storage { table, details }) => {
                    // Storage failures are scoped to the table.
                    error!("Data collection failed for [{table}]: {details}");
                    idx += 1;
                }
                Err(PakBusError::InvalidTdf { code }) => {
                    if tdf_reloaded {
                        error!(
                            "Still receiving invalid table definition errors after reloading; skipping [{}]",
                            opts.name
                        );
                        idx += 1;
                    } else {
                        info!(
                            "Retrying data collection by reloading table definitions (code {code:#04x})"
                        );
                        clean_cache(&self.config.working_path, tables.tables_mut());
                        *tables = self.load_table_definitions(link, cursors)?;
                        tdf_reloaded = true;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Compare host and logger clocks, adjusting the logger when the
    /// skew exceeds [`MAX_TIME_OFFSET`]. Runs once per process run.
    fn check_logger_time<T: Transport>(&mut self, link: &mut MessageLayer<T>) -> Result<()> {
        if self.time_check_done {
            return Ok(());
        }

        let logger_1990 = Bmp5::new(link).check_clock()?;
        if logger_1990 == 0 {
            return Err(PakBusError::Clock { details: "invalid logger time".into() });
        }

        let logger_unix = i64::from(logger_1990) + SECS_BEFORE_1990;
        let host_unix = Utc::now().timestamp();
        let offset = host_unix - logger_unix;
        info!("Time check: host {host_unix}, logger {logger_unix}, offset {offset} seconds");

        if offset.abs() > MAX_TIME_OFFSET {
            info!("Adjusting logger clock by {offset} seconds");
            match Bmp5::new(link).set_clock(offset) {
                Ok(()) => info!("Successfully updated logger time."),
                Err(e) => {
                    error!("Failed to update logger time.");
                    return Err(e);
                }
            }
        }
        self.time_check_done = true;
        Ok(())
    }

    fn load_table_definitions<T: Transport>(
        &self,
        link: &mut MessageLayer<T>,
        cursors: &CursorStore,
    ) -> Result<TableSet> {
        let conf_dir = self.config.working_path.join(".working");
        let tdf_path = conf_dir.join("tdf.dat");
        let xml_path = conf_dir.join("tdf.xml");

        let mut set = match TableSet::load(&tdf_path) {
            Ok(set) => set,
            Err(load_err) => {
                if tdf_path.exists() {
                    info!("Removing invalid table definition file: {}", tdf_path.display());
                    let _ = fs::remove_file(&tdf_path);
                }
                debug!("Cached table definitions unusable ({load_err})");
                info!("Uploading table definitions file from the logger ...");

                let tmp_path = conf_dir.join("tdf.dat.tmp");
                Bmp5::new(link).file_upload(".TDF", &tmp_path)?;
                fs::rename(&tmp_path, &tdf_path).map_err(|e| {
                    error!("Failed to rename temporary file to: {}", tdf_path.display());
                    let _ = fs::remove_file(&tmp_path);
                    PakBusError::io(&tdf_path, e)
                })?;

                TableSet::load(&tdf_path).map_err(|e| {
                    error!("Failed to parse table definitions following download from logger");
                    let _ = fs::remove_file(&tdf_path);
                    e
                })?
            }
        };

        if let Err(e) = set.write_xml(&xml_path) {
            warn!("Failed to write {}: {e}", xml_path.display());
        }
        cursors.load_all(set.tables_mut());
        Ok(set)
    }
}
