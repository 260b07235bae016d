//! Per-device lock file.
//!
//! One collector process per serial device: the lock lives at
//! `/tmp/<app>-<device_tail>.lck` and records the owning PID so a stale
//! lock left by a crashed run can be detected with a liveness probe and
//! removed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{PakBusError, Result};

/// A held device lock; released on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    held: bool,
}

/// Lock file path for an application and serial device, derived from
/// the device's base name (`/dev/ttyS0` locks `<app>-ttyS0.lck`).
pub fn lock_path(app_name: &str, device_path: &str) -> PathBuf {
    let tail = Path::new(device_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| device_path.replace('/', "_"));
    PathBuf::from("/tmp").join(format!("{app_name}-{tail}.lck"))
}

impl LockFile {
    /// Acquire the lock for `device_path`.
    ///
    /// An existing lock whose recorded PID is still alive yields
    /// [`PakBusError::DeviceLocked`]; a stale lock is removed with a log
    /// line and acquisition proceeds.
    pub fn acquire(app_name: &str, device_path: &str) -> Result<LockFile> {
        let path = lock_path(app_name, device_path);

        if let Some(pid) = read_lock_pid(&path) {
            if process_alive(pid) {
                return Err(PakBusError::DeviceLocked { pid });
            }
            info!("The last run exited without removing lock file; removing outdated lock file");
            let _ = fs::remove_file(&path);
        }

        let mut file = fs::File::create(&path).map_err(|e| PakBusError::io(&path, e))?;
        write!(
            file,
            "Opened by : {app_name}\nPID of locking process : {}\nFile created on {}\n",
            std::process::id(),
            Utc::now().format("%a %b %e %T %Y")
        )
        .map_err(|e| PakBusError::io(&path, e))?;

        debug!("Opened lock file: {}", path.display());
        Ok(LockFile { path, held: true })
    }

    /// The lock file's path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock early.
    pub fn release(&mut self) {
        if self.held {
            if fs::remove_file(&self.path).is_err() {
                warn!("Failed to remove lock file: {}", self.path.display());
            }
            self.held = false;
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// Read the owning PID from a lock file, if present and well-formed.
fn read_lock_pid(path: &Path) -> Option<i32> {
    let text = fs::read_to_string(path).ok()?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("PID of locking process :") {
            return rest.trim().parse().ok();
        }
    }
    None
}

/// Whether a process with this PID exists (signal 0 probe).
fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}
