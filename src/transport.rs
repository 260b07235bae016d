//! Serial link abstraction.
//!
//! The PakBus layers talk to the device through the [`Transport`] trait: a
//! blocking read with a per-call inactivity timeout, and an all-or-nothing
//! write. The production implementation is [`SerialTransport`] over a POSIX
//! serial character device; tests substitute a scripted transport from
//! [`crate::sim`].
//!
//! The read timeout is expressed in `vtime` units (tenths of a second),
//! matching the termios knob the loggers were tuned against. The
//! [`RetryPolicy`] escalates that timeout through a fixed ladder between
//! session attempts.

use std::io::Read;
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, warn};

use crate::{PakBusError, Result};

/// Default read timeout in tenths of a second.
pub const DEFAULT_VTIME: u32 = 10;

/// Baud rate used when the configured rate is not supported.
pub const DEFAULT_BAUD: u32 = 9600;

/// The read-timeout escalation ladder, in tenths of a second. A retry
/// budget of eight steps walks the eight transitions across these nine
/// entries.
pub const VTIME_LADDER: [u32; 9] = [2, 5, 10, 20, 30, 50, 100, 200, 600];

/// Byte-stream access to the device.
///
/// `read` returns zero or more bytes; a zero return means no more bytes
/// arrived within the configured timeout. `write` queues all bytes or
/// fails; partial writes are an error.
pub trait Transport {
    /// Read available bytes into `buf`, blocking up to the configured
    /// inter-byte timeout. Returns the number of bytes read; zero means
    /// the line went quiet.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `bytes` to the device.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Discard anything still pending in the OS input queue.
    fn flush_input(&mut self) -> Result<()> {
        Ok(())
    }

    /// Update the read timeout, in tenths of a second.
    fn set_read_timeout(&mut self, vtime_tenths: u32) -> Result<()> {
        let _ = vtime_tenths;
        Ok(())
    }
}

/// Clamp a requested baud rate to the set the loggers support.
pub fn supported_baud(rate: u32) -> u32 {
    match rate {
        9600 | 19200 | 38400 | 57600 | 115200 => rate,
        other => {
            warn!("Unsupported baud rate {other}, falling back to {DEFAULT_BAUD}");
            DEFAULT_BAUD
        }
    }
}

/// A serial character device configured for raw 8N1 communication.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    port_name: String,
    vtime: u32,
}

impl SerialTransport {
    /// Open and configure the serial device: 8 data bits, 1 stop bit, no
    /// parity, no flow control, read timeout of `vtime` tenths of a
    /// second.
    pub fn open(port_name: &str, baud_rate: u32, vtime: u32) -> Result<Self> {
        let baud = supported_baud(baud_rate);
        let vtime = vtime.max(2);

        let port = serialport::new(port_name, baud)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(vtime_duration(vtime))
            .open()
            .map_err(|e| PakBusError::Serial {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;

        debug!("Connected to {port_name} [baud({baud}),vtime({vtime})]");
        Ok(SerialTransport { port, port_name: port_name.to_string(), vtime })
    }

    /// The device path this transport is connected to.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// The current read timeout in tenths of a second.
    pub fn vtime(&self) -> u32 {
        self.vtime
    }
}

fn vtime_duration(vtime_tenths: u32) -> Duration {
    Duration::from_millis(u64::from(vtime_tenths) * 100)
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(PakBusError::io(self.port_name.clone(), e)),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        use std::io::Write;
        self.port
            .write_all(bytes)
            .and_then(|()| self.port.flush())
            .map_err(|e| PakBusError::io(self.port_name.clone(), e))
    }

    fn flush_input(&mut self) -> Result<()> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| PakBusError::Serial { port: self.port_name.clone(), reason: e.to_string() })
    }

    fn set_read_timeout(&mut self, vtime_tenths: u32) -> Result<()> {
        self.vtime = vtime_tenths.max(2);
        self.port
            .set_timeout(vtime_duration(self.vtime))
            .map_err(|e| PakBusError::Serial { port: self.port_name.clone(), reason: e.to_string() })
    }
}

/// Adaptive read-timeout back-off surrounding the session retry loop.
///
/// Starts at the position in [`VTIME_LADDER`] matching the configured
/// timeout and climbs one rung per failed session. `retry_on_fail`
/// reports `true` for each of the eight transitions and `false` once the
/// ladder is exhausted.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    index: usize,
    vtime: u32,
}

impl RetryPolicy {
    /// Build a policy starting from the configured vtime. Values below 2
    /// tenths are clamped up; values between rungs start at the rung
    /// below.
    pub fn new(vtime: u32) -> Self {
        let vtime = vtime.max(2);
        let index = match VTIME_LADDER.iter().position(|&v| v == vtime) {
            Some(idx) => idx,
            None => {
                let mut idx = VTIME_LADDER.len() - 1;
                for i in 0..VTIME_LADDER.len() - 1 {
                    if VTIME_LADDER[i + 1] > vtime {
                        idx = i;
                        break;
                    }
                }
                idx
            }
        };
        RetryPolicy { index, vtime }
    }

    /// The read timeout (tenths of a second) for the current attempt.
    pub fn vtime(&self) -> u32 {
        self.vtime
    }

    /// Advance to the next rung. Returns `true` while another attempt is
    /// allowed, `false` once the ladder is exhausted.
    pub fn retry_on_fail(&mut self) -> bool {
        if self.index < VTIME_LADDER.len() - 1 {
            self.index += 1;
            self.vtime = VTIME_LADDER[self.index];
            true
        } else {
            false
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(DEFAULT_VTIME)
    }
}
