//! PakCtrl transactions: the Hello exchange that opens a session and the
//! Bye that closes it.

use std::time::Duration;

use tracing::{debug, error};

use crate::message::{Expected, MessageLayer, Protocol};
use crate::transport::Transport;
use crate::{PakBusError, Result};

/// Seconds to wait for a Hello reply, indexed by hop metric 1..=5. The
/// device echoes a hop metric in its reply to tell us its preferred
/// inter-poll interval out of the same table.
pub const HELLO_SLEEP_SECS: [u64; 5] = [1, 5, 10, 20, 60];

/// PakCtrl protocol client over a shared message layer.
pub struct PakCtrl<'a, T: Transport> {
    link: &'a mut MessageLayer<T>,
}

impl<'a, T: Transport> PakCtrl<'a, T> {
    /// Borrow the message layer for PakCtrl transactions.
    pub fn new(link: &'a mut MessageLayer<T>) -> Self {
        PakCtrl { link }
    }

    /// Execute the Hello transaction that precedes any command exchange.
    ///
    /// Sends Hello with hop metric 1..5, waiting progressively longer
    /// for a reply at each step. Returns the device's preferred poll
    /// interval in seconds. Fails with a handshake error when no hop
    /// metric elicits a reply.
    pub fn hello_transaction(&mut self) -> Result<u64> {
        let delays = HELLO_SLEEP_SECS.map(Duration::from_secs);
        self.hello_with_delays(&delays)
    }

    pub(crate) fn hello_with_delays(&mut self, delays: &[Duration; 5]) -> Result<u64> {
        for hop_metric in 1u8..=5 {
            let tran = self.link.next_tran_nbr();
            let body = [0x00, hop_metric, 0x00, 0x3c];
            self.link.send_message(Protocol::PakCtrl, 0x09, tran, &body)?;

            std::thread::sleep(delays[usize::from(hop_metric) - 1]);

            let reply = self
                .link
                .read_response(Expected { msg_type: 0x89, tran_nbr: tran }, "Hello Transaction")?;

            if let Some(payload) = reply {
                let device_metric = payload.get(11).copied().unwrap_or(0);
                let interval = match device_metric {
                    1..=5 => HELLO_SLEEP_SECS[usize::from(device_metric) - 1],
                    _ => 0,
                };
                debug!("Hello Transaction successful (device hop metric {device_metric})");
                return Ok(interval);
            }
        }

        debug!("Hello Transaction failed");
        Err(PakBusError::handshake("Hello Transaction"))
    }

    /// Send the Bye message before dropping the link. Communication
    /// errors here are logged, never propagated: the session is ending
    /// either way.
    pub fn bye(&mut self) {
        let tran = self.link.next_tran_nbr();
        self.link.set_link_state(0x0b);
        self.link.set_expect_more(0x00);
        if let Err(e) = self.link.send_message(Protocol::PakCtrl, 0x0d, tran, &[]) {
            error!("Communication error while sending bye message: {e}");
        }
    }
}
