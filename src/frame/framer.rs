//! Packet framing over the raw byte stream.
//!
//! Ingress: drain everything the device has queued, split the stream on
//! the `0xBD` sync byte, and unquote each complete segment into an owned
//! [`Packet`]. Egress: quote a payload and wrap it in sync bytes.
//!
//! The framer also implements the dead-line detector: three successive
//! read cycles that each return nothing, when the previous cycle was also
//! empty, raise [`PakBusError::NoResponse`]. The very first reads of a
//! session never trigger it.

use tracing::trace;

use super::codec::{quote, unquote, SYNC_BYTE};
use crate::transport::Transport;
use crate::{PakBusError, Result};

/// Read chunk size for one `read` call against the transport.
const READ_CHUNK: usize = 1024;

/// Number of empty read cycles after which the line is declared dead.
const MAX_SUCCESSIVE_EMPTY_READS: u32 = 3;

/// One framed slice of the receive stream: the unquoted bytes strictly
/// between two sync bytes. `complete` is false when the trailing sync had
/// not arrived yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Unquoted payload bytes.
    pub payload: Vec<u8>,
    /// Whether the trailing sync byte was seen.
    pub complete: bool,
}

/// Splits the serial byte stream into PakBus packets and frames outgoing
/// payloads.
pub struct Framer<T: Transport> {
    transport: T,
    successive_empty_reads: u32,
    last_read_len: usize,
}

impl<T: Transport> Framer<T> {
    /// Wrap a transport.
    pub fn new(transport: T) -> Self {
        // last_read_len starts nonzero so the first quiet cycle of a
        // session does not count toward the dead-line detector.
        Framer { transport, successive_empty_reads: 0, last_read_len: 1 }
    }

    /// Access the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the framer, returning the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Run one receive cycle: read all currently available bytes in
    /// 1024-byte gulps until the transport reports quiet, split them into
    /// packets, then flush whatever the OS still holds.
    pub fn read_packets(&mut self) -> Result<Vec<Packet>> {
        let mut stream = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let nread = self.transport.read(&mut chunk)?;
            if nread == 0 {
                break;
            }
            stream.extend_from_slice(&chunk[..nread]);
        }

        let packets = split_stream(&stream);
        self.transport.flush_input()?;

        if stream.is_empty() && self.last_read_len == 0 {
            self.successive_empty_reads += 1;
            if self.successive_empty_reads >= MAX_SUCCESSIVE_EMPTY_READS {
                return Err(PakBusError::NoResponse);
            }
        } else {
            self.successive_empty_reads = 0;
        }
        self.last_read_len = stream.len();

        trace!("Read cycle: {} bytes, {} packets", stream.len(), packets.len());
        Ok(packets)
    }

    /// Write bytes unmodified; used only for the wake-up preamble.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport.write(bytes)
    }

    /// Quote a payload and transmit it framed in sync bytes.
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 6);
        frame.push(SYNC_BYTE);
        frame.extend_from_slice(&quote(payload));
        frame.push(SYNC_BYTE);
        trace!("Writing frame of {} bytes ({} payload)", frame.len(), payload.len());
        self.transport.write(&frame)
    }
}

/// Split a received byte sequence on the sync byte. Bytes before the
/// first sync are line noise and are discarded; a segment without a
/// trailing sync becomes an incomplete packet.
fn split_stream(stream: &[u8]) -> Vec<Packet> {
    let mut packets = Vec::new();
    let mut search = 0usize;

    while search < stream.len() {
        let Some(beg) = stream[search..].iter().position(|&b| b == SYNC_BYTE) else {
            break;
        };
        let beg = search + beg;
        if beg + 1 >= stream.len() {
            packets.push(Packet { payload: Vec::new(), complete: false });
            break;
        }

        match stream[beg + 1..].iter().position(|&b| b == SYNC_BYTE) {
            Some(rel_end) => {
                let end = beg + 1 + rel_end;
                packets.push(Packet {
                    payload: unquote(&stream[beg + 1..end]),
                    complete: true,
                });
                search = end + 1;
            }
            None => {
                packets.push(Packet {
                    payload: unquote(&stream[beg + 1..]),
                    complete: false,
                });
                break;
            }
        }
    }
    packets
}
