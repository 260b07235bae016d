//! Scripted logger conversations for tests and troubleshooting.
//!
//! [`ScriptedTransport`] plays back canned byte streams one read cycle at
//! a time and records everything the client transmits, so protocol
//! exchanges can be replayed without a device on the line. The frame
//! builders construct bit-exact wire frames (header, nullifier, quoting,
//! sync bytes) for the scripts.

use std::collections::VecDeque;

use crate::frame::{calc_sig, put_uint, quote, sig_nullifier, SIG_SEED, SYNC_BYTE};
use crate::transport::Transport;
use crate::Result;

/// A transport that replays scripted responses.
///
/// Each queued cycle is the complete byte stream one framer read cycle
/// will see; an empty cycle models a quiet line. Once the script is
/// exhausted every further cycle is quiet, which eventually trips the
/// dead-line detector exactly as a real silent device would.
pub struct ScriptedTransport {
    cycles: VecDeque<Vec<u8>>,
    remaining: Vec<u8>,
    offset: usize,
    cycle_open: bool,
    /// Every `write` call's bytes, in order.
    pub writes: Vec<Vec<u8>>,
}

impl ScriptedTransport {
    /// Build a transport from scripted read cycles.
    pub fn new(cycles: Vec<Vec<u8>>) -> Self {
        ScriptedTransport {
            cycles: cycles.into(),
            remaining: Vec::new(),
            offset: 0,
            cycle_open: false,
            writes: Vec::new(),
        }
    }

    /// Append another read cycle to the script.
    pub fn push_cycle(&mut self, cycle: Vec<u8>) {
        self.cycles.push_back(cycle);
    }

    /// Append a read cycle made of several frames back to back.
    pub fn push_frames(&mut self, frames: &[Vec<u8>]) {
        self.cycles.push_back(frames.concat());
    }

    /// Unquoted payloads of every transmitted frame, for assertions.
    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.writes
            .iter()
            .filter(|w| w.len() >= 2 && w[0] == SYNC_BYTE)
            .map(|w| crate::frame::unquote(&w[1..w.len() - 1]))
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.offset >= self.remaining.len() {
            if self.cycle_open {
                self.cycle_open = false;
                return Ok(0);
            }
            match self.cycles.pop_front() {
                Some(cycle) => {
                    self.remaining = cycle;
                    self.offset = 0;
                    self.cycle_open = true;
                    if self.remaining.is_empty() {
                        self.cycle_open = false;
                        return Ok(0);
                    }
                }
                None => return Ok(0),
            }
        }
        let n = (self.remaining.len() - self.offset).min(buf.len());
        buf[..n].copy_from_slice(&self.remaining[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writes.push(bytes.to_vec());
        Ok(())
    }
}

/// Build a complete wire frame for a header-bearing PakBus message:
/// sync, quoted header+body+nullifier, sync.
pub fn build_message_frame(
    from: (u16, u16),
    to: (u16, u16),
    protocol: u8,
    msg_type: u8,
    tran_nbr: u8,
    body: &[u8],
) -> Vec<u8> {
    let (src_phys, src_node) = from;
    let (dst_phys, dst_node) = to;

    let mut payload = Vec::with_capacity(12 + body.len());
    payload.push(0xa0 | (dst_phys >> 8) as u8);
    payload.push((dst_phys & 0xff) as u8);
    payload.push(0x40 | (src_phys >> 8) as u8);
    payload.push((src_phys & 0xff) as u8);
    payload.push((protocol << 4) | (dst_node >> 8) as u8);
    payload.push((dst_node & 0xff) as u8);
    payload.push((src_node >> 8) as u8);
    payload.push((src_node & 0xff) as u8);
    payload.push(msg_type);
    payload.push(tran_nbr);
    payload.extend_from_slice(body);

    finish_frame(payload)
}

/// Build a link-state sub-protocol frame. `wide` selects the 8-byte body
/// variant that repeats the address words.
pub fn build_link_state_frame(state_nibble: u8, src_phys: u16, dst_phys: u16, wide: bool) -> Vec<u8> {
    let mut payload = Vec::with_capacity(10);
    payload.push(state_nibble | (dst_phys >> 8) as u8);
    payload.push((dst_phys & 0xff) as u8);
    payload.push((src_phys >> 8) as u8);
    payload.push((src_phys & 0xff) as u8);
    if wide {
        let mut addrs = [0u8; 4];
        put_uint(&mut addrs[0..2], u32::from(dst_phys), 2);
        put_uint(&mut addrs[2..4], u32::from(src_phys), 2);
        payload.extend_from_slice(&addrs);
    }
    finish_frame(payload)
}

/// Append the signature nullifier, quote, and add the framing syncs.
fn finish_frame(mut payload: Vec<u8>) -> Vec<u8> {
    let sig = calc_sig(&payload, SIG_SEED);
    payload.extend_from_slice(&sig_nullifier(sig));

    let mut frame = Vec::with_capacity(payload.len() + 6);
    frame.push(SYNC_BYTE);
    frame.extend_from_slice(&quote(&payload));
    frame.push(SYNC_BYTE);
    frame
}
