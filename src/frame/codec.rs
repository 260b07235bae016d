//! Byte-level codecs shared by every PakBus layer: the CSI signature and
//! its nullifier, byte-stuffing (quoting), and the big-endian integer
//! codec.
//!
//! Multi-byte integers are MSB-first on the wire regardless of the host.

/// Framing delimiter. Every PakBus packet begins and ends with this byte.
pub const SYNC_BYTE: u8 = 0xbd;

/// Byte-stuffing escape. An interior `0xBD` or `0xBC` travels as `0xBC`
/// followed by the original value plus `0x20`.
pub const QUOTE_BYTE: u8 = 0xbc;

/// Seed for every signature computation in the protocol.
pub const SIG_SEED: u16 = 0xaaaa;

/// Compute the 16-bit CSI signature of a byte sequence.
pub fn calc_sig(buf: &[u8], seed: u16) -> u16 {
    let mut sig = seed;
    for &byte in buf {
        let prev = sig;
        let mut tmp = (sig << 1) & 0x01ff;
        if tmp >= 0x100 {
            tmp += 1;
        }
        sig = ((tmp.wrapping_add(prev >> 8).wrapping_add(u16::from(byte))) & 0x00ff) | (prev << 8);
    }
    sig
}

/// Compute the two-byte appendix that zeroes the signature of the
/// preceding bytes: `calc_sig(payload ++ sig_nullifier(calc_sig(payload,
/// SIG_SEED)), SIG_SEED) == 0`.
pub fn sig_nullifier(sig: u16) -> [u8; 2] {
    let mut tmp = (sig << 1) & 0x01ff;
    if tmp >= 0x100 {
        tmp += 1;
    }
    let hi = 0x100u32
        .wrapping_sub(u32::from(sig >> 8))
        .wrapping_sub(u32::from(tmp & 0x00ff)) as u8;
    let lo = 0x100u32.wrapping_sub(u32::from(sig & 0x00ff)) as u8;
    [hi, lo]
}

/// Byte-stuff a packet payload for transmission. Interior `0xBC`/`0xBD`
/// bytes become `0xBC 0xDC` / `0xBC 0xDD`; the framing sync bytes are
/// added by the caller and are never quoted.
pub fn quote(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    for &byte in payload {
        if byte == QUOTE_BYTE || byte == SYNC_BYTE {
            out.push(QUOTE_BYTE);
            out.push(byte.wrapping_add(0x20));
        } else {
            out.push(byte);
        }
    }
    out
}

/// Undo byte-stuffing on a received payload. `0xBC 0xDD` becomes `0xBD`,
/// `0xBC 0xDC` becomes `0xBC`; any other byte following the escape passes
/// through unchanged. A dangling escape at the end of the buffer is
/// dropped.
pub fn unquote(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut idx = 0;
    while idx < raw.len() {
        let byte = raw[idx];
        if byte == QUOTE_BYTE {
            idx += 1;
            match raw.get(idx) {
                Some(0xdd) => out.push(SYNC_BYTE),
                Some(0xdc) => out.push(QUOTE_BYTE),
                Some(&other) => out.push(other),
                None => break,
            }
        } else {
            out.push(byte);
        }
        idx += 1;
    }
    out
}

/// Serialize the low `len` bytes of `val` big-endian into `buf[..len]`.
/// `len` must be 1..=4.
pub fn put_uint(buf: &mut [u8], val: u32, len: usize) {
    debug_assert!((1..=4).contains(&len));
    for (i, slot) in buf.iter_mut().take(len).enumerate() {
        let shift = 8 * (len - 1 - i);
        *slot = (val >> shift) as u8;
    }
}

/// Deserialize a big-endian unsigned integer of 1..=4 bytes.
pub fn get_uint(buf: &[u8]) -> u32 {
    debug_assert!((1..=4).contains(&buf.len()));
    let mut val = 0u32;
    for &byte in buf {
        val = (val << 8) | u32::from(byte);
    }
    val
}

/// Read a NUL-terminated string starting at `buf[0]`. Returns the string
/// and the number of bytes consumed including the terminator, or `None`
/// when no terminator exists within the buffer.
pub fn get_cstring(buf: &[u8]) -> Option<(String, usize)> {
    let nul = buf.iter().position(|&b| b == 0)?;
    let text = String::from_utf8_lossy(&buf[..nul]).into_owned();
    Some((text, nul + 1))
}

/// Read a fixed-length string of `len` bytes, truncated at the first NUL,
/// carriage return or line feed.
pub fn get_fixed_string(buf: &[u8], len: usize) -> String {
    let slice = &buf[..len.min(buf.len())];
    let end = slice
        .iter()
        .position(|&b| b == 0 || b == 0x0d || b == 0x0a)
        .unwrap_or(slice.len());
    String::from_utf8_lossy(&slice[..end]).into_owned()
}
