//! Framing and byte-stuffing of the serial stream into PakBus packets.

pub mod codec;
mod framer;

pub use codec::{
    calc_sig, get_cstring, get_fixed_string, get_uint, put_uint, quote, sig_nullifier, unquote,
    QUOTE_BYTE, SIG_SEED, SYNC_BYTE,
};
pub use framer::{Framer, Packet};
