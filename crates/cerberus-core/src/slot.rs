//! Slot derivation (spec.md §4.2): hash-tag extraction plus CRC16/XMODEM
//! (poly 0x1021, init 0 — the CCITT variant spec.md calls for) reduced
//! modulo 16384. The `crc16` crate is the same one
//! `examples/other_examples/cfad8899_kex103-redflare__src-cluster_backend.rs.rs`
//! reaches for to hash Redis Cluster keys.

use crc16::{State, XMODEM};

pub const SLOT_COUNT: u16 = 16384;

/// Extracts the substring to hash from a routing key: the text between the
/// first `{` and the first subsequent `}` if that substring is non-empty,
/// otherwise the whole key.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(close_rel) = key[open + 1..].iter().position(|&b| b == b'}') {
            if close_rel > 0 {
                return &key[open + 1..open + 1 + close_rel];
            }
        }
    }
    key
}

/// The slot a key routes to.
pub fn key_slot(key: &[u8]) -> u16 {
    State::<XMODEM>::calculate(hash_tag(key)) % SLOT_COUNT
}
