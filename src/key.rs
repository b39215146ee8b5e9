//! Version-tagged key helpers.
//!
//! Every key stored in the memtable and in SSTables carries an 8-byte
//! big-endian version tag as its suffix. Ordering is ascending on the key
//! prefix, and for equal prefixes descending on the version, so the newest
//! write of a key sorts first.

use std::cmp::Ordering;

/// Length of the version tag suffix.
pub const TS_LEN: usize = 8;

/// Appends the big-endian version tag to `key`.
pub fn key_with_ts(key: impl Into<Vec<u8>>, ts: u64) -> Vec<u8> {
    let mut out = key.into();
    out.extend_from_slice(&ts.to_be_bytes());
    out
}

/// The key without its version tag. Keys shorter than the tag are treated
/// as untagged and returned whole.
pub fn parse_key(key: &[u8]) -> &[u8] {
    if key.len() >= TS_LEN {
        &key[..key.len() - TS_LEN]
    } else {
        key
    }
}

/// The version tag of `key`, or 0 for untagged keys.
pub fn parse_ts(key: &[u8]) -> u64 {
    if key.len() >= TS_LEN {
        let mut tag = [0u8; TS_LEN];
        tag.copy_from_slice(&key[key.len() - TS_LEN..]);
        u64::from_be_bytes(tag)
    } else {
        0
    }
}

/// Whether two keys share the same prefix, ignoring version tags.
pub fn same_key(a: &[u8], b: &[u8]) -> bool {
    parse_key(a) == parse_key(b)
}

/// Full ordering over tagged keys: ascending prefix, then descending
/// version. The version half only applies when the prefixes are equal.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    parse_key(a)
        .cmp(parse_key(b))
        .then_with(|| parse_ts(b).cmp(&parse_ts(a)))
}
