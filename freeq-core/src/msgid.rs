//! ULID-based identifiers for locally originated messages.
//!
//! A message rendered before the server echoes it has no server `msgid` yet.
//! It gets a `local-` prefixed ULID so it can be addressed (send state,
//! failure marking) until the echo replaces it.
//!
//! Structure: 48 bits timestamp (ms since epoch) + 80 bits random, encoded as
//! 26 Crockford base32 characters.

use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Prefix marking ids that were never assigned by a server.
pub const LOCAL_PREFIX: &str = "local-";

/// Generate a new ULID string.
pub fn generate() -> String {
    let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;

    let mut rng = rand::thread_rng();
    let rand_hi: u16 = rng.r#gen();
    let rand_lo: u64 = rng.r#gen();

    let mut buf = [0u8; 26];

    let mut ts = now_ms;
    for slot in buf[..10].iter_mut().rev() {
        *slot = CROCKFORD[(ts & 0x1F) as usize];
        ts >>= 5;
    }

    let mut r = rand_hi as u128 | ((rand_lo as u128) << 16);
    for slot in buf[10..].iter_mut().rev() {
        *slot = CROCKFORD[(r & 0x1F) as usize];
        r >>= 5;
    }

    buf.iter().map(|&b| b as char).collect()
}

/// Id for an optimistic local copy.
pub fn local() -> String {
    format!("{LOCAL_PREFIX}{}", generate())
}

pub fn is_local(msgid: &str) -> bool {
    msgid.starts_with(LOCAL_PREFIX)
}
