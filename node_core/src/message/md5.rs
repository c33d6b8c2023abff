//! Type-identity hashing. The MD5 digest of a message type's canonical textual schema is
//! exchanged in peer headers (see [`crate::peer::channel`]) and must match exactly between a
//! publisher and a subscriber before any data bytes are delivered.

use md5::{Digest, Md5};

/// Lowercase hex MD5 digest of `text`.
pub fn hex_digest(text: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
