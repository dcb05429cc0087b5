// src/hash.rs

//! Hashing helpers
//!
//! Two encodings of SHA-256 are needed:
//! - **hex**: conda repodata advertises `sha256` digests as lowercase hex
//! - **urlsafe base64 without padding**: the wheel `RECORD` format

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Buffer size for streaming file hashes
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// SHA-256 of a byte slice as lowercase hex
pub fn sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of a file as lowercase hex, streamed
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Digest in the form used by wheel `RECORD` files: `sha256=<b64>`
pub fn record_digest(data: &[u8]) -> String {
    format!("sha256={}", URL_SAFE_NO_PAD.encode(Sha256::digest(data)))
}
