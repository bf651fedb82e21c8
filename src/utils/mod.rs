//! Utility functions and helpers.

pub mod fs;
pub mod http;
pub mod log;

use sha2::{Digest, Sha256};

/// Hex SHA-256 of a string.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Keep `[A-Za-z0-9._-]`, map everything else to `_`.
pub fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
