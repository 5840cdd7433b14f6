//! Deterministic composite-key hashing used as the `_id` of every ingested
//! document and as the stable id of a recurring data-quality issue.

use base64::Engine;
use sha2::{Digest, Sha256};

use crate::errors::Error;

/// US-ASCII separator not present in the dataset alphabet (CSV text is UTF-8
/// and never contains this control character).
const PART_SEPARATOR: u8 = 0x1f;

/// Hashes ordered, non-empty key parts into a 43-character URL-safe base64
/// SHA-256 digest (no padding). Every part must be non-empty after trimming;
/// changing any part always changes the output.
pub fn hash_parts(parts: &[&str]) -> Result<String, Error> {
    if parts.is_empty() {
        return Err(Error::IntegrityViolation("null or empty key part".to_string()));
    }

    let mut canonical = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            return Err(Error::IntegrityViolation("null or empty key part".to_string()));
        }
        if i > 0 {
            canonical.push(PART_SEPARATOR);
        }
        canonical.extend_from_slice(trimmed.as_bytes());
    }

    let digest = Sha256::digest(&canonical);
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest))
}

/// Computes the document `_id` for a row given a dataset's ordered composite
/// primary-key column values.
pub fn record_id(key_values: &[&str]) -> Result<String, Error> {
    hash_parts(key_values)
}
