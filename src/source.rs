//! Input file loading with optional integrity pinning.

use std::fs;
use std::path::Path;

use log::debug;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Lowercase hex SHA-256 of a byte buffer.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Read a file, optionally refusing it unless its SHA-256 matches.
///
/// Variant tables pin exact player builds; a byte-for-byte different
/// input would sail past the fingerprint check only to produce a broken
/// projector, so mismatches fail before any parsing.
pub fn read_verified(path: &Path, expected_sha256: Option<&str>) -> Result<Vec<u8>> {
    let bytes = fs::read(path)?;
    if let Some(expected) = expected_sha256 {
        let actual = sha256_hex(&bytes);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::malformed(format!(
                "{} digest mismatch: expected {expected}, got {actual}",
                path.display()
            )));
        }
    }
    debug!("read {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn digest_is_stable_lowercase_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn matching_digest_passes() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"abc").unwrap();
        let bytes = read_verified(
            f.path(),
            Some("BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"),
        )
        .unwrap();
        assert_eq!(bytes, b"abc");
    }

    #[test]
    fn mismatching_digest_is_refused() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"abc").unwrap();
        assert!(read_verified(f.path(), Some(&"0".repeat(64))).is_err());
    }
}
