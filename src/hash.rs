//! SHA-256 integrity primitives
//!
//! Manifest hashes are ground truth: chunks are checked against the SHA
//! embedded in their chunk identifier, whole files against the build
//! manifest's `SHA` column.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

/// Compute SHA-256 of a byte buffer, returning lowercase hex (64 chars).
pub fn sha256_bytes(buf: &[u8]) -> String {
    hex::encode(Sha256::digest(buf))
}

/// Compute SHA-256 of a file by streaming, without loading it into memory.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Check a chunk buffer against its expected hex SHA. Hex comparison is
/// case-insensitive since upstream manifests mix cases.
pub fn verify_chunk(buf: &[u8], expected_hex: &str) -> bool {
    sha256_bytes(buf).eq_ignore_ascii_case(expected_hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // SHA-256 of "hello world"
    const HELLO_SHA: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_bytes() {
        let hash = sha256_bytes(b"hello world");
        assert_eq!(hash, HELLO_SHA);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn test_sha256_file_matches_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        let hash = sha256_file(file.path()).unwrap();
        assert_eq!(hash, HELLO_SHA);
    }

    #[test]
    fn test_verify_chunk_case_insensitive() {
        assert!(verify_chunk(b"hello world", HELLO_SHA));
        assert!(verify_chunk(b"hello world", &HELLO_SHA.to_uppercase()));
        assert!(!verify_chunk(b"hello world!", HELLO_SHA));
    }

    #[test]
    fn test_sha256_empty() {
        assert_eq!(
            sha256_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
