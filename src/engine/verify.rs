//! Post-install integrity verifier
//!
//! Checks every non-directory record of a cached build manifest against
//! the files on disk: existence, size, then a streaming SHA-256. Runs
//! with the same parallelism as the downloader.

use super::EngineError;
use crate::hash::sha256_file;
use crate::manifest::{host_path, BuildRecord};
use futures::stream::{self, StreamExt};
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Valid,
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    HashMismatch,
}

impl FileStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, FileStatus::Valid)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Valid => write!(f, "ok"),
            FileStatus::Missing => write!(f, "missing"),
            FileStatus::SizeMismatch { expected, actual } => {
                write!(f, "size {actual} (expected {expected})")
            }
            FileStatus::HashMismatch => write!(f, "hash mismatch"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileCheck {
    pub file_path: String,
    pub status: FileStatus,
}

#[derive(Debug)]
pub struct VerifyReport {
    pub all_valid: bool,
    pub results: Vec<FileCheck>,
}

impl VerifyReport {
    pub fn failures(&self) -> impl Iterator<Item = &FileCheck> {
        self.results.iter().filter(|r| !r.status.is_valid())
    }
}

async fn check_record(record: &BuildRecord, install_path: &Path) -> Result<FileStatus, EngineError> {
    let full_path = host_path(install_path, &record.file_path);

    let metadata = match tokio::fs::metadata(&full_path).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(FileStatus::Missing),
        Err(e) => return Err(e.into()),
    };

    if metadata.len() != record.size_bytes {
        return Ok(FileStatus::SizeMismatch {
            expected: record.size_bytes,
            actual: metadata.len(),
        });
    }

    // Upstream leaves the SHA column empty for zero-byte files.
    if record.size_bytes == 0 && record.file_sha256.is_empty() {
        return Ok(FileStatus::Valid);
    }

    let hash = tokio::task::spawn_blocking(move || sha256_file(&full_path))
        .await
        .expect("hashing task panicked")?;
    Ok(if hash.eq_ignore_ascii_case(&record.file_sha256) {
        FileStatus::Valid
    } else {
        FileStatus::HashMismatch
    })
}

/// Verify an installed tree against its build manifest.
pub async fn verify_install(
    records: &[BuildRecord],
    install_path: &Path,
    workers: usize,
) -> Result<VerifyReport, EngineError> {
    let mut results: Vec<FileCheck> = stream::iter(records.iter().filter(|r| !r.is_directory()))
        .map(|record| async move {
            check_record(record, install_path).await.map(|status| FileCheck {
                file_path: record.file_path.clone(),
                status,
            })
        })
        .buffer_unordered(workers.max(1))
        .collect::<Vec<Result<FileCheck, EngineError>>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;

    results.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    let all_valid = results.iter().all(|r| r.status.is_valid());
    Ok(VerifyReport { all_valid, results })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256_bytes;
    use crate::manifest::DIRECTORY_FLAG;

    fn record(path: &str, content: &[u8]) -> BuildRecord {
        BuildRecord {
            size_bytes: content.len() as u64,
            chunk_count: 1,
            file_sha256: sha256_bytes(content),
            flags: 0,
            file_path: path.to_string(),
            change_tag: String::new(),
        }
    }

    #[tokio::test]
    async fn test_clean_install_verifies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/a.bin"), b"alpha").unwrap();
        std::fs::write(dir.path().join("b.bin"), b"beta").unwrap();

        let records = vec![
            BuildRecord {
                size_bytes: 0,
                chunk_count: 0,
                file_sha256: String::new(),
                flags: DIRECTORY_FLAG,
                file_path: "data".into(),
                change_tag: String::new(),
            },
            record("data/a.bin", b"alpha"),
            record("b.bin", b"beta"),
        ];

        let report = verify_install(&records, dir.path(), 4).await.unwrap();
        assert!(report.all_valid);
        // The directory row is not checked.
        assert_eq!(report.results.len(), 2);
    }

    #[tokio::test]
    async fn test_single_byte_tamper_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"alpha").unwrap();
        std::fs::write(dir.path().join("b.bin"), b"Xeta").unwrap();

        let records = vec![record("a.bin", b"alpha"), record("b.bin", b"beta")];
        let report = verify_install(&records, dir.path(), 4).await.unwrap();

        assert!(!report.all_valid);
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].file_path, "b.bin");
        assert_eq!(failures[0].status, FileStatus::HashMismatch);
    }

    #[tokio::test]
    async fn test_missing_and_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("short.bin"), b"ab").unwrap();

        let records = vec![record("gone.bin", b"data"), record("short.bin", b"abcdef")];
        let report = verify_install(&records, dir.path(), 4).await.unwrap();

        assert!(!report.all_valid);
        assert_eq!(report.results[0].status, FileStatus::Missing);
        assert_eq!(
            report.results[1].status,
            FileStatus::SizeMismatch {
                expected: 6,
                actual: 2
            }
        );
    }

    #[tokio::test]
    async fn test_empty_sha_with_zero_size_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.bin"), b"").unwrap();

        let records = vec![BuildRecord {
            size_bytes: 0,
            chunk_count: 0,
            file_sha256: String::new(),
            flags: 0,
            file_path: "empty.bin".into(),
            change_tag: String::new(),
        }];
        let report = verify_install(&records, dir.path(), 4).await.unwrap();
        assert!(report.all_valid);
    }
}
