//! Installation planner
//!
//! First pass over a build manifest: create the directory tree and
//! zero-byte files up front, and assign a stable integer index to every
//! file that actually needs chunk downloads. The planner never touches
//! the content of chunked files — the resume checker and writer own that.

use super::EngineError;
use crate::manifest::{host_path, BuildRecord, ChunkRecord, ManifestError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Stable within one run; never shared between two files.
    pub index: u32,
    pub record: BuildRecord,
    pub full_path: PathBuf,
    pub chunk_count: u32,
}

#[derive(Debug, Default)]
pub struct InstallPlan {
    pub files: HashMap<u32, FileInfo>,
    pub index_by_path: HashMap<String, u32>,
    /// Bytes across all files needing chunks.
    pub total_bytes: u64,
    /// Count of files needing chunks.
    pub total_files: u32,
}

async fn create_install_dir(path: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(())
}

async fn create_empty_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::File::create(path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await?;
    }
    Ok(())
}

/// Build the install plan: directories and empty files exist afterwards,
/// and `files` maps an index to every file that still needs chunks.
pub async fn plan_install(
    records: &[BuildRecord],
    install_path: &Path,
) -> Result<InstallPlan, EngineError> {
    create_install_dir(install_path).await?;

    let mut plan = InstallPlan::default();
    let mut next_index = 0u32;

    for record in records {
        let full_path = host_path(install_path, &record.file_path);

        if record.is_directory() {
            create_install_dir(&full_path).await?;
            continue;
        }

        if record.is_empty() {
            create_empty_file(&full_path).await?;
            continue;
        }

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let index = next_index;
        next_index += 1;
        plan.total_bytes += record.size_bytes;
        plan.total_files += 1;
        plan.index_by_path.insert(record.file_path.clone(), index);
        plan.files.insert(
            index,
            FileInfo {
                index,
                record: record.clone(),
                full_path,
                chunk_count: record.chunk_count,
            },
        );
    }

    Ok(plan)
}

/// Group chunks-manifest rows by planned file index, preserving their
/// ascending order. Chunks for directories, empty files, or paths outside
/// the plan are dropped. Every planned file must end up with exactly its
/// declared chunk count.
pub fn group_chunks(
    plan: &InstallPlan,
    chunks: &[ChunkRecord],
) -> Result<HashMap<u32, Vec<ChunkRecord>>, EngineError> {
    let mut grouped: HashMap<u32, Vec<ChunkRecord>> = HashMap::new();
    for chunk in chunks {
        if let Some(&index) = plan.index_by_path.get(&chunk.file_path) {
            grouped.entry(index).or_default().push(chunk.clone());
        }
    }

    for info in plan.files.values() {
        let actual = grouped.get(&info.index).map(|c| c.len()).unwrap_or(0) as u32;
        if actual != info.chunk_count {
            return Err(EngineError::Manifest(ManifestError::ChunkCount {
                file_path: info.record.file_path.clone(),
                expected: info.chunk_count,
                actual,
            }));
        }
    }

    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{DIRECTORY_FLAG, MAX_CHUNK};

    fn dir_record(path: &str) -> BuildRecord {
        BuildRecord {
            size_bytes: 0,
            chunk_count: 0,
            file_sha256: String::new(),
            flags: DIRECTORY_FLAG,
            file_path: path.to_string(),
            change_tag: String::new(),
        }
    }

    fn file_record(path: &str, size: u64) -> BuildRecord {
        BuildRecord {
            size_bytes: size,
            chunk_count: size.div_ceil(MAX_CHUNK) as u32,
            file_sha256: "00".repeat(32),
            flags: 0,
            file_path: path.to_string(),
            change_tag: String::new(),
        }
    }

    fn chunk_record(path: &str, index: u32, sha: &str) -> ChunkRecord {
        ChunkRecord {
            index_in_file: index,
            file_path: path.to_string(),
            chunk_id: format!("{}_{}_{}", path.replace('/', "-"), index, sha),
        }
    }

    #[tokio::test]
    async fn test_plan_creates_dirs_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![
            dir_record("data"),
            file_record("data/a.bin", 3 * MAX_CHUNK),
            file_record("empty.txt", 0),
            file_record("data/b.bin", 100),
        ];

        let plan = plan_install(&records, dir.path()).await.unwrap();

        assert!(dir.path().join("data").is_dir());
        assert!(dir.path().join("empty.txt").is_file());
        assert_eq!(
            std::fs::metadata(dir.path().join("empty.txt")).unwrap().len(),
            0
        );
        // Chunked files are planned but not created yet.
        assert!(!dir.path().join("data/a.bin").exists());

        assert_eq!(plan.total_files, 2);
        assert_eq!(plan.total_bytes, 3 * MAX_CHUNK + 100);

        // Indices are unique and resolvable by path.
        let a = plan.index_by_path["data/a.bin"];
        let b = plan.index_by_path["data/b.bin"];
        assert_ne!(a, b);
        assert_eq!(plan.files[&a].chunk_count, 3);
        assert_eq!(plan.files[&b].chunk_count, 1);
        assert_eq!(plan.files[&a].full_path, dir.path().join("data/a.bin"));
    }

    #[tokio::test]
    async fn test_zero_size_file_schedules_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_install(&[file_record("empty.bin", 0)], dir.path())
            .await
            .unwrap();
        assert_eq!(plan.total_files, 0);
        assert!(plan.files.is_empty());
        assert!(dir.path().join("empty.bin").is_file());
    }

    #[tokio::test]
    async fn test_group_chunks_filters_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![dir_record("data"), file_record("data/a.bin", 2 * MAX_CHUNK)];
        let plan = plan_install(&records, dir.path()).await.unwrap();

        let chunks = vec![
            chunk_record("data/a.bin", 0, "aa"),
            chunk_record("data/a.bin", 1, "bb"),
            // Not part of the plan: silently dropped.
            chunk_record("stray.bin", 0, "cc"),
        ];
        let grouped = group_chunks(&plan, &chunks).unwrap();
        let index = plan.index_by_path["data/a.bin"];
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[&index].len(), 2);
        assert_eq!(grouped[&index][1].sha(), "bb");
    }

    #[tokio::test]
    async fn test_group_chunks_rejects_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_install(&[file_record("a.bin", 2 * MAX_CHUNK)], dir.path())
            .await
            .unwrap();
        let chunks = vec![chunk_record("a.bin", 0, "aa")];
        assert!(group_chunks(&plan, &chunks).is_err());
    }
}
