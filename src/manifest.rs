//! Build and chunks manifest codec
//!
//! A version on the CDN is described by two CSV documents: the build
//! manifest (one row per file or directory) and the chunks manifest (one
//! row per 1 MiB chunk). Both use a header row, columns may appear in any
//! order, and path columns are Latin-1 encoded with `\` separators. The
//! codec normalizes everything to UTF-8 `/`-separated relative paths;
//! conversion to the host separator happens only at filesystem I/O.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Fixed chunk size. Every chunk except a file's last is exactly this
/// many bytes; the last carries the remainder.
pub const MAX_CHUNK: u64 = 1_048_576;

/// `Flags` value marking a build record as a directory.
pub const DIRECTORY_FLAG: u32 = 40;

const BUILD_COLUMNS: [&str; 5] = ["Size in Bytes", "Chunks", "SHA", "Flags", "File Name"];
const CHANGE_TAG_COLUMN: &str = "Change Tag";
const CHUNK_COLUMNS: [&str; 3] = ["ID", "Filepath", "Chunk SHA"];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is missing required column {0:?}")]
    MissingColumn(&'static str),
    #[error("manifest row {row}: bad {column} value {value:?}")]
    BadField {
        row: usize,
        column: &'static str,
        value: String,
    },
    #[error("unsafe manifest path {0:?}")]
    UnsafePath(String),
    #[error("chunks for {file_path:?} are out of order at position {position}")]
    ChunkOrder { file_path: String, position: usize },
    #[error("{file_path:?} lists {expected} chunks but the chunks manifest has {actual}")]
    ChunkCount {
        file_path: String,
        expected: u32,
        actual: u32,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Target platform of a build, as spelled in CDN paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BuildOs {
    Win,
    Lin,
    Mac,
}

impl BuildOs {
    /// Platform of the running host.
    pub fn host() -> Self {
        if cfg!(target_os = "windows") {
            BuildOs::Win
        } else if cfg!(target_os = "macos") {
            BuildOs::Mac
        } else {
            BuildOs::Lin
        }
    }
}

impl fmt::Display for BuildOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildOs::Win => "win",
            BuildOs::Lin => "lin",
            BuildOs::Mac => "mac",
        };
        f.write_str(s)
    }
}

impl FromStr for BuildOs {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "win" => Ok(BuildOs::Win),
            "lin" => Ok(BuildOs::Lin),
            "mac" => Ok(BuildOs::Mac),
            other => Err(format!("unknown os {other:?} (expected win, lin or mac)")),
        }
    }
}

/// One row of the build manifest: a file or directory in the version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub size_bytes: u64,
    pub chunk_count: u32,
    pub file_sha256: String,
    pub flags: u32,
    /// Normalized `/`-separated path relative to the install root.
    pub file_path: String,
    pub change_tag: String,
}

impl BuildRecord {
    pub fn is_directory(&self) -> bool {
        self.flags == DIRECTORY_FLAG
    }

    /// A file that needs no chunk downloads (empty, or a directory).
    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0 || self.chunk_count == 0
    }
}

/// One row of the chunks manifest: a single chunk of a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Ordinal of this chunk within its file, starting at 0.
    pub index_in_file: u32,
    /// Normalized path, matching the build manifest's `File Name`.
    pub file_path: String,
    /// CDN object name; its suffix after the last `_` is the chunk SHA-256.
    pub chunk_id: String,
}

impl ChunkRecord {
    pub fn sha(&self) -> &str {
        extract_sha(&self.chunk_id)
    }
}

/// Reinterpret Latin-1 bytes as Unicode code points (0x00-0xFF map to
/// U+0000-U+00FF).
pub fn latin1_to_utf8(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Inverse of [`latin1_to_utf8`]. Code points above U+00FF cannot come out
/// of that decoding and are replaced with `?`.
pub fn utf8_to_latin1(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
        .collect()
}

/// Chunk identifiers end in `_<sha256>`. Returns the whole string when no
/// `_` is present.
pub fn extract_sha(chunk_id: &str) -> &str {
    match chunk_id.rsplit_once('_') {
        Some((_, sha)) => sha,
        None => chunk_id,
    }
}

/// CDN object URL for a chunk.
pub fn chunk_url(cdn_base: &str, namespace: &str, id_key: &str, os: BuildOs, chunk_id: &str) -> String {
    format!(
        "{}/DevShowCaseSourceVolume/dev_fold_{}/{}/{}/{}",
        cdn_base.trim_end_matches('/'),
        namespace,
        id_key,
        os,
        chunk_id
    )
}

/// CDN URL of a version's build manifest.
pub fn build_manifest_url(cdn_base: &str, namespace: &str, id_key: &str, os: BuildOs, version: &str) -> String {
    format!(
        "{}/DevShowCaseSourceVolume/dev_fold_{}/{}/{}/{}_manifest.csv",
        cdn_base.trim_end_matches('/'),
        namespace,
        id_key,
        os,
        version
    )
}

/// CDN URL of a version's chunks manifest.
pub fn chunks_manifest_url(cdn_base: &str, namespace: &str, id_key: &str, os: BuildOs, version: &str) -> String {
    format!(
        "{}/DevShowCaseSourceVolume/dev_fold_{}/{}/{}/{}_manifest_chunks.csv",
        cdn_base.trim_end_matches('/'),
        namespace,
        id_key,
        os,
        version
    )
}

/// Join a normalized manifest path onto an install root using host
/// separators. The only place `/`-separated paths become native ones.
pub fn host_path(root: &Path, normalized: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in normalized.split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}

/// Decode a raw path column: Latin-1 to UTF-8, `\` to `/`, and reject
/// absolute or parent-escaping paths.
fn decode_path(raw: &[u8]) -> Result<String, ManifestError> {
    let normalized = latin1_to_utf8(raw).replace('\\', "/");
    if normalized.starts_with('/') || normalized.split('/').any(|part| part == "..") {
        return Err(ManifestError::UnsafePath(normalized));
    }
    Ok(normalized)
}

/// Map recognized column names to their positions in the header row.
fn column_index(headers: &csv::ByteRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| latin1_to_utf8(h).trim() == name)
}

fn require_column(headers: &csv::ByteRecord, name: &'static str) -> Result<usize, ManifestError> {
    column_index(headers, name).ok_or(ManifestError::MissingColumn(name))
}

fn parse_number<T: FromStr>(
    record: &csv::ByteRecord,
    idx: usize,
    row: usize,
    column: &'static str,
) -> Result<T, ManifestError>
where
    T: Default,
{
    let raw = match record.get(idx) {
        Some(raw) => latin1_to_utf8(raw),
        // Rows may omit trailing columns.
        None => return Ok(T::default()),
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(T::default());
    }
    trimmed.parse().map_err(|_| ManifestError::BadField {
        row,
        column,
        value: trimmed.to_string(),
    })
}

fn field_string(record: &csv::ByteRecord, idx: usize) -> String {
    record
        .get(idx)
        .map(|raw| latin1_to_utf8(raw).trim().to_string())
        .unwrap_or_default()
}

/// Parse a build manifest from raw CSV bytes.
pub fn parse_build_manifest(bytes: &[u8]) -> Result<Vec<BuildRecord>, ManifestError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
    let headers = reader.byte_headers()?.clone();

    let size_idx = require_column(&headers, BUILD_COLUMNS[0])?;
    let chunks_idx = require_column(&headers, BUILD_COLUMNS[1])?;
    let sha_idx = require_column(&headers, BUILD_COLUMNS[2])?;
    let flags_idx = require_column(&headers, BUILD_COLUMNS[3])?;
    let name_idx = require_column(&headers, BUILD_COLUMNS[4])?;
    let tag_idx = column_index(&headers, CHANGE_TAG_COLUMN);

    let mut records = Vec::new();
    for (row, result) in reader.byte_records().enumerate() {
        let record = result?;
        let raw_name = record.get(name_idx).ok_or(ManifestError::BadField {
            row,
            column: BUILD_COLUMNS[4],
            value: String::new(),
        })?;

        records.push(BuildRecord {
            size_bytes: parse_number(&record, size_idx, row, BUILD_COLUMNS[0])?,
            chunk_count: parse_number(&record, chunks_idx, row, BUILD_COLUMNS[1])?,
            file_sha256: field_string(&record, sha_idx),
            flags: parse_number(&record, flags_idx, row, BUILD_COLUMNS[3])?,
            file_path: decode_path(raw_name)?,
            change_tag: field_string(&record, tag_idx.unwrap_or(usize::MAX)),
        });
    }
    Ok(records)
}

/// Parse a chunks manifest from raw CSV bytes. Chunks of one file must be
/// listed with ascending ordinals; anything else is a protocol error.
pub fn parse_chunks_manifest(bytes: &[u8]) -> Result<Vec<ChunkRecord>, ManifestError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
    let headers = reader.byte_headers()?.clone();

    let id_idx = require_column(&headers, CHUNK_COLUMNS[0])?;
    let path_idx = require_column(&headers, CHUNK_COLUMNS[1])?;
    let sha_idx = require_column(&headers, CHUNK_COLUMNS[2])?;

    let mut records: Vec<ChunkRecord> = Vec::new();
    let mut last_ordinal: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
    for (row, result) in reader.byte_records().enumerate() {
        let record = result?;
        let raw_path = record.get(path_idx).ok_or(ManifestError::BadField {
            row,
            column: CHUNK_COLUMNS[1],
            value: String::new(),
        })?;

        let chunk = ChunkRecord {
            index_in_file: parse_number(&record, id_idx, row, CHUNK_COLUMNS[0])?,
            file_path: decode_path(raw_path)?,
            chunk_id: field_string(&record, sha_idx),
        };

        let expected = match last_ordinal.get(&chunk.file_path) {
            Some(prev) => prev + 1,
            None => 0,
        };
        if chunk.index_in_file != expected {
            return Err(ManifestError::ChunkOrder {
                file_path: chunk.file_path,
                position: row,
            });
        }
        last_ordinal.insert(chunk.file_path.clone(), chunk.index_in_file);
        records.push(chunk);
    }
    Ok(records)
}

/// Serialize build records back to CSV in the canonical column order.
/// Round-trips through [`parse_build_manifest`].
pub fn serialize_build_manifest(records: &[BuildRecord]) -> Result<Vec<u8>, ManifestError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = csv::ByteRecord::new();
    for column in BUILD_COLUMNS {
        header.push_field(column.as_bytes());
    }
    header.push_field(CHANGE_TAG_COLUMN.as_bytes());
    writer.write_byte_record(&header)?;

    for record in records {
        let mut row = csv::ByteRecord::new();
        row.push_field(record.size_bytes.to_string().as_bytes());
        row.push_field(record.chunk_count.to_string().as_bytes());
        row.push_field(record.file_sha256.as_bytes());
        row.push_field(record.flags.to_string().as_bytes());
        row.push_field(&utf8_to_latin1(&record.file_path));
        row.push_field(record.change_tag.as_bytes());
        writer.write_byte_record(&row)?;
    }

    writer
        .into_inner()
        .map_err(|e| ManifestError::Csv(csv::Error::from(e.into_error())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> BuildRecord {
        BuildRecord {
            size_bytes: 2_621_440,
            chunk_count: 3,
            file_sha256: "ab".repeat(32),
            flags: 0,
            file_path: "data/a.bin".to_string(),
            change_tag: String::new(),
        }
    }

    #[test]
    fn test_parse_build_manifest() {
        let csv = b"Size in Bytes,Chunks,SHA,Flags,File Name,Change Tag\n\
                    2621440,3,abcd,0,data\\a.bin,\n\
                    0,0,,40,data,\n";
        let records = parse_build_manifest(csv).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].file_path, "data/a.bin");
        assert_eq!(records[0].chunk_count, 3);
        assert!(!records[0].is_directory());
        assert!(records[1].is_directory());
        assert!(records[1].is_empty());
    }

    #[test]
    fn test_column_order_is_irrelevant() {
        let csv = b"File Name,Flags,SHA,Chunks,Size in Bytes\n\
                    a.bin,0,ff,1,42\n";
        let records = parse_build_manifest(csv).unwrap();
        assert_eq!(records[0].file_path, "a.bin");
        assert_eq!(records[0].size_bytes, 42);
        assert_eq!(records[0].chunk_count, 1);
        // Change Tag column absent entirely: defaults to empty.
        assert_eq!(records[0].change_tag, "");
    }

    #[test]
    fn test_trailing_columns_may_be_omitted() {
        let csv = b"Size in Bytes,Chunks,SHA,Flags,File Name,Change Tag\n\
                    1024,1,ff,0,a.bin\n";
        let records = parse_build_manifest(csv).unwrap();
        assert_eq!(records[0].change_tag, "");
    }

    #[test]
    fn test_missing_header_is_fatal() {
        let csv = b"Size in Bytes,Chunks,SHA,Flags\n1,1,ff,0\n";
        match parse_build_manifest(csv) {
            Err(ManifestError::MissingColumn("File Name")) => {}
            other => panic!("expected missing column error, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_number_is_fatal() {
        let csv = b"Size in Bytes,Chunks,SHA,Flags,File Name\nnope,1,ff,0,a.bin\n";
        assert!(parse_build_manifest(csv).is_err());
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        let csv = b"Size in Bytes,Chunks,SHA,Flags,File Name\n1,1,ff,0,..\\evil\n";
        assert!(matches!(
            parse_build_manifest(csv),
            Err(ManifestError::UnsafePath(_))
        ));
        let csv = b"Size in Bytes,Chunks,SHA,Flags,File Name\n1,1,ff,0,/abs/path\n";
        assert!(matches!(
            parse_build_manifest(csv),
            Err(ManifestError::UnsafePath(_))
        ));
    }

    #[test]
    fn test_latin1_path_decoding() {
        // 0xE9 is é in Latin-1; must survive as U+00E9, not break UTF-8.
        let mut csv = b"Size in Bytes,Chunks,SHA,Flags,File Name\n1,1,ff,0,caf".to_vec();
        csv.push(0xE9);
        csv.extend_from_slice(b".bin\n");
        let records = parse_build_manifest(&csv).unwrap();
        assert_eq!(records[0].file_path, "caf\u{e9}.bin");
    }

    #[test]
    fn test_latin1_round_trip() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        assert_eq!(utf8_to_latin1(&latin1_to_utf8(&bytes)), bytes);
    }

    #[test]
    fn test_build_manifest_round_trip() {
        let records = vec![
            sample_record(),
            BuildRecord {
                size_bytes: 0,
                chunk_count: 0,
                file_sha256: String::new(),
                flags: DIRECTORY_FLAG,
                file_path: "data".to_string(),
                change_tag: "added".to_string(),
            },
        ];
        let bytes = serialize_build_manifest(&records).unwrap();
        assert_eq!(parse_build_manifest(&bytes).unwrap(), records);
    }

    #[test]
    fn test_parse_chunks_manifest() {
        let csv = b"ID,Filepath,Chunk SHA\n\
                    0,a.bin,a_0_1111\n\
                    1,a.bin,a_1_2222\n\
                    0,b.bin,b_0_3333\n";
        let records = parse_chunks_manifest(csv).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].index_in_file, 1);
        assert_eq!(records[1].sha(), "2222");
        assert_eq!(records[2].file_path, "b.bin");
    }

    #[test]
    fn test_chunk_order_violation_is_fatal() {
        let csv = b"ID,Filepath,Chunk SHA\n0,a.bin,a_0_1111\n2,a.bin,a_2_2222\n";
        assert!(matches!(
            parse_chunks_manifest(csv),
            Err(ManifestError::ChunkOrder { .. })
        ));
    }

    #[test]
    fn test_extract_sha() {
        assert_eq!(extract_sha("p_1_deadbeef"), "deadbeef");
        assert_eq!(extract_sha("no-underscore"), "no-underscore");
        assert_eq!(extract_sha("p_i_s"), "s");
    }

    #[test]
    fn test_chunk_url_shape() {
        let url = chunk_url("https://cdn.example.com/", "ns", "key", BuildOs::Win, "c_0_ff");
        assert_eq!(
            url,
            "https://cdn.example.com/DevShowCaseSourceVolume/dev_fold_ns/key/win/c_0_ff"
        );
        let url = build_manifest_url("https://cdn.example.com", "ns", "key", BuildOs::Lin, "1.0");
        assert!(url.ends_with("/dev_fold_ns/key/lin/1.0_manifest.csv"));
        let url = chunks_manifest_url("https://cdn.example.com", "ns", "key", BuildOs::Mac, "1.0");
        assert!(url.ends_with("/dev_fold_ns/key/mac/1.0_manifest_chunks.csv"));
    }

    #[test]
    fn test_host_path_joins_components() {
        let path = host_path(Path::new("/install"), "data/a.bin");
        assert_eq!(path, PathBuf::from("/install/data/a.bin"));
    }
}
