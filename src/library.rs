//! Persistent library state: cached products, install records, manifests
//!
//! `library.json` caches the remote product list, `installed.json` maps a
//! slug to its install record, and `manifests/{slug}/{version}/` keeps the
//! raw CSV bytes of both manifests so verify and update work without
//! re-downloading them.

use crate::api::products::Product;
use crate::config::{self, Config};
use crate::manifest::BuildOs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A successfully installed title.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRecord {
    pub install_path: PathBuf,
    pub version: String,
    pub os: BuildOs,
    pub installed_at: DateTime<Utc>,
}

/// Which of the two cached manifest documents to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Build,
    Chunks,
}

impl ManifestKind {
    fn file_name(self) -> &'static str {
        match self {
            ManifestKind::Build => "manifest.csv",
            ManifestKind::Chunks => "manifest_chunks.csv",
        }
    }
}

fn installed_path() -> anyhow::Result<PathBuf> {
    Ok(Config::state_dir()?.join("installed.json"))
}

fn library_path() -> anyhow::Result<PathBuf> {
    Ok(Config::state_dir()?.join("library.json"))
}

pub fn load_installed() -> anyhow::Result<BTreeMap<String, InstallRecord>> {
    let path = installed_path()?;
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let bytes = std::fs::read(&path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn save_installed(records: &BTreeMap<String, InstallRecord>) -> anyhow::Result<()> {
    config::write_atomic(&installed_path()?, &serde_json::to_vec_pretty(records)?)?;
    Ok(())
}

pub fn install_record(slug: &str) -> anyhow::Result<Option<InstallRecord>> {
    Ok(load_installed()?.remove(slug))
}

pub fn put_install_record(slug: &str, record: InstallRecord) -> anyhow::Result<()> {
    let mut records = load_installed()?;
    records.insert(slug.to_string(), record);
    save_installed(&records)
}

pub fn remove_install_record(slug: &str) -> anyhow::Result<Option<InstallRecord>> {
    let mut records = load_installed()?;
    let removed = records.remove(slug);
    if removed.is_some() {
        save_installed(&records)?;
    }
    Ok(removed)
}

pub fn load_products() -> anyhow::Result<Vec<Product>> {
    let path = library_path()?;
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(&path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn save_products(products: &[Product]) -> anyhow::Result<()> {
    config::write_atomic(&library_path()?, &serde_json::to_vec_pretty(products)?)?;
    Ok(())
}

/// Find a cached product by slug.
pub fn find_product<'a>(products: &'a [Product], slug: &str) -> Option<&'a Product> {
    products.iter().find(|p| p.slug == slug)
}

fn manifest_dir(slug: &str, version: &str) -> anyhow::Result<PathBuf> {
    Ok(Config::state_dir()?
        .join("manifests")
        .join(slug)
        .join(version))
}

/// Cache raw manifest CSV bytes for `(slug, version)`.
pub fn store_manifest(
    slug: &str,
    version: &str,
    kind: ManifestKind,
    bytes: &[u8],
) -> anyhow::Result<()> {
    let dir = manifest_dir(slug, version)?;
    config::ensure_state_dir(&dir)?;
    config::write_atomic(&dir.join(kind.file_name()), bytes)?;
    Ok(())
}

/// Read cached manifest bytes, `None` when the cache has no entry.
pub fn read_manifest(
    slug: &str,
    version: &str,
    kind: ManifestKind,
) -> anyhow::Result<Option<Vec<u8>>> {
    let path = manifest_dir(slug, version)?.join(kind.file_name());
    match std::fs::read(&path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Drop all cached manifests for a slug (uninstall cleanup).
pub fn remove_manifests(slug: &str) -> anyhow::Result<()> {
    let dir = Config::state_dir()?.join("manifests").join(slug);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
