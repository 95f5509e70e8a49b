//! User configuration and on-disk state paths
//!
//! Everything persistent lives under the platform config directory
//! (`ProjectDirs`): `config.toml`, `library.json`, `installed.json`,
//! `cookies.json` and the `manifests/` cache. State directories are
//! created 0700 and state files written 0600.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upstream expects this exact value on every request.
pub const USER_AGENT: &str = "galaClient";

pub const DEFAULT_API_BASE: &str = "https://api.gala.games";
pub const DEFAULT_CDN_BASE: &str = "https://content.gala.games";

/// Default ceiling for chunk bytes held in memory across all workers.
pub const DEFAULT_MAX_MEMORY: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub api_base: Option<String>,
    pub cdn_base: Option<String>,
    /// Titles install under `<base_install_path>/<slug>` unless `--path`
    /// overrides it.
    pub base_install_path: Option<PathBuf>,
    pub workers: Option<usize>,
    pub max_memory: Option<u64>,
}

impl Config {
    /// State directory, created on first use with restrictive permissions.
    pub fn state_dir() -> anyhow::Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "midway", "midway")
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
        let dir = proj_dirs.config_dir().to_path_buf();
        ensure_state_dir(&dir)?;
        Ok(dir)
    }

    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::state_dir()?.join("config.toml"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;
        write_atomic(&path, toml::to_string_pretty(self)?.as_bytes())?;
        Ok(())
    }

    pub fn api_base(&self) -> &str {
        self.api_base.as_deref().unwrap_or(DEFAULT_API_BASE)
    }

    pub fn cdn_base(&self) -> &str {
        self.cdn_base.as_deref().unwrap_or(DEFAULT_CDN_BASE)
    }
}

/// Create a state directory (and parents) with mode 0700.
pub fn ensure_state_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write a state file atomically: temp file alongside, 0600, then rename.
/// Re-reads always observe either the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = match path.file_name() {
        Some(name) => {
            let mut tmp_name = name.to_os_string();
            tmp_name.push(".tmp");
            path.with_file_name(tmp_name)
        }
        None => return Err(std::io::Error::other("state path has no file name")),
    };
    std::fs::write(&tmp, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        // No temp file left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_state_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"x").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.api_base(), DEFAULT_API_BASE);
        assert_eq!(config.cdn_base(), DEFAULT_CDN_BASE);
        assert!(config.workers.is_none());
    }

    #[test]
    fn test_config_round_trip() {
        let config = Config {
            api_base: Some("https://api.example.com".into()),
            cdn_base: None,
            base_install_path: Some(PathBuf::from("/games")),
            workers: Some(4),
            max_memory: Some(1 << 20),
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.api_base(), "https://api.example.com");
        assert_eq!(back.workers, Some(4));
        assert_eq!(back.max_memory, Some(1 << 20));
    }
}
