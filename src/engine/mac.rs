//! macOS install finalization
//!
//! Gatekeeper-relevant bit: the CDN stores plain files, so the bundle
//! executables named by each `.app`'s `Info.plist` come back without the
//! execute bit and have to be restored after download.

use serde::Deserialize;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Deserialize)]
struct BundleInfo {
    #[serde(rename = "CFBundleExecutable")]
    bundle_executable: String,
}

/// Walk the install tree, and for every `.app` bundle mark the
/// executable named in `Contents/Info.plist` as 0755.
pub fn mark_bundles_executable(install_path: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(install_path)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let is_bundle = entry.file_type().is_dir()
            && entry.path().extension().map_or(false, |ext| ext == "app");
        if !is_bundle {
            continue;
        }

        let plist_path = entry.path().join("Contents").join("Info.plist");
        if !plist_path.exists() {
            continue;
        }

        let info: BundleInfo = match plist::from_file(&plist_path) {
            Ok(info) => info,
            Err(e) => {
                warn!("unreadable {}: {}", plist_path.display(), e);
                continue;
            }
        };

        let executable = entry
            .path()
            .join("Contents")
            .join("MacOS")
            .join(&info.bundle_executable);
        if executable.exists() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&executable, std::fs::Permissions::from_mode(0o755))?;
            debug!("marked {} executable", executable.display());
        }
    }
    Ok(())
}
