//! Product catalog types and the library listing endpoint.

use super::Session;
use crate::manifest::BuildOs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A title the account owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    /// CDN namespace the title's objects live under.
    pub namespace: String,
    /// CDN folder key for the title.
    pub id_key: String,
    pub slug: String,
    pub name: String,
    pub versions: Vec<Version>,
}

/// One released build of a product. Unique on `(version_id, os)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub version_id: String,
    pub os: BuildOs,
    pub release_date: Option<DateTime<Utc>>,
}

impl Product {
    /// Versions available for one platform, newest release first.
    pub fn versions_for(&self, os: BuildOs) -> Vec<&Version> {
        let mut versions: Vec<&Version> = self.versions.iter().filter(|v| v.os == os).collect();
        versions.sort_by(|a, b| b.release_date.cmp(&a.release_date));
        versions
    }

    pub fn latest_version(&self, os: BuildOs) -> Option<&Version> {
        self.versions_for(os).into_iter().next()
    }

    pub fn version(&self, version_id: &str, os: BuildOs) -> Option<&Version> {
        self.versions
            .iter()
            .find(|v| v.version_id == version_id && v.os == os)
    }
}

#[derive(Debug, Deserialize)]
struct LibraryResponse {
    products: Vec<Product>,
}

/// Fetch the account's product list for the library cache.
pub async fn fetch_library(session: &Session) -> anyhow::Result<Vec<Product>> {
    let resp = session
        .client
        .get(format!("{}/games/library", session.api_base()))
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("library request failed ({}): {}", status, body);
    }

    let library: LibraryResponse = resp.json().await?;
    Ok(library.products)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(id: &str, os: BuildOs, day: u32) -> Version {
        Version {
            version_id: id.to_string(),
            os,
            release_date: Some(
                chrono::NaiveDate::from_ymd_opt(2024, 1, day)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    .and_utc(),
            ),
        }
    }

    #[test]
    fn test_latest_version_per_os() {
        let product = Product {
            namespace: "ns".into(),
            id_key: "key".into(),
            slug: "game".into(),
            name: "Game".into(),
            versions: vec![
                version("1.0", BuildOs::Win, 1),
                version("1.1", BuildOs::Win, 5),
                version("1.0", BuildOs::Lin, 3),
            ],
        };
        assert_eq!(product.latest_version(BuildOs::Win).unwrap().version_id, "1.1");
        assert_eq!(product.latest_version(BuildOs::Lin).unwrap().version_id, "1.0");
        assert!(product.latest_version(BuildOs::Mac).is_none());
        assert!(product.version("1.0", BuildOs::Win).is_some());
        assert!(product.version("1.1", BuildOs::Lin).is_none());
    }
}
