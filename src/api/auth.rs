//! Session management against the upstream service
//!
//! Login exchanges credentials for session cookies; the cookies are
//! persisted to `cookies.json` and replayed into a cookie jar on every
//! later run. All requests carry the fixed `galaClient` user agent.

use crate::config::{self, Config, USER_AGENT};
use reqwest::cookie::Jar;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionCookie {
    name: String,
    value: String,
}

/// An authenticated client for the upstream API.
pub struct Session {
    pub client: reqwest::Client,
    api_base: String,
}

fn cookies_path() -> anyhow::Result<PathBuf> {
    Ok(Config::state_dir()?.join("cookies.json"))
}

fn load_cookies() -> anyhow::Result<Vec<SessionCookie>> {
    let path = cookies_path()?;
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(&path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn save_cookies(cookies: &[SessionCookie]) -> anyhow::Result<()> {
    config::write_atomic(&cookies_path()?, &serde_json::to_vec_pretty(cookies)?)?;
    Ok(())
}

fn client_with_cookies(
    api_base: &str,
    cookies: &[SessionCookie],
) -> anyhow::Result<reqwest::Client> {
    let jar = Arc::new(Jar::default());
    let url = api_base.parse()?;
    for cookie in cookies {
        jar.add_cookie_str(&format!("{}={}; Path=/", cookie.name, cookie.value), &url);
    }
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .cookie_provider(jar)
        .build()?)
}

impl Session {
    /// Restore the saved session. Fails when no login has happened yet.
    pub fn load(config: &Config) -> anyhow::Result<Self> {
        let cookies = load_cookies()?;
        if cookies.is_empty() {
            anyhow::bail!("not logged in. run: midway login");
        }
        Ok(Self {
            client: client_with_cookies(config.api_base(), &cookies)?,
            api_base: config.api_base().to_string(),
        })
    }

    /// Exchange credentials for session cookies and persist them.
    pub async fn login(config: &Config, email: &str, password: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        let resp = client
            .post(format!("{}/users/login", config.api_base()))
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("login failed ({}): {}", status, body);
        }

        let cookies: Vec<SessionCookie> = resp
            .cookies()
            .map(|c| SessionCookie {
                name: c.name().to_string(),
                value: c.value().to_string(),
            })
            .collect();
        if cookies.is_empty() {
            anyhow::bail!("login response carried no session cookies");
        }
        save_cookies(&cookies)?;

        Ok(Self {
            client: client_with_cookies(config.api_base(), &cookies)?,
            api_base: config.api_base().to_string(),
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn is_logged_in() -> bool {
        cookies_path().map(|p| p.exists()).unwrap_or(false)
    }

    /// Drop the persisted session.
    pub fn logout() -> anyhow::Result<()> {
        let path = cookies_path()?;
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
