//! HTTP client for the engine API.
//!
//! Used by the CLI binary; kept thin so other tooling can reuse it.

pub mod types;

use crate::alarm::Alarm;
use types::EngineState;

/// Where the daemon listens unless told otherwise.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7764";

pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v0{path}", self.base_url)
    }

    pub async fn get_status(&self) -> reqwest::Result<EngineState> {
        self.http
            .get(self.url("/status"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    pub async fn list_alarms(&self) -> reqwest::Result<Vec<Alarm>> {
        self.http
            .get(self.url("/alarms"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    /// Ask the daemon to sweep for weather refreshes now.
    pub async fn trigger_refresh(&self) -> reqwest::Result<()> {
        self.http
            .post(self.url("/refresh"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
