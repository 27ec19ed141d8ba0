use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::Url;
use semver::Version;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{ReleaseFiles, ReleaseIndex};

/// Blocking client for the release registry. Every request is bounded by
/// the configured timeout.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: String,
    base: Url,
    timeout: Duration,
    client: Client,
}

impl RegistryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            anyhow::bail!("registry url must not be empty");
        }
        let base =
            Url::parse(&base_url).with_context(|| format!("invalid registry url: {base_url}"))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("registry url cannot hold release paths: {base_url}");
        }

        let mut builder = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("kitup/", env!("CARGO_PKG_VERSION")));
        if is_loopback_url(&base_url) {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .context("failed to build registry http client")?;

        Ok(Self {
            base_url,
            base,
            timeout,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn fetch_index(&self) -> Result<ReleaseIndex> {
        self.get_json(&["index.json"])
    }

    pub fn fetch_release_files(&self, version: &Version) -> Result<ReleaseFiles> {
        let version_segment = version.to_string();
        let files: ReleaseFiles =
            self.get_json(&["releases", &version_segment, "files.json"])?;
        if &files.version != version {
            anyhow::bail!(
                "registry returned file list for {} when {} was requested",
                files.version,
                version
            );
        }
        Ok(files)
    }

    pub fn fetch_file(&self, version: &Version, relative_path: &str) -> Result<Vec<u8>> {
        let version_segment = version.to_string();
        let segments = ["releases", version_segment.as_str(), "files"]
            .into_iter()
            .chain(relative_path.split('/').filter(|segment| !segment.is_empty()));
        let url = self.url_for(segments)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .with_context(|| format!("failed to request {url}"))?
            .error_for_status()
            .with_context(|| format!("registry rejected {url}"))?;
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read response body from {url}"))?;
        Ok(bytes.to_vec())
    }

    /// The designated latest release, or `None` on any failure so callers
    /// can fall back to another source.
    pub fn latest_version(&self) -> Option<Version> {
        match self.fetch_index() {
            Ok(index) => {
                debug!(registry = %self.base_url, latest = %index.latest, "registry reported latest release");
                Some(index.latest)
            }
            Err(err) => {
                warn!(registry = %self.base_url, error = %format!("{err:#}"), "registry latest version unavailable");
                None
            }
        }
    }

    pub fn is_reachable(&self) -> bool {
        let url = match self.url_for(["index.json"]) {
            Ok(url) => url,
            Err(err) => {
                debug!(registry = %self.base_url, error = %format!("{err:#}"), "registry probe failed");
                return false;
            }
        };
        match self.client.get(url).send() {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(registry = %self.base_url, error = %err, "registry probe failed");
                false
            }
        }
    }

    fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        let url = self.url_for(segments.iter().copied())?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .with_context(|| format!("failed to request {url}"))?
            .error_for_status()
            .with_context(|| format!("registry rejected {url}"))?;
        let body = response
            .text()
            .with_context(|| format!("failed to read response body from {url}"))?;
        serde_json::from_str(&body).with_context(|| format!("failed to parse JSON from {url}"))
    }

    /// Appends `segments` to the registry base, percent-encoding each one.
    fn url_for<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("registry url cannot hold release paths: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn is_loopback_url(url: &str) -> bool {
    let without_scheme = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    without_scheme.starts_with("127.0.0.1")
        || without_scheme.starts_with("localhost")
        || without_scheme.starts_with("[::1]")
}
