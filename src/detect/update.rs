// src/detect/update.rs

//! Update discovery
//!
//! An [`UpdateSource`] lists candidate bundle versions for a location
//! string. [`select_update`] keeps only candidates strictly newer than the
//! running bundle and picks the greatest; when two candidates carry the same
//! version, the first one discovered wins.

use crate::error::{Error, Result};
use crate::version::Version;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Timeout for feed requests
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts per feed request
const MAX_RETRIES: u32 = 3;

/// Delay between attempts
const RETRY_DELAY_MS: u64 = 500;

/// A bundle version offered by an update source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCandidate {
    pub version: Version,
    pub location: String,
    #[serde(default)]
    pub size: u64,
}

/// Answers "which bundle versions are available at this location"
pub trait UpdateSource: Send + Sync {
    fn candidates(&self, location: &str) -> Result<Vec<UpdateCandidate>>;
}

/// Pick the update to offer, if any
pub fn select_update<'a>(
    running: &Version,
    candidates: &'a [UpdateCandidate],
) -> Option<&'a UpdateCandidate> {
    let mut best: Option<&UpdateCandidate> = None;
    for candidate in candidates {
        if candidate.version <= *running {
            debug!(
                "Ignoring update v{}: not newer than v{}",
                candidate.version, running
            );
            continue;
        }
        // Strictly greater keeps the first discovered on ties
        if best.is_none_or(|b| candidate.version > b.version) {
            best = Some(candidate);
        }
    }
    best
}

/// Fixed candidate list, independent of location
#[derive(Debug, Clone, Default)]
pub struct StaticUpdateSource {
    candidates: Vec<UpdateCandidate>,
}

impl StaticUpdateSource {
    pub fn new(candidates: Vec<UpdateCandidate>) -> Self {
        Self { candidates }
    }
}

impl UpdateSource for StaticUpdateSource {
    fn candidates(&self, _location: &str) -> Result<Vec<UpdateCandidate>> {
        Ok(self.candidates.clone())
    }
}

/// JSON feed document
#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(default)]
    updates: Vec<UpdateCandidate>,
}

/// Reads a JSON feed from a local path, a `file://` URL, or HTTP(S)
///
/// ```json
/// { "updates": [ { "version": "2.1.0", "location": "https://example.com/suite-2.1.0.toml", "size": 1048576 } ] }
/// ```
pub struct FeedUpdateSource {
    client: Client,
}

impl FeedUpdateSource {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::DownloadError(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn fetch(&self, url: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(response) if response.status().is_success() => {
                    return response
                        .text()
                        .map_err(|e| Error::DownloadError(format!("failed to read feed: {e}")));
                }
                Ok(response) => {
                    return Err(Error::DownloadError(format!(
                        "HTTP {} from {}",
                        response.status(),
                        url
                    )));
                }
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        return Err(Error::DownloadError(format!(
                            "failed to fetch {url} after {attempt} attempts: {e}"
                        )));
                    }
                    warn!("Feed request to {} failed (attempt {}): {}", url, attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * u64::from(attempt)));
                }
            }
        }
    }
}

impl UpdateSource for FeedUpdateSource {
    fn candidates(&self, location: &str) -> Result<Vec<UpdateCandidate>> {
        let body = match Url::parse(location) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                info!("Checking for updates at {}", url);
                self.fetch(url.as_str())?
            }
            Ok(url) if url.scheme() == "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| Error::ConfigError(format!("invalid file URL: {}", location)))?;
                std::fs::read_to_string(path)?
            }
            _ => std::fs::read_to_string(Path::new(location))?,
        };

        let feed: Feed = serde_json::from_str(&body)?;
        debug!("Feed at {} lists {} candidates", location, feed.updates.len());
        Ok(feed.updates)
    }
}
