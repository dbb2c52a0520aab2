// src/apply/sources.rs

//! Payload sources
//!
//! The cache stage walks its sources in order (layout directory, existing
//! cache entry, download) until one places the payload at its destination.
//! A source that does not hold the payload answers `Ok(false)` so the next
//! one is tried. Integrity is checked by the cache stage, not by sources.

use crate::bundle::Payload;
use crate::error::{Error, Result};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout for payload requests
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Attempts per download
const MAX_RETRIES: u32 = 3;

/// Delay between download attempts
const RETRY_DELAY_MS: u64 = 1000;

/// Copy and download buffer (8 KB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// One payload to place
pub struct AcquireRequest<'a> {
    pub package_id: &'a str,
    pub payload: &'a Payload,
    /// Directory shipped alongside the bundle, if any
    pub layout_dir: Option<&'a Path>,
    /// Final location in the package cache
    pub destination: &'a Path,
}

/// Somewhere a payload can come from
pub trait PayloadSource: Send + Sync {
    fn name(&self) -> &str;

    /// Place the payload at `request.destination`
    ///
    /// `progress` receives `(bytes, total)` after every chunk. Returns
    /// `Ok(false)` when this source does not have the payload.
    fn acquire(&self, request: &AcquireRequest<'_>, progress: &dyn Fn(u64, u64)) -> Result<bool>;
}

/// Default chain: layout directory, prior cache, then download
pub fn default_sources() -> Result<Vec<std::sync::Arc<dyn PayloadSource>>> {
    Ok(vec![
        std::sync::Arc::new(LocalSource),
        std::sync::Arc::new(CacheSource),
        std::sync::Arc::new(DownloadSource::new()?),
    ])
}

fn temp_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Stream `reader` into `destination` through a temporary file
fn stream_to_file(
    reader: &mut dyn Read,
    destination: &Path,
    total: u64,
    progress: &dyn Fn(u64, u64),
) -> Result<u64> {
    ensure_parent(destination)?;
    let temp = temp_path(destination);
    let mut file = File::create(&temp)?;

    let mut written: u64 = 0;
    let mut buffer = [0u8; STREAM_BUFFER_SIZE];
    let copied = (|| -> Result<u64> {
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])?;
            written += read as u64;
            progress(written, total.max(written));
        }
        file.sync_all()?;
        Ok(written)
    })();

    match copied {
        Ok(bytes) => {
            fs::rename(&temp, destination)?;
            Ok(bytes)
        }
        Err(e) => {
            let _ = fs::remove_file(&temp);
            Err(e)
        }
    }
}

/// Copies payloads from the bundle's layout directory
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSource;

impl PayloadSource for LocalSource {
    fn name(&self) -> &str {
        "local"
    }

    fn acquire(&self, request: &AcquireRequest<'_>, progress: &dyn Fn(u64, u64)) -> Result<bool> {
        let Some(layout) = request.layout_dir else {
            return Ok(false);
        };
        let source = layout.join(&request.payload.file_name);
        if !source.is_file() {
            return Ok(false);
        }
        if source == request.destination {
            return Ok(true);
        }

        debug!("Copying {} from {}", request.payload.id, source.display());
        let mut file = File::open(&source)?;
        let total = file.metadata()?.len();
        stream_to_file(&mut file, request.destination, total, progress)?;
        Ok(true)
    }
}

/// Reuses a payload already in the package cache
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheSource;

impl PayloadSource for CacheSource {
    fn name(&self) -> &str {
        "cache"
    }

    fn acquire(&self, request: &AcquireRequest<'_>, progress: &dyn Fn(u64, u64)) -> Result<bool> {
        match fs::metadata(request.destination) {
            Ok(meta) if meta.is_file() => {
                debug!("Reusing cached {}", request.destination.display());
                progress(meta.len(), meta.len());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Downloads payloads that declare a URL
pub struct DownloadSource {
    client: Client,
    max_retries: u32,
}

impl DownloadSource {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::DownloadError(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }
}

impl PayloadSource for DownloadSource {
    fn name(&self) -> &str {
        "download"
    }

    fn acquire(&self, request: &AcquireRequest<'_>, progress: &dyn Fn(u64, u64)) -> Result<bool> {
        let Some(url) = request.payload.download_url.as_deref() else {
            return Ok(false);
        };
        info!("Downloading {} from {}", request.payload.id, url);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(mut response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }
                    let total = response
                        .content_length()
                        .unwrap_or(request.payload.size);
                    let bytes = stream_to_file(&mut response, request.destination, total, progress)?;
                    info!("Downloaded {} bytes for {}", bytes, request.payload.id);
                    return Ok(true);
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "failed to download {url} after {attempt} attempts: {e}"
                        )));
                    }
                    warn!("Download attempt {} for {} failed: {}, retrying...", attempt, request.package_id, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * u64::from(attempt)));
                }
            }
        }
    }
}
