// src/index/fetch.rs

//! Content-addressed download cache for source archives
//!
//! Entries are keyed by the archive's canonical filename. Readers only ever
//! see complete files: downloads land in a temporary file in the cache
//! directory and are published with an exclusive create, so two workers
//! fetching the same archive cannot leave a partial file behind.

use super::client::ChannelClient;
use super::{ArtifactFetcher, Candidate};
use crate::error::{Error, Result};
use crate::filesystem::path::sanitize_filename;
use crate::hash;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use url::Url;

/// [`ArtifactFetcher`] with an on-disk cache
pub struct CachedFetcher {
    client: ChannelClient,
    cache_dir: PathBuf,
    show_progress: bool,
}

impl CachedFetcher {
    pub fn new(client: ChannelClient, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            cache_dir: cache_dir.into(),
            show_progress: false,
        }
    }

    /// Show a progress bar per download
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn progress_bar(&self, name: &str) -> Option<ProgressBar> {
        if !self.show_progress {
            return None;
        }
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_message(name.to_string());
        Some(pb)
    }

    fn download(&self, candidate: &Candidate, dest: &Path) -> Result<()> {
        fs::create_dir_all(&self.cache_dir).map_err(|e| {
            Error::write(format!("Failed to create cache {}", self.cache_dir.display()), e)
        })?;

        let mut tmp = NamedTempFile::new_in(&self.cache_dir)
            .map_err(|e| Error::write("Failed to create download file", e))?;

        info!("Downloading {}", candidate.url);
        let pb = self.progress_bar(&candidate.filename);
        let result = self.client.download_to(&candidate.url, &mut tmp, pb.as_ref());
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
        let bytes = result?;
        tmp.flush()
            .map_err(|e| Error::write("Failed to flush download", e))?;

        if let Some(expected) = &candidate.sha256 {
            // The temporary file is removed on drop if verification fails
            verify_sha256(tmp.path(), &candidate.filename, expected)?;
        }

        match tmp.persist_noclobber(dest) {
            Ok(_) => {
                debug!("Cached {} ({} bytes)", dest.display(), bytes);
                Ok(())
            }
            // Another worker published the same archive first
            Err(_) if dest.is_file() => {
                debug!("{} was cached concurrently", dest.display());
                Ok(())
            }
            Err(e) => Err(Error::write(
                format!("Failed to publish {}", dest.display()),
                e.error,
            )),
        }
    }
}

impl ArtifactFetcher for CachedFetcher {
    fn fetch(&self, candidate: &Candidate) -> Result<PathBuf> {
        if let Some(local) = local_path(&candidate.url) {
            if !local.is_file() {
                return Err(Error::ArtifactNotFound(local.display().to_string()));
            }
            return Ok(local);
        }

        let filename = sanitize_filename(&candidate.filename)?;
        let dest = self.cache_dir.join(&filename);

        if dest.is_file() {
            match &candidate.sha256 {
                Some(expected) => match verify_sha256(&dest, &filename, expected) {
                    Ok(()) => return Ok(dest),
                    Err(e) => {
                        warn!("Discarding cached {}: {}", filename, e);
                        let _ = fs::remove_file(&dest);
                    }
                },
                None => {
                    debug!("Cache hit for {}", filename);
                    return Ok(dest);
                }
            }
        }

        self.download(candidate, &dest)?;
        Ok(dest)
    }
}

/// Local filesystem path for `file://` URLs and plain paths
fn local_path(location: &str) -> Option<PathBuf> {
    match Url::parse(location) {
        Ok(url) if url.scheme() == "file" => url.to_file_path().ok(),
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => None,
        _ => Some(PathBuf::from(location)),
    }
}

fn verify_sha256(path: &Path, name: &str, expected: &str) -> Result<()> {
    let actual = hash::sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::ChecksumMismatch {
            path: name.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    debug!("Checksum verified for {}", name);
    Ok(())
}
