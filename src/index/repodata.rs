// src/index/repodata.rs

//! Conda channel index backed by `repodata.json`
//!
//! Each `(channel, subdir)` pair is fetched at most once per index and kept
//! in memory. Channels may be remote (`https://...` or a bare channel name on
//! anaconda.org) or a local channel directory laid out as
//! `<dir>/<subdir>/repodata.json`.

use super::client::ChannelClient;
use super::{Candidate, PackageIndex, sort_candidates};
use crate::artifact::{ArtifactReference, ArtifactSpec, dependency_name};
use crate::config::ResolutionConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Default host for bare channel names
const ANACONDA_ORG: &str = "https://conda.anaconda.org";

/// Host of the `main` and `r` default channels
const REPO_ANACONDA: &str = "https://repo.anaconda.com/pkgs";

#[derive(Debug, Default, Deserialize)]
struct Repodata {
    #[serde(default)]
    packages: BTreeMap<String, RepodataRecord>,
    #[serde(default, rename = "packages.conda")]
    packages_conda: BTreeMap<String, RepodataRecord>,
}

#[derive(Debug, Deserialize)]
struct RepodataRecord {
    name: String,
    version: String,
    build: String,
    #[serde(default)]
    build_number: u64,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    timestamp: Option<u64>,
}

/// Where a channel lives
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChannelLocation {
    Remote(String),
    Local(PathBuf),
}

/// Resolve a channel name or location to its base URL or directory
///
/// ```
/// use condawheel::index::channel_url;
///
/// assert_eq!(channel_url("conda-forge"), "https://conda.anaconda.org/conda-forge");
/// assert_eq!(channel_url("main"), "https://repo.anaconda.com/pkgs/main");
/// assert_eq!(channel_url("https://example.org/ch/"), "https://example.org/ch");
/// ```
pub fn channel_url(channel: &str) -> String {
    match locate_channel(channel) {
        ChannelLocation::Remote(url) => url,
        ChannelLocation::Local(path) => path.display().to_string(),
    }
}

fn locate_channel(channel: &str) -> ChannelLocation {
    let trimmed = channel.trim_end_matches('/');

    if let Ok(url) = Url::parse(trimmed) {
        match url.scheme() {
            "file" => {
                if let Ok(path) = url.to_file_path() {
                    return ChannelLocation::Local(path);
                }
            }
            "http" | "https" => return ChannelLocation::Remote(trimmed.to_string()),
            _ => {}
        }
    }

    let path = Path::new(trimmed);
    if path.is_absolute() || path.is_dir() {
        return ChannelLocation::Local(path.to_path_buf());
    }

    match trimmed {
        "main" | "r" => ChannelLocation::Remote(format!("{}/{}", REPO_ANACONDA, trimmed)),
        name => ChannelLocation::Remote(format!("{}/{}", ANACONDA_ORG, name)),
    }
}

/// [`PackageIndex`] over conda channels
pub struct RepodataIndex {
    channels: Vec<String>,
    client: ChannelClient,
    cache: Mutex<HashMap<(String, String), Arc<Repodata>>>,
}

impl RepodataIndex {
    pub fn new(channels: Vec<String>, client: ChannelClient) -> Self {
        Self {
            channels,
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Index over the configured channels followed by the system defaults
    pub fn from_config(config: &ResolutionConfig, client: ChannelClient) -> Self {
        Self::new(config.all_channels(), client)
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    fn repodata(&self, channel: &str, subdir: &str) -> Result<Arc<Repodata>> {
        let key = (channel.to_string(), subdir.to_string());
        if let Some(cached) = self.cache.lock().get(&key) {
            return Ok(Arc::clone(cached));
        }

        let repodata = match locate_channel(channel) {
            ChannelLocation::Remote(base) => {
                let url = format!("{}/{}/repodata.json", base, subdir);
                let data: Option<Repodata> = self.client.get_json(&url)?;
                data.unwrap_or_else(|| {
                    debug!("No repodata at {}", url);
                    Repodata::default()
                })
            }
            ChannelLocation::Local(dir) => {
                let path = dir.join(subdir).join("repodata.json");
                match std::fs::read_to_string(&path) {
                    Ok(content) => serde_json::from_str(&content).map_err(|e| {
                        Error::DownloadError(format!("Invalid repodata {}: {}", path.display(), e))
                    })?,
                    Err(_) => {
                        debug!("No repodata at {}", path.display());
                        Repodata::default()
                    }
                }
            }
        };

        info!(
            "Loaded {} packages from {}/{}",
            repodata.packages.len() + repodata.packages_conda.len(),
            channel,
            subdir
        );

        let repodata = Arc::new(repodata);
        self.cache.lock().insert(key, Arc::clone(&repodata));
        Ok(repodata)
    }
}

impl PackageIndex for RepodataIndex {
    fn find(&self, spec: &ArtifactSpec, subdirs: &[String]) -> Result<Vec<Candidate>> {
        let channels: Vec<&str> = match &spec.channel {
            Some(channel) => vec![channel.as_str()],
            None => self.channels.iter().map(String::as_str).collect(),
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates = Vec::new();

        for channel in channels {
            for subdir in subdirs {
                let repodata = self.repodata(channel, subdir)?;
                let base = channel_url(channel);

                // .conda entries first so they win over the same build as .tar.bz2
                let records = repodata
                    .packages_conda
                    .iter()
                    .chain(repodata.packages.iter());
                for (filename, record) in records {
                    if record.name != spec.name || !spec.matches(&record.version, &record.build) {
                        continue;
                    }
                    let reference = ArtifactReference::new(
                        channel,
                        subdir,
                        &record.name,
                        &record.version,
                        &record.build,
                    );
                    if !seen.insert(reference.canonical()) {
                        continue;
                    }
                    candidates.push(Candidate {
                        reference,
                        url: format!("{}/{}/{}", base, subdir, filename),
                        filename: filename.clone(),
                        depends: record
                            .depends
                            .iter()
                            .map(|d| dependency_name(d).to_string())
                            .collect(),
                        sha256: record.sha256.clone(),
                        build_number: record.build_number,
                        timestamp: record.timestamp.unwrap_or(0),
                    });
                }
            }
            if !candidates.is_empty() {
                // Earlier channels take priority over later ones
                break;
            }
        }

        sort_candidates(&mut candidates);
        Ok(candidates)
    }
}
