// src/index/mod.rs

//! Package index and download collaborators
//!
//! The resolver only sees two traits:
//! - [`PackageIndex`] turns a spec into candidate packages
//! - [`ArtifactFetcher`] turns a candidate into a local archive path
//!
//! [`RepodataIndex`] and [`CachedFetcher`] are the production
//! implementations, backed by conda channel `repodata.json` files and a
//! content-addressed download cache.

mod client;
mod fetch;
mod repodata;

pub use client::{ChannelClient, HTTP_TIMEOUT};
pub use fetch::CachedFetcher;
pub use repodata::{RepodataIndex, channel_url};

use crate::artifact::{ArtifactReference, ArtifactSpec};
use crate::config::{NOARCH_SUBDIR, PythonVersion};
use crate::error::Result;
use regex::Regex;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::debug;

/// Python version token in a build string, e.g. `py311` in `np121py311h0_0`
static PYTHON_BUILD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"py\d+").expect("python build pattern is valid"));

/// A downloadable package advertised by an index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub reference: ArtifactReference,
    /// Download location: `http(s)://`, `file://` or a plain local path
    pub url: String,
    /// Archive filename, the cache key
    pub filename: String,
    /// Advertised dependency names
    pub depends: Vec<String>,
    /// Advertised sha256 (hex)
    pub sha256: Option<String>,
    pub build_number: u64,
    /// Upload time in milliseconds, 0 when unknown
    pub timestamp: u64,
}

/// Index query collaborator
pub trait PackageIndex: Send + Sync {
    /// Candidates matching `spec` on the given subdirs, oldest first
    fn find(&self, spec: &ArtifactSpec, subdirs: &[String]) -> Result<Vec<Candidate>>;
}

/// Download collaborator
pub trait ArtifactFetcher: Send + Sync {
    /// Local path of the candidate's archive; idempotent
    fn fetch(&self, candidate: &Candidate) -> Result<PathBuf>;
}

/// Pick the candidate to convert from a list ordered oldest first
///
/// Platform builds tagged for a Python version (`py311h...`) are only
/// eligible when they match `python`. The newest eligible one wins.
pub fn select_candidate(candidates: &[Candidate], python: PythonVersion) -> Option<&Candidate> {
    let pytag = python.build_tag();
    candidates.iter().rev().find(|c| {
        if c.reference.subdir == NOARCH_SUBDIR {
            return true;
        }
        let mut tags = PYTHON_BUILD.find_iter(&c.reference.build).peekable();
        tags.peek().is_none() || tags.any(|tag| tag.as_str() == pytag)
    })
}

/// Query subdirs one at a time, in order, and select from the first that
/// has an eligible candidate
pub fn locate(
    index: &dyn PackageIndex,
    spec: &ArtifactSpec,
    subdirs: &[String],
    python: PythonVersion,
) -> Result<Option<Candidate>> {
    let subdirs: Vec<String> = match &spec.subdir {
        Some(subdir) => vec![subdir.clone()],
        None => subdirs.to_vec(),
    };

    for subdir in &subdirs {
        let candidates = index.find(spec, std::slice::from_ref(subdir))?;
        if let Some(candidate) = select_candidate(&candidates, python) {
            debug!("Selected {} for '{}'", candidate.reference, spec);
            return Ok(Some(candidate.clone()));
        }
    }
    Ok(None)
}

/// Order candidates oldest first: timestamp, then version, then build number
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| compare_versions(&a.reference.version, &b.reference.version))
            .then_with(|| a.build_number.cmp(&b.build_number))
            .then_with(|| a.filename.cmp(&b.filename))
    });
}

/// Compare dotted version strings, numeric segments numerically
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| -> Vec<String> {
        v.split(['.', '_', '-', '+'])
            .map(|s| s.to_ascii_lowercase())
            .collect()
    };
    let (a, b) = (split(a), split(b));

    for (x, y) in a.iter().zip(b.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}
