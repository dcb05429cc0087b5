// src/artifact.rs

//! Artifact identities
//!
//! An [`ArtifactReference`] names one concrete source package and is the
//! node identity of the dependency graph. An [`ArtifactSpec`] is what a user
//! or a dependency declaration asks for before the index pins it down.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Source archive extensions, longest first so `.tar.bz2` wins over `.tar`
const ARCHIVE_EXTENSIONS: &[&str] = &[".tar.bz2", ".tar.gz", ".conda", ".tar", ".zip"];

/// One concrete source package
///
/// Equality and hashing go through [`ArtifactReference::canonical`], so two
/// references describing the same package compare equal however they were
/// built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactReference {
    /// Channel name or URL; empty for local archives
    pub channel: String,
    /// Platform subdir (`linux-64`, `noarch`, ...)
    pub subdir: String,
    pub name: String,
    pub version: String,
    /// Conda build string (`py311h1234_0`)
    pub build: String,
}

impl ArtifactReference {
    pub fn new(
        channel: impl Into<String>,
        subdir: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        build: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            subdir: subdir.into(),
            name: name.into(),
            version: version.into(),
            build: build.into(),
        }
    }

    /// Parse a reference from an archive filename (`name-version-build.ext`)
    pub fn from_filename(channel: &str, subdir: &str, filename: &str) -> Result<Self> {
        let stem = strip_archive_extension(filename);
        let mut parts = stem.rsplitn(3, '-');
        let build = parts.next();
        let version = parts.next();
        let name = parts.next();

        match (name, version, build) {
            (Some(name), Some(version), Some(build)) if !name.is_empty() => {
                Ok(Self::new(channel, subdir, name, version, build))
            }
            _ => Err(Error::ArtifactNotFound(format!(
                "Cannot derive package identity from filename '{}'",
                filename
            ))),
        }
    }

    /// `name-version-build`
    pub fn dist_name(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.build)
    }

    /// Canonical key: `channel/subdir/name-version-build`
    pub fn canonical(&self) -> String {
        let channel = self.channel.trim_end_matches('/');
        if channel.is_empty() {
            format!("{}/{}", self.subdir, self.dist_name())
        } else {
            format!("{}/{}/{}", channel, self.subdir, self.dist_name())
        }
    }
}

impl PartialEq for ArtifactReference {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for ArtifactReference {}

impl Hash for ArtifactReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// A request for a package before the index pins it down
///
/// Accepted forms: `name`, `name=version`, `name=version=build`, each
/// optionally prefixed by `channel::` and/or `subdir/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub channel: Option<String>,
    pub subdir: Option<String>,
    pub name: String,
    pub version: Option<String>,
    pub build: Option<String>,
}

impl ArtifactSpec {
    /// Spec matching any version of `name`
    pub fn name_only(name: impl Into<String>) -> Self {
        Self {
            channel: None,
            subdir: None,
            name: name.into(),
            version: None,
            build: None,
        }
    }

    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let (channel, rest) = match spec.split_once("::") {
            Some((c, r)) => (Some(c.to_string()), r),
            None => (None, spec),
        };
        let (subdir, rest) = match rest.split_once('/') {
            Some((s, r)) => (Some(s.to_string()), r),
            None => (None, rest),
        };

        let mut parts = rest.split('=').filter(|p| !p.is_empty());
        let name = parts
            .next()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::ArtifactNotFound(format!("Empty package spec '{}'", spec)))?;
        let version = parts.next().map(|v| v.trim().to_string());
        let build = parts.next().map(|b| b.trim().to_string());

        Ok(Self {
            channel,
            subdir,
            name: name.to_string(),
            version,
            build,
        })
    }

    /// Whether a candidate's version and build satisfy this spec
    ///
    /// Versions and builds compare exactly, or by prefix when the spec ends
    /// in `*`.
    pub fn matches(&self, version: &str, build: &str) -> bool {
        fn field_matches(pattern: Option<&String>, value: &str) -> bool {
            match pattern {
                None => true,
                Some(p) => match p.strip_suffix('*') {
                    Some(prefix) => value.starts_with(prefix.trim_end_matches('.')),
                    None => p == value,
                },
            }
        }

        field_matches(self.version.as_ref(), version) && field_matches(self.build.as_ref(), build)
    }
}

impl fmt::Display for ArtifactSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(channel) = &self.channel {
            write!(f, "{}::", channel)?;
        }
        if let Some(subdir) = &self.subdir {
            write!(f, "{}/", subdir)?;
        }
        f.write_str(&self.name)?;
        if let Some(version) = &self.version {
            write!(f, "={}", version)?;
        }
        if let Some(build) = &self.build {
            write!(f, "={}", build)?;
        }
        Ok(())
    }
}

/// Package name of a conda dependency declaration
///
/// `"numpy >=1.21,<2.0a0"` and `"numpy==1.21"` both yield `"numpy"`.
pub fn dependency_name(declaration: &str) -> &str {
    let declaration = declaration.trim();
    let end = declaration
        .find(|c: char| c.is_whitespace() || matches!(c, '=' | '<' | '>' | '!' | '~' | '['))
        .unwrap_or(declaration.len());
    &declaration[..end]
}

/// Strip a known source archive extension from a filename
pub fn strip_archive_extension(filename: &str) -> &str {
    ARCHIVE_EXTENSIONS
        .iter()
        .find_map(|ext| filename.strip_suffix(ext))
        .unwrap_or(filename)
}
