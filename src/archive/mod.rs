// src/archive/mod.rs

//! Source archive reading
//!
//! Opens a conda package (an unpacked directory, `.tar`, `.tar.gz`,
//! `.tar.bz2`, `.zip` or `.conda`) and normalises it into one
//! [`ArtifactInfo`]: package metadata plus a manifest that tags every file
//! with a [`FileRole`]. Roles are assigned here once and never reinterpreted
//! downstream.

mod metadata;
mod reader;

pub use metadata::{PackageMetadata, parse_entry_point};
pub use reader::{open_archive, read_manifest};

use crate::artifact::ArtifactReference;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Package metadata file every conda archive carries
pub const INDEX_JSON: &str = "info/index.json";

/// Supported source archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// An already unpacked package directory
    Directory,
    /// Uncompressed tar
    Tar,
    /// Gzip compressed tar (.tar.gz, .tgz)
    TarGz,
    /// Bzip2 compressed tar (.tar.bz2), the classic conda format
    TarBz2,
    /// Plain zip
    Zip,
    /// Zip wrapper holding zstd compressed `info-` and `pkg-` tarballs
    Conda,
}

impl ArchiveFormat {
    /// Detect the format of `path` from its extension
    pub fn from_extension(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz2") {
            Some(Self::TarBz2)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else if lower.ends_with(".conda") {
            Some(Self::Conda)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }

    /// Detect the format from the first bytes of the file
    ///
    /// Magic bytes:
    /// - Gzip: `1f 8b`
    /// - Bzip2: `BZh`
    /// - Zip: `PK 03 04`
    /// - Tar: `ustar` at offset 257
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0x1f, 0x8b]) {
            Some(Self::TarGz)
        } else if data.starts_with(b"BZh") {
            Some(Self::TarBz2)
        } else if data.starts_with(b"PK\x03\x04") {
            Some(Self::Zip)
        } else if data.len() >= 262 && &data[257..262] == b"ustar" {
            Some(Self::Tar)
        } else {
            None
        }
    }

    /// Detect the format of a path on disk
    ///
    /// Directories are recognised first, then the extension, then the file
    /// signature. A known extension whose signature disagrees is rejected.
    pub fn detect(path: &Path) -> Result<Self> {
        if path.is_dir() {
            return Ok(Self::Directory);
        }

        let display = path.display().to_string();
        let mut file = File::open(path)
            .map_err(|e| Error::UnsupportedArchiveFormat(format!("{}: {}", display, e)))?;
        let mut header = Vec::with_capacity(512);
        file.by_ref()
            .take(512)
            .read_to_end(&mut header)
            .map_err(|e| Error::UnsupportedArchiveFormat(format!("{}: {}", display, e)))?;

        let by_magic = Self::from_magic_bytes(&header);
        match (Self::from_extension(&display), by_magic) {
            (Some(Self::Conda), Some(Self::Zip)) => Ok(Self::Conda),
            (Some(ext), Some(magic)) if ext == magic => Ok(ext),
            // Tar has no magic in old v7 headers
            (Some(Self::Tar), None) => Ok(Self::Tar),
            (Some(ext), Some(magic)) => Err(Error::UnsupportedArchiveFormat(format!(
                "{}: extension says {} but contents look like {}",
                display,
                ext.name(),
                magic.name()
            ))),
            (None, Some(magic)) => Ok(magic),
            (_, None) => Err(Error::UnsupportedArchiveFormat(display)),
        }
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarBz2 => "tar.bz2",
            Self::Zip => "zip",
            Self::Conda => "conda",
        }
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Role of a file in the source layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileRole {
    /// Shared library or native extension module
    Library,
    /// Executable script or program under `bin/`
    Script,
    /// Anything else shipped with the package
    Data,
    /// Package metadata under `info/`
    Metadata,
}

impl FileRole {
    /// Assign a role from a `/`-separated layout path
    pub fn classify(path: &str) -> Self {
        if path.starts_with("info/") {
            return Self::Metadata;
        }
        if ["bin/", "Scripts/", "python-scripts/"]
            .iter()
            .any(|prefix| path.starts_with(prefix))
        {
            return Self::Script;
        }
        let file_name = path.rsplit('/').next().unwrap_or(path);
        if is_library_name(file_name) {
            return Self::Library;
        }
        Self::Data
    }
}

/// Whether a file name looks like a shared library
fn is_library_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".so")
        || lower.contains(".so.")
        || lower.ends_with(".dylib")
        || lower.ends_with(".dll")
        || lower.ends_with(".pyd")
}

/// What a manifest entry is on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    /// Symbolic link with its raw target
    Symlink { target: String },
}

/// One file of the source layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub role: FileRole,
    /// POSIX permission bits (`0o7777` mask)
    pub mode: u32,
    pub kind: EntryKind,
    /// Size in bytes of the file, or of the link's target
    pub size: u64,
}

impl ManifestEntry {
    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink { .. })
    }
}

/// Layout path (`/`-separated, relative) to entry, ordered by path
pub type Manifest = BTreeMap<String, ManifestEntry>;

/// Parsed description of one source archive
#[derive(Debug, Clone)]
pub struct ArtifactInfo {
    pub name: String,
    pub version: String,
    pub build: String,
    pub build_number: u64,
    /// Platform subdir the package was built for
    pub subdir: String,
    /// `noarch` kind (`python` or `generic`) for platform independent packages
    pub noarch: Option<String>,
    /// Run-time dependency names in declaration order, untranslated
    pub run_depends: Vec<String>,
    /// Build and host dependency names from the rendered recipe
    pub build_depends: Vec<String>,
    /// License file layout paths
    pub license_files: Vec<String>,
    /// Console scripts: name → `module:function`
    pub entry_points: BTreeMap<String, String>,
    pub summary: Option<String>,
    pub license: Option<String>,
    pub home: Option<String>,
    pub manifest: Manifest,
}

impl ArtifactInfo {
    /// Reference for this package as found on `channel`
    pub fn reference(&self, channel: &str) -> ArtifactReference {
        ArtifactReference::new(channel, &self.subdir, &self.name, &self.version, &self.build)
    }

    pub fn is_noarch(&self) -> bool {
        self.noarch.is_some() || self.subdir == crate::config::NOARCH_SUBDIR
    }

    /// Manifest entries with the given role
    pub fn files_with_role(&self, role: FileRole) -> impl Iterator<Item = (&String, &ManifestEntry)> {
        self.manifest.iter().filter(move |(_, e)| e.role == role)
    }
}

/// An opened source archive and its working directory
///
/// Dropping this removes the extraction directory. Directory sources are
/// read in place and never modified.
#[derive(Debug)]
pub struct ExtractedArtifact {
    pub info: ArtifactInfo,
    pub format: ArchiveFormat,
    root: PathBuf,
    workdir: Option<TempDir>,
}

impl ExtractedArtifact {
    pub(crate) fn new(
        info: ArtifactInfo,
        format: ArchiveFormat,
        root: PathBuf,
        workdir: Option<TempDir>,
    ) -> Self {
        Self {
            info,
            format,
            root,
            workdir,
        }
    }

    /// Root of the unpacked package
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a layout path
    pub fn path_of(&self, layout_path: &str) -> PathBuf {
        self.root.join(layout_path)
    }

    /// Remove the extraction directory now instead of on drop
    pub fn release(mut self) -> Result<()> {
        if let Some(dir) = self.workdir.take() {
            dir.close()?;
        }
        Ok(())
    }
}
