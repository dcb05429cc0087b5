// src/wheel/mod.rs

//! Wheel naming, tags, metadata and the converted artifact handle
//!
//! # Naming
//!
//! A wheel is named `{dist}-{version}[-{build}]-{python}-{abi}-{platform}.whl`
//! where `dist` is the normalized distribution name and `build` the conda
//! build number when it is not zero.
//!
//! # Tags
//!
//! | Source package                | Tags                       |
//! |-------------------------------|----------------------------|
//! | `noarch`                      | `py3-none-any`             |
//! | platform build using Python   | `cpXY-cpXY-<platform>`     |
//! | platform build without Python | `py3-none-<platform>`      |

pub mod reader;
pub mod writer;

pub use reader::{WheelEntry, read_wheel};
pub use writer::{write_entries, write_wheel};

use crate::artifact::ArtifactReference;
use crate::config::{NOARCH_SUBDIR, PythonVersion};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use tracing::debug;

/// Conda subdir to wheel platform tag
const PLATFORM_TAGS: &[(&str, &str)] = &[
    ("linux-64", "linux_x86_64"),
    ("linux-32", "linux_i686"),
    ("linux-aarch64", "linux_aarch64"),
    ("linux-ppc64le", "linux_ppc64le"),
    ("linux-s390x", "linux_s390x"),
    ("linux-armv7l", "linux_armv7l"),
    ("osx-64", "macosx_10_9_x86_64"),
    ("osx-arm64", "macosx_11_0_arm64"),
    ("win-64", "win_amd64"),
    ("win-32", "win32"),
    ("win-arm64", "win_arm64"),
    ("noarch", "any"),
];

/// Wheel platform tag for a conda subdir
///
/// ```
/// use condawheel::wheel::platform_tag;
///
/// assert_eq!(platform_tag("linux-64"), "linux_x86_64");
/// assert_eq!(platform_tag("osx-arm64"), "macosx_11_0_arm64");
/// assert_eq!(platform_tag(""), "any");
/// assert_eq!(platform_tag("zos-z"), "zos_z");
/// ```
pub fn platform_tag(subdir: &str) -> String {
    if subdir.is_empty() {
        return "any".to_string();
    }
    PLATFORM_TAGS
        .iter()
        .find(|(s, _)| *s == subdir)
        .map(|(_, tag)| tag.to_string())
        .unwrap_or_else(|| subdir.replace(['-', '.'], "_"))
}

/// Normalized distribution name for filenames and `.dist-info` directories
///
/// Runs of `-`, `_` and `.` collapse to one `_`; the result is lowercase.
pub fn distribution_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                out.push('_');
            }
            in_separator = true;
        } else {
            out.push(c.to_ascii_lowercase());
            in_separator = false;
        }
    }
    out
}

/// Version as it may appear in a wheel filename
pub fn escape_version(version: &str) -> String {
    version.replace('-', "_")
}

/// Interpreter, ABI and platform tags
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WheelTags {
    pub python: String,
    pub abi: String,
    pub platform: String,
}

impl WheelTags {
    pub fn universal() -> Self {
        Self {
            python: "py3".to_string(),
            abi: "none".to_string(),
            platform: "any".to_string(),
        }
    }

    /// Tags for a package built for `subdir`
    ///
    /// `uses_python` says whether the package links against a specific
    /// interpreter (declares `python` as a run dependency).
    pub fn for_package(subdir: &str, noarch: bool, uses_python: bool, python: PythonVersion) -> Self {
        if noarch || subdir == NOARCH_SUBDIR {
            return Self::universal();
        }
        let platform = platform_tag(subdir);
        if uses_python {
            Self {
                python: python.cpython_tag(),
                abi: python.cpython_tag(),
                platform,
            }
        } else {
            Self {
                python: "py3".to_string(),
                abi: "none".to_string(),
                platform,
            }
        }
    }
}

impl fmt::Display for WheelTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.python, self.abi, self.platform)
    }
}

/// Directory names derived from a distribution name and version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelNames {
    pub dist: String,
    pub version: String,
}

impl WheelNames {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            dist: distribution_name(name),
            version: escape_version(version),
        }
    }

    /// `{dist}-{version}.dist-info`
    pub fn dist_info(&self) -> String {
        format!("{}-{}.dist-info", self.dist, self.version)
    }

    /// `{dist}-{version}.data`
    pub fn data_dir(&self) -> String {
        format!("{}-{}.data", self.dist, self.version)
    }
}

/// Metadata written into a wheel's `.dist-info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelMetadata {
    /// Distribution name as declared
    pub name: String,
    pub version: String,
    /// Conda build number, used as the wheel build tag when non-zero
    pub build_number: u64,
    pub summary: Option<String>,
    pub license: Option<String>,
    pub home: Option<String>,
    /// `Requires-Dist` entries, sorted
    pub requires: Vec<String>,
    /// Console scripts: name → `module:function`
    pub entry_points: BTreeMap<String, String>,
    pub tags: WheelTags,
}

impl WheelMetadata {
    pub fn names(&self) -> WheelNames {
        WheelNames::new(&self.name, &self.version)
    }

    /// `{dist}-{version}[-{build}]-{tags}.whl`
    pub fn filename(&self) -> String {
        let names = self.names();
        if self.build_number > 0 {
            format!(
                "{}-{}-{}-{}.whl",
                names.dist, names.version, self.build_number, self.tags
            )
        } else {
            format!("{}-{}-{}.whl", names.dist, names.version, self.tags)
        }
    }

    /// Contents of `METADATA`
    pub fn metadata_file(&self) -> String {
        let mut out = String::new();
        out.push_str("Metadata-Version: 2.1\n");
        out.push_str(&format!("Name: {}\n", self.name));
        out.push_str(&format!("Version: {}\n", self.version));
        if let Some(summary) = &self.summary {
            // Header values are single-line
            out.push_str(&format!("Summary: {}\n", summary.lines().next().unwrap_or("")));
        }
        if let Some(home) = &self.home {
            out.push_str(&format!("Home-page: {}\n", home));
        }
        if let Some(license) = &self.license {
            out.push_str(&format!("License: {}\n", license));
        }
        for requirement in &self.requires {
            out.push_str(&format!("Requires-Dist: {}\n", requirement));
        }
        out
    }

    /// Contents of `WHEEL`
    pub fn wheel_file(&self) -> String {
        let mut out = String::new();
        out.push_str("Wheel-Version: 1.0\n");
        out.push_str(concat!("Generator: condawheel ", env!("CARGO_PKG_VERSION"), "\n"));
        out.push_str(&format!(
            "Root-Is-Purelib: {}\n",
            self.tags.platform == "any"
        ));
        out.push_str(&format!("Tag: {}\n", self.tags));
        if self.build_number > 0 {
            out.push_str(&format!("Build: {}\n", self.build_number));
        }
        out
    }

    /// Contents of `entry_points.txt`, if any entry points are declared
    pub fn entry_points_file(&self) -> Option<String> {
        if self.entry_points.is_empty() {
            return None;
        }
        let mut out = String::from("[console_scripts]\n");
        for (name, target) in &self.entry_points {
            out.push_str(&format!("{} = {}\n", name, target));
        }
        Some(out)
    }
}

/// One produced wheel
///
/// Owns the wheel file and, when the wheel was written to scratch space, the
/// scratch directory. [`ConvertedArtifact::release`] removes both and may be
/// called any number of times.
#[derive(Debug)]
pub struct ConvertedArtifact {
    pub reference: ArtifactReference,
    pub metadata: WheelMetadata,
    /// Translated dependency names in declaration order
    pub dependencies: Vec<String>,
    path: PathBuf,
    scratch: Mutex<Option<TempDir>>,
    released: AtomicBool,
}

impl ConvertedArtifact {
    pub fn new(
        reference: ArtifactReference,
        metadata: WheelMetadata,
        dependencies: Vec<String>,
        path: PathBuf,
        scratch: Option<TempDir>,
    ) -> Self {
        Self {
            reference,
            metadata,
            dependencies,
            path,
            scratch: Mutex::new(scratch),
            released: AtomicBool::new(false),
        }
    }

    /// Path of the wheel file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filename(&self) -> String {
        self.metadata.filename()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Delete the wheel and its scratch directory
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Releasing {}", self.path.display());
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(scratch) = self.scratch.lock().take() {
            scratch.close()?;
        }
        Ok(())
    }
}
