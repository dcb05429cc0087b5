// src/config.rs

//! Conversion configuration
//!
//! A [`ResolutionConfig`] is built once per invocation and then only read.
//! Configuration files and command-line flags are folded into it by a single
//! call to [`ResolutionConfig::merge`] before any resolution starts.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Channels always searched after the configured ones
pub const DEFAULT_CHANNELS: &[&str] = &["conda-forge", "anaconda", "main", "r"];

/// Platform-independent subdir, always searched last
pub const NOARCH_SUBDIR: &str = "noarch";

/// Section names unwrapped when found at the top of a config file
const CONFIG_SECTIONS: &[&str] = &["condawheel", "conda_press"];

/// Interpreter version the produced wheels target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PythonVersion {
    pub major: u8,
    pub minor: u8,
}

impl PythonVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Conda build-string tag, e.g. `py311`
    pub fn build_tag(&self) -> String {
        format!("py{}{}", self.major, self.minor)
    }

    /// Wheel interpreter tag, e.g. `cp311`
    pub fn cpython_tag(&self) -> String {
        format!("cp{}{}", self.major, self.minor)
    }

    /// Directory name under `lib/`, e.g. `python3.11`
    pub fn lib_dir(&self) -> String {
        format!("python{}.{}", self.major, self.minor)
    }
}

impl Default for PythonVersion {
    fn default() -> Self {
        Self::new(3, 12)
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for PythonVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::ConfigError(format!("Invalid python version: {}", s));
        let mut parts = s.trim().split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        Ok(Self::new(major, minor))
    }
}

impl Serialize for PythonVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PythonVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // An unquoted `3.10` arrives as the float 3.1; its digits are gone
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(f64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Number(n) => Err(serde::de::Error::custom(format!(
                "python_version {} must be quoted, e.g. \"3.10\"",
                n
            ))),
        }
    }
}

/// What to do with a dependency name that was not verified against the
/// target index while `only_pypi` is off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnverifiedNamePolicy {
    /// Keep the name unchanged
    #[default]
    PassThrough,
    /// Check the name anyway and fail the artifact if it is absent
    Reject,
}

/// Immutable parameters for one conversion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Platform subdirs to search, in order (`noarch` is implied)
    pub subdirs: Vec<String>,
    /// Channels to search, in order (system defaults are implied)
    pub channels: Vec<String>,
    /// Directory for produced wheels; a scratch directory when unset
    pub output: Option<PathBuf>,
    /// Dependency names never emitted
    pub exclude_deps: BTreeSet<String>,
    /// Dependency names added to the root artifact
    pub add_deps: BTreeSet<String>,
    /// Drop the `python` runtime dependency
    pub skip_python: bool,
    /// Strip debug symbols from native objects
    pub strip_symbols: bool,
    /// Merge the resolved tree into one wheel
    pub fatten: bool,
    /// Merge several root archives into one wheel
    pub merge: bool,
    /// Only keep dependency names verified to exist in the target index
    pub only_pypi: bool,
    /// Declare runtime requirements and ship conda test files
    pub include_requirements: bool,
    /// Target interpreter version
    pub python_version: PythonVersion,
    /// Worker pool size for sibling conversions
    pub jobs: usize,
    /// Timeout applied to index queries and downloads
    pub fetch_timeout_secs: u64,
    /// Content-addressed cache for downloaded source archives
    pub cache_dir: PathBuf,
    /// Handling of names not checked against the target index
    pub unverified_names: UnverifiedNamePolicy,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            subdirs: vec![host_subdir().to_string()],
            channels: Vec::new(),
            output: None,
            exclude_deps: BTreeSet::new(),
            add_deps: BTreeSet::new(),
            skip_python: false,
            strip_symbols: true,
            fatten: false,
            merge: false,
            only_pypi: false,
            include_requirements: true,
            python_version: PythonVersion::default(),
            jobs: num_cpus(),
            fetch_timeout_secs: 30,
            cache_dir: std::env::temp_dir().join("artifact-cache"),
            unverified_names: UnverifiedNamePolicy::PassThrough,
        }
    }
}

impl ResolutionConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Configured subdirs followed by `noarch`
    pub fn all_subdirs(&self) -> Vec<String> {
        let mut subdirs: Vec<String> = Vec::with_capacity(self.subdirs.len() + 1);
        for subdir in self.subdirs.iter().map(String::as_str).chain([NOARCH_SUBDIR]) {
            if !subdirs.iter().any(|s| s == subdir) {
                subdirs.push(subdir.to_string());
            }
        }
        subdirs
    }

    /// Configured channels followed by the system defaults
    pub fn all_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = Vec::with_capacity(self.channels.len() + DEFAULT_CHANNELS.len());
        for channel in self
            .channels
            .iter()
            .cloned()
            .chain(DEFAULT_CHANNELS.iter().map(|c| c.to_string()))
        {
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        channels
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn with_subdirs<I, S>(mut self, subdirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subdirs = subdirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_exclude_deps<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_deps = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_add_deps<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_deps = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skip_python(mut self, skip: bool) -> Self {
        self.skip_python = skip;
        self
    }

    pub fn with_strip_symbols(mut self, strip: bool) -> Self {
        self.strip_symbols = strip;
        self
    }

    pub fn with_fatten(mut self, fatten: bool) -> Self {
        self.fatten = fatten;
        self
    }

    pub fn with_merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_only_pypi(mut self, only: bool) -> Self {
        self.only_pypi = only;
        self
    }

    pub fn with_include_requirements(mut self, include: bool) -> Self {
        self.include_requirements = include;
        self
    }

    pub fn with_python_version(mut self, version: PythonVersion) -> Self {
        self.python_version = version;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_unverified_names(mut self, policy: UnverifiedNamePolicy) -> Self {
        self.unverified_names = policy;
        self
    }

    /// Fold a config file and command-line overrides into one value
    ///
    /// Precedence: `overrides` > `file` > defaults.
    pub fn merge(file: Option<ConfigFile>, overrides: ConfigFile) -> Self {
        let defaults = Self::default();
        let file = file.unwrap_or_default();

        macro_rules! pick {
            ($field:ident) => {
                overrides.$field.clone().or_else(|| file.$field.clone())
            };
        }

        Self {
            subdirs: pick!(subdir).map(OneOrMany::into_vec).unwrap_or(defaults.subdirs),
            channels: pick!(channels).map(OneOrMany::into_vec).unwrap_or(defaults.channels),
            output: pick!(output).or(defaults.output),
            exclude_deps: pick!(exclude_deps)
                .map(OneOrMany::into_set)
                .unwrap_or(defaults.exclude_deps),
            add_deps: pick!(add_deps).map(OneOrMany::into_set).unwrap_or(defaults.add_deps),
            skip_python: pick!(skip_python).unwrap_or(defaults.skip_python),
            strip_symbols: pick!(strip_symbols).unwrap_or(defaults.strip_symbols),
            fatten: pick!(fatten).unwrap_or(defaults.fatten),
            merge: pick!(merge).unwrap_or(defaults.merge),
            only_pypi: pick!(only_pypi).unwrap_or(defaults.only_pypi),
            include_requirements: pick!(include_requirements)
                .unwrap_or(defaults.include_requirements),
            python_version: pick!(python_version).unwrap_or(defaults.python_version),
            jobs: pick!(jobs).map(|j| j.max(1)).unwrap_or(defaults.jobs),
            fetch_timeout_secs: pick!(fetch_timeout_secs).unwrap_or(defaults.fetch_timeout_secs),
            cache_dir: pick!(cache_dir).unwrap_or(defaults.cache_dir),
            unverified_names: pick!(unverified_names).unwrap_or(defaults.unverified_names),
        }
    }
}

/// A string or a list of strings, as accepted in config files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }

    pub fn into_set(self) -> BTreeSet<String> {
        self.into_vec().into_iter().collect()
    }
}

impl From<Vec<String>> for OneOrMany {
    fn from(v: Vec<String>) -> Self {
        Self::Many(v)
    }
}

/// Partial configuration, as read from a file or collected from flags
///
/// Every field is optional; absent fields fall through to the next layer
/// in [`ResolutionConfig::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub subdir: Option<OneOrMany>,
    pub channels: Option<OneOrMany>,
    pub output: Option<PathBuf>,
    pub exclude_deps: Option<OneOrMany>,
    pub add_deps: Option<OneOrMany>,
    pub skip_python: Option<bool>,
    pub strip_symbols: Option<bool>,
    pub fatten: Option<bool>,
    pub merge: Option<bool>,
    pub only_pypi: Option<bool>,
    pub include_requirements: Option<bool>,
    pub python_version: Option<PythonVersion>,
    pub jobs: Option<usize>,
    pub fetch_timeout_secs: Option<u64>,
    pub cache_dir: Option<PathBuf>,
    pub unverified_names: Option<UnverifiedNamePolicy>,
}

impl ConfigFile {
    /// Load a config file; `.toml` files are read as TOML, anything else as YAML
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let is_toml = path.extension().and_then(|e| e.to_str()) == Some("toml");
        if is_toml {
            Self::from_toml(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    /// Parse YAML content, unwrapping a tool section when present
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigError(format!("Invalid YAML config: {}", e)))?;

        if value.is_null() {
            return Ok(Self::default());
        }

        for section in CONFIG_SECTIONS {
            if let Some(inner) = value.get(*section) {
                value = inner.clone();
                break;
            }
        }

        serde_yaml::from_value(value)
            .map_err(|e| Error::ConfigError(format!("Invalid YAML config: {}", e)))
    }

    /// Parse TOML content, unwrapping a tool section when present
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut value: toml::Value = toml::from_str(content)
            .map_err(|e| Error::ConfigError(format!("Invalid TOML config: {}", e)))?;

        for section in CONFIG_SECTIONS {
            if let Some(inner) = value.get(*section) {
                value = inner.clone();
                break;
            }
        }

        value
            .try_into::<Self>()
            .map_err(|e| Error::ConfigError(format!("Invalid TOML config: {}", e)))
    }
}

/// Conda subdir of the machine running the conversion
pub fn host_subdir() -> &'static str {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "x86_64") => "linux-64",
        ("linux", "aarch64") => "linux-aarch64",
        ("linux", "powerpc64") => "linux-ppc64le",
        ("linux", "x86") => "linux-32",
        ("macos", "x86_64") => "osx-64",
        ("macos", "aarch64") => "osx-arm64",
        ("windows", "x86_64") => "win-64",
        ("windows", "x86") => "win-32",
        ("windows", "aarch64") => "win-arm64",
        _ => NOARCH_SUBDIR,
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_subdirs_appends_noarch() {
        let config = ResolutionConfig::new().with_subdirs(["linux-64"]);
        assert_eq!(config.all_subdirs(), vec!["linux-64", "noarch"]);

        let config = ResolutionConfig::new().with_subdirs(["noarch", "linux-64"]);
        assert_eq!(config.all_subdirs(), vec!["noarch", "linux-64"]);
    }

    #[test]
    fn test_all_channels_appends_defaults() {
        let config = ResolutionConfig::new().with_channels(["FOO-CHANNEL", "conda-forge"]);
        assert_eq!(
            config.all_channels(),
            vec!["FOO-CHANNEL", "conda-forge", "anaconda", "main", "r"]
        );
    }

    #[test]
    fn test_defaults() {
        let config = ResolutionConfig::default();
        assert!(config.strip_symbols);
        assert!(config.include_requirements);
        assert!(!config.fatten);
        assert!(!config.skip_python);
        assert!(!config.only_pypi);
        assert!(config.jobs > 0);
        assert_eq!(config.unverified_names, UnverifiedNamePolicy::PassThrough);
    }

    #[test]
    fn test_python_version_parse_and_tags() {
        let v: PythonVersion = "3.11".parse().unwrap();
        assert_eq!(v, PythonVersion::new(3, 11));
        assert_eq!(v.build_tag(), "py311");
        assert_eq!(v.cpython_tag(), "cp311");
        assert_eq!(v.lib_dir(), "python3.11");
        assert!("three".parse::<PythonVersion>().is_err());
    }

    #[test]
    fn test_yaml_fields() {
        let yaml = r#"
conda_press:
  subdir: linux-64
  output: /tmp/out
  channels: FOO-CHANNEL
  fatten: true
  skip_python: true
  strip_symbols: false
  merge: true
  exclude_deps: [EXCLUDE1, EXCLUDE2]
  add_deps: ADD1
  only_pypi: true
  include_requirements: false
  python_version: "3.11"
"#;
        let file = ConfigFile::from_yaml(yaml).unwrap();
        let config = ResolutionConfig::merge(Some(file), ConfigFile::default());

        assert_eq!(config.all_subdirs(), vec!["linux-64", "noarch"]);
        assert_eq!(config.output, Some(PathBuf::from("/tmp/out")));
        assert_eq!(config.channels, vec!["FOO-CHANNEL"]);
        assert!(config.fatten);
        assert!(config.skip_python);
        assert!(!config.strip_symbols);
        assert!(config.merge);
        assert_eq!(
            config.exclude_deps,
            BTreeSet::from(["EXCLUDE1".to_string(), "EXCLUDE2".to_string()])
        );
        assert_eq!(config.add_deps, BTreeSet::from(["ADD1".to_string()]));
        assert!(config.only_pypi);
        assert!(!config.include_requirements);
        assert_eq!(config.python_version, PythonVersion::new(3, 11));
    }

    #[test]
    fn test_yaml_quoted_python_version() {
        let file = ConfigFile::from_yaml("python_version: \"3.10\"\n").unwrap();
        assert_eq!(file.python_version, Some(PythonVersion::new(3, 10)));
    }

    #[test]
    fn test_yaml_unquoted_python_version() {
        let err = ConfigFile::from_yaml("python_version: 3.10\n").unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
        assert!(err.to_string().contains("must be quoted"));

        assert!(ConfigFile::from_toml("python_version = 3.10\n").is_err());
        assert_eq!(
            ConfigFile::from_toml("python_version = \"3.10\"\n").unwrap().python_version,
            Some(PythonVersion::new(3, 10))
        );
    }

    #[test]
    fn test_yaml_empty_document() {
        assert_eq!(ConfigFile::from_yaml("").unwrap(), ConfigFile::default());
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        assert!(ConfigFile::from_yaml("no_such_flag: true\n").is_err());
    }

    #[test]
    fn test_toml_section() {
        let toml = r#"
[condawheel]
subdir = ["osx-64"]
add_deps = ["six"]
jobs = 2
"#;
        let file = ConfigFile::from_toml(toml).unwrap();
        let config = ResolutionConfig::merge(Some(file), ConfigFile::default());
        assert_eq!(config.subdirs, vec!["osx-64"]);
        assert_eq!(config.add_deps, BTreeSet::from(["six".to_string()]));
        assert_eq!(config.jobs, 2);
    }

    #[test]
    fn test_merge_precedence() {
        let file = ConfigFile {
            fatten: Some(true),
            skip_python: Some(true),
            channels: Some(OneOrMany::One("from-file".into())),
            ..Default::default()
        };
        let overrides = ConfigFile {
            skip_python: Some(false),
            ..Default::default()
        };

        let config = ResolutionConfig::merge(Some(file), overrides);
        assert!(config.fatten);
        assert!(!config.skip_python);
        assert_eq!(config.channels, vec!["from-file"]);
        assert!(config.strip_symbols);
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("press.yaml");
        std::fs::write(&yaml_path, "fatten: true\n").unwrap();
        assert_eq!(ConfigFile::load(&yaml_path).unwrap().fatten, Some(true));

        let toml_path = dir.path().join("press.toml");
        std::fs::write(&toml_path, "merge = true\n").unwrap();
        assert_eq!(ConfigFile::load(&toml_path).unwrap().merge, Some(true));

        assert!(ConfigFile::load(&dir.path().join("missing.yaml")).is_err());
    }
}
