// src/archive/metadata.rs

//! Conda package metadata parsing
//!
//! Reads `info/index.json` (required) and the optional `info/about.json`,
//! `info/link.json` and `info/recipe/meta.yaml`.

use crate::artifact::dependency_name;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use super::INDEX_JSON;

#[derive(Debug, Deserialize)]
struct IndexJson {
    name: String,
    version: String,
    build: String,
    #[serde(default)]
    build_number: u64,
    #[serde(default)]
    subdir: Option<String>,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    license: Option<String>,
    /// `"python"`, `"generic"`, or `true` in very old packages
    #[serde(default)]
    noarch: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct AboutJson {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    home: Option<String>,
    #[serde(default)]
    license: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LinkJson {
    #[serde(default)]
    noarch: Option<LinkNoarch>,
}

#[derive(Debug, Default, Deserialize)]
struct LinkNoarch {
    #[serde(default)]
    entry_points: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MetaYaml {
    #[serde(default)]
    requirements: Option<MetaRequirements>,
    #[serde(default)]
    build: Option<MetaBuild>,
}

#[derive(Debug, Default, Deserialize)]
struct MetaRequirements {
    #[serde(default)]
    build: Option<Vec<String>>,
    #[serde(default)]
    host: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct MetaBuild {
    #[serde(default)]
    entry_points: Option<Vec<String>>,
}

/// Everything read from a package's `info/` directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageMetadata {
    pub name: String,
    pub version: String,
    pub build: String,
    pub build_number: u64,
    pub subdir: Option<String>,
    pub noarch: Option<String>,
    pub run_depends: Vec<String>,
    pub build_depends: Vec<String>,
    pub entry_points: BTreeMap<String, String>,
    pub summary: Option<String>,
    pub license: Option<String>,
    pub home: Option<String>,
}

impl PackageMetadata {
    /// Read metadata from an unpacked package root
    pub fn read(root: &Path) -> Result<Self> {
        let index_path = root.join(INDEX_JSON);
        let missing = |reason: String| Error::MissingMetadata {
            path: index_path.display().to_string(),
            reason,
        };

        let content = fs::read_to_string(&index_path).map_err(|e| missing(e.to_string()))?;
        let index: IndexJson =
            serde_json::from_str(&content).map_err(|e| missing(e.to_string()))?;

        let about: AboutJson = read_optional_json(&root.join("info/about.json"));
        let link: LinkJson = read_optional_json(&root.join("info/link.json"));
        let meta = read_meta_yaml(&root.join("info/recipe/meta.yaml"));

        let mut entry_points = BTreeMap::new();
        let declared = link
            .noarch
            .map(|n| n.entry_points)
            .filter(|e| !e.is_empty())
            .or_else(|| meta.build.and_then(|b| b.entry_points))
            .unwrap_or_default();
        for spec in &declared {
            match parse_entry_point(spec) {
                Some((name, target)) => {
                    entry_points.insert(name, target);
                }
                None => debug!("Ignoring malformed entry point '{}'", spec),
            }
        }

        let build_depends = meta
            .requirements
            .map(|r| {
                let mut names: Vec<String> = Vec::new();
                for decl in r.build.into_iter().chain(r.host).flatten() {
                    push_unique(&mut names, dependency_name(&decl));
                }
                names
            })
            .unwrap_or_default();

        let mut run_depends = Vec::new();
        for decl in &index.depends {
            push_unique(&mut run_depends, dependency_name(decl));
        }

        let noarch = match index.noarch {
            Some(serde_json::Value::String(kind)) => Some(kind),
            Some(serde_json::Value::Bool(true)) => Some("generic".to_string()),
            _ => None,
        };

        Ok(Self {
            name: index.name,
            version: index.version,
            build: index.build,
            build_number: index.build_number,
            subdir: index.subdir,
            noarch,
            run_depends,
            build_depends,
            entry_points,
            summary: about.summary,
            license: about.license.or(index.license),
            home: about.home,
        })
    }
}

/// Split `name = module:function` into its two halves
pub fn parse_entry_point(spec: &str) -> Option<(String, String)> {
    let (name, target) = spec.split_once('=')?;
    let name = name.trim();
    let target = target.trim();
    if name.is_empty() || !target.contains(':') {
        return None;
    }
    Some((name.to_string(), target.to_string()))
}

fn push_unique(names: &mut Vec<String>, name: &str) {
    if !name.is_empty() && !names.iter().any(|n| n == name) {
        names.push(name.to_string());
    }
}

fn read_optional_json<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> T {
    let Ok(content) = fs::read_to_string(path) else {
        return T::default();
    };
    serde_json::from_str(&content).unwrap_or_else(|e| {
        debug!("Ignoring unparsable {}: {}", path.display(), e);
        T::default()
    })
}

/// Rendered recipes are best effort: some still carry template residue
fn read_meta_yaml(path: &Path) -> MetaYaml {
    let Ok(content) = fs::read_to_string(path) else {
        return MetaYaml::default();
    };
    serde_yaml::from_str(&content).unwrap_or_else(|e| {
        debug!("Ignoring unparsable {}: {}", path.display(), e);
        MetaYaml::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_read_index_json() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "info/index.json",
            r#"{"name": "re2", "version": "2016.11.01", "build": "h1234_0",
                "build_number": 3, "subdir": "linux-64",
                "depends": ["libgcc-ng >=7.3.0", "libstdcxx-ng >=7.3.0", "libgcc-ng"],
                "license": "BSD-3-Clause"}"#,
        );

        let meta = PackageMetadata::read(dir.path()).unwrap();
        assert_eq!(meta.name, "re2");
        assert_eq!(meta.build_number, 3);
        assert_eq!(meta.subdir.as_deref(), Some("linux-64"));
        assert_eq!(meta.run_depends, vec!["libgcc-ng", "libstdcxx-ng"]);
        assert_eq!(meta.license.as_deref(), Some("BSD-3-Clause"));
        assert!(meta.noarch.is_none());
    }

    #[test]
    fn test_missing_index_json() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PackageMetadata::read(dir.path()),
            Err(Error::MissingMetadata { .. })
        ));
    }

    #[test]
    fn test_unparsable_index_json() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "info/index.json", "{not json");
        assert!(matches!(
            PackageMetadata::read(dir.path()),
            Err(Error::MissingMetadata { .. })
        ));
    }

    #[test]
    fn test_entry_points_from_link_json() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "info/index.json",
            r#"{"name": "tool", "version": "1.0", "build": "py_0", "noarch": "python"}"#,
        );
        write(
            dir.path(),
            "info/link.json",
            r#"{"noarch": {"type": "python", "entry_points": ["tool = tool.cli:main", "broken"]}}"#,
        );
        write(
            dir.path(),
            "info/about.json",
            r#"{"summary": "A tool", "home": "https://example.org", "license": "MIT"}"#,
        );

        let meta = PackageMetadata::read(dir.path()).unwrap();
        assert_eq!(meta.noarch.as_deref(), Some("python"));
        assert_eq!(meta.entry_points.len(), 1);
        assert_eq!(meta.entry_points["tool"], "tool.cli:main");
        assert_eq!(meta.summary.as_deref(), Some("A tool"));
        assert_eq!(meta.license.as_deref(), Some("MIT"));
    }

    #[test]
    fn test_meta_yaml_build_requirements_and_fallback_entry_points() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "info/index.json",
            r#"{"name": "tool", "version": "1.0", "build": "0"}"#,
        );
        write(
            dir.path(),
            "info/recipe/meta.yaml",
            "requirements:\n  build:\n    - cmake >=3.10\n  host:\n    - python 3.11\n    - cmake\nbuild:\n  entry_points:\n    - tool = tool:main\n",
        );

        let meta = PackageMetadata::read(dir.path()).unwrap();
        assert_eq!(meta.build_depends, vec!["cmake", "python"]);
        assert_eq!(meta.entry_points["tool"], "tool:main");
    }

    #[test]
    fn test_garbage_meta_yaml_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "info/index.json",
            r#"{"name": "x", "version": "1", "build": "0"}"#,
        );
        write(dir.path(), "info/recipe/meta.yaml", "{% set v = 1 %}\n: : :");

        let meta = PackageMetadata::read(dir.path()).unwrap();
        assert!(meta.build_depends.is_empty());
    }

    #[test]
    fn test_parse_entry_point() {
        assert_eq!(
            parse_entry_point("conda-press = conda_press.main:main"),
            Some(("conda-press".to_string(), "conda_press.main:main".to_string()))
        );
        assert_eq!(parse_entry_point("no_target ="), None);
        assert_eq!(parse_entry_point("plain"), None);
    }
}
