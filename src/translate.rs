// src/translate.rs

//! Dependency name translation
//!
//! Conda dependency names are assumed to be valid pip names unless the
//! configuration says otherwise. Two independent steps apply, in order:
//!
//! 1. [`translate`] drops excluded names and, when asked, names that do not
//!    exist in the target index.
//! 2. [`augment`] adds the configured extra names and removes excluded ones.
//!    It runs once, on the root artifact's own dependencies only.

use crate::config::{ResolutionConfig, UnverifiedNamePolicy};
use crate::error::{Error, Result};
use crate::index::ChannelClient;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// Name of the runtime interpreter package dropped by `skip_python`
pub const PYTHON_PACKAGE: &str = "python";

/// Base URL of the PyPI JSON API
pub const PYPI_JSON_URL: &str = "https://pypi.org/pypi";

/// Target index presence check
pub trait TargetIndex: Send + Sync {
    /// Whether `name` is published in the target index
    fn exists_in_target(&self, name: &str) -> bool;
}

/// Presence check against PyPI's JSON API, memoized per name
pub struct PypiPresence {
    client: ChannelClient,
    base_url: String,
    cache: Mutex<HashMap<String, bool>>,
}

impl PypiPresence {
    pub fn new(client: ChannelClient) -> Self {
        Self::with_base_url(client, PYPI_JSON_URL)
    }

    /// Use a different JSON API root (mirrors, tests)
    pub fn with_base_url(client: ChannelClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl TargetIndex for PypiPresence {
    fn exists_in_target(&self, name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        if let Some(&known) = self.cache.lock().get(&key) {
            return known;
        }

        let url = format!("{}/{}/json", self.base_url, key);
        let present = match self.client.url_exists(&url) {
            Ok(present) => present,
            Err(e) => {
                // An unreachable index cannot verify anything
                warn!("Could not check '{}' on the target index: {}", name, e);
                false
            }
        };
        debug!("Target index presence of '{}': {}", name, present);

        self.cache.lock().insert(key, present);
        present
    }
}

/// Fixed set of known target names
#[derive(Debug, Clone, Default)]
pub struct StaticPresence {
    names: HashSet<String>,
}

impl StaticPresence {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| n.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }
}

impl TargetIndex for StaticPresence {
    fn exists_in_target(&self, name: &str) -> bool {
        self.names.contains(&name.to_ascii_lowercase())
    }
}

/// Map one source dependency name to its target name
///
/// Returns `Ok(None)` when the name is excluded or, with `only_pypi`, absent
/// from the target index. Under [`UnverifiedNamePolicy::Reject`] a name that
/// would otherwise pass through unchecked is verified too, and an absent one
/// is an error.
pub fn translate(
    name: &str,
    config: &ResolutionConfig,
    presence: &dyn TargetIndex,
) -> Result<Option<String>> {
    if config.exclude_deps.contains(name) {
        debug!("Excluding dependency '{}'", name);
        return Ok(None);
    }

    if config.only_pypi {
        if presence.exists_in_target(name) {
            return Ok(Some(name.to_string()));
        }
        debug!("Dropping '{}': not in target index", name);
        return Ok(None);
    }

    match config.unverified_names {
        UnverifiedNamePolicy::PassThrough => Ok(Some(name.to_string())),
        UnverifiedNamePolicy::Reject => {
            if presence.exists_in_target(name) {
                Ok(Some(name.to_string()))
            } else {
                Err(Error::UntranslatedDependency(name.to_string()))
            }
        }
    }
}

/// `(names ∪ add_deps) \ exclude_deps`
///
/// Added names are trusted and never re-checked against the target index.
pub fn augment(names: &BTreeSet<String>, config: &ResolutionConfig) -> BTreeSet<String> {
    names
        .iter()
        .chain(config.add_deps.iter())
        .filter(|n| !config.exclude_deps.contains(*n))
        .cloned()
        .collect()
}

/// Translate an artifact's run dependencies into target names
///
/// Declaration order is kept for the resolver; `skip_python` removes the
/// interpreter before translation. `is_root` selects whether the
/// configuration's additions are merged in.
pub fn translate_dependencies(
    declared: &[String],
    config: &ResolutionConfig,
    presence: &dyn TargetIndex,
    is_root: bool,
) -> Result<Vec<String>> {
    let mut translated: Vec<String> = Vec::with_capacity(declared.len());
    for name in declared {
        if config.skip_python && name == PYTHON_PACKAGE {
            continue;
        }
        if let Some(target) = translate(name, config, presence)?
            && !translated.contains(&target)
        {
            translated.push(target);
        }
    }

    if is_root {
        let set: BTreeSet<String> = translated.iter().cloned().collect();
        let augmented = augment(&set, config);
        translated.retain(|n| augmented.contains(n));
        for extra in augmented {
            if !translated.contains(&extra) {
                translated.push(extra);
            }
        }
    }

    Ok(translated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_translate_excluded_is_absent() {
        let config = ResolutionConfig::new()
            .with_exclude_deps(["opencv"])
            .with_add_deps(["opencv"]);
        let presence = StaticPresence::new(["opencv"]);

        assert_eq!(translate("opencv", &config, &presence).unwrap(), None);
    }

    #[test]
    fn test_translate_passthrough() {
        let config = ResolutionConfig::new();
        let presence = StaticPresence::default();

        assert_eq!(
            translate("libgcc-ng", &config, &presence).unwrap(),
            Some("libgcc-ng".to_string())
        );
    }

    #[test]
    fn test_translate_only_pypi() {
        let config = ResolutionConfig::new().with_only_pypi(true);
        let presence = StaticPresence::new(["NumPy"]);

        assert_eq!(
            translate("numpy", &config, &presence).unwrap(),
            Some("numpy".to_string())
        );
        assert_eq!(translate("libgcc-ng", &config, &presence).unwrap(), None);
    }

    #[test]
    fn test_translate_reject_policy() {
        let config = ResolutionConfig::new().with_unverified_names(UnverifiedNamePolicy::Reject);
        let presence = StaticPresence::new(["six"]);

        assert_eq!(translate("six", &config, &presence).unwrap(), Some("six".to_string()));
        assert!(matches!(
            translate("libgcc-ng", &config, &presence),
            Err(Error::UntranslatedDependency(name)) if name == "libgcc-ng"
        ));
    }

    #[test]
    fn test_augment_adds() {
        let config = ResolutionConfig::new().with_add_deps(["six"]);
        assert_eq!(augment(&set(&["opencv"]), &config), set(&["opencv", "six"]));
    }

    #[test]
    fn test_augment_exclude_and_add() {
        let config = ResolutionConfig::new()
            .with_exclude_deps(["opencv"])
            .with_add_deps(["opencv-python"]);
        assert_eq!(augment(&set(&["opencv"]), &config), set(&["opencv-python"]));
    }

    #[test]
    fn test_augment_add_is_not_verified() {
        let config = ResolutionConfig::new()
            .with_only_pypi(true)
            .with_add_deps(["not-on-pypi"]);
        let presence = StaticPresence::default();

        let deps = translate_dependencies(&[], &config, &presence, true).unwrap();
        assert_eq!(deps, vec!["not-on-pypi"]);
    }

    #[test]
    fn test_translate_dependencies_keeps_order_and_skips_python() {
        let config = ResolutionConfig::new().with_skip_python(true);
        let presence = StaticPresence::default();
        let declared: Vec<String> = ["zlib", "python", "abseil", "zlib"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let deps = translate_dependencies(&declared, &config, &presence, false).unwrap();
        assert_eq!(deps, vec!["zlib", "abseil"]);
    }

    #[test]
    fn test_translate_dependencies_augments_root_only() {
        let config = ResolutionConfig::new().with_add_deps(["six"]);
        let presence = StaticPresence::default();
        let declared = vec!["opencv".to_string()];

        let root = translate_dependencies(&declared, &config, &presence, true).unwrap();
        assert_eq!(root, vec!["opencv", "six"]);

        let child = translate_dependencies(&declared, &config, &presence, false).unwrap();
        assert_eq!(child, vec!["opencv"]);
    }
}
