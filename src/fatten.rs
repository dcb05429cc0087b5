// src/fatten.rs

//! Merging a resolved tree into one self-contained wheel
//!
//! Wheels are merged dependencies first, root last, so the root wins any
//! collision. Inside the merged wheel:
//!
//! - every dependency's generated metadata (`METADATA`, `WHEEL`, `RECORD`,
//!   `entry_points.txt`) is dropped and regenerated for the root
//! - dependency license files move to `{root}.dist-info/licenses/{dist}/`
//! - dependency `.data` directories fold into the root's
//! - the declared requirements are the external ones: everything the
//!   merged artifacts depend on, minus the artifacts merged in

use crate::config::ResolutionConfig;
use crate::error::{Error, Result};
use crate::resolver::ResolvedTree;
use crate::wheel::{ConvertedArtifact, WheelEntry, WheelMetadata, WheelNames, read_wheel, write_entries};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Files regenerated for the merged wheel
const GENERATED: &[&str] = &["METADATA", "WHEEL", "RECORD", "entry_points.txt"];

/// Merge every completed artifact of `tree` into one wheel
///
/// `skip_refs` holds canonical references or package names kept out of the
/// merge; they stay external requirements. The first root names the result.
pub fn fatten(
    tree: &ResolvedTree,
    skip_refs: &BTreeSet<String>,
    config: &ResolutionConfig,
) -> Result<ConvertedArtifact> {
    let root_key = tree
        .roots()
        .first()
        .ok_or_else(|| Error::ArtifactNotFound("no root artifact to merge into".to_string()))?;
    let root = tree
        .artifact(root_key)
        .ok_or_else(|| Error::ArtifactNotFound(root_key.clone()))?;
    let root_names = root.metadata.names();

    let order: Vec<(&String, &Arc<ConvertedArtifact>)> = tree
        .post_order(tree.roots())
        .iter()
        .filter_map(|key| tree.nodes().get_key_value(key))
        .filter_map(|(key, _)| tree.artifact(key).map(|a| (key, a)))
        .filter(|(key, artifact)| {
            let skipped = *key != root_key
                && (skip_refs.contains(*key) || skip_refs.contains(&artifact.reference.name));
            if skipped {
                debug!("Keeping {} external", key);
            }
            !skipped
        })
        .collect();

    let mut merged: BTreeMap<String, WheelEntry> = BTreeMap::new();
    let mut origin: BTreeMap<String, &str> = BTreeMap::new();
    let mut entry_points = BTreeMap::new();

    for (key, artifact) in &order {
        let is_root = *key == root_key;
        let names = artifact.metadata.names();

        for (path, entry) in read_wheel(artifact.path())? {
            let Some(target) = merged_path(&path, &names, &root_names, is_root) else {
                continue;
            };
            match merged.get(&target) {
                Some(existing) if existing.data == entry.data => {
                    debug!("Identical {} in {} and {}", target, origin[&target], key);
                    continue;
                }
                Some(_) => {
                    warn!(
                        "Collision on {}: {} replaces the copy from {}",
                        target, key, origin[&target]
                    );
                }
                None => {}
            }
            origin.insert(target.clone(), key.as_str());
            merged.insert(target, entry);
        }

        entry_points.extend(
            artifact
                .metadata
                .entry_points
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }

    let merged_names: BTreeSet<&str> = order
        .iter()
        .flat_map(|(_, a)| [a.reference.name.as_str(), a.metadata.name.as_str()])
        .collect();
    let dependencies: Vec<String> = order
        .iter()
        .flat_map(|(_, a)| a.dependencies.iter())
        .filter(|name| !merged_names.contains(name.as_str()))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let tags = if root.metadata.tags.platform == "any" {
        order
            .iter()
            .map(|(_, a)| &a.metadata.tags)
            .find(|t| t.platform != "any")
            .unwrap_or(&root.metadata.tags)
            .clone()
    } else {
        root.metadata.tags.clone()
    };

    let metadata = WheelMetadata {
        requires: if config.include_requirements {
            dependencies.clone()
        } else {
            Vec::new()
        },
        entry_points,
        tags,
        ..root.metadata.clone()
    };

    let (out_dir, scratch) = match &config.output {
        Some(dir) => (dir.clone(), None),
        None => {
            let scratch = TempDir::new()
                .map_err(|e| Error::write("Failed to create output directory", e))?;
            (scratch.path().to_path_buf(), Some(scratch))
        }
    };
    let path = write_entries(&merged, &metadata, &out_dir)?;

    info!(
        "Merged {} artifacts into {} ({} external requirements)",
        order.len(),
        metadata.filename(),
        dependencies.len()
    );
    Ok(ConvertedArtifact::new(
        root.reference.clone(),
        metadata,
        dependencies,
        path,
        scratch,
    ))
}

/// Where a file of one input wheel lands in the merged wheel
fn merged_path(path: &str, names: &WheelNames, root: &WheelNames, is_root: bool) -> Option<String> {
    let dist_info = names.dist_info();
    if let Some(rest) = path
        .strip_prefix(dist_info.as_str())
        .and_then(|p| p.strip_prefix('/'))
    {
        if GENERATED.contains(&rest) {
            return None;
        }
        if is_root {
            return Some(path.to_string());
        }
        return rest
            .strip_prefix("licenses/")
            .map(|license| format!("{}/licenses/{}/{}", root.dist_info(), names.dist, license));
    }

    let data_dir = names.data_dir();
    if !is_root
        && let Some(rest) = path
            .strip_prefix(data_dir.as_str())
            .and_then(|p| p.strip_prefix('/'))
    {
        return Some(format!("{}/{}", root.data_dir(), rest));
    }

    Some(path.to_string())
}
