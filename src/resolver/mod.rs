// src/resolver/mod.rs

//! Dependency tree resolution
//!
//! Starting from one or more root artifacts, every translated dependency is
//! located in the package index, fetched, converted and walked in turn.
//! The walk shares one seen map per run:
//!
//! - a reference is claimed (marked [`NodeState::Pending`]) before its
//!   conversion starts, so it is converted at most once even when siblings
//!   are walked in parallel
//! - meeting a pending reference that is one of the current node's
//!   ancestors is a cycle; the reference is tombstoned as
//!   [`NodeState::Cycle`] and the walk backs off
//! - failures below the root drop that dependency and are reported; only
//!   root failures and [`Error::is_tree_fatal`] errors abort the run

mod graph;

pub use graph::{ResolutionFailure, ResolvedNode, ResolvedTree, TreeStats};

use crate::archive::{ExtractedArtifact, open_archive};
use crate::artifact::{ArtifactReference, ArtifactSpec};
use crate::convert::Converter;
use crate::error::{Error, Result};
use crate::index::{self, ArtifactFetcher, Candidate, PackageIndex};
use crate::wheel::ConvertedArtifact;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State of one reference in the seen map
#[derive(Debug, Clone)]
pub enum NodeState {
    /// Claimed; conversion in progress
    Pending,
    /// Reached again through a cycle while still in progress
    Cycle,
    Done(Arc<ConvertedArtifact>),
    Failed(String),
}

/// Something to resolve from: a local archive or a package spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Local(PathBuf),
    Spec(ArtifactSpec),
}

impl Source {
    /// Existing paths are local archives, anything else is a spec
    pub fn parse(arg: &str) -> Result<Self> {
        let path = Path::new(arg);
        if path.exists() {
            Ok(Self::Local(path.to_path_buf()))
        } else {
            Ok(Self::Spec(ArtifactSpec::parse(arg)?))
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Spec(spec) => write!(f, "{}", spec),
        }
    }
}

enum Claim {
    Claimed,
    Seen,
}

/// The memo shared by every worker of one run
#[derive(Default)]
struct SeenMap {
    nodes: Mutex<BTreeMap<String, ResolvedNode>>,
}

impl SeenMap {
    /// Check-then-claim under one lock
    fn claim(&self, reference: &ArtifactReference, ancestors: &[String]) -> Claim {
        let key = reference.canonical();
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&key) {
            None => {
                nodes.insert(
                    key,
                    ResolvedNode {
                        reference: reference.clone(),
                        state: NodeState::Pending,
                    },
                );
                Claim::Claimed
            }
            Some(node) => {
                let in_progress = matches!(node.state, NodeState::Pending | NodeState::Cycle);
                if in_progress && ancestors.contains(&key) {
                    warn!("Dependency cycle through {}; not descending again", key);
                    node.state = NodeState::Cycle;
                } else if matches!(node.state, NodeState::Done(_)) {
                    debug!("Already converted {}", key);
                }
                Claim::Seen
            }
        }
    }

    fn set(&self, key: &str, state: NodeState) {
        if let Some(node) = self.nodes.lock().get_mut(key) {
            node.state = state;
        }
    }

    fn into_nodes(self) -> BTreeMap<String, ResolvedNode> {
        self.nodes.into_inner()
    }
}

/// Mutable state of one resolution run
#[derive(Default)]
struct Walk {
    seen: SeenMap,
    edges: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<ResolutionFailure>>,
    located: Mutex<HashMap<String, Option<Candidate>>>,
}

impl Walk {
    fn fail(&self, subject: impl Into<String>, error: &Error) {
        self.failures.lock().push(ResolutionFailure {
            subject: subject.into(),
            reason: error.to_string(),
        });
    }

    fn into_tree(self, roots: Vec<String>) -> ResolvedTree {
        let mut tree = ResolvedTree::new();
        for (key, node) in self.seen.into_nodes() {
            tree.add_node(key, node);
        }
        // A node that failed for one parent failed for all of them
        for (from, to) in self.edges.into_inner() {
            if tree.artifact(&from).is_some() && tree.artifact(&to).is_some() {
                tree.add_edge(&from, &to);
            } else {
                debug!("Dropping edge {} -> {}", from, to);
            }
        }
        for root in roots {
            tree.add_root(root);
        }
        for failure in self.failures.into_inner() {
            tree.add_failure(failure);
        }
        tree
    }

    /// Release everything converted so far
    fn abandon(self) {
        for node in self.seen.into_nodes().into_values() {
            if let NodeState::Done(artifact) = node.state
                && let Err(e) = artifact.release()
            {
                warn!("Failed to release {}: {}", node.reference, e);
            }
        }
    }
}

/// Resolves and converts dependency trees
pub struct Resolver<'a> {
    converter: Converter<'a>,
    index: &'a dyn PackageIndex,
    fetcher: &'a dyn ArtifactFetcher,
    pool: rayon::ThreadPool,
}

impl<'a> Resolver<'a> {
    pub fn new(
        converter: Converter<'a>,
        index: &'a dyn PackageIndex,
        fetcher: &'a dyn ArtifactFetcher,
    ) -> Result<Self> {
        let jobs = converter.config().jobs.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("condawheel-{}", i))
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to start {} workers: {}", jobs, e)))?;

        Ok(Self {
            converter,
            index,
            fetcher,
            pool,
        })
    }

    /// Resolve the trees of all roots into one result
    ///
    /// Any root failure aborts the run and releases what was converted.
    pub fn resolve(&self, roots: &[Source]) -> Result<ResolvedTree> {
        let walk = Walk::default();
        let mut root_keys = Vec::with_capacity(roots.len());

        for source in roots {
            match self.pool.install(|| self.resolve_root(source, &walk)) {
                Ok(key) => root_keys.push(key),
                Err(e) => {
                    walk.abandon();
                    return Err(e);
                }
            }
        }

        let tree = walk.into_tree(root_keys);
        if let Some(cycle) = tree.detect_cycle() {
            info!("Dependency cycle broken: {}", cycle.join(" -> "));
        }
        let stats = tree.stats();
        info!(
            "Resolved {} artifacts ({} references, {} dropped)",
            stats.completed, stats.total_references, stats.failures
        );
        Ok(tree)
    }

    fn resolve_root(&self, source: &Source, walk: &Walk) -> Result<String> {
        match source {
            Source::Local(path) => {
                let artifact = open_archive(path)?;
                let reference = artifact.info.reference("");
                let key = reference.canonical();
                self.visit(walk, reference, "", move || Ok(artifact), &[], true)?;
                Ok(key)
            }
            Source::Spec(spec) => {
                let candidate = self.locate(spec)?.ok_or_else(|| {
                    Error::ArtifactNotFound(format!(
                        "{} (subdirs: {})",
                        spec,
                        self.converter.config().all_subdirs().join(", ")
                    ))
                })?;
                let key = candidate.reference.canonical();
                self.visit_candidate(walk, candidate, &[], true)?;
                Ok(key)
            }
        }
    }

    fn locate(&self, spec: &ArtifactSpec) -> Result<Option<Candidate>> {
        let config = self.converter.config();
        index::locate(
            self.index,
            spec,
            &config.all_subdirs(),
            config.python_version,
        )
    }

    /// Candidate for a dependency name, memoized per run
    fn locate_dependency(&self, walk: &Walk, name: &str) -> Result<Candidate> {
        let cached = walk.located.lock().get(name).cloned();
        let found = match cached {
            Some(found) => found,
            None => {
                let found = self.locate(&ArtifactSpec::name_only(name))?;
                walk.located.lock().insert(name.to_string(), found.clone());
                found
            }
        };
        found.ok_or_else(|| {
            Error::ArtifactNotFound(format!(
                "{} (subdirs: {})",
                name,
                self.converter.config().all_subdirs().join(", ")
            ))
        })
    }

    fn visit_candidate(
        &self,
        walk: &Walk,
        candidate: Candidate,
        ancestors: &[String],
        is_root: bool,
    ) -> Result<()> {
        let reference = candidate.reference.clone();
        let channel = reference.channel.clone();
        self.visit(
            walk,
            reference,
            &channel,
            || {
                let path = self.fetcher.fetch(&candidate)?;
                open_archive(&path)
            },
            ancestors,
            is_root,
        )
    }

    /// Convert one node, then walk its dependencies
    fn visit(
        &self,
        walk: &Walk,
        reference: ArtifactReference,
        channel: &str,
        prepare: impl FnOnce() -> Result<ExtractedArtifact>,
        ancestors: &[String],
        is_root: bool,
    ) -> Result<()> {
        let key = reference.canonical();
        if let Claim::Seen = walk.seen.claim(&reference, ancestors) {
            return Ok(());
        }

        let converted = match self.convert_node(prepare, channel, is_root) {
            Ok(converted) => Arc::new(converted),
            Err(e) => {
                walk.seen.set(&key, NodeState::Failed(e.to_string()));
                return Err(e);
            }
        };

        let mut chain = ancestors.to_vec();
        chain.push(key.clone());

        let results: Vec<(&String, Result<String>)> = converted
            .dependencies
            .par_iter()
            .map(|name| (name, self.resolve_dependency(walk, name, &chain)))
            .collect();

        for (name, result) in results {
            match result {
                Ok(child) => walk.edges.lock().push((key.clone(), child)),
                Err(e) if e.is_tree_fatal() => {
                    walk.seen.set(&key, NodeState::Failed(e.to_string()));
                    if let Err(release) = converted.release() {
                        warn!("Failed to release {}: {}", reference, release);
                    }
                    return Err(e);
                }
                Err(e) => {
                    warn!("Dropping dependency '{}' of {}: {}", name, reference, e);
                    walk.fail(name.as_str(), &e);
                }
            }
        }

        walk.seen.set(&key, NodeState::Done(converted));
        Ok(())
    }

    fn convert_node(
        &self,
        prepare: impl FnOnce() -> Result<ExtractedArtifact>,
        channel: &str,
        is_root: bool,
    ) -> Result<ConvertedArtifact> {
        let artifact = prepare()?;
        let converted = self
            .converter
            .convert_extracted(&artifact, channel, is_root);
        artifact.release()?;
        converted
    }

    fn resolve_dependency(&self, walk: &Walk, name: &str, chain: &[String]) -> Result<String> {
        let candidate = self.locate_dependency(walk, name)?;
        let key = candidate.reference.canonical();
        self.visit_candidate(walk, candidate, chain, false)?;
        Ok(key)
    }
}
