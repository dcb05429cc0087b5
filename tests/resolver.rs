// tests/resolver.rs

//! Dependency tree resolution against a local channel

mod common;

use common::{CountingFetcher, FakeRelinker, LocalIndex, PackageBuilder, elf};
use condawheel::artifact::ArtifactSpec;
use condawheel::config::ResolutionConfig;
use condawheel::convert::Converter;
use condawheel::index::{ArtifactFetcher, Candidate};
use condawheel::resolver::{NodeState, Resolver, Source};
use condawheel::translate::StaticPresence;
use condawheel::Error;
use std::path::PathBuf;

fn config() -> ResolutionConfig {
    ResolutionConfig::new().with_subdirs(["linux-64"]).with_jobs(4)
}

fn spec(name: &str) -> Source {
    Source::Spec(ArtifactSpec::name_only(name))
}

fn data_package(name: &str, depends: &[&str]) -> PackageBuilder {
    PackageBuilder::new(name, "1.0")
        .depends(depends)
        .file(
            &format!("lib/python3.12/site-packages/{}/__init__.py", name),
            name.as_bytes(),
            0o644,
        )
}

#[test]
fn test_cycle_converts_each_once() {
    let mut index = LocalIndex::new();
    let x = index.add(&data_package("x", &["y"]));
    let y = index.add(&data_package("y", &["x"]));
    let fetcher = CountingFetcher::default();
    let relinker = FakeRelinker::default();
    let presence = StaticPresence::default();
    let config = config();

    let resolver =
        Resolver::new(Converter::new(&config, &relinker, &presence), &index, &fetcher).unwrap();
    let tree = resolver.resolve(&[spec("x")]).unwrap();

    assert!(matches!(tree.get(&x.canonical()).unwrap().state, NodeState::Done(_)));
    assert!(matches!(tree.get(&y.canonical()).unwrap().state, NodeState::Done(_)));
    assert_eq!(fetcher.count("x-1.0-0.tar.bz2"), 1);
    assert_eq!(fetcher.count("y-1.0-0.tar.bz2"), 1);
    assert!(tree.detect_cycle().is_some());
    assert!(tree.failures().is_empty());

    // Dependencies come first; the cycle's back edge is skipped
    assert_eq!(
        tree.post_order(tree.roots()),
        vec![y.canonical(), x.canonical()]
    );
    tree.release().unwrap();
}

#[test]
fn test_missing_dependency_is_dropped() {
    let mut index = LocalIndex::new();
    let app = index.add(&data_package("app", &["present", "absent"]));
    let present = index.add(&data_package("present", &[]));
    let fetcher = CountingFetcher::default();
    let relinker = FakeRelinker::default();
    let presence = StaticPresence::default();
    let config = config();

    let resolver =
        Resolver::new(Converter::new(&config, &relinker, &presence), &index, &fetcher).unwrap();
    let tree = resolver.resolve(&[spec("app")]).unwrap();

    assert!(tree.artifact(&app.canonical()).is_some());
    assert!(tree.artifact(&present.canonical()).is_some());
    assert_eq!(tree.dependencies(&app.canonical()), [present.canonical()]);

    assert_eq!(tree.failures().len(), 1);
    assert_eq!(tree.failures()[0].subject, "absent");
    assert!(tree.failures()[0].reason.contains("absent"));

    // The root still declares what it could not bundle
    let root = tree.root().unwrap();
    assert_eq!(root.dependencies, vec!["present", "absent"]);
    tree.release().unwrap();
}

#[test]
fn test_missing_root_fails() {
    let index = LocalIndex::new();
    let fetcher = CountingFetcher::default();
    let relinker = FakeRelinker::default();
    let presence = StaticPresence::default();
    let config = config();

    let resolver =
        Resolver::new(Converter::new(&config, &relinker, &presence), &index, &fetcher).unwrap();
    let err = resolver.resolve(&[spec("nowhere")]).unwrap_err();

    assert!(matches!(err, Error::ArtifactNotFound(_)));
    assert!(err.to_string().contains("linux-64, noarch"));
}

#[test]
fn test_diamond_converts_shared_dependency_once() {
    let mut index = LocalIndex::new();
    let top = index.add(&data_package("top", &["left", "right"]));
    let left = index.add(&data_package("left", &["base"]));
    let right = index.add(&data_package("right", &["base"]));
    let base = index.add(&data_package("base", &[]));
    let fetcher = CountingFetcher::default();
    let relinker = FakeRelinker::default();
    let presence = StaticPresence::default();
    let config = config();

    let resolver =
        Resolver::new(Converter::new(&config, &relinker, &presence), &index, &fetcher).unwrap();
    let tree = resolver.resolve(&[spec("top")]).unwrap();

    assert_eq!(fetcher.count("base-1.0-0.tar.bz2"), 1);
    assert_eq!(tree.dependencies(&left.canonical()), [base.canonical()]);
    assert_eq!(tree.dependencies(&right.canonical()), [base.canonical()]);
    assert!(tree.detect_cycle().is_none());

    let stats = tree.stats();
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.total_references, 4);
    assert_eq!(stats.dependencies, 4);

    let order = tree.post_order(tree.roots());
    let position = |key: String| order.iter().position(|k| *k == key).unwrap();
    assert_eq!(order.len(), 4);
    assert!(position(base.canonical()) < position(left.canonical()));
    assert!(position(base.canonical()) < position(right.canonical()));
    assert_eq!(position(top.canonical()), 3);
    tree.release().unwrap();
}

#[test]
fn test_local_root_resolves_from_index() {
    let mut index = LocalIndex::new();
    let dep = index.add(&data_package("dep", &[]));
    let local = data_package("local", &["dep"]).build_dir();
    let fetcher = CountingFetcher::default();
    let relinker = FakeRelinker::default();
    let presence = StaticPresence::default();
    let config = config();

    let resolver =
        Resolver::new(Converter::new(&config, &relinker, &presence), &index, &fetcher).unwrap();
    let tree = resolver
        .resolve(&[Source::Local(local.path().to_path_buf())])
        .unwrap();

    assert_eq!(tree.roots(), ["noarch/local-1.0-0".to_string()]);
    assert_eq!(tree.dependencies("noarch/local-1.0-0"), [dep.canonical()]);
    assert_eq!(fetcher.count("local-1.0-0.tar.bz2"), 0);
    assert_eq!(fetcher.count("dep-1.0-0.tar.bz2"), 1);
    tree.release().unwrap();
}

#[test]
fn test_failed_dependency_conversion_is_dropped() {
    let mut index = LocalIndex::new();
    let app = index.add(&data_package("app", &["native"]));
    let native = index.add(
        &PackageBuilder::new("native", "1.0")
            .subdir("linux-64")
            .file("lib/libnative.so", &elf("native"), 0o755),
    );
    let fetcher = CountingFetcher::default();
    let relinker = FakeRelinker::failing_on("libnative.so");
    let presence = StaticPresence::default();
    let config = config();

    let resolver =
        Resolver::new(Converter::new(&config, &relinker, &presence), &index, &fetcher).unwrap();
    let tree = resolver.resolve(&[spec("app")]).unwrap();

    assert!(tree.artifact(&app.canonical()).is_some());
    assert!(matches!(
        tree.get(&native.canonical()).unwrap().state,
        NodeState::Failed(_)
    ));
    assert!(tree.dependencies(&app.canonical()).is_empty());
    assert_eq!(tree.failures().len(), 1);
    assert_eq!(tree.failures()[0].subject, "native");
    tree.release().unwrap();
}

#[test]
fn test_shared_dependency_failure_drops_every_edge() {
    let mut index = LocalIndex::new();
    let top = index.add(&data_package("top", &["left", "right"]));
    let left = index.add(&data_package("left", &["base"]));
    let right = index.add(&data_package("right", &["base"]));
    let base = index.add(
        &PackageBuilder::new("base", "1.0")
            .subdir("linux-64")
            .file("lib/libbase.so", &elf("base"), 0o755),
    );
    let fetcher = CountingFetcher::default();
    let relinker = FakeRelinker::failing_on("libbase.so");
    let presence = StaticPresence::default();
    let config = config();

    let resolver =
        Resolver::new(Converter::new(&config, &relinker, &presence), &index, &fetcher).unwrap();
    let tree = resolver.resolve(&[spec("top")]).unwrap();

    assert!(matches!(
        tree.get(&base.canonical()).unwrap().state,
        NodeState::Failed(_)
    ));
    assert!(tree.artifact(&left.canonical()).is_some());
    assert!(tree.artifact(&right.canonical()).is_some());
    assert_eq!(tree.dependencies(&top.canonical()).len(), 2);

    // Neither parent keeps an edge to the failed node, whichever claimed it
    assert!(tree.dependencies(&left.canonical()).is_empty());
    assert!(tree.dependencies(&right.canonical()).is_empty());
    assert!(tree.dependents(&base.canonical()).is_empty());

    assert_eq!(fetcher.count("base-1.0-0.tar.bz2"), 1);
    assert_eq!(tree.failures().len(), 1);
    assert_eq!(tree.failures()[0].subject, "base");
    tree.release().unwrap();
}

/// Fetcher whose disk fills up when `name` is downloaded
struct FullDiskFetcher {
    inner: CountingFetcher,
    name: &'static str,
}

impl ArtifactFetcher for FullDiskFetcher {
    fn fetch(&self, candidate: &Candidate) -> condawheel::Result<PathBuf> {
        if candidate.reference.name == self.name {
            return Err(Error::WriteError("No space left on device".into()));
        }
        self.inner.fetch(candidate)
    }
}

#[test]
fn test_tree_fatal_dependency_releases_parent() {
    let mut index = LocalIndex::new();
    index.add(&data_package("app", &["dep"]));
    index.add(&data_package("dep", &[]));
    let out = tempfile::tempdir().unwrap();
    let fetcher = FullDiskFetcher {
        inner: CountingFetcher::default(),
        name: "dep",
    };
    let relinker = FakeRelinker::default();
    let presence = StaticPresence::default();
    let config = config().with_output(out.path());

    let resolver =
        Resolver::new(Converter::new(&config, &relinker, &presence), &index, &fetcher).unwrap();
    let err = resolver.resolve(&[spec("app")]).unwrap_err();

    assert!(matches!(err, Error::WriteError(_)));
    assert_eq!(fetcher.inner.count("app-1.0-0.tar.bz2"), 1);
    // The parent's wheel was written, then removed on abort
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}

#[test]
fn test_added_dependencies_apply_to_root_only() {
    let mut index = LocalIndex::new();
    let app = index.add(&data_package("app", &[]));
    let extra = index.add(&data_package("extra", &[]));
    let fetcher = CountingFetcher::default();
    let relinker = FakeRelinker::default();
    let presence = StaticPresence::default();
    let config = config().with_add_deps(["extra"]);

    let resolver =
        Resolver::new(Converter::new(&config, &relinker, &presence), &index, &fetcher).unwrap();
    let tree = resolver.resolve(&[spec("app")]).unwrap();

    assert_eq!(tree.artifact(&app.canonical()).unwrap().dependencies, vec!["extra"]);
    assert!(tree.artifact(&extra.canonical()).unwrap().dependencies.is_empty());
    assert!(tree.detect_cycle().is_none());
    tree.release().unwrap();
}

#[test]
fn test_release_removes_scratch_wheels() {
    let mut index = LocalIndex::new();
    index.add(&data_package("app", &["dep"]));
    index.add(&data_package("dep", &[]));
    let fetcher = CountingFetcher::default();
    let relinker = FakeRelinker::default();
    let presence = StaticPresence::default();
    let config = config();

    let resolver =
        Resolver::new(Converter::new(&config, &relinker, &presence), &index, &fetcher).unwrap();
    let tree = resolver.resolve(&[spec("app")]).unwrap();

    let paths: Vec<_> = tree
        .artifacts()
        .map(|(_, artifact)| artifact.path().to_path_buf())
        .collect();
    assert_eq!(paths.len(), 2);
    assert!(paths.iter().all(|p| p.is_file()));

    tree.release().unwrap();
    assert!(paths.iter().all(|p| !p.exists()));
    tree.release().unwrap();
}
