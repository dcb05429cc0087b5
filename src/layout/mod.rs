// src/layout/mod.rs

//! Source layout to wheel layout transformation
//!
//! Every manifest entry is mapped to a wheel path by its role:
//!
//! | Role     | Source                                   | Wheel path                          |
//! |----------|------------------------------------------|-------------------------------------|
//! | Library  | `lib/pythonX.Y/site-packages/pkg/_x.so`  | `pkg/_x.so`                         |
//! | Library  | `lib/libfoo.so`                          | `lib/libfoo.so`                     |
//! | Script   | `bin/tool`                               | `{dist}-{ver}.data/scripts/tool`    |
//! | Data     | `lib/pythonX.Y/site-packages/pkg/a.py`   | `pkg/a.py`                          |
//! | Metadata | `info/licenses/LICENSE`                  | `{dist}-{ver}.dist-info/licenses/…` |
//!
//! The wheel root is installed into `site-packages`, so shared libraries end
//! up in `site-packages/lib`. Native objects get their search path pointed
//! there. Symlinks are replaced by copies of the file they point to.

pub mod binary;
pub mod script;

pub use binary::{NativeKind, Relinker, ToolRelinker};

use crate::archive::{EntryKind, ExtractedArtifact, FileRole, Manifest, ManifestEntry};
use crate::config::{PythonVersion, ResolutionConfig};
use crate::error::{Error, Result};
use crate::filesystem::path::{relative_dir, resolve_link_target, to_layout_string};
use crate::wheel::WheelNames;
use binary::search_path;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Maximum symlink hops followed inside a package
const MAX_LINK_DEPTH: usize = 16;

/// Layout directory shared libraries are collected in
pub const LIB_DIR: &str = "lib";

static SITE_PACKAGES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:lib/python(\d+)\.(\d+)/site-packages/|Lib/site-packages/|site-packages/)")
        .expect("site-packages pattern is valid")
});

/// Interpreter version a package was built for, from its site-packages dir
pub fn detect_python_version(manifest: &Manifest) -> Option<PythonVersion> {
    manifest.keys().find_map(|path| {
        let caps = SITE_PACKAGES.captures(path)?;
        let major = caps.get(1)?.as_str().parse().ok()?;
        let minor = caps.get(2)?.as_str().parse().ok()?;
        Some(PythonVersion::new(major, minor))
    })
}

/// Path relative to the wheel root for files under site-packages
fn strip_site_packages(path: &str) -> &str {
    match SITE_PACKAGES.find(path) {
        Some(m) => &path[m.end()..],
        None => path,
    }
}

/// A file placed in the staging directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedEntry {
    pub role: FileRole,
    /// Permission bits written into the wheel
    pub mode: u32,
}

/// The transformed file tree, staged on disk
#[derive(Debug)]
pub struct StagedLayout {
    dir: TempDir,
    entries: BTreeMap<String, StagedEntry>,
    pub names: WheelNames,
    pub python_version: PythonVersion,
}

impl StagedLayout {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Wheel path to entry, in lexicographic order
    pub fn entries(&self) -> &BTreeMap<String, StagedEntry> {
        &self.entries
    }

    pub fn path_of(&self, wheel_path: &str) -> PathBuf {
        self.dir.path().join(wheel_path)
    }

    pub fn read(&self, wheel_path: &str) -> Result<Vec<u8>> {
        fs::read(self.path_of(wheel_path))
            .map_err(|e| Error::write(format!("Failed to read staged {}", wheel_path), e))
    }

    fn stage(&mut self, wheel_path: &str, content: &[u8], entry: StagedEntry) -> Result<()> {
        let path = self.path_of(wheel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::write(format!("Failed to create {}", parent.display()), e))?;
        }
        fs::write(&path, content)
            .map_err(|e| Error::write(format!("Failed to stage {}", wheel_path), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // Owner write so the relinker can patch the file in place
            fs::set_permissions(&path, fs::Permissions::from_mode(entry.mode | 0o200))
                .map_err(|e| Error::write(format!("Failed to chmod {}", wheel_path), e))?;
        }

        if self.entries.insert(wheel_path.to_string(), entry).is_some() {
            warn!("Two files map to {}; keeping the later one", wheel_path);
        }
        Ok(())
    }
}

/// Maps an extracted package onto the wheel layout
pub struct LayoutTransformer<'a> {
    config: &'a ResolutionConfig,
    relinker: &'a dyn Relinker,
}

impl<'a> LayoutTransformer<'a> {
    pub fn new(config: &'a ResolutionConfig, relinker: &'a dyn Relinker) -> Self {
        Self { config, relinker }
    }

    /// Stage every mapped file, then fix up native objects
    pub fn transform(&self, artifact: &ExtractedArtifact) -> Result<StagedLayout> {
        let info = &artifact.info;
        let python_version =
            detect_python_version(&info.manifest).unwrap_or(self.config.python_version);
        let names = WheelNames::new(&info.name, &info.version);

        let dir = TempDir::new().map_err(|e| Error::write("Failed to create staging directory", e))?;
        let mut layout = StagedLayout {
            dir,
            entries: BTreeMap::new(),
            names,
            python_version,
        };

        for (path, entry) in &info.manifest {
            let Some(target) = self.target_path(path, entry.role, &layout.names, artifact) else {
                continue;
            };

            match &entry.kind {
                EntryKind::Regular => {
                    let content = fs::read(artifact.path_of(path)).map_err(|e| Error::CorruptArchive {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                    self.stage_file(&mut layout, &target, entry.role, entry.mode, content)?;
                }
                EntryKind::Symlink { .. } => {
                    self.stage_symlink(&mut layout, artifact, path, &target, entry)?;
                }
            }
        }

        self.fix_native_objects(&layout)?;

        info!(
            "Staged {} files for {}-{}",
            layout.entries.len(),
            info.name,
            info.version
        );
        Ok(layout)
    }

    fn target_path(
        &self,
        path: &str,
        role: FileRole,
        names: &WheelNames,
        artifact: &ExtractedArtifact,
    ) -> Option<String> {
        match role {
            FileRole::Metadata => self.metadata_target(path, names),
            FileRole::Script => {
                let (_, file_name) = path.split_once('/')?;
                if script::is_entry_point_stub(file_name, &artifact.info.entry_points) {
                    debug!("Dropping {}: installers generate entry point scripts", path);
                    return None;
                }
                Some(format!("{}/scripts/{}", names.data_dir(), file_name))
            }
            FileRole::Library | FileRole::Data => {
                let in_site_packages = SITE_PACKAGES.is_match(path);
                let relative = strip_site_packages(path);
                if relative.ends_with(".pyc") {
                    return None;
                }
                if in_site_packages && is_installed_metadata(relative) {
                    debug!("Dropping installed metadata {}", path);
                    return None;
                }
                Some(relative.to_string())
            }
        }
    }

    /// License files and a few conda records go into `.dist-info`
    fn metadata_target(&self, path: &str, names: &WheelNames) -> Option<String> {
        let dist_info = names.dist_info();
        let rest = path.strip_prefix("info/")?;

        if let Some(license) = rest.strip_prefix("licenses/") {
            return Some(format!("{}/licenses/{}", dist_info, license));
        }
        if !rest.contains('/') && rest.to_ascii_uppercase().starts_with("LICENSE") {
            return Some(format!("{}/licenses/{}", dist_info, rest));
        }
        match rest {
            "index.json" | "about.json" | "link.json" => {
                return Some(format!("{}/conda/{}", dist_info, rest));
            }
            _ => {}
        }
        if self.config.include_requirements && rest.starts_with("test/") {
            return Some(format!("{}/conda/{}", dist_info, rest));
        }
        None
    }

    fn stage_file(
        &self,
        layout: &mut StagedLayout,
        target: &str,
        role: FileRole,
        mode: u32,
        content: Vec<u8>,
    ) -> Result<()> {
        let mode = staged_mode(role, mode);
        let content = if role == FileRole::Script {
            script::rewrite_shebang(&content).unwrap_or(content)
        } else {
            content
        };
        layout.stage(target, &content, StagedEntry { role, mode })
    }

    /// Replace a symlink with the file (or directory) it points to
    fn stage_symlink(
        &self,
        layout: &mut StagedLayout,
        artifact: &ExtractedArtifact,
        path: &str,
        target: &str,
        entry: &ManifestEntry,
    ) -> Result<()> {
        let Some(resolved) = resolve_chain(&artifact.info.manifest, path) else {
            // A directory target never appears in the manifest itself
            if let Some(dir) = resolve_link_target(Path::new(path), &link_target(entry))
                .map(|p| to_layout_string(&p))
                .filter(|d| artifact.path_of(d).is_dir())
            {
                return self.stage_symlinked_dir(layout, artifact, &dir, target, entry.role);
            }
            warn!("Skipping dangling symlink {}", path);
            return Ok(());
        };

        let real = &artifact.info.manifest[&resolved];
        let content = fs::read(artifact.path_of(&resolved)).map_err(|e| Error::CorruptArchive {
            path: resolved.clone(),
            reason: e.to_string(),
        })?;
        debug!("Materializing {} -> {} ({} bytes)", path, resolved, content.len());
        self.stage_file(layout, target, entry.role, real.mode, content)
    }

    fn stage_symlinked_dir(
        &self,
        layout: &mut StagedLayout,
        artifact: &ExtractedArtifact,
        dir: &str,
        target: &str,
        role: FileRole,
    ) -> Result<()> {
        let prefix = format!("{}/", dir);
        let files: Vec<(String, u32)> = artifact
            .info
            .manifest
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(_, e)| !e.is_symlink())
            .map(|(p, e)| (p.clone(), e.mode))
            .collect();

        debug!("Materializing directory link {} ({} files)", target, files.len());
        for (source, mode) in files {
            let content = fs::read(artifact.path_of(&source)).map_err(|e| Error::CorruptArchive {
                path: source.clone(),
                reason: e.to_string(),
            })?;
            let suffix = &source[prefix.len()..];
            self.stage_file(layout, &format!("{}/{}", target, suffix), role, mode, content)?;
        }
        Ok(())
    }

    /// Point native libraries and programs at the wheel's `lib/` directory
    fn fix_native_objects(&self, layout: &StagedLayout) -> Result<()> {
        let data_scripts = format!("{}/scripts/", layout.names.data_dir());
        let installed_lib = format!(
            "{}/{}/site-packages/{}",
            LIB_DIR,
            layout.python_version.lib_dir(),
            LIB_DIR
        );

        for (wheel_path, entry) in &layout.entries {
            if !matches!(entry.role, FileRole::Library | FileRole::Script) {
                continue;
            }
            let path = layout.path_of(wheel_path);
            let Some(kind) = NativeKind::detect(&path) else {
                continue;
            };

            // Scripts are installed into <prefix>/bin, everything else into site-packages
            let (dir, lib) = if wheel_path.starts_with(&data_scripts) {
                ("bin".to_string(), installed_lib.as_str())
            } else {
                (parent_dir(wheel_path).to_string(), LIB_DIR)
            };
            let Some(search_path) = search_path(kind, &relative_dir(&dir, lib)) else {
                continue;
            };

            debug!("Relinking {} with search path {}", wheel_path, search_path);
            self.relinker
                .relink(&path, &search_path)
                .map_err(|e| match e {
                    Error::RelinkFailed { .. } => e,
                    other => Error::RelinkFailed {
                        path: wheel_path.clone(),
                        reason: other.to_string(),
                    },
                })?;

            if self.config.strip_symbols
                && let Err(e) = self.relinker.strip(&path)
            {
                warn!("Failed to strip {}: {}", wheel_path, e);
            }

            if entry.role == FileRole::Library {
                binary::audit(&path, &dir);
            }
        }
        Ok(())
    }
}

/// Permission bits a staged file gets for its role
pub fn staged_mode(role: FileRole, mode: u32) -> u32 {
    let mode = mode & 0o777;
    match role {
        FileRole::Library | FileRole::Script => mode | 0o755,
        FileRole::Data => mode | 0o644,
        FileRole::Metadata => 0o644,
    }
}

/// `.dist-info`/`.egg-info` of the conda build's own pip install
fn is_installed_metadata(relative: &str) -> bool {
    relative
        .split('/')
        .next()
        .is_some_and(|top| top.ends_with(".dist-info") || top.ends_with(".egg-info"))
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn link_target(entry: &ManifestEntry) -> PathBuf {
    match &entry.kind {
        EntryKind::Symlink { target } => PathBuf::from(target),
        EntryKind::Regular => PathBuf::new(),
    }
}

/// Follow a chain of symlinks within the manifest to a regular file
fn resolve_chain(manifest: &Manifest, start: &str) -> Option<String> {
    let mut current = start.to_string();
    for _ in 0..MAX_LINK_DEPTH {
        let entry = manifest.get(&current)?;
        match &entry.kind {
            EntryKind::Regular => return Some(current),
            EntryKind::Symlink { target } => {
                let next = resolve_link_target(Path::new(&current), Path::new(target))?;
                current = to_layout_string(&next);
            }
        }
    }
    warn!("Symlink chain starting at {} is too deep", start);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::open_archive;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingRelinker {
        calls: Mutex<Vec<(String, String)>>,
        stripped: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Relinker for RecordingRelinker {
        fn relink(&self, path: &Path, search_path: &str) -> Result<()> {
            if self.fail {
                return Err(Error::ToolNotFound("patchelf".into()));
            }
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            self.calls.lock().push((name, search_path.to_string()));
            Ok(())
        }

        fn strip(&self, path: &Path) -> Result<()> {
            self.stripped
                .lock()
                .push(path.file_name().unwrap().to_string_lossy().into_owned());
            Err(Error::ToolNotFound("strip".into()))
        }
    }

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn package() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            root,
            "info/index.json",
            br#"{"name": "re2", "version": "1.0", "build": "py311h0_0", "subdir": "linux-64", "depends": ["python"]}"#,
        );
        write(
            root,
            "info/link.json",
            br#"{"noarch": {"entry_points": ["re2-tool = re2.cli:main"]}}"#,
        );
        write(root, "info/licenses/LICENSE", b"BSD");
        write(root, "info/files", b"lib/libre2.so\n");
        write(root, "info/test/run_test.py", b"import re2\n");
        write(root, "lib/libre2.so.0", b"\x7fELF fake library");
        write(root, "lib/python3.11/site-packages/re2/__init__.py", b"");
        write(root, "lib/python3.11/site-packages/re2/_re2.so", b"\x7fELF fake extension");
        write(root, "lib/python3.11/site-packages/re2/__pycache__/x.cpython-311.pyc", b"");
        write(root, "lib/python3.11/site-packages/re2-1.0.dist-info/RECORD", b"");
        write(root, "bin/re2-grep", b"#!/opt/anaconda1anaconda2anaconda3/bin/python3.11\nprint(1)\n");
        write(root, "bin/re2-tool", b"#!/opt/anaconda1anaconda2anaconda3/bin/python\n");
        write(root, "bin/re2-native", b"\x7fELF fake program");
        #[cfg(unix)]
        std::os::unix::fs::symlink("libre2.so.0", root.join("lib/libre2.so")).unwrap();
        dir
    }

    #[test]
    fn test_detect_python_version() {
        let dir = package();
        let artifact = open_archive(dir.path()).unwrap();
        assert_eq!(
            detect_python_version(&artifact.info.manifest),
            Some(PythonVersion::new(3, 11))
        );
    }

    #[test]
    fn test_transform_paths_and_relink_calls() {
        let dir = package();
        let artifact = open_archive(dir.path()).unwrap();
        let config = ResolutionConfig::new();
        let relinker = RecordingRelinker::default();

        let layout = LayoutTransformer::new(&config, &relinker)
            .transform(&artifact)
            .unwrap();
        let paths: Vec<&str> = layout.entries().keys().map(String::as_str).collect();

        assert!(paths.contains(&"re2/__init__.py"));
        assert!(paths.contains(&"re2/_re2.so"));
        assert!(paths.contains(&"lib/libre2.so.0"));
        assert!(paths.contains(&"re2-1.0.data/scripts/re2-grep"));
        assert!(paths.contains(&"re2-1.0.data/scripts/re2-native"));
        assert!(paths.contains(&"re2-1.0.dist-info/licenses/LICENSE"));
        assert!(paths.contains(&"re2-1.0.dist-info/conda/index.json"));
        assert!(paths.contains(&"re2-1.0.dist-info/conda/test/run_test.py"));
        assert!(!paths.iter().any(|p| p.ends_with(".pyc")));
        assert!(!paths.iter().any(|p| p.contains("re2-1.0.dist-info/RECORD")));
        assert!(!paths.contains(&"re2-1.0.data/scripts/re2-tool"));
        assert!(!paths.iter().any(|p| p.ends_with("info/files")));

        let grep = fs::read(layout.path_of("re2-1.0.data/scripts/re2-grep")).unwrap();
        assert_eq!(grep, b"#!python\nprint(1)\n");

        let calls = relinker.calls.lock().clone();
        assert!(calls.contains(&("_re2.so".to_string(), "$ORIGIN/../lib".to_string())));
        assert!(calls.contains(&("libre2.so.0".to_string(), "$ORIGIN".to_string())));
        assert!(calls.contains(&(
            "re2-native".to_string(),
            "$ORIGIN/../lib/python3.11/site-packages/lib".to_string()
        )));
        assert!(!calls.iter().any(|(name, _)| name == "re2-grep"));

        // Strip failures are logged, not fatal
        assert!(!relinker.stripped.lock().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_materialized() {
        use std::os::unix::fs::PermissionsExt;

        let dir = package();
        let artifact = open_archive(dir.path()).unwrap();
        let config = ResolutionConfig::new().with_strip_symbols(false);
        let relinker = RecordingRelinker::default();

        let layout = LayoutTransformer::new(&config, &relinker)
            .transform(&artifact)
            .unwrap();

        let staged = layout.path_of("lib/libre2.so");
        let meta = fs::symlink_metadata(&staged).unwrap();
        assert!(meta.file_type().is_file());
        assert_eq!(meta.len(), b"\x7fELF fake library".len() as u64);
        assert_eq!(layout.entries()["lib/libre2.so"].mode & 0o111, 0o111);
        assert_ne!(meta.permissions().mode() & 0o100, 0);
        assert!(relinker.stripped.lock().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_linked_file_is_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            root,
            "info/index.json",
            br#"{"name": "x", "version": "1.0", "build": "0", "subdir": "linux-64"}"#,
        );
        write(root, "lib/real/libx.so", b"\x7fELF fake library");
        std::os::unix::fs::symlink("real", root.join("lib/alias")).unwrap();

        let artifact = open_archive(root).unwrap();
        fs::remove_file(root.join("lib/real/libx.so")).unwrap();

        let config = ResolutionConfig::new();
        let relinker = RecordingRelinker::default();
        let err = LayoutTransformer::new(&config, &relinker)
            .transform(&artifact)
            .unwrap_err();

        match &err {
            Error::CorruptArchive { path, .. } => assert_eq!(path, "lib/real/libx.so"),
            other => panic!("unexpected error: {}", other),
        }
        assert!(!err.is_tree_fatal());
    }

    #[test]
    fn test_exclude_requirements_drops_test_files() {
        let dir = package();
        let artifact = open_archive(dir.path()).unwrap();
        let config = ResolutionConfig::new().with_include_requirements(false);
        let relinker = RecordingRelinker::default();

        let layout = LayoutTransformer::new(&config, &relinker)
            .transform(&artifact)
            .unwrap();
        assert!(!layout.entries().keys().any(|p| p.contains("conda/test/")));
    }

    #[test]
    fn test_relink_failure_is_relink_failed() {
        let dir = package();
        let artifact = open_archive(dir.path()).unwrap();
        let config = ResolutionConfig::new();
        let relinker = RecordingRelinker {
            fail: true,
            ..Default::default()
        };

        let err = LayoutTransformer::new(&config, &relinker)
            .transform(&artifact)
            .unwrap_err();
        assert!(matches!(err, Error::RelinkFailed { .. }));
    }

    #[test]
    fn test_staged_mode() {
        assert_eq!(staged_mode(FileRole::Library, 0o644), 0o755);
        assert_eq!(staged_mode(FileRole::Script, 0o700), 0o755);
        assert_eq!(staged_mode(FileRole::Data, 0o600), 0o644);
        assert_eq!(staged_mode(FileRole::Data, 0o100755), 0o755);
        assert_eq!(staged_mode(FileRole::Metadata, 0o777), 0o644);
    }

    #[test]
    fn test_resolve_chain() {
        let mut manifest = Manifest::new();
        let regular = ManifestEntry {
            role: FileRole::Library,
            mode: 0o644,
            kind: EntryKind::Regular,
            size: 3,
        };
        let link = |target: &str| ManifestEntry {
            kind: EntryKind::Symlink {
                target: target.to_string(),
            },
            ..regular.clone()
        };
        manifest.insert("lib/libz.so.1.2".to_string(), regular.clone());
        manifest.insert("lib/libz.so.1".to_string(), link("libz.so.1.2"));
        manifest.insert("lib/libz.so".to_string(), link("libz.so.1"));
        manifest.insert("lib/loop".to_string(), link("loop"));
        manifest.insert("lib/out".to_string(), link("../../etc/passwd"));

        assert_eq!(resolve_chain(&manifest, "lib/libz.so").as_deref(), Some("lib/libz.so.1.2"));
        assert_eq!(resolve_chain(&manifest, "lib/loop"), None);
        assert_eq!(resolve_chain(&manifest, "lib/out"), None);
    }
}
