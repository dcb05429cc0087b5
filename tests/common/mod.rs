// tests/common/mod.rs

//! Shared fixtures for integration tests: synthetic conda packages, a
//! local package index and a recording relinker.

#![allow(dead_code)]

use condawheel::artifact::{ArtifactReference, ArtifactSpec};
use condawheel::index::{ArtifactFetcher, Candidate, PackageIndex};
use condawheel::layout::Relinker;
use condawheel::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Builder for an unpacked conda package
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    pub name: String,
    pub version: String,
    pub build: String,
    pub subdir: String,
    pub depends: Vec<String>,
    files: Vec<(String, Vec<u8>, u32)>,
    symlinks: Vec<(String, String)>,
}

impl PackageBuilder {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            build: "0".to_string(),
            subdir: "noarch".to_string(),
            depends: Vec::new(),
            files: Vec::new(),
            symlinks: Vec::new(),
        }
    }

    pub fn subdir(mut self, subdir: &str) -> Self {
        self.subdir = subdir.to_string();
        self
    }

    pub fn depends(mut self, names: &[&str]) -> Self {
        self.depends = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn file(mut self, path: &str, content: &[u8], mode: u32) -> Self {
        self.files.push((path.to_string(), content.to_vec(), mode));
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        self.symlinks.push((path.to_string(), target.to_string()));
        self
    }

    pub fn filename(&self) -> String {
        format!("{}-{}-{}.tar.bz2", self.name, self.version, self.build)
    }

    /// Write the package tree under `root`
    pub fn write_to(&self, root: &Path) {
        let index = serde_json::json!({
            "name": self.name,
            "version": self.version,
            "build": self.build,
            "build_number": 0,
            "subdir": self.subdir,
            "depends": self.depends,
            "license": "MIT",
        });
        write_file(root, "info/index.json", index.to_string().as_bytes(), 0o644);

        for (path, content, mode) in &self.files {
            write_file(root, path, content, *mode);
        }

        #[cfg(unix)]
        for (path, target) in &self.symlinks {
            let link = root.join(path);
            fs::create_dir_all(link.parent().unwrap()).unwrap();
            std::os::unix::fs::symlink(target, link).unwrap();
        }
    }

    /// Unpacked package directory
    pub fn build_dir(&self) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        self.write_to(dir.path());
        dir
    }

    /// `.tar.bz2` archive in `out_dir`
    pub fn build_tar_bz2(&self, out_dir: &Path) -> PathBuf {
        let staging = self.build_dir();
        let path = out_dir.join(self.filename());

        let file = File::create(&path).unwrap();
        let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", staging.path()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        path
    }
}

fn write_file(root: &Path, rel: &str, content: &[u8], mode: u32) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }
    #[cfg(not(unix))]
    let _ = mode;
}

/// Package index over archives built into a temporary channel
pub struct LocalIndex {
    dir: TempDir,
    candidates: Vec<Candidate>,
}

impl LocalIndex {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            candidates: Vec::new(),
        }
    }

    pub fn add(&mut self, package: &PackageBuilder) -> ArtifactReference {
        let path = package.build_tar_bz2(self.dir.path());
        let reference = ArtifactReference::new(
            "test",
            &package.subdir,
            &package.name,
            &package.version,
            &package.build,
        );
        self.candidates.push(Candidate {
            reference: reference.clone(),
            url: path.display().to_string(),
            filename: package.filename(),
            depends: package.depends.clone(),
            sha256: None,
            build_number: 0,
            timestamp: 0,
        });
        reference
    }
}

impl PackageIndex for LocalIndex {
    fn find(&self, spec: &ArtifactSpec, subdirs: &[String]) -> Result<Vec<Candidate>> {
        Ok(self
            .candidates
            .iter()
            .filter(|c| c.reference.name == spec.name)
            .filter(|c| subdirs.contains(&c.reference.subdir))
            .filter(|c| spec.matches(&c.reference.version, &c.reference.build))
            .cloned()
            .collect())
    }
}

/// Fetcher for local candidates that counts fetches per archive
#[derive(Default)]
pub struct CountingFetcher {
    pub fetches: Mutex<HashMap<String, usize>>,
}

impl CountingFetcher {
    pub fn count(&self, filename: &str) -> usize {
        self.fetches.lock().get(filename).copied().unwrap_or(0)
    }
}

impl ArtifactFetcher for CountingFetcher {
    fn fetch(&self, candidate: &Candidate) -> Result<PathBuf> {
        *self
            .fetches
            .lock()
            .entry(candidate.filename.clone())
            .or_insert(0) += 1;
        let path = PathBuf::from(&candidate.url);
        if path.is_file() {
            Ok(path)
        } else {
            Err(Error::ArtifactNotFound(candidate.url.clone()))
        }
    }
}

/// Relinker that records its calls and can fail on chosen files
#[derive(Default)]
pub struct FakeRelinker {
    pub calls: Mutex<Vec<(String, String)>>,
    pub fail_on: Option<String>,
}

impl FakeRelinker {
    pub fn failing_on(file_name: &str) -> Self {
        Self {
            fail_on: Some(file_name.to_string()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

impl Relinker for FakeRelinker {
    fn relink(&self, path: &Path, search_path: &str) -> Result<()> {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if self.fail_on.as_deref() == Some(name.as_str()) {
            return Err(Error::RelinkFailed {
                path: name,
                reason: "patchelf exited with 1".to_string(),
            });
        }
        self.calls.lock().push((name, search_path.to_string()));
        Ok(())
    }

    fn strip(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Fake ELF object content
pub fn elf(tag: &str) -> Vec<u8> {
    let mut data = b"\x7fELF\x02\x01\x01\x00".to_vec();
    data.extend_from_slice(tag.as_bytes());
    data
}
