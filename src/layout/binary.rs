// src/layout/binary.rs

//! Native object handling
//!
//! Shared libraries and executables carry an embedded search path (ELF
//! `RPATH`/`RUNPATH`, Mach-O `LC_RPATH`). After the layout moves files
//! around, that path has to point at the wheel's `lib/` directory again.
//! The rewrite itself is done by a [`Relinker`]; [`ToolRelinker`] shells out
//! to `patchelf`, `install_name_tool` and `strip`.

use crate::error::{Error, Result};
use goblin::Object;
use goblin::mach::Mach;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Kind of native object, detected by magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    Elf,
    MachO,
    /// Windows PE; DLLs are found next to the loader, nothing to rewrite
    Pe,
}

impl NativeKind {
    /// Detect from the first bytes of a file
    ///
    /// Magic bytes:
    /// - ELF: `7f 45 4c 46`
    /// - Mach-O: `fe ed fa ce`/`fe ed fa cf` in either byte order, or the
    ///   fat header `ca fe ba be`
    /// - PE: `MZ`
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return if data.starts_with(b"MZ") { Some(Self::Pe) } else { None };
        }
        match [data[0], data[1], data[2], data[3]] {
            [0x7f, b'E', b'L', b'F'] => Some(Self::Elf),
            [0xfe, 0xed, 0xfa, 0xce]
            | [0xfe, 0xed, 0xfa, 0xcf]
            | [0xce, 0xfa, 0xed, 0xfe]
            | [0xcf, 0xfa, 0xed, 0xfe]
            | [0xca, 0xfe, 0xba, 0xbe] => Some(Self::MachO),
            [b'M', b'Z', _, _] => Some(Self::Pe),
            _ => None,
        }
    }

    /// Detect from a file on disk; unreadable files are not native
    pub fn detect(path: &Path) -> Option<Self> {
        let mut header = [0u8; 4];
        let mut file = File::open(path).ok()?;
        let n = file.read(&mut header).ok()?;
        Self::from_magic_bytes(&header[..n])
    }

    /// Token the dynamic loader expands to the object's own directory
    pub fn origin_token(&self) -> Option<&'static str> {
        match self {
            Self::Elf => Some("$ORIGIN"),
            Self::MachO => Some("@loader_path"),
            Self::Pe => None,
        }
    }
}

/// Build a loader search path from a relative directory
///
/// ```
/// use condawheel::layout::binary::{NativeKind, search_path};
///
/// assert_eq!(search_path(NativeKind::Elf, ""), Some("$ORIGIN".to_string()));
/// assert_eq!(search_path(NativeKind::MachO, "../lib"), Some("@loader_path/../lib".to_string()));
/// assert_eq!(search_path(NativeKind::Pe, "../lib"), None);
/// ```
pub fn search_path(kind: NativeKind, relative: &str) -> Option<String> {
    let origin = kind.origin_token()?;
    if relative.is_empty() {
        Some(origin.to_string())
    } else {
        Some(format!("{}/{}", origin, relative))
    }
}

/// Binary rewrite collaborator
pub trait Relinker: Send + Sync {
    /// Replace the object's runtime search path with `search_path`
    fn relink(&self, path: &Path, search_path: &str) -> Result<()>;

    /// Remove debug symbols
    fn strip(&self, path: &Path) -> Result<()>;
}

/// [`Relinker`] backed by `patchelf`, `install_name_tool` and `strip`
///
/// Tools are looked up on `PATH` on first use.
#[derive(Debug, Default)]
pub struct ToolRelinker {
    tools: Mutex<HashMap<&'static str, PathBuf>>,
}

impl ToolRelinker {
    pub fn new() -> Self {
        Self::default()
    }

    fn tool(&self, name: &'static str) -> Result<PathBuf> {
        if let Some(path) = self.tools.lock().get(name) {
            return Ok(path.clone());
        }
        let path = which::which(name).map_err(|_| Error::ToolNotFound(name.to_string()))?;
        debug!("Using {} at {}", name, path.display());
        self.tools.lock().insert(name, path.clone());
        Ok(path)
    }

    fn run(&self, tool: &'static str, args: &[&str], path: &Path) -> Result<()> {
        let program = self.tool(tool)?;
        let output = Command::new(&program)
            .args(args)
            .arg(path)
            .output()
            .map_err(|e| Error::RelinkFailed {
                path: path.display().to_string(),
                reason: format!("failed to run {}: {}", tool, e),
            })?;

        if !output.status.success() {
            return Err(Error::RelinkFailed {
                path: path.display().to_string(),
                reason: format!(
                    "{} exited with {}: {}",
                    tool,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

impl Relinker for ToolRelinker {
    fn relink(&self, path: &Path, search_path: &str) -> Result<()> {
        match NativeKind::detect(path) {
            Some(NativeKind::Elf) => self.run("patchelf", &["--set-rpath", search_path], path),
            Some(NativeKind::MachO) => {
                let existing = read_search_paths(path).unwrap_or_default();
                let mut args: Vec<&str> = Vec::new();
                for old in &existing {
                    args.push("-delete_rpath");
                    args.push(old);
                }
                args.push("-add_rpath");
                args.push(search_path);
                self.run("install_name_tool", &args, path)
            }
            Some(NativeKind::Pe) | None => Ok(()),
        }
    }

    fn strip(&self, path: &Path) -> Result<()> {
        match NativeKind::detect(path) {
            Some(NativeKind::Elf) | Some(NativeKind::MachO) => self.run("strip", &["-S"], path),
            _ => Ok(()),
        }
    }
}

/// Search path entries embedded in a native object
///
/// Returns `None` when the file cannot be parsed. Fat Mach-O files report
/// the entries of their first architecture.
pub fn read_search_paths(path: &Path) -> Option<Vec<String>> {
    let data = std::fs::read(path).ok()?;
    match Object::parse(&data) {
        Ok(Object::Elf(elf)) => Some(
            elf.rpaths
                .iter()
                .chain(elf.runpaths.iter())
                .copied()
                .flat_map(|entry| entry.split(':'))
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        Ok(Object::Mach(Mach::Binary(macho))) => {
            Some(macho.rpaths.iter().map(|s| s.to_string()).collect())
        }
        Ok(Object::Mach(Mach::Fat(fat))) => match fat.get(0) {
            Ok(goblin::mach::SingleArch::MachO(macho)) => {
                Some(macho.rpaths.iter().map(|s| s.to_string()).collect())
            }
            _ => None,
        },
        Ok(_) => None,
        Err(e) => {
            debug!("Cannot parse {}: {}", path.display(), e);
            None
        }
    }
}

/// Search path entries that do not stay inside the layout
///
/// `layout_dir` is the object's directory relative to the layout root.
/// Entries relative to the object are resolved lexically; absolute entries
/// always escape.
pub fn escaping_search_paths(entries: &[String], layout_dir: &str) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| {
            let relative = ["$ORIGIN", "${ORIGIN}", "@loader_path", "@executable_path"]
                .iter()
                .find_map(|token| entry.strip_prefix(token));
            match relative {
                Some(rest) => !stays_inside(layout_dir, rest.trim_start_matches('/')),
                None => true,
            }
        })
        .cloned()
        .collect()
}

fn stays_inside(base: &str, relative: &str) -> bool {
    let mut depth: usize = base.split('/').filter(|s| !s.is_empty()).count();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Log search path entries of a staged object that escape the layout
pub fn audit(path: &Path, layout_dir: &str) -> Vec<String> {
    let Some(entries) = read_search_paths(path) else {
        return Vec::new();
    };
    let escaping = escaping_search_paths(&entries, layout_dir);
    for entry in &escaping {
        warn!(
            "{} keeps search path '{}' pointing outside the wheel",
            path.display(),
            entry
        );
    }
    escaping
}
