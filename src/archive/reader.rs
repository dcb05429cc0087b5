// src/archive/reader.rs

//! Archive extraction and manifest building

use super::{
    ArchiveFormat, ArtifactInfo, EntryKind, ExtractedArtifact, FileRole, Manifest, ManifestEntry,
    PackageMetadata,
};
use crate::config::NOARCH_SUBDIR;
use crate::error::{Error, Result};
use crate::filesystem::path::{resolve_link_target, sanitize_path, to_layout_string};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;
use tar::Archive;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Open a source archive and parse it into an [`ExtractedArtifact`]
///
/// Archives are unpacked into a temporary directory owned by the returned
/// value. Directory sources are read in place.
pub fn open_archive(path: &Path) -> Result<ExtractedArtifact> {
    let format = ArchiveFormat::detect(path)?;
    debug!("Opening {} as {}", path.display(), format);

    let (root, workdir) = match format {
        ArchiveFormat::Directory => (path.to_path_buf(), None),
        _ => {
            let workdir = TempDir::new()
                .map_err(|e| Error::write("Failed to create extraction directory", e))?;
            extract(path, format, workdir.path()).map_err(|e| match e {
                Error::CorruptArchive { .. } | Error::PathTraversal(_) => e,
                other => Error::CorruptArchive {
                    path: path.display().to_string(),
                    reason: other.to_string(),
                },
            })?;
            (workdir.path().to_path_buf(), Some(workdir))
        }
    };

    let metadata = PackageMetadata::read(&root)?;
    let manifest = read_manifest(&root)?;

    let license_files = manifest
        .keys()
        .filter(|p| is_license_file(p))
        .cloned()
        .collect();

    let subdir = metadata.subdir.clone().unwrap_or_else(|| {
        if metadata.noarch.is_some() {
            NOARCH_SUBDIR.to_string()
        } else {
            String::new()
        }
    });

    let info = ArtifactInfo {
        name: metadata.name,
        version: metadata.version,
        build: metadata.build,
        build_number: metadata.build_number,
        subdir,
        noarch: metadata.noarch,
        run_depends: metadata.run_depends,
        build_depends: metadata.build_depends,
        license_files,
        entry_points: metadata.entry_points,
        summary: metadata.summary,
        license: metadata.license,
        home: metadata.home,
        manifest,
    };

    info!(
        "Read {}-{}-{} ({} files, {} run dependencies)",
        info.name,
        info.version,
        info.build,
        info.manifest.len(),
        info.run_depends.len()
    );

    Ok(ExtractedArtifact::new(info, format, root, workdir))
}

fn is_license_file(path: &str) -> bool {
    if path.starts_with("info/licenses/") {
        return true;
    }
    path.strip_prefix("info/")
        .is_some_and(|name| !name.contains('/') && name.to_ascii_uppercase().starts_with("LICENSE"))
}

fn corrupt(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::CorruptArchive {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn extract(path: &Path, format: ArchiveFormat, dest: &Path) -> Result<()> {
    let file = File::open(path).map_err(|e| corrupt(path, e))?;
    let reader = BufReader::new(file);

    match format {
        ArchiveFormat::Directory => Ok(()),
        ArchiveFormat::Tar => unpack_tar(path, reader, dest),
        ArchiveFormat::TarGz => unpack_tar(path, flate2::read::GzDecoder::new(reader), dest),
        ArchiveFormat::TarBz2 => unpack_tar(path, bzip2::read::BzDecoder::new(reader), dest),
        ArchiveFormat::Zip => unpack_zip(path, reader, dest),
        ArchiveFormat::Conda => unpack_conda(path, reader, dest),
    }
}

fn unpack_tar<R: Read>(path: &Path, reader: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let entries = archive.entries().map_err(|e| corrupt(path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(path, e))?;
        // unpack_in refuses entries that would land outside dest
        let unpacked = entry.unpack_in(dest).map_err(|e| corrupt(path, e))?;
        if !unpacked {
            let name = entry
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return Err(Error::PathTraversal(name));
        }
    }
    Ok(())
}

fn unpack_zip<R: Read + io::Seek>(path: &Path, reader: R, dest: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| corrupt(path, e))?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(|e| corrupt(path, e))?;
        let relative = match file.enclosed_name() {
            Some(name) => sanitize_path(name)?,
            None => return Err(Error::PathTraversal(file.name().to_string())),
        };
        let target = dest.join(&relative);

        if file.is_dir() {
            fs::create_dir_all(&target).map_err(|e| corrupt(path, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| corrupt(path, e))?;
        }

        let mode = file.unix_mode();
        if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            let mut link_target = String::new();
            file.read_to_string(&mut link_target)
                .map_err(|e| corrupt(path, e))?;
            create_symlink(&link_target, &target).map_err(|e| corrupt(path, e))?;
            continue;
        }

        let mut out = File::create(&target).map_err(|e| corrupt(path, e))?;
        io::copy(&mut file, &mut out).map_err(|e| corrupt(path, e))?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| corrupt(path, e))?;
        }
    }
    Ok(())
}

/// `.conda` packages are a zip of `info-*.tar.zst` and `pkg-*.tar.zst`
fn unpack_conda<R: Read + io::Seek>(path: &Path, reader: R, dest: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| corrupt(path, e))?;

    let mut components: Vec<String> = archive
        .file_names()
        .filter(|n| n.ends_with(".tar.zst") && (n.starts_with("info-") || n.starts_with("pkg-")))
        .map(str::to_string)
        .collect();
    components.sort();

    if !components.iter().any(|n| n.starts_with("info-")) {
        return Err(corrupt(path, "no info-*.tar.zst component"));
    }

    for name in components {
        let inner = archive.by_name(&name).map_err(|e| corrupt(path, e))?;
        let decoder = zstd::Decoder::new(inner).map_err(|e| corrupt(path, e))?;
        unpack_tar(path, decoder, dest)?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> io::Result<()> {
    if fs::symlink_metadata(link).is_ok() {
        fs::remove_file(link)?;
    }
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn create_symlink(target: &str, link: &Path) -> io::Result<()> {
    // Without symlink support store the target path as the file contents
    fs::write(link, target)
}

/// Walk an unpacked package root and tag every file with its role
///
/// Symlinks are recorded as links, not followed. Their size is the size of
/// the file they point at, or 0 when the target is missing.
pub fn read_manifest(root: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = entry.map_err(|e| corrupt(root, e))?;

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        let relative = match entry.path().strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let layout_path = to_layout_string(relative);
        let role = FileRole::classify(&layout_path);

        let (kind, mode, size) = if file_type.is_symlink() {
            let target = fs::read_link(entry.path()).map_err(|e| corrupt(entry.path(), e))?;
            let resolved = resolve_link_target(relative, &target).map(|p| root.join(p));
            let (mode, size) = match resolved.as_deref().map(fs::metadata) {
                Some(Ok(meta)) => (file_mode(&meta), meta.len()),
                _ => {
                    debug!("Symlink {} -> {} has no target in package", layout_path, target.display());
                    (0o777, 0)
                }
            };
            let target = target.to_string_lossy().into_owned();
            (EntryKind::Symlink { target }, mode, size)
        } else {
            let meta = entry.metadata().map_err(|e| corrupt(entry.path(), e))?;
            (EntryKind::Regular, file_mode(&meta), meta.len())
        };

        manifest.insert(layout_path, ManifestEntry { role, mode, kind, size });
    }

    if manifest.is_empty() {
        warn!("Package at {} contains no files", root.display());
    }

    Ok(manifest)
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { 0o644 }
}
