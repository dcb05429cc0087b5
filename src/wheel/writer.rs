// src/wheel/writer.rs

//! Wheel archive writer
//!
//! Output is byte-for-byte reproducible: entries are written in
//! lexicographic order with a fixed timestamp, generated metadata is derived
//! only from [`WheelMetadata`], and `RECORD` always comes last. The archive
//! is assembled in a temporary file next to its destination and renamed
//! into place, so a failed write never leaves a partial wheel.

use super::WheelMetadata;
use super::reader::WheelEntry;
use crate::error::{Error, Result};
use crate::hash;
use crate::layout::StagedLayout;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// Mode of generated metadata files
const METADATA_MODE: u32 = 0o644;

enum Content<'a> {
    Staged(PathBuf),
    Bytes(Cow<'a, [u8]>),
}

struct Pending<'a> {
    content: Content<'a>,
    mode: u32,
}

/// Write a staged layout as a wheel into `out_dir`
///
/// Returns the path of the written wheel.
pub fn write_wheel(layout: &StagedLayout, metadata: &WheelMetadata, out_dir: &Path) -> Result<PathBuf> {
    let entries = layout
        .entries()
        .iter()
        .map(|(path, entry)| {
            (
                path.clone(),
                Pending {
                    content: Content::Staged(layout.path_of(path)),
                    mode: entry.mode,
                },
            )
        })
        .collect();
    write_archive(entries, metadata, out_dir)
}

/// Write in-memory entries as a wheel into `out_dir`
///
/// Any `METADATA`, `WHEEL`, `entry_points.txt` or `RECORD` among the entries
/// is replaced by what `metadata` generates.
pub fn write_entries(
    entries: &BTreeMap<String, WheelEntry>,
    metadata: &WheelMetadata,
    out_dir: &Path,
) -> Result<PathBuf> {
    let entries = entries
        .iter()
        .map(|(path, entry)| {
            (
                path.clone(),
                Pending {
                    content: Content::Bytes(Cow::Borrowed(entry.data.as_slice())),
                    mode: entry.mode,
                },
            )
        })
        .collect();
    write_archive(entries, metadata, out_dir)
}

fn write_archive(
    mut entries: BTreeMap<String, Pending<'_>>,
    metadata: &WheelMetadata,
    out_dir: &Path,
) -> Result<PathBuf> {
    let dist_info = metadata.names().dist_info();
    let record_path = format!("{}/RECORD", dist_info);

    let mut generated = vec![
        (format!("{}/METADATA", dist_info), metadata.metadata_file()),
        (format!("{}/WHEEL", dist_info), metadata.wheel_file()),
    ];
    let entry_points_path = format!("{}/entry_points.txt", dist_info);
    match metadata.entry_points_file() {
        Some(content) => generated.push((entry_points_path, content)),
        None => {
            entries.remove(&entry_points_path);
        }
    }
    for (path, content) in generated {
        entries.insert(
            path,
            Pending {
                content: Content::Bytes(Cow::Owned(content.into_bytes())),
                mode: METADATA_MODE,
            },
        );
    }
    entries.remove(&record_path);

    fs::create_dir_all(out_dir)
        .map_err(|e| Error::write(format!("Failed to create {}", out_dir.display()), e))?;
    let dest = out_dir.join(metadata.filename());
    let tmp = NamedTempFile::new_in(out_dir)
        .map_err(|e| Error::write("Failed to create temporary wheel", e))?;

    let mut zip = ZipWriter::new(tmp);
    let mut record = String::new();

    for (path, pending) in &entries {
        let data: Cow<'_, [u8]> = match &pending.content {
            Content::Staged(file) => Cow::Owned(
                fs::read(file).map_err(|e| Error::write(format!("Failed to read {}", path), e))?,
            ),
            Content::Bytes(bytes) => Cow::Borrowed(&**bytes),
        };

        zip.start_file(path.as_str(), file_options(pending.mode))
            .map_err(|e| Error::write(format!("Failed to add {}", path), e))?;
        zip.write_all(&data)
            .map_err(|e| Error::write(format!("Failed to write {}", path), e))?;

        record.push_str(&format!(
            "{},{},{}\n",
            record_field(path),
            hash::record_digest(&data),
            data.len()
        ));
    }

    record.push_str(&format!("{},,\n", record_field(&record_path)));
    zip.start_file(record_path.as_str(), file_options(METADATA_MODE))
        .map_err(|e| Error::write("Failed to add RECORD", e))?;
    zip.write_all(record.as_bytes())
        .map_err(|e| Error::write("Failed to write RECORD", e))?;

    let mut tmp = zip
        .finish()
        .map_err(|e| Error::write("Failed to finish wheel", e))?;
    tmp.flush()
        .map_err(|e| Error::write("Failed to flush wheel", e))?;
    tmp.persist(&dest)
        .map_err(|e| Error::write(format!("Failed to write {}", dest.display()), e.error))?;

    debug!("Wrote {} entries to {}", entries.len() + 1, dest.display());
    info!("Created {}", metadata.filename());
    Ok(dest)
}

fn file_options(mode: u32) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(mode & 0o777)
}

/// CSV-quote a RECORD path when needed
fn record_field(path: &str) -> Cow<'_, str> {
    if path.contains([',', '"', '\n']) {
        Cow::Owned(format!("\"{}\"", path.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(path)
    }
}
