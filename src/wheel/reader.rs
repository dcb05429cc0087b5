// src/wheel/reader.rs

//! Reading produced wheels back into memory
//!
//! Used when merging dependency wheels into a single wheel.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// One file in a wheel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelEntry {
    pub data: Vec<u8>,
    /// Permission bits (`0o777` mask)
    pub mode: u32,
}

/// Read every file of a wheel, keyed by archive path
pub fn read_wheel(path: &Path) -> Result<BTreeMap<String, WheelEntry>> {
    let corrupt = |reason: String| Error::CorruptArchive {
        path: path.display().to_string(),
        reason,
    };

    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;
    let mut entries = BTreeMap::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(|e| corrupt(e.to_string()))?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let mode = file.unix_mode().map(|m| m & 0o777).unwrap_or(0o644);

        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)
            .map_err(|e| corrupt(format!("{}: {}", name, e)))?;

        entries.insert(name, WheelEntry { data, mode });
    }

    Ok(entries)
}
