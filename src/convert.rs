// src/convert.rs

//! Single-artifact conversion pipeline
//!
//! Opens a source archive, translates its run dependencies, transforms the
//! layout and writes the wheel. Every intermediate directory is scoped, so
//! a failed conversion leaves nothing behind.

use crate::archive::{ExtractedArtifact, open_archive};
use crate::artifact::ArtifactReference;
use crate::config::ResolutionConfig;
use crate::error::{Error, Result};
use crate::layout::LayoutTransformer;
use crate::layout::binary::Relinker;
use crate::translate::{PYTHON_PACKAGE, TargetIndex, translate_dependencies};
use crate::wheel::{ConvertedArtifact, WheelMetadata, WheelTags, write_wheel};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Converts source archives into wheels
pub struct Converter<'a> {
    config: &'a ResolutionConfig,
    relinker: &'a dyn Relinker,
    presence: &'a dyn TargetIndex,
    out_dir: Option<PathBuf>,
}

impl<'a> Converter<'a> {
    /// Wheels go to `config.output`, or to a per-artifact scratch directory
    pub fn new(
        config: &'a ResolutionConfig,
        relinker: &'a dyn Relinker,
        presence: &'a dyn TargetIndex,
    ) -> Self {
        Self {
            config,
            relinker,
            presence,
            out_dir: config.output.clone(),
        }
    }

    /// Override the output directory (`None` writes to scratch space)
    pub fn with_output_dir(mut self, out_dir: Option<PathBuf>) -> Self {
        self.out_dir = out_dir;
        self
    }

    pub fn config(&self) -> &ResolutionConfig {
        self.config
    }

    /// Convert the archive at `source`
    ///
    /// `channel` only feeds the artifact's reference. `is_root` applies the
    /// configured dependency additions.
    pub fn convert(&self, source: &Path, channel: &str, is_root: bool) -> Result<ConvertedArtifact> {
        let artifact = open_archive(source)?;
        let converted = self.convert_extracted(&artifact, channel, is_root);
        artifact.release()?;
        converted
    }

    /// Convert an already opened archive
    pub fn convert_extracted(
        &self,
        artifact: &ExtractedArtifact,
        channel: &str,
        is_root: bool,
    ) -> Result<ConvertedArtifact> {
        let info = &artifact.info;
        let reference = info.reference(channel);
        info!("Converting {}", reference);

        let dependencies =
            translate_dependencies(&info.run_depends, self.config, self.presence, is_root)?;
        debug!("{} depends on {:?}", reference, dependencies);

        let layout = LayoutTransformer::new(self.config, self.relinker).transform(artifact)?;

        let uses_python = info.run_depends.iter().any(|d| d == PYTHON_PACKAGE);
        let tags = WheelTags::for_package(
            &info.subdir,
            info.is_noarch(),
            uses_python,
            layout.python_version,
        );

        let mut requires = if self.config.include_requirements {
            dependencies.clone()
        } else {
            Vec::new()
        };
        requires.sort();

        let metadata = WheelMetadata {
            name: info.name.clone(),
            version: info.version.clone(),
            build_number: info.build_number,
            summary: info.summary.clone(),
            license: info.license.clone(),
            home: info.home.clone(),
            requires,
            entry_points: info.entry_points.clone(),
            tags,
        };

        let (out_dir, scratch) = match &self.out_dir {
            Some(dir) => (dir.clone(), None),
            None => {
                let scratch = TempDir::new()
                    .map_err(|e| Error::write("Failed to create output directory", e))?;
                (scratch.path().to_path_buf(), Some(scratch))
            }
        };

        let path = write_wheel(&layout, &metadata, &out_dir)?;
        Ok(ConvertedArtifact::new(
            reference,
            metadata,
            dependencies,
            path,
            scratch,
        ))
    }
}

/// Reference of a local archive, read from its metadata
pub fn local_reference(source: &Path) -> Result<ArtifactReference> {
    let artifact = open_archive(source)?;
    let reference = artifact.info.reference("");
    artifact.release()?;
    Ok(reference)
}
