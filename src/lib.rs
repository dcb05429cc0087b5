// src/lib.rs

//! condawheel
//!
//! Converts conda packages into installable wheels, together with their
//! dependency trees.
//!
//! # Architecture
//!
//! - Archive reader: opens `.tar.bz2`, `.conda`, `.tar.gz`, `.tar`, `.zip`
//!   or unpacked package directories and describes their contents
//! - Translator: maps conda dependency names onto wheel requirements with
//!   include/exclude overrides
//! - Layout: moves files to wheel locations, materializes symlinks and
//!   relinks native objects against the wheel's `lib/` directory
//! - Wheel writer: reproducible archives with `RECORD` digests
//! - Resolver: memoized, cycle-safe, parallel walk of the dependency tree
//! - Fatten: merges a resolved tree into one self-contained wheel

pub mod archive;
pub mod artifact;
pub mod config;
pub mod convert;
mod error;
pub mod fatten;
pub mod filesystem;
pub mod hash;
pub mod index;
pub mod layout;
pub mod resolver;
pub mod translate;
pub mod wheel;

pub use archive::{ArchiveFormat, ArtifactInfo, ExtractedArtifact, FileRole, open_archive};
pub use artifact::{ArtifactReference, ArtifactSpec};
pub use config::{PythonVersion, ResolutionConfig};
pub use convert::Converter;
pub use error::{Error, Result};
pub use fatten::fatten;
pub use resolver::{NodeState, ResolvedTree, Resolver, Source};
pub use wheel::{ConvertedArtifact, WheelMetadata};
