// src/filesystem/mod.rs

//! Filesystem helpers shared by the archive reader and layout transformer

pub mod path;

pub use path::{relative_dir, resolve_link_target, sanitize_filename, sanitize_path};
