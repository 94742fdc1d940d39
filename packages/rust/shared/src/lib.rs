//! Shared types, error model, and configuration for datalib.
//!
//! This crate is the foundation depended on by all other datalib crates.
//! It provides:
//! - [`DatalibError`], the unified error type
//! - Domain types ([`Entity`], [`EntityKind`], [`TermAssociation`], [`ImportId`])
//! - The [`EntitySource`] iterator contract shared by WXR and Markdown readers
//! - Configuration ([`ImportConfig`], [`DownloaderConfig`], config loading)

pub mod config;
pub mod error;
pub mod source;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    DownloaderConfig, DownloadsConfig, ImportConfig, MarkdownConfig, ReaderConfig, SiteConfig,
    UploadsConfig, config_dir, config_file_path, load_config, load_config_from, validate_config,
};
pub use error::{DatalibError, Result};
pub use source::EntitySource;
pub use types::{CURSOR_VERSION, Entity, EntityKind, Fields, ImportId, TermAssociation};
