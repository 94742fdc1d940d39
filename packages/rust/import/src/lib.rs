//! Resumable imports of WXR exports and Markdown trees.
//!
//! [`StreamImporter`] drives an [`EntitySource`](datalib_shared::EntitySource)
//! through two passes: it first downloads every referenced asset with the
//! [`AttachmentDownloader`], then migrates URLs and writes each entity
//! through a [`ContentWriter`]. Progress is captured in an [`ImportCursor`]
//! that can be saved to disk and resumed after a crash.

pub mod cursor;
pub mod downloader;
pub mod importer;
pub mod options;
pub mod writer;

pub use cursor::{ImportCursor, ImportStage};
pub use downloader::{
    AttachmentDownloader, DownloadEvent, DownloadOutcome, EnqueueOutcome, ResourceId,
};
pub use importer::{ImportReport, SourceFactory, StreamImporter, asset_filename};
pub use options::{AssetScope, ImportOptions, LocalAssets};
pub use writer::{ContentWriter, RecordId};
