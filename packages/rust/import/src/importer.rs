//! The import state machine.
//!
//! An import makes two passes over the entity source. The first downloads
//! every asset the entities reference; the second migrates URLs and hands
//! each entity to the [`ContentWriter`]. Each call to
//! [`StreamImporter::advance`] does one small unit of work, and
//! [`StreamImporter::pause`] can be called between any two of them.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use url::Url;

use datalib_markdown::MarkdownTreeReader;
use datalib_shared::{CURSOR_VERSION, DatalibError, Entity, EntityKind, EntitySource, ImportId, Result};
use datalib_urls::{UrlProcessor, url_matches};
use datalib_wxr::WxrEntitySource;

use crate::cursor::{ImportCursor, ImportStage};
use crate::downloader::{AttachmentDownloader, DownloadOutcome, EnqueueOutcome, ResourceId};
use crate::options::{AssetScope, ImportOptions};
use crate::writer::ContentWriter;

/// Post fields scanned for assets while frontloading and migrated before
/// writing. Both passes read the same list.
const URL_FIELDS: &[&str] = &["guid", "post_content", "post_excerpt"];

/// Creates a fresh entity source positioned at the start of the export.
pub type SourceFactory<S> = Box<dyn FnMut() -> Result<S>>;

// ---------------------------------------------------------------------------
// ImportReport
// ---------------------------------------------------------------------------

/// Running totals for an import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub import_id: ImportId,
    pub stage: ImportStage,
    pub entities_scanned: u64,
    pub entities_imported: u64,
    pub assets_enqueued: u64,
    pub assets_downloaded: u64,
    /// Assets whose file was already on disk.
    pub assets_existing: u64,
    pub assets_failed: u64,
    pub attachments_imported: u64,
    /// `(url, reason)` for every failed or refused asset.
    pub failures: Vec<(String, String)>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ImportReport {
    fn new(import_id: ImportId) -> Self {
        Self {
            import_id,
            stage: ImportStage::Initial,
            entities_scanned: 0,
            entities_imported: 0,
            assets_enqueued: 0,
            assets_downloaded: 0,
            assets_existing: 0,
            assets_failed: 0,
            attachments_imported: 0,
            failures: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// StreamImporter
// ---------------------------------------------------------------------------

/// An entity scanned during frontloading whose downloads may still be
/// running. `position` and `cursor` point just past it.
struct Frontloaded<C> {
    position: u64,
    cursor: C,
    active: HashSet<ResourceId>,
}

pub struct StreamImporter<S: EntitySource, W: ContentWriter> {
    factory: SourceFactory<S>,
    writer: W,
    options: ImportOptions,
    client: Option<Client>,
    import_id: ImportId,
    stage: ImportStage,
    source_site_url: Option<Url>,

    /// Committed progress: everything before this point is done for the
    /// current stage.
    entities_cursor: Option<S::Cursor>,
    position: u64,

    source: Option<S>,
    source_exhausted: bool,
    next_position: u64,
    downloader: Option<AttachmentDownloader>,
    frontloading: VecDeque<Frontloaded<S::Cursor>>,
    report: ImportReport,
}

impl<S: EntitySource, W: ContentWriter> StreamImporter<S, W> {
    pub fn new(factory: impl FnMut() -> Result<S> + 'static, writer: W, options: ImportOptions) -> Self {
        let import_id = ImportId::new();
        Self {
            factory: Box::new(factory),
            writer,
            source_site_url: options.source_site_url.clone(),
            options,
            client: None,
            report: ImportReport::new(import_id.clone()),
            import_id,
            stage: ImportStage::Initial,
            entities_cursor: None,
            position: 0,
            source: None,
            source_exhausted: false,
            next_position: 0,
            downloader: None,
            frontloading: VecDeque::new(),
        }
    }

    /// Download assets with this client instead of building one from the
    /// downloader options.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn stage(&self) -> ImportStage {
        self.stage
    }

    pub fn import_id(&self) -> &ImportId {
        &self.import_id
    }

    /// The source site URL, configured or learned from the export.
    pub fn source_site_url(&self) -> Option<&Url> {
        self.source_site_url.as_ref()
    }

    pub fn report(&self) -> &ImportReport {
        &self.report
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    /// Do one unit of work. Returns `false` once the import is finished.
    pub async fn advance(&mut self) -> Result<bool> {
        match self.stage {
            ImportStage::Initial => {
                self.report.started_at.get_or_insert_with(Utc::now);
                self.set_stage(ImportStage::TopologicalSort);
            }
            // Entities are imported in document order.
            ImportStage::TopologicalSort => self.set_stage(ImportStage::FrontloadAssets),
            ImportStage::FrontloadAssets => self.frontload_step().await?,
            ImportStage::ImportEntities => self.import_step()?,
            ImportStage::Finished => return Ok(false),
        }
        Ok(true)
    }

    /// Advance until the import is finished.
    pub async fn run(&mut self) -> Result<&ImportReport> {
        while self.advance().await? {}
        Ok(&self.report)
    }

    /// Snapshot the committed progress.
    ///
    /// During frontloading the cursor points past the oldest entity that
    /// still has downloads running, so resuming re-enqueues them; files
    /// that finished in the meantime are skipped as already present.
    pub fn pause(&self) -> ImportCursor<S::Cursor> {
        ImportCursor {
            version: CURSOR_VERSION,
            import_id: self.import_id.clone(),
            stage: self.stage,
            position: self.position,
            entities: self.entities_cursor.clone(),
            source_site_url: self.source_site_url.as_ref().map(Url::to_string),
        }
    }

    /// Continue from a cursor saved by [`pause`](Self::pause).
    #[instrument(skip_all, fields(import_id = %cursor.import_id, stage = %cursor.stage, position = cursor.position))]
    pub fn resume(&mut self, cursor: &ImportCursor<S::Cursor>) -> Result<()> {
        if cursor.version != CURSOR_VERSION {
            return Err(DatalibError::validation(format!(
                "unsupported cursor version {} (expected {CURSOR_VERSION})",
                cursor.version
            )));
        }
        if let Some(raw) = &cursor.source_site_url {
            let url = Url::parse(raw)
                .map_err(|e| DatalibError::cursor(format!("invalid source site URL {raw:?}: {e}")))?;
            self.source_site_url = Some(url);
        }
        self.import_id = cursor.import_id.clone();
        self.report.import_id = cursor.import_id.clone();
        self.stage = cursor.stage;
        self.report.stage = cursor.stage;
        self.position = cursor.position;
        self.entities_cursor = cursor.entities.clone();

        self.source = None;
        self.source_exhausted = false;
        self.downloader = None;
        self.frontloading.clear();
        info!("resuming import");
        Ok(())
    }

    fn set_stage(&mut self, stage: ImportStage) {
        info!(import_id = %self.import_id, from = %self.stage, to = %stage, "import stage");
        self.stage = stage;
        self.report.stage = stage;
    }

    fn open_source(&mut self) -> Result<()> {
        let mut source = (self.factory)()?;
        if let Some(cursor) = &self.entities_cursor {
            source.resume(cursor)?;
        }
        self.source = Some(source);
        self.source_exhausted = false;
        self.next_position = self.position;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Frontloading
    // -----------------------------------------------------------------------

    #[instrument(level = "debug", skip_all, fields(position = self.next_position))]
    async fn frontload_step(&mut self) -> Result<()> {
        if self.source.is_none() {
            self.open_source()?;
        }
        if self.downloader.is_none() {
            let root = self.options.uploads_path.clone();
            self.downloader = Some(match &self.client {
                Some(client) => {
                    AttachmentDownloader::with_client(root, client.clone(), self.options.downloader.max_concurrent)
                }
                None => AttachmentDownloader::new(root, &self.options.downloader)?,
            });
        }

        self.collect_download_events();

        let (pending, queue_full) = match &self.downloader {
            Some(downloader) => (downloader.has_pending_requests(), downloader.queue_full()),
            None => (false, false),
        };
        if self.source_exhausted && !pending {
            if !self.frontloading.is_empty() {
                warn!(left = self.frontloading.len(), "frontloading finished with uncommitted entities");
            }
            self.source = None;
            self.downloader = None;
            self.frontloading.clear();
            self.entities_cursor = None;
            self.position = 0;
            info!(
                downloaded = self.report.assets_downloaded,
                failed = self.report.assets_failed,
                "assets frontloaded"
            );
            self.set_stage(ImportStage::ImportEntities);
            return Ok(());
        }

        if queue_full || self.source_exhausted {
            if let Some(downloader) = self.downloader.as_mut() {
                downloader.wait_for_completion().await;
            }
            self.collect_download_events();
            return Ok(());
        }

        let Some(source) = self.source.as_mut() else {
            return Ok(());
        };
        let Some(entity) = source.next_entity()? else {
            debug!("entity source exhausted");
            self.source_exhausted = true;
            return Ok(());
        };
        let cursor = source.pause()?;
        self.next_position += 1;
        self.report.entities_scanned += 1;
        self.frontloading.push_back(Frontloaded {
            position: self.next_position,
            cursor,
            active: HashSet::new(),
        });

        match entity.kind() {
            EntityKind::SiteOption => self.learn_site_option(&entity),
            EntityKind::Post => {
                if entity.get("post_type") == Some("attachment") {
                    if let Some(url) = entity.get("attachment_url") {
                        self.enqueue_asset(url, None);
                    }
                } else {
                    let context = entity.get("source_path");
                    let urls: Vec<String> = URL_FIELDS
                        .iter()
                        .filter_map(|field| entity.get(field))
                        .flat_map(|value| self.asset_urls(value))
                        .collect();
                    for raw in urls {
                        self.enqueue_asset(&raw, context);
                    }
                }
            }
            _ => {}
        }

        self.collect_download_events();
        Ok(())
    }

    fn learn_site_option(&mut self, entity: &Entity) {
        if entity.get("option_name") != Some("home") || self.options.source_site_url.is_some() {
            return;
        }
        let Some(value) = entity.get("option_value") else {
            return;
        };
        match Url::parse(value.trim()) {
            Ok(url) => {
                info!(source_site_url = %url, "learned source site URL");
                self.source_site_url = Some(url);
            }
            Err(e) => warn!(value, error = %e, "ignoring unparsable home option"),
        }
    }

    /// Raw URLs of the assets referenced in `content`.
    fn asset_urls(&self, content: &str) -> Vec<String> {
        let mut processor = UrlProcessor::new(content, self.source_site_url.as_ref());
        let mut urls = Vec::new();
        while processor.next_url() {
            if is_asset(&processor, self.options.asset_scope, self.source_site_url.as_ref()) {
                if let Some(raw) = processor.raw_url() {
                    urls.push(raw.to_string());
                }
            }
        }
        urls
    }

    fn enqueue_asset(&mut self, raw_url: &str, context_path: Option<&str>) {
        let Some(url) = self.resolve_asset_url(raw_url, context_path) else {
            warn!(url = raw_url, "cannot resolve asset URL");
            self.report.failures.push((raw_url.to_string(), "cannot resolve URL".into()));
            return;
        };
        let Some(downloader) = self.downloader.as_mut() else {
            return;
        };
        let filename = asset_filename(raw_url);
        let id = match downloader.enqueue_if_not_exists(url.as_str(), &filename) {
            EnqueueOutcome::Enqueued(id) => {
                debug!(resource_id = id, %url, filename, "enqueued asset");
                self.report.assets_enqueued += 1;
                id
            }
            EnqueueOutcome::InFlight(id) => id,
            EnqueueOutcome::AlreadyExists => {
                self.report.assets_existing += 1;
                return;
            }
            EnqueueOutcome::Refused(reason) => {
                warn!(%url, reason, "asset refused");
                self.report.failures.push((url.to_string(), reason));
                return;
            }
        };
        if let Some(entry) = self.frontloading.back_mut() {
            entry.active.insert(id);
        }
    }

    /// Absolute URL to fetch `raw` from.
    fn resolve_asset_url(&self, raw: &str, context_path: Option<&str>) -> Option<Url> {
        if let Some(local) = self.options.local_assets.as_ref().and_then(|l| l.resolve(raw)) {
            return Some(local);
        }
        if let Ok(url) = Url::parse(raw) {
            return Some(url);
        }
        let mut base = self.source_site_url.clone()?;
        if let Some(context) = context_path {
            let path = format!("{}/{}", base.path().trim_end_matches('/'), context.trim_start_matches('/'));
            base.set_path(&path);
        }
        base.join(raw).ok()
    }

    /// Apply finished downloads and move the committed cursor past every
    /// leading entity with nothing left in flight.
    fn collect_download_events(&mut self) {
        let Some(downloader) = self.downloader.as_mut() else {
            return;
        };
        downloader.poll();
        while let Some(event) = downloader.next_event() {
            for entry in self.frontloading.iter_mut() {
                entry.active.remove(&event.resource_id);
            }
            match event.outcome {
                DownloadOutcome::Success => self.report.assets_downloaded += 1,
                DownloadOutcome::Failure(reason) => {
                    self.report.assets_failed += 1;
                    self.report.failures.push((event.source_url, reason));
                }
            }
        }

        while self.frontloading.front().is_some_and(|entry| entry.active.is_empty()) {
            if let Some(entry) = self.frontloading.pop_front() {
                self.position = entry.position;
                self.entities_cursor = Some(entry.cursor);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Importing
    // -----------------------------------------------------------------------

    #[instrument(level = "debug", skip_all, fields(position = self.position))]
    fn import_step(&mut self) -> Result<()> {
        if self.source.is_none() {
            self.open_source()?;
        }
        let Some(source) = self.source.as_mut() else {
            return Ok(());
        };
        let Some(mut entity) = source.next_entity()? else {
            self.source = None;
            self.report.finished_at = Some(Utc::now());
            info!(
                imported = self.report.entities_imported,
                attachments = self.report.attachments_imported,
                "import finished"
            );
            self.set_stage(ImportStage::Finished);
            return Ok(());
        };
        let cursor = source.pause()?;

        let attachments = if entity.kind() == EntityKind::Post {
            self.migrate_post(&mut entity)
        } else {
            Vec::new()
        };

        let position = self.position;
        self.position += 1;
        self.entities_cursor = Some(cursor);

        let writer_error = |e: DatalibError| DatalibError::Writer {
            position,
            message: e.to_string(),
        };
        let record = self.writer.import_entity(&entity).map_err(writer_error)?;
        for path in attachments {
            if !path.exists() {
                debug!(path = %path.display(), "asset was not downloaded, skipping attachment");
                continue;
            }
            self.writer.import_attachment(&path, record).map_err(writer_error)?;
            self.report.attachments_imported += 1;
        }
        self.report.entities_imported += 1;
        debug!(kind = %entity.kind().as_str(), %record, "imported entity");
        Ok(())
    }

    /// Point asset URLs at the uploads directory and source-site URLs at
    /// the new site. Returns the local paths of the referenced assets.
    fn migrate_post(&self, entity: &mut Entity) -> Vec<PathBuf> {
        let mut attachments = Vec::new();
        let source = self.source_site_url.as_ref();

        if entity.get("post_type") == Some("attachment") {
            if let Some(raw) = entity.get("attachment_url").map(str::to_string) {
                let filename = asset_filename(&raw);
                entity.set("attachment_url", self.options.upload_url(&filename).to_string());
                attachments.push(self.options.uploads_path.join(filename));
            }
        }

        for field in URL_FIELDS {
            let Some(value) = entity.get(field) else {
                continue;
            };
            let mut processor = UrlProcessor::new(value, source);
            let mut changed = false;
            while processor.next_url() {
                if is_asset(&processor, self.options.asset_scope, source) {
                    let Some(raw) = processor.raw_url().map(str::to_string) else {
                        continue;
                    };
                    let filename = asset_filename(&raw);
                    changed |= processor.replace_url(&self.options.upload_url(&filename));
                    attachments.push(self.options.uploads_path.join(filename));
                } else if let Some(base) = source {
                    if processor.parsed_url().is_some_and(|url| url_matches(url, base)) {
                        changed |= processor.replace_base_url(&self.options.new_site_url);
                    }
                }
            }
            if changed {
                let updated = processor.updated_markup();
                entity.set(*field, updated);
            }
        }
        attachments
    }
}

impl<W: ContentWriter> StreamImporter<WxrEntitySource, W> {
    /// Import a `.xml` or `.xml.gz` export read `chunk_size` bytes at a time.
    pub fn wxr(path: impl Into<PathBuf>, chunk_size: usize, writer: W, options: ImportOptions) -> Self {
        let path = path.into();
        Self::new(move || WxrEntitySource::open(&path, chunk_size), writer, options)
    }
}

impl<W: ContentWriter> StreamImporter<MarkdownTreeReader, W> {
    /// Import a directory of Markdown pages. Every image they reference is
    /// downloaded, wherever it is hosted.
    pub fn markdown(root: impl Into<PathBuf>, writer: W, options: ImportOptions) -> Self {
        let root = root.into();
        let options = options.with_asset_scope(AssetScope::Any);
        Self::new(move || Ok(MarkdownTreeReader::new(&root)), writer, options)
    }
}

/// An `<img src>` within the configured scope.
fn is_asset(processor: &UrlProcessor, scope: AssetScope, source_site_url: Option<&Url>) -> bool {
    if processor.tag() != Some("IMG") || processor.inspected_attribute_name() != Some("src") {
        return false;
    }
    match (scope, source_site_url) {
        (AssetScope::Any, _) | (AssetScope::SourceSite, None) => true,
        (AssetScope::SourceSite, Some(base)) => processor.parsed_url().is_some_and(|url| url_matches(url, base)),
    }
}

/// Deterministic download name: the SHA-256 of the URL as written, plus
/// its extension. Different URLs never share a file, even for identical
/// content.
pub fn asset_filename(raw_url: &str) -> String {
    let digest = Sha256::digest(raw_url.as_bytes());
    let mut name: String = digest.iter().map(|b| format!("{b:02x}")).collect();

    let path = match Url::parse(raw_url) {
        Ok(url) => url.path().to_string(),
        Err(_) => raw_url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    if let Some(ext) = Path::new(&path).extension().and_then(|e| e.to_str()) {
        if !ext.is_empty() {
            name.push('.');
            name.push_str(ext);
        }
    }
    name
}
