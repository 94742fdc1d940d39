//! Concurrent, idempotent attachment downloads.
//!
//! Each download lands in `<destination>.partial` and is renamed into place
//! only once the whole body has been written, so a file that exists at its
//! destination is always complete. Enqueueing a destination that already
//! exists is a no-op, which makes re-running an interrupted import cheap.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, instrument, warn};
use url::Url;

use datalib_shared::{DatalibError, DownloaderConfig, Result};

/// User-Agent string for asset requests.
const USER_AGENT: &str = concat!("datalib/", env!("CARGO_PKG_VERSION"));

/// Identifies one enqueued download in the events it produces.
pub type ResourceId = u64;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What `enqueue_if_not_exists` did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new download was started; an event will follow.
    Enqueued(ResourceId),
    /// The destination is already being downloaded by this resource.
    InFlight(ResourceId),
    /// The destination file exists. Nothing was done.
    AlreadyExists,
    /// The URL cannot be downloaded.
    Refused(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Success,
    Failure(String),
}

/// A finished download, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEvent {
    pub resource_id: ResourceId,
    /// The URL as enqueued, before any redirects.
    pub source_url: String,
    pub destination: PathBuf,
    pub outcome: DownloadOutcome,
}

impl DownloadEvent {
    pub fn is_success(&self) -> bool {
        self.outcome == DownloadOutcome::Success
    }
}

// ---------------------------------------------------------------------------
// AttachmentDownloader
// ---------------------------------------------------------------------------

/// Downloads assets into a directory with bounded concurrency.
///
/// HTTP transfers run as tokio tasks, so `enqueue_if_not_exists` must be
/// called from within a runtime. Completions are collected with
/// [`poll`](Self::poll), or awaited with
/// [`wait_for_completion`](Self::wait_for_completion), and read back with
/// [`next_event`](Self::next_event).
pub struct AttachmentDownloader {
    client: Client,
    output_root: PathBuf,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    completed_tx: mpsc::UnboundedSender<DownloadEvent>,
    completed_rx: mpsc::UnboundedReceiver<DownloadEvent>,
    /// Destination -> resource currently downloading it.
    in_flight: HashMap<PathBuf, ResourceId>,
    events: VecDeque<DownloadEvent>,
    next_id: ResourceId,
}

impl AttachmentDownloader {
    /// Create a downloader writing under `output_root`.
    pub fn new(output_root: impl Into<PathBuf>, config: &DownloaderConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .timeout(config.timeout)
            .build()
            .map_err(|e| DatalibError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(output_root, client, config.max_concurrent))
    }

    /// Create a downloader around an existing HTTP client.
    pub fn with_client(output_root: impl Into<PathBuf>, client: Client, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        Self {
            client,
            output_root: output_root.into(),
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            completed_tx,
            completed_rx,
            in_flight: HashMap::new(),
            events: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Start downloading `url` to `destination` (relative to the output
    /// root) unless that file already exists or is already downloading.
    pub fn enqueue_if_not_exists(&mut self, url: &str, destination: impl AsRef<Path>) -> EnqueueOutcome {
        let destination = self.resolve(destination.as_ref());
        if let Some(id) = self.in_flight.get(&destination) {
            return EnqueueOutcome::InFlight(*id);
        }
        if destination.exists() {
            debug!(path = %destination.display(), "asset already downloaded");
            return EnqueueOutcome::AlreadyExists;
        }

        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => return EnqueueOutcome::Refused(format!("unparsable URL {url:?}: {e}")),
        };
        if !matches!(parsed.scheme(), "file" | "http" | "https") {
            return EnqueueOutcome::Refused(format!("unsupported scheme {:?}", parsed.scheme()));
        }
        if let Some(parent) = destination.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return EnqueueOutcome::Refused(DatalibError::io(parent, e).to_string());
            }
        }

        let id = self.next_id;
        self.next_id += 1;

        if parsed.scheme() == "file" {
            let outcome = match parsed.to_file_path() {
                Ok(source) => match copy_local(&source, &destination) {
                    Ok(()) => DownloadOutcome::Success,
                    Err(e) => DownloadOutcome::Failure(e.to_string()),
                },
                Err(()) => DownloadOutcome::Failure(format!("{url} is not a local path")),
            };
            debug!(resource_id = id, %url, ?outcome, "copied local asset");
            self.events.push_back(DownloadEvent {
                resource_id: id,
                source_url: url.to_string(),
                destination,
                outcome,
            });
            return EnqueueOutcome::Enqueued(id);
        }

        self.in_flight.insert(destination.clone(), id);
        let task = DownloadTask {
            id,
            client: self.client.clone(),
            semaphore: Arc::clone(&self.semaphore),
            url: parsed,
            source_url: url.to_string(),
            destination,
        };
        let completed = self.completed_tx.clone();
        tokio::spawn(async move {
            let event = task.run().await;
            // The receiver lives as long as the downloader.
            let _ = completed.send(event);
        });
        EnqueueOutcome::Enqueued(id)
    }

    /// Collect every download that has finished so far. Never waits.
    ///
    /// Returns `true` if at least one completion was picked up.
    pub fn poll(&mut self) -> bool {
        self.drain_completed() > 0
    }

    /// Wait for at least one in-flight download to finish.
    ///
    /// Returns `false` without waiting when nothing is in flight.
    pub async fn wait_for_completion(&mut self) -> bool {
        if self.poll() {
            return true;
        }
        if self.in_flight.is_empty() {
            return false;
        }
        match self.completed_rx.recv().await {
            Some(event) => {
                self.complete(event);
                self.drain_completed();
                true
            }
            None => false,
        }
    }

    /// Take the oldest unread event.
    pub fn next_event(&mut self) -> Option<DownloadEvent> {
        self.drain_completed();
        self.events.pop_front()
    }

    pub fn queue_full(&self) -> bool {
        self.in_flight.len() >= self.max_concurrent
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.in_flight.is_empty()
    }

    fn drain_completed(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(event) = self.completed_rx.try_recv() {
            self.complete(event);
            drained += 1;
        }
        drained
    }

    fn complete(&mut self, event: DownloadEvent) {
        self.in_flight.remove(&event.destination);
        self.events.push_back(event);
    }

    fn resolve(&self, destination: &Path) -> PathBuf {
        let relative = destination.strip_prefix("/").unwrap_or(destination);
        self.output_root.join(relative)
    }
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

struct DownloadTask {
    id: ResourceId,
    client: Client,
    semaphore: Arc<Semaphore>,
    url: Url,
    source_url: String,
    destination: PathBuf,
}

impl DownloadTask {
    #[instrument(skip_all, fields(resource_id = self.id, url = %self.url))]
    async fn run(self) -> DownloadEvent {
        let partial = partial_path(&self.destination);
        let result = match self.semaphore.acquire().await {
            Ok(_permit) => self.fetch(&partial).await,
            Err(e) => Err(DatalibError::Network(format!("{}: {e}", self.url))),
        };
        let result = match result {
            Ok(()) => tokio::fs::rename(&partial, &self.destination)
                .await
                .map_err(|e| DatalibError::io(&self.destination, e)),
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(()) => {
                debug!(path = %self.destination.display(), "download finished");
                DownloadOutcome::Success
            }
            Err(e) => {
                warn!(error = %e, "download failed");
                let _ = tokio::fs::remove_file(&partial).await;
                DownloadOutcome::Failure(e.to_string())
            }
        };
        DownloadEvent {
            resource_id: self.id,
            source_url: self.source_url,
            destination: self.destination,
            outcome,
        }
    }

    async fn fetch(&self, partial: &Path) -> Result<()> {
        let url = &self.url;
        let mut response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| DatalibError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DatalibError::Network(format!("{url}: HTTP {status}")));
        }

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| DatalibError::io(partial, e))?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| DatalibError::Network(format!("{url}: body read failed: {e}")))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| DatalibError::io(partial, e))?;
        }
        file.flush().await.map_err(|e| DatalibError::io(partial, e))
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut path = destination.as_os_str().to_owned();
    path.push(".partial");
    PathBuf::from(path)
}

fn copy_local(source: &Path, destination: &Path) -> Result<()> {
    let partial = partial_path(destination);
    let copied = std::fs::copy(source, &partial)
        .map_err(|e| DatalibError::io(source, e))
        .and_then(|_| std::fs::rename(&partial, destination).map_err(|e| DatalibError::io(destination, e)));
    if copied.is_err() {
        let _ = std::fs::remove_file(&partial);
    }
    copied
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("datalib-{name}-{}", Uuid::now_v7()))
    }

    fn downloader(root: &Path, max_concurrent: usize) -> AttachmentDownloader {
        let config = DownloaderConfig {
            max_concurrent,
            timeout: Duration::from_secs(5),
            max_redirects: 3,
        };
        AttachmentDownloader::new(root, &config).unwrap()
    }

    async fn drain(downloader: &mut AttachmentDownloader) -> Vec<DownloadEvent> {
        while downloader.wait_for_completion().await {}
        std::iter::from_fn(|| downloader.next_event()).collect()
    }

    #[tokio::test]
    async fn downloads_once_per_destination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img/cat.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"meow".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let root = temp_root("dl-dedup");
        let mut dl = downloader(&root, 4);
        let url = format!("{}/img/cat.png", server.uri());

        assert_eq!(dl.enqueue_if_not_exists(&url, "/assets/cat.png"), EnqueueOutcome::Enqueued(0));
        assert_eq!(dl.enqueue_if_not_exists(&url, "assets/cat.png"), EnqueueOutcome::InFlight(0));
        assert!(dl.has_pending_requests());

        let events = drain(&mut dl).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].resource_id, 0);
        assert_eq!(events[0].source_url, url);
        assert!(events[0].is_success());

        let dest = root.join("assets/cat.png");
        assert_eq!(std::fs::read(&dest).unwrap(), b"meow");
        assert!(!partial_path(&dest).exists());

        // Existing files short-circuit without a request or an event.
        assert_eq!(dl.enqueue_if_not_exists(&url, "assets/cat.png"), EnqueueOutcome::AlreadyExists);
        assert!(!dl.has_pending_requests());
        assert!(dl.next_event().is_none());

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn failed_download_leaves_nothing_behind() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let root = temp_root("dl-404");
        let mut dl = downloader(&root, 2);
        dl.enqueue_if_not_exists(&format!("{}/missing.png", server.uri()), "missing.png");

        let events = drain(&mut dl).await;
        assert_eq!(events.len(), 1);
        match &events[0].outcome {
            DownloadOutcome::Failure(message) => assert!(message.contains("404"), "{message}"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!root.join("missing.png").exists());
        assert!(!root.join("missing.png.partial").exists());

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn redirects_report_the_original_resource() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old.jpg"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("Location", format!("{}/new.jpg", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg".to_vec()))
            .mount(&server)
            .await;

        let root = temp_root("dl-redirect");
        let mut dl = downloader(&root, 2);
        let url = format!("{}/old.jpg", server.uri());
        let EnqueueOutcome::Enqueued(id) = dl.enqueue_if_not_exists(&url, "a.jpg") else {
            panic!("expected a new download");
        };

        let events = drain(&mut dl).await;
        assert_eq!(events[0].resource_id, id);
        assert_eq!(events[0].source_url, url);
        assert!(events[0].is_success());
        assert_eq!(std::fs::read(root.join("a.jpg")).unwrap(), b"jpeg");

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn local_files_are_copied_immediately() {
        let root = temp_root("dl-local");
        let source_dir = root.join("source");
        std::fs::create_dir_all(&source_dir).unwrap();
        let source = source_dir.join("diagram.svg");
        std::fs::write(&source, "<svg/>").unwrap();
        let url = Url::from_file_path(&source).unwrap();

        let mut dl = downloader(&root.join("out"), 2);
        assert_eq!(dl.enqueue_if_not_exists(url.as_str(), "nested/d.svg"), EnqueueOutcome::Enqueued(0));
        assert!(!dl.has_pending_requests());

        let event = dl.next_event().unwrap();
        assert!(event.is_success());
        assert_eq!(event.destination, root.join("out/nested/d.svg"));
        assert_eq!(std::fs::read_to_string(&event.destination).unwrap(), "<svg/>");

        let missing = Url::from_file_path(source_dir.join("nope.svg")).unwrap();
        dl.enqueue_if_not_exists(missing.as_str(), "nope.svg");
        assert!(matches!(dl.next_event().unwrap().outcome, DownloadOutcome::Failure(_)));
        assert!(!root.join("out/nope.svg.partial").exists());

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn refuses_what_it_cannot_fetch() {
        let root = temp_root("dl-refused");
        let mut dl = downloader(&root, 2);
        assert!(matches!(
            dl.enqueue_if_not_exists("ftp://files.example/a.png", "a.png"),
            EnqueueOutcome::Refused(_)
        ));
        assert!(matches!(dl.enqueue_if_not_exists("not a url", "b.png"), EnqueueOutcome::Refused(_)));
        assert!(dl.next_event().is_none());

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn poll_returns_immediately_while_downloads_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slow".to_vec())
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let root = temp_root("dl-poll");
        let mut dl = downloader(&root, 2);
        dl.enqueue_if_not_exists(&format!("{}/slow.png", server.uri()), "slow.png");

        let started = std::time::Instant::now();
        assert!(!dl.poll());
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(dl.next_event().is_none());
        assert!(dl.has_pending_requests());

        assert!(dl.wait_for_completion().await);
        assert!(dl.next_event().unwrap().is_success());
        assert!(!dl.has_pending_requests());
        assert!(!dl.poll());

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn queue_fills_at_the_concurrency_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .mount(&server)
            .await;

        let root = temp_root("dl-full");
        let mut dl = downloader(&root, 2);
        dl.enqueue_if_not_exists(&format!("{}/1.png", server.uri()), "1.png");
        assert!(!dl.queue_full());
        dl.enqueue_if_not_exists(&format!("{}/2.png", server.uri()), "2.png");
        assert!(dl.queue_full());

        let events = drain(&mut dl).await;
        assert_eq!(events.len(), 2);
        assert!(!dl.queue_full());
        assert!(!dl.wait_for_completion().await);

        std::fs::remove_dir_all(&root).ok();
    }
}
