//! Download stage
//!
//! Each URL goes through: extension gate -> HTTP fetch -> atomic write ->
//! publish. Failures are logged and the URL is dropped (at-most-once, no
//! retry). A bounded pool keeps the number of in-flight downloads, open
//! sockets and buffered bodies fixed regardless of list size.
//!
//! Author: hephaex@gmail.com

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use imgidx_core::{image_filename, AppConfig, ImageFormat, ImgIdxError, IngestionMessage, Result};
use imgidx_queue::IngestionChannel;
use indicatif::ProgressBar;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const USER_AGENT: &str = concat!("imgidx/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Outcomes
// ============================================================================

/// What happened to one URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Persisted and handed to the index stage
    Published(IngestionMessage),
    /// Persisted but the publish failed; the file stays on disk
    Orphaned { path: String, error: String },
    /// Extension not in the allow-list; nothing fetched
    Rejected { error: String },
    /// Fetch or write failed
    Failed { error: String },
}

/// Summary of a download run
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    /// URLs handed to the run
    pub total: usize,
    pub published: usize,
    pub orphaned: Vec<String>,
    pub rejected: Vec<String>,
    pub failed: Vec<String>,
    /// URLs never started because shutdown was requested
    pub skipped: usize,
}

impl DownloadReport {
    fn record(&mut self, url: String, outcome: DownloadOutcome) {
        match outcome {
            DownloadOutcome::Published(_) => self.published += 1,
            DownloadOutcome::Orphaned { .. } => self.orphaned.push(url),
            DownloadOutcome::Rejected { .. } => self.rejected.push(url),
            DownloadOutcome::Failed { .. } => self.failed.push(url),
        }
    }
}

// ============================================================================
// Downloader
// ============================================================================

/// Bounded pool of download workers publishing to the ingestion channel
pub struct Downloader {
    client: Client,
    output_dir: PathBuf,
    channel: Arc<dyn IngestionChannel>,
    concurrency: usize,
}

impl Downloader {
    /// Create a downloader writing into `output_dir` (created if missing)
    pub fn new(
        output_dir: impl AsRef<Path>,
        channel: Arc<dyn IngestionChannel>,
        concurrency: usize,
        fetch_timeout: Duration,
    ) -> Result<Self> {
        let output_dir = output_dir.as_ref();
        std::fs::create_dir_all(output_dir).map_err(|e| {
            ImgIdxError::Persist(format!("Cannot create {}: {e}", output_dir.display()))
        })?;
        // Absolute paths so the embedding service can open them from anywhere
        let output_dir = output_dir.canonicalize().map_err(|e| {
            ImgIdxError::Persist(format!("Cannot resolve {}: {e}", output_dir.display()))
        })?;

        let client = Client::builder()
            .timeout(fetch_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ImgIdxError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            output_dir,
            channel,
            concurrency: concurrency.max(1),
        })
    }

    /// Create from config
    pub fn from_config(config: &AppConfig, channel: Arc<dyn IngestionChannel>) -> Result<Self> {
        Self::new(
            &config.storage.output_dir,
            channel,
            config.pipeline.download_concurrency,
            Duration::from_secs(config.pipeline.fetch_timeout_secs),
        )
    }

    /// Absolute directory images are written to
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Validate, fetch and persist one URL, returning the message to publish
    pub async fn fetch_and_persist(&self, url: &str) -> Result<IngestionMessage> {
        // Gate before any network I/O so rejected URLs are never fetched
        let format = ImageFormat::from_url(url)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ImgIdxError::Fetch(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImgIdxError::Fetch(format!("{url} returned {status}")));
        }

        let path = self.output_dir.join(image_filename(url, format));
        persist(&path, response.bytes_stream()).await?;

        Ok(IngestionMessage::new(url, path.to_string_lossy()))
    }

    /// Run one URL through the whole stage; never fails, only reports
    pub async fn process(&self, url: &str) -> DownloadOutcome {
        let message = match self.fetch_and_persist(url).await {
            Ok(message) => message,
            Err(e @ ImgIdxError::UnsupportedFormat(_)) => {
                tracing::warn!(url, error = %e, "Rejected URL");
                return DownloadOutcome::Rejected {
                    error: e.to_string(),
                };
            }
            Err(e) => {
                tracing::error!(url, error = %e, "Failed to download");
                return DownloadOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        match self.channel.publish(&message).await {
            Ok(()) => {
                tracing::debug!(url, path = %message.path, "Queued for indexing");
                DownloadOutcome::Published(message)
            }
            Err(e) => {
                tracing::error!(
                    url,
                    path = %message.path,
                    error = %e,
                    "Failed to send to indexing queue, file left on disk"
                );
                DownloadOutcome::Orphaned {
                    path: message.path,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Download every URL with at most `concurrency` in flight.
    ///
    /// Cancelling `shutdown` stops new URLs from starting; in-flight ones finish.
    pub async fn run(
        &self,
        urls: Vec<String>,
        shutdown: &CancellationToken,
        progress: &ProgressBar,
    ) -> DownloadReport {
        let mut report = DownloadReport {
            total: urls.len(),
            ..Default::default()
        };

        let outcomes: Vec<(String, DownloadOutcome)> = stream::iter(urls)
            .take_until(shutdown.cancelled())
            .map(|url| async move {
                let outcome = self.process(&url).await;
                progress.inc(1);
                (url, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        report.skipped = report.total - outcomes.len();
        for (url, outcome) in outcomes {
            report.record(url, outcome);
        }

        tracing::info!(
            total = report.total,
            published = report.published,
            orphaned = report.orphaned.len(),
            rejected = report.rejected.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            output_dir = %self.output_dir.display(),
            "Download run finished"
        );

        report
    }
}

/// Stream `body` to `path` atomically: temp file in the same directory, then rename.
///
/// A body that breaks off mid-transfer is a `Fetch` error; the temp file is
/// removed either way, so a partial image is never visible under `path`.
async fn persist<S, B, E>(path: &Path, body: S) -> Result<()>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.{}.part", Uuid::new_v4().simple()));

    let result = write_then_rename(&temp_path, path, body).await;
    if result.is_err() {
        // Clean up temp file on error
        let _ = tokio::fs::remove_file(&temp_path).await;
    }
    result
}

async fn write_then_rename<S, B, E>(temp_path: &Path, path: &Path, body: S) -> Result<()>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let persist_err = |e: std::io::Error| ImgIdxError::Persist(format!("{}: {e}", path.display()));

    let mut file = tokio::fs::File::create(temp_path).await.map_err(persist_err)?;
    futures::pin_mut!(body);
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| {
            ImgIdxError::Fetch(format!("{}: body read failed: {e}", path.display()))
        })?;
        file.write_all(chunk.as_ref()).await.map_err(persist_err)?;
    }
    file.flush().await.map_err(persist_err)?;
    drop(file);

    tokio::fs::rename(temp_path, path).await.map_err(persist_err)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path as UrlPath, http::StatusCode, routing::get, Router};
    use imgidx_core::stable_id;
    use imgidx_queue::MemoryChannel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake-png";

    async fn spawn_host(hits: Arc<AtomicUsize>) -> String {
        let router = Router::new().route(
            "/img/:name",
            get(move |UrlPath(name): UrlPath<String>| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if name.starts_with("missing") {
                        Err(StatusCode::NOT_FOUND)
                    } else {
                        Ok(PNG_BYTES.to_vec())
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn body(
        chunks: Vec<std::io::Result<&'static [u8]>>,
    ) -> impl Stream<Item = std::io::Result<&'static [u8]>> {
        stream::iter(chunks)
    }

    /// Formatted warn-and-above events written while the guard is alive
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn capture() -> (Self, tracing::subscriber::DefaultGuard) {
            let buffer = Self::default();
            let writer = buffer.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .with_max_level(tracing::Level::WARN)
                .finish();
            (buffer, tracing::subscriber::set_default(subscriber))
        }

        fn lines_naming(&self, needle: &str) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .lines()
                .filter(|line| line.contains(needle))
                .map(str::to_string)
                .collect()
        }
    }

    fn downloader(dir: &Path, channel: Arc<MemoryChannel>) -> Downloader {
        Downloader::new(dir, channel, 4, Duration::from_secs(5)).unwrap()
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_download_persists_and_publishes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_host(hits.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(MemoryChannel::new());
        let downloader = downloader(dir.path(), channel.clone());

        let url = format!("{base}/img/cat.png");
        let outcome = downloader.process(&url).await;

        let expected_path = downloader
            .output_dir()
            .join(format!("{}.png", stable_id(&url)));
        assert_eq!(
            outcome,
            DownloadOutcome::Published(IngestionMessage::new(
                url.clone(),
                expected_path.to_string_lossy()
            ))
        );
        assert_eq!(std::fs::read(&expected_path).unwrap(), PNG_BYTES);
        assert_eq!(channel.ready_messages().len(), 1);
        assert_eq!(channel.ready_messages()[0].src_url, url);
    }

    #[tokio::test]
    async fn test_unsupported_format_is_never_fetched() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_host(hits.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(MemoryChannel::new());
        let downloader = downloader(dir.path(), channel.clone());

        let outcome = downloader.process(&format!("{base}/img/cat.bmp")).await;

        assert!(matches!(outcome, DownloadOutcome::Rejected { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(files_in(dir.path()).is_empty());
        assert_eq!(channel.ready_len(), 0);
    }

    #[tokio::test]
    async fn test_http_error_is_fetch_failure() {
        let base = spawn_host(Arc::new(AtomicUsize::new(0))).await;
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(MemoryChannel::new());
        let downloader = downloader(dir.path(), channel.clone());

        let err = downloader
            .fetch_and_persist(&format!("{base}/img/missing.jpg"))
            .await
            .unwrap_err();

        assert!(matches!(err, ImgIdxError::Fetch(_)));
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_orphan() {
        let base = spawn_host(Arc::new(AtomicUsize::new(0))).await;
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(MemoryChannel::new());
        channel.close().await.unwrap();
        let downloader = downloader(dir.path(), channel.clone());

        let outcome = downloader.process(&format!("{base}/img/dog.gif")).await;

        let DownloadOutcome::Orphaned { path, .. } = outcome else {
            panic!("expected orphaned outcome, got {outcome:?}");
        };
        assert!(Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_redownload_overwrites_same_file() {
        let base = spawn_host(Arc::new(AtomicUsize::new(0))).await;
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(MemoryChannel::new());
        let downloader = downloader(dir.path(), channel.clone());

        let url = format!("{base}/img/cat.webp");
        let first = downloader.fetch_and_persist(&url).await.unwrap();
        let second = downloader.fetch_and_persist(&url).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(files_in(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_run_reports_each_outcome() {
        let base = spawn_host(Arc::new(AtomicUsize::new(0))).await;
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(MemoryChannel::new());
        let downloader = downloader(dir.path(), channel.clone());
        let (logs, _guard) = LogBuffer::capture();

        let urls = vec![
            format!("{base}/img/a.png"),
            format!("{base}/img/b.jpeg"),
            format!("{base}/img/c.bmp"),
            format!("{base}/img/missing.png"),
        ];
        let report = downloader
            .run(urls, &CancellationToken::new(), &ProgressBar::hidden())
            .await;

        assert_eq!(report.total, 4);
        assert_eq!(report.published, 2);
        assert_eq!(report.rejected, vec![format!("{base}/img/c.bmp")]);
        assert_eq!(report.failed, vec![format!("{base}/img/missing.png")]);
        assert_eq!(report.skipped, 0);
        assert_eq!(files_in(dir.path()).len(), 2);

        let rejected = logs.lines_naming(&format!("{base}/img/c.bmp"));
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].contains("WARN"));
        let failed = logs.lines_naming(&format!("{base}/img/missing.png"));
        assert_eq!(failed.len(), 1);
        assert!(failed[0].contains("ERROR"));
        assert!(logs.lines_naming(&format!("{base}/img/a.png")).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_host(hits.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let downloader = downloader(dir.path(), Arc::new(MemoryChannel::new()));

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let report = downloader
            .run(
                vec![format!("{base}/img/a.png")],
                &shutdown,
                &ProgressBar::hidden(),
            )
            .await;

        assert_eq!(report.skipped, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_persist_failure_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // Target is an existing directory, so the rename fails
        let target = dir.path().join("taken.png");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), b"x").unwrap();

        let err = persist(&target, body(vec![Ok(PNG_BYTES)])).await.unwrap_err();
        assert!(matches!(err, ImgIdxError::Persist(_)));
        assert_eq!(files_in(dir.path()), vec!["taken.png"]);
    }

    #[tokio::test]
    async fn test_truncated_body_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cut.png");
        let chunks = vec![
            Ok(&PNG_BYTES[..4]),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];

        let err = persist(&target, body(chunks)).await.unwrap_err();

        assert!(matches!(err, ImgIdxError::Fetch(_)));
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_chunked_body_is_written_whole() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("whole.png");
        let chunks = vec![Ok(&PNG_BYTES[..3]), Ok(&PNG_BYTES[3..])];

        persist(&target, body(chunks)).await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), PNG_BYTES);
        assert_eq!(files_in(dir.path()), vec!["whole.png"]);
    }
}
