//! End-to-end pipeline tests
//!
//! A local axum server hosts the images and another one plays the embedding
//! service, deriving each vector from the bytes of the file it is asked about.
//! The channel and the vector store are the in-memory implementations.

use std::io::Cursor;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use imgidx_core::{stable_id, CollectionPolicy, CollectionSchema, DistanceMetric};
use imgidx_pipeline::{
    parse_urls, CollectionBootstrapper, DownloadReport, Downloader, IndexReport, IndexWriter,
    RetryPolicy,
};
use imgidx_queue::{IngestionChannel, MemoryChannel};
use imgidx_vector::{EmbeddingClient, HttpEmbeddingClient, MemoryVectorStore, VectorStore};
use indicatif::ProgressBar;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const DIM: usize = 4;

type ImageBytes = Arc<RwLock<Vec<u8>>>;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Image host answering every `/img/{name}` with the current bytes
async fn spawn_image_host(bytes: ImageBytes) -> String {
    async fn image(
        State(bytes): State<ImageBytes>,
        UrlPath(_name): UrlPath<String>,
    ) -> Vec<u8> {
        bytes.read().unwrap().clone()
    }

    serve(Router::new().route("/img/:name", get(image)).with_state(bytes)).await
}

/// Embedding service whose vectors depend on the file content
async fn spawn_embedder() -> String {
    async fn embed(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        let Some(path) = body.get("image_path").and_then(Value::as_str) else {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": "no image_path"})));
        };
        let Ok(bytes) = tokio::fs::read(path).await else {
            return (StatusCode::NOT_FOUND, Json(json!({"error": "no such file"})));
        };
        let sum: u32 = bytes.iter().map(|b| u32::from(*b)).sum();
        let embedding = vec![
            1.0,
            bytes.len() as f32,
            f32::from(bytes.first().copied().unwrap_or(0)),
            (sum % 97) as f32,
        ];
        (StatusCode::OK, Json(json!({ "embedding": embedding })))
    }

    serve(Router::new().route("/embed", post(embed))).await
}

/// Embedding service that is always down
async fn spawn_broken_embedder() -> String {
    async fn embed() -> (StatusCode, &'static str) {
        (StatusCode::SERVICE_UNAVAILABLE, "model not loaded")
    }

    serve(Router::new().route("/embed", post(embed))).await
}

/// Warn-and-above log lines captured while the guard is alive
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

struct Harness {
    dir: tempfile::TempDir,
    store: Arc<MemoryVectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    policy: RetryPolicy,
}

impl Harness {
    async fn new(embedder_url: &str, max_attempts: u32) -> Self {
        let embedder =
            HttpEmbeddingClient::new(embedder_url, DIM, Duration::from_secs(5)).unwrap();
        Self {
            dir: tempfile::tempdir().unwrap(),
            store: Arc::new(MemoryVectorStore::new("images")),
            embedder: Arc::new(embedder),
            policy: RetryPolicy {
                max_attempts,
                backoff_base: Duration::from_millis(1),
            },
        }
    }

    /// One full run over `input` with a fresh channel, as a restarted process would
    async fn run(&self, input: &str) -> (DownloadReport, IndexReport, Arc<MemoryChannel>) {
        let schema = CollectionSchema::new(DIM as u64, DistanceMetric::Cosine);
        CollectionBootstrapper::new(self.store.clone(), schema)
            .ensure(CollectionPolicy::CreateIfAbsent)
            .await
            .unwrap();

        let channel = Arc::new(MemoryChannel::new());
        let urls = parse_urls(Cursor::new(input)).unwrap();
        let downloader =
            Downloader::new(self.dir.path(), channel.clone(), 4, Duration::from_secs(5)).unwrap();
        let downloads = downloader
            .run(urls, &CancellationToken::new(), &ProgressBar::hidden())
            .await;
        channel.close().await.unwrap();

        let writer = self.writer(channel.clone());
        let indexed = writer.run(2, &CancellationToken::new()).await.unwrap();
        (downloads, indexed, channel)
    }

    fn writer(&self, channel: Arc<MemoryChannel>) -> IndexWriter {
        IndexWriter::new(channel, self.embedder.clone(), self.store.clone(), self.policy)
    }

    fn files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

#[tokio::test]
async fn test_png_indexed_and_bmp_rejected() {
    let host = spawn_image_host(Arc::new(RwLock::new(b"png-bytes".to_vec()))).await;
    let harness = Harness::new(&spawn_embedder().await, 3).await;

    let png = format!("{host}/img/cat.png");
    let bmp = format!("{host}/img/cat.bmp");
    let (logs, _guard) = LogBuffer::capture();
    let (downloads, indexed, _) = harness.run(&format!("{png}\n{bmp}\n")).await;

    let rejected = logs.lines_naming(&bmp);
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].contains("WARN"));
    assert!(logs.lines_naming(&png).is_empty());

    assert_eq!(downloads.published, 1);
    assert_eq!(downloads.rejected, vec![bmp.clone()]);
    assert_eq!(harness.files(), vec![format!("{}.png", stable_id(&png))]);
    assert_eq!(indexed.acked, 1);
    assert_eq!(harness.store.count().await.unwrap(), 1);
    assert!(harness.store.get(stable_id(&png)).await.unwrap().is_some());
    assert!(harness.store.get(stable_id(&bmp)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_urls_index_once() {
    let host = spawn_image_host(Arc::new(RwLock::new(b"gif-bytes".to_vec()))).await;
    let harness = Harness::new(&spawn_embedder().await, 3).await;

    let url = format!("{host}/img/dog.gif");
    let (downloads, indexed, _) = harness.run(&format!("{url}\n\n{url}\n  {url}  \n")).await;

    assert_eq!(downloads.total, 1);
    assert_eq!(indexed.acked, 1);
    assert_eq!(harness.files().len(), 1);
    assert_eq!(harness.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let host = spawn_image_host(Arc::new(RwLock::new(b"jpeg-bytes".to_vec()))).await;
    let harness = Harness::new(&spawn_embedder().await, 3).await;

    let input = format!("{host}/img/a.jpg\n{host}/img/b.webp\n");
    harness.run(&input).await;
    let first_files = harness.files();
    let (_, indexed, _) = harness.run(&input).await;

    assert_eq!(indexed.acked, 2);
    assert_eq!(harness.files(), first_files);
    assert_eq!(harness.store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_changed_image_overwrites_record() {
    let bytes: ImageBytes = Arc::new(RwLock::new(b"first version".to_vec()));
    let host = spawn_image_host(bytes.clone()).await;
    let harness = Harness::new(&spawn_embedder().await, 3).await;

    let url = format!("{host}/img/photo.png");
    let id = stable_id(&url);

    harness.run(&url).await;
    let before = harness.store.record(id).await.unwrap();

    *bytes.write().unwrap() = b"second, longer version".to_vec();
    harness.run(&url).await;
    let after = harness.store.record(id).await.unwrap();

    assert_eq!(harness.store.count().await.unwrap(), 1);
    assert_ne!(before.vector, after.vector);
    assert_eq!(after.vector[1], b"second, longer version".len() as f32);
    assert_eq!(after.payload, before.payload);
}

#[tokio::test]
async fn test_redelivery_after_crash_does_not_duplicate() {
    let host = spawn_image_host(Arc::new(RwLock::new(b"heic-bytes".to_vec()))).await;
    let harness = Harness::new(&spawn_embedder().await, 3).await;
    harness.run("").await;

    let channel = Arc::new(MemoryChannel::new());
    let url = format!("{host}/img/x.heic");
    let downloader =
        Downloader::new(harness.dir.path(), channel.clone(), 1, Duration::from_secs(5)).unwrap();
    downloader.process(&url).await;

    // Index but crash before the ack
    let writer = harness.writer(channel.clone());
    let delivery = channel.receive().await.unwrap().unwrap();
    writer.index(&delivery.decode().unwrap()).await.unwrap();
    assert_eq!(channel.acked_count(), 0);

    channel.recover();
    channel.close().await.unwrap();
    let report = writer.run(1, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.acked, 1);
    assert_eq!(channel.acked_count(), 1);
    assert_eq!(channel.unacked_len(), 0);
    assert_eq!(harness.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_unavailable_embedder_dead_letters_after_retries() {
    let host = spawn_image_host(Arc::new(RwLock::new(b"png".to_vec()))).await;
    let harness = Harness::new(&spawn_broken_embedder().await, 3).await;

    let url = format!("{host}/img/lost.png");
    let (downloads, indexed, channel) = harness.run(&url).await;

    assert_eq!(downloads.published, 1);
    assert_eq!(indexed.acked, 0);
    assert_eq!(indexed.retried, 2);
    assert_eq!(indexed.dead_lettered, 1);

    let dead = channel.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt, 3);
    assert!(dead[0].reason.contains("503"));
    assert_eq!(harness.store.count().await.unwrap(), 0);
    // The image stays on disk for a later re-run
    assert_eq!(harness.files().len(), 1);
}
