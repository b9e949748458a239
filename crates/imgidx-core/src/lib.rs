//! imgidx Core - Domain models, errors, and shared types
//!
//! This crate defines the core abstractions used throughout the ingestion pipeline:
//! - Stable URL identity (file names and vector ids)
//! - Image format allow-list
//! - Ingestion channel wire message
//! - Vector records and collection schema
//! - Common error types
//! - Configuration management
//!
//! Author: hephaex@gmail.com

pub mod config;

pub use config::{
    AppConfig, BrokerConfig, ConfigError, EmbeddingConfig, InputConfig, LoggingConfig,
    PipelineConfig, StorageConfig, VectorConfig,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Error taxonomy for the ingestion pipeline
#[derive(Error, Debug)]
pub enum ImgIdxError {
    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Persist error: {0}")]
    Persist(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ImgIdxError {
    /// Whether this error must stop the process instead of failing a single item
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SchemaMismatch(_) | Self::Config(_))
    }
}

impl From<ConfigError> for ImgIdxError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ImgIdxError>;

// ============================================================================
// Stable Identity
// ============================================================================

/// Deterministic identity of a source URL.
///
/// UUID v5 in the URL namespace over the raw URL bytes. The same string
/// always maps to the same id; no normalization is applied, so textual
/// variants of one resource are distinct.
pub fn stable_id(src_url: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, src_url.as_bytes())
}

/// File name under which the bytes of `src_url` are persisted
pub fn image_filename(src_url: &str, format: ImageFormat) -> String {
    format!("{}.{}", stable_id(src_url), format.extension())
}

// ============================================================================
// Image Formats
// ============================================================================

/// Image formats accepted by the download stage.
///
/// Gating is done on the URL path extension only; content is never sniffed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpg,
    Jpeg,
    Png,
    Gif,
    Webp,
    Heic,
    Heif,
}

impl ImageFormat {
    /// All accepted formats
    pub const ALL: [ImageFormat; 7] = [
        Self::Jpg,
        Self::Jpeg,
        Self::Png,
        Self::Gif,
        Self::Webp,
        Self::Heic,
        Self::Heif,
    ];

    /// Canonical extension without the leading dot
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpg => "jpg",
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Heic => "heic",
            Self::Heif => "heif",
        }
    }

    /// Look up a format by extension (case-insensitive, leading dot optional)
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.strip_prefix('.').unwrap_or(ext).to_ascii_lowercase();
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }

    /// Derive the format from the last path segment of a URL.
    ///
    /// Query string and fragment never contribute to the extension.
    pub fn from_url(src_url: &str) -> Result<Self> {
        let parsed = Url::parse(src_url)
            .map_err(|e| ImgIdxError::Fetch(format!("invalid url {src_url}: {e}")))?;

        let segment = parsed
            .path_segments()
            .and_then(|segments| segments.last())
            .unwrap_or_default();

        let ext = match segment.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext,
            _ => {
                return Err(ImgIdxError::UnsupportedFormat(format!(
                    "no file extension in {src_url}"
                )))
            }
        };

        Self::from_extension(ext)
            .ok_or_else(|| ImgIdxError::UnsupportedFormat(format!(".{ext} ({src_url})")))
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

// ============================================================================
// Ingestion Message
// ============================================================================

/// Wire payload carried between the download and indexing stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionMessage {
    /// URL the image was fetched from
    pub src_url: String,

    /// Location of the persisted bytes
    pub path: String,
}

impl IngestionMessage {
    /// Create a new message
    pub fn new(src_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            src_url: src_url.into(),
            path: path.into(),
        }
    }

    /// Encode as the JSON body published on the channel
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ImgIdxError::InvalidMessage(e.to_string()))
    }

    /// Decode a JSON body received from the channel
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| ImgIdxError::InvalidMessage(e.to_string()))
    }

    /// Vector id this message resolves to
    pub fn record_id(&self) -> Uuid {
        stable_id(&self.src_url)
    }
}

// ============================================================================
// Vector Records
// ============================================================================

/// Payload stored next to each vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub path: String,
    pub src_url: String,
}

/// A point in the image collection
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    /// `stable_id(src_url)`
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: RecordPayload,
}

impl VectorRecord {
    /// Build the record for an ingestion message and its embedding
    pub fn from_message(message: &IngestionMessage, vector: Vec<f32>) -> Self {
        Self {
            id: message.record_id(),
            vector,
            payload: RecordPayload {
                path: message.path.clone(),
                src_url: message.src_url.clone(),
            },
        }
    }
}

/// A record returned by a similarity query
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub id: Uuid,
    pub score: f32,
    pub payload: RecordPayload,
}

// ============================================================================
// Collection Schema
// ============================================================================

/// Distance metric of a vector collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Dot,
    Euclid,
    Manhattan,
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cosine => write!(f, "cosine"),
            Self::Dot => write!(f, "dot"),
            Self::Euclid => write!(f, "euclid"),
            Self::Manhattan => write!(f, "manhattan"),
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "dot" => Ok(Self::Dot),
            "euclid" | "euclidean" => Ok(Self::Euclid),
            "manhattan" => Ok(Self::Manhattan),
            _ => Err(ConfigError::InvalidValue {
                key: "distance".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Vector size and metric fixed when the collection is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub dimension: u64,
    pub distance: DistanceMetric,
}

impl CollectionSchema {
    pub fn new(dimension: u64, distance: DistanceMetric) -> Self {
        Self {
            dimension,
            distance,
        }
    }

    /// Fail with `SchemaMismatch` unless `other` matches this schema
    pub fn ensure_matches(&self, other: &CollectionSchema) -> Result<()> {
        if self != other {
            return Err(ImgIdxError::SchemaMismatch(format!(
                "expected {} dims / {}, found {} dims / {}",
                self.dimension, self.distance, other.dimension, other.distance
            )));
        }
        Ok(())
    }

    /// Fail with `SchemaMismatch` unless `vector` has the collection's dimension
    pub fn ensure_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() as u64 != self.dimension {
            return Err(ImgIdxError::SchemaMismatch(format!(
                "vector has {} dims, collection expects {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }
}

/// What the bootstrapper does with an existing collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectionPolicy {
    /// Keep existing data; create only when missing
    #[default]
    CreateIfAbsent,
    /// Drop and recreate on every start, wiping prior data
    Recreate,
}

impl std::fmt::Display for CollectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateIfAbsent => write!(f, "create-if-absent"),
            Self::Recreate => write!(f, "recreate"),
        }
    }
}

impl std::str::FromStr for CollectionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create-if-absent" | "create_if_absent" => Ok(Self::CreateIfAbsent),
            "recreate" => Ok(Self::Recreate),
            _ => Err(ConfigError::InvalidValue {
                key: "COLLECTION_POLICY".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
