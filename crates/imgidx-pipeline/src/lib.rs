//! imgidx Pipeline - Download and index stages
//!
//! ```text
//! URL list -> loader -> downloader pool -> ingestion channel -> index writer -> vector store
//!                                                                   ^
//!                                                  bootstrapper ----+ (before consuming)
//! ```
//!
//! Stages share no state besides the explicit clients handed to them.
//!
//! Author: hephaex@gmail.com

pub mod bootstrap;
pub mod downloader;
pub mod indexer;
pub mod loader;

pub use bootstrap::{BootstrapOutcome, CollectionBootstrapper};
pub use downloader::{DownloadOutcome, DownloadReport, Downloader};
pub use indexer::{DeliveryState, IndexReport, IndexWriter, RetryPolicy};
pub use loader::{load_urls, parse_urls};
