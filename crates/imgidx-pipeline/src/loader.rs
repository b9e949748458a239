//! URL list loader
//!
//! Reads newline-separated URLs, drops blank lines and exact duplicates.
//! First-occurrence order is kept so runs are reproducible in logs.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use imgidx_core::{ImgIdxError, Result};

/// Load and deduplicate the URL list at `path`
pub fn load_urls(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|e| {
        ImgIdxError::Config(format!("Cannot open URL list {}: {e}", path.display()))
    })?;
    parse_urls(BufReader::new(file))
}

/// Deduplicate URLs from any line-oriented source.
///
/// Lines are trimmed; no URL syntax validation happens here.
pub fn parse_urls<R: BufRead>(reader: R) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for line in reader.lines() {
        let line = line.map_err(|e| ImgIdxError::Config(format!("Cannot read URL list: {e}")))?;
        let url = line.trim();
        if url.is_empty() {
            continue;
        }
        if seen.insert(url.to_string()) {
            urls.push(url.to_string());
        }
    }

    Ok(urls)
}
