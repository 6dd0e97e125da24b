//! Two-namespace on-disk conversion cache.
//!
//! ```text
//! <root>/
//!   runs/<run_id>.md      + runs/<run_id>.json
//!   content/<sha256>.md   + content/<sha256>.json
//! ```
//!
//! * **run-scoped**: "what did run X produce?" Keyed by [`RunId`].
//! * **content-scoped**: "have we converted these exact bytes before?" Keyed
//!   by the SHA-256 of the file, so renames and duplicates hit.
//!
//! Each entry is a payload file plus a JSON sidecar. The payload is written
//! first, the sidecar last; a payload without a sidecar is not an entry.
//! Both files go through a temp file + rename in the same directory.
//! Entries are write-once: storing over an existing sidecar is a no-op.
//!
//! The cache never fails a conversion. Every read or write problem is logged
//! at WARN and reported as a miss / skipped store.

use crate::config::ConversionConfig;
use crate::output::{is_safe_key, FormatTag, MarkdownResult, RunId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// SHA-256 of the file's bytes, lowercase hex. Streams; never loads the file.
pub fn content_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Key space of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Run,
    Content,
}

impl Namespace {
    fn dir_name(&self) -> &'static str {
        match self {
            Namespace::Run => "runs",
            Namespace::Content => "content",
        }
    }
}

/// Metadata stored next to each payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    source_path: PathBuf,
    source_format: FormatTag,
    run_id: RunId,
    /// Payload size in bytes; a mismatch marks the entry as corrupt.
    content_bytes: usize,
}

#[derive(Debug, Error)]
enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed sidecar: {0}")]
    Sidecar(#[from] serde_json::Error),

    #[error("payload is {actual} bytes, sidecar says {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Handle to the cache root. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConversionCache {
    root: PathBuf,
    enabled: bool,
}

impl ConversionCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            enabled: true,
        }
    }

    /// A cache that never hits and never writes.
    pub fn disabled() -> Self {
        Self {
            root: PathBuf::new(),
            enabled: false,
        }
    }

    pub fn from_config(config: &ConversionConfig) -> Self {
        if config.cache_enabled {
            Self::new(&config.cache_dir)
        } else {
            Self::disabled()
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // ── Public lookups / stores ──────────────────────────────────────────

    /// Look up by content hash. The returned `run_id` is the one that
    /// produced the entry; callers re-stamp it.
    pub fn lookup_content(&self, hash: &str) -> Option<MarkdownResult> {
        self.lookup(Namespace::Content, hash)
    }

    /// Recall exactly what `run_id` produced.
    pub fn lookup_run(&self, run_id: &RunId) -> Option<MarkdownResult> {
        self.lookup(Namespace::Run, run_id.as_str())
    }

    pub fn store_content(&self, hash: &str, result: &MarkdownResult) {
        self.store(Namespace::Content, hash, result);
    }

    /// Store under the result's own run id; skipped when it is empty or not
    /// usable as a file name.
    pub fn store_run(&self, result: &MarkdownResult) {
        if result.run_id.as_str().is_empty() {
            debug!("No run id, skipping run-scoped cache store");
            return;
        }
        self.store(Namespace::Run, result.run_id.as_str(), result);
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn paths(&self, ns: Namespace, key: &str) -> (PathBuf, PathBuf) {
        let dir = self.root.join(ns.dir_name());
        (dir.join(format!("{key}.md")), dir.join(format!("{key}.json")))
    }

    fn lookup(&self, ns: Namespace, key: &str) -> Option<MarkdownResult> {
        if !self.enabled {
            return None;
        }
        if !is_safe_key(key) {
            warn!(namespace = ns.dir_name(), key, "Rejected unsafe cache key");
            return None;
        }
        let (payload, sidecar) = self.paths(ns, key);
        if !sidecar.is_file() || !payload.is_file() {
            debug!(namespace = ns.dir_name(), key, "Cache miss");
            return None;
        }
        match read_entry(&payload, &sidecar) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(
                    namespace = ns.dir_name(),
                    key,
                    error = %e,
                    "Failed to read cache entry, treating as miss"
                );
                None
            }
        }
    }

    fn store(&self, ns: Namespace, key: &str, result: &MarkdownResult) {
        if !self.enabled {
            return;
        }
        if !is_safe_key(key) {
            warn!(namespace = ns.dir_name(), key, "Rejected unsafe cache key, skipping store");
            return;
        }
        let (payload, sidecar) = self.paths(ns, key);
        if sidecar.exists() {
            debug!(namespace = ns.dir_name(), key, "Cache entry already present");
            return;
        }
        if let Err(e) = write_entry(&payload, &sidecar, result) {
            warn!(
                namespace = ns.dir_name(),
                key,
                error = %e,
                "Failed to save cache entry"
            );
        }
    }
}

fn read_entry(payload: &Path, sidecar: &Path) -> Result<MarkdownResult, CacheError> {
    let meta: Sidecar = serde_json::from_slice(&fs::read(sidecar)?)?;
    let content = fs::read_to_string(payload)?;
    if content.len() != meta.content_bytes {
        return Err(CacheError::LengthMismatch {
            expected: meta.content_bytes,
            actual: content.len(),
        });
    }
    Ok(MarkdownResult {
        content,
        source_path: meta.source_path,
        source_format: meta.source_format,
        run_id: meta.run_id,
    })
}

fn write_entry(payload: &Path, sidecar: &Path, result: &MarkdownResult) -> Result<(), CacheError> {
    let dir = payload
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cache path has no parent"))?;
    fs::create_dir_all(dir)?;

    let meta = Sidecar {
        source_path: result.source_path.clone(),
        source_format: result.source_format,
        run_id: result.run_id.clone(),
        content_bytes: result.content.len(),
    };

    write_atomic(dir, payload, result.content.as_bytes())?;
    write_atomic(dir, sidecar, &serde_json::to_vec_pretty(&meta)?)?;
    Ok(())
}

/// Temp file in the target directory, then rename over the destination.
fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}
