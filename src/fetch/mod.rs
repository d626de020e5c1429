//! Content-addressed source cache.
//!
//! Layout under the cache root:
//! - `blobs/sha256/<ab>/<sha256>`: downloaded bytes, named by their digest
//! - `index/<sha256(url)>.json`: which blob a URL resolved to
//! - `tmp/`: in-flight downloads (same filesystem as `blobs/`)
//! - `locks/<sha256(url)>.lock`: per-URL writer exclusion
//!
//! A blob only ever appears at its final path by rename after its digest
//! was checked, so nothing under `blobs/` is partial. Entries are never
//! evicted here.

pub mod transport;

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{BundleError, FetchFailure, IoResultExt, Result};
use crate::fsutil::{
    atomic_rename, is_hex_64, now_utc_iso, sha256_bytes, sha256_file, tmp_name, write_atomic,
    FileLock, HashingWriter,
};

pub use transport::{CurlTransport, FileTransport, ResponseMeta, SystemTransport, Transport};

/// A verified artifact in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub source_url: String,
    /// Blob path; stable for as long as the cache root is.
    pub local_path: PathBuf,
    pub size_bytes: u64,
    /// sha256 hex digest of the blob.
    pub checksum: String,
    pub fetched_at: String,
}

/// On-disk index record. The blob path is derived from the digest on
/// load so a relocated cache stays valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct IndexRecord {
    source_url: String,
    sha256: String,
    size_bytes: u64,
    fetched_at: String,
}

/// One piece of an archive published in several parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub url: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `next` (2-based: the first retry waits `base_delay`).
    pub fn delay_before(&self, next: u32) -> Duration {
        let shift = next.saturating_sub(2).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    pub root: PathBuf,
    pub entries: usize,
    pub blobs: usize,
    pub bytes: u64,
}

/// Why one download attempt did not produce a blob.
enum AttemptError {
    /// Worth another attempt.
    Retry(FetchFailure),
    /// Local failure (disk, permissions); retrying will not help.
    Fatal(BundleError),
}

impl From<BundleError> for AttemptError {
    fn from(e: BundleError) -> Self {
        AttemptError::Fatal(e)
    }
}

pub struct SourceFetcher {
    root: PathBuf,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl SourceFetcher {
    /// Open (creating if needed) the cache at `root`.
    pub fn open(root: &Path, transport: Arc<dyn Transport>) -> Result<Self> {
        let fetcher = Self {
            root: root.to_path_buf(),
            transport,
            retry: RetryPolicy::default(),
        };
        for dir in [
            fetcher.root.join("blobs/sha256"),
            fetcher.index_dir(),
            fetcher.tmp_dir(),
            fetcher.locks_dir(),
        ] {
            fs::create_dir_all(&dir).at(&dir)?;
        }
        Ok(fetcher)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            attempts: retry.attempts.max(1),
            ..retry
        };
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn blob_path(&self, sha256: &str) -> PathBuf {
        self.root
            .join("blobs/sha256")
            .join(&sha256[..2])
            .join(sha256)
    }

    fn index_path(&self, key: &str) -> PathBuf {
        self.index_dir().join(format!("{key}.json"))
    }

    /// Fetch `url`, reusing a cached copy when it still verifies.
    pub fn fetch(&self, url: &str, expected: Option<&str>) -> Result<CacheEntry> {
        self.fetch_within(url, expected, None)
    }

    /// Like [`fetch`](Self::fetch), bounded by `deadline`.
    ///
    /// The remaining time is handed to the transport per attempt, and no
    /// retry is started once the deadline has passed.
    pub fn fetch_within(
        &self,
        url: &str,
        expected: Option<&str>,
        deadline: Option<Instant>,
    ) -> Result<CacheEntry> {
        let expected = expected.map(normalize_checksum).transpose()?;
        let key = sha256_bytes(url.as_bytes());
        let _lock = FileLock::acquire(&self.locks_dir().join(format!("{key}.lock")))?;

        if let Some(hit) = self.reuse(&key, expected.as_deref())? {
            return Ok(hit);
        }

        let attempts = self.retry.attempts;
        let mut last = FetchFailure::Transport("no attempt made".to_string());
        for attempt in 1..=attempts {
            if attempt > 1 {
                let mut delay = self.retry.delay_before(attempt);
                if let Some(left) = remaining(deadline) {
                    if left.is_zero() {
                        return Err(BundleError::Timeout {
                            stage: "fetching".to_string(),
                        });
                    }
                    delay = delay.min(left);
                }
                warn!("retrying {url} in {delay:?} (attempt {attempt}/{attempts}): {last}");
                thread::sleep(delay);
            }
            let timeout = remaining(deadline);
            if timeout == Some(Duration::ZERO) {
                return Err(BundleError::Timeout {
                    stage: "fetching".to_string(),
                });
            }
            match self.download_once(url, &key, expected.as_deref(), timeout) {
                Ok(entry) => {
                    info!(
                        "fetched {url} ({} bytes, sha256 {})",
                        entry.size_bytes, entry.checksum
                    );
                    return Ok(entry);
                }
                Err(AttemptError::Retry(failure)) => last = failure,
                Err(AttemptError::Fatal(e)) => return Err(e),
            }
        }
        Err(BundleError::Fetch {
            url: url.to_string(),
            attempts,
            failure: last,
        })
    }

    /// Fetch every part, then cache their concatenation under a key made
    /// from the part URLs, verified against the whole-archive digest.
    pub fn fetch_parts(
        &self,
        parts: &[Part],
        expected: &str,
        deadline: Option<Instant>,
    ) -> Result<CacheEntry> {
        if parts.is_empty() {
            return Err(BundleError::Config(
                "multi-part source has no parts".to_string(),
            ));
        }
        let expected = normalize_checksum(expected)?;
        let synthetic = format!(
            "parts:{}",
            parts
                .iter()
                .map(|p| p.url.as_str())
                .collect::<Vec<_>>()
                .join("|")
        );
        let key = sha256_bytes(synthetic.as_bytes());
        let _lock = FileLock::acquire(&self.locks_dir().join(format!("{key}.lock")))?;

        if let Some(hit) = self.reuse(&key, Some(&expected))? {
            return Ok(hit);
        }

        let mut pieces = Vec::with_capacity(parts.len());
        for part in parts {
            pieces.push(self.fetch_within(&part.url, Some(&part.sha256), deadline)?);
        }

        let tmp = self.tmp_dir().join(tmp_name("parts"));
        let result = self.concat_parts(&pieces, &tmp);
        let (actual, size) = match result {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        if actual != expected {
            let _ = fs::remove_file(&tmp);
            return Err(BundleError::Fetch {
                url: synthetic,
                attempts: 1,
                failure: FetchFailure::ChecksumMismatch { expected, actual },
            });
        }
        debug!("joined {} parts into {actual}", pieces.len());
        self.commit(&tmp, &synthetic, &key, actual, size)
    }

    fn concat_parts(&self, pieces: &[CacheEntry], tmp: &Path) -> Result<(String, u64)> {
        let file = File::create(tmp).at(tmp)?;
        let mut w = HashingWriter::new(BufWriter::new(file));
        for piece in pieces {
            let mut r = File::open(&piece.local_path).at(&piece.local_path)?;
            io::copy(&mut r, &mut w).at(tmp)?;
        }
        let size = w.written();
        let (sha, buf) = w.finish();
        let file = buf.into_inner().map_err(|e| e.into_error()).at(tmp)?;
        file.sync_all().at(tmp)?;
        Ok((sha, size))
    }

    /// Cached entry for `url`, without verifying the blob.
    pub fn lookup(&self, url: &str) -> Result<Option<CacheEntry>> {
        self.read_index(&sha256_bytes(url.as_bytes()))
    }

    fn read_index(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.index_path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).at(&path)?;
        let record: IndexRecord = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("ignoring unreadable cache index {}: {e}", path.display());
                return Ok(None);
            }
        };
        if !is_hex_64(&record.sha256) {
            warn!("ignoring cache index {} with bad digest", path.display());
            return Ok(None);
        }
        Ok(Some(CacheEntry {
            local_path: self.blob_path(&record.sha256),
            source_url: record.source_url,
            size_bytes: record.size_bytes,
            checksum: record.sha256,
            fetched_at: record.fetched_at,
        }))
    }

    /// A cached entry that matches `expected` and still hashes correctly.
    ///
    /// A blob that fails re-verification has its index entry dropped so
    /// the caller refetches. Caller holds the key's lock.
    fn reuse(&self, key: &str, expected: Option<&str>) -> Result<Option<CacheEntry>> {
        let Some(entry) = self.read_index(key)? else {
            return Ok(None);
        };
        if let Some(want) = expected {
            if entry.checksum != want {
                debug!(
                    "cache entry for {} has {}, want {want}; refetching",
                    entry.source_url, entry.checksum
                );
                return Ok(None);
            }
        }
        if entry.local_path.is_file() {
            let (actual, size) = sha256_file(&entry.local_path)?;
            if actual == entry.checksum && size == entry.size_bytes {
                debug!("cache hit for {}", entry.source_url);
                return Ok(Some(entry));
            }
            warn!(
                "cached blob {} no longer matches its digest; invalidating",
                entry.local_path.display()
            );
            let _ = fs::remove_file(&entry.local_path);
        } else {
            warn!(
                "cached blob {} is missing; invalidating",
                entry.local_path.display()
            );
        }
        let index = self.index_path(key);
        fs::remove_file(&index).at(&index)?;
        Ok(None)
    }

    fn download_once(
        &self,
        url: &str,
        key: &str,
        expected: Option<&str>,
        timeout: Option<Duration>,
    ) -> std::result::Result<CacheEntry, AttemptError> {
        let tmp = self.tmp_dir().join(tmp_name("download"));
        let result = self.stream_to(url, &tmp, expected, timeout);
        match result {
            Ok((sha, size)) => Ok(self.commit(&tmp, url, key, sha, size)?),
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn stream_to(
        &self,
        url: &str,
        tmp: &Path,
        expected: Option<&str>,
        timeout: Option<Duration>,
    ) -> std::result::Result<(String, u64), AttemptError> {
        let file = File::create(tmp).at(tmp)?;
        let mut w = HashingWriter::new(BufWriter::new(file));
        let meta = self
            .transport
            .download(url, &mut w, timeout)
            .map_err(|e| AttemptError::Retry(FetchFailure::Transport(e.to_string())))?;
        w.flush().at(tmp)?;
        let received = w.written();
        let (actual, buf) = w.finish();
        let file = buf.into_inner().map_err(|e| e.into_error()).at(tmp)?;
        file.sync_all().at(tmp)?;

        if !(200..=299).contains(&meta.status) {
            return Err(AttemptError::Retry(FetchFailure::Status(meta.status)));
        }
        if let Some(declared) = meta.content_length {
            if declared != received {
                return Err(AttemptError::Retry(FetchFailure::SizeMismatch {
                    declared,
                    received,
                }));
            }
        }
        if let Some(want) = expected {
            if actual != want {
                return Err(AttemptError::Retry(FetchFailure::ChecksumMismatch {
                    expected: want.to_string(),
                    actual,
                }));
            }
        }
        Ok((actual, received))
    }

    /// Move a verified temp file into its blob slot and index it.
    fn commit(
        &self,
        tmp: &Path,
        source_url: &str,
        key: &str,
        sha256: String,
        size_bytes: u64,
    ) -> Result<CacheEntry> {
        let blob = self.blob_path(&sha256);
        if blob.is_file() {
            fs::remove_file(tmp).at(tmp)?;
        } else {
            atomic_rename(tmp, &blob)?;
        }
        let record = IndexRecord {
            source_url: source_url.to_string(),
            sha256,
            size_bytes,
            fetched_at: now_utc_iso(),
        };
        let index = self.index_path(key);
        let json = serde_json::to_vec_pretty(&record).map_err(|e| BundleError::Io {
            path: index.clone(),
            source: io::Error::other(e),
        })?;
        write_atomic(&index, &json)?;
        Ok(CacheEntry {
            source_url: record.source_url,
            local_path: blob,
            size_bytes,
            checksum: record.sha256,
            fetched_at: record.fetched_at,
        })
    }

    /// Count indexed entries and blob bytes.
    pub fn status(&self) -> Result<CacheStatus> {
        let index_dir = self.index_dir();
        let mut entries = 0usize;
        for e in fs::read_dir(&index_dir).at(&index_dir)? {
            let e = e.at(&index_dir)?;
            if e.path().extension().is_some_and(|x| x == "json") {
                entries += 1;
            }
        }
        let blobs_dir = self.root.join("blobs");
        let mut blobs = 0usize;
        let mut bytes = 0u64;
        let walk_err = |e: walkdir::Error| BundleError::Io {
            path: blobs_dir.clone(),
            source: e.into(),
        };
        for e in WalkDir::new(&blobs_dir) {
            let e = e.map_err(walk_err)?;
            if e.file_type().is_file() {
                blobs += 1;
                bytes += e.metadata().map_err(walk_err)?.len();
            }
        }
        Ok(CacheStatus {
            root: self.root.clone(),
            entries,
            blobs,
            bytes,
        })
    }
}

fn normalize_checksum(raw: &str) -> Result<String> {
    let s = raw.trim().to_ascii_lowercase();
    if !is_hex_64(&s) {
        return Err(BundleError::Config(format!(
            "'{raw}' is not a sha256 hex digest"
        )));
    }
    Ok(s)
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}
