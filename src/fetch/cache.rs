//! On-disk block cache for remote objects, keyed by URL and stored inside
//! the owning dataset's metadata area.
//!
//! Layout: `<cache root>/<sha256(url)>/meta.json` plus `blocks/<index>`.
//! A block file with the wrong on-disk length counts as corrupt and is
//! refetched in place; a block size differing from the one recorded in
//! `meta.json` aborts the open with `BlocksizeMismatch` so the caller can
//! invalidate and retry once.

use crate::error::FetchError;
use crate::fetch::http::HttpTransport;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const DEFAULT_BLOCK_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug)]
struct CacheMeta {
    url: String,
    block_size: u64,
    size: u64,
}

#[derive(Debug, Clone)]
pub struct BlockCache {
    root: PathBuf,
    block_size: u64,
}

impl BlockCache {
    pub fn new(root: PathBuf, block_size: u64) -> Self {
        Self { root, block_size }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn url_dir(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        self.root.join(hex::encode(digest))
    }

    /// Resolve the object size for `url`, consulting the cached metadata
    /// record before touching the network.
    pub async fn open(&self, transport: &HttpTransport, url: &str) -> Result<u64, FetchError> {
        let dir = self.url_dir(url);
        let meta_path = dir.join("meta.json");
        if let Ok(raw) = fs::read(&meta_path).await {
            match serde_json::from_slice::<CacheMeta>(&raw) {
                Ok(meta) => {
                    if meta.block_size != self.block_size {
                        return Err(FetchError::BlocksizeMismatch {
                            url: url.to_string(),
                            cached: meta.block_size,
                            requested: self.block_size,
                        });
                    }
                    return Ok(meta.size);
                }
                Err(e) => {
                    // Corrupt metadata record: discard this URL's cache and
                    // fall through to a fresh probe.
                    warn!("{url}: unreadable cache metadata ({e}); invalidating");
                    let _ = fs::remove_dir_all(&dir).await;
                }
            }
        }
        let size = transport.probe_size(url).await?;
        fs::create_dir_all(&dir).await?;
        let meta = CacheMeta {
            url: url.to_string(),
            block_size: self.block_size,
            size,
        };
        fs::write(&meta_path, serde_json::to_vec(&meta).map_err(io::Error::other)?).await?;
        Ok(size)
    }

    /// Read one block, from disk when a healthy copy exists, otherwise from
    /// the transport (rewriting the on-disk copy).
    pub async fn read_block(
        &self,
        transport: &HttpTransport,
        url: &str,
        size: u64,
        index: u64,
    ) -> Result<Vec<u8>, FetchError> {
        let offset = index * self.block_size;
        let expected = self.block_size.min(size.saturating_sub(offset)) as usize;
        if expected == 0 {
            return Ok(Vec::new());
        }
        let path = self.url_dir(url).join("blocks").join(index.to_string());
        match fs::read(&path).await {
            Ok(data) if data.len() == expected => return Ok(data),
            Ok(data) => {
                warn!(
                    "{url}: cached block {index} has {} bytes, expected {expected}; refetching",
                    data.len()
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("{url}: cached block {index} unreadable ({e}); refetching");
            }
        }
        let data = transport.read_range(url, offset, expected).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Err(e) = fs::write(&path, &data).await {
            // Serving the read matters more than populating the cache.
            warn!("{url}: failed to store block {index}: {e}");
        } else {
            debug!("{url}: cached block {index} ({expected} bytes)");
        }
        Ok(data)
    }

    /// Drop every cached block and record for `url`.
    pub async fn invalidate(&self, url: &str) -> io::Result<()> {
        let dir = self.url_dir(url);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Purge the entire cache unconditionally.
    pub async fn clear(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }
}
