//! Remote fetch layer: candidate URL derivation, HTTP transport with retry,
//! and the optional on-disk block cache.

pub mod cache;
pub mod http;
pub mod urls;

pub use cache::{BlockCache, DEFAULT_BLOCK_SIZE};
pub use http::{HttpTransport, RetryPolicy};
pub use urls::candidate_urls;

use crate::error::{FetchError, FsError, FsResult};
use log::{debug, warn};
use std::io;
use std::path::{Path, PathBuf};

/// An open remote object: URL, resolved size, and the read path (cached or
/// direct). Reads are stateless `read_at` calls; seek emulation lives in the
/// handle layer.
#[derive(Debug)]
pub struct RemoteFile {
    url: String,
    size: u64,
    transport: HttpTransport,
    cache: Option<BlockCache>,
}

impl RemoteFile {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `len` bytes at `offset`, clamped at end of object.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, FetchError> {
        if offset >= self.size {
            return Ok(Vec::new());
        }
        let len = len.min((self.size - offset) as usize);
        match &self.cache {
            None => self.transport.read_range(&self.url, offset, len).await,
            Some(cache) => {
                let bs = cache.block_size();
                let mut out = Vec::with_capacity(len);
                let mut pos = offset;
                let end = offset + len as u64;
                while pos < end {
                    let index = pos / bs;
                    let block = cache
                        .read_block(&self.transport, &self.url, self.size, index)
                        .await?;
                    let start = (pos - index * bs) as usize;
                    let take = block.len().min(start + (end - pos) as usize) - start;
                    out.extend_from_slice(&block[start..start + take]);
                    pos += take as u64;
                }
                Ok(out)
            }
        }
    }
}

/// Fetch entry point owned by one dataset handle: a transport plus the
/// dataset's block cache when on-disk caching is enabled.
pub struct Fetcher {
    transport: HttpTransport,
    cache: Option<BlockCache>,
}

impl Fetcher {
    pub fn new(cache_root: Option<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            transport: HttpTransport::new(retry),
            cache: cache_root.map(|root| BlockCache::new(root, DEFAULT_BLOCK_SIZE)),
        }
    }

    pub fn caching(&self) -> bool {
        self.cache.is_some()
    }

    /// Open one URL: resolve the object size (from the cache record when
    /// available) and hand back a readable stream.
    pub async fn open(&self, url: &str) -> Result<RemoteFile, FetchError> {
        let size = match &self.cache {
            Some(cache) => cache.open(&self.transport, url).await?,
            None => self.transport.probe_size(url).await?,
        };
        Ok(RemoteFile {
            url: url.to_string(),
            size,
            transport: self.transport.clone(),
            cache: self.cache.clone(),
        })
    }

    /// Try candidates strictly in order. Not-found failures advance to the
    /// next candidate; a block-size mismatch invalidates that URL's cache and
    /// retries it exactly once; a transport failure that survived its retry
    /// schedule advances as well. Exhaustion of the whole list is the only
    /// user-visible failure.
    pub async fn open_first_viable(
        &self,
        path: &Path,
        dataset: &Path,
        urls: &[String],
    ) -> FsResult<RemoteFile> {
        for url in urls {
            debug!("{}: trying {url}", path.display());
            match self.open(url).await {
                Ok(file) => return Ok(file),
                Err(e @ FetchError::BlocksizeMismatch { .. }) => {
                    warn!("{}: {e}; invalidating cache and reopening", path.display());
                    if let Some(cache) = &self.cache {
                        let _ = cache.invalidate(url).await;
                    }
                    match self.open(url).await {
                        Ok(file) => return Ok(file),
                        Err(e) => debug!("{}: reopen of {url} failed: {e}", path.display()),
                    }
                }
                Err(e) if e.is_not_found() => debug!("{}: {e}", path.display()),
                Err(e) => warn!("{}: giving up on {url}: {e}", path.display()),
            }
        }
        Err(FsError::NoUsableSource {
            path: path.to_path_buf(),
            dataset: dataset.to_path_buf(),
        })
    }

    /// Purge the dataset's on-disk cache unconditionally. No-op without
    /// caching.
    pub async fn clear_cache(&self) -> io::Result<()> {
        match &self.cache {
            Some(cache) => cache.clear().await,
            None => Ok(()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testserver::{TestFile, TestServer};
    use super::*;
    use std::collections::HashMap;

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn direct_open_and_ranged_read() {
        let data = body(1000);
        let server = TestServer::start_simple(HashMap::from([(
            "/obj".to_string(),
            data.clone(),
        )]))
        .await;
        let fetcher = Fetcher::new(None, RetryPolicy::immediate(0));
        let file = fetcher.open(&server.url("/obj")).await.unwrap();
        assert_eq!(file.size(), 1000);
        assert_eq!(file.read_at(100, 50).await.unwrap(), &data[100..150]);
        // Clamped at end of object.
        assert_eq!(file.read_at(990, 50).await.unwrap(), &data[990..]);
        assert!(file.read_at(2000, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_walk_the_retry_schedule() {
        let server = TestServer::start(HashMap::from([(
            "/flaky".to_string(),
            TestFile {
                body: body(64),
                fail_first: 2,
            },
        )]))
        .await;
        let fetcher = Fetcher::new(None, RetryPolicy::immediate(3));
        let file = fetcher.open(&server.url("/flaky")).await.unwrap();
        assert_eq!(file.size(), 64);
    }

    #[tokio::test]
    async fn retry_schedule_is_bounded() {
        let server = TestServer::start(HashMap::from([(
            "/flaky".to_string(),
            TestFile {
                body: body(64),
                fail_first: 5,
            },
        )]))
        .await;
        let fetcher = Fetcher::new(None, RetryPolicy::immediate(2));
        assert!(fetcher.open(&server.url("/flaky")).await.is_err());
    }

    #[tokio::test]
    async fn first_viable_skips_missing_candidates() {
        let data = body(300);
        let server = TestServer::start_simple(HashMap::from([(
            "/good".to_string(),
            data.clone(),
        )]))
        .await;
        let fetcher = Fetcher::new(None, RetryPolicy::immediate(0));
        let urls = vec![server.url("/missing"), server.url("/good")];
        let file = fetcher
            .open_first_viable(Path::new("data/f.bin"), Path::new("/ds"), &urls)
            .await
            .unwrap();
        assert_eq!(file.read_at(0, 10).await.unwrap(), &data[..10]);
    }

    #[tokio::test]
    async fn exhausted_candidates_name_path_and_dataset() {
        let server = TestServer::start_simple(HashMap::new()).await;
        let fetcher = Fetcher::new(None, RetryPolicy::immediate(0));
        let urls = vec![server.url("/a"), server.url("/b")];
        let err = fetcher
            .open_first_viable(Path::new("data/f.bin"), Path::new("/ds"), &urls)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("data/f.bin") && msg.contains("/ds"), "{msg}");
    }

    #[tokio::test]
    async fn cached_reads_hit_disk_after_first_fetch() {
        let data = body(4096);
        let server = TestServer::start_simple(HashMap::from([(
            "/obj".to_string(),
            data.clone(),
        )]))
        .await;
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(Some(tmp.path().join("cache")), RetryPolicy::immediate(0));
        let file = fetcher.open(&server.url("/obj")).await.unwrap();
        assert_eq!(file.read_at(0, 4096).await.unwrap(), data);
        let after_first = server.hit_count();
        assert_eq!(file.read_at(100, 200).await.unwrap(), &data[100..300]);
        // Second read served from the on-disk block.
        assert_eq!(server.hit_count(), after_first);
    }

    #[tokio::test]
    async fn externally_cleared_cache_recovers_on_next_read() {
        let data = body(2048);
        let server = TestServer::start_simple(HashMap::from([(
            "/obj".to_string(),
            data.clone(),
        )]))
        .await;
        let tmp = tempfile::tempdir().unwrap();
        let cache_root = tmp.path().join("cache");
        let fetcher = Fetcher::new(Some(cache_root.clone()), RetryPolicy::immediate(0));
        let file = fetcher.open(&server.url("/obj")).await.unwrap();
        assert_eq!(file.read_at(0, 2048).await.unwrap(), data);

        // Someone wipes the cache store behind our back.
        std::fs::remove_dir_all(&cache_root).unwrap();
        assert_eq!(file.read_at(10, 100).await.unwrap(), &data[10..110]);
    }

    #[tokio::test]
    async fn corrupt_block_is_refetched() {
        let data = body(1024);
        let server = TestServer::start_simple(HashMap::from([(
            "/obj".to_string(),
            data.clone(),
        )]))
        .await;
        let tmp = tempfile::tempdir().unwrap();
        let cache_root = tmp.path().join("cache");
        let fetcher = Fetcher::new(Some(cache_root.clone()), RetryPolicy::immediate(0));
        let file = fetcher.open(&server.url("/obj")).await.unwrap();
        assert_eq!(file.read_at(0, 1024).await.unwrap(), data);

        // Truncate the stored block; the next read must not serve it.
        for entry in walk(&cache_root) {
            if entry.parent().map(|p| p.ends_with("blocks")).unwrap_or(false) {
                std::fs::write(&entry, b"garbage").unwrap();
            }
        }
        assert_eq!(file.read_at(0, 1024).await.unwrap(), data);
    }

    #[tokio::test]
    async fn blocksize_mismatch_invalidates_and_retries_once() {
        let data = body(512);
        let server = TestServer::start_simple(HashMap::from([(
            "/obj".to_string(),
            data.clone(),
        )]))
        .await;
        let tmp = tempfile::tempdir().unwrap();
        let cache_root = tmp.path().join("cache");
        let url = server.url("/obj");

        // Populate with a different chunking than the second open requests.
        let stale = BlockCache::new(cache_root.clone(), 1024);
        let transport = HttpTransport::new(RetryPolicy::immediate(0));
        stale.open(&transport, &url).await.unwrap();

        let fetcher = Fetcher::new(Some(cache_root.clone()), RetryPolicy::immediate(0));
        let fresh = BlockCache::new(cache_root, DEFAULT_BLOCK_SIZE);
        assert!(matches!(
            fresh.open(&transport, &url).await,
            Err(FetchError::BlocksizeMismatch { .. })
        ));
        let file = fetcher
            .open_first_viable(Path::new("f"), Path::new("/ds"), &[url])
            .await
            .unwrap();
        assert_eq!(file.read_at(0, 512).await.unwrap(), data);
    }

    fn walk(root: &Path) -> Vec<std::path::PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    out.push(path);
                }
            }
        }
        out
    }
}
