//! Dataset resolution: map any path under the mount to its owning dataset
//! root, with one long-lived handle per root and support for nested
//! sub-datasets.

use crate::annex::key::AnnexKey;
use crate::annex::layout::{self, GIT_DIR, PathState};
use crate::annex::store::{GitAnnexStore, RemoteEntry, TrackingStore};
use crate::error::{FsError, FsResult};
use crate::fetch::{Fetcher, RetryPolicy, candidate_urls};
use async_trait::async_trait;
use log::debug;
use lru::LruCache;
use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Capacity of the per-instance path memos.
const CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(1024).unwrap();

/// Relative location of the fetch cache inside a dataset's metadata area.
pub const CACHE_SUBDIR: &str = ".git/annexfs/cache";

/// Annex status of one relative path inside a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileState {
    NotAnnexed,
    NoContent(AnnexKey),
    HasContent(AnnexKey),
}

impl FileState {
    pub fn key(&self) -> Option<&AnnexKey> {
        match self {
            FileState::NotAnnexed => None,
            FileState::NoContent(key) | FileState::HasContent(key) => Some(key),
        }
    }
}

/// Opens the tracking layer for a dataset root, `None` for plain git
/// directories. Injectable so tests can supply a fixed-table store.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn open(&self, root: &Path) -> io::Result<Option<Arc<dyn TrackingStore>>>;
}

/// Production provider: detect git-annex via the repository configuration.
pub struct GitAnnexProvider;

#[async_trait]
impl StoreProvider for GitAnnexProvider {
    async fn open(&self, root: &Path) -> io::Result<Option<Arc<dyn TrackingStore>>> {
        Ok(GitAnnexStore::detect(root)
            .await?
            .map(|s| Arc::new(s) as Arc<dyn TrackingStore>))
    }
}

/// Per-root state: tracking store, remote registry, commit time, fetch
/// transport and the bounded path memos.
pub struct DatasetHandle {
    root: PathBuf,
    store: Option<Arc<dyn TrackingStore>>,
    remotes: Vec<RemoteEntry>,
    commit_time: SystemTime,
    fetcher: Fetcher,
    transparent: bool,
    states: Mutex<LruCache<PathBuf, FileState>>,
    classifications: Mutex<LruCache<PathBuf, PathState>>,
}

impl DatasetHandle {
    pub async fn open(
        root: PathBuf,
        transparent: bool,
        caching: bool,
        retry: RetryPolicy,
        provider: &dyn StoreProvider,
    ) -> io::Result<Self> {
        let store = provider.open(&root).await?;
        let remotes = match &store {
            Some(store) => store.remotes().await?,
            None => Vec::new(),
        };
        let commit_time = match &store {
            Some(store) => store
                .commit_timestamp()
                .await
                .unwrap_or_else(|_| SystemTime::now()),
            None => SystemTime::now(),
        };
        let cache_root = caching.then(|| root.join(CACHE_SUBDIR));
        debug!(
            "dataset at {}: annex={}, {} remote(s), caching={}",
            root.display(),
            store.is_some(),
            remotes.len(),
            caching
        );
        Ok(Self {
            root,
            store,
            remotes,
            commit_time,
            fetcher: Fetcher::new(cache_root, retry),
            transparent,
            states: Mutex::new(LruCache::new(CACHE_CAPACITY)),
            classifications: Mutex::new(LruCache::new(CACHE_CAPACITY)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn commit_time(&self) -> SystemTime {
        self.commit_time
    }

    /// Memoized object-store classification of an absolute path.
    pub fn classify(&self, path: &Path) -> PathState {
        if let Some(state) = self.classifications.lock().unwrap().get(path) {
            return state.clone();
        }
        let state = layout::classify(path);
        self.classifications
            .lock()
            .unwrap()
            .put(path.to_path_buf(), state.clone());
        state
    }

    /// Annex status of `relpath`, memoized. Decides between a direct open and
    /// a remote fetch.
    pub async fn file_state(&self, relpath: &Path) -> io::Result<FileState> {
        if let Some(state) = self.states.lock().unwrap().get(relpath) {
            return Ok(state.clone());
        }
        let state = self.file_state_uncached(relpath).await?;
        self.states
            .lock()
            .unwrap()
            .put(relpath.to_path_buf(), state.clone());
        Ok(state)
    }

    async fn file_state_uncached(&self, relpath: &Path) -> io::Result<FileState> {
        let path = self.root.join(relpath);

        // Object-store paths classify directly, without asking the annex.
        if self.transparent && relpath.starts_with(GIT_DIR) {
            return self.object_path_state(&path).await;
        }

        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileState::NotAnnexed),
            Err(e) => return Err(e),
        };
        if !meta.file_type().is_symlink() {
            // Unlocked pointer files are small; anything bigger cannot be one.
            if meta.len() < 1024 {
                if let Some(store) = &self.store {
                    if let Some(key) = store.lookup_key(relpath).await? {
                        return Ok(if store.content_present(&key).await? {
                            FileState::HasContent(key)
                        } else {
                            FileState::NoContent(key)
                        });
                    }
                }
            }
            return Ok(FileState::NotAnnexed);
        }

        let target = tokio::fs::read_link(&path).await?;
        let resolved = lexical_normalize(&path.parent().unwrap_or(&self.root).join(target));
        self.object_path_state(&resolved).await
    }

    async fn object_path_state(&self, path: &Path) -> io::Result<FileState> {
        match self.classify(path) {
            PathState::Key { key, .. } => {
                if tokio::fs::try_exists(path).await.unwrap_or(false) {
                    Ok(FileState::HasContent(key))
                } else {
                    Ok(FileState::NoContent(key))
                }
            }
            _ => Ok(FileState::NotAnnexed),
        }
    }

    /// Ordered fetch candidates for `key`: fresh location query against the
    /// construction-time remote registry.
    pub async fn candidates(&self, key: &AnnexKey) -> io::Result<Vec<String>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let locations = store.whereis(key).await?;
        Ok(candidate_urls(key, &locations, &self.remotes))
    }

    /// Purge this dataset's on-disk fetch cache.
    pub async fn clear_cache(&self) -> io::Result<()> {
        self.fetcher.clear_cache().await
    }
}

/// Resolves paths to dataset handles, creating each handle on first touch and
/// reusing it for the lifetime of the mount.
pub struct DatasetRegistry {
    top_root: PathBuf,
    transparent: bool,
    caching: bool,
    retry: RetryPolicy,
    provider: Arc<dyn StoreProvider>,
    handles: tokio::sync::Mutex<HashMap<PathBuf, Arc<DatasetHandle>>>,
    roots: Mutex<LruCache<PathBuf, PathBuf>>,
}

impl DatasetRegistry {
    pub fn new(
        top_root: PathBuf,
        transparent: bool,
        caching: bool,
        retry: RetryPolicy,
        provider: Arc<dyn StoreProvider>,
    ) -> Self {
        Self {
            top_root,
            transparent,
            caching,
            retry,
            provider,
            handles: tokio::sync::Mutex::new(HashMap::new()),
            roots: Mutex::new(LruCache::new(CACHE_CAPACITY)),
        }
    }

    pub fn top_root(&self) -> &Path {
        &self.top_root
    }

    /// Nearest ancestor of `path` that is a dataset root. Roots are stable
    /// for the lifetime of the mount, so lookups are memoized per queried
    /// path.
    pub fn dataset_root(&self, path: &Path) -> FsResult<PathBuf> {
        if let Some(root) = self.roots.lock().unwrap().get(path) {
            return Ok(root.clone());
        }
        let mut found = None;
        for ancestor in path.ancestors() {
            if ancestor.join(GIT_DIR).exists() {
                found = Some(ancestor.to_path_buf());
                break;
            }
        }
        let root = found.ok_or_else(|| FsError::NotUnderManagement {
            path: path.to_path_buf(),
        })?;
        // A root outside the configured top root escapes the mount's
        // jurisdiction.
        if !root.starts_with(&self.top_root) {
            return Err(FsError::NotUnderManagement {
                path: path.to_path_buf(),
            });
        }
        self.roots
            .lock()
            .unwrap()
            .put(path.to_path_buf(), root.clone());
        Ok(root)
    }

    /// Owning dataset handle plus the path relative to its root.
    pub async fn resolve(&self, path: &Path) -> FsResult<(Arc<DatasetHandle>, PathBuf)> {
        let root = self.dataset_root(path)?;
        let relpath = path
            .strip_prefix(&root)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(&root) {
            return Ok((handle.clone(), relpath));
        }
        let handle = Arc::new(
            DatasetHandle::open(
                root.clone(),
                self.transparent,
                self.caching,
                self.retry.clone(),
                self.provider.as_ref(),
            )
            .await?,
        );
        handles.insert(root, handle.clone());
        Ok((handle, relpath))
    }

    /// Handles created so far this session.
    pub async fn visited(&self) -> Vec<Arc<DatasetHandle>> {
        self.handles.lock().await.values().cloned().collect()
    }

    /// Drop all handles (unmount path).
    pub async fn close_all(&self) {
        self.handles.lock().await.clear();
        self.roots.lock().unwrap().clear();
    }
}

/// Resolve `.` and `..` components lexically, without touching the
/// filesystem. Symlink targets into the object store do not exist yet when
/// the content is remote-only, so `canonicalize` is not an option.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Remove the fetch cache of `root` and, when `recursive`, of every nested
/// dataset below it.
pub async fn clear_caches(root: &Path, recursive: bool) -> io::Result<()> {
    let cache = root.join(CACHE_SUBDIR);
    match tokio::fs::remove_dir_all(&cache).await {
        Ok(()) => debug!("cleared cache at {}", cache.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if !recursive {
        return Ok(());
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name();
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) || name == GIT_DIR {
                continue;
            }
            if path.join(GIT_DIR).exists() {
                Box::pin(clear_caches(&path, true)).await?;
            } else {
                stack.push(path);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annex::store::StaticTrackingStore;

    struct StaticProvider(Mutex<Option<Arc<dyn TrackingStore>>>);

    #[async_trait]
    impl StoreProvider for StaticProvider {
        async fn open(&self, _root: &Path) -> io::Result<Option<Arc<dyn TrackingStore>>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn registry(top: &Path) -> DatasetRegistry {
        DatasetRegistry::new(
            top.to_path_buf(),
            false,
            false,
            RetryPolicy::immediate(0),
            Arc::new(StaticProvider(Mutex::new(Some(
                Arc::new(StaticTrackingStore::default()) as Arc<dyn TrackingStore>,
            )))),
        )
    }

    #[tokio::test]
    async fn nested_roots_resolve_to_inner_dataset() {
        let tmp = tempfile::tempdir().unwrap();
        let outer = tmp.path().join("outer");
        let inner = outer.join("sub/inner");
        std::fs::create_dir_all(outer.join(".git")).unwrap();
        std::fs::create_dir_all(inner.join(".git")).unwrap();
        std::fs::create_dir_all(inner.join("data")).unwrap();

        let registry = registry(&outer);
        let (outer_handle, rel) = registry.resolve(&outer.join("somefile")).await.unwrap();
        assert_eq!(outer_handle.root(), outer);
        assert_eq!(rel, PathBuf::from("somefile"));

        let (inner_handle, rel) = registry
            .resolve(&inner.join("data/file.bin"))
            .await
            .unwrap();
        assert_eq!(inner_handle.root(), inner);
        assert_eq!(rel, PathBuf::from("data/file.bin"));

        // One handle per root, reused on the next resolution.
        let (again, _) = registry.resolve(&inner.join("other")).await.unwrap();
        assert!(Arc::ptr_eq(&inner_handle, &again));
        assert_eq!(registry.visited().await.len(), 2);
    }

    #[tokio::test]
    async fn paths_outside_the_top_root_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let managed = tmp.path().join("managed");
        let stray = tmp.path().join("stray");
        std::fs::create_dir_all(managed.join(".git")).unwrap();
        std::fs::create_dir_all(stray.join(".git")).unwrap();

        let registry = registry(&managed);
        assert!(matches!(
            registry.resolve(&stray.join("file")).await,
            Err(FsError::NotUnderManagement { .. })
        ));
        // No .git anywhere up the chain.
        assert!(matches!(
            registry.resolve(Path::new("/nonexistent/nowhere")).await,
            Err(FsError::NotUnderManagement { .. })
        ));
    }

    #[tokio::test]
    async fn file_state_follows_symlinks_into_the_object_store() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("ds");
        let key = "MD5E-s5--0123456789abcdef0123456789abcdef.bin";
        let object_rel = format!(".git/annex/objects/p0/4v/{key}/{key}");
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::create_dir_all(root.join("data")).unwrap();
        std::os::unix::fs::symlink(
            format!("../.git/annex/objects/p0/4v/{key}/{key}"),
            root.join("data/file.bin"),
        )
        .unwrap();

        let registry = registry(&root);
        let (handle, rel) = registry.resolve(&root.join("data/file.bin")).await.unwrap();
        let state = handle.file_state(&rel).await.unwrap();
        let FileState::NoContent(parsed) = state else {
            panic!("expected NoContent, got {state:?}");
        };
        assert_eq!(parsed.size, Some(5));

        // Materialize the object: same path flips to HasContent.
        let object = root.join(&object_rel);
        std::fs::create_dir_all(object.parent().unwrap()).unwrap();
        std::fs::write(&object, b"hello").unwrap();
        let state = handle.file_state_uncached(&rel).await.unwrap();
        assert_eq!(state, FileState::HasContent(parsed));
    }

    #[tokio::test]
    async fn recursive_cache_clear_reaches_nested_datasets() {
        let tmp = tempfile::tempdir().unwrap();
        let outer = tmp.path().join("outer");
        let inner = outer.join("sub/inner");
        for root in [&outer, &inner] {
            std::fs::create_dir_all(root.join(CACHE_SUBDIR).join("entry")).unwrap();
        }
        clear_caches(&outer, true).await.unwrap();
        assert!(!outer.join(CACHE_SUBDIR).exists());
        assert!(!inner.join(CACHE_SUBDIR).exists());

        // Non-recursive clearing leaves the nested dataset alone.
        for root in [&outer, &inner] {
            std::fs::create_dir_all(root.join(CACHE_SUBDIR).join("entry")).unwrap();
        }
        clear_caches(&outer, false).await.unwrap();
        assert!(!outer.join(CACHE_SUBDIR).exists());
        assert!(inner.join(CACHE_SUBDIR).exists());
    }

    #[test]
    fn lexical_normalize_resolves_dots() {
        assert_eq!(
            lexical_normalize(Path::new("/a/b/../.git/annex/./objects")),
            PathBuf::from("/a/.git/annex/objects")
        );
        assert_eq!(
            lexical_normalize(Path::new("a/../../b")),
            PathBuf::from("../b")
        );
    }
}
