//! The filesystem-operation surface: a path-based state machine deciding,
//! per operation, between the real backing tree, synthesized metadata, and
//! lazily-opened remote streams.

use crate::annex::layout::{self, PathState};
use crate::dataset::{self, DatasetRegistry, FileState, StoreProvider};
use crate::error::{FsError, FsResult};
use crate::fetch::{DEFAULT_BLOCK_SIZE, RetryPolicy};
use crate::vfs::handle::{HandleKind, HandleTable};
use log::{debug, warn};
use std::io::{self, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// What to do with on-disk fetch caches at unmount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CacheClearPolicy {
    /// Leave all caches in place.
    None,
    /// Clear the caches of every dataset touched this session.
    Visited,
    /// Clear the mounted dataset and every nested sub-dataset.
    Recursive,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Expose the metadata area read/write instead of hiding it.
    pub transparent: bool,
    /// Enable the on-disk block cache for remote reads.
    pub caching: bool,
    pub cache_clear: CacheClearPolicy,
    pub retry: RetryPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            transparent: false,
            caching: false,
            cache_clear: CacheClearPolicy::None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct FileAttr {
    pub kind: FileKind,
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// Path-based driver behind the FUSE adapter. All paths are absolute and
/// inside the mounted tree.
pub struct VfsDriver {
    root: PathBuf,
    config: DriverConfig,
    datasets: DatasetRegistry,
    handles: HandleTable,
}

impl VfsDriver {
    pub fn new(root: PathBuf, config: DriverConfig, provider: Arc<dyn StoreProvider>) -> Self {
        let datasets = DatasetRegistry::new(
            root.clone(),
            config.transparent,
            config.caching,
            config.retry.clone(),
            provider,
        );
        Self {
            root,
            config,
            datasets,
            handles: HandleTable::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn transparent(&self) -> bool {
        self.config.transparent
    }

    fn under_git(&self, path: &Path) -> bool {
        path.strip_prefix(&self.root)
            .map(|rel| rel.components().any(|c| c.as_os_str() == layout::GIT_DIR))
            .unwrap_or(false)
    }

    /// The metadata area simply does not exist unless transparent mode is on.
    fn guard(&self, path: &Path) -> FsResult<()> {
        if !self.config.transparent && self.under_git(path) {
            debug!("{}: hidden metadata area", path.display());
            return Err(FsError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Writes pass through only inside the metadata area in transparent mode.
    fn guard_write(&self, path: &Path) -> FsResult<()> {
        if self.config.transparent && self.under_git(path) {
            Ok(())
        } else {
            Err(FsError::ReadOnlyFilesystem {
                path: path.to_path_buf(),
            })
        }
    }

    pub async fn getattr(&self, path: &Path, fh: Option<u64>) -> FsResult<FileAttr> {
        self.guard(path)?;
        debug!("getattr(path={}, fh={fh:?})", path.display());

        if let Some(fh) = fh.filter(|fh| *fh != 0) {
            if let Some(handle) = self.handles.get(fh) {
                match &handle.kind {
                    HandleKind::Native { file } => {
                        let meta = file.lock().await.metadata().await?;
                        return Ok(attr_from_metadata(&meta));
                    }
                    HandleKind::Remote {
                        file, commit_time, ..
                    } => {
                        return Ok(synthesize_file_attr(file.size(), *commit_time));
                    }
                    HandleKind::Directory => {}
                }
            }
        }

        match tokio::fs::metadata(path).await {
            Ok(meta) => return Ok(attr_from_metadata(&meta)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if self.config.transparent {
            // A broken symlink is still a real directory entry.
            match tokio::fs::symlink_metadata(path).await {
                Ok(meta) => return Ok(attr_from_metadata(&meta)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if let Ok((ds, rel)) = self.datasets.resolve(path).await {
                match ds.classify(path) {
                    PathState::Key { key, .. } => {
                        if let Some(size) = key.size {
                            debug!("{}: size from key", path.display());
                            return Ok(synthesize_file_attr(size, ds.commit_time()));
                        }
                        // Size unknown: open the stream briefly and close it.
                        let urls = ds.candidates(&key).await?;
                        let remote = ds
                            .fetcher()
                            .open_first_viable(&rel, ds.root(), &urls)
                            .await?;
                        return Ok(synthesize_file_attr(remote.size(), ds.commit_time()));
                    }
                    PathState::ContainerDirectory { topdir } => {
                        let meta = tokio::fs::metadata(&topdir).await?;
                        return Ok(attr_from_metadata(&meta));
                    }
                    PathState::NotManaged => {
                        if self.under_git(path) {
                            return Err(FsError::NotFound {
                                path: path.to_path_buf(),
                            });
                        }
                    }
                }
            }
        }

        let (ds, rel) = self.datasets.resolve(path).await?;
        match ds.file_state(&rel).await? {
            FileState::NotAnnexed => Err(FsError::NotFound {
                path: path.to_path_buf(),
            }),
            FileState::NoContent(key) | FileState::HasContent(key) => {
                if let Some(size) = key.size {
                    debug!("{}: size from key", path.display());
                    Ok(synthesize_file_attr(size, ds.commit_time()))
                } else {
                    let urls = ds.candidates(&key).await?;
                    let remote = ds
                        .fetcher()
                        .open_first_viable(&rel, ds.root(), &urls)
                        .await?;
                    Ok(synthesize_file_attr(remote.size(), ds.commit_time()))
                }
            }
        }
    }

    pub async fn open(&self, path: &Path, flags: i32) -> FsResult<u64> {
        self.guard(path)?;
        debug!("open(path={}, flags={flags:#x})", path.display());

        let accmode = flags & libc::O_ACCMODE;
        let wants_write = accmode != libc::O_RDONLY
            || flags & (libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND) != 0;
        if wants_write {
            self.guard_write(path)?;
            let file = open_native(path, flags).await?;
            return Ok(self.handles.insert(HandleKind::Native {
                file: tokio::sync::Mutex::new(file),
            }));
        }

        let exists = tokio::fs::metadata(path).await.is_ok();
        let plain_metadata_path = self.config.transparent
            && self.under_git(path)
            && !matches!(layout::classify(path), PathState::Key { .. });
        if exists || plain_metadata_path {
            debug!("{}: opening directly", path.display());
            let file = open_native(path, flags).await?;
            return Ok(self.handles.insert(HandleKind::Native {
                file: tokio::sync::Mutex::new(file),
            }));
        }

        let (ds, rel) = self.datasets.resolve(path).await?;
        match ds.file_state(&rel).await? {
            FileState::NoContent(key) => {
                debug!("{}: opening via remote candidates", path.display());
                let urls = ds.candidates(&key).await?;
                let remote = ds
                    .fetcher()
                    .open_first_viable(&rel, ds.root(), &urls)
                    .await?;
                Ok(self.handles.insert(HandleKind::Remote {
                    file: remote,
                    lock: tokio::sync::Mutex::new(()),
                    commit_time: ds.commit_time(),
                }))
            }
            FileState::HasContent(_) | FileState::NotAnnexed => {
                // Either the content landed between classification and now,
                // or the path plainly does not exist and the open reports it.
                let file = open_native(path, flags).await?;
                Ok(self.handles.insert(HandleKind::Native {
                    file: tokio::sync::Mutex::new(file),
                }))
            }
        }
    }

    /// Positioned read. The seek+read pair runs under the handle's own lock;
    /// distinct handles proceed concurrently.
    pub async fn read(&self, fh: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let handle = self.handles.get(fh).ok_or(FsError::BadHandle { fh })?;
        match &handle.kind {
            HandleKind::Native { file } => {
                let mut file = file.lock().await;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; size];
                let mut filled = 0;
                while filled < size {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            }
            HandleKind::Remote { file, lock, .. } => {
                let _serialized = lock.lock().await;
                file.read_at(offset, size)
                    .await
                    .map_err(|e| FsError::Io(io::Error::other(e.to_string())))
            }
            HandleKind::Directory => Err(FsError::Io(io::Error::from_raw_os_error(libc::EISDIR))),
        }
    }

    pub async fn write(&self, path: &Path, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.guard_write(path)?;
        let handle = self.handles.get(fh).ok_or(FsError::BadHandle { fh })?;
        match &handle.kind {
            HandleKind::Native { file } => {
                let mut file = file.lock().await;
                file.seek(SeekFrom::Start(offset)).await?;
                file.write_all(data).await?;
                Ok(data.len())
            }
            _ => Err(FsError::ReadOnlyFilesystem {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Close a handle. Unknown ids are a no-op so double-release stays safe.
    pub async fn release(&self, fh: u64) {
        if self.handles.remove(fh).is_none() {
            debug!("release of unknown handle {fh}");
        }
    }

    pub async fn opendir(&self, path: &Path) -> FsResult<u64> {
        self.guard(path)?;
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|_| FsError::NotFound {
                path: path.to_path_buf(),
            })?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory {
                path: path.to_path_buf(),
            });
        }
        Ok(self.handles.insert(HandleKind::Directory))
    }

    pub async fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        self.guard(path)?;
        let mut reader = tokio::fs::read_dir(path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.config.transparent && name == layout::GIT_DIR {
                debug!("{}: hiding metadata entry", path.display());
                continue;
            }
            let kind = match entry.file_type().await {
                Ok(t) if t.is_dir() => FileKind::Dir,
                Ok(t) if t.is_symlink() => FileKind::Symlink,
                _ => FileKind::File,
            };
            entries.push(DirEntry { name, kind });
        }
        Ok(entries)
    }

    pub async fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        self.guard(path)?;
        Ok(tokio::fs::read_link(path).await?)
    }

    //
    // Narrow pass-through write surface: metadata area, transparent mode.
    //

    pub async fn create(&self, path: &Path, flags: i32) -> FsResult<u64> {
        self.guard_write(path)?;
        let file = open_native(path, flags | libc::O_CREAT | libc::O_WRONLY).await?;
        Ok(self.handles.insert(HandleKind::Native {
            file: tokio::sync::Mutex::new(file),
        }))
    }

    pub async fn mkdir(&self, path: &Path) -> FsResult<()> {
        self.guard_write(path)?;
        Ok(tokio::fs::create_dir(path).await?)
    }

    pub async fn unlink(&self, path: &Path) -> FsResult<()> {
        self.guard_write(path)?;
        Ok(tokio::fs::remove_file(path).await?)
    }

    pub async fn rmdir(&self, path: &Path) -> FsResult<()> {
        self.guard_write(path)?;
        Ok(tokio::fs::remove_dir(path).await?)
    }

    pub async fn rename(&self, old: &Path, new: &Path) -> FsResult<()> {
        self.guard_write(old)?;
        self.guard_write(new)?;
        Ok(tokio::fs::rename(old, new).await?)
    }

    pub async fn truncate(&self, path: &Path, len: u64) -> FsResult<()> {
        self.guard_write(path)?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await?;
        Ok(file.set_len(len).await?)
    }

    pub async fn symlink(&self, link: &Path, target: &Path) -> FsResult<()> {
        self.guard_write(link)?;
        Ok(tokio::fs::symlink(target, link).await?)
    }

    /// Close every outstanding handle and apply the cache-clear policy.
    pub async fn destroy(&self) {
        let outstanding = self.handles.drain();
        if !outstanding.is_empty() {
            warn!("destroy: dropping {} outstanding handle(s)", outstanding.len());
        }
        drop(outstanding);
        match self.config.cache_clear {
            CacheClearPolicy::None => {}
            CacheClearPolicy::Visited => {
                for ds in self.datasets.visited().await {
                    if let Err(e) = ds.clear_cache().await {
                        warn!("cache clear for {} failed: {e}", ds.root().display());
                    }
                }
            }
            CacheClearPolicy::Recursive => {
                if let Err(e) = dataset::clear_caches(&self.root, true).await {
                    warn!("recursive cache clear failed: {e}");
                }
            }
        }
        self.datasets.close_all().await;
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &DatasetRegistry {
        &self.datasets
    }
}

async fn open_native(path: &Path, flags: i32) -> io::Result<tokio::fs::File> {
    let accmode = flags & libc::O_ACCMODE;
    tokio::fs::OpenOptions::new()
        .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
        .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
        .append(flags & libc::O_APPEND != 0)
        .create(flags & libc::O_CREAT != 0)
        .truncate(flags & libc::O_TRUNC != 0)
        .open(path)
        .await
}

fn attr_from_metadata(meta: &std::fs::Metadata) -> FileAttr {
    let kind = if meta.file_type().is_dir() {
        FileKind::Dir
    } else if meta.file_type().is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::File
    };
    FileAttr {
        kind,
        size: meta.len(),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        blksize: meta.blksize() as u32,
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
    }
}

fn system_time(secs: i64, nsec: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsec as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Attribute record for content that only exists remotely: a read-only
/// regular file owned by the mounting process, timestamped with the
/// dataset's commit time.
fn synthesize_file_attr(size: u64, timestamp: SystemTime) -> FileAttr {
    FileAttr {
        kind: FileKind::File,
        size,
        perm: 0o644,
        nlink: 1,
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        blksize: DEFAULT_BLOCK_SIZE as u32,
        atime: timestamp,
        mtime: timestamp,
        ctime: timestamp,
    }
}
