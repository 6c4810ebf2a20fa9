//! FUSE adapter: translates the inode-based kernel protocol into the
//! driver's path-based operations and maps driver errors onto errnos.

pub mod mount;

use crate::vfs::driver::{FileAttr as VfsFileAttr, FileKind, VfsDriver};
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use log::debug;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType as FuseFileType, Result as FuseResult, SetAttr, Timestamp};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(1);

/// Bidirectional inode↔path table. The kernel speaks inodes; the driver
/// speaks paths. Root is inode 1; ids grow monotonically and are not
/// reclaimed on forget.
struct InodeTable {
    by_ino: HashMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
    next: u64,
}

impl InodeTable {
    fn new(root: PathBuf) -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(1, root.clone());
        by_path.insert(root, 1);
        Self {
            by_ino,
            by_path,
            next: 2,
        }
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.by_ino.get(&ino).cloned()
    }

    fn ino_for(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.to_path_buf());
        self.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    fn forget_path(&mut self, path: &Path) {
        if let Some(ino) = self.by_path.remove(path) {
            self.by_ino.remove(&ino);
        }
    }
}

/// The mounted filesystem: driver plus inode table.
pub struct AnnexFuse {
    driver: VfsDriver,
    inodes: Mutex<InodeTable>,
}

impl AnnexFuse {
    pub fn new(driver: VfsDriver) -> Self {
        let inodes = Mutex::new(InodeTable::new(driver.root().to_path_buf()));
        Self { driver, inodes }
    }

    pub fn driver(&self) -> &VfsDriver {
        &self.driver
    }

    fn path_of(&self, ino: u64) -> FuseResult<PathBuf> {
        self.inodes
            .lock()
            .unwrap()
            .path_of(ino)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<PathBuf> {
        Ok(self.path_of(parent)?.join(name))
    }

    fn ino_for(&self, path: &Path) -> u64 {
        self.inodes.lock().unwrap().ino_for(path)
    }
}

fn errno(e: crate::error::FsError) -> Errno {
    Errno::from(e.errno())
}

fn kind_to_fuse(kind: FileKind) -> FuseFileType {
    match kind {
        FileKind::Dir => FuseFileType::Directory,
        FileKind::File => FuseFileType::RegularFile,
        FileKind::Symlink => FuseFileType::Symlink,
    }
}

fn to_fuse_attr(v: &VfsFileAttr, ino: u64) -> rfuse3::raw::reply::FileAttr {
    rfuse3::raw::reply::FileAttr {
        ino,
        size: v.size,
        blocks: v.size.div_ceil(512),
        atime: Timestamp::from(v.atime),
        mtime: Timestamp::from(v.mtime),
        ctime: Timestamp::from(v.ctime),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(v.ctime),
        kind: kind_to_fuse(v.kind),
        perm: v.perm,
        nlink: v.nlink,
        uid: v.uid,
        gid: v.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: v.blksize,
    }
}

impl Filesystem for AnnexFuse {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(1024 * 1024).ok_or_else(|| Errno::from(libc::EINVAL))?;
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        self.driver.destroy().await;
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        let attr = self.driver.getattr(&path, None).await.map_err(errno)?;
        let ino = self.ino_for(&path);
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(&attr, ino),
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        let attr = self.driver.getattr(&path, fh).await.map_err(errno)?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(&attr, ino),
        })
    }

    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        if let Some(size) = set_attr.size {
            let path = self.path_of(ino)?;
            self.driver.truncate(&path, size).await.map_err(errno)?;
        }
        self.getattr(req, ino, None, 0).await
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        let fh = self.driver.open(&path, flags as i32).await.map_err(errno)?;
        debug!("open({}) -> fh {fh}", path.display());
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        let fh = self.driver.opendir(&path).await.map_err(errno)?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = self
            .driver
            .read(fh, offset, size as usize)
            .await
            .map_err(errno)?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let path = self.path_of(ino)?;
        let written = self
            .driver
            .write(&path, fh, offset, data)
            .await
            .map_err(errno)? as u32;
        Ok(ReplyWrite { written })
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        let path = self.path_of(ino)?;
        let target = self.driver.readlink(&path).await.map_err(errno)?;
        Ok(ReplyData {
            data: Bytes::from(target.into_os_string().into_encoded_bytes()),
        })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = self.path_of(ino)?;
        let entries = self.driver.readdir(&path).await.map_err(errno)?;

        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(entries.len() + 2);
        all.push(DirectoryEntry {
            inode: ino,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        let parent_ino = path
            .parent()
            .filter(|p| p.starts_with(self.driver.root()))
            .map(|p| self.ino_for(p))
            .unwrap_or(1);
        all.push(DirectoryEntry {
            inode: parent_ino,
            kind: FuseFileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, entry) in entries.iter().enumerate() {
            let child = path.join(&entry.name);
            all.push(DirectoryEntry {
                inode: self.ino_for(&child),
                kind: kind_to_fuse(entry.kind),
                name: OsString::from(entry.name.clone()),
                offset: (i as i64) + 3,
            });
        }

        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let path = self.path_of(ino)?;
        let entries = self.driver.readdir(&path).await.map_err(errno)?;

        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(entries.len() + 2);
        let self_attr = self.driver.getattr(&path, None).await.map_err(errno)?;
        all.push(DirectoryEntryPlus {
            inode: ino,
            generation: 0,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
            attr: to_fuse_attr(&self_attr, ino),
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        let parent = path
            .parent()
            .filter(|p| p.starts_with(self.driver.root()))
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.clone());
        let parent_ino = self.ino_for(&parent);
        let parent_attr = self.driver.getattr(&parent, None).await.map_err(errno)?;
        all.push(DirectoryEntryPlus {
            inode: parent_ino,
            generation: 0,
            kind: FuseFileType::Directory,
            name: OsString::from(".."),
            offset: 2,
            attr: to_fuse_attr(&parent_attr, parent_ino),
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        for (i, entry) in entries.iter().enumerate() {
            let child = path.join(&entry.name);
            // Entries whose attributes cannot be resolved are skipped rather
            // than failing the whole listing.
            let Ok(attr) = self.driver.getattr(&child, None).await else {
                continue;
            };
            let child_ino = self.ino_for(&child);
            all.push(DirectoryEntryPlus {
                inode: child_ino,
                generation: 0,
                kind: kind_to_fuse(entry.kind),
                name: OsString::from(entry.name.clone()),
                offset: (i as i64) + 3,
                attr: to_fuse_attr(&attr, child_ino),
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let start = if offset == 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let boxed: Self::DirEntryPlusStream<'a> =
            Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.driver.release(fh).await;
        Ok(())
    }

    async fn releasedir(&self, _req: Request, _inode: u64, fh: u64, _flags: u32) -> FuseResult<()> {
        self.driver.release(fh).await;
        Ok(())
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        self.driver.mkdir(&path).await.map_err(errno)?;
        let attr = self.driver.getattr(&path, None).await.map_err(errno)?;
        let ino = self.ino_for(&path);
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(&attr, ino),
            generation: 0,
        })
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.child_path(parent, name)?;
        let fh = self.driver.create(&path, flags as i32).await.map_err(errno)?;
        let attr = self.driver.getattr(&path, None).await.map_err(errno)?;
        let ino = self.ino_for(&path);
        Ok(ReplyCreated {
            ttl: TTL,
            attr: to_fuse_attr(&attr, ino),
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        self.driver
            .symlink(&path, Path::new(link))
            .await
            .map_err(errno)?;
        let attr = self.driver.getattr(&path, None).await.map_err(errno)?;
        let ino = self.ino_for(&path);
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(&attr, ino),
            generation: 0,
        })
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        self.driver.unlink(&path).await.map_err(errno)?;
        self.inodes.lock().unwrap().forget_path(&path);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        self.driver.rmdir(&path).await.map_err(errno)?;
        self.inodes.lock().unwrap().forget_path(&path);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let old = self.child_path(parent, name)?;
        let new = self.child_path(new_parent, new_name)?;
        self.driver.rename(&old, &new).await.map_err(errno)?;
        let mut inodes = self.inodes.lock().unwrap();
        inodes.forget_path(&old);
        inodes.forget_path(&new);
        Ok(())
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        // Conservative constants; the backing tree's real numbers are not
        // meaningful through the remote-fetch layer.
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn flush(&self, _req: Request, _inode: u64, _fh: u64, _lock_owner: u64) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}
