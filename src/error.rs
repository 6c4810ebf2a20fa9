//! Unified error surface for the VFS core, with an errno mapping at the FUSE
//! boundary. Classification and parse failures stay internal; only
//! genuinely unresolvable states become user-visible.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the filesystem decision layer.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {path}")]
    NotFound { path: PathBuf },

    #[error("path not under any managed dataset: {path}")]
    NotUnderManagement { path: PathBuf },

    #[error("could not find a usable URL for {path} within {dataset}")]
    NoUsableSource { path: PathBuf, dataset: PathBuf },

    #[error("read-only filesystem: {path}")]
    ReadOnlyFilesystem { path: PathBuf },

    #[error("not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("unknown file handle {fh}")]
    BadHandle { fh: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Map onto the numeric error code handed back to the kernel.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound { .. } => libc::ENOENT,
            FsError::NotUnderManagement { .. } => libc::ENOENT,
            FsError::NoUsableSource { .. } => libc::EIO,
            FsError::ReadOnlyFilesystem { .. } => libc::EROFS,
            FsError::NotADirectory { .. } => libc::ENOTDIR,
            FsError::BadHandle { .. } => libc::EBADF,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Errors from the fetch layer. `NotFound` and `BlocksizeMismatch` drive the
/// candidate loop in `fetch::open_first_viable`; everything else has already
/// been retried by the transport and advances the loop as well.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("remote object not found at {url}")]
    NotFound { url: String },

    #[error("cached blocks for {url} were written with block size {cached}, expected {requested}")]
    BlocksizeMismatch {
        url: String,
        cached: u64,
        requested: u64,
    },

    #[error("request to {url} failed after {attempts} attempts: {source}")]
    Exhausted {
        url: String,
        attempts: usize,
        source: reqwest::Error,
    },

    #[error("unexpected status {status} from {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("invalid url {url}: {reason}")]
    BadUrl { url: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}

pub type FsResult<T> = Result<T, FsError>;
