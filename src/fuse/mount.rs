//! Mount helpers for starting/stopping the FUSE session.
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux unprivileged mounting via
//!   fusermount3 is preferred.
//! - Thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;

use crate::fuse::AnnexFuse;

fn default_mount_options() -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("annexfs");
    // Keep defaults conservative: no allow_other, require empty mountpoint.
    mo
}

/// Mount the filesystem on `mount_point` using unprivileged mode when
/// available (requires fusermount3 in PATH).
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: AnnexFuse,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let opts = default_mount_options();
    let session = rfuse3::raw::Session::new(opts);
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: AnnexFuse,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
