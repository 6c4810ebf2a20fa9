//! Object-store path classification: decide whether a path is outside the
//! managed area, one of the container directories of the hash-sharded store,
//! or a fully-identified content key.

use super::key::AnnexKey;
use std::path::{Component, Path, PathBuf};

pub const GIT_DIR: &str = ".git";
pub const ANNEX_DIR: &str = "annex";
pub const OBJECTS_DIR: &str = "objects";

/// Result of classifying a path against the object-store layout.
///
/// Closed union, matched exhaustively at every consumption site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathState {
    /// Not inside any object store.
    NotManaged,
    /// One of the directories between the metadata root and a key: the two
    /// hash levels or a per-key container. `topdir` is the dataset directory
    /// holding the `.git` entry.
    ContainerDirectory { topdir: PathBuf },
    /// A fully-identified key path (`.../objects/xx/yy/KEY/KEY`).
    Key { topdir: PathBuf, key: AnnexKey },
}

impl PathState {
    pub fn key(&self) -> Option<&AnnexKey> {
        match self {
            PathState::Key { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Two-character alphanumeric hash level.
fn is_hash_segment(s: &str) -> bool {
    s.len() == 2 && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Classify `path`. The path does not need to exist; classification is a
/// pure function of its components.
///
/// The scan restarts at every `.git` occurrence so that sub-repositories
/// embedded arbitrarily deep (including under another repository's `.git`)
/// are recognized.
pub fn classify(path: &Path) -> PathState {
    let parts: Vec<&str> = path
        .components()
        .map(|c| match c {
            Component::Normal(s) => s.to_str().unwrap_or(""),
            Component::RootDir => "/",
            Component::Prefix(_) => "",
            Component::CurDir => ".",
            Component::ParentDir => "..",
        })
        .collect();

    let mut start = 0;
    while let Some(i) = parts[start..]
        .iter()
        .position(|p| *p == GIT_DIR)
        .map(|off| start + off)
    {
        start = i + 1;
        if parts.get(i + 1).copied() != Some(ANNEX_DIR)
            || parts.get(i + 2).copied() != Some(OBJECTS_DIR)
        {
            continue;
        }
        if !parts[i + 3..(i + 5).min(parts.len())]
            .iter()
            .all(|p| is_hash_segment(p))
        {
            continue;
        }
        let topdir: PathBuf = if i == 0 {
            PathBuf::from(".")
        } else {
            parts[..i].iter().collect()
        };
        // Components from `.git` inclusive: 5 reaches the second hash level,
        // 6 the per-key container, 7 an individual key file.
        let depth = parts.len() - i;
        if depth <= 5 {
            return PathState::ContainerDirectory { topdir };
        }
        match AnnexKey::parse_filename(parts[i + 5]) {
            Ok(key) => {
                if depth == 7 && parts[parts.len() - 1] == parts[parts.len() - 2] {
                    return PathState::Key { topdir, key };
                } else if depth == 6 {
                    return PathState::ContainerDirectory { topdir };
                }
            }
            Err(_) => {}
        }
    }
    PathState::NotManaged
}
