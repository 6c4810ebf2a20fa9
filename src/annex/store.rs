//! Query interface to the content-tracking layer (git-annex), plus a static
//! in-memory implementation for tests.
//!
//! The VFS core only ever issues pure queries here; the sole mutation it
//! performs on a dataset is clearing its own cache directory.

use super::key::AnnexKey;
use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::process::Command;

/// One remote location recorded for a key: the remote's identifier plus any
/// URLs recorded directly for the key at that remote.
#[derive(Debug, Clone)]
pub struct RemoteLocation {
    pub uuid: String,
    pub urls: Vec<String>,
}

/// Registry entry for a configured remote: identifier and its base URL after
/// any URL-rewrite rules have been applied.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub uuid: String,
    pub base_url: String,
}

impl RemoteEntry {
    pub fn is_http(&self) -> bool {
        is_http_url(&self.base_url)
    }
}

pub fn is_http_url(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Pure queries against the tracking layer for one dataset.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Resolved key for a tracked relative path, `None` when untracked.
    async fn lookup_key(&self, relpath: &Path) -> io::Result<Option<AnnexKey>>;

    /// Whether the key's content is materialized in the local object store.
    async fn content_present(&self, key: &AnnexKey) -> io::Result<bool>;

    /// Remote locations recorded for the key, in recorded order.
    async fn whereis(&self, key: &AnnexKey) -> io::Result<Vec<RemoteLocation>>;

    /// Configured remotes with known base URLs.
    async fn remotes(&self) -> io::Result<Vec<RemoteEntry>>;

    /// Commit time of the dataset's current tip.
    async fn commit_timestamp(&self) -> io::Result<SystemTime>;
}

/// `TrackingStore` backed by the `git`/`git-annex` command line tools.
pub struct GitAnnexStore {
    root: PathBuf,
}

impl GitAnnexStore {
    /// Open the store for `root`, returning `None` when the repository has no
    /// annex (plain git directory).
    pub async fn detect(root: &Path) -> io::Result<Option<Self>> {
        let store = Self {
            root: root.to_path_buf(),
        };
        match store.git(&["config", "annex.uuid"]).await {
            Ok(uuid) if !uuid.trim().is_empty() => Ok(Some(store)),
            _ => Ok(None),
        }
    }

    async fn git(&self, args: &[&str]) -> io::Result<String> {
        let out = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await?;
        if !out.status.success() {
            return Err(io::Error::other(format!(
                "git {} exited with {}",
                args.first().copied().unwrap_or(""),
                out.status
            )));
        }
        String::from_utf8(out.stdout).map_err(|e| io::Error::other(e.to_string()))
    }

    /// Path of the key's object file under the non-bare layout.
    fn object_path(&self, key: &AnnexKey) -> PathBuf {
        let file = key.key_filename();
        self.root
            .join(".git/annex/objects")
            .join(key.hash_dir_mixed())
            .join(&file)
            .join(&file)
    }
}

#[derive(Deserialize)]
struct WhereisRecord {
    whereis: Vec<WhereisEntry>,
}

#[derive(Deserialize)]
struct WhereisEntry {
    uuid: String,
    #[serde(default)]
    urls: Vec<String>,
}

#[async_trait]
impl TrackingStore for GitAnnexStore {
    async fn lookup_key(&self, relpath: &Path) -> io::Result<Option<AnnexKey>> {
        let rel = relpath.to_string_lossy();
        match self.git(&["annex", "lookupkey", "--", rel.as_ref()]).await {
            Ok(out) => Ok(AnnexKey::parse(out.trim()).ok()),
            // lookupkey exits non-zero for untracked paths.
            Err(_) => Ok(None),
        }
    }

    async fn content_present(&self, key: &AnnexKey) -> io::Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(key))
            .await
            .unwrap_or(false))
    }

    async fn whereis(&self, key: &AnnexKey) -> io::Result<Vec<RemoteLocation>> {
        let text = key.to_string();
        let out = self
            .git(&["annex", "whereis", "--json", "--key", &text])
            .await?;
        let mut locations = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            let record: WhereisRecord = serde_json::from_str(line)
                .map_err(|e| io::Error::other(format!("whereis output: {e}")))?;
            for entry in record.whereis {
                locations.push(RemoteLocation {
                    uuid: entry.uuid,
                    urls: entry.urls,
                });
            }
        }
        Ok(locations)
    }

    async fn remotes(&self) -> io::Result<Vec<RemoteEntry>> {
        let config = self.git(&["config", "--list"]).await?;
        let mut rewrites: Vec<(String, String)> = Vec::new(); // insteadOf -> base
        for line in config.lines() {
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            if let Some(base) = k
                .strip_prefix("url.")
                .and_then(|rest| rest.strip_suffix(".insteadof"))
            {
                rewrites.push((v.to_string(), base.to_string()));
            }
        }
        // Longest matching prefix wins, as in git's own rewriting.
        rewrites.sort_by_key(|(from, _)| std::cmp::Reverse(from.len()));

        let mut entries = Vec::new();
        let mut names: Vec<String> = Vec::new();
        for line in config.lines() {
            if let Some(rest) = line.strip_prefix("remote.") {
                if let Some((name, _)) = rest.split_once(".annex-uuid=") {
                    if !names.iter().any(|n| n == name) {
                        names.push(name.to_string());
                    }
                }
            }
        }
        for name in names {
            let uuid = config
                .lines()
                .find_map(|l| l.strip_prefix(&format!("remote.{name}.annex-uuid=")));
            let url = config
                .lines()
                .find_map(|l| l.strip_prefix(&format!("remote.{name}.url=")));
            let (Some(uuid), Some(url)) = (uuid, url) else {
                continue;
            };
            let mut url = url.to_string();
            for (from, to) in &rewrites {
                if url.starts_with(from.as_str()) {
                    url = format!("{to}{}", &url[from.len()..]);
                    break;
                }
            }
            entries.push(RemoteEntry {
                uuid: uuid.to_string(),
                base_url: url,
            });
        }
        Ok(entries)
    }

    async fn commit_timestamp(&self) -> io::Result<SystemTime> {
        let out = self.git(&["log", "-1", "--format=%ct"]).await?;
        let secs: u64 = out
            .trim()
            .parse()
            .map_err(|_| io::Error::other("unparseable commit timestamp"))?;
        Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }
}

/// Fixed-table store used by tests: keys, content flags, locations and
/// remotes are provided up front.
#[derive(Default)]
pub struct StaticTrackingStore {
    pub keys: Vec<(PathBuf, AnnexKey)>,
    pub present: Vec<AnnexKey>,
    pub locations: Vec<(AnnexKey, Vec<RemoteLocation>)>,
    pub remote_entries: Vec<RemoteEntry>,
    pub commit_time: Option<SystemTime>,
}

#[async_trait]
impl TrackingStore for StaticTrackingStore {
    async fn lookup_key(&self, relpath: &Path) -> io::Result<Option<AnnexKey>> {
        Ok(self
            .keys
            .iter()
            .find(|(p, _)| p == relpath)
            .map(|(_, k)| k.clone()))
    }

    async fn content_present(&self, key: &AnnexKey) -> io::Result<bool> {
        Ok(self.present.contains(key))
    }

    async fn whereis(&self, key: &AnnexKey) -> io::Result<Vec<RemoteLocation>> {
        Ok(self
            .locations
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, l)| l.clone())
            .unwrap_or_default())
    }

    async fn remotes(&self) -> io::Result<Vec<RemoteEntry>> {
        Ok(self.remote_entries.clone())
    }

    async fn commit_timestamp(&self) -> io::Result<SystemTime> {
        Ok(self.commit_time.unwrap_or(SystemTime::UNIX_EPOCH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_store_round_trip() {
        let key = AnnexKey::parse("MD5-s3--abc").unwrap();
        let store = StaticTrackingStore {
            keys: vec![(PathBuf::from("data/file.bin"), key.clone())],
            present: vec![],
            locations: vec![(
                key.clone(),
                vec![RemoteLocation {
                    uuid: "u1".into(),
                    urls: vec!["https://example.com/file.bin".into()],
                }],
            )],
            remote_entries: vec![RemoteEntry {
                uuid: "u1".into(),
                base_url: "https://example.com/repo".into(),
            }],
            commit_time: None,
        };
        assert_eq!(
            store
                .lookup_key(Path::new("data/file.bin"))
                .await
                .unwrap()
                .as_ref(),
            Some(&key)
        );
        assert!(!store.content_present(&key).await.unwrap());
        assert_eq!(store.whereis(&key).await.unwrap().len(), 1);
        assert!(store.remotes().await.unwrap()[0].is_http());
    }
}
