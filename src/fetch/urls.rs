//! Candidate URL derivation: directly recorded web URLs first, then
//! object-store paths derived from each located remote's base URL.

use crate::annex::key::AnnexKey;
use crate::annex::store::{RemoteEntry, RemoteLocation, is_http_url};
use std::collections::HashMap;

/// Ordered candidate URLs for fetching `key`.
///
/// Ordering is significant and recomputed on every call:
/// 1. every URL recorded directly for the key, in recorded order;
/// 2. per located remote with an HTTP(S) base URL, the derived object-store
///    paths: lower-case hash sharding strictly before mixed-case, and for
///    base URLs not already pointing at a metadata root the same two paths
///    again under the `.git/` prefix.
pub fn candidate_urls(
    key: &AnnexKey,
    locations: &[RemoteLocation],
    remotes: &[RemoteEntry],
) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for loc in locations {
        for url in &loc.urls {
            if is_http_url(url) {
                urls.push(url.clone());
            }
        }
    }

    let by_uuid: HashMap<&str, &RemoteEntry> = remotes
        .iter()
        .filter(|r| r.is_http())
        .map(|r| (r.uuid.as_str(), r))
        .collect();

    let file = key.key_filename();
    let rel_lower = format!("annex/objects/{}/{file}/{file}", key.hash_dir_lower());
    let rel_mixed = format!("annex/objects/{}/{file}/{file}", key.hash_dir_mixed());

    for loc in locations {
        let Some(remote) = by_uuid.get(loc.uuid.as_str()) else {
            continue;
        };
        let base = remote.base_url.trim_end_matches('/');
        let paths: Vec<String> = if base.to_ascii_lowercase().ends_with("/.git") {
            // The base already points inside the metadata area.
            vec![rel_lower.clone(), rel_mixed.clone()]
        } else {
            vec![
                rel_lower.clone(),
                rel_mixed.clone(),
                format!(".git/{rel_lower}"),
                format!(".git/{rel_mixed}"),
            ]
        };
        for p in paths {
            urls.push(format!("{base}/{p}"));
        }
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AnnexKey {
        AnnexKey::parse("MD5E-s1064--8804d3d11f17e33bd912f1f0947afdb9.json").unwrap()
    }

    fn loc(uuid: &str, urls: &[&str]) -> RemoteLocation {
        RemoteLocation {
            uuid: uuid.into(),
            urls: urls.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn remote(uuid: &str, base: &str) -> RemoteEntry {
        RemoteEntry {
            uuid: uuid.into(),
            base_url: base.into(),
        }
    }

    #[test]
    fn web_urls_come_first_in_recorded_order() {
        let k = key();
        let locations = vec![
            loc("u1", &["https://a.example/x", "ssh://ignored/y"]),
            loc("u2", &["http://b.example/z"]),
        ];
        let remotes = vec![remote("u2", "https://b.example/repo")];
        let urls = candidate_urls(&k, &locations, &remotes);
        assert_eq!(urls[0], "https://a.example/x");
        assert_eq!(urls[1], "http://b.example/z");
        assert!(urls[2].starts_with("https://b.example/repo/annex/objects/"));
    }

    #[test]
    fn lower_hash_strictly_before_mixed_for_any_remote_set() {
        let k = key();
        let lower = k.hash_dir_lower();
        let mixed = k.hash_dir_mixed();
        for base in [
            "https://mirror.example/data",
            "https://mirror.example/data/.git",
            "https://mirror.example/data/.GIT/",
        ] {
            let urls = candidate_urls(
                &k,
                &[loc("u1", &[])],
                &[remote("u1", base)],
            );
            let pos_lower = urls.iter().position(|u| u.contains(&lower)).unwrap();
            let pos_mixed = urls.iter().position(|u| u.contains(&mixed)).unwrap();
            assert!(pos_lower < pos_mixed, "{base}: {urls:?}");
        }
    }

    #[test]
    fn metadata_root_base_yields_two_candidates_others_four() {
        let k = key();
        let git_base = candidate_urls(
            &k,
            &[loc("u1", &[])],
            &[remote("u1", "https://mirror.example/ds/.git")],
        );
        assert_eq!(git_base.len(), 2);
        assert!(git_base.iter().all(|u| !u.contains("/.git/.git/")));

        let plain_base = candidate_urls(
            &k,
            &[loc("u1", &[])],
            &[remote("u1", "https://mirror.example/ds")],
        );
        assert_eq!(plain_base.len(), 4);
        assert!(plain_base[2].contains("/.git/annex/objects/"));
        assert!(plain_base[3].contains("/.git/annex/objects/"));
    }

    #[test]
    fn unreachable_remotes_are_skipped() {
        let k = key();
        let urls = candidate_urls(
            &k,
            &[loc("u1", &[]), loc("u2", &[])],
            &[
                remote("u1", "ssh://host/repo"),
                // no entry at all for u2
            ],
        );
        assert!(urls.is_empty());
    }

    #[test]
    fn derived_paths_use_escaped_key_filename() {
        let k = AnnexKey::parse("URL--http://127.0.0.1:55485/binary.png").unwrap();
        let urls = candidate_urls(
            &k,
            &[loc("u1", &[])],
            &[remote("u1", "https://mirror.example/ds/.git")],
        );
        assert!(urls[0].ends_with("URL--http&c%%127.0.0.1&c55485%binary.png"));
    }
}
