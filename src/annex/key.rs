//! Content-key grammar: parse/serialize git-annex keys and derive the two
//! hash-sharded object-store directory prefixes.

use std::fmt;
use thiserror::Error;

/// Alphabet of the legacy mixed-case directory hash (32 symbols, 5 bits each).
const MIXED_CHARS: &[u8] = b"0123456789zqjxkmvwgpfZQJXKMVWGPF";

const BACKEND_MIN: usize = 2;
const BACKEND_MAX: usize = 14;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid annex key: {text:?}")]
pub struct KeyError {
    pub text: String,
}

/// A parsed content key: `BACKEND[-sSIZE][-mMTIME][-SCHUNK-CNUM]--NAME`.
///
/// Backends ending in `E` carry the original file extension; for those the
/// trailing `.`-delimited part of the name is split out into `suffix`
/// (including the leading dot). For all other backends the name is opaque and
/// may contain arbitrary bytes including dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnnexKey {
    pub backend: String,
    pub name: String,
    pub size: Option<u64>,
    pub mtime: Option<u64>,
    pub chunk_size: Option<u64>,
    pub chunk_number: Option<u64>,
    pub suffix: Option<String>,
}

impl fmt::Display for AnnexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.backend)?;
        if let Some(size) = self.size {
            write!(f, "-s{size}")?;
        }
        if let Some(mtime) = self.mtime {
            write!(f, "-m{mtime}")?;
        }
        if let Some(chunk_size) = self.chunk_size {
            write!(f, "-S{chunk_size}")?;
        }
        if let Some(chunk_number) = self.chunk_number {
            write!(f, "-C{chunk_number}")?;
        }
        write!(f, "--{}", self.name)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "{suffix}")?;
        }
        Ok(())
    }
}

impl AnnexKey {
    /// Parse a key in its serialized form. Unknown backend tokens are
    /// accepted as opaque; only grammar violations fail.
    pub fn parse(text: &str) -> Result<Self, KeyError> {
        let err = || KeyError {
            text: text.to_string(),
        };
        let (fields, name) = text.split_once("--").ok_or_else(err)?;
        if name.is_empty() {
            return Err(err());
        }

        let mut parts = fields.split('-');
        let backend = parts.next().ok_or_else(err)?;
        if backend.len() < BACKEND_MIN
            || backend.len() > BACKEND_MAX
            || !backend
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
        {
            return Err(err());
        }

        // Optional fields, in fixed order: -sN -mN -SN-CN.
        let mut size = None;
        let mut mtime = None;
        let mut chunk_size = None;
        let mut chunk_number = None;
        let mut next = parts.next();
        if let Some(rest) = next.and_then(|p| p.strip_prefix('s')) {
            size = Some(parse_num(rest).ok_or_else(err)?);
            next = parts.next();
        }
        if let Some(rest) = next.and_then(|p| p.strip_prefix('m')) {
            mtime = Some(parse_num(rest).ok_or_else(err)?);
            next = parts.next();
        }
        if let Some(rest) = next.and_then(|p| p.strip_prefix('S')) {
            chunk_size = Some(parse_num(rest).ok_or_else(err)?);
            let num = parts
                .next()
                .and_then(|p| p.strip_prefix('C'))
                .ok_or_else(err)?;
            chunk_number = Some(parse_num(num).ok_or_else(err)?);
            next = parts.next();
        }
        if next.is_some() {
            return Err(err());
        }

        let (name, suffix) = if backend.ends_with('E') {
            match name.rfind('.') {
                Some(i) => (name[..i].to_string(), Some(name[i..].to_string())),
                // No extension to split off: the whole name moves into the
                // suffix so serialization still round-trips.
                None => (String::new(), Some(name.to_string())),
            }
        } else {
            (name.to_string(), None)
        };

        Ok(AnnexKey {
            backend: backend.to_string(),
            name,
            size,
            mtime,
            chunk_size,
            chunk_number,
            suffix,
        })
    }

    /// Parse a key from its on-disk file name, reversing the separator
    /// escaping applied when keys are stored as directory entries.
    pub fn parse_filename(text: &str) -> Result<Self, KeyError> {
        match text.split_once("--") {
            Some((fields, name)) => {
                let name = unescape_name(name);
                Self::parse(&format!("{fields}--{name}"))
            }
            None => Self::parse(text),
        }
    }

    /// The escaped form used as the key's file and directory name inside the
    /// object store.
    pub fn key_filename(&self) -> String {
        escape_name(&self.to_string())
    }

    /// Lower-case hash-sharding prefix (`xxx/yyy`), used by bare layouts and
    /// derived object-store URLs.
    pub fn hash_dir_lower(&self) -> String {
        let digest = md5::compute(self.non_chunk_serialized().as_bytes());
        let hexed = hex::encode(digest.0);
        format!("{}/{}", &hexed[..3], &hexed[3..6])
    }

    /// Mixed-case hash-sharding prefix (`Xx/Yy`), the non-bare object-store
    /// layout. Matches git-annex's legacy directory hash, quirks included:
    /// the digest is taken over the escaped file name and only some bit
    /// groups of its first word are used.
    pub fn hash_dir_mixed(&self) -> String {
        let key = AnnexKey {
            chunk_size: None,
            chunk_number: None,
            ..self.clone()
        };
        let digest = md5::compute(escape_name(&key.to_string()).as_bytes());
        let word = u32::from_le_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]]);
        let sym = |i: u32| MIXED_CHARS[((word >> (6 * i)) & 31) as usize] as char;
        // Adjacent symbol pairs are swapped in the legacy encoding.
        format!("{}{}/{}{}", sym(1), sym(0), sym(3), sym(2))
    }

    fn non_chunk_serialized(&self) -> String {
        AnnexKey {
            chunk_size: None,
            chunk_number: None,
            ..self.clone()
        }
        .to_string()
    }
}

fn parse_num(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Escape table for key file names: `/`↔`%`, with `%`, `&` and `:` tunneled
/// through `&`-sequences. Replacement order matters on both sides.
fn escape_name(name: &str) -> String {
    name.replace('&', "&a")
        .replace('%', "&s")
        .replace('/', "%")
        .replace(':', "&c")
}

fn unescape_name(name: &str) -> String {
    name.replace('%', "/")
        .replace("&c", ":")
        .replace("&s", "%")
        .replace("&a", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "MD5E-s1064--8804d3d11f17e33bd912f1f0947afdb9.json";
    const URL_KEY_FILE: &str = "URL--http&c%%127.0.0.1&c55485%binary.png";

    #[test]
    fn parse_sample_key() {
        let key = AnnexKey::parse(SAMPLE_KEY).unwrap();
        assert_eq!(key.backend, "MD5E");
        assert_eq!(key.size, Some(1064));
        assert_eq!(key.name, "8804d3d11f17e33bd912f1f0947afdb9");
        assert_eq!(key.suffix.as_deref(), Some(".json"));
        assert_eq!(key.mtime, None);
        assert_eq!(key.chunk_size, None);
    }

    #[test]
    fn parse_url_key_filename() {
        let key = AnnexKey::parse_filename(URL_KEY_FILE).unwrap();
        assert_eq!(key.backend, "URL");
        assert_eq!(key.name, "http://127.0.0.1:55485/binary.png");
        assert_eq!(key.suffix, None);
        assert_eq!(key.key_filename(), URL_KEY_FILE);
    }

    #[test]
    fn parse_all_fields() {
        let key = AnnexKey::parse("SHA256E-s100-m1600000000-S50-C2--abcdef.tar.gz").unwrap();
        assert_eq!(key.size, Some(100));
        assert_eq!(key.mtime, Some(1600000000));
        assert_eq!(key.chunk_size, Some(50));
        assert_eq!(key.chunk_number, Some(2));
        assert_eq!(key.name, "abcdef.tar");
        assert_eq!(key.suffix.as_deref(), Some(".gz"));
    }

    #[test]
    fn serialize_round_trips() {
        for text in [
            SAMPLE_KEY,
            "URL--http://127.0.0.1:55485/binary.png",
            "SHA256-s31390--f50d7ac4c6b9031379986bc362fcefb65f1e52621ce1708d537e740fefc59cc0",
            "SHA256E-s100-m1600000000-S50-C2--abcdef.tar.gz",
            "WORM-s15-m1234567--file.dat",
            // E-backend without a dot in the name: everything lands in the
            // suffix, serialization must still reproduce the input.
            "MD5E-s3--nodot",
        ] {
            let key = AnnexKey::parse(text).unwrap();
            assert_eq!(key.to_string(), text, "round trip of {text}");
        }
    }

    #[test]
    fn rejects_malformed() {
        for text in [
            "",
            "MD5E",
            "MD5E-s1064",
            "md5e-s10--abc",          // lower-case backend
            "M-s10--abc",             // backend too short
            "MD5E-sxyz--abc",         // non-numeric size
            "MD5E-m1-s2--abc",        // fields out of order
            "MD5E-S50--abc",          // chunk size without chunk number
            "MD5E-s10-q5--abc",       // unknown field
            "MD5E-s10--",             // empty name
            "TOOLONGBACKEND12345--x", // backend over the length bound
        ] {
            assert!(AnnexKey::parse(text).is_err(), "expected failure: {text}");
        }
    }

    #[test]
    fn filename_escape_round_trips() {
        for name in ["a/b:c%d&e", "plain", "&a&c&s%", "http://host:80/p?q=1&r=2"] {
            assert_eq!(unescape_name(&escape_name(name)), name);
        }
    }

    #[test]
    fn hash_dirs_are_stable_and_well_formed() {
        let key = AnnexKey::parse(SAMPLE_KEY).unwrap();
        let lower = key.hash_dir_lower();
        let mixed = key.hash_dir_mixed();
        assert_eq!(lower.len(), 7);
        assert_eq!(&lower[3..4], "/");
        assert!(
            lower
                .chars()
                .all(|c| c == '/' || c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        );
        assert_eq!(mixed.len(), 5);
        assert_eq!(&mixed[2..3], "/");
        // Derived prefixes are pure functions of the key.
        assert_eq!(lower, key.hash_dir_lower());
        assert_eq!(mixed, key.hash_dir_mixed());
        assert_ne!(lower, AnnexKey::parse("MD5E-s1--x.y").unwrap().hash_dir_lower());
    }

    #[test]
    fn hash_dirs_ignore_chunk_fields() {
        let plain = AnnexKey::parse("SHA256-s100--aabbcc").unwrap();
        let chunked = AnnexKey::parse("SHA256-s100-S50-C2--aabbcc").unwrap();
        assert_eq!(plain.hash_dir_lower(), chunked.hash_dir_lower());
        assert_eq!(plain.hash_dir_mixed(), chunked.hash_dir_mixed());
    }
}
