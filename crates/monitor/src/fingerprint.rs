//! Content fingerprints keyed by path.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 4096;

/// 128-bit content digest: the leading half of a SHA-256.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Digest128([u8; 16]);

impl Digest128 {
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 32 || !hex.is_ascii() {
            return None;
        }
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(out))
    }
}

impl fmt::Display for Digest128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest128({})", self.to_hex())
    }
}

impl From<Digest128> for String {
    fn from(digest: Digest128) -> Self {
        digest.to_hex()
    }
}

impl TryFrom<String> for Digest128 {
    type Error = String;

    fn try_from(hex: String) -> std::result::Result<Self, Self::Error> {
        Self::from_hex(&hex).ok_or_else(|| format!("invalid digest: {hex}"))
    }
}

pub fn hash_reader(mut reader: impl Read) -> io::Result<Digest128> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let full = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&full[..16]);
    Ok(Digest128(out))
}

pub fn hash_file(path: &Path) -> io::Result<Digest128> {
    hash_reader(File::open(path)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub content_hash: Digest128,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sighting; the caller baselines it.
    Unseen,
    Unchanged,
    Changed,
}

/// Last observed digest per path.  Entries are never removed: a vanished
/// file's record simply never matches again.
#[derive(Debug, Default)]
pub struct FingerprintStore {
    records: HashMap<PathBuf, FileRecord>,
}

impl FingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_changed(&self, path: &Path, digest: Digest128) -> Observation {
        match self.records.get(path) {
            None => Observation::Unseen,
            Some(record) if record.content_hash == digest => Observation::Unchanged,
            Some(_) => Observation::Changed,
        }
    }

    pub fn record(&mut self, path: &Path, digest: Digest128) {
        let now = Utc::now();
        self.records
            .entry(path.to_path_buf())
            .and_modify(|r| {
                r.content_hash = digest;
                r.last_seen = now;
            })
            .or_insert_with(|| FileRecord {
                path: path.to_path_buf(),
                content_hash: digest,
                last_seen: now,
            });
    }

    pub fn get(&self, path: &Path) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Load a saved store.  A missing file is a first run; an unreadable or
    /// corrupt one is logged and also treated as a first run.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Self::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "fingerprint cache unreadable; starting fresh");
                return Self::new();
            }
        };
        match serde_json::from_str::<Vec<FileRecord>>(&raw) {
            Ok(records) => {
                debug!(path = %path.display(), count = records.len(), "fingerprint cache loaded");
                Self {
                    records: records.into_iter().map(|r| (r.path.clone(), r)).collect(),
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "fingerprint cache corrupt; starting fresh");
                Self::new()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut records: Vec<&FileRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        let rendered = serde_json::to_string_pretty(&records)?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, rendered).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn hashing_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, "print('hi')\n").unwrap();

        let first = hash_file(&path).unwrap();
        let second = hash_file(&path).unwrap();
        assert_eq!(first, second);

        let mut store = FingerprintStore::new();
        assert_eq!(store.has_changed(&path, first), Observation::Unseen);
        store.record(&path, first);
        assert_eq!(store.has_changed(&path, second), Observation::Unchanged);
    }

    #[test]
    fn content_larger_than_one_chunk_is_fully_hashed() {
        let mut big = vec![b'x'; CHUNK_SIZE * 3 + 17];
        let a = hash_reader(&big[..]).unwrap();
        *big.last_mut().unwrap() = b'y';
        let b = hash_reader(&big[..]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn store_is_keyed_by_path_not_digest() {
        let digest = hash_reader(&b"same bytes"[..]).unwrap();
        let mut store = FingerprintStore::new();
        store.record(Path::new("/p/one.txt"), digest);
        assert_eq!(store.has_changed(Path::new("/p/two.txt"), digest), Observation::Unseen);

        let other = hash_reader(&b"other bytes"[..]).unwrap();
        assert_eq!(store.has_changed(Path::new("/p/one.txt"), other), Observation::Changed);
    }

    #[test]
    fn digest_hex_round_trip() {
        let digest = hash_reader(&b"abc"[..]).unwrap();
        // First 16 bytes of SHA-256("abc").
        assert_eq!(digest.to_hex(), "ba7816bf8f01cfea414140de5dae2223");
        assert_eq!(Digest128::from_hex(&digest.to_hex()), Some(digest));
        assert!(Digest128::from_hex("zz").is_none());
    }

    #[test]
    fn save_and_load_survive_restart() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("fingerprints/project.json");
        let mut store = FingerprintStore::new();
        let digest = hash_reader(&b"content"[..]).unwrap();
        store.record(Path::new("/p/a.py"), digest);
        store.save(&cache).unwrap();

        let loaded = FingerprintStore::load(&cache);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.has_changed(Path::new("/p/a.py"), digest), Observation::Unchanged);
    }

    #[test]
    fn corrupt_cache_loads_empty() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("rules.json");
        fs::write(&cache, "{ not json").unwrap();
        assert!(FingerprintStore::load(&cache).is_empty());
        assert!(FingerprintStore::load(&dir.path().join("absent.json")).is_empty());
    }
}
