//! Durable mirror of the corpus: one file per program, named by the hex
//! SHA-256 of its content.

use crate::HashSet;
use sha2::{Digest, Sha256};
use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

/// Content key of a blob: lowercase hex of its SHA-256.
pub fn content_key(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// On-disk set of opaque blobs keyed by content hash.
///
/// Individual file errors during `open` and `minimize` are logged and
/// skipped; losing the newest entries across a crash is acceptable, so
/// writes are not fsynced.
pub struct PersistentSet {
    dir: PathBuf,
    keys: HashSet<String>,
    entries: Vec<(String, Vec<u8>)>,
}

impl PersistentSet {
    /// Load every regular file in `dir`, creating the directory if
    /// missing. A file whose name does not match its content hash, or
    /// whose content fails `validator`, is deleted. Surviving entries
    /// are returned in a deterministic (key-sorted) order.
    pub fn open<F>(dir: &Path, validator: F) -> io::Result<Self>
    where
        F: Fn(&[u8]) -> bool,
    {
        fs::create_dir_all(dir)?;
        let mut entries = Vec::new();
        for dent in fs::read_dir(dir)? {
            let dent = match dent {
                Ok(dent) => dent,
                Err(err) => {
                    log::warn!("corpus dir entry unreadable: {}", err);
                    continue;
                }
            };
            let path = dent.path();
            if !path.is_file() {
                continue;
            }
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(err) => {
                    log::warn!("failed to read {}: {}", path.display(), err);
                    continue;
                }
            };
            let key = content_key(&data);
            let name = dent.file_name();
            if name.to_str() != Some(key.as_str()) || !validator(&data) {
                log::warn!("deleting broken corpus entry {}", path.display());
                if let Err(err) = fs::remove_file(&path) {
                    log::warn!("failed to delete {}: {}", path.display(), err);
                }
                continue;
            }
            entries.push((key, data));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let keys = entries.iter().map(|(key, _)| key.clone()).collect();
        Ok(Self {
            dir: dir.to_path_buf(),
            keys,
            entries,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Entries loaded by `open`, key-sorted. Not updated by `add`.
    pub fn entries(&self) -> &[(String, Vec<u8>)] {
        &self.entries
    }

    /// Store `data` under its content key. Returns false when the key is
    /// already present. A failed write is logged and the key stays
    /// absent so a later add can retry.
    pub fn add(&mut self, data: &[u8]) -> bool {
        let key = content_key(data);
        if self.keys.contains(&key) {
            return false;
        }
        let path = self.dir.join(&key);
        if let Err(err) = fs::write(&path, data) {
            log::error!("failed to write {}: {}", path.display(), err);
            return false;
        }
        self.keys.insert(key);
        true
    }

    /// Delete every file whose key is not in `keep`. Keys in `keep` that
    /// the store does not hold are ignored.
    pub fn minimize(&mut self, keep: &HashSet<String>) {
        let drop: Vec<String> = self
            .keys
            .iter()
            .filter(|key| !keep.contains(*key))
            .cloned()
            .collect();
        for key in drop {
            let path = self.dir.join(&key);
            if let Err(err) = fs::remove_file(&path) {
                log::warn!("failed to delete {}: {}", path.display(), err);
            }
            self.keys.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_keys(dir: &Path) -> HashSet<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|d| d.unwrap().file_name().to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let blobs: Vec<&[u8]> = vec![b"read(0x0)\n", b"write(0x0)\n", b"open(0x0)\n"];
        {
            let mut set = PersistentSet::open(dir.path(), |_| true).unwrap();
            for blob in &blobs {
                assert!(set.add(blob));
                assert!(!set.add(blob));
            }
        }
        let set = PersistentSet::open(dir.path(), |_| true).unwrap();
        assert_eq!(set.len(), blobs.len());
        let loaded: Vec<&[u8]> = set.entries().iter().map(|(_, d)| d.as_slice()).collect();
        for blob in &blobs {
            assert!(loaded.contains(blob));
        }
    }

    #[test]
    fn open_deletes_invalid_entries() {
        let dir = tempfile::tempdir().unwrap();
        let good: &[u8] = b"read(0x0)\n";
        fs::write(dir.path().join(content_key(good)), good).unwrap();
        // name does not match content
        fs::write(dir.path().join("deadbeef"), b"garbage").unwrap();
        // name matches but the validator rejects it
        let bad: &[u8] = b"bogus";
        fs::write(dir.path().join(content_key(bad)), bad).unwrap();

        let set = PersistentSet::open(dir.path(), |data| data == good).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(disk_keys(dir.path()), set.keys);
    }

    #[test]
    fn minimize_keeps_only_keep_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = PersistentSet::open(dir.path(), |_| true).unwrap();
        let a: &[u8] = b"aaaa";
        let b: &[u8] = b"bbbb";
        let c: &[u8] = b"cccc";
        set.add(a);
        set.add(b);
        set.add(c);

        let mut keep = HashSet::default();
        keep.insert(content_key(a));
        keep.insert(content_key(c));
        keep.insert("not-in-store".to_string());
        set.minimize(&keep);

        let want: HashSet<String> = [content_key(a), content_key(c)].into_iter().collect();
        assert_eq!(set.keys, want);
        assert_eq!(disk_keys(dir.path()), want);
    }
}
