//! Local storage engine on sled
//!
//! Layout:
//! - one sled tree per application bucket
//! - `__tombstones__`: `bucket \0 key` -> deletion time (u64 BE, unix ms)
//! - `__peers__`: peer id -> gossip address, local only
//!
//! All mutations go through one store-wide critical section. Point reads
//! and searches do not block writers; full dumps and backups hold the
//! critical section so they see one point in time.

use crate::common::{crc32, timestamp_now_millis, validate_bucket, validate_key, Error, Result};
use serde::{Deserialize, Serialize};
use sled::transaction::{TransactionError, TransactionResult, Transactional};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const TOMBSTONE_TREE: &str = "__tombstones__";
pub const PEER_CACHE_TREE: &str = "__peers__";

const SNAPSHOT_MAGIC: &[u8; 8] = b"FKVSNAP1";
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub bucket: String,
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub bucket: String,
    pub key: String,
    /// Unix milliseconds
    pub deleted_at: u64,
}

/// One record of a full store dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpEntry {
    Value(KeyValue),
    Tombstone(Tombstone),
}

/// Serialized form of a backup: every tree, in name order.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    created_at: u64,
    trees: Vec<TreeSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeSnapshot {
    name: String,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

pub struct Store {
    path: PathBuf,
    /// `None` only after a restore whose rollback could not reopen the store.
    db: RwLock<Option<sled::Db>>,
    write_lock: Mutex<()>,
    open_timeout: Duration,
}

impl Store {
    /// Open or create the store at `path`. Another process holding the
    /// store makes this fail with `Timeout` after `open_timeout`.
    pub fn open(path: impl AsRef<Path>, open_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = open_db(&path, open_timeout)?;
        info!(path = %path.display(), "store opened");
        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
            write_lock: Mutex::new(()),
            open_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn db(&self) -> Result<sled::Db> {
        self.db
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                Error::FailedPrecondition("store unavailable after a failed restore".into())
            })
    }

    fn critical_section(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tree(&self, name: &str) -> Result<sled::Tree> {
        Ok(self.db()?.open_tree(name)?)
    }

    /// Open an application bucket that must already exist.
    fn existing_bucket(&self, bucket: &str) -> Result<sled::Tree> {
        validate_app_bucket(bucket)?;
        let db = self.db()?;
        let exists = db
            .tree_names()
            .iter()
            .any(|name| &name[..] == bucket.as_bytes());
        if !exists {
            return Err(Error::BucketNotFound(bucket.to_string()));
        }
        Ok(db.open_tree(bucket)?)
    }

    /// Create a bucket if it does not exist. Existing keys are untouched.
    pub fn create_bucket(&self, bucket: &str) -> Result<()> {
        validate_app_bucket(bucket)?;
        let _guard = self.critical_section();
        self.tree(bucket)?;
        debug!(bucket, "bucket ready");
        Ok(())
    }

    /// Application bucket names, sorted.
    pub fn buckets(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .db()?
            .tree_names()
            .iter()
            .filter_map(|name| std::str::from_utf8(name).ok().map(str::to_string))
            .filter(|name| !is_reserved(name))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Upsert a value, creating the bucket if needed. Clears any tombstone
    /// for the key.
    pub fn set(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()> {
        validate_app_bucket(bucket)?;
        validate_key(key)?;
        let _guard = self.critical_section();
        self.write_value(bucket, key, value)
    }

    fn write_value(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()> {
        let tree = self.tree(bucket)?;
        let tombstones = self.tree(TOMBSTONE_TREE)?;
        let marker = tombstone_key(bucket, key);

        let result: TransactionResult<()> = (&tree, &tombstones).transaction(|(tree, tombstones)| {
            tree.insert(key.as_bytes(), value)?;
            tombstones.remove(marker.as_slice())?;
            Ok(())
        });
        result.map_err(transaction_error)
    }

    /// Read a value. A missing key reads as an empty value.
    pub fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let tree = self.existing_bucket(bucket)?;
        Ok(tree.get(key.as_bytes())?.map(|v| v.to_vec()).unwrap_or_default())
    }

    /// Remove a key and record a tombstone for it.
    pub fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        validate_key(key)?;
        let _guard = self.critical_section();
        let tree = self.existing_bucket(bucket)?;
        let tombstones = self.tree(TOMBSTONE_TREE)?;
        let marker = tombstone_key(bucket, key);
        let now = timestamp_now_millis().to_be_bytes();

        let result: TransactionResult<()> = (&tree, &tombstones).transaction(|(tree, tombstones)| {
            tree.remove(key.as_bytes())?;
            tombstones.insert(marker.as_slice(), &now[..])?;
            Ok(())
        });
        result.map_err(transaction_error)?;
        debug!(bucket, key, "key deleted");
        Ok(())
    }

    /// Entries whose key starts with `prefix`, in ascending key order.
    pub fn search(&self, bucket: &str, prefix: &str) -> Result<Vec<KeyValue>> {
        let tree = self.existing_bucket(bucket)?;
        tree.scan_prefix(prefix.as_bytes())
            .map(|item| {
                let (key, value) = item?;
                Ok(KeyValue {
                    bucket: bucket.to_string(),
                    key: decode_utf8(&key)?,
                    value: value.to_vec(),
                })
            })
            .collect()
    }

    pub fn tombstone(&self, bucket: &str, key: &str) -> Result<Option<u64>> {
        let tombstones = self.tree(TOMBSTONE_TREE)?;
        match tombstones.get(tombstone_key(bucket, key))? {
            Some(raw) => Ok(Some(decode_timestamp(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn tombstones(&self) -> Result<Vec<Tombstone>> {
        self.tree(TOMBSTONE_TREE)?
            .iter()
            .map(|item| {
                let (marker, raw) = item?;
                decode_tombstone(&marker, &raw)
            })
            .collect()
    }

    /// Remove tombstones older than `ttl` as of `now` (unix ms). Returns how
    /// many were removed.
    pub fn prune_tombstones(&self, now: u64, ttl: Duration) -> Result<usize> {
        let ttl_ms = ttl.as_millis() as u64;
        let _guard = self.critical_section();
        let tombstones = self.tree(TOMBSTONE_TREE)?;

        let mut pruned = 0;
        for item in tombstones.iter() {
            let (marker, raw) = item?;
            let deleted_at = match decode_timestamp(&raw) {
                Ok(ts) => ts,
                Err(e) => {
                    warn!("dropping unreadable tombstone: {}", e);
                    0
                }
            };
            if now > deleted_at.saturating_add(ttl_ms) {
                tombstones.remove(marker)?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(pruned, "pruned tombstones");
        }
        Ok(pruned)
    }

    /// Apply a value received from a peer unless a local tombstone for the
    /// key is still live. Returns whether the value was written.
    pub fn set_unless_tombstoned(&self, bucket: &str, key: &str, value: &[u8]) -> Result<bool> {
        validate_app_bucket(bucket)?;
        validate_key(key)?;
        let _guard = self.critical_section();
        let tombstones = self.tree(TOMBSTONE_TREE)?;
        if tombstones.contains_key(tombstone_key(bucket, key))? {
            return Ok(false);
        }
        self.write_value(bucket, key, value)?;
        Ok(true)
    }

    /// Record a tombstone received from a peer, only when the key holds no
    /// local value. Returns whether it was recorded.
    pub fn record_tombstone_if_absent(&self, bucket: &str, key: &str, deleted_at: u64) -> Result<bool> {
        validate_app_bucket(bucket)?;
        validate_key(key)?;
        let _guard = self.critical_section();
        let tree = self.tree(bucket)?;
        if tree.contains_key(key.as_bytes())? {
            return Ok(false);
        }
        let tombstones = self.tree(TOMBSTONE_TREE)?;
        let marker = tombstone_key(bucket, key);
        let newer = match tombstones.get(&marker)? {
            Some(raw) => decode_timestamp(&raw).map(|ts| ts.max(deleted_at)).unwrap_or(deleted_at),
            None => deleted_at,
        };
        tombstones.insert(marker, &newer.to_be_bytes()[..])?;
        Ok(true)
    }

    /// Remember a peer's gossip address for restart bootstrap. Entries for
    /// other ids at the same address are dropped. Returns whether anything
    /// was written.
    pub fn cache_peer(&self, id: &str, address: &str) -> Result<bool> {
        let tree = self.tree(PEER_CACHE_TREE)?;
        if tree.get(id.as_bytes())?.as_deref() == Some(address.as_bytes()) {
            return Ok(false);
        }

        let _guard = self.critical_section();
        let stale: Vec<sled::IVec> = tree
            .iter()
            .filter_map(|item| item.ok())
            .filter(|(key, value)| &value[..] == address.as_bytes() && &key[..] != id.as_bytes())
            .map(|(key, _)| key)
            .collect();
        for key in stale {
            tree.remove(key)?;
        }
        tree.insert(id.as_bytes(), address.as_bytes())?;
        debug!(peer = id, address, "peer cached");
        Ok(true)
    }

    /// Cached gossip addresses, in peer id order.
    pub fn cached_peer_addresses(&self) -> Result<Vec<String>> {
        self.tree(PEER_CACHE_TREE)?
            .iter()
            .map(|item| {
                let (_, address) = item?;
                decode_utf8(&address)
            })
            .collect()
    }

    /// Full ordered dump: application buckets in name order, keys in order,
    /// then tombstones. The peer cache is never included.
    pub fn dump(&self) -> Result<Vec<DumpEntry>> {
        let _guard = self.critical_section();
        let mut entries = Vec::new();
        for bucket in self.buckets()? {
            for item in self.tree(&bucket)?.iter() {
                let (key, value) = item?;
                entries.push(DumpEntry::Value(KeyValue {
                    bucket: bucket.clone(),
                    key: decode_utf8(&key)?,
                    value: value.to_vec(),
                }));
            }
        }
        for tombstone in self.tombstones()? {
            entries.push(DumpEntry::Tombstone(tombstone));
        }
        Ok(entries)
    }

    pub fn flush(&self) -> Result<()> {
        self.db()?.flush()?;
        Ok(())
    }

    /// Binary snapshot of every tree: magic, CRC32 of the payload (BE),
    /// bincode payload.
    pub fn backup(&self) -> Result<Vec<u8>> {
        let _guard = self.critical_section();
        let db = self.db()?;

        let mut names: Vec<String> = db
            .tree_names()
            .iter()
            .filter_map(|name| std::str::from_utf8(name).ok().map(str::to_string))
            .filter(|name| !name.starts_with("__sled__"))
            .collect();
        names.sort();

        let mut trees = Vec::with_capacity(names.len());
        for name in names {
            let tree = db.open_tree(&name)?;
            let entries = tree
                .iter()
                .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())))
                .collect::<std::result::Result<Vec<_>, sled::Error>>()?;
            trees.push(TreeSnapshot { name, entries });
        }

        let snapshot = Snapshot {
            created_at: timestamp_now_millis(),
            trees,
        };
        let payload = bincode::serialize(&snapshot)?;
        let mut out = Vec::with_capacity(payload.len() + 12);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&crc32(&payload).to_be_bytes());
        out.extend_from_slice(&payload);
        info!(trees = snapshot.trees.len(), bytes = out.len(), "store backup taken");
        Ok(out)
    }

    /// Replace the whole store with a backup.
    ///
    /// The snapshot is verified and written to a staging directory first.
    /// The live database is then closed, the directories are swapped and the
    /// store is reopened. On any failure the previous directory is put back
    /// and reopened; if even that fails the store rejects every operation
    /// with `FailedPrecondition` instead of running on a throwaway database.
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let snapshot = decode_snapshot(bytes)?;
        let _guard = self.critical_section();

        let staging = self.path.with_extension("restore");
        let previous = self.path.with_extension("previous");
        remove_dir_if_exists(&staging)?;
        remove_dir_if_exists(&previous)?;
        write_staging(&staging, &snapshot)?;

        let mut db = self.db.write().unwrap_or_else(|e| e.into_inner());
        if let Some(live) = db.as_ref() {
            live.flush()?;
        }
        // Closing the live database releases its file lock.
        drop(db.take());

        match self.swap_in(&staging, &previous) {
            Ok(restored) => {
                *db = Some(restored);
                drop(db);
                if let Err(e) = std::fs::remove_dir_all(&previous) {
                    warn!(path = %previous.display(), "failed to remove previous store: {}", e);
                }
                info!(trees = snapshot.trees.len(), "store restored from backup");
                Ok(())
            }
            Err(e) => {
                warn!("restore failed, rolling back: {}", e);
                *db = self.roll_back(&previous);
                Err(e)
            }
        }
    }

    fn swap_in(&self, staging: &Path, previous: &Path) -> Result<sled::Db> {
        std::fs::rename(&self.path, previous)?;
        std::fs::rename(staging, &self.path)?;
        open_db(&self.path, self.open_timeout)
    }

    /// Put the pre-restore directory back, if it was moved, and reopen it.
    fn roll_back(&self, previous: &Path) -> Option<sled::Db> {
        if previous.exists() {
            if let Err(e) = remove_dir_if_exists(&self.path) {
                error!(path = %self.path.display(), "failed to clear restored store: {}", e);
            }
            if let Err(e) = std::fs::rename(previous, &self.path) {
                error!(path = %previous.display(), "failed to move previous store back: {}", e);
            }
        }
        match open_db(&self.path, self.open_timeout) {
            Ok(db) => Some(db),
            Err(e) => {
                error!(path = %self.path.display(), "store unavailable after failed restore: {}", e);
                None
            }
        }
    }
}

fn open_db(path: &Path, timeout: Duration) -> Result<sled::Db> {
    let deadline = Instant::now() + timeout;
    loop {
        match sled::Config::new().path(path).open() {
            Ok(db) => return Ok(db),
            // Held by another handle: the file lock is exclusive.
            Err(sled::Error::Io(e)) if Instant::now() < deadline => {
                debug!(path = %path.display(), "store locked, retrying: {}", e);
                std::thread::sleep(OPEN_RETRY_INTERVAL);
            }
            Err(sled::Error::Io(e)) => {
                return Err(Error::Timeout(format!(
                    "opening store {}: {}",
                    path.display(),
                    e
                )))
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn write_staging(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let db = sled::Config::new().path(path).open()?;
    for tree_snapshot in &snapshot.trees {
        let tree = db.open_tree(&tree_snapshot.name)?;
        let mut batch = sled::Batch::default();
        for (key, value) in &tree_snapshot.entries {
            batch.insert(key.as_slice(), value.as_slice());
        }
        tree.apply_batch(batch)?;
    }
    db.flush()?;
    Ok(())
}

fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    if bytes.len() < 12 || &bytes[..8] != SNAPSHOT_MAGIC {
        return Err(Error::Corrupted("invalid snapshot header".into()));
    }
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&bytes[8..12]);
    let expected = u32::from_be_bytes(checksum);
    let payload = &bytes[12..];
    let actual = crc32(payload);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    bincode::deserialize(payload).map_err(|e| Error::Corrupted(e.to_string()))
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_reserved(name: &str) -> bool {
    name.starts_with("__")
}

fn validate_app_bucket(bucket: &str) -> Result<()> {
    validate_bucket(bucket)?;
    if is_reserved(bucket) {
        return Err(Error::InvalidArgument(format!(
            "bucket name {:?} is reserved",
            bucket
        )));
    }
    Ok(())
}

fn tombstone_key(bucket: &str, key: &str) -> Vec<u8> {
    let mut marker = Vec::with_capacity(bucket.len() + key.len() + 1);
    marker.extend_from_slice(bucket.as_bytes());
    marker.push(0);
    marker.extend_from_slice(key.as_bytes());
    marker
}

fn decode_tombstone(marker: &[u8], raw: &[u8]) -> Result<Tombstone> {
    let split = marker
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::Corrupted("tombstone key without separator".into()))?;
    Ok(Tombstone {
        bucket: decode_utf8(&marker[..split])?,
        key: decode_utf8(&marker[split + 1..])?,
        deleted_at: decode_timestamp(raw)?,
    })
}

fn decode_timestamp(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| Error::Corrupted(format!("tombstone timestamp of {} bytes", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_utf8(raw: &[u8]) -> Result<String> {
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Corrupted("invalid UTF-8 in store".into()))
}

fn transaction_error(e: TransactionError<()>) -> Error {
    match e {
        TransactionError::Storage(e) => Error::Storage(e),
        TransactionError::Abort(()) => Error::Internal("store transaction aborted".into()),
    }
}
