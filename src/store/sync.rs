//! Full-state sync between peers.
//!
//! The serving side streams its dump; the pulling side replays it as local,
//! non-replicated writes. Tombstones keep a recent delete from being undone:
//! - a remote value whose key has a live local tombstone is skipped
//! - a remote tombstone is recorded only when the key has no local value,
//!   and never removes a live value

use crate::common::Result;
use crate::proto::SyncEntry;
use crate::store::engine::{DumpEntry, Store};
use crate::store::replicated::SyncStream;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::trace;

/// Outcome of one peer sync.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Values written locally.
    pub applied: usize,
    /// Entries not applied because local state takes precedence.
    pub skipped: usize,
    /// Remote tombstones recorded locally.
    pub tombstones: usize,
}

impl From<DumpEntry> for SyncEntry {
    fn from(entry: DumpEntry) -> Self {
        match entry {
            DumpEntry::Value(kv) => SyncEntry {
                bucket: kv.bucket,
                key: kv.key,
                value: kv.value,
                tombstone: false,
                deleted_at: 0,
            },
            DumpEntry::Tombstone(t) => SyncEntry {
                bucket: t.bucket,
                key: t.key,
                value: Vec::new(),
                tombstone: true,
                deleted_at: t.deleted_at,
            },
        }
    }
}

/// Apply one remote entry.
pub fn apply_entry(store: &Store, entry: &SyncEntry, report: &mut SyncReport) -> Result<()> {
    if entry.tombstone {
        if store.record_tombstone_if_absent(&entry.bucket, &entry.key, entry.deleted_at)? {
            report.tombstones += 1;
        } else {
            report.skipped += 1;
        }
    } else if store.set_unless_tombstoned(&entry.bucket, &entry.key, &entry.value)? {
        report.applied += 1;
    } else {
        trace!(bucket = %entry.bucket, key = %entry.key, "skipping value deleted locally");
        report.skipped += 1;
    }
    Ok(())
}

/// Consume a peer's sync stream. Entries are applied as they arrive, so an
/// interrupted stream leaves the earlier entries in place.
pub async fn apply_stream(store: &Store, mut entries: SyncStream) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    while let Some(entry) = entries.next().await {
        apply_entry(store, &entry?, &mut report)?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use crate::store::engine::{KeyValue, Tombstone};
    use futures_util::stream;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_dump_entry_conversion() {
        let value: SyncEntry = DumpEntry::Value(KeyValue {
            bucket: "b".into(),
            key: "k".into(),
            value: b"v".to_vec(),
        })
        .into();
        assert!(!value.tombstone);
        assert_eq!(value.value, b"v");

        let tomb: SyncEntry = DumpEntry::Tombstone(Tombstone {
            bucket: "b".into(),
            key: "k".into(),
            deleted_at: 5,
        })
        .into();
        assert!(tomb.tombstone);
        assert_eq!(tomb.deleted_at, 5);
    }

    #[tokio::test]
    async fn test_interrupted_stream_keeps_applied_entries() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("store"), Duration::from_secs(1)).unwrap();

        let entries: Vec<Result<SyncEntry>> = vec![
            Ok(SyncEntry {
                bucket: "apps".into(),
                key: "web".into(),
                value: b"1".to_vec(),
                tombstone: false,
                deleted_at: 0,
            }),
            Err(Error::ConnectionFailed("reset".into())),
        ];
        let result = apply_stream(&store, stream::iter(entries).boxed()).await;
        assert!(result.is_err());
        assert_eq!(store.get("apps", "web").unwrap(), b"1");
    }
}
