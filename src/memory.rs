//! In-memory storage with full revision history.
//!
//! Mostly useful for tests and as the base of a compressed storage that doesn't need to outlive
//! the process. Blobs are supported when a blob directory is given, in which case committed blob
//! files are moved under it.

use crate::error::{Error, Result};
use crate::storage::{
    DataRecord, Database, FinishCallback, HistoryEntry, LoadedRevision, Oid, RecordIterNext,
    ReferencesFn, Storage, Tid, TransactionIterator, TransactionMeta, TransactionRecord,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{SystemTime, UNIX_EPOCH},
};

const BLOB_SUFFIX: &str = ".blob";
const TMP_DIR: &str = "tmp";

static RESTORE_COPY: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug)]
struct Revision {
    tid: Tid,
    data: Option<Vec<u8>>,
    blob: bool,
}

#[derive(Clone, Debug)]
struct CommittedTxn {
    status: char,
    user: String,
    description: String,
    extension: BTreeMap<String, Vec<u8>>,
    oids: Vec<Oid>,
}

#[derive(Debug)]
struct PendingStore {
    oid: Oid,
    data: Option<Vec<u8>>,
    data_txn: Option<Tid>,
    blob: Option<PathBuf>,
    /// The blob is a copy this storage made, removed again if the store is dropped.
    copied: bool,
}

impl PendingStore {
    fn discard(self) {
        if let (true, Some(blob)) = (self.copied, self.blob) {
            if let Err(e) = fs::remove_file(&blob) {
                tracing::warn!(path = %blob.display(), "can't remove blob copy: {}", e);
            }
        }
    }
}

#[derive(Debug)]
struct Pending {
    txn: u64,
    tid: Option<Tid>,
    status: char,
    stores: Vec<PendingStore>,
    voted: bool,
    /// Committed, with the finish callback still running. Holds the commit slot.
    finishing: bool,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Oid, Vec<Revision>>,
    transactions: BTreeMap<Tid, CommittedTxn>,
    last_tid: Tid,
    next_oid: u64,
    pending: Option<Pending>,
    closed: bool,
    db: Option<Weak<dyn Database>>,
}

impl State {
    fn pending_for(&mut self, txn: &TransactionMeta) -> Result<&mut Pending> {
        match self.pending {
            Some(ref mut pending) if pending.txn == txn.id() && !pending.finishing => Ok(pending),
            _ => Err(Error::StorageTransaction(format!(
                "transaction {} was never begun on this storage",
                txn.id()
            ))),
        }
    }

    fn current(&self, oid: Oid) -> Option<&Revision> {
        self.objects.get(&oid).and_then(|revs| revs.last())
    }

    fn current_serial(&self, oid: Oid) -> Tid {
        self.current(oid).map_or(Tid::ZERO, |rev| rev.tid)
    }
}

/// Storage keeping every revision of every object in memory.
pub struct MemoryStorage {
    name: String,
    blob_dir: Option<PathBuf>,
    read_only: bool,
    state: Mutex<State>,
    commit: Condvar,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blob_dir: None,
            read_only: false,
            state: Mutex::new(State {
                next_oid: 1,
                ..Default::default()
            }),
            commit: Condvar::new(),
        }
    }

    /// Create a storage that keeps committed blob files under `dir`. The directory is created if
    /// missing.
    pub fn with_blob_dir(name: impl Into<String>, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(TMP_DIR))?;
        Ok(Self {
            blob_dir: Some(dir),
            ..Self::new(name)
        })
    }

    /// Refuse all writes from now on.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// The database registered with this storage, if it is still alive.
    pub fn database(&self) -> Option<Arc<dyn Database>> {
        self.state.lock().db.as_ref().and_then(Weak::upgrade)
    }

    fn blob_path(&self, oid: Oid, tid: Tid) -> Result<PathBuf> {
        let dir = self.blob_dir.as_ref().ok_or(Error::Unsupported("blobs"))?;
        Ok(dir
            .join(format!("{:016x}", oid.to_u64()))
            .join(format!("{:016x}{}", tid.to_u64(), BLOB_SUFFIX)))
    }

    fn check_writable(&self, state: &State) -> Result<()> {
        if self.read_only || state.closed {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn queue(
        &self,
        txn: &TransactionMeta,
        oid: Oid,
        serial: Option<Tid>,
        store: PendingStore,
    ) -> Result<()> {
        let mut state = self.state.lock();
        self.check_writable(&state)?;
        if let Some(serial) = serial {
            let current = state.current_serial(oid);
            if current != serial {
                return Err(Error::Conflict {
                    oid,
                    expected: serial,
                    actual: current,
                });
            }
        }
        let pending = state.pending_for(txn)?;
        if pending.voted {
            return Err(Error::StorageTransaction(
                "can't store after the transaction voted".into(),
            ));
        }
        if let Some(idx) = pending.stores.iter().position(|s| s.oid == oid) {
            pending.stores.remove(idx).discard();
        }
        pending.stores.push(store);
        Ok(())
    }

    /// Move pending blob files under the blob dir. On failure the ones already moved go back.
    fn move_blobs(&self, stores: &[PendingStore], tid: Tid) -> Result<()> {
        let mut moved: Vec<(&Path, PathBuf)> = Vec::new();
        let result = stores.iter().try_for_each(|store| -> Result<()> {
            if let Some(ref src) = store.blob {
                let dst = self.blob_path(store.oid, tid)?;
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)?;
                }
                move_file(src, &dst)?;
                moved.push((src.as_path(), dst));
            }
            Ok(())
        });
        if result.is_err() {
            for (src, dst) in moved.into_iter().rev() {
                if move_file(&dst, src).is_err() {
                    let _ = fs::remove_file(&dst);
                }
            }
        }
        result
    }

    fn release(&self, state: &mut State) {
        if let Some(pending) = state.pending.take() {
            pending.stores.into_iter().for_each(PendingStore::discard);
        }
        self.commit.notify_one();
    }
}

/// Move a file, falling back to copy and remove across filesystems.
fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    if fs::rename(src, dst).is_err() {
        fs::copy(src, dst)?;
        fs::remove_file(src)?;
    }
    Ok(())
}

impl Storage for MemoryStorage {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn size(&self) -> u64 {
        let state = self.state.lock();
        state
            .objects
            .values()
            .flatten()
            .map(|rev| rev.data.as_ref().map_or(0, |d| d.len() as u64))
            .sum()
    }

    fn len(&self) -> usize {
        let state = self.state.lock();
        state
            .objects
            .values()
            .filter(|revs| revs.last().map_or(false, |rev| rev.data.is_some()))
            .count()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn last_transaction(&self) -> Tid {
        self.state.lock().last_tid
    }

    fn new_oid(&self) -> Result<Oid> {
        let mut state = self.state.lock();
        self.check_writable(&state)?;
        let oid = Oid::from_u64(state.next_oid);
        state.next_oid += 1;
        Ok(oid)
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
    }

    fn register_db(&self, db: Weak<dyn Database>) {
        self.state.lock().db = Some(db);
    }

    fn load(&self, oid: Oid) -> Result<(Vec<u8>, Tid)> {
        let state = self.state.lock();
        match state.current(oid) {
            Some(Revision {
                tid,
                data: Some(data),
                ..
            }) => Ok((data.clone(), *tid)),
            _ => Err(Error::KeyNotFound { oid, serial: None }),
        }
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> Result<Option<LoadedRevision>> {
        let state = self.state.lock();
        let revs = state
            .objects
            .get(&oid)
            .ok_or(Error::KeyNotFound { oid, serial: None })?;
        let idx = revs.partition_point(|rev| rev.tid < tid);
        if idx == 0 {
            return Ok(None);
        }
        let rev = &revs[idx - 1];
        Ok(rev.data.as_ref().map(|data| LoadedRevision {
            data: data.clone(),
            start: rev.tid,
            end: revs.get(idx).map(|next| next.tid),
        }))
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> Result<Vec<u8>> {
        let state = self.state.lock();
        state
            .objects
            .get(&oid)
            .and_then(|revs| revs.iter().find(|rev| rev.tid == serial))
            .and_then(|rev| rev.data.clone())
            .ok_or(Error::KeyNotFound {
                oid,
                serial: Some(serial),
            })
    }

    fn history(&self, oid: Oid, size: usize) -> Result<Vec<HistoryEntry>> {
        let state = self.state.lock();
        let revs = state
            .objects
            .get(&oid)
            .ok_or(Error::KeyNotFound { oid, serial: None })?;
        Ok(revs
            .iter()
            .rev()
            .take(size)
            .map(|rev| {
                let txn = state.transactions.get(&rev.tid);
                HistoryEntry {
                    tid: rev.tid,
                    size: rev.data.as_ref().map_or(0, Vec::len),
                    user: txn.map(|t| t.user.clone()).unwrap_or_default(),
                    description: txn.map(|t| t.description.clone()).unwrap_or_default(),
                }
            })
            .collect())
    }

    fn tpc_begin(
        &self,
        txn: &TransactionMeta,
        tid: Option<Tid>,
        status: Option<char>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        self.check_writable(&state)?;
        // One transaction commits at a time, later ones wait their turn
        loop {
            match state.pending.as_ref().map(|pending| pending.txn) {
                Some(id) if id == txn.id() => return Ok(()),
                Some(_) => self.commit.wait(&mut state),
                None => break,
            }
        }
        state.pending = Some(Pending {
            txn: txn.id(),
            tid,
            status: status.unwrap_or(' '),
            stores: Vec::new(),
            voted: false,
            finishing: false,
        });
        Ok(())
    }

    fn store(&self, oid: Oid, serial: Tid, data: &[u8], txn: &TransactionMeta) -> Result<()> {
        self.queue(
            txn,
            oid,
            Some(serial),
            PendingStore {
                oid,
                data: Some(data.to_vec()),
                data_txn: None,
                blob: None,
                copied: false,
            },
        )
    }

    fn restore(
        &self,
        oid: Oid,
        _serial: Tid,
        data: Option<&[u8]>,
        prev_txn: Option<Tid>,
        txn: &TransactionMeta,
    ) -> Result<()> {
        self.queue(
            txn,
            oid,
            None,
            PendingStore {
                oid,
                data: data.map(<[u8]>::to_vec),
                data_txn: prev_txn,
                blob: None,
                copied: false,
            },
        )
    }

    fn tpc_vote(&self, txn: &TransactionMeta) -> Result<Vec<Oid>> {
        let mut state = self.state.lock();
        state.pending_for(txn)?.voted = true;
        Ok(Vec::new())
    }

    fn tpc_finish(
        &self,
        txn: &TransactionMeta,
        callback: Option<Box<FinishCallback<'_>>>,
    ) -> Result<Tid> {
        let mut state = self.state.lock();
        let last_tid = state.last_tid;
        let pending = state.pending_for(txn)?;
        if !pending.voted {
            return Err(Error::StorageTransaction(
                "transaction must vote before finishing".into(),
            ));
        }
        let tid = match pending.tid {
            Some(tid) if tid <= last_tid => {
                return Err(Error::StorageTransaction(format!(
                    "tid {} isn't after the last committed tid {}",
                    tid, last_tid
                )))
            }
            Some(tid) => tid,
            None => Tid::now().max(last_tid.next()),
        };

        // Blob files go into place before touching anything else, so a failure leaves the
        // transaction pending and abortable.
        self.move_blobs(&pending.stores, tid)?;

        let stores = std::mem::take(&mut pending.stores);
        let status = pending.status;
        pending.finishing = true;
        let mut oids = Vec::with_capacity(stores.len());
        for store in stores {
            oids.push(store.oid);
            let data = match (store.data, store.data_txn) {
                (None, Some(data_txn)) => state
                    .objects
                    .get(&store.oid)
                    .and_then(|revs| revs.iter().find(|rev| rev.tid == data_txn))
                    .and_then(|rev| rev.data.clone()),
                (data, _) => data,
            };
            state.objects.entry(store.oid).or_default().push(Revision {
                tid,
                data,
                blob: store.blob.is_some(),
            });
            state.next_oid = state.next_oid.max(store.oid.to_u64() + 1);
        }
        state.transactions.insert(
            tid,
            CommittedTxn {
                status,
                user: txn.user.clone(),
                description: txn.description.clone(),
                extension: txn.extension.clone(),
                oids,
            },
        );
        state.last_tid = tid;
        if let Some(callback) = callback {
            // The commit slot stays taken, but the storage is readable from the callback
            MutexGuard::unlocked(&mut state, || callback(tid));
        }
        self.release(&mut state);
        Ok(tid)
    }

    fn tpc_abort(&self, txn: &TransactionMeta) {
        let mut state = self.state.lock();
        if state.pending_for(txn).is_ok() {
            self.release(&mut state);
        }
    }

    fn pack(
        &self,
        pack_time: SystemTime,
        references: &ReferencesFn<'_>,
        gc: Option<bool>,
    ) -> Result<()> {
        let pack_tid = Tid::from_u64(
            pack_time
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros() as u64)
                .unwrap_or_default(),
        );
        let mut state = self.state.lock();
        self.check_writable(&state)?;

        // Keep the revision current as of the pack time, and everything after it
        let mut packed: BTreeMap<Oid, Vec<Revision>> = BTreeMap::new();
        let mut dropped: Vec<(Oid, Revision)> = Vec::new();
        for (oid, revs) in state.objects.iter() {
            let idx = revs.partition_point(|rev| rev.tid < pack_tid);
            let keep_from = idx.saturating_sub(1);
            let mut kept = revs[keep_from..].to_vec();
            dropped.extend(revs[..keep_from].iter().map(|rev| (*oid, rev.clone())));
            if kept.len() == 1 && kept[0].data.is_none() && kept[0].tid < pack_tid {
                dropped.push((*oid, kept.remove(0)));
            }
            if !kept.is_empty() {
                packed.insert(*oid, kept);
            }
        }

        if gc.unwrap_or(true) {
            let mut reachable = BTreeSet::new();
            let mut todo = vec![Oid::ZERO];
            // Anything written after the pack time is kept no matter what
            for (oid, revs) in packed.iter() {
                if revs.iter().any(|rev| rev.tid >= pack_tid) {
                    todo.push(*oid);
                }
            }
            let mut refs = Vec::new();
            while let Some(oid) = todo.pop() {
                if !reachable.insert(oid) {
                    continue;
                }
                let Some(revs) = packed.get(&oid) else {
                    continue;
                };
                for data in revs.iter().filter_map(|rev| rev.data.as_deref()) {
                    refs.clear();
                    references(data, &mut refs)?;
                    todo.extend(refs.iter().filter(|r| !reachable.contains(*r)));
                }
            }
            let garbage: Vec<Oid> = packed
                .keys()
                .filter(|oid| !reachable.contains(*oid))
                .copied()
                .collect();
            for oid in garbage {
                if let Some(revs) = packed.remove(&oid) {
                    dropped.extend(revs.into_iter().map(|rev| (oid, rev)));
                }
            }
        }

        for (oid, rev) in dropped.iter().filter(|(_, rev)| rev.blob) {
            if let Ok(path) = self.blob_path(*oid, rev.tid) {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove packed blob");
                }
            }
        }

        // Forget transactions that no longer hold any revision
        let transactions = std::mem::take(&mut state.transactions);
        state.transactions = transactions
            .into_iter()
            .filter_map(|(tid, mut txn)| {
                txn.oids.retain(|oid| {
                    packed
                        .get(oid)
                        .map_or(false, |revs| revs.iter().any(|rev| rev.tid == tid))
                });
                (!txn.oids.is_empty()).then_some((tid, txn))
            })
            .collect();
        state.objects = packed;
        tracing::info!(
            storage = %self.name,
            dropped = dropped.len(),
            objects = state.objects.len(),
            "packed storage"
        );
        Ok(())
    }

    fn iterator(
        &self,
        start: Option<Tid>,
        stop: Option<Tid>,
    ) -> Result<Box<dyn TransactionIterator>> {
        let state = self.state.lock();
        let start = start.unwrap_or(Tid::ZERO);
        let records: Vec<TransactionRecord> = state
            .transactions
            .range(start..)
            .take_while(|(tid, _)| stop.map_or(true, |stop| **tid <= stop))
            .map(|(tid, txn)| TransactionRecord {
                tid: *tid,
                status: txn.status,
                user: txn.user.clone(),
                description: txn.description.clone(),
                extension: txn.extension.clone(),
                records: txn
                    .oids
                    .iter()
                    .filter_map(|oid| {
                        let rev = state.objects.get(oid)?.iter().find(|rev| rev.tid == *tid)?;
                        Some(DataRecord {
                            oid: *oid,
                            tid: *tid,
                            data: rev.data.clone(),
                            data_txn: None,
                        })
                    })
                    .collect(),
            })
            .collect();
        Ok(Box::new(MemoryIterator {
            records: records.into_iter(),
            closed: false,
        }))
    }

    fn record_iternext(&self, next: Option<Oid>) -> Result<RecordIterNext> {
        let state = self.state.lock();
        let start = next.unwrap_or(Oid::ZERO);
        let mut live = state.objects.range(start..).filter_map(|(oid, revs)| {
            let rev = revs.last()?;
            rev.data.as_ref().map(|data| (*oid, rev.tid, data))
        });
        let (oid, tid, data) = live.next().ok_or(Error::KeyNotFound {
            oid: start,
            serial: None,
        })?;
        Ok(RecordIterNext {
            oid,
            tid,
            data: data.clone(),
            next: live.next().map(|(oid, _, _)| oid),
        })
    }

    fn store_blob(
        &self,
        oid: Oid,
        serial: Tid,
        data: &[u8],
        blob: &Path,
        txn: &TransactionMeta,
    ) -> Result<()> {
        self.blob_dir.as_ref().ok_or(Error::Unsupported("blobs"))?;
        self.queue(
            txn,
            oid,
            Some(serial),
            PendingStore {
                oid,
                data: Some(data.to_vec()),
                data_txn: None,
                blob: Some(blob.to_path_buf()),
                copied: false,
            },
        )
    }

    fn restore_blob(
        &self,
        oid: Oid,
        _serial: Tid,
        data: &[u8],
        blob: &Path,
        prev_txn: Option<Tid>,
        txn: &TransactionMeta,
    ) -> Result<()> {
        self.blob_dir.as_ref().ok_or(Error::Unsupported("blobs"))?;
        // The source storage keeps its committed blob, so restore from a copy
        let tmp = self.temporary_directory()?.join(format!(
            "restore-{:016x}-{}-{}{}",
            oid.to_u64(),
            txn.id(),
            RESTORE_COPY.fetch_add(1, Ordering::Relaxed),
            BLOB_SUFFIX
        ));
        fs::copy(blob, &tmp)?;
        let result = self.queue(
            txn,
            oid,
            None,
            PendingStore {
                oid,
                data: Some(data.to_vec()),
                data_txn: prev_txn,
                blob: Some(tmp.clone()),
                copied: true,
            },
        );
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn load_blob(&self, oid: Oid, serial: Tid) -> Result<PathBuf> {
        let path = self.blob_path(oid, serial)?;
        let state = self.state.lock();
        let is_blob = state
            .objects
            .get(&oid)
            .and_then(|revs| revs.iter().find(|rev| rev.tid == serial))
            .map_or(false, |rev| rev.blob);
        if is_blob {
            Ok(path)
        } else {
            Err(Error::KeyNotFound {
                oid,
                serial: Some(serial),
            })
        }
    }

    fn temporary_directory(&self) -> Result<PathBuf> {
        let dir = self.blob_dir.as_ref().ok_or(Error::Unsupported("blobs"))?;
        Ok(dir.join(TMP_DIR))
    }
}

struct MemoryIterator {
    records: std::vec::IntoIter<TransactionRecord>,
    closed: bool,
}

impl Iterator for MemoryIterator {
    type Item = Result<TransactionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        self.records.next().map(Ok)
    }
}

impl TransactionIterator for MemoryIterator {
    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::io::Write;
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::time::Duration;

    pub(crate) fn commit(storage: &dyn Storage, stores: &[(Oid, Tid, &[u8])]) -> Result<Tid> {
        let txn = TransactionMeta::new("tester", "test commit");
        storage.tpc_begin(&txn, None, None)?;
        for (oid, serial, data) in stores {
            if let Err(e) = storage.store(*oid, *serial, data, &txn) {
                storage.tpc_abort(&txn);
                return Err(e);
            }
        }
        storage.tpc_vote(&txn)?;
        storage.tpc_finish(&txn, None)
    }

    /// Records are a list of referenced oids, as ascii numbers separated by spaces.
    fn refs(data: &[u8], oids: &mut Vec<Oid>) -> Result<()> {
        let text = std::str::from_utf8(data).map_err(|e| Error::FailDecompress(e.to_string()))?;
        oids.extend(
            text.split_whitespace()
                .filter_map(|n| n.parse::<u64>().ok())
                .map(Oid::from_u64),
        );
        Ok(())
    }

    #[test]
    fn store_and_load() {
        let storage = MemoryStorage::new("test");
        assert!(storage.is_empty());
        let oid = storage.new_oid().unwrap();
        assert_eq!(oid, Oid::from_u64(1));
        let t1 = commit(&storage, &[(oid, Tid::ZERO, &b"first"[..])]).unwrap();
        let t2 = commit(&storage, &[(oid, t1, &b"second"[..])]).unwrap();
        assert!(t2 > t1);
        assert_eq!(storage.last_transaction(), t2);
        assert_eq!(storage.load(oid).unwrap(), (b"second".to_vec(), t2));
        assert_eq!(storage.load_serial(oid, t1).unwrap(), b"first");
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.size(), 11);

        let before = storage.load_before(oid, t2).unwrap().unwrap();
        assert_eq!(before.data, b"first");
        assert_eq!(before.start, t1);
        assert_eq!(before.end, Some(t2));
        assert!(storage.load_before(oid, t1).unwrap().is_none());

        let history = storage.history(oid, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].tid, t2);
        assert_eq!(history[1].user, "tester");
        assert!(matches!(
            storage.load(Oid::from_u64(99)),
            Err(Error::KeyNotFound { .. })
        ));
    }

    #[test]
    fn write_conflict() {
        let storage = MemoryStorage::new("test");
        let oid = Oid::ZERO;
        let t1 = commit(&storage, &[(oid, Tid::ZERO, &b"first"[..])]).unwrap();
        commit(&storage, &[(oid, t1, &b"second"[..])]).unwrap();
        let err = commit(&storage, &[(oid, t1, &b"stale"[..])]).unwrap_err();
        assert!(matches!(err, Error::Conflict { expected, .. } if expected == t1));
        // The aborted transaction released the commit lock
        commit(&storage, &[(Oid::from_u64(5), Tid::ZERO, &b"other"[..])]).unwrap();
    }

    #[test]
    fn store_outside_transaction() {
        let storage = MemoryStorage::new("test");
        let txn = TransactionMeta::default();
        let err = storage
            .store(Oid::ZERO, Tid::ZERO, b"data", &txn)
            .unwrap_err();
        assert!(matches!(err, Error::StorageTransaction(_)));
        storage.tpc_begin(&txn, None, None).unwrap();
        storage.store(Oid::ZERO, Tid::ZERO, b"data", &txn).unwrap();
        assert!(storage.tpc_finish(&txn, None).is_err());
        storage.tpc_abort(&txn);
        assert!(storage.load(Oid::ZERO).is_err());
    }

    #[test]
    fn read_only_and_closed() {
        let storage = MemoryStorage::new("test").read_only(true);
        assert!(storage.is_read_only());
        assert!(matches!(storage.new_oid(), Err(Error::ReadOnly)));
        let storage = MemoryStorage::new("test");
        storage.close();
        let txn = TransactionMeta::default();
        assert!(matches!(
            storage.tpc_begin(&txn, None, None),
            Err(Error::ReadOnly)
        ));
    }

    #[test]
    fn finish_callback_sees_tid() {
        let storage = MemoryStorage::new("test");
        let txn = TransactionMeta::default();
        storage.tpc_begin(&txn, None, None).unwrap();
        storage.store(Oid::ZERO, Tid::ZERO, b"root", &txn).unwrap();
        storage.tpc_vote(&txn).unwrap();
        let mut seen = None;
        let tid = storage
            .tpc_finish(&txn, Some(Box::new(|tid: Tid| seen = Some(tid))))
            .unwrap();
        assert_eq!(seen, Some(tid));
    }

    #[test]
    fn iterate_records_and_transactions() {
        let storage = MemoryStorage::new("test");
        let t1 = commit(
            &storage,
            &[(Oid::ZERO, Tid::ZERO, &b"root"[..]), (Oid::from_u64(2), Tid::ZERO, &b"two"[..])],
        )
        .unwrap();
        let t2 = commit(&storage, &[(Oid::from_u64(3), Tid::ZERO, &b"three"[..])]).unwrap();

        let first = storage.record_iternext(None).unwrap();
        assert_eq!(first.oid, Oid::ZERO);
        assert_eq!(first.tid, t1);
        assert_eq!(first.next, Some(Oid::from_u64(2)));
        let second = storage.record_iternext(first.next).unwrap();
        assert_eq!(second.data, b"two");
        let third = storage.record_iternext(second.next).unwrap();
        assert_eq!(third.tid, t2);
        assert_eq!(third.next, None);

        let txns: Vec<_> = storage
            .iterator(None, None)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0].tid, t1);
        assert_eq!(txns[0].records.len(), 2);
        assert_eq!(txns[1].records[0].data.as_deref(), Some(&b"three"[..]));

        let mut iter = storage.iterator(Some(t2), None).unwrap();
        iter.close();
        assert!(iter.next().is_none());
    }

    #[test]
    fn pack_drops_old_and_unreachable() {
        let storage = MemoryStorage::new("test");
        let (one, two, three) = (Oid::from_u64(1), Oid::from_u64(2), Oid::from_u64(3));
        let t1 = commit(
            &storage,
            &[
                (Oid::ZERO, Tid::ZERO, &b"1 2"[..]),
                (one, Tid::ZERO, &b"leaf"[..]),
                (two, Tid::ZERO, &b"3"[..]),
                (three, Tid::ZERO, &b"leaf"[..]),
            ],
        )
        .unwrap();
        // Drop the reference to object 1
        let t2 = commit(&storage, &[(Oid::ZERO, t1, &b"2"[..])]).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        storage
            .pack(SystemTime::now(), &refs, None)
            .unwrap();

        let mut live = Vec::new();
        let mut next = None;
        loop {
            let r = storage.record_iternext(next).unwrap();
            live.push(r.oid.to_u64());
            next = r.next;
            if next.is_none() {
                break;
            }
        }
        assert_eq!(live, vec![0, 2, 3]);
        assert!(storage.load_serial(Oid::ZERO, t1).is_err());
        assert_eq!(storage.load(Oid::ZERO).unwrap(), (b"2".to_vec(), t2));
    }

    #[test]
    fn pack_without_gc_keeps_unreachable() {
        let storage = MemoryStorage::new("test");
        commit(
            &storage,
            &[(Oid::ZERO, Tid::ZERO, &b""[..]), (Oid::from_u64(7), Tid::ZERO, &b"orphan"[..])],
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(2));
        storage.pack(SystemTime::now(), &refs, Some(false)).unwrap();
        assert_eq!(storage.len(), 2);
        storage.pack(SystemTime::now(), &refs, Some(true)).unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn blobs_move_into_blob_dir() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MemoryStorage::with_blob_dir("test", dir.path().join("blobs")).unwrap();
        let tmp = storage.temporary_directory().unwrap().join("upload");
        fs::File::create(&tmp)
            .unwrap()
            .write_all(b"Hi\nworld.\n")
            .unwrap();

        let txn = TransactionMeta::default();
        storage.tpc_begin(&txn, None, None).unwrap();
        storage
            .store_blob(Oid::from_u64(3), Tid::ZERO, b"blob record", &tmp, &txn)
            .unwrap();
        storage.tpc_vote(&txn).unwrap();
        let tid = storage.tpc_finish(&txn, None).unwrap();

        assert!(!tmp.exists());
        let path = storage.load_blob(Oid::from_u64(3), tid).unwrap();
        assert_eq!(fs::read(path).unwrap(), b"Hi\nworld.\n");
        assert!(storage.load_blob(Oid::from_u64(3), Tid::ZERO).is_err());

        let plain = MemoryStorage::new("plain");
        assert!(matches!(
            plain.load_blob(Oid::ZERO, tid),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn finish_callback_reads_storage() {
        let storage = Arc::new(MemoryStorage::new("test"));
        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(&storage);
        std::thread::spawn(move || {
            let txn = TransactionMeta::default();
            worker.tpc_begin(&txn, None, None).unwrap();
            worker.store(Oid::ZERO, Tid::ZERO, b"root", &txn).unwrap();
            worker.tpc_vote(&txn).unwrap();
            let seen = Mutex::new(None);
            let tid = worker
                .tpc_finish(
                    &txn,
                    Some(Box::new(|tid: Tid| {
                        // Aborting a transaction that already committed does nothing
                        worker.tpc_abort(&txn);
                        let loaded = worker.load(Oid::ZERO).unwrap();
                        *seen.lock() = Some((tid, worker.last_transaction(), loaded));
                    })),
                )
                .unwrap();
            tx.send((tid, seen.into_inner())).unwrap();
        });

        let (tid, seen) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen, Some((tid, tid, (b"root".to_vec(), tid))));
        assert_eq!(storage.last_transaction(), tid);
    }

    #[test]
    fn one_committer_at_a_time() {
        let storage = Arc::new(MemoryStorage::new("test"));
        for finish in [false, true] {
            let first = TransactionMeta::new("first", "");
            storage.tpc_begin(&first, None, None).unwrap();

            let (tx, rx) = mpsc::channel();
            let worker = Arc::clone(&storage);
            let handle = std::thread::spawn(move || {
                let second = TransactionMeta::new("second", "");
                worker.tpc_begin(&second, None, None).unwrap();
                tx.send(worker.last_transaction()).unwrap();
                worker.tpc_abort(&second);
            });

            assert_eq!(
                rx.recv_timeout(Duration::from_millis(200)),
                Err(RecvTimeoutError::Timeout)
            );
            let committed = if finish {
                storage.store(Oid::ZERO, Tid::ZERO, b"first", &first).unwrap();
                storage.tpc_vote(&first).unwrap();
                storage.tpc_finish(&first, None).unwrap()
            } else {
                storage.tpc_abort(&first);
                Tid::ZERO
            };
            // The second transaction only got in once the first was done with
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(committed));
            handle.join().unwrap();
        }
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn failed_blob_moves_are_undone() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MemoryStorage::with_blob_dir("test", dir.path().join("blobs")).unwrap();
        let present = storage.temporary_directory().unwrap().join("present");
        fs::write(&present, b"blob one").unwrap();
        let missing = storage.temporary_directory().unwrap().join("missing");

        let txn = TransactionMeta::default();
        storage.tpc_begin(&txn, None, None).unwrap();
        storage
            .store_blob(Oid::from_u64(1), Tid::ZERO, b"one", &present, &txn)
            .unwrap();
        storage
            .store_blob(Oid::from_u64(2), Tid::ZERO, b"two", &missing, &txn)
            .unwrap();
        storage.tpc_vote(&txn).unwrap();
        assert!(matches!(storage.tpc_finish(&txn, None), Err(Error::Io(_))));

        assert_eq!(fs::read(&present).unwrap(), b"blob one");
        let oid_dir = dir.path().join("blobs").join(format!("{:016x}", 1));
        assert_eq!(fs::read_dir(oid_dir).unwrap().count(), 0);
        storage.tpc_abort(&txn);
        assert!(storage.is_empty());
        assert_eq!(storage.last_transaction(), Tid::ZERO);
    }

    #[test]
    fn restore_blob_copies_removed() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.blob");
        fs::write(&source, b"Hi\nworld.\n").unwrap();
        let storage = MemoryStorage::with_blob_dir("test", dir.path().join("blobs")).unwrap();
        let tmp = storage.temporary_directory().unwrap();
        let copies = || fs::read_dir(&tmp).unwrap().count();

        let txn = TransactionMeta::default();
        assert!(matches!(
            storage.restore_blob(Oid::from_u64(1), Tid::ZERO, b"one", &source, None, &txn),
            Err(Error::StorageTransaction(_))
        ));
        assert_eq!(copies(), 0);

        storage.tpc_begin(&txn, None, None).unwrap();
        storage
            .restore_blob(Oid::from_u64(1), Tid::ZERO, b"one", &source, None, &txn)
            .unwrap();
        assert_eq!(copies(), 1);
        // Restoring the same object again replaces the earlier copy
        storage
            .restore_blob(Oid::from_u64(1), Tid::ZERO, b"one", &source, None, &txn)
            .unwrap();
        assert_eq!(copies(), 1);
        storage.tpc_abort(&txn);
        assert_eq!(copies(), 0);
        assert!(source.exists());

        // A committed copy is kept, under the blob dir
        storage.tpc_begin(&txn, None, None).unwrap();
        storage
            .restore_blob(Oid::from_u64(1), Tid::ZERO, b"one", &source, None, &txn)
            .unwrap();
        storage.tpc_vote(&txn).unwrap();
        let tid = storage.tpc_finish(&txn, None).unwrap();
        assert_eq!(copies(), 0);
        let path = storage.load_blob(Oid::from_u64(1), tid).unwrap();
        assert_eq!(fs::read(path).unwrap(), b"Hi\nworld.\n");
    }
}
