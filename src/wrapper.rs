//! The compressing storage wrapper.
//!
//! [`CompressedStorage`] sits between a database and the storage that actually holds records.
//! Records are compressed on their way down and inflated on their way back up; everything else
//! is handed straight to the wrapped storage.
//!
//! ```
//! use zstorage::{Compress, CompressedStorage, MemoryStorage, Oid, Storage, Tid, TransactionMeta};
//!
//! let storage = CompressedStorage::new(MemoryStorage::new("main"), Compress::default());
//! let record = b"a record that repeats itself, a record that repeats itself".to_vec();
//!
//! let txn = TransactionMeta::new("me", "first commit");
//! storage.tpc_begin(&txn, None, None).unwrap();
//! storage.store(Oid::ZERO, Tid::ZERO, &record, &txn).unwrap();
//! storage.tpc_vote(&txn).unwrap();
//! storage.tpc_finish(&txn, None).unwrap();
//!
//! // Compressed underneath, transparent from above
//! let (raw, _) = storage.base().load(Oid::ZERO).unwrap();
//! assert!(raw.starts_with(b".z"));
//! assert_eq!(storage.load(Oid::ZERO).unwrap().0, record);
//! ```

use crate::compress::{decompress, decompress_vec, Compress};
use crate::error::{Error, Result};
use crate::storage::{
    copy_transactions, Database, FinishCallback, HistoryEntry, LoadedRevision, Oid,
    RecordIterNext, ReferencesFn, Storage, Tid, TransactionIterator, TransactionMeta, UndoEntry,
};
use crate::transaction::DecompressingIterator;
use parking_lot::RwLock;
use std::{
    borrow::Cow,
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::SystemTime,
};

/// A storage wrapper that compresses records written to the wrapped storage.
///
/// On creation, the wrapper registers itself as the wrapped storage's database, and passes
/// invalidations on to whatever database later registers with it.
///
/// Turning compression off (with [`Compress::None`]) only affects writing: compressed records
/// already in the storage still read back correctly, so a store can hold a mix of both.
pub struct CompressedStorage<S> {
    base: S,
    compress: Compress,
    server: bool,
    db: RwLock<Option<Weak<dyn Database>>>,
}

impl<S: Storage + 'static> CompressedStorage<S> {
    /// Wrap `base`, compressing records with the given setting.
    pub fn new(base: S, compress: Compress) -> Arc<Self> {
        Self::build(base, compress, false)
    }

    /// Wrap `base` for use on a storage server whose clients already compress.
    ///
    /// Loads, stores, and iteration hand records through untouched, so they travel compressed.
    /// Packing and the database callbacks still see inflated records.
    pub fn server(base: S, compress: Compress) -> Arc<Self> {
        Self::build(base, compress, true)
    }

    fn build(base: S, compress: Compress, server: bool) -> Arc<Self> {
        let wrapper = Arc::new(Self {
            base,
            compress,
            server,
            db: RwLock::new(None),
        });
        let weak = Arc::downgrade(&wrapper);
        wrapper.base.register_db(weak);
        tracing::debug!(
            storage = %wrapper.base.name(),
            compress = ?compress,
            server,
            "wrapped storage"
        );
        wrapper
    }

    /// Copy all transactions from another storage into this one, compressing as they go.
    pub fn copy_transactions_from(&self, other: &dyn Storage) -> Result<usize> {
        copy_transactions(other, self)
    }
}

impl<S> CompressedStorage<S> {
    /// The wrapped storage.
    pub fn base(&self) -> &S {
        &self.base
    }

    pub fn compression(&self) -> Compress {
        self.compress
    }

    pub fn is_server(&self) -> bool {
        self.server
    }

    fn db(&self) -> Option<Arc<dyn Database>> {
        self.db.read().as_ref().and_then(Weak::upgrade)
    }

    /// Compress a record on its way into the wrapped storage.
    fn transform<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        if self.server {
            Ok(Cow::Borrowed(data))
        } else {
            self.compress.compress(data)
        }
    }

    /// Inflate a record on its way out of the wrapped storage.
    fn untransform(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        if self.server {
            Ok(data)
        } else {
            decompress_vec(data)
        }
    }
}

impl<S: Storage> Database for CompressedStorage<S> {
    fn invalidate_cache(&self) {
        match self.db() {
            Some(db) => db.invalidate_cache(),
            None => tracing::debug!("no database registered, dropping cache invalidation"),
        }
    }

    fn invalidate(&self, tid: Tid, oids: &[Oid]) {
        match self.db() {
            Some(db) => db.invalidate(tid, oids),
            None => tracing::debug!(%tid, "no database registered, dropping invalidation"),
        }
    }

    fn references(&self, record: &[u8], oids: &mut Vec<Oid>) -> Result<()> {
        let db = self.db().ok_or(Error::NoDatabase)?;
        db.references(&decompress(record)?, oids)
    }

    fn transform_record_data(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let data = match self.db() {
            Some(db) => db.transform_record_data(data)?,
            None => data,
        };
        self.compress.compress_vec(data)
    }

    fn untransform_record_data(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let data = decompress_vec(data)?;
        match self.db() {
            Some(db) => db.untransform_record_data(data),
            None => Ok(data),
        }
    }
}

impl<S: Storage> Storage for CompressedStorage<S> {
    fn name(&self) -> String {
        self.base.name()
    }

    fn sort_key(&self) -> String {
        self.base.sort_key()
    }

    fn size(&self) -> u64 {
        self.base.size()
    }

    fn len(&self) -> usize {
        self.base.len()
    }

    fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    fn is_read_only(&self) -> bool {
        self.base.is_read_only()
    }

    fn last_transaction(&self) -> Tid {
        self.base.last_transaction()
    }

    fn new_oid(&self) -> Result<Oid> {
        self.base.new_oid()
    }

    fn close(&self) {
        self.base.close()
    }

    fn register_db(&self, db: Weak<dyn Database>) {
        tracing::debug!(storage = %self.base.name(), "database registered");
        *self.db.write() = Some(db);
    }

    fn load(&self, oid: Oid) -> Result<(Vec<u8>, Tid)> {
        let (data, serial) = self.base.load(oid)?;
        Ok((self.untransform(data)?, serial))
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> Result<Option<LoadedRevision>> {
        match self.base.load_before(oid, tid)? {
            Some(mut rev) => {
                rev.data = self.untransform(rev.data)?;
                Ok(Some(rev))
            }
            None => Ok(None),
        }
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> Result<Vec<u8>> {
        self.untransform(self.base.load_serial(oid, serial)?)
    }

    fn history(&self, oid: Oid, size: usize) -> Result<Vec<HistoryEntry>> {
        self.base.history(oid, size)
    }

    fn tpc_begin(
        &self,
        txn: &TransactionMeta,
        tid: Option<Tid>,
        status: Option<char>,
    ) -> Result<()> {
        self.base.tpc_begin(txn, tid, status)
    }

    fn store(&self, oid: Oid, serial: Tid, data: &[u8], txn: &TransactionMeta) -> Result<()> {
        self.base.store(oid, serial, &self.transform(data)?, txn)
    }

    fn restore(
        &self,
        oid: Oid,
        serial: Tid,
        data: Option<&[u8]>,
        prev_txn: Option<Tid>,
        txn: &TransactionMeta,
    ) -> Result<()> {
        let data = data.map(|d| self.transform(d)).transpose()?;
        self.base
            .restore(oid, serial, data.as_deref(), prev_txn, txn)
    }

    fn tpc_vote(&self, txn: &TransactionMeta) -> Result<Vec<Oid>> {
        self.base.tpc_vote(txn)
    }

    fn tpc_finish(
        &self,
        txn: &TransactionMeta,
        callback: Option<Box<FinishCallback<'_>>>,
    ) -> Result<Tid> {
        self.base.tpc_finish(txn, callback)
    }

    fn tpc_abort(&self, txn: &TransactionMeta) {
        self.base.tpc_abort(txn)
    }

    fn pack(
        &self,
        pack_time: SystemTime,
        references: &ReferencesFn<'_>,
        gc: Option<bool>,
    ) -> Result<()> {
        // The reference finder only understands inflated records, server or not
        let refs = |record: &[u8], oids: &mut Vec<Oid>| references(&decompress(record)?, oids);
        self.base.pack(pack_time, &refs, gc)
    }

    fn iterator(
        &self,
        start: Option<Tid>,
        stop: Option<Tid>,
    ) -> Result<Box<dyn TransactionIterator>> {
        let inner = self.base.iterator(start, stop)?;
        if self.server {
            Ok(inner)
        } else {
            Ok(Box::new(DecompressingIterator::new(inner)))
        }
    }

    fn record_iternext(&self, next: Option<Oid>) -> Result<RecordIterNext> {
        let mut step = self.base.record_iternext(next)?;
        step.data = self.untransform(step.data)?;
        Ok(step)
    }

    fn store_blob(
        &self,
        oid: Oid,
        serial: Tid,
        data: &[u8],
        blob: &Path,
        txn: &TransactionMeta,
    ) -> Result<()> {
        self.base
            .store_blob(oid, serial, &self.transform(data)?, blob, txn)
    }

    fn restore_blob(
        &self,
        oid: Oid,
        serial: Tid,
        data: &[u8],
        blob: &Path,
        prev_txn: Option<Tid>,
        txn: &TransactionMeta,
    ) -> Result<()> {
        self.base
            .restore_blob(oid, serial, &self.transform(data)?, blob, prev_txn, txn)
    }

    fn load_blob(&self, oid: Oid, serial: Tid) -> Result<PathBuf> {
        self.base.load_blob(oid, serial)
    }

    fn open_committed_blob_file(&self, oid: Oid, serial: Tid) -> Result<File> {
        self.base.open_committed_blob_file(oid, serial)
    }

    fn temporary_directory(&self) -> Result<PathBuf> {
        self.base.temporary_directory()
    }

    fn supports_undo(&self) -> bool {
        self.base.supports_undo()
    }

    fn undo(&self, id: Tid, txn: &TransactionMeta) -> Result<Vec<Oid>> {
        self.base.undo(id, txn)
    }

    fn undo_log(&self, first: usize, last: usize) -> Result<Vec<UndoEntry>> {
        self.base.undo_log(first, last)
    }

    fn undo_info(&self, first: usize, last: usize) -> Result<Vec<UndoEntry>> {
        self.base.undo_info(first, last)
    }
}
