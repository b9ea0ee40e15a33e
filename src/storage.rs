//! The object storage contract shared by backends and wrappers.
//!
//! A [`Storage`] holds revisions of objects, each an opaque record keyed by an [`Oid`] and
//! stamped with the [`Tid`] of the transaction that wrote it. Writes go through two-phase commit:
//! [`tpc_begin`][Storage::tpc_begin], any number of [`store`][Storage::store] calls,
//! [`tpc_vote`][Storage::tpc_vote], then [`tpc_finish`][Storage::tpc_finish] or
//! [`tpc_abort`][Storage::tpc_abort].
//!
//! A storage reports back to a [`Database`] registered with it. Wrappers register themselves
//! with the storage they wrap, so they see every callback before the real database does.
//!
//! Capabilities that not every storage has (blobs, undo, restore, iteration) come with default
//! implementations that fail with [`Error::Unsupported`].

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Weak,
    },
    time::{SystemTime, UNIX_EPOCH},
};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; 8]);

        impl $name {
            pub const ZERO: $name = $name([0u8; 8]);

            pub fn from_u64(v: u64) -> Self {
                let mut raw = [0u8; 8];
                BigEndian::write_u64(&mut raw, v);
                Self(raw)
            }

            pub fn to_u64(self) -> u64 {
                BigEndian::read_u64(&self.0)
            }

            pub fn from_bytes(raw: [u8; 8]) -> Self {
                Self(raw)
            }

            pub fn as_bytes(&self) -> &[u8; 8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "0x{:016x}", self.to_u64())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self::from_u64(v)
            }
        }
    };
}

id_type!(
    /// Object identifier. [`Oid::ZERO`] is the root object.
    Oid
);
id_type!(
    /// Transaction identifier, also used as the serial of every revision the transaction wrote.
    Tid
);

impl Tid {
    /// A tid for the current wall-clock time, in microseconds since the Unix epoch.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        Self::from_u64(micros)
    }

    /// The next tid after this one.
    pub fn next(self) -> Self {
        Self::from_u64(self.to_u64() + 1)
    }
}

static NEXT_TXN: AtomicU64 = AtomicU64::new(1);

/// Metadata and identity of a transaction being committed.
///
/// Each value created with [`TransactionMeta::new`] is a distinct transaction, even if the
/// metadata matches another's. Storages use this to check that stores belong to the transaction
/// they began.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionMeta {
    id: u64,
    pub user: String,
    pub description: String,
    pub extension: BTreeMap<String, Vec<u8>>,
}

impl TransactionMeta {
    pub fn new(user: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: NEXT_TXN.fetch_add(1, Ordering::Relaxed),
            user: user.into(),
            description: description.into(),
            extension: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Default for TransactionMeta {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// A revision returned by [`Storage::load_before`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedRevision {
    pub data: Vec<u8>,
    /// The tid that wrote this revision.
    pub start: Tid,
    /// The tid of the following revision, if there is one.
    pub end: Option<Tid>,
}

/// One step of [`Storage::record_iternext`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordIterNext {
    pub oid: Oid,
    pub tid: Tid,
    pub data: Vec<u8>,
    /// Cursor for the following call, `None` once the last object was returned.
    pub next: Option<Oid>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub tid: Tid,
    pub size: usize,
    pub user: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UndoEntry {
    pub id: Tid,
    pub user: String,
    pub description: String,
}

/// A data record inside an iterated transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataRecord {
    pub oid: Oid,
    pub tid: Tid,
    /// `None` when the record marks an undone object creation.
    pub data: Option<Vec<u8>>,
    /// When set, the transaction whose data this record reuses.
    pub data_txn: Option<Tid>,
}

/// A committed transaction, as produced by [`Storage::iterator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionRecord {
    pub tid: Tid,
    pub status: char,
    pub user: String,
    pub description: String,
    pub extension: BTreeMap<String, Vec<u8>>,
    pub records: Vec<DataRecord>,
}

impl TransactionRecord {
    /// Rebuild the metadata this transaction was committed with, under a fresh identity.
    pub fn meta(&self) -> TransactionMeta {
        let mut meta = TransactionMeta::new(self.user.clone(), self.description.clone());
        meta.extension = self.extension.clone();
        meta
    }
}

/// Iterates over committed transactions, oldest first.
pub trait TransactionIterator: Iterator<Item = Result<TransactionRecord>> + Send {
    /// Release whatever the iterator holds. Further calls to `next` yield nothing.
    fn close(&mut self);
}

/// Finds the oids a record refers to, appending them to the given list.
pub type ReferencesFn<'a> = dyn Fn(&[u8], &mut Vec<Oid>) -> Result<()> + 'a;

/// Called with the committed tid before a transaction's locks are released.
pub type FinishCallback<'a> = dyn FnOnce(Tid) + 'a;

/// The database side of a storage: what a storage tells about committed changes, and how it
/// reads records it doesn't otherwise understand.
pub trait Database: Send + Sync {
    /// Drop every cached object.
    fn invalidate_cache(&self);

    /// Objects changed by a transaction committed outside this process.
    fn invalidate(&self, tid: Tid, oids: &[Oid]);

    /// Find the oids referenced by a record, appending them to `oids`.
    fn references(&self, record: &[u8], oids: &mut Vec<Oid>) -> Result<()>;

    /// Transform a record on its way into storage.
    fn transform_record_data(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }

    /// Undo [`transform_record_data`][Database::transform_record_data] on a record read back.
    fn untransform_record_data(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }
}

/// An object store with two-phase commit.
pub trait Storage: Send + Sync {
    fn name(&self) -> String;

    /// Key used to order storages when committing across several of them.
    fn sort_key(&self) -> String {
        self.name()
    }

    /// Approximate size of the stored data, in bytes.
    fn size(&self) -> u64;

    /// Number of objects held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_read_only(&self) -> bool;

    /// Tid of the most recently committed transaction, [`Tid::ZERO`] for an empty storage.
    fn last_transaction(&self) -> Tid;

    fn new_oid(&self) -> Result<Oid>;

    fn close(&self);

    /// Register the database this storage reports invalidations to.
    fn register_db(&self, db: Weak<dyn Database>);

    /// Load the current revision of an object, returning its data and serial.
    fn load(&self, oid: Oid) -> Result<(Vec<u8>, Tid)>;

    /// Load the newest revision written strictly before `tid`, or `None` if the object didn't
    /// exist then.
    fn load_before(&self, oid: Oid, tid: Tid) -> Result<Option<LoadedRevision>>;

    /// Load the revision written by transaction `serial`.
    fn load_serial(&self, oid: Oid, serial: Tid) -> Result<Vec<u8>>;

    /// Revision history of an object, newest first, at most `size` entries.
    fn history(&self, oid: Oid, size: usize) -> Result<Vec<HistoryEntry>>;

    /// Begin committing `txn`. `tid` and `status` are only given when replaying transactions
    /// from another storage.
    fn tpc_begin(&self, txn: &TransactionMeta, tid: Option<Tid>, status: Option<char>)
        -> Result<()>;

    /// Store a new revision of an object. `serial` is the revision the new data was based on,
    /// [`Tid::ZERO`] for a new object.
    fn store(&self, oid: Oid, serial: Tid, data: &[u8], txn: &TransactionMeta) -> Result<()>;

    /// Write a revision without conflict checks, as when copying transactions.
    fn restore(
        &self,
        oid: Oid,
        serial: Tid,
        data: Option<&[u8]>,
        prev_txn: Option<Tid>,
        txn: &TransactionMeta,
    ) -> Result<()> {
        let _ = (oid, serial, data, prev_txn, txn);
        Err(Error::Unsupported("restore"))
    }

    /// Vote on the transaction. Returns the oids whose conflicts were resolved.
    fn tpc_vote(&self, txn: &TransactionMeta) -> Result<Vec<Oid>>;

    fn tpc_finish(&self, txn: &TransactionMeta, callback: Option<Box<FinishCallback<'_>>>)
        -> Result<Tid>;

    fn tpc_abort(&self, txn: &TransactionMeta);

    /// Discard revisions not current as of `pack_time` and, when `gc` is on, objects no longer
    /// reachable from the root. `references` tells which oids a record refers to.
    fn pack(&self, pack_time: SystemTime, references: &ReferencesFn<'_>, gc: Option<bool>)
        -> Result<()>;

    fn iterator(
        &self,
        start: Option<Tid>,
        stop: Option<Tid>,
    ) -> Result<Box<dyn TransactionIterator>> {
        let _ = (start, stop);
        Err(Error::Unsupported("iteration"))
    }

    /// Walk the current revision of every object. Start with `next = None`.
    fn record_iternext(&self, next: Option<Oid>) -> Result<RecordIterNext> {
        let _ = next;
        Err(Error::Unsupported("record iteration"))
    }

    fn store_blob(
        &self,
        oid: Oid,
        serial: Tid,
        data: &[u8],
        blob: &Path,
        txn: &TransactionMeta,
    ) -> Result<()> {
        let _ = (oid, serial, data, blob, txn);
        Err(Error::Unsupported("blobs"))
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
        let _ = (oid, serial, data, blob, prev_txn, txn);
        Err(Error::Unsupported("blobs"))
    }

    /// Path of the committed blob file for a revision.
    fn load_blob(&self, oid: Oid, serial: Tid) -> Result<PathBuf> {
        let _ = (oid, serial);
        Err(Error::Unsupported("blobs"))
    }

    fn open_committed_blob_file(&self, oid: Oid, serial: Tid) -> Result<File> {
        Ok(File::open(self.load_blob(oid, serial)?)?)
    }

    /// Directory where uncommitted blob files should be created.
    fn temporary_directory(&self) -> Result<PathBuf> {
        Err(Error::Unsupported("blobs"))
    }

    fn supports_undo(&self) -> bool {
        false
    }

    /// Undo the transaction `id`, as part of `txn`.
    fn undo(&self, id: Tid, txn: &TransactionMeta) -> Result<Vec<Oid>> {
        let _ = (id, txn);
        Err(Error::Unsupported("undo"))
    }

    fn undo_log(&self, first: usize, last: usize) -> Result<Vec<UndoEntry>> {
        let _ = (first, last);
        Err(Error::Unsupported("undo"))
    }

    fn undo_info(&self, first: usize, last: usize) -> Result<Vec<UndoEntry>> {
        self.undo_log(first, last)
    }
}

/// Replay every transaction of `source` into `destination`, keeping tids, metadata and blobs.
/// Returns the number of transactions copied.
pub fn copy_transactions(source: &dyn Storage, destination: &dyn Storage) -> Result<usize> {
    let mut iter = source.iterator(None, None)?;
    let mut copied = 0;
    let result = (|| {
        for txn in iter.by_ref() {
            let txn = txn?;
            let meta = txn.meta();
            destination.tpc_begin(&meta, Some(txn.tid), Some(txn.status))?;
            let replay = (|| {
                for record in &txn.records {
                    let blob = match (&record.data, source.load_blob(record.oid, record.tid)) {
                        (Some(_), Ok(path)) => Some(path),
                        (_, Ok(_)) | (_, Err(Error::Unsupported(_))) => None,
                        (_, Err(Error::KeyNotFound { .. })) => None,
                        (_, Err(e)) => return Err(e),
                    };
                    match (blob, record.data.as_deref()) {
                        (Some(path), Some(data)) => destination.restore_blob(
                            record.oid,
                            record.tid,
                            data,
                            &path,
                            record.data_txn,
                            &meta,
                        )?,
                        (_, data) => destination.restore(
                            record.oid,
                            record.tid,
                            data,
                            record.data_txn,
                            &meta,
                        )?,
                    }
                }
                destination.tpc_vote(&meta)?;
                destination.tpc_finish(&meta, None)
            })();
            if let Err(e) = replay {
                destination.tpc_abort(&meta);
                return Err(e);
            }
            copied += 1;
        }
        Ok(copied)
    })();
    iter.close();
    tracing::info!(
        source = %source.name(),
        destination = %destination.name(),
        copied,
        "copied transactions"
    );
    result
}
