//! zstorage wraps an object database storage and compresses the records stored in it. Any
//! storage implementing [`Storage`] can be wrapped, and the wrapper is itself a [`Storage`], so
//! a database uses it exactly as it would the storage underneath.
//!
//! - Records are compressed on the way into the storage, and only kept compressed when that
//!   actually makes them smaller. Short records, and records that already look compressed, are
//!   stored untouched.
//! - Compressed records start with a two-byte marker: `.z` for a zlib stream, `.Z` for a zstd
//!   frame. Anything without a marker is raw, so existing uncompressed stores can be wrapped as
//!   they are, and compression can be switched off without losing access to compressed records.
//! - Everything not touching record data is passed through to the wrapped storage.
//! - A server-side variant leaves records compressed on load and store, for storage servers whose
//!   clients do their own compression, while still inflating records for packing.
//!
//! [`MemoryStorage`] is an in-memory storage to wrap, and [`StorageConfig`] reads a TOML
//! description of a compressed storage.

pub mod compress;
pub mod config;
mod error;
pub mod memory;
pub mod storage;
mod transaction;
pub mod wrapper;

pub use self::compress::{compress, decompress, is_compressed, Compress};
pub use self::config::{Algorithm, StorageConfig};
pub use self::error::{Error, Result};
pub use self::memory::MemoryStorage;
pub use self::storage::{
    copy_transactions, Database, Oid, Storage, Tid, TransactionIterator, TransactionMeta,
};
pub use self::transaction::DecompressingIterator;
pub use self::wrapper::CompressedStorage;
