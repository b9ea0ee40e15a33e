use crate::storage::{Oid, Tid};
use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// Occurs when a record carries a compression marker but its payload could not be inflated.
    FailDecompress(String),
    /// Occurs when the compression library itself reports a failure while deflating a record.
    FailCompress(String),
    /// No revision of the object exists that satisfies the request.
    KeyNotFound { oid: Oid, serial: Option<Tid> },
    /// A store was attempted against a serial (`expected`) that is no longer the object's current
    /// revision (`actual`).
    Conflict {
        oid: Oid,
        expected: Tid,
        actual: Tid,
    },
    /// The storage was opened read-only, or has been closed.
    ReadOnly,
    /// Two-phase commit protocol was violated, e.g. storing under a transaction that was never
    /// begun.
    StorageTransaction(String),
    /// The storage doesn't provide the named capability.
    Unsupported(&'static str),
    /// An operation needed the registered database, but none has been registered yet.
    NoDatabase,
    /// Configuration failed to parse or named an unknown setting.
    Config(String),
    /// Underlying I/O failure, mostly from blob file handling.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::FailDecompress(ref err) => write!(f, "Failed decompression step: {}", err),
            Error::FailCompress(ref err) => write!(f, "Failed compression step: {}", err),
            Error::KeyNotFound { oid, serial } => match serial {
                Some(serial) => write!(f, "No revision of object {} at serial {}", oid, serial),
                None => write!(f, "Object {} not found", oid),
            },
            Error::Conflict {
                oid,
                expected,
                actual,
            } => write!(
                f,
                "Write conflict on object {}: stored against serial {}, but current serial is {}",
                oid, expected, actual
            ),
            Error::ReadOnly => f.write_str("Storage is read-only"),
            Error::StorageTransaction(ref err) => write!(f, "Transaction error: {}", err),
            Error::Unsupported(what) => write!(f, "Storage doesn't support {}", what),
            Error::NoDatabase => f.write_str("No database has been registered with the storage"),
            Error::Config(ref err) => write!(f, "Invalid configuration: {}", err),
            Error::Io(ref err) => write!(f, "I/O failure: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Io(ref err) => Some(err),
            _ => None,
        }
    }
}

impl std::convert::From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::convert::From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}
