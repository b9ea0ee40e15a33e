//! Storage configuration, loadable from TOML.
//!
//! ```toml
//! compress = true
//! algorithm = "zlib"
//! level = 6
//!
//! [base.memory]
//! name = "main"
//! blob-dir = "blobs"
//! ```

use crate::compress::Compress;
use crate::error::Result;
use crate::memory::MemoryStorage;
use crate::storage::Storage;
use crate::wrapper::CompressedStorage;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Compression algorithm used for newly written records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Zlib,
    Zstd,
}

/// Configuration of a compressed storage and the storage it wraps.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StorageConfig {
    /// Whether to compress new records. Left out, this means yes.
    #[serde(default)]
    pub compress: Option<bool>,
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Compression level, the algorithm's default when left out.
    #[serde(default)]
    pub level: Option<u8>,
    /// Open as a server-side storage, leaving records compressed on load and store.
    #[serde(default)]
    pub server: bool,
    /// The wrapped storage.
    pub base: BaseConfig,
}

/// Configuration of the wrapped storage.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BaseConfig {
    Memory(MemoryConfig),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MemoryConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Directory for committed blobs. Blobs are unsupported without one.
    #[serde(default)]
    pub blob_dir: Option<PathBuf>,
    #[serde(default)]
    pub read_only: bool,
}

fn default_name() -> String {
    "memory".into()
}

impl StorageConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// The compression setting this configuration asks for.
    pub fn compression(&self) -> Compress {
        if self.compress == Some(false) {
            return Compress::None;
        }
        match (self.algorithm, self.level) {
            (Algorithm::Zlib, None) => Compress::default(),
            (Algorithm::Zlib, Some(level)) => Compress::new_zlib(level),
            (Algorithm::Zstd, None) => Compress::zstd(),
            (Algorithm::Zstd, Some(level)) => Compress::new_zstd(level),
        }
    }

    /// Open the configured base storage and wrap it.
    pub fn open(&self) -> Result<Arc<CompressedStorage<MemoryStorage>>> {
        Ok(self.open_with(self.base.open()?))
    }

    /// Wrap a storage opened elsewhere, ignoring the configured base.
    pub fn open_with<S: Storage + 'static>(&self, base: S) -> Arc<CompressedStorage<S>> {
        if self.server {
            CompressedStorage::server(base, self.compression())
        } else {
            CompressedStorage::new(base, self.compression())
        }
    }
}

impl BaseConfig {
    pub fn open(&self) -> Result<MemoryStorage> {
        match self {
            BaseConfig::Memory(config) => {
                let storage = match config.blob_dir {
                    Some(ref dir) => MemoryStorage::with_blob_dir(config.name.clone(), dir)?,
                    None => MemoryStorage::new(config.name.clone()),
                };
                Ok(storage.read_only(config.read_only))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;

    #[test]
    fn defaults() {
        let config = StorageConfig::from_toml("[base.memory]\n").unwrap();
        assert_eq!(config.compress, None);
        assert!(!config.server);
        assert_eq!(config.compression(), Compress::Zlib { level: 6 });
        let storage = config.open().unwrap();
        assert_eq!(storage.name(), "memory");
        assert!(!storage.is_server());
        assert!(!storage.is_read_only());
    }

    #[test]
    fn compress_no() {
        let config = StorageConfig::from_toml(
            r#"
            compress = false
            [base.memory]
            name = "plain"
            "#,
        )
        .unwrap();
        assert_eq!(config.compression(), Compress::None);
        assert_eq!(config.open().unwrap().compression(), Compress::None);
    }

    #[test]
    fn zstd_server() {
        let config = StorageConfig::from_toml(
            r#"
            algorithm = "zstd"
            level = 12
            server = true
            [base.memory]
            read-only = true
            "#,
        )
        .unwrap();
        assert_eq!(config.compression(), Compress::Zstd { level: 12 });
        let storage = config.open().unwrap();
        assert!(storage.is_server());
        assert!(storage.is_read_only());
    }

    #[test]
    fn blob_dir() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!(
            "[base.memory]\nblob-dir = {:?}\n",
            dir.path().join("blobs").display().to_string()
        );
        let storage = StorageConfig::from_toml(&content).unwrap().open().unwrap();
        assert_eq!(
            storage.temporary_directory().unwrap(),
            dir.path().join("blobs").join("tmp")
        );
    }

    #[test]
    fn from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        std::fs::write(&path, "level = 1\n[base.memory]\nname = \"file\"\n").unwrap();
        let config = StorageConfig::from_file(&path).unwrap();
        assert_eq!(config.compression(), Compress::Zlib { level: 1 });
        let wrapped = config.open_with(MemoryStorage::new("elsewhere"));
        assert_eq!(wrapped.name(), "elsewhere");
    }

    #[test]
    fn bad_config() {
        for content in [
            "",
            "algorithm = \"lz4\"\n[base.memory]\n",
            "compression = true\n[base.memory]\n",
            "[base.file]\npath = \"data.fs\"\n",
        ] {
            assert!(matches!(
                StorageConfig::from_toml(content),
                Err(Error::Config(_))
            ));
        }
    }
}
