use crate::error::{Error, Result};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    cell::RefCell,
    io::{Read, Write},
};

thread_local! {
    static ZSTD_CCTX: RefCell<zstd_safe::CCtx<'static>> = RefCell::new(zstd_safe::CCtx::create());
    static ZSTD_DCTX: RefCell<zstd_safe::DCtx<'static>> = RefCell::new(zstd_safe::DCtx::create());
}

/// Prefix of a record holding a zlib stream.
///
/// A raw record that happens to start with `.z` can't be told apart from a compressed one, and
/// fails to read as corrupt. Pickles never start with `.`, so this doesn't come up in practice.
pub const MARKER_ZLIB: [u8; 2] = *b".z";
/// Prefix of a record holding a zstd frame.
///
/// Like [`MARKER_ZLIB`], this widens the set of raw records that can't be stored as-is: an
/// uncompressed record starting with `.Z` is taken for a zstd frame and fails to read.
pub const MARKER_ZSTD: [u8; 2] = *b".Z";
/// Records this long or shorter are never compressed.
pub const MIN_COMPRESS_LEN: usize = 20;
/// The largest record we're willing to inflate, 256 MiB.
pub const MAX_RECORD_SIZE: usize = 1usize << 28;

const MAX_ZLIB_LEVEL: u8 = 9;
const MAX_ZSTD_LEVEL: u8 = 22;

/// The format a stored record is in, as told by its first two bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CompressType {
    /// Raw record
    None,
    /// `.z` followed by a zlib stream
    Zlib,
    /// `.Z` followed by a zstd frame
    Zstd,
}

impl CompressType {
    pub fn of(data: &[u8]) -> Self {
        match data.get(..2) {
            Some(m) if m == MARKER_ZLIB => CompressType::Zlib,
            Some(m) if m == MARKER_ZSTD => CompressType::Zstd,
            _ => CompressType::None,
        }
    }
}

/// Returns true if the record starts with one of the compression markers.
pub fn is_compressed(data: &[u8]) -> bool {
    CompressType::of(data) != CompressType::None
}

/// Compression settings for records written through a storage wrapper.
///
/// Whatever the setting, reading always understands both compressed formats, so a store written
/// with one setting stays readable under any other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum Compress {
    /// Write records as-is.
    None,
    /// Deflate records into a zlib stream at the given level (0-9).
    Zlib {
        /// The compression level
        level: u8,
    },
    /// Compress records into a zstd frame at the given level (1-22).
    Zstd {
        /// The compression level
        level: u8,
    },
}

impl Compress {
    /// Create a new zlib setting. Levels above 9 are clamped.
    pub fn new_zlib(level: u8) -> Self {
        Compress::Zlib {
            level: level.min(MAX_ZLIB_LEVEL),
        }
    }

    /// Create a new zstd setting. Levels are clamped to 1-22.
    pub fn new_zstd(level: u8) -> Self {
        Compress::Zstd {
            level: level.clamp(1, MAX_ZSTD_LEVEL),
        }
    }

    /// Default zstd setting, level 3.
    pub fn zstd() -> Self {
        Compress::Zstd { level: 3 }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Compress::None)
    }

    /// Attempt to compress a record. The record is handed back untouched if it is empty, no
    /// longer than [`MIN_COMPRESS_LEN`], already carries a compression marker, or if the
    /// compressed form (marker included) wouldn't be strictly smaller.
    pub fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        if data.len() <= MIN_COMPRESS_LEN || is_compressed(data) {
            return Ok(Cow::Borrowed(data));
        }
        let compressed = match *self {
            Compress::None => return Ok(Cow::Borrowed(data)),
            Compress::Zlib { level } => zlib_compress(data, level)?,
            Compress::Zstd { level } => zstd_compress(data, level)?,
        };
        if compressed.len() < data.len() {
            tracing::trace!(
                raw = data.len(),
                compressed = compressed.len(),
                "compressed record"
            );
            Ok(Cow::Owned(compressed))
        } else {
            tracing::trace!(raw = data.len(), "record didn't shrink, storing raw");
            Ok(Cow::Borrowed(data))
        }
    }

    /// Owned variant of [`Compress::compress`], which skips the copy when the record is kept
    /// raw.
    pub fn compress_vec(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self.compress(&data)? {
            Cow::Owned(compressed) => Ok(compressed),
            Cow::Borrowed(_) => Ok(data),
        }
    }
}

impl std::default::Default for Compress {
    fn default() -> Self {
        Compress::Zlib { level: 6 }
    }
}

/// Compress a record with the default zlib setting. See [`Compress::compress`].
pub fn compress(data: &[u8]) -> Result<Cow<[u8]>> {
    Compress::default().compress(data)
}

/// Inflate a record if it carries a compression marker, otherwise hand it back unchanged.
pub fn decompress(data: &[u8]) -> Result<Cow<[u8]>> {
    match CompressType::of(data) {
        CompressType::None => Ok(Cow::Borrowed(data)),
        CompressType::Zlib => Ok(Cow::Owned(zlib_decompress(&data[2..])?)),
        CompressType::Zstd => Ok(Cow::Owned(zstd_decompress(&data[2..])?)),
    }
}

/// Owned variant of [`decompress`].
pub fn decompress_vec(data: Vec<u8>) -> Result<Vec<u8>> {
    match CompressType::of(&data) {
        CompressType::None => Ok(data),
        CompressType::Zlib => zlib_decompress(&data[2..]),
        CompressType::Zstd => zstd_decompress(&data[2..]),
    }
}

fn zlib_compress(input: &[u8], level: u8) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(input.len());
    output.extend_from_slice(&MARKER_ZLIB);
    let mut encoder = ZlibEncoder::new(output, Compression::new(level as u32));
    encoder
        .write_all(input)
        .map_err(|e| Error::FailCompress(format!("zlib: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::FailCompress(format!("zlib: {}", e)))
}

fn zlib_decompress(input: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(input.len() * 2);
    ZlibDecoder::new(input)
        .take(MAX_RECORD_SIZE as u64 + 1)
        .read_to_end(&mut output)
        .map_err(|e| Error::FailDecompress(format!("zlib: {}", e)))?;
    if output.len() > MAX_RECORD_SIZE {
        return Err(Error::FailDecompress(format!(
            "zlib: record inflates past the maximum of {} bytes",
            MAX_RECORD_SIZE
        )));
    }
    Ok(output)
}

fn zstd_error(step: &str, code: zstd_safe::ErrorCode) -> String {
    format!("zstd {} failure, code {} ({})", step, code, zstd_safe::get_error_name(code))
}

fn zstd_compress(input: &[u8], level: u8) -> Result<Vec<u8>> {
    // Marker first, then leave the worst-case frame size for zstd to fill out
    let mut output = vec![0u8; 2 + zstd_safe::compress_bound(input.len())];
    output[..2].copy_from_slice(&MARKER_ZSTD);
    let used_len = ZSTD_CCTX.with_borrow_mut(|ctx| {
        ctx.compress(&mut output[2..], input, level as i32)
            .map_err(|code| Error::FailCompress(zstd_error("compress", code)))
    })?;
    output.truncate(2 + used_len);
    Ok(output)
}

fn zstd_decompress(input: &[u8]) -> Result<Vec<u8>> {
    let out_size = match zstd_safe::get_frame_content_size(input) {
        Ok(Some(size)) => size,
        Ok(None) => return Err(Error::FailDecompress("zstd: missing frame content size".into())),
        Err(_) => return Err(Error::FailDecompress("zstd: invalid frame header".into())),
    };
    if out_size > MAX_RECORD_SIZE as u64 {
        return Err(Error::FailDecompress(format!(
            "zstd: frame declares {} bytes, larger than the maximum of {}",
            out_size, MAX_RECORD_SIZE
        )));
    }
    let out_size = out_size as usize;
    let mut output = vec![0u8; out_size];
    let used_len = ZSTD_DCTX.with_borrow_mut(|dtx| {
        dtx.decompress(&mut output[..], input)
            .map_err(|code| Error::FailDecompress(zstd_error("decompress", code)))
    })?;
    if used_len != out_size {
        return Err(Error::FailDecompress(
            "zstd: decompressed size doesn't match promised size".into(),
        ));
    }
    Ok(output)
}
