//! Bus envelope: the fixed meta header carried as the last frame of every
//! message, body compression, and the dump-file record format.

mod compression;
pub mod dump;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::Ordering;

use bytes::Bytes;

use crate::{Error, Result, metrics};

pub use compression::{BufferPool, DEFAULT_DECOMPRESSION_CEILING, ScratchBuffer};

pub const META_INFO_TAG: u16 = 0xcabd;
pub const META_INFO_VERSION: u8 = 1;
/// Encoded size of [`Meta`] in bytes.
pub const META_INFO_SIZE: usize = 24;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionMethod {
    #[default]
    None = 0,
    Zlib = 1,
    Snappy = 2,
    Brotli = 3,
}

impl CompressionMethod {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CompressionMethod {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Zlib),
            2 => Ok(CompressionMethod::Snappy),
            3 => Ok(CompressionMethod::Brotli),
            _ => Err(Error::InvalidEnvelope("unknown compression method")),
        }
    }
}

impl FromStr for CompressionMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CompressionMethod::None),
            "gzip" | "zlib" => Ok(CompressionMethod::Zlib),
            "snappy" => Ok(CompressionMethod::Snappy),
            "brotli" => Ok(CompressionMethod::Brotli),
            other => Err(Error::Config(format!(
                "unsupported compression method: '{other}'"
            ))),
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionMethod::None => "no compression",
            CompressionMethod::Zlib => "zlib",
            CompressionMethod::Snappy => "snappy",
            CompressionMethod::Brotli => "brotli",
        };
        f.write_str(name)
    }
}

/// Per-message metadata. Serialized in network byte order as
/// `tag:u16 compression:u8 version:u8 device:u32 created_ms:u64 sequence:u64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Meta {
    pub tag: u16,
    pub compression_method: CompressionMethod,
    pub version: u8,
    pub device_number: u32,
    pub created_ms: u64,
    pub sequence_number: u64,
}

impl Meta {
    pub fn new(
        compression_method: CompressionMethod,
        device_number: u32,
        sequence_number: u64,
        created_ms: u64,
    ) -> Self {
        Self {
            tag: META_INFO_TAG,
            compression_method,
            version: META_INFO_VERSION,
            device_number,
            created_ms,
            sequence_number,
        }
    }

    pub fn encode(&self) -> [u8; META_INFO_SIZE] {
        let mut out = [0u8; META_INFO_SIZE];
        out[0..2].copy_from_slice(&self.tag.to_be_bytes());
        out[2] = self.compression_method.as_u8();
        out[3] = self.version;
        out[4..8].copy_from_slice(&self.device_number.to_be_bytes());
        out[8..16].copy_from_slice(&self.created_ms.to_be_bytes());
        out[16..24].copy_from_slice(&self.sequence_number.to_be_bytes());
        out
    }

    /// Returns `None` unless `bytes` is exactly one header carrying the
    /// expected tag, version and a known compression method.
    pub fn decode(bytes: &[u8]) -> Option<Meta> {
        let bytes: &[u8; META_INFO_SIZE] = bytes.try_into().ok()?;
        let tag = u16::from_be_bytes([bytes[0], bytes[1]]);
        let version = bytes[3];
        if tag != META_INFO_TAG || version != META_INFO_VERSION {
            return None;
        }
        let compression_method = CompressionMethod::try_from(bytes[2]).ok()?;
        let device_number = u32::from_be_bytes(bytes[4..8].try_into().ok()?);
        let created_ms = u64::from_be_bytes(bytes[8..16].try_into().ok()?);
        let sequence_number = u64::from_be_bytes(bytes[16..24].try_into().ok()?);
        Some(Meta {
            tag,
            compression_method,
            version,
            device_number,
            created_ms,
            sequence_number,
        })
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "meta(tag:{:x} version:{} compression:{} device:{} sequence:{} created:{})",
            self.tag,
            self.version,
            self.compression_method.as_u8(),
            self.device_number,
            self.sequence_number,
            self.created_ms
        )
    }
}

/// A bus message: `app_env`, `key`, `body` and the trailing meta frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    pub app_env: Bytes,
    pub key: Bytes,
    pub body: Bytes,
    pub meta: Meta,
}

impl WireMessage {
    pub fn new(
        app_env: impl Into<Bytes>,
        key: impl Into<Bytes>,
        body: impl Into<Bytes>,
        meta: Meta,
    ) -> Self {
        Self {
            app_env: app_env.into(),
            key: key.into(),
            body: body.into(),
            meta,
        }
    }

    /// Compress `data` with `method` and wrap it into a message.
    pub fn compressed(
        pool: &mut BufferPool,
        app_env: impl Into<Bytes>,
        key: impl Into<Bytes>,
        data: &[u8],
        meta: Meta,
    ) -> Result<Self> {
        let body = Bytes::copy_from_slice(pool.compress(meta.compression_method, data)?);
        Ok(Self::new(app_env, key, body, meta))
    }

    /// Invalid envelopes are counted in `envelopes_invalid_total`.
    pub fn from_frames(frames: Vec<Bytes>) -> Result<Self> {
        let invalid = |reason| {
            metrics::metrics()
                .envelopes_invalid_total
                .fetch_add(1, Ordering::Relaxed);
            Error::InvalidEnvelope(reason)
        };
        let [app_env, key, body, meta]: [Bytes; 4] = frames
            .try_into()
            .map_err(|_| invalid("expected four frames"))?;
        let meta = Meta::decode(&meta).ok_or_else(|| invalid("malformed meta frame"))?;
        Ok(Self {
            app_env,
            key,
            body,
            meta,
        })
    }

    pub fn into_frames(self) -> Vec<Bytes> {
        let meta = Bytes::copy_from_slice(&self.meta.encode());
        vec![self.app_env, self.key, self.body, meta]
    }

    /// Body after undoing the compression named in the meta frame. The slice
    /// borrows `pool` and is overwritten by its next call.
    pub fn decoded_body<'a>(&'a self, pool: &'a mut BufferPool) -> Result<&'a [u8]> {
        pool.decompress(self.meta.compression_method, &self.body)
    }

    pub fn set_device_and_sequence_number(&mut self, device_number: u32, sequence_number: u64) {
        self.meta.device_number = device_number;
        self.meta.sequence_number = sequence_number;
    }

    /// Total payload bytes across all frames.
    pub fn content_size(&self) -> usize {
        self.app_env.len() + self.key.len() + self.body.len() + META_INFO_SIZE
    }
}
