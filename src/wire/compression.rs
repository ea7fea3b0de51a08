use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::CompressionMethod;
use crate::config::ImporterConfig;
use crate::{Error, Result};

/// Hard ceiling for decompressed bodies. Anything larger is treated as a
/// poison pill and rejected.
pub const DEFAULT_DECOMPRESSION_CEILING: usize = 32 * 1024 * 1024;

const INITIAL_BUFFER_SIZE: usize = 64 * 1024;

/// A reusable byte buffer that grows by doubling and never shrinks.
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    buf: Vec<u8>,
}

impl ScratchBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Double the buffer until it holds at least `min` bytes.
    pub fn ensure(&mut self, min: usize) -> &mut [u8] {
        if self.buf.len() < min {
            let mut next = self.buf.len().max(1);
            while next < min {
                next *= 2;
            }
            self.buf.resize(next, 0);
        }
        &mut self.buf[..]
    }

    /// Resize to exactly `size` bytes if that is larger than the current size.
    pub fn grow_to(&mut self, size: usize) {
        if size > self.buf.len() {
            self.buf.resize(size, 0);
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    fn filled(&self, len: usize) -> &[u8] {
        &self.buf[..len]
    }
}

/// Per-worker compression scratch space.
#[derive(Debug)]
pub struct BufferPool {
    compression: ScratchBuffer,
    decompression: ScratchBuffer,
    ceiling: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_sizes(INITIAL_BUFFER_SIZE, DEFAULT_DECOMPRESSION_CEILING)
    }

    /// A pool bounded by the configured decompression ceiling.
    pub fn from_config(config: &ImporterConfig) -> Self {
        Self::with_sizes(INITIAL_BUFFER_SIZE, config.decompression_ceiling)
    }

    pub fn with_sizes(initial: usize, ceiling: usize) -> Self {
        let initial = initial.clamp(1, ceiling.max(1));
        Self {
            compression: ScratchBuffer::with_capacity(initial),
            decompression: ScratchBuffer::with_capacity(initial),
            ceiling,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn compression_capacity(&self) -> usize {
        self.compression.capacity()
    }

    pub fn decompression_capacity(&self) -> usize {
        self.decompression.capacity()
    }

    pub fn compress<'a>(&'a mut self, method: CompressionMethod, data: &'a [u8]) -> Result<&'a [u8]> {
        match method {
            CompressionMethod::None => Ok(data),
            CompressionMethod::Zlib => self.compress_zlib(data),
            CompressionMethod::Snappy => self.compress_snappy(data),
            CompressionMethod::Brotli => Err(Error::UnsupportedCompression(method)),
        }
    }

    pub fn decompress<'a>(
        &'a mut self,
        method: CompressionMethod,
        data: &'a [u8],
    ) -> Result<&'a [u8]> {
        match method {
            CompressionMethod::None => Ok(data),
            CompressionMethod::Zlib => self.decompress_zlib(data),
            CompressionMethod::Snappy => self.decompress_snappy(data),
            CompressionMethod::Brotli => Err(Error::UnsupportedCompression(method)),
        }
    }

    fn compress_zlib(&mut self, data: &[u8]) -> Result<&[u8]> {
        let bound = zlib_compress_bound(data.len());
        let written = {
            let out = self.compression.ensure(bound);
            let mut z = Compress::new(Compression::default(), true);
            match z.compress(data, out, FlushCompress::Finish) {
                Ok(Status::StreamEnd) => z.total_out() as usize,
                Ok(status) => {
                    return Err(Error::Compression(format!(
                        "zlib stream not finished: {status:?}"
                    )));
                }
                Err(e) => return Err(Error::Compression(e.to_string())),
            }
        };
        Ok(self.compression.filled(written))
    }

    fn compress_snappy(&mut self, data: &[u8]) -> Result<&[u8]> {
        let bound = snap::raw::max_compress_len(data.len());
        if bound == 0 && !data.is_empty() {
            return Err(Error::Compression("input too large for snappy".into()));
        }
        let written = {
            let out = self.compression.ensure(bound);
            snap::raw::Encoder::new()
                .compress(data, out)
                .map_err(|e| Error::Compression(e.to_string()))?
        };
        Ok(self.compression.filled(written))
    }

    fn decompress_zlib(&mut self, data: &[u8]) -> Result<&[u8]> {
        loop {
            let capacity = self.decompression.capacity();
            let (status, consumed, produced) = {
                let out = self.decompression.as_mut_slice();
                let mut z = Decompress::new(true);
                let status = z
                    .decompress(data, out, FlushDecompress::Finish)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                (status, z.total_in() as usize, z.total_out() as usize)
            };
            if status == Status::StreamEnd {
                return Ok(self.decompression.filled(produced));
            }
            if consumed == data.len() && produced < capacity {
                return Err(Error::Compression("truncated zlib stream".into()));
            }
            if capacity >= self.ceiling {
                return Err(Error::DecompressionLimit {
                    ceiling: self.ceiling,
                });
            }
            self.decompression
                .grow_to(capacity.saturating_mul(2).min(self.ceiling));
        }
    }

    fn decompress_snappy(&mut self, data: &[u8]) -> Result<&[u8]> {
        let len = snap::raw::decompress_len(data).map_err(|e| Error::Compression(e.to_string()))?;
        if len > self.ceiling {
            return Err(Error::DecompressionLimit {
                ceiling: self.ceiling,
            });
        }
        let written = {
            let out = self.decompression.ensure(len);
            snap::raw::Decoder::new()
                .decompress(data, out)
                .map_err(|e| Error::Compression(e.to_string()))?
        };
        Ok(self.decompression.filled(written))
    }
}

/// zlib's `compressBound`: worst-case deflate output for `len` input bytes.
fn zlib_compress_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: usize) -> Vec<u8> {
        br#"{"action":"orders#show","code":200,"total_time":17.3,"db_calls":4}"#
            .iter()
            .copied()
            .cycle()
            .take(n)
            .collect()
    }

    #[test]
    fn zlib_and_snappy_roundtrip() {
        let mut pool = BufferPool::with_sizes(16, DEFAULT_DECOMPRESSION_CEILING);
        let data = payload(100_000);
        for method in [CompressionMethod::Zlib, CompressionMethod::Snappy] {
            let compressed = pool.compress(method, &data).unwrap().to_vec();
            assert!(compressed.len() < data.len(), "{method} did not compress");
            let restored = pool.decompress(method, &compressed).unwrap();
            assert_eq!(restored, &data[..]);
        }
    }

    #[test]
    fn scratch_buffers_double_and_never_shrink() {
        let mut pool = BufferPool::with_sizes(16, DEFAULT_DECOMPRESSION_CEILING);
        let big = payload(10_000);
        pool.compress(CompressionMethod::Snappy, &big).unwrap();
        let grown = pool.compression_capacity();
        assert!(grown >= snap::raw::max_compress_len(big.len()));
        assert!(grown.is_power_of_two());

        pool.compress(CompressionMethod::Snappy, b"tiny").unwrap();
        assert_eq!(pool.compression_capacity(), grown);
    }

    #[test]
    fn zlib_decompression_stops_at_ceiling() {
        let mut pool = BufferPool::with_sizes(1024, 64 * 1024);
        let zeros = vec![0u8; 1024 * 1024];
        let compressed = pool.compress(CompressionMethod::Zlib, &zeros).unwrap().to_vec();
        let err = pool
            .decompress(CompressionMethod::Zlib, &compressed)
            .unwrap_err();
        assert!(matches!(err, Error::DecompressionLimit { ceiling } if ceiling == 64 * 1024));
        assert_eq!(pool.decompression_capacity(), 64 * 1024);
    }

    #[test]
    fn snappy_decompression_stops_at_ceiling() {
        let mut pool = BufferPool::with_sizes(1024, 64 * 1024);
        let zeros = vec![0u8; 1024 * 1024];
        let compressed = pool
            .compress(CompressionMethod::Snappy, &zeros)
            .unwrap()
            .to_vec();
        let err = pool
            .decompress(CompressionMethod::Snappy, &compressed)
            .unwrap_err();
        assert!(matches!(err, Error::DecompressionLimit { .. }));
    }

    #[test]
    fn corrupt_input_fails_without_growing() {
        let mut pool = BufferPool::with_sizes(1024, DEFAULT_DECOMPRESSION_CEILING);
        assert!(pool
            .decompress(CompressionMethod::Zlib, b"definitely not zlib")
            .is_err());
        assert!(pool
            .decompress(CompressionMethod::Snappy, &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff])
            .is_err());
        assert_eq!(pool.decompression_capacity(), 1024);
    }

    #[test]
    fn truncated_zlib_stream_is_rejected() {
        let mut pool = BufferPool::new();
        let data = payload(4096);
        let compressed = pool.compress(CompressionMethod::Zlib, &data).unwrap().to_vec();
        let err = pool
            .decompress(CompressionMethod::Zlib, &compressed[..compressed.len() / 2])
            .unwrap_err();
        assert!(matches!(err, Error::Compression(_)));
    }

    #[test]
    fn brotli_is_not_supported() {
        let mut pool = BufferPool::new();
        assert!(matches!(
            pool.compress(CompressionMethod::Brotli, b"x"),
            Err(Error::UnsupportedCompression(CompressionMethod::Brotli))
        ));
    }
}
