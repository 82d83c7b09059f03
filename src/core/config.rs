//! Construction-time configuration for the pipelines and the decoder.
//!
//! Every knob is an explicit value with a documented default; nothing is
//! read from process-wide state except through [`ReadChecks::from_env`].

use std::thread;

use serde::{Deserialize, Serialize};

use crate::core::compression::CompressionModes;
use crate::core::{Error, Result};

/// Environment variable consulted by [`ReadChecks::from_env`].
pub const READ_CHECKS_ENV: &str = "EXTENTSTORE_READ_CHECKS";

/// Byte order of integers and floats inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    pub fn is_native(self) -> bool {
        self == Self::native()
    }

    pub fn flipped(self) -> Self {
        match self {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        }
    }

    pub(crate) fn put_u32(self, buf: &mut [u8], offset: usize, value: u32) {
        let bytes = match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        buf[offset..offset + 4].copy_from_slice(&bytes);
    }

    pub(crate) fn put_u64(self, buf: &mut [u8], offset: usize, value: u64) {
        let bytes = match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        buf[offset..offset + 8].copy_from_slice(&bytes);
    }

    pub(crate) fn get_u32(self, buf: &[u8], offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[offset..offset + 4]);
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }

    pub(crate) fn get_u64(self, buf: &[u8], offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[offset..offset + 8]);
        match self {
            ByteOrder::Little => u64::from_le_bytes(bytes),
            ByteOrder::Big => u64::from_be_bytes(bytes),
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        Self::native()
    }
}

/// Optional integrity checks performed while decoding frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadChecks {
    /// Verify the frame checksum before decompressing.
    /// Default: true
    pub pre_uncompress: bool,

    /// Verify the data checksum after decompressing.
    /// Default: false
    pub post_uncompress: bool,

    /// Walk every variable-length reference after decoding.
    /// Default: false
    pub variable_slots: bool,
}

impl Default for ReadChecks {
    fn default() -> Self {
        Self {
            pre_uncompress: true,
            post_uncompress: false,
            variable_slots: false,
        }
    }
}

impl ReadChecks {
    pub fn all() -> Self {
        Self {
            pre_uncompress: true,
            post_uncompress: true,
            variable_slots: true,
        }
    }

    pub fn none() -> Self {
        Self {
            pre_uncompress: false,
            post_uncompress: false,
            variable_slots: false,
        }
    }

    /// Parse a comma separated list such as `preuncompress,variable32`.
    pub fn parse(list: &str) -> Result<Self> {
        let mut checks = Self::none();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match item {
                "preuncompress" => checks.pre_uncompress = true,
                "postuncompress" => checks.post_uncompress = true,
                "variable32" => checks.variable_slots = true,
                "all" => checks = Self::all(),
                "none" => checks = Self::none(),
                other => {
                    return Err(Error::format(format!("unknown read check '{other}'")));
                }
            }
        }
        Ok(checks)
    }

    /// Read [`READ_CHECKS_ENV`], falling back to the default when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(READ_CHECKS_ENV) {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(Self::default()),
        }
    }
}

pub(crate) fn available_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration for [`crate::ExtentFileSink`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Number of compressor threads. 0 compresses on the calling thread.
    /// Default: available parallelism
    pub compressors: usize,

    /// Algorithms tried for each section.
    /// Default: all
    pub compression_modes: CompressionModes,

    /// Compression level passed to zlib and zstd.
    /// Default: 9
    pub compression_level: i32,

    /// Ceiling on unwritten extent bytes before `write_extent` blocks.
    /// Default: 256 MB
    pub max_bytes_in_progress: usize,

    /// Queue depth allowed per compressor thread.
    /// Default: 2
    pub queue_depth_per_compressor: usize,

    /// Byte order of the produced file.
    /// Default: host order
    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Fsync the file before closing it.
    /// Default: false
    pub fsync_on_close: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            compressors: available_threads(),
            compression_modes: CompressionModes::ALL,
            compression_level: 9,
            max_bytes_in_progress: 256 * 1024 * 1024, // 256 MB
            queue_depth_per_compressor: 2,
            byte_order: ByteOrder::native(),
            fsync_on_close: false,
        }
    }
}

impl SinkConfig {
    pub fn compressors(mut self, n: usize) -> Self {
        self.compressors = n;
        self
    }

    pub fn compression_modes(mut self, modes: CompressionModes) -> Self {
        self.compression_modes = modes;
        self
    }

    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn max_bytes_in_progress(mut self, bytes: usize) -> Self {
        self.max_bytes_in_progress = bytes;
        self
    }

    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    pub fn fsync_on_close(mut self, fsync: bool) -> Self {
        self.fsync_on_close = fsync;
        self
    }

    pub(crate) fn max_queue_depth(&self) -> usize {
        (self.compressors * self.queue_depth_per_compressor).max(1)
    }
}

/// Configuration for [`crate::IndexSource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Number of decode threads, at least 1.
    /// Default: available parallelism
    pub unpack_threads: usize,

    /// Budget for frames read but not yet claimed by a decoder.
    /// Default: 8 MB
    pub max_compressed_bytes: usize,

    /// Budget for frames being decoded or waiting for the consumer.
    /// Default: 32 MB
    pub max_unpacked_bytes: usize,

    /// Checks applied while decoding.
    #[serde(default)]
    pub read_checks: ReadChecks,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            unpack_threads: available_threads(),
            max_compressed_bytes: 8 * 1024 * 1024,
            max_unpacked_bytes: 32 * 1024 * 1024,
            read_checks: ReadChecks::default(),
        }
    }
}

impl PrefetchConfig {
    pub fn unpack_threads(mut self, n: usize) -> Self {
        self.unpack_threads = n.max(1);
        self
    }

    pub fn max_compressed_bytes(mut self, bytes: usize) -> Self {
        self.max_compressed_bytes = bytes;
        self
    }

    pub fn max_unpacked_bytes(mut self, bytes: usize) -> Self {
        self.max_unpacked_bytes = bytes;
        self
    }

    pub fn read_checks(mut self, checks: ReadChecks) -> Self {
        self.read_checks = checks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_config_default() {
        let config = SinkConfig::default();
        assert!(config.compressors >= 1);
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.max_bytes_in_progress, 256 * 1024 * 1024);
        assert_eq!(config.byte_order, ByteOrder::native());
        assert!(!config.fsync_on_close);
    }

    #[test]
    fn test_queue_depth_never_zero() {
        let config = SinkConfig::default().compressors(0);
        assert_eq!(config.max_queue_depth(), 1);
        let config = SinkConfig::default().compressors(4);
        assert_eq!(config.max_queue_depth(), 8);
    }

    #[test]
    fn test_prefetch_config_default() {
        let config = PrefetchConfig::default();
        assert_eq!(config.max_compressed_bytes, 8 * 1024 * 1024);
        assert_eq!(config.max_unpacked_bytes, 32 * 1024 * 1024);
        assert_eq!(PrefetchConfig::default().unpack_threads(0).unpack_threads, 1);
    }

    #[test]
    fn test_read_checks_parse() {
        let checks = ReadChecks::parse("preuncompress, variable32").expect("parse");
        assert!(checks.pre_uncompress);
        assert!(!checks.post_uncompress);
        assert!(checks.variable_slots);
        assert_eq!(ReadChecks::parse("all").expect("parse"), ReadChecks::all());
        assert_eq!(ReadChecks::parse("all,none").expect("parse"), ReadChecks::none());
        assert!(ReadChecks::parse("bogus").is_err());
    }

    #[test]
    fn test_byte_order_accessors() {
        let mut buf = [0u8; 12];
        ByteOrder::Big.put_u32(&mut buf, 0, 0x1234_5678);
        assert_eq!(&buf[0..4], &[0x12, 0x34, 0x56, 0x78]);
        ByteOrder::Little.put_u64(&mut buf, 4, 0x0102_0304_0506_0708);
        assert_eq!(buf[4], 0x08);
        assert_eq!(ByteOrder::Little.get_u64(&buf, 4), 0x0102_0304_0506_0708);
        assert_eq!(ByteOrder::Big.get_u32(&buf, 0), 0x1234_5678);
        assert_eq!(ByteOrder::Big.flipped(), ByteOrder::Little);
    }
}
