//! Counters kept by the pipelines.

use std::ops::{AddAssign, SubAssign};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::compression::Compression;
use crate::core::frame::EncodedFrame;

/// Cumulative statistics of extents written by a sink.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkStats {
    /// Number of extents written.
    pub extents: u64,

    /// Sections stored raw.
    pub compress_none: u64,

    /// Sections stored with lz4.
    pub compress_lz4: u64,

    /// Sections stored with zlib.
    pub compress_zlib: u64,

    /// Sections stored with zstd.
    pub compress_zstd: u64,

    /// Fixed plus packed variable bytes before compression.
    pub unpacked_size: u64,

    pub unpacked_fixed: u64,

    /// Variable bytes after duplicate values were shared.
    pub unpacked_variable: u64,

    /// Variable bytes as held by the extents.
    pub unpacked_variable_raw: u64,

    /// Bytes written, frame headers included.
    pub packed_size: u64,

    pub nrecords: u64,

    /// Time spent encoding, summed over all compressor threads.
    pub pack_time: Duration,

    /// Most extent bytes queued but not yet written at any one time.
    pub peak_bytes_in_progress: u64,
}

impl SinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one written frame.
    pub fn record_frame(&mut self, frame: &EncodedFrame) {
        self.extents += 1;
        self.record_mode(frame.fixed_mode);
        self.record_mode(frame.variable_mode);
        self.unpacked_size += (frame.unpacked_fixed + frame.unpacked_variable) as u64;
        self.unpacked_fixed += frame.unpacked_fixed as u64;
        self.unpacked_variable += frame.unpacked_variable as u64;
        self.unpacked_variable_raw += frame.unpacked_variable_raw as u64;
        self.packed_size += frame.bytes.len() as u64;
        self.nrecords += frame.nrecords as u64;
        self.pack_time += frame.pack_time;
    }

    fn record_mode(&mut self, mode: Compression) {
        match mode {
            Compression::None => self.compress_none += 1,
            Compression::Lz4 => self.compress_lz4 += 1,
            Compression::Zlib => self.compress_zlib += 1,
            Compression::Zstd => self.compress_zstd += 1,
        }
    }

    /// Packed over unpacked size; 0.0 when nothing was written.
    pub fn compression_ratio(&self) -> f64 {
        if self.unpacked_size == 0 {
            0.0
        } else {
            self.packed_size as f64 / self.unpacked_size as f64
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Extents: {}, Records: {}, Unpacked: {} bytes, Packed: {} bytes ({:.1}%), \
             Sections none/lz4/zlib/zstd: {}/{}/{}/{}, Pack time: {:?}",
            self.extents,
            self.nrecords,
            self.unpacked_size,
            self.packed_size,
            self.compression_ratio() * 100.0,
            self.compress_none,
            self.compress_lz4,
            self.compress_zlib,
            self.compress_zstd,
            self.pack_time
        )
    }
}

impl AddAssign<&SinkStats> for SinkStats {
    fn add_assign(&mut self, other: &SinkStats) {
        self.extents += other.extents;
        self.compress_none += other.compress_none;
        self.compress_lz4 += other.compress_lz4;
        self.compress_zlib += other.compress_zlib;
        self.compress_zstd += other.compress_zstd;
        self.unpacked_size += other.unpacked_size;
        self.unpacked_fixed += other.unpacked_fixed;
        self.unpacked_variable += other.unpacked_variable;
        self.unpacked_variable_raw += other.unpacked_variable_raw;
        self.packed_size += other.packed_size;
        self.nrecords += other.nrecords;
        self.pack_time += other.pack_time;
        self.peak_bytes_in_progress = self.peak_bytes_in_progress.max(other.peak_bytes_in_progress);
    }
}

/// Peaks are not differences and are left alone.
impl SubAssign<&SinkStats> for SinkStats {
    fn sub_assign(&mut self, other: &SinkStats) {
        self.extents -= other.extents;
        self.compress_none -= other.compress_none;
        self.compress_lz4 -= other.compress_lz4;
        self.compress_zlib -= other.compress_zlib;
        self.compress_zstd -= other.compress_zstd;
        self.unpacked_size -= other.unpacked_size;
        self.unpacked_fixed -= other.unpacked_fixed;
        self.unpacked_variable -= other.unpacked_variable;
        self.unpacked_variable_raw -= other.unpacked_variable_raw;
        self.packed_size -= other.packed_size;
        self.nrecords -= other.nrecords;
        self.pack_time = self.pack_time.saturating_sub(other.pack_time);
    }
}

/// Stats handle shared between a producer and a sink. It has its own lock,
/// always taken after the pipeline lock.
#[derive(Debug, Clone, Default)]
pub struct SharedStats(Arc<Mutex<SinkStats>>);

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SinkStats {
        self.0.lock().clone()
    }

    pub(crate) fn record_frame(&self, frame: &EncodedFrame) {
        self.0.lock().record_frame(frame);
    }

    pub fn same_handle(&self, other: &SharedStats) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of clones alive, including pending sink work items.
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// Where the prefetch pipeline's threads had to wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitStats {
    /// Extents handed to the consumer.
    pub nextents: u64,

    /// Consumer waited for the head to finish decoding.
    pub consumer: u64,

    /// Reader waited because the compressed budget was full.
    pub reader_full: u64,

    /// Decoder found no compressed frame to claim.
    pub unpack_no_upstream: u64,

    /// Decoder had work but the unpacked budget was full.
    pub unpack_downstream_full: u64,

    /// Compressed bytes read from files.
    pub compressed_bytes: u64,

    /// Bytes of decoded extents.
    pub unpacked_bytes: u64,

    /// Most compressed bytes read but not yet claimed by a decoder.
    pub peak_compressed_bytes: u64,

    /// Most decoded bytes not yet handed to the consumer.
    pub peak_unpacked_bytes: u64,
}

impl WaitStats {
    pub fn summary(&self) -> String {
        format!(
            "Extents: {}, Read: {} bytes, Decoded: {} bytes, \
             Waits consumer/reader/no-upstream/downstream-full: {}/{}/{}/{}",
            self.nextents,
            self.compressed_bytes,
            self.unpacked_bytes,
            self.consumer,
            self.reader_full,
            self.unpack_no_upstream,
            self.unpack_downstream_full
        )
    }
}
