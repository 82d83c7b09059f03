use crc32fast::Hasher;

use crate::core::config::ByteOrder;
use crate::core::{Error, Result};

pub const HEADER_SIZE: usize = 40;
pub const TAIL_SIZE: usize = 28;
pub const MAGIC: &[u8; 4] = b"DSv1";

pub const MAGIC_OFFSET: usize = 0;
pub const INT32_SENTINEL_OFFSET: usize = 4;
pub const INT64_SENTINEL_OFFSET: usize = 8;
pub const PI_OFFSET: usize = 16;
pub const INFINITY_OFFSET: usize = 24;
pub const NAN_OFFSET: usize = 32;

pub const INT32_SENTINEL: u32 = 0x1234_5678;
pub const INT64_SENTINEL: u64 = 0x1234_5678_9ABC_DEF0;

pub const TAIL_PACKED_SIZE_OFFSET: usize = 4;
pub const TAIL_NOT_PACKED_SIZE_OFFSET: usize = 8;
pub const TAIL_CHAINED_CHECKSUM_OFFSET: usize = 12;
pub const TAIL_INDEX_OFFSET_OFFSET: usize = 16;
pub const TAIL_CHECKSUM_OFFSET: usize = 24;

/// The 40-byte file header. Its sentinels reveal the writer's byte order
/// and check that floats are IEEE-754 compatible.
pub struct FileHeader;

impl FileHeader {
    pub fn to_bytes(order: ByteOrder) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(MAGIC);
        order.put_u32(&mut buf, INT32_SENTINEL_OFFSET, INT32_SENTINEL);
        order.put_u64(&mut buf, INT64_SENTINEL_OFFSET, INT64_SENTINEL);
        order.put_u64(&mut buf, PI_OFFSET, std::f64::consts::PI.to_bits());
        order.put_u64(&mut buf, INFINITY_OFFSET, f64::INFINITY.to_bits());
        order.put_u64(&mut buf, NAN_OFFSET, f64::NAN.to_bits());
        buf
    }

    /// Validate a header and return the byte order of the rest of the file.
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<ByteOrder> {
        if &bytes[MAGIC_OFFSET..MAGIC_OFFSET + 4] != MAGIC {
            return Err(Error::format("bad magic, not an extent file"));
        }
        let order = if ByteOrder::Little.get_u32(bytes, INT32_SENTINEL_OFFSET) == INT32_SENTINEL {
            ByteOrder::Little
        } else if ByteOrder::Big.get_u32(bytes, INT32_SENTINEL_OFFSET) == INT32_SENTINEL {
            ByteOrder::Big
        } else {
            return Err(Error::format("unrecognised int32 sentinel"));
        };
        if order.get_u64(bytes, INT64_SENTINEL_OFFSET) != INT64_SENTINEL {
            return Err(Error::format("int64 sentinel does not match the int32 byte order"));
        }
        let pi = f64::from_bits(order.get_u64(bytes, PI_OFFSET));
        if (pi - std::f64::consts::PI).abs() >= 1e-18 {
            return Err(Error::format("pi sentinel mismatch"));
        }
        let inf = f64::from_bits(order.get_u64(bytes, INFINITY_OFFSET));
        if !(inf.is_infinite() && inf > 0.0) {
            return Err(Error::format("infinity sentinel mismatch"));
        }
        if !f64::from_bits(order.get_u64(bytes, NAN_OFFSET)).is_nan() {
            return Err(Error::format("nan sentinel mismatch"));
        }
        Ok(order)
    }
}

/// Trailing locator of the index extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tail {
    pub index_packed_size: u32,
    pub chained_checksum: u32,
    pub index_offset: u64,
}

impl Tail {
    pub fn to_bytes(&self, order: ByteOrder) -> [u8; TAIL_SIZE] {
        let mut buf = [0u8; TAIL_SIZE];
        buf[0..4].copy_from_slice(&[0xFF; 4]);
        order.put_u32(&mut buf, TAIL_PACKED_SIZE_OFFSET, self.index_packed_size);
        order.put_u32(&mut buf, TAIL_NOT_PACKED_SIZE_OFFSET, !self.index_packed_size);
        order.put_u32(&mut buf, TAIL_CHAINED_CHECKSUM_OFFSET, self.chained_checksum);
        order.put_u64(&mut buf, TAIL_INDEX_OFFSET_OFFSET, self.index_offset);
        let sum = crc32(&buf[..TAIL_CHECKSUM_OFFSET]);
        order.put_u32(&mut buf, TAIL_CHECKSUM_OFFSET, sum);
        buf
    }

    /// Parse a tail read from `tail_offset`, checking everything that can be
    /// checked without the index itself.
    pub fn from_bytes(bytes: &[u8; TAIL_SIZE], order: ByteOrder, tail_offset: u64) -> Result<Self> {
        if bytes[0..4] != [0xFF; 4] {
            return Err(Error::format("missing tail marker"));
        }
        if order.get_u32(bytes, TAIL_CHECKSUM_OFFSET) != crc32(&bytes[..TAIL_CHECKSUM_OFFSET]) {
            return Err(Error::Checksum("tail"));
        }
        let index_packed_size = order.get_u32(bytes, TAIL_PACKED_SIZE_OFFSET);
        if order.get_u32(bytes, TAIL_NOT_PACKED_SIZE_OFFSET) != !index_packed_size {
            return Err(Error::Checksum("tail packed size complement"));
        }
        let tail = Self {
            index_packed_size,
            chained_checksum: order.get_u32(bytes, TAIL_CHAINED_CHECKSUM_OFFSET),
            index_offset: order.get_u64(bytes, TAIL_INDEX_OFFSET_OFFSET),
        };
        if tail_offset.checked_sub(index_packed_size as u64) != Some(tail.index_offset) {
            return Err(Error::format(format!(
                "tail at {tail_offset} does not follow an index of {index_packed_size} bytes at {}",
                tail.index_offset
            )));
        }
        Ok(tail)
    }
}

pub fn crc32(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Fold one frame checksum into the running file checksum.
pub fn chain_checksum(chained: u32, frame_checksum: u32) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&chained.to_le_bytes());
    hasher.update(&frame_checksum.to_le_bytes());
    hasher.finalize()
}
