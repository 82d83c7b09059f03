//! Frame codec: one extent packed into a self-contained byte run.
//!
//! Layout, every word in the stream's byte order:
//!
//! ```text
//! 0   compressed fixed size      4   compressed variable size
//! 8   record count               12  variable size (uncompressed)
//! 16  frame checksum             20  data checksum
//! 24  fixed mode | variable mode | type name length | 0
//! 28  type name, fixed section, variable section (each padded to 4)
//! ```
//!
//! The frame checksum covers the whole frame with its own word zeroed. The
//! data checksum covers the uncompressed sections as stored. The leading
//! four zero bytes of the variable area are implied, not stored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crc32fast::Hasher;

use crate::core::compression::{compress_best, decompress, Compression, CompressionModes};
use crate::core::config::{ByteOrder, ReadChecks};
use crate::core::extent::{slot_at, variable_roundup, Extent, VARIABLE_HEADER};
use crate::core::schema::{ExtentType, PackOp};
use crate::core::{Error, Result};

pub const FRAME_PREFIX_SIZE: usize = 28;
pub const MAX_PACKED_SIZE: usize = 512 * 1024 * 1024;
pub const TAIL_MARKER: u32 = 0xFFFF_FFFF;

pub const COMPRESSED_FIXED_OFFSET: usize = 0;
pub const COMPRESSED_VARIABLE_OFFSET: usize = 4;
pub const NRECORDS_OFFSET: usize = 8;
pub const VARIABLE_SIZE_OFFSET: usize = 12;
pub const FRAME_CHECKSUM_OFFSET: usize = 16;
pub const DATA_CHECKSUM_OFFSET: usize = 20;
pub const FIXED_MODE_OFFSET: usize = 24;
pub const VARIABLE_MODE_OFFSET: usize = 25;
pub const TYPE_NAME_LEN_OFFSET: usize = 26;

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub modes: CompressionModes,
    pub level: i32,
    pub byte_order: ByteOrder,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            modes: CompressionModes::ALL,
            level: 9,
            byte_order: ByteOrder::native(),
        }
    }
}

/// An encoded extent plus what the encoder learned about it.
#[derive(Debug)]
pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    pub checksum: u32,
    pub nrecords: usize,
    pub fixed_mode: Compression,
    pub variable_mode: Compression,
    pub unpacked_fixed: usize,
    /// Packed variable area, duplicates and dead slots removed.
    pub unpacked_variable: usize,
    /// Variable area as held by the extent.
    pub unpacked_variable_raw: usize,
    pub pack_time: Duration,
}

/// Decoded fixed-size frame prefix plus the type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub compressed_fixed: usize,
    pub compressed_variable: usize,
    pub nrecords: usize,
    pub variable_size: usize,
    pub frame_checksum: u32,
    pub data_checksum: u32,
    pub fixed_mode: Compression,
    pub variable_mode: Compression,
    pub type_name: String,
}

/// What a 28-byte prefix announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePrefix {
    Frame { len: usize },
    Tail,
}

fn read_size(order: ByteOrder, buf: &[u8], offset: usize, what: &str) -> Result<usize> {
    let value = order.get_u32(buf, offset) as i32;
    if value < 0 {
        return Err(Error::format(format!("negative {what} {value}")));
    }
    Ok(value as usize)
}

/// Total frame length from its first [`FRAME_PREFIX_SIZE`] bytes.
pub fn parse_prefix(prefix: &[u8], order: ByteOrder) -> Result<FramePrefix> {
    if prefix.len() < FRAME_PREFIX_SIZE {
        return Err(Error::format(format!("truncated frame prefix of {} bytes", prefix.len())));
    }
    if order.get_u32(prefix, COMPRESSED_FIXED_OFFSET) == TAIL_MARKER {
        return Ok(FramePrefix::Tail);
    }
    let fixed = read_size(order, prefix, COMPRESSED_FIXED_OFFSET, "fixed size")?;
    let variable = read_size(order, prefix, COMPRESSED_VARIABLE_OFFSET, "variable size")?;
    let name_len = prefix[TYPE_NAME_LEN_OFFSET] as usize;
    if name_len == 0 {
        return Err(Error::format("frame has an empty type name"));
    }
    let len = FRAME_PREFIX_SIZE + pad4(name_len) + pad4(fixed) + pad4(variable);
    if len > MAX_PACKED_SIZE {
        return Err(Error::format(format!(
            "frame of {len} bytes exceeds the {MAX_PACKED_SIZE} limit"
        )));
    }
    Ok(FramePrefix::Frame { len })
}

impl FrameHeader {
    pub fn parse(frame: &[u8], order: ByteOrder) -> Result<Self> {
        let len = match parse_prefix(frame, order)? {
            FramePrefix::Frame { len } => len,
            FramePrefix::Tail => return Err(Error::format("expected a frame, found the tail")),
        };
        if frame.len() != len {
            return Err(Error::format(format!(
                "frame is {} bytes, header declares {len}",
                frame.len()
            )));
        }
        let name_len = frame[TYPE_NAME_LEN_OFFSET] as usize;
        let name = &frame[FRAME_PREFIX_SIZE..FRAME_PREFIX_SIZE + name_len];
        let type_name = std::str::from_utf8(name)
            .map_err(|_| Error::format("type name is not utf-8"))?
            .to_string();
        let variable_size = read_size(order, frame, VARIABLE_SIZE_OFFSET, "variable size")?;
        if variable_size < VARIABLE_HEADER {
            return Err(Error::format(format!("variable size {variable_size} below minimum")));
        }
        Ok(Self {
            compressed_fixed: read_size(order, frame, COMPRESSED_FIXED_OFFSET, "fixed size")?,
            compressed_variable: read_size(
                order,
                frame,
                COMPRESSED_VARIABLE_OFFSET,
                "variable size",
            )?,
            nrecords: read_size(order, frame, NRECORDS_OFFSET, "record count")?,
            variable_size,
            frame_checksum: order.get_u32(frame, FRAME_CHECKSUM_OFFSET),
            data_checksum: order.get_u32(frame, DATA_CHECKSUM_OFFSET),
            fixed_mode: Compression::from_id(frame[FIXED_MODE_OFFSET])?,
            variable_mode: Compression::from_id(frame[VARIABLE_MODE_OFFSET])?,
            type_name,
        })
    }

    /// Bytes the decoded extent will hold.
    pub fn unpacked_size(&self, record_size: usize) -> usize {
        self.nrecords.saturating_mul(record_size).saturating_add(self.variable_size)
    }

    fn fixed_start(&self) -> usize {
        FRAME_PREFIX_SIZE + pad4(self.type_name.len())
    }

    fn variable_start(&self) -> usize {
        self.fixed_start() + pad4(self.compressed_fixed)
    }
}

/// Read just the type name of a frame.
pub fn frame_type_name(frame: &[u8]) -> Result<&str> {
    if frame.len() < FRAME_PREFIX_SIZE {
        return Err(Error::format("truncated frame prefix"));
    }
    let name_len = frame[TYPE_NAME_LEN_OFFSET] as usize;
    let name = frame
        .get(FRAME_PREFIX_SIZE..FRAME_PREFIX_SIZE + name_len)
        .ok_or_else(|| Error::format("truncated type name"))?;
    std::str::from_utf8(name).map_err(|_| Error::format("type name is not utf-8"))
}

fn frame_checksum(frame: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&frame[..FRAME_CHECKSUM_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&frame[FRAME_CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

fn data_checksum(fixed: &[u8], variable: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(fixed);
    hasher.update(variable);
    hasher.finalize()
}

pub fn encode(extent: &Extent, options: &EncodeOptions) -> Result<EncodedFrame> {
    let start = Instant::now();
    let schema = extent.schema();
    let type_name = schema.name().as_bytes();
    if type_name.is_empty() || type_name.len() > 255 {
        return Err(Error::format(format!("type name '{}' cannot be framed", schema.name())));
    }

    let (mut fixed, mut variable) = pack_variable(extent)?;
    apply_pack_ops(&mut fixed, schema.record_size(), schema.pack_ops(), true);
    if !options.byte_order.is_native() {
        flip_fixed(&mut fixed, schema);
        flip_slot_lengths(&mut variable, ByteOrder::native())?;
    }
    let data_sum = data_checksum(&fixed, &variable);

    let fixed_packed = compress_best(&fixed, options.modes, options.level)?;
    let variable_packed =
        compress_best(&variable[VARIABLE_HEADER..], options.modes, options.level)?;

    let len = FRAME_PREFIX_SIZE
        + pad4(type_name.len())
        + pad4(fixed_packed.data.len())
        + pad4(variable_packed.data.len());
    if len > MAX_PACKED_SIZE {
        return Err(Error::format(format!(
            "extent packs to {len} bytes, over the {MAX_PACKED_SIZE} limit"
        )));
    }
    let record_count = extent.n_records();
    if record_count > i32::MAX as usize || variable.len() > i32::MAX as usize {
        return Err(Error::format("extent too large to frame"));
    }

    let order = options.byte_order;
    let mut bytes = vec![0u8; len];
    order.put_u32(&mut bytes, COMPRESSED_FIXED_OFFSET, fixed_packed.data.len() as u32);
    order.put_u32(&mut bytes, COMPRESSED_VARIABLE_OFFSET, variable_packed.data.len() as u32);
    order.put_u32(&mut bytes, NRECORDS_OFFSET, record_count as u32);
    order.put_u32(&mut bytes, VARIABLE_SIZE_OFFSET, variable.len() as u32);
    order.put_u32(&mut bytes, DATA_CHECKSUM_OFFSET, data_sum);
    bytes[FIXED_MODE_OFFSET] = fixed_packed.mode.id();
    bytes[VARIABLE_MODE_OFFSET] = variable_packed.mode.id();
    bytes[TYPE_NAME_LEN_OFFSET] = type_name.len() as u8;

    let mut pos = FRAME_PREFIX_SIZE;
    bytes[pos..pos + type_name.len()].copy_from_slice(type_name);
    pos += pad4(type_name.len());
    bytes[pos..pos + fixed_packed.data.len()].copy_from_slice(&fixed_packed.data);
    pos += pad4(fixed_packed.data.len());
    bytes[pos..pos + variable_packed.data.len()].copy_from_slice(&variable_packed.data);

    let checksum = frame_checksum(&bytes);
    order.put_u32(&mut bytes, FRAME_CHECKSUM_OFFSET, checksum);

    Ok(EncodedFrame {
        bytes,
        checksum,
        nrecords: record_count,
        fixed_mode: fixed_packed.mode,
        variable_mode: variable_packed.mode,
        unpacked_fixed: fixed.len(),
        unpacked_variable: variable.len(),
        unpacked_variable_raw: extent.variable_data().len(),
        pack_time: start.elapsed(),
    })
}

pub fn decode(
    frame: &[u8],
    schema: &Arc<ExtentType>,
    order: ByteOrder,
    checks: &ReadChecks,
) -> Result<Extent> {
    let header = FrameHeader::parse(frame, order)?;
    if header.type_name != schema.name() {
        return Err(Error::type_mismatch(format!(
            "frame holds '{}', expected '{}'",
            header.type_name,
            schema.name()
        )));
    }
    if checks.pre_uncompress && frame_checksum(frame) != header.frame_checksum {
        return Err(Error::Checksum("frame checksum"));
    }

    let fixed_len = header
        .nrecords
        .checked_mul(schema.record_size())
        .filter(|len| *len <= i32::MAX as usize)
        .ok_or_else(|| Error::format(format!("record count {} too large", header.nrecords)))?;
    let fixed_start = header.fixed_start();
    let variable_start = header.variable_start();
    let mut fixed = decompress(
        header.fixed_mode,
        &frame[fixed_start..fixed_start + header.compressed_fixed],
        fixed_len,
    )?;
    let variable_body = decompress(
        header.variable_mode,
        &frame[variable_start..variable_start + header.compressed_variable],
        header.variable_size - VARIABLE_HEADER,
    )?;
    let mut variable = Vec::with_capacity(header.variable_size);
    variable.extend_from_slice(&[0u8; VARIABLE_HEADER]);
    variable.extend_from_slice(&variable_body);

    if checks.post_uncompress && data_checksum(&fixed, &variable) != header.data_checksum {
        return Err(Error::Checksum("data checksum"));
    }
    if !order.is_native() {
        flip_fixed(&mut fixed, schema);
        flip_slot_lengths(&mut variable, order)?;
    }
    apply_pack_ops(&mut fixed, schema.record_size(), schema.pack_ops(), false);

    let extent = Extent::from_parts(Arc::clone(schema), fixed, variable)?;
    if checks.variable_slots {
        extent.selfcheck()?;
    }
    Ok(extent)
}

/// Copy the fixed area and rebuild the variable area from the live
/// references, sharing storage between equal values of unique fields.
fn pack_variable(extent: &Extent) -> Result<(Vec<u8>, Vec<u8>)> {
    let schema = extent.schema();
    let record_size = schema.record_size();
    let mut fixed = extent.fixed_data().to_vec();
    let mut variable = vec![0u8; VARIABLE_HEADER];
    let mut shared: HashMap<&[u8], u32> = HashMap::new();

    for row in 0..extent.n_records() {
        for (field_offset, unique) in schema.variable_fields() {
            let pos = row * record_size + field_offset;
            let old = read_u32_ne(&fixed, pos) as usize;
            if old == 0 {
                continue;
            }
            let value = slot_at(extent.variable_data(), old)?;
            if value.is_empty() {
                write_u32_ne(&mut fixed, pos, 0);
                continue;
            }
            let new = match shared.get(value) {
                Some(&offset) if unique => offset,
                _ => {
                    let offset = variable.len() as u32;
                    variable.extend_from_slice(&(value.len() as u32).to_ne_bytes());
                    variable.extend_from_slice(value);
                    variable.resize(offset as usize + 4 + variable_roundup(value.len()), 0);
                    if unique {
                        shared.insert(value, offset);
                    }
                    offset
                }
            };
            write_u32_ne(&mut fixed, pos, new);
        }
    }
    Ok((fixed, variable))
}

fn flip_fixed(fixed: &mut [u8], schema: &ExtentType) {
    let record_size = schema.record_size();
    for record in fixed.chunks_exact_mut(record_size) {
        for &offset in schema.flip4_offsets() {
            record[offset..offset + 4].reverse();
        }
        for &offset in schema.flip8_offsets() {
            record[offset..offset + 8].reverse();
        }
    }
}

/// Reverse every slot length word; `from` is the order the lengths are in.
fn flip_slot_lengths(variable: &mut [u8], from: ByteOrder) -> Result<()> {
    let mut pos = VARIABLE_HEADER;
    while pos < variable.len() {
        if pos + 4 > variable.len() {
            return Err(Error::format(format!("truncated variable slot at {pos}")));
        }
        let len = from.get_u32(variable, pos) as i32;
        if len < 0 {
            return Err(Error::format(format!("negative variable length at {pos}")));
        }
        variable[pos..pos + 4].reverse();
        let next = pos + 4 + variable_roundup(len as usize);
        if next > variable.len() {
            return Err(Error::format(format!("variable slot at {pos} overruns the area")));
        }
        pos = next;
    }
    Ok(())
}

fn read_u32_ne(buf: &[u8], pos: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_ne_bytes(bytes)
}

fn write_u32_ne(buf: &mut [u8], pos: usize, value: u32) {
    buf[pos..pos + 4].copy_from_slice(&value.to_ne_bytes());
}

fn read_i32(buf: &[u8], pos: usize) -> i32 {
    read_u32_ne(buf, pos) as i32
}

fn write_i32(buf: &mut [u8], pos: usize, value: i32) {
    buf[pos..pos + 4].copy_from_slice(&value.to_ne_bytes());
}

fn read_i64(buf: &[u8], pos: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[pos..pos + 8]);
    i64::from_ne_bytes(bytes)
}

fn write_i64(buf: &mut [u8], pos: usize, value: i64) {
    buf[pos..pos + 8].copy_from_slice(&value.to_ne_bytes());
}

/// Run the column transforms forward (encode) or backward (decode).
fn apply_pack_ops(fixed: &mut [u8], record_size: usize, ops: &[PackOp], encode: bool) {
    let nrecords = fixed.len() / record_size;
    let mut run = |op: &PackOp| match *op {
        PackOp::DeltaFieldI32 { offset, base } => {
            for row in 0..nrecords {
                let at = row * record_size;
                let base_value = read_i32(fixed, at + base);
                let value = read_i32(fixed, at + offset);
                let out = if encode {
                    value.wrapping_sub(base_value)
                } else {
                    value.wrapping_add(base_value)
                };
                write_i32(fixed, at + offset, out);
            }
        }
        PackOp::DeltaFieldI64 { offset, base } => {
            for row in 0..nrecords {
                let at = row * record_size;
                let base_value = read_i64(fixed, at + base);
                let value = read_i64(fixed, at + offset);
                let out = if encode {
                    value.wrapping_sub(base_value)
                } else {
                    value.wrapping_add(base_value)
                };
                write_i64(fixed, at + offset, out);
            }
        }
        PackOp::DeltaPrevI32 { offset } => {
            let mut prev = 0i32;
            for row in 0..nrecords {
                let at = row * record_size + offset;
                let stored = read_i32(fixed, at);
                if encode {
                    write_i32(fixed, at, stored.wrapping_sub(prev));
                    prev = stored;
                } else {
                    prev = stored.wrapping_add(prev);
                    write_i32(fixed, at, prev);
                }
            }
        }
        PackOp::DeltaPrevI64 { offset } => {
            let mut prev = 0i64;
            for row in 0..nrecords {
                let at = row * record_size + offset;
                let stored = read_i64(fixed, at);
                if encode {
                    write_i64(fixed, at, stored.wrapping_sub(prev));
                    prev = stored;
                } else {
                    prev = stored.wrapping_add(prev);
                    write_i64(fixed, at, prev);
                }
            }
        }
        PackOp::DeltaPrevScaledF64 { offset, scale } => {
            let mut prev = 0i64;
            for row in 0..nrecords {
                let at = row * record_size + offset;
                if encode {
                    let value = f64::from_bits(read_i64(fixed, at) as u64);
                    let steps = (value / scale).round() as i64;
                    write_i64(fixed, at, steps.wrapping_sub(prev));
                    prev = steps;
                } else {
                    prev = read_i64(fixed, at).wrapping_add(prev);
                    write_i64(fixed, at, (prev as f64 * scale).to_bits() as i64);
                }
            }
        }
        PackOp::Scale { offset, scale } => {
            if !encode {
                return;
            }
            for row in 0..nrecords {
                let at = row * record_size + offset;
                let value = f64::from_bits(read_i64(fixed, at) as u64);
                let scaled = (value / scale).round() * scale;
                write_i64(fixed, at, scaled.to_bits() as i64);
            }
        }
    };
    if encode {
        ops.iter().for_each(&mut run);
    } else {
        ops.iter().rev().for_each(&mut run);
    }
}
