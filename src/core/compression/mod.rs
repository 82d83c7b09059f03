//! Per-section compression for extent frames.
//!
//! Each section of a frame is compressed independently. Every enabled
//! algorithm is tried and the smallest output wins; a section is stored raw
//! unless some algorithm makes it strictly smaller.
//!
//! ```rust,ignore
//! use extentstore::core::compression::{compress_best, CompressionModes};
//!
//! let packed = compress_best(&bytes, CompressionModes::ALL, 9)?;
//! let restored = decompress(packed.mode, &packed.data, bytes.len())?;
//! ```

use std::borrow::Cow;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Algorithm tag stored in the frame header for each section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Zlib,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn id(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zlib => 2,
            Compression::Lz4 => 6,
            Compression::Zstd => 8,
        }
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Compression::None),
            2 => Ok(Compression::Zlib),
            6 => Ok(Compression::Lz4),
            8 => Ok(Compression::Zstd),
            other => Err(Error::format(format!("unknown compression mode {other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zlib => "zlib",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

/// Set of algorithms the encoder may choose from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressionModes(u32);

impl CompressionModes {
    pub const NONE: CompressionModes = CompressionModes(0);
    pub const ZLIB: CompressionModes = CompressionModes(1 << 0);
    pub const LZ4: CompressionModes = CompressionModes(1 << 1);
    pub const ZSTD: CompressionModes = CompressionModes(1 << 2);
    pub const ALL: CompressionModes = CompressionModes(0b111);

    const TRY_ORDER: [Compression; 3] = [Compression::Lz4, Compression::Zstd, Compression::Zlib];

    pub fn contains(self, mode: Compression) -> bool {
        match mode {
            Compression::None => true,
            Compression::Zlib => self.0 & Self::ZLIB.0 != 0,
            Compression::Lz4 => self.0 & Self::LZ4.0 != 0,
            Compression::Zstd => self.0 & Self::ZSTD.0 != 0,
        }
    }

    pub fn union(self, other: CompressionModes) -> CompressionModes {
        CompressionModes(self.0 | other.0)
    }

    pub fn enabled(self) -> impl Iterator<Item = Compression> {
        Self::TRY_ORDER.into_iter().filter(move |mode| self.contains(*mode))
    }
}

impl Default for CompressionModes {
    fn default() -> Self {
        Self::ALL
    }
}

impl From<Compression> for CompressionModes {
    fn from(mode: Compression) -> Self {
        match mode {
            Compression::None => Self::NONE,
            Compression::Zlib => Self::ZLIB,
            Compression::Lz4 => Self::LZ4,
            Compression::Zstd => Self::ZSTD,
        }
    }
}

/// Output of [`compress_best`]. Raw sections borrow the input.
#[derive(Debug)]
pub struct Packed<'a> {
    pub mode: Compression,
    pub data: Cow<'a, [u8]>,
}

pub fn compress_with(mode: Compression, input: &[u8], level: i32) -> Result<Vec<u8>> {
    match mode {
        Compression::None => Ok(input.to_vec()),
        Compression::Zlib => {
            let level = flate2::Compression::new(level.clamp(1, 9) as u32);
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(input.len() / 2), level);
            encoder.write_all(input)?;
            Ok(encoder.finish()?)
        }
        Compression::Lz4 => Ok(lz4_flex::block::compress(input)),
        Compression::Zstd => Ok(zstd::bulk::compress(input, level.clamp(1, 22))?),
    }
}

/// Try every enabled algorithm and keep the smallest strictly-shrinking output.
pub fn compress_best(input: &[u8], modes: CompressionModes, level: i32) -> Result<Packed<'_>> {
    let mut best: Option<(Compression, Vec<u8>)> = None;
    for mode in modes.enabled() {
        let candidate = compress_with(mode, input, level)?;
        let best_len = best.as_ref().map(|(_, data)| data.len()).unwrap_or(input.len());
        if candidate.len() < best_len {
            best = Some((mode, candidate));
        }
    }
    Ok(match best {
        Some((mode, data)) => Packed {
            mode,
            data: Cow::Owned(data),
        },
        None => Packed {
            mode: Compression::None,
            data: Cow::Borrowed(input),
        },
    })
}

/// Decompress a section and require exactly `expected_len` output bytes.
pub fn decompress(mode: Compression, input: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let out = match mode {
        Compression::None => input.to_vec(),
        Compression::Zlib => {
            let mut out = Vec::with_capacity(expected_len);
            ZlibDecoder::new(input)
                .take(expected_len as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|err| Error::format(format!("zlib section: {err}")))?;
            out
        }
        Compression::Lz4 => lz4_flex::block::decompress(input, expected_len)
            .map_err(|err| Error::format(format!("lz4 section: {err}")))?,
        Compression::Zstd => zstd::bulk::decompress(input, expected_len)
            .map_err(|err| Error::format(format!("zstd section: {err}")))?,
    };
    if out.len() != expected_len {
        return Err(Error::format(format!(
            "{} section decompressed to {} bytes, expected {}",
            mode.name(),
            out.len(),
            expected_len
        )));
    }
    Ok(out)
}
