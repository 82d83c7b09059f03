//! Reading one extent file.
//!
//! Opening validates the header, loads the type definitions, checks the tail
//! and loads the index, so a damaged file fails here rather than midway
//! through a scan.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::config::{ByteOrder, ReadChecks};
use crate::core::extent::Extent;
use crate::core::frame::{
    decode, frame_type_name, parse_prefix, FrameHeader, FramePrefix, FRAME_PREFIX_SIZE,
};
use crate::core::header::{chain_checksum, FileHeader, Tail, HEADER_SIZE, TAIL_SIZE};
use crate::core::schema::{ExtentType, ExtentTypeLibrary, TYPE_DEFINITION_NAME};
use crate::core::{Error, Result};

/// Anything extents can be read from, in order.
pub trait ExtentSource {
    /// Next extent, or `None` at the end.
    fn get_extent(&mut self) -> Result<Option<Extent>>;

    fn get_shared_extent(&mut self) -> Result<Option<Arc<Extent>>> {
        Ok(self.get_extent()?.map(Arc::new))
    }
}

/// One entry of a file's index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub type_name: String,
}

pub struct ExtentFileSource {
    path: PathBuf,
    /// Seek and read happen under one lock.
    file: Mutex<File>,
    file_size: u64,
    byte_order: ByteOrder,
    checks: ReadChecks,
    library: ExtentTypeLibrary,
    first_data_offset: u64,
    tail: Tail,
    index: Vec<IndexEntry>,
    cursor: usize,
}

impl ExtentFileSource {
    pub fn open(path: impl AsRef<Path>, checks: ReadChecks) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < (HEADER_SIZE + TAIL_SIZE) as u64 {
            return Err(Error::format(format!(
                "{} is {file_size} bytes, too small for an extent file",
                path.display()
            )));
        }

        let file = Mutex::new(file);
        let mut header = [0u8; HEADER_SIZE];
        read_exact_at(&file, 0, &mut header)?;
        let byte_order = FileHeader::from_bytes(&header)?;

        let mut tail = [0u8; TAIL_SIZE];
        let tail_offset = file_size - TAIL_SIZE as u64;
        read_exact_at(&file, tail_offset, &mut tail)?;
        let tail = Tail::from_bytes(&tail, byte_order, tail_offset)?;

        let mut source = Self {
            path,
            file,
            file_size,
            byte_order,
            checks,
            library: ExtentTypeLibrary::new(),
            first_data_offset: HEADER_SIZE as u64,
            tail,
            index: Vec::new(),
            cursor: 0,
        };
        source.load_types()?;
        source.load_index()?;
        log::debug!(
            "opened {} ({:?}, {} types, {} extents)",
            source.path.display(),
            source.byte_order,
            source.library.len(),
            source.index.len()
        );
        Ok(source)
    }

    fn load_types(&mut self) -> Result<()> {
        let offset = HEADER_SIZE as u64;
        let frame = self.read_frame(offset)?;
        if frame_type_name(&frame)? != TYPE_DEFINITION_NAME {
            return Err(Error::format(format!(
                "first extent of {} is not the type definition",
                self.path.display()
            )));
        }
        let def = ExtentType::type_definition();
        let types = decode(&frame, &def, self.byte_order, &self.checks)?;
        let description = def.field("description")?;
        for row in 0..types.n_records() {
            let text = std::str::from_utf8(types.get_bytes(row, description)?)
                .map_err(|_| Error::format("type description is not utf-8"))?;
            self.library.register_type(text)?;
        }
        self.first_data_offset = offset + frame.len() as u64;
        Ok(())
    }

    fn load_index(&mut self) -> Result<()> {
        let frame = self.read_frame(self.tail.index_offset)?;
        if frame.len() != self.tail.index_packed_size as usize {
            return Err(Error::format(format!(
                "index frame is {} bytes, tail says {}",
                frame.len(),
                self.tail.index_packed_size
            )));
        }
        let index_type = ExtentType::index_type();
        let index = decode(&frame, &index_type, self.byte_order, &self.checks)?;
        let offset = index_type.field("offset")?;
        let extent_type = index_type.field("extent_type")?;
        let mut entries = Vec::with_capacity(index.n_records());
        for row in 0..index.n_records() {
            let at = index.get_i64(row, offset);
            if at < self.first_data_offset as i64 || at as u64 >= self.tail.index_offset {
                return Err(Error::format(format!(
                    "index entry {row} points outside the data area"
                )));
            }
            let type_name = std::str::from_utf8(index.get_bytes(row, extent_type)?)
                .map_err(|_| Error::format("index type name is not utf-8"))?;
            entries.push(IndexEntry {
                offset: at as u64,
                type_name: type_name.to_string(),
            });
        }
        self.index = entries;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn read_checks(&self) -> &ReadChecks {
        &self.checks
    }

    pub fn library(&self) -> &ExtentTypeLibrary {
        &self.library
    }

    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    pub fn tail(&self) -> &Tail {
        &self.tail
    }

    /// Read the raw frame starting at `offset`.
    pub fn read_frame(&self, offset: u64) -> Result<Vec<u8>> {
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        read_exact_at(&self.file, offset, &mut prefix)?;
        let len = match parse_prefix(&prefix, self.byte_order)? {
            FramePrefix::Frame { len } => len,
            FramePrefix::Tail => {
                return Err(Error::format(format!("found the tail at {offset}, expected a frame")));
            }
        };
        if offset + len as u64 > self.file_size {
            return Err(Error::format(format!("frame at {offset} runs past the end of the file")));
        }
        let mut frame = vec![0u8; len];
        frame[..FRAME_PREFIX_SIZE].copy_from_slice(&prefix);
        let body = offset + FRAME_PREFIX_SIZE as u64;
        read_exact_at(&self.file, body, &mut frame[FRAME_PREFIX_SIZE..])?;
        Ok(frame)
    }

    /// Schema for a raw frame, resolved through this file's library.
    pub fn frame_schema(&self, frame: &[u8]) -> Result<Arc<ExtentType>> {
        self.library.require_type(frame_type_name(frame)?)
    }

    pub fn decode_frame(&self, frame: &[u8]) -> Result<Extent> {
        let schema = self.frame_schema(frame)?;
        decode(frame, &schema, self.byte_order, &self.checks)
    }

    pub fn read_extent(&self, offset: u64) -> Result<Extent> {
        let frame = self.read_frame(offset)?;
        self.decode_frame(&frame)
    }

    /// Walk every data frame and compare the chained checksum with the tail.
    pub fn verify_chained_checksum(&self) -> Result<()> {
        let mut offset = self.first_data_offset;
        let mut chained = 0u32;
        while offset < self.tail.index_offset {
            let frame = self.read_frame(offset)?;
            let header = FrameHeader::parse(&frame, self.byte_order)?;
            chained = chain_checksum(chained, header.frame_checksum);
            offset += frame.len() as u64;
        }
        if offset != self.tail.index_offset {
            return Err(Error::format("data frames overrun the index"));
        }
        if chained != self.tail.chained_checksum {
            return Err(Error::Checksum("chained file checksum"));
        }
        Ok(())
    }

    /// Restart [`ExtentSource::get_extent`] from the first index entry.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}

impl ExtentSource for ExtentFileSource {
    fn get_extent(&mut self) -> Result<Option<Extent>> {
        let Some(entry) = self.index.get(self.cursor) else {
            return Ok(None);
        };
        match self.read_extent(entry.offset) {
            Ok(extent) => {
                self.cursor += 1;
                Ok(Some(extent))
            }
            Err(err) => {
                // Stop at the first damaged extent until rewound.
                self.cursor = self.index.len();
                Err(err)
            }
        }
    }
}

/// `read_exact` at an absolute offset; a short file is a format error.
fn read_exact_at(file: &Mutex<File>, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut file = file.lock();
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => Error::format(format!(
            "truncated read of {} bytes at {offset}",
            buf.len()
        )),
        _ => Error::Io(err),
    })
}
