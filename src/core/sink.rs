//! Compress-and-write pipeline.
//!
//! Producers hand over extents with [`ExtentFileSink::write_extent`]. A pool
//! of compressor threads claims queued extents in any order and encodes them
//! outside the lock; a single writer only ever pops the head of the queue, so
//! frames reach the file in submission order. With zero compressors the
//! calling thread does the encoding and writing itself.
//!
//! File layout: header, type definition frame, data frames, index frame,
//! tail. See [`crate::core::header`] and [`crate::core::frame`].

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::core::config::SinkConfig;
use crate::core::extent::Extent;
use crate::core::frame::{encode, EncodeOptions, EncodedFrame};
use crate::core::header::{chain_checksum, FileHeader, Tail, HEADER_SIZE};
use crate::core::ordered::OrderedQueue;
use crate::core::schema::{ExtentType, ExtentTypeLibrary};
use crate::core::stats::{SharedStats, SinkStats};
use crate::core::{Error, Result};

/// Anything extents can be written to.
pub trait ExtentSink {
    /// Take ownership of an extent and queue it for writing.
    fn write_extent(&self, extent: Extent, stats: Option<&SharedStats>) -> Result<()>;

    /// Cumulative statistics of extents written so far.
    fn stats(&self) -> SinkStats;
}

/// Invoked on the writer just before each data frame is written.
pub type WriteCallback = Box<dyn FnMut(&mut WriteContext<'_>) -> Result<()> + Send>;

/// What a [`WriteCallback`] sees about the frame about to be written.
pub struct WriteContext<'a> {
    offset: u64,
    extent: &'a Extent,
    file: &'a mut FileWriter,
    next_library: &'a mut Option<ExtentTypeLibrary>,
}

impl WriteContext<'_> {
    /// Offset the frame will be written at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn extent(&self) -> &Extent {
        self.extent
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// Finish the current file and continue in `path`, which starts with
    /// `library`. The frame being written lands at the start of the new
    /// file. Queued extents keep flowing; their types must be in `library`.
    pub fn rotate(&mut self, path: impl AsRef<Path>, library: &ExtentTypeLibrary) -> Result<()> {
        let next = FileWriter::create(path.as_ref(), self.file.options, self.file.fsync)?;
        let previous = std::mem::replace(&mut *self.file, next);
        let finished = previous.path.clone();
        previous.finish()?;
        self.file.write_library(library)?;
        self.offset = self.file.offset;
        *self.next_library = Some(library.clone());
        log::info!("rotated {} -> {}", finished.display(), self.file.path.display());
        Ok(())
    }
}

/// One open output file.
struct FileWriter {
    path: PathBuf,
    file: File,
    offset: u64,
    chained_checksum: u32,
    index: Extent,
    declared: HashSet<String>,
    options: EncodeOptions,
    fsync: bool,
}

impl FileWriter {
    fn create(path: &Path, options: EncodeOptions, fsync: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&FileHeader::to_bytes(options.byte_order))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            offset: HEADER_SIZE as u64,
            chained_checksum: 0,
            index: Extent::new(ExtentType::index_type()),
            declared: HashSet::new(),
            options,
            fsync,
        })
    }

    fn write_library(&mut self, library: &ExtentTypeLibrary) -> Result<()> {
        let def = ExtentType::type_definition();
        let description = def.field("description")?;
        let mut types = Extent::new(Arc::clone(&def));
        for ty in library.types().filter(|ty| !ty.is_reserved()) {
            if (ty.major_version() == 0 && ty.minor_version() == 0) || ty.namespace().is_empty() {
                log::warn!("type '{}' is missing either a version or a namespace", ty.name());
            }
            let row = types.append_record();
            types.set_bytes(row, description, ty.description().as_bytes())?;
            self.declared.insert(ty.name().to_string());
        }
        let frame = encode(&types, &self.options)?;
        self.file.write_all(&frame.bytes)?;
        self.offset += frame.bytes.len() as u64;
        Ok(())
    }

    fn write_frame(&mut self, type_name: &str, frame: &EncodedFrame) -> Result<()> {
        if !self.declared.contains(type_name) {
            return Err(Error::type_mismatch(format!(
                "type '{type_name}' is not in the library of {}",
                self.path.display()
            )));
        }
        self.file.write_all(&frame.bytes)?;
        let index_type = Arc::clone(self.index.schema());
        let row = self.index.append_record();
        self.index.set_i64(row, index_type.field("offset")?, self.offset as i64);
        self.index
            .set_bytes(row, index_type.field("extent_type")?, type_name.as_bytes())?;
        self.chained_checksum = chain_checksum(self.chained_checksum, frame.checksum);
        log::debug!(
            "wrote {} frame of {} bytes at {} in {}",
            type_name,
            frame.bytes.len(),
            self.offset,
            self.path.display()
        );
        self.offset += frame.bytes.len() as u64;
        Ok(())
    }

    /// Write the index frame and the tail; returns the final file size.
    fn finish(mut self) -> Result<u64> {
        let index = encode(&self.index, &self.options)?;
        let index_offset = self.offset;
        self.file.write_all(&index.bytes)?;
        self.offset += index.bytes.len() as u64;
        let tail = Tail {
            index_packed_size: index.bytes.len() as u32,
            chained_checksum: self.chained_checksum,
            index_offset,
        };
        let tail = tail.to_bytes(self.options.byte_order);
        self.file.write_all(&tail)?;
        self.offset += tail.len() as u64;
        if self.fsync {
            self.file.sync_all()?;
        }
        log::info!(
            "closed {} with {} extents, {} bytes",
            self.path.display(),
            self.index.n_records(),
            self.offset
        );
        Ok(self.offset)
    }
}

struct WriterSlot {
    file: FileWriter,
    callback: Option<WriteCallback>,
    next_library: Option<ExtentTypeLibrary>,
}

impl WriterSlot {
    fn write(&mut self, extent: &Extent, frame: &EncodedFrame) -> Result<()> {
        if let Some(callback) = self.callback.as_mut() {
            let mut ctx = WriteContext {
                offset: self.file.offset,
                extent,
                file: &mut self.file,
                next_library: &mut self.next_library,
            };
            callback(&mut ctx)?;
        }
        self.file.write_frame(extent.type_name(), frame)
    }
}

struct WorkMeta {
    bytes: usize,
    stats: Option<SharedStats>,
}

type Encoded = Result<(Extent, EncodedFrame)>;

struct SinkState {
    queue: OrderedQueue<WorkMeta, Extent, Encoded>,
    bytes_in_progress: usize,
    keep_going: bool,
    closed: bool,
    /// Taken by whichever thread is currently writing.
    writer: Option<WriterSlot>,
    writing: bool,
    library: Option<ExtentTypeLibrary>,
    stats: SinkStats,
    failure: Option<Error>,
    poisoned: bool,
}

impl SinkState {
    fn can_queue_work(&self, config: &SinkConfig) -> bool {
        self.bytes_in_progress < config.max_bytes_in_progress
            && self.queue.len() < config.max_queue_depth()
    }

    fn fail(&mut self, err: Error) {
        log::warn!("extent sink failed: {err}");
        if !self.poisoned {
            self.failure = Some(err);
            self.poisoned = true;
        }
    }

    fn check_failure(&mut self) -> Result<()> {
        if let Some(err) = self.failure.take() {
            return Err(err);
        }
        if self.poisoned {
            return Err(Error::Worker("extent sink failed earlier".to_string()));
        }
        Ok(())
    }
}

struct SinkInner {
    config: SinkConfig,
    options: EncodeOptions,
    state: Mutex<SinkState>,
    /// Compressors wait here for unclaimed work.
    work_ready: Condvar,
    /// The writer waits here for the head to finish.
    head_ready: Condvar,
    /// Producers and flushers wait here for the queue to drain.
    drained: Condvar,
}

impl SinkInner {
    fn compress_loop(&self) {
        let mut state = self.state.lock();
        while state.keep_going {
            match state.queue.claim_next() {
                Some((seq, extent)) => {
                    let result = MutexGuard::unlocked(&mut state, || {
                        encode(&extent, &self.options).map(|frame| (extent, frame))
                    });
                    if state.queue.complete(seq, result) {
                        self.head_ready.notify_one();
                    }
                }
                None => self.work_ready.wait(&mut state),
            }
        }
    }

    fn writer_loop(&self) {
        let mut state = self.state.lock();
        loop {
            let slot_free = !state.writing && state.writer.is_some();
            if slot_free && state.queue.head_ready() {
                self.write_out_pending(&mut state);
                continue;
            }
            if !state.keep_going {
                break;
            }
            if slot_free {
                self.head_ready.wait(&mut state);
            } else {
                // Another thread holds the slot; it signals `drained` on release.
                self.drained.wait(&mut state);
            }
        }
    }

    /// Compress everything unclaimed on the calling thread, then write.
    fn compress_pending(&self, state: &mut MutexGuard<'_, SinkState>) {
        while let Some((seq, extent)) = state.queue.claim_next() {
            let result = MutexGuard::unlocked(state, || {
                encode(&extent, &self.options).map(|frame| (extent, frame))
            });
            state.queue.complete(seq, result);
        }
        self.write_out_pending(state);
    }

    /// Pop and write ready frames from the head. Only one thread writes at a
    /// time; a concurrent caller returns and the active writer picks up
    /// whatever became ready meanwhile.
    fn write_out_pending(&self, state: &mut MutexGuard<'_, SinkState>) {
        if state.writing {
            return;
        }
        let Some(mut slot) = state.writer.take() else {
            return;
        };
        state.writing = true;
        while let Some((meta, encoded)) = state.queue.pop_ready() {
            let poisoned = state.poisoned;
            let written = MutexGuard::unlocked(state, || -> Result<Option<EncodedFrame>> {
                let (extent, frame) = encoded?;
                if poisoned {
                    return Ok(None);
                }
                slot.write(&extent, &frame)?;
                Ok(Some(frame))
            });
            state.bytes_in_progress -= meta.bytes;
            match written {
                Ok(Some(frame)) => {
                    state.stats.record_frame(&frame);
                    if let Some(shared) = &meta.stats {
                        shared.record_frame(&frame);
                    }
                }
                Ok(None) => {}
                Err(err) => state.fail(err),
            }
            if let Some(library) = slot.next_library.take() {
                state.library = Some(library);
            }
            self.drained.notify_all();
        }
        state.writer = Some(slot);
        state.writing = false;
        self.drained.notify_all();
    }

    /// Wait until no thread holds the writer slot, then hand it out.
    fn with_writer<T>(
        &self,
        state: &mut MutexGuard<'_, SinkState>,
        f: impl FnOnce(&mut WriterSlot) -> Result<T>,
    ) -> Result<T> {
        while state.writing {
            self.drained.wait(state);
        }
        let mut slot = state
            .writer
            .take()
            .ok_or(Error::Misuse("extent sink is closed"))?;
        state.writing = true;
        let result = MutexGuard::unlocked(state, || f(&mut slot));
        state.writer = Some(slot);
        state.writing = false;
        self.drained.notify_all();
        result
    }
}

/// Writes extents to one file (or a rotation of files) through a
/// compressor pool.
pub struct ExtentFileSink {
    inner: Arc<SinkInner>,
    threads: Vec<JoinHandle<()>>,
}

impl ExtentFileSink {
    pub fn create(path: impl AsRef<Path>, config: SinkConfig) -> Result<Self> {
        let options = EncodeOptions {
            modes: config.compression_modes,
            level: config.compression_level,
            byte_order: config.byte_order,
        };
        let file = FileWriter::create(path.as_ref(), options, config.fsync_on_close)?;
        let compressors = config.compressors;
        let inner = Arc::new(SinkInner {
            config,
            options,
            state: Mutex::new(SinkState {
                queue: OrderedQueue::new(),
                bytes_in_progress: 0,
                keep_going: true,
                closed: false,
                writer: Some(WriterSlot {
                    file,
                    callback: None,
                    next_library: None,
                }),
                writing: false,
                library: None,
                stats: SinkStats::new(),
                failure: None,
                poisoned: false,
            }),
            work_ready: Condvar::new(),
            head_ready: Condvar::new(),
            drained: Condvar::new(),
        });

        let mut sink = Self {
            inner,
            threads: Vec::new(),
        };
        if compressors > 0 {
            for id in 0..compressors {
                let inner = Arc::clone(&sink.inner);
                let handle = thread::Builder::new()
                    .name(format!("extent-compress-{id}"))
                    .spawn(move || inner.compress_loop())?;
                sink.threads.push(handle);
            }
            let inner = Arc::clone(&sink.inner);
            let handle = thread::Builder::new()
                .name("extent-writer".to_string())
                .spawn(move || inner.writer_loop())?;
            sink.threads.push(handle);
        }
        log::info!(
            "opened {} with {} compressor threads",
            path.as_ref().display(),
            compressors
        );
        Ok(sink)
    }

    /// Write the type library. Must happen exactly once, before any extent.
    pub fn write_extent_library(&self, library: &ExtentTypeLibrary) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Error::Misuse("write_extent_library after close"));
        }
        if state.library.is_some() {
            return Err(Error::Misuse("extent library already written"));
        }
        self.inner
            .with_writer(&mut state, |slot| slot.file.write_library(library))?;
        state.library = Some(library.clone());
        Ok(())
    }

    /// Register a callback run on the writer before each data frame.
    pub fn set_write_callback(&self, callback: WriteCallback) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.inner.with_writer(&mut state, |slot| {
            slot.callback = Some(callback);
            Ok(())
        })
    }

    /// Block until every extent submitted so far is written.
    pub fn flush_pending(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Error::Misuse("flush_pending after close"));
        }
        loop {
            state.check_failure()?;
            if state.queue.is_empty() && !state.writing {
                return Ok(());
            }
            if self.threads.is_empty() {
                self.inner.compress_pending(&mut state);
                if state.queue.is_empty() && !state.writing {
                    continue;
                }
            }
            self.inner.drained.wait(&mut state);
        }
    }

    /// Stop updating `stats` for extents that are still queued.
    pub fn remove_stats_update(&self, stats: &SharedStats) {
        let mut state = self.inner.state.lock();
        for meta in state.queue.metas_mut() {
            if meta.stats.as_ref().is_some_and(|s| s.same_handle(stats)) {
                meta.stats = None;
            }
        }
    }

    /// Drain the queue, write the index and tail, and close the file.
    pub fn close(&mut self) -> Result<SinkStats> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::Misuse("extent sink already closed"));
            }
            state.closed = true;
        }
        let joined = self.shutdown_threads();

        let mut state = self.inner.state.lock();
        self.inner.compress_pending(&mut state);
        while state.writing {
            self.inner.drained.wait(&mut state);
        }
        let slot = state.writer.take();
        let failure = state.check_failure();
        let stats = state.stats.clone();
        drop(state);

        let finished = match slot {
            Some(slot) => slot.file.finish().map(|_| ()),
            None => Err(Error::Misuse("extent sink lost its writer")),
        };
        joined?;
        failure?;
        finished?;
        log::info!("extent sink closed: {}", stats.summary());
        Ok(stats)
    }

    fn shutdown_threads(&mut self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            state.keep_going = false;
        }
        self.inner.work_ready.notify_all();
        self.inner.head_ready.notify_all();
        let mut result = Ok(());
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                result = Err(Error::Worker("sink thread panicked".to_string()));
            }
        }
        result
    }
}

impl ExtentSink for ExtentFileSink {
    fn write_extent(&self, extent: Extent, stats: Option<&SharedStats>) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.closed {
            return Err(Error::Misuse("write_extent after close"));
        }
        state.check_failure()?;
        let Some(library) = &state.library else {
            return Err(Error::Misuse("extent library must be written before extents"));
        };
        if !library.contains(extent.schema()) {
            return Err(Error::type_mismatch(format!(
                "type '{}' is not in the sink's library",
                extent.type_name()
            )));
        }
        while !state.can_queue_work(&inner.config) {
            inner.drained.wait(&mut state);
            state.check_failure()?;
            if state.closed {
                return Err(Error::Misuse("write_extent after close"));
            }
        }
        let bytes = extent.size();
        state.bytes_in_progress += bytes;
        state.stats.peak_bytes_in_progress =
            state.stats.peak_bytes_in_progress.max(state.bytes_in_progress as u64);
        state.queue.push(
            WorkMeta {
                bytes,
                stats: stats.cloned(),
            },
            extent,
        );
        if self.threads.is_empty() {
            inner.compress_pending(&mut state);
        } else {
            inner.work_ready.notify_one();
        }
        Ok(())
    }

    fn stats(&self) -> SinkStats {
        self.inner.state.lock().stats.clone()
    }
}

impl Drop for ExtentFileSink {
    fn drop(&mut self) {
        let closed = self.inner.state.lock().closed;
        if !closed {
            if let Err(err) = self.close() {
                log::warn!("closing extent sink on drop failed: {err}");
            }
        }
    }
}
