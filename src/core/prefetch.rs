//! Prefetch-and-decode pipeline over one or more extent files.
//!
//! A reader thread walks the file indexes in order and pushes raw frames
//! into an [`OrderedQueue`]. Decoder threads claim frames from the front of
//! the unclaimed part of the queue, decode them outside the lock and attach
//! the result to the same slot. The consumer only ever pops the head, so
//! extents come out in file order whatever order decoding finishes in.
//!
//! Two budgets bound memory: bytes read but not yet claimed, and bytes
//! claimed but not yet handed to the consumer. Either may be overshot by one
//! frame so an oversized frame still makes progress.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::core::config::{ByteOrder, PrefetchConfig, ReadChecks};
use crate::core::extent::Extent;
use crate::core::frame::{decode, FrameHeader};
use crate::core::ordered::OrderedQueue;
use crate::core::schema::ExtentType;
use crate::core::source::{ExtentFileSource, ExtentSource};
use crate::core::stats::WaitStats;
use crate::core::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct Budget {
    current: usize,
    limit: usize,
    /// Highest `current` seen.
    peak: usize,
}

impl Budget {
    fn new(limit: usize) -> Self {
        Self {
            current: 0,
            limit,
            peak: 0,
        }
    }

    fn can_add(&self, amount: usize) -> bool {
        self.current == 0 || self.current + amount < self.limit
    }

    fn add(&mut self, amount: usize) {
        self.current += amount;
        self.peak = self.peak.max(self.current);
    }
}

/// Sizes of one queued frame.
struct FrameSizes {
    compressed: usize,
    unpacked: usize,
}

struct RawFrame {
    bytes: Vec<u8>,
    schema: Arc<ExtentType>,
    order: ByteOrder,
}

/// One frame the reader will fetch.
struct PlannedFrame {
    file: usize,
    offset: u64,
    schema: Arc<ExtentType>,
}

struct PrefetchState {
    queue: OrderedQueue<FrameSizes, RawFrame, Result<Extent>>,
    compressed: Budget,
    unpacked: Budget,
    keep_going: bool,
    source_done: bool,
    /// Threads that have not exited yet.
    running: usize,
    waits: WaitStats,
}

struct PrefetchInner {
    files: Vec<ExtentFileSource>,
    checks: ReadChecks,
    state: Mutex<PrefetchState>,
    /// The reader waits here for compressed budget.
    space_ready: Condvar,
    /// Decoders wait here for a claimable frame or unpacked budget.
    work_ready: Condvar,
    /// The consumer waits here for the head to finish.
    head_ready: Condvar,
    /// `close` waits here for the last thread to exit.
    exited: Condvar,
}

impl PrefetchInner {
    fn read_loop(&self, plan: Vec<PlannedFrame>) {
        let mut state = self.state.lock();
        for planned in plan {
            while state.keep_going && !state.compressed.can_add(0) {
                state.waits.reader_full += 1;
                self.space_ready.wait(&mut state);
            }
            if !state.keep_going {
                break;
            }
            let file = &self.files[planned.file];
            let read = MutexGuard::unlocked(&mut state, || -> Result<(usize, RawFrame)> {
                let bytes = file.read_frame(planned.offset)?;
                let header = FrameHeader::parse(&bytes, file.byte_order())?;
                let unpacked = header.unpacked_size(planned.schema.record_size());
                Ok((
                    unpacked,
                    RawFrame {
                        bytes,
                        schema: planned.schema,
                        order: file.byte_order(),
                    },
                ))
            });
            match read {
                Ok((unpacked, frame)) => {
                    let compressed = frame.bytes.len();
                    state.compressed.add(compressed);
                    state.waits.compressed_bytes += compressed as u64;
                    state.queue.push(FrameSizes { compressed, unpacked }, frame);
                    self.work_ready.notify_one();
                }
                Err(err) => {
                    log::warn!(
                        "prefetch read of {} at {} failed: {err}",
                        file.path().display(),
                        planned.offset
                    );
                    state.queue.push_done(
                        FrameSizes {
                            compressed: 0,
                            unpacked: 0,
                        },
                        Err(err),
                    );
                    break;
                }
            }
        }
        state.source_done = true;
        self.head_ready.notify_all();
        self.exit(&mut state);
    }

    fn unpack_loop(&self) {
        let mut state = self.state.lock();
        while state.keep_going {
            let (compressed, unpacked) = match state.queue.peek_unclaimed() {
                Some(sizes) => (sizes.compressed, sizes.unpacked),
                None => {
                    state.waits.unpack_no_upstream += 1;
                    self.work_ready.wait(&mut state);
                    continue;
                }
            };
            if !state.unpacked.can_add(unpacked) {
                state.waits.unpack_downstream_full += 1;
                self.work_ready.wait(&mut state);
                continue;
            }
            let Some((seq, frame)) = state.queue.claim_next() else {
                continue;
            };
            state.compressed.current -= compressed;
            state.unpacked.add(unpacked);
            self.space_ready.notify_one();

            let result = MutexGuard::unlocked(&mut state, || {
                decode(&frame.bytes, &frame.schema, frame.order, &self.checks)
            });
            if state.queue.complete(seq, result) {
                self.head_ready.notify_all();
            }
        }
        self.exit(&mut state);
    }

    fn exit(&self, state: &mut MutexGuard<'_, PrefetchState>) {
        state.running -= 1;
        if state.running == 0 {
            self.exited.notify_all();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Finished,
}

/// Reads the extents listed in the indexes of a set of files, in order,
/// with a pool of decoder threads working ahead of the consumer.
pub struct IndexSource {
    inner: Arc<PrefetchInner>,
    config: PrefetchConfig,
    filters: Vec<String>,
    phase: Phase,
    threads: Vec<JoinHandle<()>>,
}

impl IndexSource {
    /// Open every file up front; a damaged file fails here.
    pub fn new<P: AsRef<Path>>(paths: &[P], config: PrefetchConfig) -> Result<Self> {
        let files = paths
            .iter()
            .map(|path| ExtentFileSource::open(path, config.read_checks))
            .collect::<Result<Vec<_>>>()?;
        let inner = Arc::new(PrefetchInner {
            files,
            checks: config.read_checks,
            state: Mutex::new(PrefetchState {
                queue: OrderedQueue::new(),
                compressed: Budget::new(config.max_compressed_bytes),
                unpacked: Budget::new(config.max_unpacked_bytes),
                keep_going: false,
                source_done: false,
                running: 0,
                waits: WaitStats::default(),
            }),
            space_ready: Condvar::new(),
            work_ready: Condvar::new(),
            head_ready: Condvar::new(),
            exited: Condvar::new(),
        });
        Ok(Self {
            inner,
            config,
            filters: Vec::new(),
            phase: Phase::Idle,
            threads: Vec::new(),
        })
    }

    pub fn files(&self) -> &[ExtentFileSource] {
        &self.inner.files
    }

    /// Only read extents of the type matching `pattern`, replacing earlier
    /// filters. The match must name the same type in every file.
    pub fn type_filter(&mut self, pattern: &str) -> Result<()> {
        let name = self.resolve_type(pattern)?;
        self.filters = vec![name];
        Ok(())
    }

    /// Also read extents of the type matching `pattern`.
    pub fn second_type_filter(&mut self, pattern: &str) -> Result<()> {
        let name = self.resolve_type(pattern)?;
        if !self.filters.contains(&name) {
            self.filters.push(name);
        }
        Ok(())
    }

    fn resolve_type(&self, pattern: &str) -> Result<String> {
        if self.phase != Phase::Idle {
            return Err(Error::Misuse("type filter set after prefetching started"));
        }
        let mut resolved: Option<String> = None;
        for file in &self.inner.files {
            let name = file.library().get_type_match(pattern)?.name().to_string();
            match &resolved {
                Some(previous) if *previous != name => {
                    return Err(Error::type_mismatch(format!(
                        "'{pattern}' matches '{previous}' in one file and '{name}' in {}",
                        file.path().display()
                    )));
                }
                Some(_) => {}
                None => resolved = Some(name),
            }
        }
        resolved.ok_or_else(|| {
            Error::type_mismatch(format!("no files to match '{pattern}' against"))
        })
    }

    fn plan(&self) -> Result<Vec<PlannedFrame>> {
        let mut plan = Vec::new();
        for (idx, file) in self.inner.files.iter().enumerate() {
            for entry in file.index() {
                if !self.filters.is_empty() && !self.filters.contains(&entry.type_name) {
                    continue;
                }
                plan.push(PlannedFrame {
                    file: idx,
                    offset: entry.offset,
                    schema: file.library().require_type(&entry.type_name)?,
                });
            }
        }
        Ok(plan)
    }

    /// Start the reader and decoder threads. Called implicitly by the first
    /// [`ExtentSource::get_extent`].
    pub fn start_prefetching(&mut self) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(Error::Misuse("prefetching already started"));
        }
        let plan = self.plan()?;
        let unpackers = self.config.unpack_threads.max(1);
        log::debug!(
            "prefetching {} extents from {} files with {} decoder threads",
            plan.len(),
            self.inner.files.len(),
            unpackers
        );
        {
            let mut state = self.inner.state.lock();
            state.keep_going = true;
            state.source_done = false;
            state.running = 0;
        }
        self.phase = Phase::Running;

        let inner = Arc::clone(&self.inner);
        self.spawn_counted("extent-prefetch-read".to_string(), move || inner.read_loop(plan))?;
        for id in 0..unpackers {
            let inner = Arc::clone(&self.inner);
            self.spawn_counted(format!("extent-unpack-{id}"), move || inner.unpack_loop())?;
        }
        Ok(())
    }

    /// Spawn a pipeline thread, counting it as running before it starts.
    fn spawn_counted<F>(&mut self, name: String, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.state.lock().running += 1;
        match thread::Builder::new().name(name).spawn(body) {
            Ok(handle) => {
                self.threads.push(handle);
                Ok(())
            }
            Err(err) => {
                let mut state = self.inner.state.lock();
                self.inner.exit(&mut state);
                Err(err.into())
            }
        }
    }

    /// Stop every thread and drop whatever was prefetched.
    pub fn close(&mut self) -> Result<()> {
        if self.phase == Phase::Running {
            let mut state = self.inner.state.lock();
            state.keep_going = false;
            self.inner.space_ready.notify_all();
            self.inner.work_ready.notify_all();
            self.inner.head_ready.notify_all();
            while state.running > 0 {
                self.inner.exited.wait(&mut state);
            }
            state.queue.clear();
            state.compressed.current = 0;
            state.unpacked.current = 0;
        }
        let mut result = Ok(());
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                result = Err(Error::Worker("prefetch thread panicked".to_string()));
            }
        }
        if self.phase == Phase::Running {
            self.phase = Phase::Finished;
        }
        result
    }

    /// Close, then start over from the first extent of the first file.
    pub fn reset_pos(&mut self) -> Result<()> {
        self.close()?;
        self.phase = Phase::Idle;
        Ok(())
    }

    pub fn wait_stats(&self) -> WaitStats {
        let state = self.inner.state.lock();
        WaitStats {
            peak_compressed_bytes: state.compressed.peak as u64,
            peak_unpacked_bytes: state.unpacked.peak as u64,
            ..state.waits.clone()
        }
    }
}

impl ExtentSource for IndexSource {
    fn get_extent(&mut self) -> Result<Option<Extent>> {
        match self.phase {
            Phase::Idle => self.start_prefetching()?,
            Phase::Finished => return Ok(None),
            Phase::Running => {}
        }
        let inner = Arc::clone(&self.inner);
        let mut state = inner.state.lock();
        loop {
            if let Some((sizes, result)) = state.queue.pop_ready() {
                state.unpacked.current -= sizes.unpacked;
                state.waits.nextents += 1;
                inner.work_ready.notify_all();
                match result {
                    Ok(extent) => {
                        state.waits.unpacked_bytes += extent.size() as u64;
                        return Ok(Some(extent));
                    }
                    Err(err) => {
                        // A damaged extent ends the stream; nothing after it is served.
                        drop(state);
                        log::warn!("stopping prefetch at a damaged extent: {err}");
                        if let Err(close_err) = self.close() {
                            log::warn!("closing prefetch after a damaged extent: {close_err}");
                        }
                        return Err(err);
                    }
                }
            }
            if state.source_done && state.queue.is_empty() {
                break;
            }
            state.waits.consumer += 1;
            inner.head_ready.wait(&mut state);
        }
        drop(state);
        log::debug!("prefetch finished: {}", self.wait_stats().summary());
        self.close()?;
        Ok(None)
    }
}

impl Drop for IndexSource {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("closing index source on drop failed: {err}");
        }
    }
}
