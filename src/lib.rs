//! Self-describing, compressed, record-oriented extent files.
//!
//! An [`Extent`] is a batch of records of one [`ExtentType`]. Types are
//! described in JSON and registered in an [`ExtentTypeLibrary`], which is
//! written at the start of every file so files can be read without outside
//! knowledge of their contents.
//!
//! [`ExtentFileSink`] compresses extents on a thread pool and writes them in
//! submission order. [`ExtentFileSource`] reads a single file through its
//! index, and [`IndexSource`] prefetches and decodes across many files on a
//! thread pool, handing extents back in file order.

pub mod core;

pub use crate::core::{
    ByteOrder, Compression, CompressionModes, Error, Extent, ExtentFileSink, ExtentFileSource,
    ExtentSink, ExtentSource, ExtentType, ExtentTypeLibrary, Field, FieldKind, FieldType,
    IndexEntry, IndexSource, PrefetchConfig, ReadChecks, Result, SharedStats, SinkConfig,
    SinkStats, TypeDescription, WaitStats, WriteCallback, WriteContext, READ_CHECKS_ENV,
};
