//! Extent files: the record codec, the write and prefetch pipelines, and the
//! schema registry they share.

pub mod compression;
pub mod config;
pub mod error;
pub mod extent;
pub mod frame;
pub mod header;
mod ordered;
pub mod prefetch;
pub mod schema;
pub mod sink;
pub mod source;
pub mod stats;

pub use compression::{Compression, CompressionModes};
pub use config::{ByteOrder, PrefetchConfig, ReadChecks, SinkConfig, READ_CHECKS_ENV};
pub use error::{Error, Result};
pub use extent::Extent;
pub use prefetch::IndexSource;
pub use schema::{
    ExtentType, ExtentTypeLibrary, Field, FieldKind, FieldType, TypeDescription,
};
pub use sink::{ExtentFileSink, ExtentSink, WriteCallback, WriteContext};
pub use source::{ExtentFileSource, ExtentSource, IndexEntry};
pub use stats::{SharedStats, SinkStats, WaitStats};
