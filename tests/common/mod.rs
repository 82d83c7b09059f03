#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use extentstore::core::frame::FrameHeader;
use extentstore::{
    Extent, ExtentFileSink, ExtentFileSource, ExtentSink, ExtentType, ExtentTypeLibrary, ReadChecks,
    SinkConfig, SinkStats,
};

pub const EVENT_TYPE: &str = r#"{
    "name": "Trace::Event",
    "namespace": "test.extentstore",
    "version": "1.2",
    "fields": [
        {"name": "seq", "type": "int64"},
        {"name": "extent", "type": "int32"},
        {"name": "latency", "type": "double"},
        {"name": "ok", "type": "bool"},
        {"name": "tag", "type": "byte", "nullable": true},
        {"name": "host", "type": "variable32", "pack_unique": true}
    ]
}"#;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn event_library() -> (ExtentTypeLibrary, Arc<ExtentType>) {
    let mut library = ExtentTypeLibrary::new();
    let ty = library.register_type(EVENT_TYPE).expect("register event type");
    (library, ty)
}

/// Extent number `id` with `rows` records whose values derive from both.
pub fn event_extent(ty: &Arc<ExtentType>, id: i32, rows: usize) -> Extent {
    let seq = ty.field("seq").expect("seq");
    let extent_no = ty.field("extent").expect("extent");
    let latency = ty.field("latency").expect("latency");
    let ok = ty.field("ok").expect("ok");
    let tag = ty.field("tag").expect("tag");
    let host = ty.field("host").expect("host");

    let mut extent = Extent::new(Arc::clone(ty));
    for i in 0..rows {
        let row = extent.append_record();
        extent.set_i64(row, seq, i as i64 * 1_000 + id as i64);
        extent.set_i32(row, extent_no, id);
        extent.set_f64(row, latency, i as f64 * 0.25 + id as f64);
        extent.set_bool(row, ok, i % 3 != 0);
        if i % 4 == 0 {
            extent.set_null(row, tag, true);
        } else {
            extent.set_byte(row, tag, (i % 251) as u8);
        }
        extent
            .set_bytes(row, host, format!("host-{}", i % 5).as_bytes())
            .expect("host");
    }
    extent
}

/// Check that `extent` holds exactly what [`event_extent`] built.
pub fn assert_event_extent(extent: &Extent, id: i32, rows: usize) {
    let ty = extent.schema();
    assert_eq!(extent.type_name(), "Trace::Event");
    assert_eq!(extent.n_records(), rows, "extent {id}");
    let tag = ty.field("tag").expect("tag");
    for i in 0..rows {
        assert_eq!(extent.get_i64(i, ty.field("seq").expect("seq")), i as i64 * 1_000 + id as i64);
        assert_eq!(extent.get_i32(i, ty.field("extent").expect("extent")), id);
        assert_eq!(
            extent.get_f64(i, ty.field("latency").expect("latency")),
            i as f64 * 0.25 + id as f64
        );
        assert_eq!(extent.get_bool(i, ty.field("ok").expect("ok")), i % 3 != 0);
        if i % 4 == 0 {
            assert!(extent.is_null(i, tag));
        } else {
            assert!(!extent.is_null(i, tag));
            assert_eq!(extent.get_byte(i, tag), (i % 251) as u8);
        }
        assert_eq!(
            extent.get_bytes(i, ty.field("host").expect("host")).expect("host"),
            format!("host-{}", i % 5).as_bytes()
        );
    }
}

/// Write one event extent per entry of `sizes` and close the file.
pub fn write_events(path: &Path, config: SinkConfig, sizes: &[usize]) -> SinkStats {
    let (library, ty) = event_library();
    let mut sink = ExtentFileSink::create(path, config).expect("create sink");
    sink.write_extent_library(&library).expect("library");
    for (id, &rows) in sizes.iter().enumerate() {
        sink.write_extent(event_extent(&ty, id as i32, rows), None)
            .expect("write extent");
    }
    sink.close().expect("close sink")
}

/// Largest compressed frame and largest decoded size among a file's extents.
pub fn largest_frames(path: &Path) -> (usize, usize) {
    let source = ExtentFileSource::open(path, ReadChecks::default()).expect("open");
    let mut compressed = 0;
    let mut unpacked = 0;
    for entry in source.index() {
        let frame = source.read_frame(entry.offset).expect("frame");
        let header = FrameHeader::parse(&frame, source.byte_order()).expect("frame header");
        let schema = source.frame_schema(&frame).expect("schema");
        compressed = compressed.max(frame.len());
        unpacked = unpacked.max(header.unpacked_size(schema.record_size()));
    }
    (compressed, unpacked)
}
