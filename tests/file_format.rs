mod common;

use std::sync::Arc;

use extentstore::core::frame::FRAME_PREFIX_SIZE;
use extentstore::core::header::HEADER_SIZE;
use extentstore::{
    ByteOrder, CompressionModes, Error, Extent, ExtentFileSink, ExtentFileSource, ExtentSink,
    ExtentSource, ExtentTypeLibrary, IndexSource, PrefetchConfig, ReadChecks, SinkConfig,
};
use tempfile::tempdir;

use common::{assert_event_extent, init_logging, write_events};

#[test]
fn file_starts_with_magic_and_sentinels() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("magic.ds");
    write_events(&path, SinkConfig::default().byte_order(ByteOrder::Big), &[3]);
    let bytes = std::fs::read(&path).expect("read");
    assert_eq!(&bytes[..4], b"DSv1");
    assert_eq!(&bytes[4..8], &0x1234_5678u32.to_be_bytes());
    assert_eq!(&bytes[8..16], &0x1234_5678_9ABC_DEF0u64.to_be_bytes());
    assert_eq!(&bytes[16..24], &std::f64::consts::PI.to_be_bytes());
}

#[test]
fn foreign_byte_order_reads_back_unchanged() {
    init_logging();
    let dir = tempdir().expect("tempdir");
    let sizes = [7, 64, 1, 300];
    for order in [ByteOrder::native(), ByteOrder::native().flipped()] {
        let path = dir.path().join(format!("{order:?}.ds"));
        write_events(&path, SinkConfig::default().compressors(2).byte_order(order), &sizes);

        let mut source = ExtentFileSource::open(&path, ReadChecks::all()).expect("open");
        assert_eq!(source.byte_order(), order);
        for (id, &rows) in sizes.iter().enumerate() {
            let extent = source.get_extent().expect("read").expect("extent");
            assert_event_extent(&extent, id as i32, rows);
        }
        source.verify_chained_checksum().expect("chain");
    }
}

#[test]
fn minor_versions_are_compatible_majors_are_not() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("versions.ds");
    write_events(&path, SinkConfig::default(), &[1]);
    let source = ExtentFileSource::open(&path, ReadChecks::default()).expect("open");
    let library = source.library();
    assert!(library.require_version("Trace::Event", 1, 2).is_ok());
    assert!(library.require_version("Trace::Event", 1, 1).is_ok());
    assert!(matches!(
        library.require_version("Trace::Event", 1, 3),
        Err(Error::TypeMismatch(_))
    ));
    assert!(matches!(
        library.require_version("Trace::Event", 2, 0),
        Err(Error::TypeMismatch(_))
    ));

    let mut newer = ExtentTypeLibrary::new();
    newer
        .register_type(
            r#"{"name": "Compat::T", "version": "1.3",
                "fields": [{"name": "a", "type": "int32"}]}"#,
        )
        .expect("1.3");
    assert!(newer.require_version("Compat::T", 1, 2).is_ok());
    let mut major = ExtentTypeLibrary::new();
    major
        .register_type(
            r#"{"name": "Compat::T", "version": "2.0",
                "fields": [{"name": "a", "type": "int32"}]}"#,
        )
        .expect("2.0");
    assert!(major.require_version("Compat::T", 1, 2).is_err());
}

#[test]
fn corrupt_header_or_tail_fails_at_open() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("corrupt.ds");
    write_events(&path, SinkConfig::default(), &[10, 10]);
    let pristine = std::fs::read(&path).expect("read");

    let mut bad = pristine.clone();
    bad[1] = b'X';
    std::fs::write(&path, &bad).expect("write");
    assert!(matches!(
        ExtentFileSource::open(&path, ReadChecks::default()),
        Err(Error::Format(_))
    ));

    let mut bad = pristine.clone();
    let last = bad.len() - 1;
    bad[last] ^= 0x01;
    std::fs::write(&path, &bad).expect("write");
    assert!(matches!(
        ExtentFileSource::open(&path, ReadChecks::default()),
        Err(Error::Checksum(_))
    ));

    std::fs::write(&path, &pristine[..pristine.len() / 2]).expect("write");
    assert!(ExtentFileSource::open(&path, ReadChecks::default()).is_err());
    assert!(IndexSource::new(&[&path], PrefetchConfig::default()).is_err());
}

#[test]
fn corrupt_data_frame_ends_the_stream() {
    init_logging();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("frame.ds");
    write_events(&path, SinkConfig::default().compressors(2), &[20, 20, 20, 20]);
    let offset = {
        let source = ExtentFileSource::open(&path, ReadChecks::default()).expect("open");
        source.index()[1].offset as usize
    };
    let mut bytes = std::fs::read(&path).expect("read");
    bytes[offset + FRAME_PREFIX_SIZE + 20] ^= 0xFF;
    std::fs::write(&path, &bytes).expect("write");

    let mut source =
        IndexSource::new(&[&path], PrefetchConfig::default().unpack_threads(2)).expect("open");
    assert_event_extent(&source.get_extent().expect("first").expect("extent"), 0, 20);
    assert!(matches!(source.get_extent(), Err(Error::Checksum(_))));
    assert!(source.get_extent().expect("after error").is_none());
    assert!(source.get_extent().expect("still done").is_none());

    source.reset_pos().expect("reset");
    assert_event_extent(&source.get_extent().expect("again").expect("extent"), 0, 20);
    assert!(source.get_extent().is_err());

    let mut source = ExtentFileSource::open(&path, ReadChecks::default()).expect("open");
    assert!(matches!(source.read_extent(offset as u64), Err(Error::Checksum(_))));
    assert!(source.get_extent().expect("first").is_some());
    assert!(source.get_extent().is_err());
    assert!(source.get_extent().expect("after error").is_none());
}

#[test]
fn chained_checksum_detects_reordered_frames() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("chain.ds");
    let config = SinkConfig::default().compression_modes(CompressionModes::NONE);
    write_events(&path, config, &[4, 4]);
    let source = ExtentFileSource::open(&path, ReadChecks::all()).expect("open");
    source.verify_chained_checksum().expect("chain");
    let first = source.index()[0].offset as usize;
    let second = source.index()[1].offset as usize;
    let end = source.tail().index_offset as usize;
    drop(source);

    let bytes = std::fs::read(&path).expect("read");
    let mut swapped = bytes[..first].to_vec();
    swapped.extend_from_slice(&bytes[second..end]);
    swapped.extend_from_slice(&bytes[first..second]);
    swapped.extend_from_slice(&bytes[end..]);
    std::fs::write(&path, &swapped).expect("write");

    // Frames are the same size, so the index still lines up.
    let source = ExtentFileSource::open(&path, ReadChecks::all()).expect("open");
    assert!(matches!(source.verify_chained_checksum(), Err(Error::Checksum(_))));
}

#[test]
fn empty_and_type_only_files() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("empty.ds");
    let mut library = ExtentTypeLibrary::new();
    let ty = library
        .register_type(r#"{"name": "Empty::T", "fields": [{"name": "v", "type": "int64"}]}"#)
        .expect("type");
    let mut sink = ExtentFileSink::create(&path, SinkConfig::default()).expect("create");
    sink.write_extent_library(&library).expect("library");
    sink.write_extent(Extent::new(Arc::clone(&ty)), None).expect("empty extent");
    sink.close().expect("close");

    let mut source = ExtentFileSource::open(&path, ReadChecks::all()).expect("open");
    assert!(source.index()[0].offset > HEADER_SIZE as u64);
    let extent = source.get_extent().expect("read").expect("extent");
    assert_eq!(extent.n_records(), 0);
    assert!(source.get_extent().expect("end").is_none());
}
