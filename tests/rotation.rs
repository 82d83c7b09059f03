mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use extentstore::{
    ExtentFileSink, ExtentFileSource, ExtentSink, ExtentSource, IndexSource, PrefetchConfig,
    ReadChecks, SinkConfig, WriteContext,
};
use tempfile::tempdir;

use common::{assert_event_extent, event_extent, event_library, init_logging};

#[test]
fn callback_rotates_into_a_new_file() {
    init_logging();
    let dir = tempdir().expect("tempdir");
    let first = dir.path().join("part-0.ds");
    let (library, ty) = event_library();

    let mut sink =
        ExtentFileSink::create(&first, SinkConfig::default().compressors(3)).expect("create");
    sink.write_extent_library(&library).expect("library");

    let written = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&written);
    let rotate_dir = dir.path().to_path_buf();
    let rotate_library = library.clone();
    sink.set_write_callback(Box::new(move |ctx: &mut WriteContext<'_>| -> extentstore::Result<()> {
        let n = seen.fetch_add(1, Ordering::SeqCst);
        if n > 0 && n % 4 == 0 {
            let next = rotate_dir.join(format!("part-{}.ds", n / 4));
            ctx.rotate(&next, &rotate_library)?;
            assert_eq!(ctx.path(), next.as_path());
        }
        Ok(())
    }))
    .expect("callback");

    for id in 0..10 {
        sink.write_extent(event_extent(&ty, id, 5 + id as usize), None)
            .expect("write");
    }
    let stats = sink.close().expect("close");
    assert_eq!(stats.extents, 10);
    assert_eq!(written.load(Ordering::SeqCst), 10);

    let parts: Vec<_> = (0..3).map(|i| dir.path().join(format!("part-{i}.ds"))).collect();
    let counts: Vec<usize> = parts
        .iter()
        .map(|path| {
            let source = ExtentFileSource::open(path, ReadChecks::all()).expect("open part");
            source.verify_chained_checksum().expect("chain");
            source.index().len()
        })
        .collect();
    assert_eq!(counts, vec![4, 4, 2]);

    let mut source = IndexSource::new(&parts, PrefetchConfig::default().unpack_threads(2))
        .expect("open parts");
    for id in 0..10 {
        let extent = source.get_extent().expect("read").expect("extent");
        assert_event_extent(&extent, id, 5 + id as usize);
    }
}
