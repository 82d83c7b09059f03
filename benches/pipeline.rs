use std::sync::Arc;

use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use extentstore::{
    Extent, ExtentFileSink, ExtentSink, ExtentSource, ExtentType, ExtentTypeLibrary, IndexSource,
    PrefetchConfig, SinkConfig,
};

const EXTENTS_PER_ITER: usize = 64;
const ROWS_PER_EXTENT: usize = 2_000;

const BENCH_TYPE: &str = r#"{"name": "Bench::Op", "namespace": "bench", "version": "1.0",
    "fields": [
        {"name": "time", "type": "int64", "pack_relative": "time"},
        {"name": "bytes", "type": "int32"},
        {"name": "path", "type": "variable32", "pack_unique": true}
    ]}"#;

fn library() -> (ExtentTypeLibrary, Arc<ExtentType>) {
    let mut library = ExtentTypeLibrary::new();
    let ty = library.register_type(BENCH_TYPE).expect("register");
    (library, ty)
}

fn build_extent(ty: &Arc<ExtentType>, id: usize) -> Extent {
    let time = ty.field("time").expect("time");
    let bytes = ty.field("bytes").expect("bytes");
    let path = ty.field("path").expect("path");
    let mut extent = Extent::new(Arc::clone(ty));
    for i in 0..ROWS_PER_EXTENT {
        let row = extent.append_record();
        extent.set_i64(row, time, (id * ROWS_PER_EXTENT + i) as i64 * 1_000);
        extent.set_i32(row, bytes, (i % 8192) as i32);
        extent
            .set_bytes(row, path, format!("/data/file-{}", i % 64).as_bytes())
            .expect("path");
    }
    extent
}

fn bench_write(c: &mut Criterion) {
    let (library, ty) = library();
    let mut group = c.benchmark_group("write");
    for &compressors in &[0_usize, 2, 4] {
        group.bench_with_input(
            BenchmarkId::from_parameter(compressors),
            &compressors,
            |b, &compressors| {
                b.iter_batched(
                    || {
                        let dir = tempdir().expect("tempdir");
                        let extents: Vec<Extent> =
                            (0..EXTENTS_PER_ITER).map(|id| build_extent(&ty, id)).collect();
                        (dir, extents)
                    },
                    |(dir, extents)| {
                        let config = SinkConfig::default().compressors(compressors);
                        let path = dir.path().join("bench.ds");
                        let mut sink = ExtentFileSink::create(path, config).expect("sink");
                        sink.write_extent_library(&library).expect("library");
                        for extent in extents {
                            sink.write_extent(black_box(extent), None).expect("write");
                        }
                        sink.close().expect("close");
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let (library, ty) = library();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("bench.ds");
    let config = SinkConfig::default().compressors(4);
    let mut sink = ExtentFileSink::create(&path, config).expect("sink");
    sink.write_extent_library(&library).expect("library");
    for id in 0..EXTENTS_PER_ITER {
        sink.write_extent(build_extent(&ty, id), None).expect("write");
    }
    sink.close().expect("close");

    let mut group = c.benchmark_group("prefetch");
    for &threads in &[1_usize, 2, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let config = PrefetchConfig::default().unpack_threads(threads);
                let mut source = IndexSource::new(&[&path], config).expect("source");
                let mut records = 0;
                while let Some(extent) = source.get_extent().expect("read") {
                    records += black_box(extent).n_records();
                }
                assert_eq!(records, EXTENTS_PER_ITER * ROWS_PER_EXTENT);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
