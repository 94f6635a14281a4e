use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sandkit::archive::ArchiveStore;
use std::fs;
use std::path::Path;

fn write_tarball(path: &Path, file_count: usize, file_size: usize) {
    let file = fs::File::create(path).unwrap();
    let enc = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
    let mut builder = tar::Builder::new(enc);
    let content = vec![b'x'; file_size];
    for i in 0..file_count {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("file_{i}.bin"), content.as_slice())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

fn bench_prepare_cold(c: &mut Criterion) {
    let tmp = tempfile::tempdir().unwrap();
    let archive_path = tmp.path().join("rootfs.tar.gz");
    write_tarball(&archive_path, 200, 1024);

    let mut counter = 0usize;
    c.bench_function("prepare_cold_extraction", |b| {
        b.iter(|| {
            counter += 1;
            let target = tmp.path().join(format!("out-{counter}"));
            let _ = black_box(ArchiveStore::prepare(&archive_path, Some(&target)));
        });
    });
}

fn bench_prepare_cache_hit(c: &mut Criterion) {
    let tmp = tempfile::tempdir().unwrap();
    let archive_path = tmp.path().join("rootfs.tar.gz");
    write_tarball(&archive_path, 200, 1024);
    let target = tmp.path().join("out");
    ArchiveStore::prepare(&archive_path, Some(&target)).unwrap();

    c.bench_function("prepare_cache_hit", |b| {
        b.iter(|| {
            let _ = black_box(ArchiveStore::prepare(&archive_path, Some(&target)));
        });
    });
}

criterion_group!(benches, bench_prepare_cold, bench_prepare_cache_hit);
criterion_main!(benches);
