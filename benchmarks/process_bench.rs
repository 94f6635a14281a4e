use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sandkit::process::{spawn_piped, ProcessHandle};
use tokio::runtime::Runtime;

fn bench_wait_true(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("wait_true", |b| {
        b.to_async(&rt).iter(|| async {
            let child = spawn_piped(&["true".to_string()], false).unwrap();
            let mut handle = ProcessHandle::from_piped_child(child, None);
            let _ = black_box(handle.wait(None, false).await);
        });
    });
}

fn bench_communicate_echo(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("communicate_echo", |b| {
        b.to_async(&rt).iter(|| async {
            let child = spawn_piped(
                &["bash".to_string(), "-c".to_string(), "echo hello".to_string()],
                false,
            )
            .unwrap();
            let mut handle = ProcessHandle::from_piped_child(child, None);
            let _ = black_box(handle.communicate(None, None, false).await);
        });
    });
}

criterion_group!(benches, bench_wait_true, bench_communicate_echo);
criterion_main!(benches);
