use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use tempfile::tempdir;

use chronicle_segment::{AppendCallback, AppendResult, AppendStatus, Segment};

const APPENDS_PER_ITER: usize = 10_000;

struct CopyCallback;

impl AppendCallback<[u8]> for CopyCallback {
    fn do_append(
        &self,
        _segment_from_offset: u64,
        buffer: &mut [u8],
        remaining: u64,
        msg: &[u8],
    ) -> AppendResult {
        if msg.len() as u64 > remaining {
            return AppendResult {
                wrote_bytes: 0,
                store_timestamp: 0,
                status: AppendStatus::MessageSizeExceeded,
            };
        }
        buffer[..msg.len()].copy_from_slice(msg);
        AppendResult {
            wrote_bytes: msg.len() as u64,
            store_timestamp: 0,
            status: AppendStatus::Ok,
        }
    }
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    for &size in &[64_usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let file_size = (size as u64) * (APPENDS_PER_ITER as u64 + 1);
                    let path = dir.path().join(format!("{:020}", 0));
                    let seg = Segment::init(path, file_size, None).expect("segment");
                    let payload = vec![0u8; size];
                    (dir, seg, payload)
                },
                |(_dir, seg, payload)| {
                    for _ in 0..APPENDS_PER_ITER {
                        seg.append_encoded(black_box(payload.as_slice()), &CopyCallback);
                    }
                    seg.flush(0);
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
