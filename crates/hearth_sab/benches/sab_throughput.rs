//! Shared audio buffer throughput benchmarks.
//!
//! Measures the write/commit and read/commit hot path at buffer sizes
//! representative of real stream geometries.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use hearth_sab::SharedAudioBuffer;

fn benchmark_write_read_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("sab_cycle");

    for used_size in [960, 1920, 3840, 7680].iter() {
        let (mut sab, _header_fd, _samples_fd) =
            SharedAudioBuffer::create(4, 4096, *used_size).expect("create sab");

        group.throughput(Throughput::Bytes(*used_size as u64));
        group.bench_function(format!("write_commit_{}_bytes", used_size), |b| {
            b.iter(|| {
                let ws = sab.write_space();
                let n = ws.len().min(*used_size as usize);
                for byte in ws[..n].iter_mut() {
                    *byte = black_box(0xAB);
                }
                let _ = sab.commit_write(n);
            })
        });
    }

    group.finish();
}

fn benchmark_volume_scaler_access(c: &mut Criterion) {
    let (sab, _header_fd, _samples_fd) = SharedAudioBuffer::create(4, 4096, 1920).expect("create sab");

    c.bench_function("volume_scaler_read_write", |b| {
        b.iter(|| {
            sab.set_volume_scaler(black_box(0.5));
            black_box(sab.volume_scaler());
        })
    });
}

criterion_group!(benches, benchmark_write_read_cycle, benchmark_volume_scaler_access);
criterion_main!(benches);
