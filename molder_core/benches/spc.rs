use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use molder_core::spc::{SpcEngine, SpecLimits};
use std::collections::BTreeMap;

// Synthetic metric stream: slow sine drift with additive white noise,
// the shape a mildly unstable process produces.
fn synth_metric(n: usize, noise_amp: f64, seed: u32) -> Vec<f64> {
    let mut state = seed.max(1);
    let mut next = || {
        let mut x = state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        state = x;
        (x as f64) / (u32::MAX as f64 + 1.0)
    };
    let mut v = Vec::with_capacity(n);
    for i in 0..n {
        let t = i as f64 / 40.0;
        let drift = t.sin() * 2.0;
        let noise = (next() * 2.0 - 1.0) * noise_amp;
        v.push(500.0 + drift + noise);
    }
    v
}

pub fn bench_spc_update(c: &mut Criterion) {
    let mut g = c.benchmark_group("spc_update");
    if let Ok(ss) = std::env::var("BENCH_SAMPLE_SIZE") {
        if let Ok(n) = ss.parse::<usize>() {
            g.sample_size(n.max(10));
        }
    } else {
        g.sample_size(50);
    }

    let values = synth_metric(500, 3.0, 0xC0FFEE);
    let mut limits = BTreeMap::new();
    limits.insert(
        "peak_pressure".to_owned(),
        SpecLimits {
            usl: 520.0,
            lsl: 480.0,
        },
    );

    g.bench_function("window50_500_updates", |b| {
        b.iter_batched(
            || SpcEngine::new(50, limits.clone()),
            |mut engine| {
                for &v in &values {
                    black_box(engine.update("peak_pressure", v));
                }
            },
            BatchSize::SmallInput,
        );
    });
    g.finish();
}

criterion_group!(benches, bench_spc_update);
criterion_main!(benches);
