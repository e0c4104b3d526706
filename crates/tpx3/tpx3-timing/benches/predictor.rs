use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tpx3_timing::{PeriodPredictor, PeriodQueues};

const INTERVAL: i64 = 640_000;

fn bench_period_tracking(c: &mut Criterion) {
    let mut group = c.benchmark_group("period_tracking");
    group.throughput(Throughput::Elements(1));

    group.bench_with_input(BenchmarkId::new("prediction_update", "tdc"), &INTERVAL, |b, &iv| {
        let mut p = PeriodPredictor::new(0, iv);
        let mut ts = 0i64;
        b.iter(|| {
            ts += iv + 11;
            p.prediction_update(black_box(ts));
            black_box(p.interval_prediction())
        });
    });

    group.bench_with_input(BenchmarkId::new("period_prediction", "hit"), &INTERVAL, |b, &iv| {
        let mut p = PeriodPredictor::new(0, iv);
        for k in 1..=8 {
            p.prediction_update(k * iv);
        }
        let mut ts = 8 * iv;
        b.iter(|| {
            ts += 997;
            black_box(p.period_prediction(black_box(ts)))
        });
    });

    group.bench_with_input(
        BenchmarkId::new("period_index_for", "hit"),
        &INTERVAL,
        |b, &iv| {
            let pq = PeriodQueues::default();
            let p = PeriodPredictor::new(0, iv);
            let mut ts = 0i64;
            b.iter(|| {
                ts += 997;
                let predicted = p.period_prediction(black_box(ts));
                black_box(pq.period_index_for(predicted))
            });
        },
    );

    group.finish();
}

criterion_group!(benches, bench_period_tracking);
criterion_main!(benches);
