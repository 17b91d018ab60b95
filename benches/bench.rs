use criterion::*;
use raster_segmenter::arrays::Array2D;
use raster_segmenter::common::SegmenterConfig;
use raster_segmenter::connectivity::assign_disjoint_set;
use raster_segmenter::cutoff::CutoffSet;
use raster_segmenter::planner::plan;
use raster_segmenter::raster::{BandProperty, BandType, MemRaster};
use raster_segmenter::segmenter::Segmenter;
use std::time::Duration;

/// Three band raster of soft blobs on a ramp, roughly what an aerial tile looks like to the
/// strategies.
fn synthetic_raster(size: usize) -> MemRaster {
    let props = [BandProperty::new(BandType::U8, None); 3];
    MemRaster::from_fn(size, size, &props, |col, row, band| {
        let blob = ((col / 37 + row / 53 + band) % 5) as f64 * 40.0;
        let ramp = ((col + row) % 64) as f64 / 8.0;
        blob + ramp
    })
}

fn bench_plan(c: &mut Criterion) {
    c.bench_function("plan", |b| {
        b.iter(|| {
            let _ = black_box(plan(
                black_box(40_000),
                black_box(30_000),
                10,
                200_000_000,
                0,
                16,
            ));
        });
    });
}

fn bench_cutoff_profiles(c: &mut Criterion) {
    let raster = synthetic_raster(1024);
    let mut group = c.benchmark_group("cutoff profiles");
    for overlap in [10, 20, 40] {
        let block_plan = plan(1024, 1024, overlap, 1024 * 1024, 256, 4).unwrap();
        group.bench_with_input(
            BenchmarkId::new("build", format!("overlap={overlap}")),
            &block_plan,
            |b, block_plan| {
                b.iter(|| {
                    let _ = black_box(CutoffSet::build(&raster, &[0, 1, 2], block_plan));
                });
            },
        );
    }
}

fn bench_assign_disjoint_set(c: &mut Criterion) {
    let mask = Array2D::from_fill(true, 1024, 1024);
    let labels: Vec<u32> = (0..1024 * 1024)
        .map(|i| ((i % 1024) / 37 + (i / 1024) / 53) as u32 % 5)
        .collect();
    c.bench_function("assign_disjoint_set", |b| {
        b.iter(|| {
            let _ = black_box(assign_disjoint_set(&mask, |a, b| labels[a] == labels[b]).flatten());
        });
    });
}

fn bench_segmenter(c: &mut Criterion) {
    let raster = synthetic_raster(1024);
    let mut group = c.benchmark_group("segmenter 1024");
    for strategy in ["trivial-threshold", "region-growing-mean", "region-growing-baatz"] {
        for threads in [1, 2, 4, 8] {
            let config = SegmenterConfig {
                strategy_name: strategy.to_string(),
                input_bands: vec![0, 1, 2],
                max_threads: threads,
                max_block_size: 256,
                ..Default::default()
            };
            group.bench_with_input(
                BenchmarkId::new(strategy, format!("threads={threads}")),
                &config,
                |b, config| {
                    let mut segmenter = Segmenter::new();
                    segmenter.initialize(config.clone(), &raster).unwrap();
                    b.iter(|| {
                        let _ = black_box(segmenter.execute(None).unwrap());
                    });
                },
            );
        }
    }
}

criterion_group!(name = benches;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_plan);
criterion_group!(name = benches1;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_cutoff_profiles);
criterion_group!(name = benches2;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_assign_disjoint_set);
criterion_group!(name = benches3;
config = Criterion::default().sample_size(10).measurement_time(Duration::from_secs(60)).warm_up_time(Duration::from_secs(10));
targets = bench_segmenter);
criterion_main!(benches, benches1, benches2, benches3);
