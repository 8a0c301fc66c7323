// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Throughput benchmarks: bulk insert, hit/miss search, and an N-thread
//! read-mostly mix against a shared tree.

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use skipquad::{Point, Quadtree, Square};
use std::time::Instant;

fn uniform_points(n: usize, seed: u64) -> Vec<Point> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n)
        .map(|_| Point::new([rng.gen_range(-7.9..7.9), rng.gen_range(-7.9..7.9)]))
        .collect()
}

fn populated_tree(points: &[Point]) -> Quadtree {
    let tree = Quadtree::new(Square::new(Point::origin(), 16.0));
    for p in points {
        tree.insert(*p);
    }
    tree
}

fn bulk_insert(c: &mut Criterion) {
    skipquad::thread_init();
    let mut group = c.benchmark_group("insert");
    for &n in [1_000usize, 10_000].iter() {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let points = uniform_points(n, 7);
            b.iter_batched(
                || Quadtree::new(Square::new(Point::origin(), 16.0)),
                |tree| {
                    for p in &points {
                        tree.insert(*p);
                    }
                    tree
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
    skipquad::thread_finish();
}

fn search(c: &mut Criterion) {
    skipquad::thread_init();
    let points = uniform_points(10_000, 7);
    let probes_hit = {
        let mut rng = SmallRng::seed_from_u64(11);
        (0..1_000)
            .map(|_| points[rng.gen_range(0..points.len())])
            .collect::<Vec<_>>()
    };
    let probes_miss = uniform_points(1_000, 13);
    let tree = populated_tree(&points);

    let mut group = c.benchmark_group("search");
    group.throughput(Throughput::Elements(probes_hit.len() as u64));
    group.bench_function("hit", |b| {
        b.iter(|| probes_hit.iter().filter(|p| tree.search(**p)).count())
    });
    group.bench_function("miss", |b| {
        b.iter(|| probes_miss.iter().filter(|p| tree.search(**p)).count())
    });
    group.finish();
    skipquad::thread_finish();
}

// The read-mostly mix from the worker-thread harness: 70% search, 20%
// insert, 10% remove, all threads hammering one tree.
fn mixed_mt(c: &mut Criterion) {
    skipquad::thread_init();
    let mut group = c.benchmark_group("mixed-70-20-10");
    for &threads in [1usize, 4].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter_custom(|iters| {
                    let points = uniform_points(10_000, 7);
                    let tree = populated_tree(&points);
                    let per_thread = (iters as usize).max(1) / threads + 1;

                    let start = Instant::now();
                    std::thread::scope(|s| {
                        for t in 0..threads {
                            let tree = &tree;
                            let points = &points;
                            s.spawn(move || {
                                skipquad::thread_init();
                                let mut rng = SmallRng::seed_from_u64(17 + t as u64);
                                for _ in 0..per_thread {
                                    let p = points[rng.gen_range(0..points.len())];
                                    match rng.gen_range(0..100u32) {
                                        0..=69 => {
                                            tree.search(p);
                                        }
                                        70..=89 => {
                                            tree.insert(p);
                                        }
                                        _ => {
                                            tree.remove(p);
                                        }
                                    }
                                }
                                skipquad::thread_finish();
                            });
                        }
                    });
                    start.elapsed()
                });
            },
        );
    }
    group.finish();
    skipquad::thread_finish();
}

criterion_group!(benches, bulk_insert, search, mixed_mt);
criterion_main!(benches);
