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

mod util; // For init_logging and pt.

use rand::{rngs::SmallRng, Rng, SeedableRng};
use skipquad::{InsertError, Point, Quadtree, RemoveError, Square};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use util::{init_logging, pt};

fn region16() -> Quadtree {
    Quadtree::new(Square::new(Point::origin(), 16.0))
}

// Uniform points over an x-stripe, keeping y below 7.0 so probe points at
// y = 7.5 can never collide with an inserted one.
fn stripe_points(n: usize, x_lo: f64, x_hi: f64, seed: u64) -> Vec<Point> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n)
        .map(|_| pt(rng.gen_range(x_lo..x_hi), rng.gen_range(-7.9..7.0)))
        .collect()
}

#[test]
fn concurrent_disjoint_inserts_all_land() {
    init_logging();
    skipquad::thread_init();
    let tree = region16();

    let left = stripe_points(1000, -7.9, -0.1, 0xA);
    let right = stripe_points(1000, 0.1, 7.9, 0xB);

    thread::scope(|s| {
        let tree = &tree;
        for points in [&left, &right] {
            s.spawn(move || {
                skipquad::thread_init();
                for p in points {
                    // Contention-failure is a legal outcome of any write;
                    // this workload just tries again.
                    loop {
                        match tree.try_insert(*p) {
                            Ok(()) => break,
                            Err(InsertError::Contended) => {}
                            Err(e) => panic!("insert {:?} failed: {:?}", p, e),
                        }
                    }
                }
                skipquad::thread_finish();
            });
        }
    });

    // Quiescent now: every inserted point is present, probes elsewhere miss.
    for p in left.iter().chain(right.iter()) {
        assert!(tree.search(*p), "lost {:?}", p);
    }
    for i in 0..100 {
        assert!(!tree.search(pt(-7.0 + 0.14 * i as f64, 7.5)));
    }
    tree.check_invariants();
    skipquad::thread_finish();
}

#[test]
fn reader_never_loses_a_settled_point() {
    init_logging();
    let tree = region16();
    let needle = pt(0.0, 7.5);
    let planted = AtomicBool::new(false);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            skipquad::thread_init();
            assert!(tree.insert(needle));
            planted.store(true, Ordering::SeqCst);
            for p in stripe_points(10_000, -7.9, 7.9, 0xC) {
                tree.insert(p);
            }
            done.store(true, Ordering::SeqCst);
            skipquad::thread_finish();
        });

        s.spawn(|| {
            skipquad::thread_init();
            while !planted.load(Ordering::SeqCst) {
                thread::yield_now();
            }
            let mut observations = 0u64;
            while !done.load(Ordering::SeqCst) {
                assert!(tree.search(needle), "settled point vanished mid-churn");
                observations += 1;
            }
            assert!(observations > 0);
            skipquad::thread_finish();
        });
    });

    skipquad::thread_init();
    assert!(tree.search(needle));
    tree.check_invariants();
    skipquad::thread_finish();
}

// Four threads, each churning its own x-stripe with a 70/20/10
// search/insert/remove mix. Stripes are disjoint, so each thread can check
// every one of its searches against its own bookkeeping exactly; only
// cross-thread lock contention (which surfaces as `Contended`) is tolerated.
#[test]
fn mixed_workload_keeps_the_structure_sound() {
    init_logging();
    let tree = region16();
    const THREADS: usize = 4;
    const POOL: usize = 250;
    const OPS: usize = 10_000;

    let final_states: Vec<(Vec<Point>, Vec<bool>)> = thread::scope(|s| {
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let tree = &tree;
            handles.push(s.spawn(move || {
                skipquad::thread_init();
                let x_lo = -7.9 + 3.95 * t as f64;
                let pool = stripe_points(POOL, x_lo, x_lo + 3.75, t as u64);
                let mut present = vec![false; POOL];
                let mut rng = SmallRng::seed_from_u64(0xD00D + t as u64);

                for _ in 0..OPS {
                    let i = rng.gen_range(0..POOL);
                    let p = pool[i];
                    match rng.gen_range(0..100u32) {
                        0..=69 => {
                            // Nobody else touches this stripe, so a search
                            // must agree with our own ledger.
                            assert_eq!(tree.search(p), present[i], "at {:?}", p);
                        }
                        70..=89 => match tree.try_insert(p) {
                            Ok(()) => {
                                assert!(!present[i], "double insert landed at {:?}", p);
                                present[i] = true;
                            }
                            Err(InsertError::Duplicate) => assert!(present[i]),
                            Err(InsertError::Contended) => {}
                            Err(e) => panic!("unexpected {:?} at {:?}", e, p),
                        },
                        _ => match tree.try_remove(p) {
                            Ok(()) => {
                                assert!(present[i], "phantom remove at {:?}", p);
                                present[i] = false;
                            }
                            Err(RemoveError::NotFound) => assert!(!present[i]),
                            Err(RemoveError::Contended) => {}
                            Err(e) => panic!("unexpected {:?} at {:?}", e, p),
                        },
                    }
                }
                skipquad::thread_finish();
                (pool, present)
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // Post-quiescence, every thread's ledger matches the tree.
    skipquad::thread_init();
    for (pool, present) in &final_states {
        for (p, here) in pool.iter().zip(present.iter()) {
            assert_eq!(tree.search(*p), *here, "ledger mismatch at {:?}", p);
        }
    }
    tree.check_invariants();
    skipquad::thread_finish();
}
