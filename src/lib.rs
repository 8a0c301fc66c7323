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

//! A concurrent [compressed skip quadtree](https://en.wikipedia.org/wiki/Quadtree)
//! for point data in a bounded D-dimensional region.
//!
//! # Quick Start
//! ```
//! use skipquad::{Point, Quadtree, Square};
//!
//! // Register this thread with the synchronization layer.
//! skipquad::thread_init();
//!
//! // Index points in a 16x16 region centered on the origin.
//! let tree = Quadtree::new(Square::new(Point::origin(), 16.0));
//!
//! assert!(tree.insert(Point::new([1.0, 1.0])));
//! assert!(tree.insert(Point::new([-3.0, 2.5])));
//!
//! assert!(tree.search(Point::new([1.0, 1.0])));
//! assert!(tree.remove(Point::new([1.0, 1.0])));
//! assert!(!tree.search(Point::new([1.0, 1.0])));
//!
//! skipquad::thread_finish();
//! ```
//!
//! # Structure
//!
//! Space is carved into a `2^DIMS`-ary tree of squares, *path-compressed*:
//! instead of a cascade of single-child squares between branch points, a
//! square is created only where points actually separate, with its side
//! length halved until the colliding siblings land in different quadrants.
//! Every square therefore keeps at least two children.
//!
//! Stacked on top of that is a skip structure. Level 0 indexes every point;
//! each insert then flips a coin and promotes its point one level per heads,
//! growing new (sparser) levels past the top as needed. Searches enter at the
//! topmost level and drop a level whenever a quadrant goes quiet, for
//! expected-logarithmic descent, the same way a skip list skips runs of a
//! linked list.
//!
//! # Concurrency
//!
//! All operations take `&self` and may be issued from any number of threads.
//! The synchronization discipline is optimistic, in the
//! [RLU](https://dl.acm.org/doi/10.1145/2815400.2815406) style: readers run
//! lock-free against a consistent snapshot, writers speculate on private
//! copies of the handful of nodes they touch and retry on conflict. Memory
//! reclamation is epoch-based; nodes stay readable until every reader that
//! could have observed them has drained.
//!
//! Each thread must call [`thread_init`] before its first operation and
//! [`thread_finish`] before it exits. The coin for level promotion comes from
//! a per-thread generator; [`thread_init_with_rng`] accepts any
//! [`rand::RngCore`], which is how the deterministic tests script the shape
//! of the tree.

// For extra-pedantic documentation tests.
#![doc(test(attr(deny(warnings))))]

pub mod error;
pub mod geometry;
pub mod rng;

mod node;
mod rlu;
mod tree;

pub use error::{InsertError, RemoveError};
pub use geometry::{Point, Square, SquareBuilder, DIMS, EPSILON, FANOUT};
pub use rlu::{thread_finish, thread_init, thread_init_with_rng};
pub use rng::{ScriptedRng, XorShift32};
pub use tree::{FreeReport, Quadtree};
