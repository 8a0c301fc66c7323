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

#![allow(dead_code)]

use once_cell::sync::Lazy;
use skipquad::Point;

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

// Call at the top of every test so `RUST_LOG=skipquad=trace cargo test` shows
// what the retries are doing.
pub fn init_logging() {
    Lazy::force(&LOGGER);
}

pub fn pt(x: f64, y: f64) -> Point {
    Point::new([x, y])
}
