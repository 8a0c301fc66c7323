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

//! Random sources for level selection.
//!
//! The tree draws its level-promotion coin from whatever [`rand::RngCore`]
//! the thread context carries, so benchmarks and tests can substitute their
//! own generators. [`XorShift32`] is the default; [`ScriptedRng`] replays a
//! fixed sequence for deterministic tests.

use rand::{Error, RngCore};

/// A Marsaglia xorshift generator over 32-bit state.
///
/// Small, fast and good enough for coin flips; each thread owns one, seeded
/// independently, so level selection never contends on shared RNG state.
#[derive(Debug, Clone)]
pub struct XorShift32 {
    seed: u32,
}

impl XorShift32 {
    /// Creates a generator from an explicit seed. A zero seed is bumped to
    /// one, since xorshift fixes zero.
    pub fn new(seed: u32) -> Self {
        XorShift32 {
            seed: if seed == 0 { 1 } else { seed },
        }
    }

    /// Creates a generator seeded from system entropy.
    pub fn from_entropy() -> Self {
        Self::new(rand::random())
    }
}

impl RngCore for XorShift32 {
    fn next_u32(&mut self) -> u32 {
        let mut x = self.seed;
        x ^= x << 6;
        x ^= x >> 21;
        x ^= x << 7;
        self.seed = if x == 0 { 1 } else { x };
        x & 0x7FFF_FFFF
    }

    fn next_u64(&mut self) -> u64 {
        (u64::from(self.next_u32()) << 32) | u64::from(self.next_u32())
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let word = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// Replays a fixed sequence of draws, cycling when it runs out.
///
/// Feeding the level-selection coin a known sequence makes the skip
/// structure's shape deterministic, which is what the structural tests rely
/// on.
#[derive(Debug, Clone)]
pub struct ScriptedRng {
    feed: Vec<u32>,
    next: usize,
}

impl ScriptedRng {
    /// # Panics
    /// Panics if `feed` is empty.
    pub fn new(feed: Vec<u32>) -> Self {
        assert!(!feed.is_empty(), "scripted sequence must not be empty");
        ScriptedRng { feed, next: 0 }
    }
}

impl RngCore for ScriptedRng {
    fn next_u32(&mut self) -> u32 {
        let value = self.feed[self.next];
        self.next = (self.next + 1) % self.feed.len();
        value
    }

    fn next_u64(&mut self) -> u64 {
        (u64::from(self.next_u32()) << 32) | u64::from(self.next_u32())
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let word = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift_is_deterministic_per_seed() {
        let mut a = XorShift32::new(12345);
        let mut b = XorShift32::new(12345);
        for _ in 0..100 {
            debug_assert_eq!(a.next_u32(), b.next_u32());
        }
        // And the sign bit is masked off.
        let mut c = XorShift32::new(u32::MAX);
        for _ in 0..100 {
            debug_assert!(c.next_u32() <= 0x7FFF_FFFF);
        }
    }

    #[test]
    fn xorshift_zero_seed_is_bumped() {
        let mut rng = XorShift32::new(0);
        debug_assert_eq!(rng.next_u32(), XorShift32::new(1).next_u32());
    }

    #[test]
    fn scripted_sequence_cycles() {
        let mut rng = ScriptedRng::new(vec![1, 2, 3]);
        debug_assert_eq!(rng.next_u32(), 1);
        debug_assert_eq!(rng.next_u32(), 2);
        debug_assert_eq!(rng.next_u32(), 3);
        debug_assert_eq!(rng.next_u32(), 1);
    }
}
