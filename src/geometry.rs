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

//! Geometry primitives: points and axis-aligned squares in `DIMS`-dimensional
//! space.
//!
//! Containment ([`Square::contains`]) is low-inclusive and strictly
//! high-exclusive, with no tolerance. Quadrant assignment
//! ([`Square::quadrant_of`]) uses an `EPSILON`-tolerant greater-or-equal so a
//! point never ties with a center computed from it. Callers check containment
//! before computing a quadrant, so a point exactly on the high edge is
//! rejected before quadrant assignment ever sees it.

use derive_builder::Builder;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Debug;

/// The number of spatial dimensions. Each square subdivides into
/// `2^DIMS` quadrants.
pub const DIMS: usize = 2;

/// The number of child slots per square, `2^DIMS`.
pub const FANOUT: usize = 1 << DIMS;

/// Coordinate comparison tolerance. Two points whose coordinates all differ
/// by at most this much are considered the same point.
pub const EPSILON: f64 = 1e-6;

/// A point in `DIMS`-dimensional space. Lightweight, should be passed by
/// value.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(PartialEq, Clone, Copy)]
pub struct Point {
    coords: [f64; DIMS],
}

impl Debug for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.coords)
    }
}

impl From<[f64; DIMS]> for Point {
    fn from(coords: [f64; DIMS]) -> Self {
        Point { coords }
    }
}

impl std::ops::Index<usize> for Point {
    type Output = f64;
    fn index(&self, i: usize) -> &f64 {
        &self.coords[i]
    }
}

impl Point {
    /// Constructs a point from its coordinate array.
    /// ```
    /// use skipquad::Point;
    ///
    /// let p = Point::new([1.0, -2.5]);
    /// assert_eq!(p[0], 1.0);
    /// assert_eq!(p[1], -2.5);
    /// ```
    pub fn new(coords: [f64; DIMS]) -> Self {
        Point { coords }
    }

    /// The all-zeroes point.
    pub fn origin() -> Self {
        Point {
            coords: [0.0; DIMS],
        }
    }

    /// The underlying coordinates.
    pub fn coords(&self) -> &[f64; DIMS] {
        &self.coords
    }

    /// Whether two points are the same point, i.e. every coordinate pair
    /// differs by at most [`EPSILON`].
    pub fn eps_eq(&self, other: &Point) -> bool {
        self.coords
            .iter()
            .zip(other.coords.iter())
            .all(|(a, b)| (a - b).abs() <= EPSILON)
    }

    /// Lexicographic comparison under the same tolerance as [`Point::eps_eq`]:
    /// coordinates within [`EPSILON`] of each other are treated as ties and
    /// the next dimension decides.
    pub fn eps_cmp(&self, other: &Point) -> Ordering {
        for i in 0..DIMS {
            let d = self.coords[i] - other.coords[i];
            if d.abs() > EPSILON {
                return if d > 0.0 {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
            }
        }
        Ordering::Equal
    }
}

/// An axis-aligned square region, defined by its center and side length.
///
/// Lightweight, should be passed by value. The boundaries sit `length / 2`
/// from the center in every dimension.
///
/// ```
/// use skipquad::{Point, SquareBuilder};
///
/// let sq = SquareBuilder::default()
///     .center(Point::origin())
///     .length(2.0)
///     .build()
///     .unwrap();
///
/// assert!(sq.contains(&Point::new([-1.0, -1.0])));
/// assert!(!sq.contains(&Point::new([-1.0, 1.0])));
/// ```
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Builder, PartialEq, Clone, Copy)]
#[builder(build_fn(validate = "SquareBuilder::check"))]
pub struct Square {
    center: Point,
    length: f64,
}

impl Debug for Square {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({:?})->{:?}", self.center, self.length)
    }
}

impl SquareBuilder {
    fn check(&self) -> Result<(), String> {
        if let Some(length) = self.length {
            if !length.is_finite() || length <= 0.0 {
                return Err(format!(
                    "square length must be finite and positive, got {}",
                    length
                ));
            }
        }
        if let Some(center) = self.center {
            if center.coords().iter().any(|c| !c.is_finite()) {
                return Err(format!("square center must be finite, got {:?}", center));
            }
        }
        Ok(())
    }
}

impl Square {
    /// Constructs a new [`Square`].
    /// # Panics
    /// Panics if the length is not finite and positive, or the center not
    /// finite. Use [`SquareBuilder`] for a fallible construction.
    pub fn new(center: Point, length: f64) -> Self {
        SquareBuilder::default()
            .center(center)
            .length(length)
            .build()
            .expect("invalid square")
    }

    /// The geometric center of the region.
    pub fn center(&self) -> Point {
        self.center
    }

    /// The side length of the region.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// Whether `p` lies within the region: low boundaries count as inside,
    /// high boundaries do not.
    pub fn contains(&self, p: &Point) -> bool {
        let bound = self.length * 0.5;
        for i in 0..DIMS {
            if self.center[i] - bound > p[i] || self.center[i] + bound <= p[i] {
                return false;
            }
        }
        true
    }

    /// The quadrant `p` falls in, relative to the center.
    ///
    /// Bit `i` of the result is set iff `p` is on the high side of the center
    /// in dimension `i`, where "high side" is `p[i] >= center[i] - EPSILON`.
    pub fn quadrant_of(&self, p: &Point) -> usize {
        let mut quadrant = 0;
        for i in 0..DIMS {
            quadrant |= ((p[i] >= self.center[i] - EPSILON) as usize) << i;
        }
        quadrant
    }

    /// The center of child quadrant `quadrant`, a square with half this
    /// square's length.
    pub fn child_center(&self, quadrant: usize) -> Point {
        let mut coords = [0.0; DIMS];
        for i in 0..DIMS {
            coords[i] = self.center[i] + (((quadrant >> i) & 1) as f64 - 0.5) * 0.5 * self.length;
        }
        Point::new(coords)
    }

    /// The sub-square covering child quadrant `quadrant`.
    pub fn child(&self, quadrant: usize) -> Square {
        Square {
            center: self.child_center(quadrant),
            length: self.length * 0.5,
        }
    }
}
