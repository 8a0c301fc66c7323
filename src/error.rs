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

//! Failure taxonomy for the write operations.
//!
//! Every failure leaves the tree unchanged: speculative writes either commit
//! atomically or are discarded wholesale. The boolean convenience API
//! collapses these to `false`; use the `try_` forms to tell them apart.

use thiserror::Error;

/// Why an insert did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InsertError {
    /// A point equal (within tolerance) to the argument is already indexed.
    #[error("point is already present")]
    Duplicate,
    /// The point lies outside the root square.
    #[error("point lies outside the indexed region")]
    OutOfBounds,
    /// Every retry ran into a conflicting writer.
    #[error("write contention exhausted the retry budget")]
    Contended,
}

/// Why a remove did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RemoveError {
    /// No point equal (within tolerance) to the argument is indexed.
    #[error("point is not present")]
    NotFound,
    /// The point lies outside the root square.
    #[error("point lies outside the indexed region")]
    OutOfBounds,
    /// Every retry ran into a conflicting writer.
    #[error("write contention exhausted the retry budget")]
    Contended,
}
