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

// The node layout for the skip structure. A node is either an internal region
// (square) or a stored datum (leaf); both carry the same link set so a level
// reads as one 2^DIMS-ary tree and the levels chain through `up`/`down`.
//
// The graph is cyclic through `parent`/`up`/`down`, so nodes are plain heap
// allocations handled through raw pointers; lifetime is governed by the
// synchronization layer's quiescence protocol, never by reference counting.

use crate::geometry::{Square, FANOUT};
use crate::rlu::LockHeader;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum NodeKind {
    Square,
    Leaf,
}

// The mutable portion of a node. Kept `Copy` so the synchronization layer can
// snapshot it into a private copy and write the whole thing back on commit.
#[derive(Clone, Copy)]
pub(crate) struct NodeBody {
    pub kind: NodeKind,
    // Set under lock when the node is unlinked; a writer that locks a dirty
    // node must abort, since the node is no longer reachable.
    pub dirty: bool,
    // Region if a square; for a leaf, `bounds.center()` is the stored datum
    // and the length is unused.
    pub bounds: Square,
    // Enclosing square on the same level; null at a level root.
    pub parent: *mut Node,
    // The node's image one level above / below, if any.
    pub up: *mut Node,
    pub down: *mut Node,
    // One slot per quadrant. All null for leaves.
    pub children: [*mut Node; FANOUT],
}

pub(crate) struct Node {
    pub hdr: LockHeader,
    pub body: NodeBody,
}

impl NodeBody {
    pub fn is_square(&self) -> bool {
        self.kind == NodeKind::Square
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| !c.is_null()).count()
    }
}

impl Node {
    fn boxed(kind: NodeKind, bounds: Square) -> *mut Node {
        Box::into_raw(Box::new(Node {
            hdr: LockHeader::origin(),
            body: NodeBody {
                kind,
                dirty: false,
                bounds,
                parent: std::ptr::null_mut(),
                up: std::ptr::null_mut(),
                down: std::ptr::null_mut(),
                children: [std::ptr::null_mut(); FANOUT],
            },
        }))
    }

    pub fn new_leaf(bounds: Square) -> *mut Node {
        Self::boxed(NodeKind::Leaf, bounds)
    }

    pub fn new_square(bounds: Square) -> *mut Node {
        Self::boxed(NodeKind::Square, bounds)
    }
}
