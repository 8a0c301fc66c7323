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

use crate::error::{InsertError, RemoveError};
use crate::geometry::{Point, Square, EPSILON, FANOUT};
use crate::node::{Node, NodeBody};
use crate::rlu::{self, ThreadCtx};
use log::{debug, trace, warn};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ptr;

// Attempt budget for a write before it surfaces contention-failure.
const MAX_RETRIES: usize = 10;

// Chance (out of 100) that an insert climbs one more level before
// materializing, which keeps the expected level count logarithmic.
const GROW_PCT: u32 = 50;

/// What a teardown freed. See [`Quadtree::free`].
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FreeReport {
    /// Every node freed, squares and leaves alike.
    pub total_nodes: u64,
    /// Leaves freed. A point materialized on `k` levels counts `k` times.
    pub leaf_nodes: u64,
    /// Level roots freed.
    pub levels: u64,
}

// Write-side failure inside a single attempt. `Contended` consumes retry
// budget; the others surface immediately.
enum AddFail {
    Duplicate,
    OutOfRange,
    Contended,
}

// Marker for a lock conflict (or a node that went away underneath us).
struct Contended;

impl From<Contended> for AddFail {
    fn from(_: Contended) -> Self {
        AddFail::Contended
    }
}

/// A concurrent, in-memory spatial index over points in a bounded
/// `DIMS`-dimensional region.
///
/// The structure is a *compressed skip quadtree*: level 0 holds every indexed
/// point, higher levels are progressively sparser copies used to accelerate
/// traversal, and every square has at least two children (degenerate
/// single-child squares are elided, so the path between branch points stays
/// short).
///
/// ```text
/// level 2:  [root]──────────────[A]
///              │                 │
/// level 1:  [root]────[sq]──[A]─[B]
///              │        │    │   │
/// level 0:  [root]────[sq]──[A]─[B]──[C]  ← every point lives here
/// ```
///
/// All three operations are safe to call from many threads at once; each
/// thread must bracket its lifetime with [`thread_init`]/[`thread_finish`].
/// Writers conflict optimistically: an insert or remove that keeps losing
/// node locks gives up after a bounded number of retries and reports
/// failure, leaving the tree unchanged.
///
/// ```
/// use skipquad::{Point, Quadtree, Square};
///
/// skipquad::thread_init();
///
/// // A 16x16 region centered on the origin.
/// let tree = Quadtree::new(Square::new(Point::origin(), 16.0));
///
/// assert!(tree.insert(Point::new([1.0, 1.0])));
/// assert!(!tree.insert(Point::new([1.0, 1.0]))); // duplicate
///
/// assert!(tree.search(Point::new([1.0, 1.0])));
/// assert!(!tree.search(Point::new([2.0, 2.0])));
///
/// assert!(tree.remove(Point::new([1.0, 1.0])));
/// assert!(!tree.search(Point::new([1.0, 1.0])));
///
/// skipquad::thread_finish();
/// ```
///
/// [`thread_init`]: crate::thread_init
/// [`thread_finish`]: crate::thread_finish
pub struct Quadtree {
    // The level-0 root square. Never freed before the tree itself; higher
    // level roots splice in above it via `up`.
    root: *mut Node,
    bounds: Square,
}

// The tree is a raw-pointer graph, but every structural mutation funnels
// through the synchronization layer, which is what makes sharing sound.
unsafe impl Send for Quadtree {}
unsafe impl Sync for Quadtree {}

impl Debug for Quadtree {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Quadtree {{ bounds: {:?} }}", self.bounds)
    }
}

impl Quadtree {
    // pub

    /// Creates an empty tree indexing the given region.
    pub fn new(bounds: Square) -> Self {
        Quadtree {
            root: Node::new_square(bounds),
            bounds,
        }
    }

    /// The region this tree indexes. Points outside it are rejected.
    pub fn bounds(&self) -> Square {
        self.bounds
    }

    /// Whether a point equal to `p` (within tolerance) is indexed.
    ///
    /// Read-only: never takes locks and never blocks writers.
    pub fn search(&self, p: Point) -> bool {
        rlu::with_ctx(|ctx| {
            ctx.begin();
            let found = unsafe { self.search_impl(ctx, &p) };
            ctx.end();
            found
        })
    }

    /// Indexes `p`. Returns an error instead of `false`; see
    /// [`InsertError`] for the taxonomy.
    pub fn try_insert(&self, p: Point) -> Result<(), InsertError> {
        if !self.bounds.contains(&p) {
            return Err(InsertError::OutOfBounds);
        }
        rlu::with_ctx(|ctx| {
            for attempt in 0..MAX_RETRIES {
                ctx.begin();
                match unsafe { self.insert_impl(ctx, &p) } {
                    Ok(()) => {
                        ctx.end();
                        return Ok(());
                    }
                    Err(AddFail::Duplicate) => {
                        ctx.abort();
                        return Err(InsertError::Duplicate);
                    }
                    Err(AddFail::OutOfRange) => {
                        ctx.abort();
                        return Err(InsertError::OutOfBounds);
                    }
                    Err(AddFail::Contended) => {
                        ctx.abort();
                        trace!("insert of {:?}: retry {}", p, attempt + 1);
                    }
                }
            }
            warn!("insert of {:?} abandoned after {} attempts", p, MAX_RETRIES);
            Err(InsertError::Contended)
        })
    }

    /// Indexes `p`. `false` means duplicate, out-of-range, or a write that
    /// lost every retry; either way the tree is unchanged.
    pub fn insert(&self, p: Point) -> bool {
        self.try_insert(p).is_ok()
    }

    /// Unindexes the point equal to `p` (within tolerance). See
    /// [`RemoveError`] for the taxonomy.
    pub fn try_remove(&self, p: Point) -> Result<(), RemoveError> {
        if !self.bounds.contains(&p) {
            return Err(RemoveError::OutOfBounds);
        }
        rlu::with_ctx(|ctx| {
            for attempt in 0..MAX_RETRIES {
                ctx.begin();
                match unsafe { self.remove_impl(ctx, &p) } {
                    Ok(true) => {
                        ctx.end();
                        return Ok(());
                    }
                    Ok(false) => {
                        ctx.abort();
                        return Err(RemoveError::NotFound);
                    }
                    Err(Contended) => {
                        ctx.abort();
                        trace!("remove of {:?}: retry {}", p, attempt + 1);
                    }
                }
            }
            warn!("remove of {:?} abandoned after {} attempts", p, MAX_RETRIES);
            Err(RemoveError::Contended)
        })
    }

    /// Unindexes `p`. `false` means the point was absent, out-of-range, or
    /// the write lost every retry.
    pub fn remove(&self, p: Point) -> bool {
        self.try_remove(p).is_ok()
    }

    /// Tears the whole structure down and reports what was freed.
    ///
    /// Not thread-safe: the caller must guarantee quiescence (no operation in
    /// flight on any thread). The synchronization layer is bypassed entirely.
    /// Dropping the tree performs the same walk without the report.
    pub fn free(self) -> FreeReport {
        let report = unsafe { free_levels(self.root) };
        debug!(
            "tore down {} nodes ({} leaves) across {} levels",
            report.total_nodes, report.leaf_nodes, report.levels
        );
        std::mem::forget(self);
        report
    }

    /// Audits every structural invariant: parent back-references, quadrant
    /// assignment, cross-level pairing, compression, and per-level point
    /// uniqueness. Panics on the first violation.
    ///
    /// A debugging and test aid; requires quiescence, like [`Quadtree::free`].
    pub fn check_invariants(&self) {
        unsafe {
            let mut roots = vec![self.root];
            while !(*(*roots.last().unwrap())).body.up.is_null() {
                roots.push((*(*roots.last().unwrap())).body.up);
            }
            for (level, &root) in roots.iter().enumerate() {
                assert!(
                    (*root).body.parent.is_null(),
                    "level {} root has a parent",
                    level
                );
                let mut leaves = Vec::new();
                audit_node(root, true, &mut leaves);
                leaves.sort_by(|a, b| a.eps_cmp(b));
                for pair in leaves.windows(2) {
                    assert!(
                        !pair[0].eps_eq(&pair[1]),
                        "level {} indexes {:?} twice",
                        level,
                        pair[0]
                    );
                }
            }
        }
    }

    // fn

    unsafe fn search_impl(&self, ctx: &ThreadCtx, p: &Point) -> bool {
        let mut node = self.top(ctx);
        loop {
            let mut view = ctx.deref(node);
            if !(*view).body.bounds.contains(p) {
                return false;
            }
            // Horizontal walk: sink into ever-smaller squares that still
            // contain p.
            loop {
                let quadrant = (*view).body.bounds.quadrant_of(p);
                let child = (*view).body.children[quadrant];
                if child.is_null() {
                    break;
                }
                let cview = ctx.deref(child);
                if (*cview).body.is_square() && (*cview).body.bounds.contains(p) {
                    view = cview;
                    continue;
                }
                if (*cview).body.is_leaf() && (*cview).body.bounds.center().eps_eq(p) {
                    return true;
                }
                break;
            }
            // Not on this level; the image below is denser.
            let down = (*view).body.down;
            if down.is_null() {
                return false;
            }
            node = down;
        }
    }

    // The write side of insert, one attempt. Climbs a coin-chosen number of
    // levels (growing new ones past the top), then materializes the point on
    // the chosen level and every level beneath it.
    unsafe fn insert_impl(&self, ctx: &mut ThreadCtx, p: &Point) -> Result<(), AddFail> {
        let mut node = self.root;
        while ctx.rng_u32() % 100 < GROW_PCT {
            let view = ctx.deref(node);
            let up = (*view).body.up;
            if !up.is_null() {
                node = up;
                continue;
            }
            let copy = lock_live(ctx, node)?;
            if (*copy).body.up.is_null() {
                let top = ctx.alloc(Node::new_square((*copy).body.bounds));
                (*top).body.down = node;
                (*copy).body.up = top;
                trace!("grew level above {:?}", (*copy).body.bounds);
                node = top;
            } else {
                node = (*copy).body.up;
            }
        }

        // If the coin stopped short of the top, the levels above the chosen
        // one are traversed but not materialized.
        let mut gap_depth: u64 = 0;
        loop {
            let view = ctx.deref(node);
            let up = (*view).body.up;
            if up.is_null() {
                break;
            }
            gap_depth += 1;
            node = up;
        }

        self.add_at(ctx, node, p, gap_depth).map(|_| ())
    }

    // Materializes p on this level (when `gap_depth` is zero) and recursively
    // on every level below, lower levels first so each new node can take the
    // node below it as its `down` image. Returns the node materialized on
    // this level, or the pass-through from below on skipped levels.
    unsafe fn add_at(
        &self,
        ctx: &mut ThreadCtx,
        node: *mut Node,
        p: &Point,
        gap_depth: u64,
    ) -> Result<*mut Node, AddFail> {
        let nview = ctx.deref(node);
        if !(*nview).body.bounds.contains(p) {
            return Err(AddFail::OutOfRange);
        }

        // Horizontal walk to the deepest square containing p.
        let mut parent = node;
        let mut pview = nview;
        let mut found = (*pview).body.children[(*pview).body.bounds.quadrant_of(p)];
        loop {
            if found.is_null() {
                break;
            }
            let fview = ctx.deref(found);
            if !(*fview).body.is_square() || !(*fview).body.bounds.contains(p) {
                break;
            }
            parent = found;
            pview = fview;
            found = (*fview).body.children[(*fview).body.bounds.quadrant_of(p)];
        }

        if gap_depth == 0 && !found.is_null() {
            let fview = ctx.deref(found);
            if (*fview).body.is_leaf() && (*fview).body.bounds.center().eps_eq(p) {
                return Err(AddFail::Duplicate);
            }
        }

        // Lower levels first.
        let down = (*pview).body.down;
        let down_node = if !down.is_null() {
            self.add_at(ctx, down, p, gap_depth.saturating_sub(1))?
        } else {
            ptr::null_mut()
        };

        if gap_depth > 0 {
            return Ok(down_node);
        }

        // Install under the locked parent. The slot is re-read from the
        // locked copy: the unlocked walk above may be stale.
        let pcopy = lock_live(ctx, parent)?;
        let pbounds = (*pcopy).body.bounds;
        let quadrant = pbounds.quadrant_of(p);
        let slot = (*pcopy).body.children[quadrant];

        if !slot.is_null() {
            let sview = ctx.deref(slot);
            if (*sview).body.is_leaf() && (*sview).body.bounds.center().eps_eq(p) {
                // A concurrent insert of the same point won the race.
                return Err(AddFail::Duplicate);
            }
            if (*sview).body.is_square() && (*sview).body.bounds.contains(p) {
                // The slot deepened since the walk; start over.
                return Err(AddFail::Contended);
            }
        }

        let new_node = ctx.alloc(Node::new_leaf(Square::new(*p, pbounds.length() * 0.5)));
        (*new_node).body.parent = parent;
        if !down_node.is_null() {
            debug_assert!(ctx.is_fresh(down_node));
            (*new_node).body.down = down_node;
            (*down_node).body.up = new_node;
        }

        if slot.is_null() {
            (*pcopy).body.children[quadrant] = new_node;
            return Ok(new_node);
        }

        // The slot is taken: synthesize the compressed split square, shrunk
        // until the new point and the sitting tenant separate.
        let sibling = slot;
        let sibling_center = (*ctx.deref(sibling)).body.bounds.center();
        let mut sq_bounds = pbounds.child(quadrant);
        let (new_quadrant, sibling_quadrant) = loop {
            let nq = sq_bounds.quadrant_of(p);
            let sq = sq_bounds.quadrant_of(&sibling_center);
            if nq != sq {
                break (nq, sq);
            }
            sq_bounds = sq_bounds.child(nq);
        };

        let square = ctx.alloc(Node::new_square(sq_bounds));
        (*square).body.parent = parent;
        (*square).body.children[new_quadrant] = new_node;
        (*square).body.children[sibling_quadrant] = sibling;

        // Off the bottom level, the same split square exists beneath us (the
        // lower levels were materialized first); find it and pair up.
        let parent_down = (*pcopy).body.down;
        if !parent_down.is_null() {
            let mut below = parent_down;
            loop {
                let bview = ctx.deref(below);
                let bbounds = (*bview).body.bounds;
                if bbounds.center().eps_eq(&sq_bounds.center())
                    && (bbounds.length() - sq_bounds.length()).abs() <= EPSILON
                {
                    break;
                }
                let next = (*bview).body.children[bbounds.quadrant_of(&sq_bounds.center())];
                if next.is_null() {
                    // The level below shifted underneath us.
                    return Err(AddFail::Contended);
                }
                below = next;
            }
            (*square).body.down = below;
            let bcopy = lock_live(ctx, below)?;
            (*bcopy).body.up = square;
        }

        (*pcopy).body.children[quadrant] = square;
        (*new_node).body.parent = square;
        let scopy = lock_live(ctx, sibling)?;
        (*scopy).body.parent = square;

        Ok(new_node)
    }

    // The write side of remove, one attempt: locate the highest image of the
    // leaf, then cascade. Ok(false) is a clean miss.
    unsafe fn remove_impl(&self, ctx: &mut ThreadCtx, p: &Point) -> Result<bool, Contended> {
        let mut node = self.top(ctx);
        loop {
            let mut view = ctx.deref(node);
            if !(*view).body.bounds.contains(p) {
                return Ok(false);
            }
            loop {
                let quadrant = (*view).body.bounds.quadrant_of(p);
                let child = (*view).body.children[quadrant];
                if child.is_null() {
                    break;
                }
                let cview = ctx.deref(child);
                if (*cview).body.is_square() && (*cview).body.bounds.contains(p) {
                    view = cview;
                    continue;
                }
                if (*cview).body.is_leaf() && (*cview).body.bounds.center().eps_eq(p) {
                    return self.remove_node(ctx, child);
                }
                break;
            }
            let down = (*view).body.down;
            if down.is_null() {
                return Ok(false);
            }
            node = down;
        }
    }

    // Unlinks `node` and cascades: promotes a lone surviving child, clears
    // the parent slot, detaches the up/down pairings, prunes a parent left
    // under-full, and repeats on the node's images on adjacent levels.
    // Ok(false) refuses without touching anything (level roots, squares that
    // still branch).
    unsafe fn remove_node(&self, ctx: &mut ThreadCtx, node: *mut Node) -> Result<bool, Contended> {
        if ctx.is_freed(node) {
            // A prior cascade step in this same session already took it.
            return Ok(false);
        }

        let ncopy = lock_live(ctx, node)?;
        if (*ncopy).body.down.is_null() && (*ncopy).body.parent.is_null() {
            return Ok(false);
        }

        if (*ncopy).body.is_square() {
            let count = (*ncopy).body.child_count();
            if count > 1 {
                return Ok(false);
            }
            if count == 1 {
                // A root copy with one child stays; there is nowhere to
                // promote the survivor to.
                if (*ncopy).body.parent.is_null() {
                    return Ok(false);
                }
                let survivor = *(*ncopy)
                    .body
                    .children
                    .iter()
                    .find(|c| !c.is_null())
                    .expect("count was one");
                let parent = (*ncopy).body.parent;
                let pcopy = lock_live(ctx, parent)?;
                let quadrant = (*pcopy)
                    .body
                    .bounds
                    .quadrant_of(&(*ncopy).body.bounds.center());
                if (*pcopy).body.children[quadrant] != node {
                    return Err(Contended);
                }
                let scopy = lock_live(ctx, survivor)?;
                (*pcopy).body.children[quadrant] = survivor;
                (*scopy).body.parent = parent;
                (*ncopy).body.parent = ptr::null_mut();
            }
        }

        // Clear the parent's slot, unless a promotion already rewrote it.
        let parent = (*ncopy).body.parent;
        if !parent.is_null() {
            let pcopy = lock_live(ctx, parent)?;
            let quadrant = (*pcopy)
                .body
                .bounds
                .quadrant_of(&(*ncopy).body.bounds.center());
            if (*pcopy).body.children[quadrant] == node {
                (*pcopy).body.children[quadrant] = ptr::null_mut();
            }
        }

        // Detach the level pairings.
        let up = (*ncopy).body.up;
        let down = (*ncopy).body.down;
        if !up.is_null() {
            let ucopy = lock_live(ctx, up)?;
            (*ucopy).body.down = ptr::null_mut();
            (*ncopy).body.up = ptr::null_mut();
        }
        if !down.is_null() {
            let dcopy = lock_live(ctx, down)?;
            (*dcopy).body.up = ptr::null_mut();
            (*ncopy).body.down = ptr::null_mut();
        }

        (*ncopy).body.dirty = true;
        ctx.free(node);

        // Keep the level compressed: a parent left with fewer than two
        // children folds away.
        if !parent.is_null() {
            let pview = ctx.deref(parent);
            if (*pview).body.child_count() < 2 {
                self.remove_node(ctx, parent)?;
            }
        }

        // The images on adjacent levels go too (they refuse on their own if
        // they still branch).
        if !up.is_null() {
            self.remove_node(ctx, up)?;
        }
        if !down.is_null() {
            self.remove_node(ctx, down)?;
        }

        Ok(true)
    }

    // Ascends from the level-0 root to the current topmost root.
    unsafe fn top(&self, ctx: &ThreadCtx) -> *mut Node {
        let mut node = self.root;
        loop {
            let view = ctx.deref(node);
            let up = (*view).body.up;
            if up.is_null() {
                return node;
            }
            node = up;
        }
    }
}

impl Drop for Quadtree {
    fn drop(&mut self) {
        unsafe {
            free_levels(self.root);
        }
    }
}

// Locks `node` for writing, tolerating nodes allocated in this session
// (still private, mutated in place). Locking a node another remove already
// unlinked counts as a conflict.
unsafe fn lock_live(ctx: &mut ThreadCtx, node: *mut Node) -> Result<*mut Node, Contended> {
    if ctx.is_fresh(node) {
        return Ok(node);
    }
    let copy = ctx.try_lock(node).ok_or(Contended)?;
    if (*copy).body.dirty {
        return Err(Contended);
    }
    Ok(copy)
}

// Teardown walk: top level first, each level's subtree recursively. The
// synchronization layer is bypassed; the caller guarantees quiescence.
unsafe fn free_levels(root: *mut Node) -> FreeReport {
    let mut report = FreeReport::default();
    let mut top = root;
    while !(*top).body.up.is_null() {
        top = (*top).body.up;
    }
    let mut level = top;
    while !level.is_null() {
        let next = (*level).body.down;
        free_subtree(level, &mut report);
        report.levels += 1;
        level = next;
    }
    report
}

unsafe fn free_subtree(node: *mut Node, report: &mut FreeReport) {
    for quadrant in 0..FANOUT {
        let child = (*node).body.children[quadrant];
        if !child.is_null() {
            free_subtree(child, report);
            (*node).body.children[quadrant] = ptr::null_mut();
        }
    }
    // The level above is already gone; only the image below still points at
    // this node.
    let down = (*node).body.down;
    if !down.is_null() {
        (*down).body.up = ptr::null_mut();
    }
    report.total_nodes += 1;
    if (*node).body.is_leaf() {
        report.leaf_nodes += 1;
    }
    drop(Box::from_raw(node));
}

// One level's recursive structural audit; collects leaf centers for the
// per-level uniqueness check.
unsafe fn audit_node(node: *mut Node, is_root: bool, leaves: &mut Vec<Point>) {
    let body: &NodeBody = &(*node).body;
    assert!(!body.dirty, "reachable node is marked dirty");

    if !body.down.is_null() {
        let below = &(*body.down).body;
        assert_eq!(below.up, node, "down image does not point back up");
        assert!(
            below.bounds.center().eps_eq(&body.bounds.center()),
            "down image drifted: {:?} vs {:?}",
            below.bounds,
            body.bounds
        );
        if body.is_square() {
            assert!(
                (below.bounds.length() - body.bounds.length()).abs() <= EPSILON,
                "down image resized: {:?} vs {:?}",
                below.bounds,
                body.bounds
            );
        }
    }

    if body.is_leaf() {
        leaves.push(body.bounds.center());
        return;
    }

    if !is_root {
        assert!(
            body.child_count() >= 2,
            "non-root square {:?} is uncompressed",
            body.bounds
        );
    }

    for (quadrant, &child) in body.children.iter().enumerate() {
        if child.is_null() {
            continue;
        }
        let cb = &(*child).body;
        assert_eq!(cb.parent, node, "child does not point back at its parent");
        assert_eq!(
            body.bounds.quadrant_of(&cb.bounds.center()),
            quadrant,
            "child {:?} filed under the wrong quadrant of {:?}",
            cb.bounds,
            body.bounds
        );
        assert!(
            body.bounds.contains(&cb.bounds.center()),
            "child center {:?} escapes {:?}",
            cb.bounds,
            body.bounds
        );
        if cb.is_square() {
            assert!(
                cb.bounds.length() <= body.bounds.length() * 0.5 + EPSILON,
                "child square {:?} did not halve from {:?}",
                cb.bounds,
                body.bounds
            );
        }
        audit_node(child, false, leaves);
    }
}
