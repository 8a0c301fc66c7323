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

//! The optimistic read/write layer, in the read-log-update (RLU) style.
//!
//! Every operation runs inside a *session* bracketed by [`ThreadCtx::begin`]
//! and [`ThreadCtx::end`]. Within a session:
//!
//! - [`ThreadCtx::deref`] resolves a node pointer against in-flight writers:
//!   it returns the node itself when unlocked, the calling thread's own
//!   private copy when self-locked, or a committing writer's copy when that
//!   writer's write-clock says the copy belongs to this session's snapshot.
//!   Readers never take locks and never block.
//! - [`ThreadCtx::try_lock`] claims exclusive write intent on a node by
//!   publishing a private copy of it through a CAS on the node's header.
//!   Mutations go to the copy (plain stores; they become visible atomically
//!   at commit). Locking is idempotent within a session. A failed CAS means
//!   another writer holds the node and the caller must [`ThreadCtx::abort`].
//! - Commit ([`ThreadCtx::end`] on a session that locked anything) closes the
//!   session, stamps a write-clock, advances the global clock, waits for
//!   readers whose snapshot predates the commit to drain, writes every copy
//!   back over its original and releases the locks.
//!
//! Superseded copies and nodes freed by a writer are retired through
//! `crossbeam-epoch`: each session pins an epoch guard, so retired memory
//! outlives every reader that could still observe it. That reproduces the
//! safe-reclamation contract without per-node reference counts.

use crate::node::Node;
use crate::rng::XorShift32;
use crossbeam_epoch::{self as epoch, Guard};
use log::debug;
use parking_lot::Mutex;
use rand::RngCore;
use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

static GLOBAL_CLOCK: AtomicU64 = AtomicU64::new(0);
static REGISTRY: Mutex<Vec<Arc<ThreadState>>> = Mutex::new(Vec::new());

// Per-node lock word plus the back-references a private copy needs. On a
// node that is part of the tree ("original"), `actual` and `writer` are null
// and `copy` points at the locking writer's private copy, if any. On a copy,
// `copy` stays null, `actual` points back at the original and `writer` at the
// owning thread's registered state.
pub(crate) struct LockHeader {
    copy: AtomicPtr<Node>,
    actual: *mut Node,
    writer: *const ThreadState,
}

impl LockHeader {
    pub(crate) fn origin() -> Self {
        LockHeader {
            copy: AtomicPtr::new(ptr::null_mut()),
            actual: ptr::null_mut(),
            writer: ptr::null(),
        }
    }

    fn for_copy(actual: *mut Node, writer: *const ThreadState) -> Self {
        LockHeader {
            copy: AtomicPtr::new(ptr::null_mut()),
            actual,
            writer,
        }
    }
}

// The slice of per-thread state other threads look at: the quiescence
// protocol reads these while a writer drains stragglers.
pub(crate) struct ThreadState {
    active: AtomicBool,
    // Odd while the thread is inside a session.
    run_count: AtomicU64,
    // Global-clock snapshot taken at session start.
    local_clock: AtomicU64,
    // Commit stamp; u64::MAX outside a commit window, so an uncommitted
    // copy is never stolen.
    write_clock: AtomicU64,
}

impl ThreadState {
    fn new() -> Self {
        ThreadState {
            active: AtomicBool::new(true),
            run_count: AtomicU64::new(0),
            local_clock: AtomicU64::new(0),
            write_clock: AtomicU64::new(u64::MAX),
        }
    }
}

/// The per-thread context: registered shared state, the thread's RNG, and the
/// logs of the session in flight.
pub(crate) struct ThreadCtx {
    state: Arc<ThreadState>,
    rng: Box<dyn RngCore + Send>,
    session_clock: u64,
    guard: Option<Guard>,
    // Private copies published by try_lock this session.
    write_log: Vec<*mut Node>,
    // Nodes allocated this session; unreachable until a copy commits, so an
    // abort frees them directly.
    alloc_log: Vec<*mut Node>,
    // Nodes unlinked this session; retired once the commit drains readers.
    free_log: Vec<*mut Node>,
}

thread_local! {
    static CTX: RefCell<Option<ThreadCtx>> = RefCell::new(None);
}

/// Registers the calling thread with the synchronization layer, seeding its
/// level-selection RNG from system entropy. Must be called before the thread
/// issues any tree operation; pair with [`thread_finish`] before the thread
/// exits.
///
/// Calling this on an already-registered thread just replaces the RNG.
pub fn thread_init() {
    thread_init_with_rng(Box::new(XorShift32::from_entropy()));
}

/// Like [`thread_init`], but with a caller-supplied generator. Tests inject a
/// scripted sequence here; any [`rand::RngCore`] works.
pub fn thread_init_with_rng(rng: Box<dyn RngCore + Send>) {
    CTX.with(|cell| {
        let mut slot = cell.borrow_mut();
        match slot.as_mut() {
            Some(ctx) => ctx.rng = rng,
            None => *slot = Some(ThreadCtx::register(rng)),
        }
    });
}

/// Deregisters the calling thread. No session may be in flight.
pub fn thread_finish() {
    CTX.with(|cell| {
        cell.borrow_mut().take();
    });
}

// Runs `f` with the calling thread's context. Issuing operations without
// thread_init is a contract violation, surfaced as a panic.
pub(crate) fn with_ctx<R>(f: impl FnOnce(&mut ThreadCtx) -> R) -> R {
    CTX.with(|cell| {
        let mut slot = cell.borrow_mut();
        let ctx = slot
            .as_mut()
            .expect("no thread context; call skipquad::thread_init() first");
        f(ctx)
    })
}

impl ThreadCtx {
    fn register(rng: Box<dyn RngCore + Send>) -> ThreadCtx {
        let mut registry = REGISTRY.lock();
        // Reuse a slot left behind by a finished thread before growing the
        // registry, so the quiescence scan stays proportional to the live
        // thread count.
        let reusable = registry
            .iter()
            .position(|s| !s.active.load(Ordering::SeqCst));
        let state = match reusable {
            Some(slot) => {
                let state = Arc::clone(&registry[slot]);
                state.write_clock.store(u64::MAX, Ordering::SeqCst);
                state.active.store(true, Ordering::SeqCst);
                state
            }
            None => {
                let state = Arc::new(ThreadState::new());
                registry.push(Arc::clone(&state));
                debug!("registered thread slot {}", registry.len() - 1);
                state
            }
        };
        ThreadCtx {
            state,
            rng,
            session_clock: 0,
            guard: None,
            write_log: Vec::new(),
            alloc_log: Vec::new(),
            free_log: Vec::new(),
        }
    }

    fn state_ptr(&self) -> *const ThreadState {
        Arc::as_ptr(&self.state)
    }

    /// One draw from the thread's RNG.
    pub(crate) fn rng_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    /// Opens a session: pins the epoch and snapshots the global clock.
    pub(crate) fn begin(&mut self) {
        debug_assert!(self.guard.is_none(), "session already in flight");
        self.guard = Some(epoch::pin());
        // Enter the session before snapshotting the clock: a committer that
        // misses the odd run-count must be one whose commit this snapshot
        // already covers. The other order loses the session in between and
        // lets a write-back race an in-flight read.
        self.state.run_count.fetch_add(1, Ordering::SeqCst);
        self.session_clock = GLOBAL_CLOCK.load(Ordering::SeqCst);
        self.state
            .local_clock
            .store(self.session_clock, Ordering::SeqCst);
    }

    /// Closes a session. A session that locked nothing just unpins; a writing
    /// session commits: publish, drain straggler readers, write back, unlock,
    /// retire.
    pub(crate) fn end(&mut self) {
        self.state.run_count.fetch_add(1, Ordering::SeqCst);

        if self.write_log.is_empty() {
            debug_assert!(self.free_log.is_empty());
            // Allocations that were never published are garbage.
            for &node in &self.alloc_log {
                unsafe { drop(Box::from_raw(node)) };
            }
            self.alloc_log.clear();
            self.guard = None;
            return;
        }

        let write_clock = GLOBAL_CLOCK.load(Ordering::SeqCst) + 1;
        self.state.write_clock.store(write_clock, Ordering::SeqCst);
        GLOBAL_CLOCK.fetch_add(1, Ordering::SeqCst);

        self.synchronize(write_clock);

        unsafe {
            for &copy in &self.write_log {
                let actual = (*copy).hdr.actual;
                (*actual).body = (*copy).body;
            }
            for &copy in &self.write_log {
                let actual = (*copy).hdr.actual;
                (*actual).hdr.copy.store(ptr::null_mut(), Ordering::Release);
            }
        }

        self.state.write_clock.store(u64::MAX, Ordering::SeqCst);

        let guard = self.guard.as_ref().expect("session not open");
        for &copy in &self.write_log {
            let addr = copy as usize;
            unsafe { guard.defer_unchecked(move || drop(Box::from_raw(addr as *mut Node))) };
        }
        for &node in &self.free_log {
            let addr = node as usize;
            unsafe { guard.defer_unchecked(move || drop(Box::from_raw(addr as *mut Node))) };
        }

        self.write_log.clear();
        self.free_log.clear();
        // Committed allocations now belong to the tree.
        self.alloc_log.clear();
        self.guard = None;
    }

    /// Abandons a session: releases locks without writing back, discards
    /// copies and frees any allocation made since [`ThreadCtx::begin`].
    pub(crate) fn abort(&mut self) {
        self.state.run_count.fetch_add(1, Ordering::SeqCst);

        let guard = self.guard.as_ref().expect("session not open");
        unsafe {
            for &copy in &self.write_log {
                let actual = (*copy).hdr.actual;
                (*actual).hdr.copy.store(ptr::null_mut(), Ordering::Release);
                // The copy's header may have been observed by concurrent
                // derefs, so it drains through the epoch like any other
                // retired allocation.
                let addr = copy as usize;
                guard.defer_unchecked(move || drop(Box::from_raw(addr as *mut Node)));
            }
            for &node in &self.alloc_log {
                drop(Box::from_raw(node));
            }
        }

        self.write_log.clear();
        self.alloc_log.clear();
        self.free_log.clear();
        self.guard = None;
    }

    /// Resolves `ptr` against in-flight writers. See the module docs.
    ///
    /// # Safety
    /// `ptr` must be null or point at a node reachable within this session.
    pub(crate) unsafe fn deref(&self, ptr: *mut Node) -> *mut Node {
        if ptr.is_null() {
            return ptr;
        }
        // Copies (ours, or one this session already stole) are the resolved
        // view; hand them back unchanged.
        if !(*ptr).hdr.actual.is_null() {
            return ptr;
        }
        let copy = (*ptr).hdr.copy.load(Ordering::Acquire);
        if copy.is_null() {
            return ptr;
        }
        let writer = (*copy).hdr.writer;
        if writer == self.state_ptr() {
            return copy;
        }
        // Steal the copy only when the writer's commit is ordered before this
        // session's snapshot; otherwise the original is the consistent view.
        if (*writer).write_clock.load(Ordering::SeqCst) <= self.session_clock {
            copy
        } else {
            ptr
        }
    }

    /// Attempts to claim exclusive write intent on the node behind `ptr`.
    /// On success, returns the private copy to mutate; stores to it become
    /// visible atomically when the session commits. Idempotent for nodes this
    /// session already holds. `None` means another writer holds the node and
    /// the operation must abort.
    ///
    /// # Safety
    /// `ptr` must point at a node reachable within this session.
    pub(crate) unsafe fn try_lock(&mut self, ptr: *mut Node) -> Option<*mut Node> {
        let mut target = ptr;
        if !(*target).hdr.actual.is_null() {
            if (*target).hdr.writer == self.state_ptr() {
                return Some(target);
            }
            // A stolen copy: contend for its original.
            target = (*target).hdr.actual;
        }

        let current = (*target).hdr.copy.load(Ordering::Acquire);
        if !current.is_null() {
            if (*current).hdr.writer == self.state_ptr() {
                return Some(current);
            }
            return None;
        }

        let copy = Box::into_raw(Box::new(Node {
            hdr: LockHeader::for_copy(target, self.state_ptr()),
            body: (*target).body,
        }));

        match (*target).hdr.copy.compare_exchange(
            ptr::null_mut(),
            copy,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // The pre-CAS snapshot could have raced a previous holder's
                // write-back; now that the lock is ours the original is
                // stable, so take the snapshot again.
                (*copy).body = (*target).body;
                self.write_log.push(copy);
                Some(copy)
            }
            Err(_) => {
                drop(Box::from_raw(copy));
                None
            }
        }
    }

    /// Allocates a node within this session. The node stays private (and is
    /// freed by an abort) until some committed copy links it into the tree.
    pub(crate) fn alloc(&mut self, node: *mut Node) -> *mut Node {
        self.alloc_log.push(node);
        node
    }

    /// Whether `node` was allocated inside the current session. Such a node
    /// is still private to this thread, so it is mutated directly instead of
    /// through [`ThreadCtx::try_lock`].
    pub(crate) fn is_fresh(&self, node: *mut Node) -> bool {
        self.alloc_log.contains(&node)
    }

    /// Whether `node` was already marked for reclamation in this session.
    pub(crate) fn is_freed(&self, node: *mut Node) -> bool {
        self.free_log.contains(&node)
    }

    /// Marks a node for reclamation. The memory drains through the epoch
    /// after the commit, once no in-flight reader can observe it.
    pub(crate) fn free(&mut self, node: *mut Node) {
        debug_assert!(!self.free_log.contains(&node));
        self.free_log.push(node);
    }

    // Waits until every session that began before `write_clock` has ended.
    // Sessions that began after it read this writer's copies, so they need no
    // waiting.
    fn synchronize(&self, write_clock: u64) {
        let peers: Vec<Arc<ThreadState>> = REGISTRY.lock().iter().cloned().collect();
        for peer in peers {
            if Arc::as_ptr(&peer) == self.state_ptr() {
                continue;
            }
            let observed = peer.run_count.load(Ordering::SeqCst);
            if observed & 1 == 0 {
                continue;
            }
            loop {
                if peer.run_count.load(Ordering::SeqCst) != observed {
                    break;
                }
                if peer.local_clock.load(Ordering::SeqCst) >= write_clock {
                    break;
                }
                std::thread::yield_now();
            }
        }
    }
}

impl Drop for ThreadCtx {
    fn drop(&mut self) {
        debug_assert!(self.guard.is_none(), "thread exiting mid-session");
        self.state.active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Point, Square};
    use crate::rng::ScriptedRng;
    use std::sync::mpsc;

    fn test_ctx() {
        thread_init_with_rng(Box::new(ScriptedRng::new(vec![99])));
    }

    #[test]
    fn deref_of_unlocked_node_is_identity() {
        test_ctx();
        let node = Node::new_square(Square::new(Point::origin(), 4.0));
        with_ctx(|ctx| {
            ctx.begin();
            unsafe {
                assert_eq!(ctx.deref(node), node);
                assert!(ctx.deref(ptr::null_mut()).is_null());
            }
            ctx.end();
        });
        unsafe { drop(Box::from_raw(node)) };
        thread_finish();
    }

    #[test]
    fn locking_is_idempotent_and_commit_writes_back() {
        test_ctx();
        let node = Node::new_square(Square::new(Point::origin(), 4.0));
        let stray = Node::new_leaf(Square::new(Point::origin(), 2.0));
        with_ctx(|ctx| {
            ctx.begin();
            unsafe {
                let copy = ctx.try_lock(node).expect("uncontended lock");
                assert_ne!(copy, node);
                assert_eq!(ctx.try_lock(node), Some(copy));
                // Mutations land on the copy, not the original.
                (*copy).body.children[1] = stray;
                assert!((*node).body.children[1].is_null());
                // And deref routes this session to its own copy.
                assert_eq!(ctx.deref(node), copy);
            }
            ctx.end();
            unsafe {
                assert_eq!((*node).body.children[1], stray);
                assert!((*node).hdr.copy.load(Ordering::SeqCst).is_null());
            }
        });
        unsafe {
            drop(Box::from_raw(node));
            drop(Box::from_raw(stray));
        }
        thread_finish();
    }

    #[test]
    fn abort_discards_speculative_writes() {
        test_ctx();
        let node = Node::new_square(Square::new(Point::origin(), 4.0));
        with_ctx(|ctx| {
            ctx.begin();
            unsafe {
                let copy = ctx.try_lock(node).expect("uncontended lock");
                (*copy).body.dirty = true;
            }
            ctx.abort();
            unsafe {
                assert!(!(*node).body.dirty);
                assert!((*node).hdr.copy.load(Ordering::SeqCst).is_null());
            }
        });
        unsafe { drop(Box::from_raw(node)) };
        thread_finish();
    }

    #[test]
    fn competing_writer_fails_to_lock() {
        test_ctx();
        let node = Node::new_square(Square::new(Point::origin(), 4.0));
        let addr = node as usize;

        let (locked_tx, locked_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        with_ctx(|ctx| {
            ctx.begin();
            let _ = unsafe { ctx.try_lock(node).expect("uncontended lock") };
        });

        let contender = std::thread::spawn(move || {
            test_ctx();
            let held = with_ctx(|ctx| {
                ctx.begin();
                let held = unsafe { ctx.try_lock(addr as *mut Node) };
                ctx.abort();
                held
            });
            locked_tx.send(held.is_none()).unwrap();
            done_rx.recv().unwrap();
            thread_finish();
        });

        assert!(locked_rx.recv().unwrap(), "foreign lock should fail");
        with_ctx(|ctx| ctx.abort());
        done_tx.send(()).unwrap();
        contender.join().unwrap();

        unsafe { drop(Box::from_raw(node)) };
        thread_finish();
    }
}
