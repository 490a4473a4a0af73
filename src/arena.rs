//! Slot arena: a chunked, address-stable pool that hands out 64-bit
//! [`SlotId`]s instead of pointers or references, so the holder/waiter
//! chains elsewhere in this crate can be built from plain integers rather
//! than aliased owning references.
//!
//! `allocate`/`deallocate` are the only synchronized operations. Field
//! access goes straight through an `UnsafeCell` once the record's chunk has
//! been located — callers are responsible for serializing that access via
//! the owning resource group's latch (for `ResourceArena`/`RequestArena`)
//! or the job-arena monitor (for `JobArena`).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::common::SlotId;
use crate::matrix::LockMode;

const CHUNK_SIZE: usize = 256;

/// Generic fixed-shape record pool. See the module docs for the
/// synchronization contract.
pub struct SlotArena<T> {
    chunks: RwLock<Vec<Box<[UnsafeCell<T>]>>>,
    free_list: Mutex<Vec<SlotId>>,
    next: AtomicI64,
    shrink_timer: Duration,
    last_shrink: Mutex<Instant>,
}

// SAFETY: `T` is only ever reached through a located slot, and callers are
// contractually required to serialize concurrent access to a given slot
// (via a group latch or the job-arena monitor). The arena itself only
// needs `T: Send` to move records between threads.
unsafe impl<T: Send> Send for SlotArena<T> {}
unsafe impl<T: Send> Sync for SlotArena<T> {}

impl<T: Default> SlotArena<T> {
    pub fn new(shrink_timer: Duration) -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
            next: AtomicI64::new(0),
            shrink_timer,
            last_shrink: Mutex::new(Instant::now()),
        }
    }

    /// Allocates a slot, reusing a freed one if available.
    pub fn allocate(&self) -> SlotId {
        if let Some(slot) = self.free_list.lock().pop() {
            return slot;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        self.ensure_chunk_for(idx);
        SlotId::new(idx)
    }

    /// Returns a slot to the free list. Resets the record to its default
    /// value so that a reused slot never leaks state from its previous
    /// occupant.
    pub fn deallocate(&self, slot: SlotId) {
        if slot.is_none() {
            return;
        }
        let ptr = self.slot_ptr(slot);
        // SAFETY: caller guarantees no other thread holds the latch
        // protecting this slot while it is being deallocated.
        unsafe {
            *ptr = T::default();
        }
        self.free_list.lock().push(slot);
        self.maybe_shrink();
    }

    fn ensure_chunk_for(&self, idx: i64) {
        let chunk_idx = (idx as usize) / CHUNK_SIZE;
        if chunk_idx < self.chunks.read().len() {
            return;
        }
        let mut chunks = self.chunks.write();
        while chunk_idx >= chunks.len() {
            let mut fresh = Vec::with_capacity(CHUNK_SIZE);
            for _ in 0..CHUNK_SIZE {
                fresh.push(UnsafeCell::new(T::default()));
            }
            chunks.push(fresh.into_boxed_slice());
        }
    }

    fn slot_ptr(&self, slot: SlotId) -> *mut T {
        let idx = slot.raw() as usize;
        let chunk_idx = idx / CHUNK_SIZE;
        let offset = idx % CHUNK_SIZE;
        let chunks = self.chunks.read();
        chunks[chunk_idx][offset].get()
    }

    /// Reads a snapshot of the record. Caller must hold whatever latch
    /// serializes this slot.
    pub fn with_record<R>(&self, slot: SlotId, f: impl FnOnce(&T) -> R) -> R {
        let ptr = self.slot_ptr(slot);
        // SAFETY: see module docs.
        f(unsafe { &*ptr })
    }

    /// Mutates the record in place. Caller must hold whatever latch
    /// serializes this slot.
    pub fn with_record_mut<R>(&self, slot: SlotId, f: impl FnOnce(&mut T) -> R) -> R {
        let ptr = self.slot_ptr(slot);
        // SAFETY: see module docs.
        f(unsafe { &mut *ptr })
    }

    fn maybe_shrink(&self) {
        let mut last = self.last_shrink.lock();
        if last.elapsed() < self.shrink_timer {
            return;
        }
        self.free_list.lock().shrink_to_fit();
        *last = Instant::now();
    }
}

// ===========================================================================
// Resource records
// ===========================================================================

/// One per actively-locked resource.
#[derive(Clone, Copy)]
pub struct ResourceRecord {
    pub dataset_id: i32,
    pub pk_hash: i32,
    pub max_mode: LockMode,
    pub next: SlotId,
    pub last_holder: SlotId,
    pub first_waiter: SlotId,
    pub first_upgrader: SlotId,
}

impl Default for ResourceRecord {
    fn default() -> Self {
        Self {
            dataset_id: 0,
            pk_hash: 0,
            max_mode: LockMode::NL,
            next: SlotId::NONE,
            last_holder: SlotId::NONE,
            first_waiter: SlotId::NONE,
            first_upgrader: SlotId::NONE,
        }
    }
}

/// Specialization of [`SlotArena`] for [`ResourceRecord`]s.
pub struct ResourceArena {
    inner: SlotArena<ResourceRecord>,
}

impl ResourceArena {
    pub fn new(shrink_timer: Duration) -> Self {
        Self {
            inner: SlotArena::new(shrink_timer),
        }
    }

    /// Allocates a resource slot and initializes it with empty queues.
    pub fn allocate_new(&self, dataset_id: i32, pk_hash: i32) -> SlotId {
        let slot = self.inner.allocate();
        self.inner.with_record_mut(slot, |r| {
            r.dataset_id = dataset_id;
            r.pk_hash = pk_hash;
            r.max_mode = LockMode::NL;
            r.next = SlotId::NONE;
            r.last_holder = SlotId::NONE;
            r.first_waiter = SlotId::NONE;
            r.first_upgrader = SlotId::NONE;
        });
        slot
    }

    pub fn deallocate(&self, slot: SlotId) {
        self.inner.deallocate(slot);
    }

    pub fn get_dataset_id(&self, slot: SlotId) -> i32 {
        self.inner.with_record(slot, |r| r.dataset_id)
    }

    pub fn get_pk_hash(&self, slot: SlotId) -> i32 {
        self.inner.with_record(slot, |r| r.pk_hash)
    }

    pub fn get_max_mode(&self, slot: SlotId) -> LockMode {
        self.inner.with_record(slot, |r| r.max_mode)
    }

    pub fn set_max_mode(&self, slot: SlotId, mode: LockMode) {
        self.inner.with_record_mut(slot, |r| r.max_mode = mode);
    }

    pub fn get_next(&self, slot: SlotId) -> SlotId {
        self.inner.with_record(slot, |r| r.next)
    }

    pub fn set_next(&self, slot: SlotId, next: SlotId) {
        self.inner.with_record_mut(slot, |r| r.next = next);
    }

    pub fn get_last_holder(&self, slot: SlotId) -> SlotId {
        self.inner.with_record(slot, |r| r.last_holder)
    }

    pub fn set_last_holder(&self, slot: SlotId, holder: SlotId) {
        self.inner.with_record_mut(slot, |r| r.last_holder = holder);
    }

    pub fn get_first_waiter(&self, slot: SlotId) -> SlotId {
        self.inner.with_record(slot, |r| r.first_waiter)
    }

    pub fn set_first_waiter(&self, slot: SlotId, waiter: SlotId) {
        self.inner.with_record_mut(slot, |r| r.first_waiter = waiter);
    }

    pub fn get_first_upgrader(&self, slot: SlotId) -> SlotId {
        self.inner.with_record(slot, |r| r.first_upgrader)
    }

    pub fn set_first_upgrader(&self, slot: SlotId, upgrader: SlotId) {
        self.inner
            .with_record_mut(slot, |r| r.first_upgrader = upgrader);
    }

    /// A resource exists as a live entity iff at least one of its three
    /// queues is non-empty.
    pub fn is_idle(&self, slot: SlotId) -> bool {
        self.inner.with_record(slot, |r| {
            r.last_holder.is_none() && r.first_waiter.is_none() && r.first_upgrader.is_none()
        })
    }
}

// ===========================================================================
// Request records
// ===========================================================================

/// Which of a resource's three queues a request currently sits on, and
/// correspondingly which per-job chain (`last_holder`/`last_waiter`/
/// `last_upgrader`) it is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Holder,
    Waiter,
    Upgrader,
}

/// One per outstanding lock acquisition attempt.
#[derive(Clone, Copy)]
pub struct RequestRecord {
    pub resource_id: SlotId,
    pub job_slot: SlotId,
    pub lock_mode: LockMode,
    pub role: Role,
    pub next_request: SlotId,
    pub prev_job_request: SlotId,
    pub next_job_request: SlotId,
}

impl Default for RequestRecord {
    fn default() -> Self {
        Self {
            resource_id: SlotId::NONE,
            job_slot: SlotId::NONE,
            lock_mode: LockMode::NL,
            role: Role::Waiter,
            next_request: SlotId::NONE,
            prev_job_request: SlotId::NONE,
            next_job_request: SlotId::NONE,
        }
    }
}

/// Specialization of [`SlotArena`] for [`RequestRecord`]s.
pub struct RequestArena {
    inner: SlotArena<RequestRecord>,
}

impl RequestArena {
    pub fn new(shrink_timer: Duration) -> Self {
        Self {
            inner: SlotArena::new(shrink_timer),
        }
    }

    pub fn allocate_new(
        &self,
        resource_id: SlotId,
        job_slot: SlotId,
        lock_mode: LockMode,
        role: Role,
    ) -> SlotId {
        let slot = self.inner.allocate();
        self.inner.with_record_mut(slot, |r| {
            r.resource_id = resource_id;
            r.job_slot = job_slot;
            r.lock_mode = lock_mode;
            r.role = role;
            r.next_request = SlotId::NONE;
            r.prev_job_request = SlotId::NONE;
            r.next_job_request = SlotId::NONE;
        });
        slot
    }

    pub fn deallocate(&self, slot: SlotId) {
        self.inner.deallocate(slot);
    }

    pub fn get_resource_id(&self, slot: SlotId) -> SlotId {
        self.inner.with_record(slot, |r| r.resource_id)
    }

    pub fn get_job_slot(&self, slot: SlotId) -> SlotId {
        self.inner.with_record(slot, |r| r.job_slot)
    }

    pub fn get_lock_mode(&self, slot: SlotId) -> LockMode {
        self.inner.with_record(slot, |r| r.lock_mode)
    }

    pub fn set_lock_mode(&self, slot: SlotId, mode: LockMode) {
        self.inner.with_record_mut(slot, |r| r.lock_mode = mode);
    }

    pub fn get_role(&self, slot: SlotId) -> Role {
        self.inner.with_record(slot, |r| r.role)
    }

    pub fn set_role(&self, slot: SlotId, role: Role) {
        self.inner.with_record_mut(slot, |r| r.role = role);
    }

    pub fn get_next_request(&self, slot: SlotId) -> SlotId {
        self.inner.with_record(slot, |r| r.next_request)
    }

    pub fn set_next_request(&self, slot: SlotId, next: SlotId) {
        self.inner.with_record_mut(slot, |r| r.next_request = next);
    }

    pub fn get_prev_job_request(&self, slot: SlotId) -> SlotId {
        self.inner.with_record(slot, |r| r.prev_job_request)
    }

    pub fn set_prev_job_request(&self, slot: SlotId, prev: SlotId) {
        self.inner
            .with_record_mut(slot, |r| r.prev_job_request = prev);
    }

    pub fn get_next_job_request(&self, slot: SlotId) -> SlotId {
        self.inner.with_record(slot, |r| r.next_job_request)
    }

    pub fn set_next_job_request(&self, slot: SlotId, next: SlotId) {
        self.inner
            .with_record_mut(slot, |r| r.next_job_request = next);
    }
}

// ===========================================================================
// Job records
// ===========================================================================

/// One per active job with any lock interaction.
#[derive(Clone, Copy)]
pub struct JobRecord {
    pub job_id: i32,
    pub last_holder: SlotId,
    pub last_waiter: SlotId,
    pub last_upgrader: SlotId,
}

impl Default for JobRecord {
    fn default() -> Self {
        Self {
            job_id: 0,
            last_holder: SlotId::NONE,
            last_waiter: SlotId::NONE,
            last_upgrader: SlotId::NONE,
        }
    }
}

/// Specialization of [`SlotArena`] for [`JobRecord`]s.
///
/// Field access here additionally relies on the process-wide job-arena
/// monitor rather than a per-slot latch, since deadlock detection walks
/// *other* jobs' waiter chains.
pub struct JobArena {
    inner: SlotArena<JobRecord>,
}

impl JobArena {
    pub fn new(shrink_timer: Duration) -> Self {
        Self {
            inner: SlotArena::new(shrink_timer),
        }
    }

    pub fn allocate_new(&self, job_id: i32) -> SlotId {
        let slot = self.inner.allocate();
        self.inner.with_record_mut(slot, |r| {
            r.job_id = job_id;
            r.last_holder = SlotId::NONE;
            r.last_waiter = SlotId::NONE;
            r.last_upgrader = SlotId::NONE;
        });
        slot
    }

    pub fn deallocate(&self, slot: SlotId) {
        self.inner.deallocate(slot);
    }

    pub fn get_job_id(&self, slot: SlotId) -> i32 {
        self.inner.with_record(slot, |r| r.job_id)
    }

    pub fn get_last_holder(&self, slot: SlotId) -> SlotId {
        self.inner.with_record(slot, |r| r.last_holder)
    }

    pub fn set_last_holder(&self, slot: SlotId, head: SlotId) {
        self.inner.with_record_mut(slot, |r| r.last_holder = head);
    }

    pub fn get_last_waiter(&self, slot: SlotId) -> SlotId {
        self.inner.with_record(slot, |r| r.last_waiter)
    }

    pub fn set_last_waiter(&self, slot: SlotId, head: SlotId) {
        self.inner.with_record_mut(slot, |r| r.last_waiter = head);
    }

    pub fn get_last_upgrader(&self, slot: SlotId) -> SlotId {
        self.inner.with_record(slot, |r| r.last_upgrader)
    }

    pub fn set_last_upgrader(&self, slot: SlotId, head: SlotId) {
        self.inner.with_record_mut(slot, |r| r.last_upgrader = head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn allocate_reuses_freed_slots() {
        let arena: SlotArena<i32> = SlotArena::new(Duration::from_secs(60));
        let a = arena.allocate();
        arena.deallocate(a);
        let b = arena.allocate();
        assert_eq!(a, b);
    }

    #[test]
    fn allocate_spans_multiple_chunks() {
        let arena: SlotArena<i32> = SlotArena::new(Duration::from_secs(60));
        let mut slots = Vec::new();
        for i in 0..(CHUNK_SIZE * 3 + 7) {
            let s = arena.allocate();
            arena.with_record_mut(s, |v| *v = i as i32);
            slots.push(s);
        }
        for (i, s) in slots.iter().enumerate() {
            assert_eq!(arena.with_record(*s, |v| *v), i as i32);
        }
    }

    #[test]
    fn deallocate_resets_to_default() {
        let arena: SlotArena<i32> = SlotArena::new(Duration::from_secs(60));
        let s = arena.allocate();
        arena.with_record_mut(s, |v| *v = 42);
        arena.deallocate(s);
        let reused = arena.allocate();
        assert_eq!(reused, s);
        assert_eq!(arena.with_record(reused, |v| *v), 0);
    }

    #[test]
    fn resource_arena_tracks_queue_emptiness() {
        let arena = ResourceArena::new(Duration::from_secs(60));
        let slot = arena.allocate_new(7, -1);
        assert!(arena.is_idle(slot));
        arena.set_last_holder(slot, SlotId::new(0));
        assert!(!arena.is_idle(slot));
    }
}
