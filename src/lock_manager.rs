//! The Lock Manager: wires together the slot arenas, the resource group
//! table, and the dataset lock cache into the public locking API.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::arena::{JobArena, RequestArena, ResourceArena, Role};
use crate::common::{JobId, SlotId};
use crate::config::LockManagerConfig;
use crate::dataset_cache::DatasetLockCache;
use crate::deadlock::introduces_deadlock;
use crate::error::{LockError, LockResult};
use crate::matrix::{action_for, Action, LockMode, Refinement};
use crate::resource_table::{ResourceGroup, ResourceGroupTable};
use crate::stats::{LockManagerStats, LockManagerStatsSnapshot};
use crate::txn::TxnContext;

/// The `entity_hash` value reserved for a dataset's own intention lock.
pub const DATASET_ENTITY: i32 = -1;

/// A request's transient state across a single `lock`/`try_lock` call
/// while it isn't (yet) a holder. The per-request state machine of
/// `spec.md` §4.5 (`NEW → WAITING → HOLDING`, `NEW → CONVERTING →
/// HOLDING`) tracked explicitly, rather than re-derived from the arena
/// chains on every loop iteration.
enum Pending {
    /// Nothing allocated yet for this call.
    None,
    /// A brand-new request record queued on the resource's waiter chain.
    Waiter(SlotId),
    /// The job's own *existing* holder request, temporarily moved onto the
    /// upgrader chain with its mode already set to the target;
    /// `original_mode` is restored if the attempt is abandoned before it
    /// completes.
    Upgrader { req: SlotId, original_mode: LockMode },
}

/// Hierarchical, two-mode lock manager. One instance typically serves an
/// entire process; it has no notion of which dataset or entity namespaces
/// mean beyond the raw `(dataset_id, entity_hash)` pairs callers pass in.
pub struct LockManager {
    config: LockManagerConfig,
    resources: ResourceArena,
    requests: RequestArena,
    jobs: JobArena,
    table: ResourceGroupTable,
    job_index: DashMap<JobId, SlotId>,
    /// Serializes every mutation of the holder/waiter/upgrader queue
    /// pointers threaded through the arenas, and every deadlock-detection
    /// walk. The per-group latch still owns each resource's `max_mode` and
    /// its compatibility decision; this monitor owns queue topology.
    job_monitor: Mutex<()>,
    stats: LockManagerStats,
    running: AtomicBool,
}

impl LockManager {
    /// A lock manager with default configuration.
    pub fn new() -> Self {
        Self::with_config(LockManagerConfig::default())
    }

    pub fn with_config(config: LockManagerConfig) -> Self {
        let table = ResourceGroupTable::new(config.group_table_size);
        let resources = ResourceArena::new(config.shrink_timer);
        let requests = RequestArena::new(config.shrink_timer);
        let jobs = JobArena::new(config.shrink_timer);
        Self {
            config,
            resources,
            requests,
            jobs,
            table,
            job_index: DashMap::new(),
            job_monitor: Mutex::new(()),
            stats: LockManagerStats::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    pub fn stats(&self) -> LockManagerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Marks the manager as accepting lock requests. `lock`/`try_lock`
    /// themselves don't check this flag — it's informational state for
    /// callers that want to gate admission at a higher layer.
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        info!("lock manager started");
    }

    /// Marks the manager as stopped and optionally dumps its full queue
    /// state to `output`.
    pub fn stop<W: Write>(&self, dump_state: bool, mut output: W) -> LockResult<()> {
        self.running.store(false, Ordering::Release);
        if dump_state {
            self.pretty_print(&mut output)?;
        }
        info!("lock manager stopped");
        Ok(())
    }

    /// Writes a human-readable dump of every non-idle resource: its
    /// dataset, entity hash, current max mode, and holder/waiter/upgrader
    /// job ids.
    pub fn pretty_print<W: Write>(&self, output: &mut W) -> LockResult<()> {
        let io_err = |e: std::io::Error| LockError::invariant(format!("pretty_print: {e}"));
        writeln!(output, "LockManager {{").map_err(io_err)?;
        for (idx, group) in self.table.groups().iter().enumerate() {
            let _latch = group.latch.lock();
            let mut resource = group.first_resource();
            while resource.is_some() {
                let dataset_id = self.resources.get_dataset_id(resource);
                let entity_hash = self.resources.get_pk_hash(resource);
                let max_mode = self.resources.get_max_mode(resource);
                writeln!(
                    output,
                    "  bucket[{idx}] dataset={dataset_id} entity={entity_hash} max_mode={max_mode}"
                )
                .map_err(io_err)?;
                self.write_chain(output, resource, Role::Holder, "holders")?;
                self.write_chain(output, resource, Role::Waiter, "waiters")?;
                self.write_chain(output, resource, Role::Upgrader, "upgraders")?;
                resource = self.resources.get_next(resource);
            }
        }
        writeln!(output, "}}").map_err(io_err)?;
        Ok(())
    }

    fn write_chain<W: Write>(
        &self,
        output: &mut W,
        resource: SlotId,
        role: Role,
        label: &str,
    ) -> LockResult<()> {
        let io_err = |e: std::io::Error| LockError::invariant(format!("pretty_print: {e}"));
        let mut ids = Vec::new();
        {
            let _monitor = self.job_monitor.lock();
            let mut cur = self.resource_chain_head(resource, role);
            while cur.is_some() {
                let job = self.requests.get_job_slot(cur);
                ids.push(self.jobs.get_job_id(job).to_string());
                cur = self.requests.get_next_request(cur);
            }
        }
        if !ids.is_empty() {
            writeln!(output, "    {label}: {}", ids.join(", ")).map_err(io_err)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Public locking API
    // -----------------------------------------------------------------

    /// Acquires `mode` on `(dataset_id, entity_hash)`, blocking until
    /// granted, aborted, or timed out. Unless `entity_hash ==
    /// DATASET_ENTITY`, this first acquires the dataset-level intention
    /// lock implied by `mode` (see [`LockMode::dataset_intent`]), skipping
    /// that step if the thread-local [`DatasetLockCache`] already proves
    /// it's held.
    pub fn lock(
        &self,
        ctx: &dyn TxnContext,
        dataset_id: i32,
        entity_hash: i32,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> LockResult<()> {
        if ctx.is_aborted() {
            return Err(LockError::txn_aborted(ctx.job_id()));
        }
        if entity_hash != DATASET_ENTITY {
            self.ensure_dataset_intent(ctx, dataset_id, mode, timeout, false)?;
        }
        self.acquire(ctx, dataset_id, entity_hash, mode, timeout, false)
    }

    /// Non-blocking form of [`LockManager::lock`]: fails immediately with
    /// [`LockError::TxnTimedOut`] instead of waiting, and never runs
    /// deadlock detection (there is nothing to detect against a lock that
    /// never waits).
    pub fn try_lock(
        &self,
        ctx: &dyn TxnContext,
        dataset_id: i32,
        entity_hash: i32,
        mode: LockMode,
    ) -> LockResult<()> {
        if ctx.is_aborted() {
            return Err(LockError::txn_aborted(ctx.job_id()));
        }
        if entity_hash != DATASET_ENTITY {
            self.ensure_dataset_intent(ctx, dataset_id, mode, None, true)?;
        }
        self.acquire(ctx, dataset_id, entity_hash, mode, None, true)
    }

    /// Acquires `mode` on the entity and immediately releases it. Used to
    /// serialize against a concurrent structural change without holding a
    /// lock for the rest of the job's lifetime; bypasses the dataset
    /// intention hierarchy and the dataset lock cache entirely.
    pub fn instant_lock(
        &self,
        ctx: &dyn TxnContext,
        dataset_id: i32,
        entity_hash: i32,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> LockResult<()> {
        self.acquire(ctx, dataset_id, entity_hash, mode, timeout, false)?;
        self.unlock(ctx, dataset_id, entity_hash)
    }

    /// Non-blocking form of [`LockManager::instant_lock`].
    pub fn instant_try_lock(
        &self,
        ctx: &dyn TxnContext,
        dataset_id: i32,
        entity_hash: i32,
        mode: LockMode,
    ) -> LockResult<()> {
        self.acquire(ctx, dataset_id, entity_hash, mode, None, true)?;
        self.unlock(ctx, dataset_id, entity_hash)
    }

    /// Releases a single previously granted lock. Returns
    /// [`LockError::InvariantViolation`] if the caller doesn't currently
    /// hold it — unlocking a lock you don't hold is always a bug.
    pub fn unlock(&self, ctx: &dyn TxnContext, dataset_id: i32, entity_hash: i32) -> LockResult<()> {
        let job_slot = self.existing_job_slot(ctx.job_id())?;
        let group = self.table.group(dataset_id, entity_hash);
        let _guard = group.latch.lock();
        let resource = self.find_resource(group, dataset_id, entity_hash).ok_or_else(|| {
            LockError::invariant(format!(
                "unlock of untracked resource (dataset={dataset_id}, entity={entity_hash})"
            ))
        })?;
        let own_req = self.find_holder_request(resource, job_slot).ok_or_else(|| {
            LockError::invariant(format!(
                "job {} has no held lock on (dataset={dataset_id}, entity={entity_hash})",
                ctx.job_id()
            ))
        })?;
        self.detach_request(resource, job_slot, own_req);
        self.requests.deallocate(own_req);
        let max_mode_changed = self.recompute_max_mode(resource);
        self.reclaim_if_idle(group, resource);
        // An unchanged max cannot unblock a waiter that was already blocked
        // by that same max; only a drop in max_mode can.
        if max_mode_changed {
            group.wakeup.notify_all();
        }
        Ok(())
    }

    /// Releases every lock the job currently holds or is waiting for,
    /// across every resource group, and drops the job's dataset lock
    /// cache entry. Safe to call even if the job holds nothing.
    pub fn release_locks(&self, ctx: &dyn TxnContext) -> LockResult<()> {
        let job_id = ctx.job_id();
        let Some(job_slot) = self.job_index.get(&job_id).map(|entry| *entry) else {
            return Ok(());
        };

        while let Some((req, _role)) = self.next_job_request(job_slot) {
            let resource = self.requests.get_resource_id(req);
            let dataset_id = self.resources.get_dataset_id(resource);
            let entity_hash = self.resources.get_pk_hash(resource);
            let group = self.table.group(dataset_id, entity_hash);
            let _guard = group.latch.lock();
            self.detach_request(resource, job_slot, req);
            self.requests.deallocate(req);
            self.recompute_max_mode(resource);
            self.reclaim_if_idle(group, resource);
            group.wakeup.notify_all();
        }

        self.job_index.remove(&job_id);
        self.jobs.deallocate(job_slot);
        DatasetLockCache::clear(job_id);
        debug!(job_id, "released all locks");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Internal mechanics
    // -----------------------------------------------------------------

    fn ensure_dataset_intent(
        &self,
        ctx: &dyn TxnContext,
        dataset_id: i32,
        mode: LockMode,
        timeout: Option<Duration>,
        try_only: bool,
    ) -> LockResult<()> {
        let intent = mode.dataset_intent();
        if DatasetLockCache::contains(ctx.job_id(), dataset_id, intent) {
            return Ok(());
        }
        self.acquire(ctx, dataset_id, DATASET_ENTITY, intent, timeout, try_only)?;
        DatasetLockCache::record(ctx.job_id(), dataset_id, intent);
        Ok(())
    }

    fn acquire(
        &self,
        ctx: &dyn TxnContext,
        dataset_id: i32,
        entity_hash: i32,
        mode: LockMode,
        timeout: Option<Duration>,
        try_only: bool,
    ) -> LockResult<()> {
        if mode == LockMode::NL {
            return Ok(());
        }

        let job_slot = self.resolve_job_slot(ctx.job_id());
        let group = self.table.group(dataset_id, entity_hash);
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut guard = group.latch.lock();
        let resource = self.find_or_create_resource(group, dataset_id, entity_hash);
        let timed_out_err =
            |ctx: &dyn TxnContext| LockError::txn_timed_out(ctx.job_id(), dataset_id, entity_hash, mode);

        // `pending` threads this call's in-flight waiter/upgrader request
        // across loop iterations; see `Pending`'s docs for why it's tracked
        // explicitly rather than re-derived from the arena chains.
        let mut pending = Pending::None;

        loop {
            if ctx.is_aborted() {
                self.abandon_pending(resource, job_slot, pending);
                return Err(LockError::txn_aborted(ctx.job_id()));
            }

            match pending {
                Pending::Upgrader { req, original_mode } => {
                    // Re-evaluating an in-flight upgrade never re-runs the
                    // matrix or the refinement: the job's own prior hold is
                    // off the holder chain for the duration, so the only
                    // question is whether any *other* job still conflicts.
                    if !self.other_holder_exists(resource, job_slot) {
                        self.detach_request(resource, job_slot, req);
                        self.attach_request(resource, job_slot, req, Role::Holder);
                        self.resources.set_max_mode(resource, mode);
                        self.stats.record_conversion();
                        group.wakeup.notify_all();
                        return Ok(());
                    }
                    if self.wait_for_wakeup(group, &mut guard, deadline) {
                        ctx.set_timeout(true);
                        self.abandon_pending(
                            resource,
                            job_slot,
                            Pending::Upgrader { req, original_mode },
                        );
                        return Err(timed_out_err(ctx));
                    }
                    continue;
                }
                Pending::Waiter(req) => {
                    let current_max = self.resources.get_max_mode(resource);
                    if action_for(current_max, mode) == Action::Wait {
                        if self.wait_for_wakeup(group, &mut guard, deadline) {
                            ctx.set_timeout(true);
                            self.abandon_pending(resource, job_slot, Pending::Waiter(req));
                            return Err(timed_out_err(ctx));
                        }
                        continue;
                    }
                    let raise_max = action_for(current_max, mode) == Action::Upd;
                    self.detach_request(resource, job_slot, req);
                    self.attach_request(resource, job_slot, req, Role::Holder);
                    if raise_max {
                        self.resources.set_max_mode(resource, mode);
                    }
                    self.stats.record_grant();
                    group.wakeup.notify_all();
                    return Ok(());
                }
                Pending::None => {
                    let current_max = self.resources.get_max_mode(resource);
                    match action_for(current_max, mode) {
                        Action::Get | Action::Upd => {
                            let raise_max = action_for(current_max, mode) == Action::Upd;
                            let req = self.requests.allocate_new(resource, job_slot, mode, Role::Holder);
                            self.attach_request(resource, job_slot, req, Role::Holder);
                            if raise_max {
                                self.resources.set_max_mode(resource, mode);
                            }
                            self.stats.record_grant();
                            group.wakeup.notify_all();
                            return Ok(());
                        }
                        Action::Wait => match self.same_job_refinement(resource, job_slot, mode) {
                            Refinement::Get => {
                                // The job already holds this exact mode via a
                                // separate request; grant a second holder
                                // record (spec.md §8's idempotent-grant law).
                                let req =
                                    self.requests.allocate_new(resource, job_slot, mode, Role::Holder);
                                self.attach_request(resource, job_slot, req, Role::Holder);
                                self.stats.record_grant();
                                group.wakeup.notify_all();
                                return Ok(());
                            }
                            Refinement::Conv(existing) => {
                                if !self.other_holder_exists(resource, job_slot) {
                                    // Sole holder: nothing else can conflict,
                                    // strengthen the existing request in place.
                                    self.requests.set_lock_mode(existing, mode);
                                    self.resources.set_max_mode(resource, mode);
                                    self.stats.record_conversion();
                                    group.wakeup.notify_all();
                                    return Ok(());
                                }
                                if try_only {
                                    return Err(timed_out_err(ctx));
                                }
                                let original_mode = self.requests.get_lock_mode(existing);
                                self.detach_request(resource, job_slot, existing);
                                self.requests.set_lock_mode(existing, mode);
                                self.attach_request(resource, job_slot, existing, Role::Upgrader);
                                self.stats.record_wait();
                                pending = Pending::Upgrader {
                                    req: existing,
                                    original_mode,
                                };
                            }
                            Refinement::Wait => {
                                if try_only {
                                    return Err(timed_out_err(ctx));
                                }
                                if self.config.enable_deadlock_detection
                                    && self.would_deadlock(resource, job_slot)
                                {
                                    self.stats.record_deadlock();
                                    self.stats.record_abort();
                                    ctx.request_abort("would introduce a deadlock");
                                    ctx.set_timeout(true);
                                    return Err(timed_out_err(ctx));
                                }
                                let req =
                                    self.requests.allocate_new(resource, job_slot, mode, Role::Waiter);
                                self.attach_request(resource, job_slot, req, Role::Waiter);
                                self.stats.record_wait();
                                pending = Pending::Waiter(req);
                            }
                        },
                    }
                }
            }
            // `Pending::None`'s `Wait`/`Conv`-queued arms fall through here
            // having just set `pending`; looping back dispatches the actual
            // `await` through the `Pending::Waiter`/`Pending::Upgrader` arms
            // above, so every iteration has exactly one wait call.
        }
    }

    /// Walks `resource`'s holder chain for an entry belonging to `job_slot`
    /// (`updateActionForSameJob`, spec.md §4.5). Only meaningful when the
    /// raw matrix verdict for `mode` was [`Action::Wait`].
    fn same_job_refinement(&self, resource: SlotId, job_slot: SlotId, mode: LockMode) -> Refinement {
        let _monitor = self.job_monitor.lock();
        let mut tentative: Option<SlotId> = None;
        let mut cur = self.resources.get_last_holder(resource);
        while cur.is_some() {
            if self.requests.get_job_slot(cur) == job_slot {
                if self.requests.get_lock_mode(cur) == mode {
                    return Refinement::Get;
                }
                if tentative.is_none() {
                    tentative = Some(cur);
                }
            }
            cur = self.requests.get_next_request(cur);
        }
        match tentative {
            Some(req) => Refinement::Conv(req),
            None => Refinement::Wait,
        }
    }

    /// Releases whatever `pending` holds without promoting it to a holder:
    /// a freshly allocated waiter is deallocated outright; an in-flight
    /// upgrade restores the job's original mode and rejoins the holder
    /// chain, since the job's prior hold was never actually given up.
    fn abandon_pending(&self, resource: SlotId, job_slot: SlotId, pending: Pending) {
        match pending {
            Pending::None => {}
            Pending::Waiter(req) => {
                self.detach_request(resource, job_slot, req);
                self.requests.deallocate(req);
            }
            Pending::Upgrader { req, original_mode } => {
                self.detach_request(resource, job_slot, req);
                self.requests.set_lock_mode(req, original_mode);
                self.attach_request(resource, job_slot, req, Role::Holder);
            }
        }
    }

    fn would_deadlock(&self, resource: SlotId, job_slot: SlotId) -> bool {
        let _monitor = self.job_monitor.lock();
        introduces_deadlock(&self.resources, &self.requests, &self.jobs, job_slot, resource)
    }

    fn wait_for_wakeup(
        &self,
        group: &ResourceGroup,
        guard: &mut MutexGuard<'_, ()>,
        deadline: Option<Instant>,
    ) -> bool {
        match deadline {
            None => {
                group.wakeup.wait(guard);
                false
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return true;
                }
                group.wakeup.wait_for(guard, deadline - now).timed_out()
            }
        }
    }

    fn resolve_job_slot(&self, job_id: JobId) -> SlotId {
        if let Some(slot) = self.job_index.get(&job_id) {
            return *slot;
        }
        let _monitor = self.job_monitor.lock();
        *self
            .job_index
            .entry(job_id)
            .or_insert_with(|| self.jobs.allocate_new(job_id))
    }

    fn existing_job_slot(&self, job_id: JobId) -> LockResult<SlotId> {
        self.job_index
            .get(&job_id)
            .map(|slot| *slot)
            .ok_or_else(|| LockError::invariant(format!("no lock state tracked for job {job_id}")))
    }

    fn find_or_create_resource(&self, group: &ResourceGroup, dataset_id: i32, entity_hash: i32) -> SlotId {
        if let Some(existing) = self.find_resource(group, dataset_id, entity_hash) {
            return existing;
        }
        let slot = self.resources.allocate_new(dataset_id, entity_hash);
        let _monitor = self.job_monitor.lock();
        self.resources.set_next(slot, group.first_resource());
        group.set_first_resource(slot);
        slot
    }

    fn find_resource(&self, group: &ResourceGroup, dataset_id: i32, entity_hash: i32) -> Option<SlotId> {
        let mut cur = group.first_resource();
        while cur.is_some() {
            if self.resources.get_dataset_id(cur) == dataset_id && self.resources.get_pk_hash(cur) == entity_hash {
                return Some(cur);
            }
            cur = self.resources.get_next(cur);
        }
        None
    }

    fn reclaim_if_idle(&self, group: &ResourceGroup, resource: SlotId) {
        if !self.resources.is_idle(resource) {
            return;
        }
        {
            let _monitor = self.job_monitor.lock();
            let mut cur = group.first_resource();
            if cur == resource {
                group.set_first_resource(self.resources.get_next(resource));
            } else {
                while cur.is_some() {
                    let next = self.resources.get_next(cur);
                    if next == resource {
                        self.resources.set_next(cur, self.resources.get_next(resource));
                        break;
                    }
                    cur = next;
                }
            }
        }
        self.resources.deallocate(resource);
        self.stats.record_reclaim();
    }

    /// Recomputes `resource.max_mode` by folding every remaining holder's
    /// mode through the matrix. Returns whether the max actually changed,
    /// since `unlock` only needs to wake the group when it did.
    fn recompute_max_mode(&self, resource: SlotId) -> bool {
        let old_max = self.resources.get_max_mode(resource);
        let mut max = LockMode::NL;
        let mut cur = self.resources.get_last_holder(resource);
        while cur.is_some() {
            let held = self.requests.get_lock_mode(cur);
            if action_for(max, held) == Action::Upd {
                max = held;
            }
            cur = self.requests.get_next_request(cur);
        }
        self.resources.set_max_mode(resource, max);
        max != old_max
    }

    /// Finds the job's most recently acquired holder request on `resource`
    /// (the head of the holder chain if it belongs to the job, else the
    /// first match scanning forward) — `unlock`'s required LIFO-per-job
    /// selection, spec.md §4.5.3.
    fn find_holder_request(&self, resource: SlotId, job_slot: SlotId) -> Option<SlotId> {
        let _monitor = self.job_monitor.lock();
        let mut cur = self.resources.get_last_holder(resource);
        while cur.is_some() {
            if self.requests.get_job_slot(cur) == job_slot {
                return Some(cur);
            }
            cur = self.requests.get_next_request(cur);
        }
        None
    }

    fn other_holder_exists(&self, resource: SlotId, excluding_job: SlotId) -> bool {
        let _monitor = self.job_monitor.lock();
        let mut cur = self.resources.get_last_holder(resource);
        while cur.is_some() {
            if self.requests.get_job_slot(cur) != excluding_job {
                return true;
            }
            cur = self.requests.get_next_request(cur);
        }
        false
    }

    fn next_job_request(&self, job_slot: SlotId) -> Option<(SlotId, Role)> {
        let _monitor = self.job_monitor.lock();
        let holder = self.jobs.get_last_holder(job_slot);
        if holder.is_some() {
            return Some((holder, Role::Holder));
        }
        let waiter = self.jobs.get_last_waiter(job_slot);
        if waiter.is_some() {
            return Some((waiter, Role::Waiter));
        }
        let upgrader = self.jobs.get_last_upgrader(job_slot);
        if upgrader.is_some() {
            return Some((upgrader, Role::Upgrader));
        }
        None
    }

    fn resource_chain_head(&self, resource: SlotId, role: Role) -> SlotId {
        match role {
            Role::Holder => self.resources.get_last_holder(resource),
            Role::Waiter => self.resources.get_first_waiter(resource),
            Role::Upgrader => self.resources.get_first_upgrader(resource),
        }
    }

    fn set_resource_chain_head(&self, resource: SlotId, role: Role, head: SlotId) {
        match role {
            Role::Holder => self.resources.set_last_holder(resource, head),
            Role::Waiter => self.resources.set_first_waiter(resource, head),
            Role::Upgrader => self.resources.set_first_upgrader(resource, head),
        }
    }

    fn job_chain_head(&self, job_slot: SlotId, role: Role) -> SlotId {
        match role {
            Role::Holder => self.jobs.get_last_holder(job_slot),
            Role::Waiter => self.jobs.get_last_waiter(job_slot),
            Role::Upgrader => self.jobs.get_last_upgrader(job_slot),
        }
    }

    fn set_job_chain_head(&self, job_slot: SlotId, role: Role, head: SlotId) {
        match role {
            Role::Holder => self.jobs.set_last_holder(job_slot, head),
            Role::Waiter => self.jobs.set_last_waiter(job_slot, head),
            Role::Upgrader => self.jobs.set_last_upgrader(job_slot, head),
        }
    }

    /// Links `req` at the head of both `resource`'s and `job_slot`'s
    /// `role` chain.
    fn attach_request(&self, resource: SlotId, job_slot: SlotId, req: SlotId, role: Role) {
        let _monitor = self.job_monitor.lock();
        self.requests.set_role(req, role);

        let resource_head = self.resource_chain_head(resource, role);
        self.requests.set_next_request(req, resource_head);
        self.set_resource_chain_head(resource, role, req);

        let job_head = self.job_chain_head(job_slot, role);
        self.requests.set_prev_job_request(req, SlotId::NONE);
        self.requests.set_next_job_request(req, job_head);
        if job_head.is_some() {
            self.requests.set_prev_job_request(job_head, req);
        }
        self.set_job_chain_head(job_slot, role, req);
    }

    /// Unlinks `req` from whichever chains its current role has it on.
    fn detach_request(&self, resource: SlotId, job_slot: SlotId, req: SlotId) {
        let _monitor = self.job_monitor.lock();
        let role = self.requests.get_role(req);

        let mut cur = self.resource_chain_head(resource, role);
        if cur == req {
            self.set_resource_chain_head(resource, role, self.requests.get_next_request(req));
        } else {
            while cur.is_some() {
                let next = self.requests.get_next_request(cur);
                if next == req {
                    self.requests.set_next_request(cur, self.requests.get_next_request(req));
                    break;
                }
                cur = next;
            }
        }

        let prev = self.requests.get_prev_job_request(req);
        let next = self.requests.get_next_job_request(req);
        if prev.is_some() {
            self.requests.set_next_job_request(prev, next);
        } else {
            self.set_job_chain_head(job_slot, role, next);
        }
        if next.is_some() {
            self.requests.set_prev_job_request(next, prev);
        }

        self.requests.set_next_request(req, SlotId::NONE);
        self.requests.set_prev_job_request(req, SlotId::NONE);
        self.requests.set_next_job_request(req, SlotId::NONE);
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::SimpleTxnContext;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    /// Best-effort `tracing` subscriber so a failing concurrency test
    /// prints its grant/wait/abort events instead of running silent;
    /// harmless if another test already installed one.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn manager() -> LockManager {
        LockManager::new()
    }

    fn manager_without_deadlock_detection() -> LockManager {
        LockManager::with_config(LockManagerConfig {
            enable_deadlock_detection: false,
            ..LockManagerConfig::default()
        })
    }

    #[test]
    fn two_shared_locks_coexist_on_the_same_entity() {
        let mgr = manager();
        let a = SimpleTxnContext::new(1);
        let b = SimpleTxnContext::new(2);

        mgr.lock(&a, 10, 5, LockMode::S, None).unwrap();
        mgr.lock(&b, 10, 5, LockMode::S, None).unwrap();

        mgr.unlock(&a, 10, 5).unwrap();
        mgr.unlock(&b, 10, 5).unwrap();
    }

    #[test]
    fn exclusive_blocks_a_concurrent_try_lock() {
        let mgr = manager();
        let a = SimpleTxnContext::new(1);
        let b = SimpleTxnContext::new(2);

        mgr.lock(&a, 10, 5, LockMode::X, None).unwrap();
        let err = mgr.try_lock(&b, 10, 5, LockMode::S).unwrap_err();
        assert!(matches!(err, LockError::TxnTimedOut { .. }));

        mgr.unlock(&a, 10, 5).unwrap();
        mgr.try_lock(&b, 10, 5, LockMode::S).unwrap();
        mgr.unlock(&b, 10, 5).unwrap();
    }

    #[test]
    fn locking_an_entity_also_acquires_the_dataset_intention_lock() {
        let mgr = manager();
        let a = SimpleTxnContext::new(1);
        let b = SimpleTxnContext::new(2);

        mgr.lock(&a, 10, 5, LockMode::X, None).unwrap();
        // b wants the whole dataset exclusively; blocked by a's IX.
        let err = mgr.try_lock(&b, 10, DATASET_ENTITY, LockMode::X).unwrap_err();
        assert!(matches!(err, LockError::TxnTimedOut { .. }));

        mgr.unlock(&a, 10, 5).unwrap();
        mgr.release_locks(&a).unwrap();
    }

    #[test]
    fn same_job_upgrade_converts_in_place_when_sole_holder() {
        let mgr = manager();
        let a = SimpleTxnContext::new(1);

        mgr.lock(&a, 10, 5, LockMode::S, None).unwrap();
        mgr.lock(&a, 10, 5, LockMode::X, None).unwrap();

        let b = SimpleTxnContext::new(2);
        let err = mgr.try_lock(&b, 10, 5, LockMode::S).unwrap_err();
        assert!(matches!(err, LockError::TxnTimedOut { .. }));

        mgr.unlock(&a, 10, 5).unwrap();
    }

    /// spec.md's round-trip law: two identical-mode `lock()` calls from the
    /// same job are each granted (the second via same-job `Get`), but they
    /// allocate independent holder requests — the resource isn't idle again
    /// until both are individually unlocked.
    #[test]
    fn repeated_identical_mode_lock_requires_two_unlocks() {
        let mgr = manager();
        let a = SimpleTxnContext::new(1);
        let b = SimpleTxnContext::new(2);

        mgr.lock(&a, 10, 5, LockMode::S, None).unwrap();
        mgr.lock(&a, 10, 5, LockMode::S, None).unwrap();

        // Still held once: an incompatible X from another job must fail.
        let err = mgr.try_lock(&b, 10, 5, LockMode::X).unwrap_err();
        assert!(matches!(err, LockError::TxnTimedOut { .. }));

        mgr.unlock(&a, 10, 5).unwrap();
        // One of the two grants released; the other S still blocks X.
        let err = mgr.try_lock(&b, 10, 5, LockMode::X).unwrap_err();
        assert!(matches!(err, LockError::TxnTimedOut { .. }));

        mgr.unlock(&a, 10, 5).unwrap();
        // Both released now; X is free to grant.
        mgr.try_lock(&b, 10, 5, LockMode::X).unwrap();
        mgr.unlock(&b, 10, 5).unwrap();
    }

    /// spec.md §8 scenario 4: a same-job upgrade queues as an upgrader (not
    /// a fresh waiter) while another job still holds the resource, and
    /// converts in place once that other holder releases.
    #[test]
    fn same_job_upgrade_queues_and_converts_once_other_holder_releases() {
        init_tracing();
        let mgr = Arc::new(manager());
        let a = SimpleTxnContext::new(1);
        let b = SimpleTxnContext::new(2);

        mgr.lock(&a, 7, 1, LockMode::S, None).unwrap();
        mgr.lock(&b, 7, 1, LockMode::S, None).unwrap();

        let mgr2 = Arc::clone(&mgr);
        let upgrade = thread::spawn(move || {
            let a = SimpleTxnContext::new(1);
            mgr2.lock(&a, 7, 1, LockMode::X, Some(Duration::from_secs(5)))
        });

        thread::sleep(Duration::from_millis(50));
        mgr.unlock(&b, 7, 1).unwrap();
        upgrade.join().unwrap().unwrap();

        mgr.unlock(&a, 7, 1).unwrap();
    }

    #[test]
    fn release_locks_drops_every_held_entity() {
        let mgr = manager();
        let a = SimpleTxnContext::new(1);
        for entity in 0..50 {
            mgr.lock(&a, 10, entity, LockMode::X, None).unwrap();
        }
        mgr.release_locks(&a).unwrap();

        let b = SimpleTxnContext::new(2);
        for entity in 0..50 {
            mgr.try_lock(&b, 10, entity, LockMode::X).unwrap();
        }
        mgr.release_locks(&b).unwrap();
    }

    #[test]
    fn a_cross_waiting_pair_resolves_via_requester_abort() {
        init_tracing();
        let mgr = Arc::new(manager());
        let barrier = Arc::new(Barrier::new(2));
        let aborts = Arc::new(AtomicUsize::new(0));

        let mgr1 = Arc::clone(&mgr);
        let barrier1 = Arc::clone(&barrier);
        let aborts1 = Arc::clone(&aborts);
        let t1 = thread::spawn(move || {
            let ctx = SimpleTxnContext::new(1);
            mgr1.lock(&ctx, 1, 1, LockMode::X, None).unwrap();
            barrier1.wait();
            if let Err(err) = mgr1.lock(&ctx, 1, 2, LockMode::X, Some(Duration::from_secs(5))) {
                assert!(matches!(err, LockError::TxnTimedOut { .. }));
                aborts1.fetch_add(1, Ordering::SeqCst);
            }
            mgr1.release_locks(&ctx).unwrap();
        });

        let mgr2 = Arc::clone(&mgr);
        let barrier2 = Arc::clone(&barrier);
        let aborts2 = Arc::clone(&aborts);
        let t2 = thread::spawn(move || {
            let ctx = SimpleTxnContext::new(2);
            mgr2.lock(&ctx, 1, 2, LockMode::X, None).unwrap();
            barrier2.wait();
            if let Err(err) = mgr2.lock(&ctx, 1, 1, LockMode::X, Some(Duration::from_secs(5))) {
                assert!(matches!(err, LockError::TxnTimedOut { .. }));
                aborts2.fetch_add(1, Ordering::SeqCst);
            }
            mgr2.release_locks(&ctx).unwrap();
        });

        t1.join().unwrap();
        t2.join().unwrap();

        // At least one side must have been forced to abort (reported as
        // TxnTimedOut per spec.md §7's deadlock-victim policy) to break the
        // cycle; a race between registering as a waiter and running the
        // detection walk can conservatively abort both sides.
        assert!(aborts.load(Ordering::SeqCst) >= 1);
    }

    /// `unlock` only signals waiters when `max_mode` actually drops. Here
    /// two `S` holders share a resource; releasing one leaves the other's
    /// `S` in place, so `max_mode` stays `S` and no signal fires — but the
    /// waiter blocked on an incompatible `X` wasn't unblockable either way,
    /// since the surviving `S` holder still conflicts with it.
    #[test]
    fn max_mode_unchanged_does_not_starve_a_waiter_it_could_not_help() {
        let mgr = Arc::new(manager());
        let a = SimpleTxnContext::new(1);
        let b = SimpleTxnContext::new(2);
        mgr.lock(&a, 7, 3, LockMode::S, None).unwrap();
        mgr.lock(&b, 7, 3, LockMode::S, None).unwrap();

        let mgr2 = Arc::clone(&mgr);
        let waiter = thread::spawn(move || {
            let c = SimpleTxnContext::new(3);
            mgr2.lock(&c, 7, 3, LockMode::X, Some(Duration::from_millis(200)))
        });

        // a's release doesn't change max_mode (b's S still holds it), so no
        // signal fires for c; c must still time out rather than hang.
        mgr.unlock(&a, 7, 3).unwrap();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(LockError::TxnTimedOut { .. })
        ));

        mgr.unlock(&b, 7, 3).unwrap();
    }

    #[test]
    fn try_lock_never_runs_deadlock_detection() {
        let mgr = manager_without_deadlock_detection();
        let a = SimpleTxnContext::new(1);
        let b = SimpleTxnContext::new(2);

        mgr.lock(&a, 1, 1, LockMode::X, None).unwrap();
        mgr.lock(&b, 1, 2, LockMode::X, None).unwrap();

        // Neither side blocks here because try_lock fails fast instead of
        // forming a wait edge; no cycle is ever detected or aborted.
        assert!(mgr.try_lock(&a, 1, 2, LockMode::X).is_err());
        assert!(mgr.try_lock(&b, 1, 1, LockMode::X).is_err());

        mgr.release_locks(&a).unwrap();
        mgr.release_locks(&b).unwrap();
    }
}
