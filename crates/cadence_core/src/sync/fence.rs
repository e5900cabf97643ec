//! # Fence Scheduler
//!
//! Fences are named checkpoints executed in a fixed total order every frame.
//! The built-ins always exist, in this order:
//!
//! ```text
//! Register ──► Update ──► Unregister
//! ```
//!
//! Systems insert their own fences before or after any existing fence
//! during initialization. The order is frozen by [`FenceScheduler::finalize`].
//!
//! ## Phases
//!
//! ```text
//! Uninitialized ─► AcceptingFences ─► AcceptingUpdates ─► Running ─► Steady
//!                                            ▲                          │
//!                                            └──── open_declarations ───┘
//! ```
//!
//! ## Execution of one fence
//!
//! 1. Serial updates run on the frame thread, in registration order.
//! 2. Concurrent updates are admitted through the [`ComponentLockTable`]
//!    (writes, then reads) and run on scoped worker threads. An update that
//!    cannot be admitted stays queued; the frame thread waits for a
//!    completion signal and tries again.
//! 3. The fence is complete once every concurrent update has finished.

use std::fmt;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::Span;

use super::lock_table::ComponentLockTable;
use super::update::{ScheduledUpdate, Update, UpdateContext, UpdateMode};
use crate::config::WorldConfig;
use crate::ecs::WorldAccess;
use crate::error::FenceError;

/// Lock-admission failures in one fence above which a warning is logged.
const RETRY_WARN_THRESHOLD: usize = 1024;

/// Name of a fence.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(&'static str);

impl FenceId {
    /// First built-in fence. Newly created entities become alive after it.
    pub const REGISTER: Self = Self("Register");
    /// Default fence for updates.
    pub const UPDATE: Self = Self("Update");
    /// Last built-in fence. Unregistering entities are destroyed after it.
    pub const UNREGISTER: Self = Self("Unregister");

    /// Creates a fence id.
    #[inline]
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Fence name.
    #[inline]
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.0
    }

    /// Whether this is one of the three built-in fences.
    #[must_use]
    pub fn is_builtin(self) -> bool {
        self == Self::REGISTER || self == Self::UPDATE || self == Self::UNREGISTER
    }
}

impl fmt::Debug for FenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Lifecycle phase of the scheduler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// Created, fence registration not opened yet.
    #[default]
    Uninitialized,
    /// Systems may create fences.
    AcceptingFences,
    /// Systems may declare updates.
    AcceptingUpdates,
    /// A pass is executing.
    Running,
    /// Between passes.
    Steady,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Anchor {
    Before,
    After,
}

#[derive(Clone, Copy, Debug)]
struct FenceRequest {
    fence: FenceId,
    target: FenceId,
    anchor: Anchor,
}

struct Fence {
    id: FenceId,
    one_shot: Vec<ScheduledUpdate>,
    constant: Vec<ScheduledUpdate>,
}

impl Fence {
    const fn new(id: FenceId) -> Self {
        Self {
            id,
            one_shot: Vec::new(),
            constant: Vec::new(),
        }
    }
}

/// What one fence execution did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FenceReport {
    /// The fence.
    pub fence: FenceId,
    /// Serial updates executed.
    pub serial: usize,
    /// Concurrent updates executed.
    pub concurrent: usize,
    /// Failed lock admissions.
    pub retries: usize,
    /// Wall time of the fence.
    pub elapsed: Duration,
}

impl FenceReport {
    const fn empty(fence: FenceId) -> Self {
        Self {
            fence,
            serial: 0,
            concurrent: 0,
            retries: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// What one pass over every fence did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Frame number of the pass.
    pub frame: u64,
    /// One report per fence, in fence order.
    pub fences: Vec<FenceReport>,
}

impl PassReport {
    /// Updates executed across all fences.
    #[must_use]
    pub fn total_updates(&self) -> usize {
        self.fences.iter().map(|f| f.serial + f.concurrent).sum()
    }

    /// Failed lock admissions across all fences.
    #[must_use]
    pub fn total_retries(&self) -> usize {
        self.fences.iter().map(|f| f.retries).sum()
    }

    /// Summed fence wall time.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.fences.iter().map(|f| f.elapsed).sum()
    }
}

/// Ordered fences and the updates declared against them.
pub struct FenceScheduler {
    phase: SchedulerPhase,
    fences: Vec<Fence>,
    requests: Vec<FenceRequest>,
    kind_count: usize,
    worker_threads: usize,
    distributed_tasks: usize,
    next_sequence: u64,
    frame: u64,
    span: Span,
}

impl FenceScheduler {
    /// Creates a scheduler holding only the built-in fences.
    ///
    /// # Arguments
    ///
    /// * `config` - Worker count and distributed sub-task count
    /// * `kind_count` - Number of registered component kinds, for access validation
    /// * `parent` - Span the scheduler logs under
    #[must_use]
    pub fn new(config: &WorldConfig, kind_count: usize, parent: &Span) -> Self {
        Self {
            phase: SchedulerPhase::Uninitialized,
            fences: builtin_fences(),
            requests: Vec::new(),
            kind_count,
            worker_threads: config.worker_threads.max(1),
            distributed_tasks: config.distributed_tasks.max(1),
            next_sequence: 0,
            frame: 0,
            span: tracing::debug_span!(parent: parent, "fence_scheduler"),
        }
    }

    /// Current phase.
    #[inline]
    #[must_use]
    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    /// Number of completed or running passes.
    #[inline]
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Opens fence registration.
    ///
    /// # Errors
    ///
    /// [`FenceError::WrongPhase`] unless the scheduler is uninitialized.
    pub fn begin_fence_registration(&mut self) -> Result<(), FenceError> {
        self.expect_phase(&[SchedulerPhase::Uninitialized], "begin_fence_registration")?;
        self.phase = SchedulerPhase::AcceptingFences;
        Ok(())
    }

    /// Requests `fence` immediately before `target`.
    ///
    /// # Errors
    ///
    /// Fails outside fence registration, for a duplicate id, for a fence
    /// anchored onto itself, or for a fence before Register.
    pub fn create_fence_before(&mut self, fence: FenceId, target: FenceId) -> Result<(), FenceError> {
        self.request(fence, target, Anchor::Before)
    }

    /// Requests `fence` immediately after `target`.
    ///
    /// # Errors
    ///
    /// Fails outside fence registration, for a duplicate id, for a fence
    /// anchored onto itself, or for a fence after Unregister.
    pub fn create_fence_after(&mut self, fence: FenceId, target: FenceId) -> Result<(), FenceError> {
        self.request(fence, target, Anchor::After)
    }

    fn request(&mut self, fence: FenceId, target: FenceId, anchor: Anchor) -> Result<(), FenceError> {
        let operation = match anchor {
            Anchor::Before => "create_fence_before",
            Anchor::After => "create_fence_after",
        };
        self.expect_phase(&[SchedulerPhase::AcceptingFences], operation)?;

        if fence == target {
            return Err(FenceError::SelfTarget(fence));
        }
        if fence.is_builtin() || self.requests.iter().any(|r| r.fence == fence) {
            return Err(FenceError::DuplicateFence(fence));
        }
        match (anchor, target) {
            (Anchor::Before, FenceId::REGISTER) => return Err(FenceError::BeforeRegister(fence)),
            (Anchor::After, FenceId::UNREGISTER) => return Err(FenceError::AfterUnregister(fence)),
            _ => {}
        }

        self.requests.push(FenceRequest { fence, target, anchor });
        Ok(())
    }

    /// Places every requested fence and freezes the order.
    ///
    /// Requests are spliced in registration order, in repeated passes, each
    /// one as soon as its target is placed. A pass that places nothing
    /// means a cycle or a missing target.
    ///
    /// # Errors
    ///
    /// - [`FenceError::UnresolvedFences`] for cycles or dangling targets
    /// - [`FenceError::OrderingConflict`] if verification fails
    ///
    /// On error only the built-in fences remain and every request is dropped.
    pub fn finalize(&mut self) -> Result<(), FenceError> {
        self.expect_phase(&[SchedulerPhase::AcceptingFences], "finalize")?;
        let _entered = self.span.enter();
        let requests = std::mem::take(&mut self.requests);

        let mut order = vec![FenceId::REGISTER, FenceId::UPDATE, FenceId::UNREGISTER];
        let mut remaining = requests.clone();
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|request| match order.iter().position(|f| *f == request.target) {
                Some(position) => {
                    let at = match request.anchor {
                        Anchor::Before => position,
                        Anchor::After => position + 1,
                    };
                    order.insert(at, request.fence);
                    false
                }
                None => true,
            });

            if remaining.len() == before {
                let unresolved: Vec<FenceId> = remaining.iter().map(|r| r.fence).collect();
                tracing::warn!(?unresolved, "fence requests could not be placed");
                self.fences = builtin_fences();
                return Err(FenceError::UnresolvedFences(unresolved));
            }
        }

        for request in &requests {
            let fence = order.iter().position(|f| *f == request.fence);
            let target = order.iter().position(|f| *f == request.target);
            let placed = match (fence, target, request.anchor) {
                (Some(f), Some(t), Anchor::Before) => f < t,
                (Some(f), Some(t), Anchor::After) => f > t,
                _ => false,
            };
            if !placed {
                self.fences = builtin_fences();
                return Err(FenceError::OrderingConflict {
                    fence: request.fence,
                    target: request.target,
                });
            }
        }

        self.fences = order.into_iter().map(Fence::new).collect();
        self.phase = SchedulerPhase::AcceptingUpdates;
        tracing::info!(order = ?self.fence_order(), "fence order finalized");
        Ok(())
    }

    /// Fence ids in execution order.
    #[must_use]
    pub fn fence_order(&self) -> Vec<FenceId> {
        self.fences.iter().map(|f| f.id).collect()
    }

    /// Number of fences.
    #[inline]
    #[must_use]
    pub fn fence_count(&self) -> usize {
        self.fences.len()
    }

    // ========================================================================
    // DECLARATIONS
    // ========================================================================

    /// Re-opens update declarations for the next pass.
    ///
    /// # Errors
    ///
    /// [`FenceError::WrongPhase`] before finalization or during a pass.
    pub fn open_declarations(&mut self) -> Result<(), FenceError> {
        self.expect_phase(
            &[SchedulerPhase::AcceptingUpdates, SchedulerPhase::Steady],
            "open_declarations",
        )?;
        self.phase = SchedulerPhase::AcceptingUpdates;
        Ok(())
    }

    /// Schedules `update` for the next execution of its fence only.
    ///
    /// # Errors
    ///
    /// Fails outside the declaration phase, for an unknown fence, or for
    /// invalid component access.
    pub fn schedule_update(&mut self, update: Update) -> Result<(), FenceError> {
        self.expect_phase(&[SchedulerPhase::AcceptingUpdates], "schedule_update")?;
        let position = self.position(update.fence()).ok_or(FenceError::FenceNotFound(update.fence()))?;
        update.validate(self.kind_count)?;

        let sequence = self.bump_sequence();
        self.span.in_scope(|| {
            tracing::trace!(update = update.name(), fence = %update.fence(), "one-shot update scheduled");
        });
        self.fences[position].one_shot.push(ScheduledUpdate::new(update, sequence));
        Ok(())
    }

    /// Runs `update` every pass until stopped by name.
    ///
    /// # Errors
    ///
    /// Fails outside the declaration phase, for an unknown fence, for a
    /// name already in use, or for invalid component access.
    pub fn start_constant_update(&mut self, update: Update) -> Result<(), FenceError> {
        self.expect_phase(&[SchedulerPhase::AcceptingUpdates], "start_constant_update")?;
        let position = self.position(update.fence()).ok_or(FenceError::FenceNotFound(update.fence()))?;
        if self.has_constant_update(update.name()) {
            return Err(FenceError::DuplicateUpdate(update.name().to_owned()));
        }
        update.validate(self.kind_count)?;

        let sequence = self.bump_sequence();
        self.span.in_scope(|| {
            tracing::debug!(update = update.name(), fence = %update.fence(), mode = ?update.update_mode(), "constant update started");
        });
        self.fences[position].constant.push(ScheduledUpdate::new(update, sequence));
        Ok(())
    }

    /// Stops the constant update called `name`.
    ///
    /// # Errors
    ///
    /// Fails outside the declaration phase or if no such update runs.
    pub fn stop_constant_update(&mut self, name: &str) -> Result<(), FenceError> {
        self.expect_phase(&[SchedulerPhase::AcceptingUpdates], "stop_constant_update")?;
        for fence in &mut self.fences {
            if let Some(index) = fence.constant.iter().position(|u| u.update.name() == name) {
                fence.constant.remove(index);
                self.span.in_scope(|| tracing::debug!(update = name, "constant update stopped"));
                return Ok(());
            }
        }
        Err(FenceError::UpdateNotFound(name.to_owned()))
    }

    /// Whether a constant update with this name runs.
    #[must_use]
    pub fn has_constant_update(&self, name: &str) -> bool {
        self.fences
            .iter()
            .flat_map(|f| &f.constant)
            .any(|u| u.update.name() == name)
    }

    /// Drops every constant and pending one-shot update. Returns how many
    /// constant updates were stopped.
    pub fn clear_updates(&mut self) -> usize {
        let mut stopped = 0;
        for fence in &mut self.fences {
            stopped += fence.constant.len();
            fence.constant.clear();
            fence.one_shot.clear();
        }
        stopped
    }

    /// Drops pending one-shot updates without running them. Returns how
    /// many were dropped. Constant updates stay.
    pub fn discard_one_shots(&mut self) -> usize {
        self.fences
            .iter_mut()
            .map(|fence| std::mem::take(&mut fence.one_shot).len())
            .sum()
    }

    // ========================================================================
    // EXECUTION
    // ========================================================================

    /// Starts a pass. Returns its frame number.
    ///
    /// # Errors
    ///
    /// [`FenceError::WrongPhase`] before finalization or during a pass.
    pub fn begin_pass(&mut self) -> Result<u64, FenceError> {
        self.expect_phase(&[SchedulerPhase::AcceptingUpdates, SchedulerPhase::Steady], "begin_pass")?;
        self.phase = SchedulerPhase::Running;
        self.frame += 1;
        Ok(self.frame)
    }

    /// Ends the running pass, if any.
    pub fn end_pass(&mut self) {
        if self.phase == SchedulerPhase::Running {
            self.phase = SchedulerPhase::Steady;
        }
    }

    /// Executes every update of one fence and discards its one-shots.
    ///
    /// Returns once all of them have finished.
    ///
    /// # Errors
    ///
    /// Fails outside a pass or for an unknown fence.
    pub fn run_fence(&mut self, fence: FenceId, world: &WorldAccess<'_>) -> Result<FenceReport, FenceError> {
        self.expect_phase(&[SchedulerPhase::Running], "run_fence")?;
        let position = self.position(fence).ok_or(FenceError::FenceNotFound(fence))?;
        let _entered = self.span.enter();
        let started = Instant::now();

        let frame = self.frame;
        let workers = self.worker_threads;
        let tasks = self.distributed_tasks;
        let slot = &mut self.fences[position];
        let one_shots = std::mem::take(&mut slot.one_shot);

        let mut batch: Vec<&ScheduledUpdate> = one_shots.iter().chain(&slot.constant).collect();
        batch.sort_by_key(|u| u.sequence);
        let (serial, concurrent): (Vec<&ScheduledUpdate>, Vec<&ScheduledUpdate>) =
            batch.into_iter().partition(|u| u.update.update_mode().is_serial());

        let mut report = FenceReport::empty(fence);
        for scheduled in &serial {
            scheduled.reset();
            let count = task_count(scheduled.update.update_mode(), tasks);
            for task_index in 0..count {
                scheduled.update.run(&UpdateContext {
                    fence,
                    name: scheduled.update.name(),
                    frame,
                    task_index,
                    task_count: count,
                    world,
                });
            }
            scheduled.finish();
            tracing::trace!(update = scheduled.update.name(), "serial update finished");
        }
        report.serial = serial.len();
        report.concurrent = concurrent.len();
        report.retries = run_concurrent(&concurrent, world, fence, frame, workers, tasks);
        debug_assert!(concurrent.iter().all(|u| u.is_finished()));
        report.elapsed = started.elapsed();

        if report.retries > RETRY_WARN_THRESHOLD {
            tracing::warn!(%fence, retries = report.retries, "lock admission retried repeatedly");
        }
        tracing::debug!(
            %fence,
            serial = report.serial,
            concurrent = report.concurrent,
            retries = report.retries,
            "fence complete"
        );
        Ok(report)
    }

    /// Runs one full pass: every fence, in order.
    ///
    /// Entity lifecycle boundaries are not applied; the world drives fences
    /// one by one for that.
    ///
    /// # Errors
    ///
    /// See [`begin_pass`](Self::begin_pass) and [`run_fence`](Self::run_fence).
    pub fn update_fences(&mut self, world: &WorldAccess<'_>) -> Result<PassReport, FenceError> {
        let frame = self.begin_pass()?;
        let mut report = PassReport {
            frame,
            fences: Vec::with_capacity(self.fences.len()),
        };
        for fence in self.fence_order() {
            match self.run_fence(fence, world) {
                Ok(fence_report) => report.fences.push(fence_report),
                Err(err) => {
                    self.end_pass();
                    return Err(err);
                }
            }
        }
        self.end_pass();
        Ok(report)
    }

    fn position(&self, fence: FenceId) -> Option<usize> {
        self.fences.iter().position(|f| f.id == fence)
    }

    fn bump_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn expect_phase(&self, allowed: &[SchedulerPhase], operation: &'static str) -> Result<(), FenceError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(FenceError::WrongPhase {
                operation,
                phase: self.phase,
            })
        }
    }
}

impl fmt::Debug for FenceScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceScheduler")
            .field("phase", &self.phase)
            .field("order", &self.fence_order())
            .field("frame", &self.frame)
            .finish_non_exhaustive()
    }
}

fn builtin_fences() -> Vec<Fence> {
    vec![
        Fence::new(FenceId::REGISTER),
        Fence::new(FenceId::UPDATE),
        Fence::new(FenceId::UNREGISTER),
    ]
}

fn task_count(mode: UpdateMode, distributed_tasks: usize) -> usize {
    if mode.is_distributed() {
        distributed_tasks.max(1)
    } else {
        1
    }
}

/// Sends the job's update index when dropped, so a panicking callback
/// still reports completion.
struct CompletionSignal<'a> {
    index: usize,
    done: &'a Sender<usize>,
}

impl Drop for CompletionSignal<'_> {
    fn drop(&mut self) {
        let _ = self.done.send(self.index);
    }
}

fn admit(locks: &ComponentLockTable, update: &Update) -> bool {
    if !locks.acquire_write(update.write_kinds()) {
        return false;
    }
    if !locks.acquire_read(update.read_kinds()) {
        locks.release_write(update.write_kinds());
        return false;
    }
    true
}

/// Admits and runs concurrent updates on scoped workers. Returns the number
/// of failed admissions.
fn run_concurrent(
    updates: &[&ScheduledUpdate],
    world: &WorldAccess<'_>,
    fence: FenceId,
    frame: u64,
    workers: usize,
    distributed_tasks: usize,
) -> usize {
    if updates.is_empty() {
        return 0;
    }
    let locks = world.registry().locks();
    let task_counts: Vec<usize> = updates
        .iter()
        .map(|u| task_count(u.update.update_mode(), distributed_tasks))
        .collect();
    let total_jobs: usize = task_counts.iter().sum();
    let mut remaining = task_counts.clone();
    let mut waiting: Vec<usize> = (0..updates.len()).collect();
    let mut retries = 0;
    for update in updates {
        update.reset();
    }

    std::thread::scope(|scope| {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, usize)>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<usize>();

        for _ in 0..workers.clamp(1, total_jobs) {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let task_counts = &task_counts;
            scope.spawn(move || {
                for (index, task_index) in job_rx.iter() {
                    let _signal = CompletionSignal { index, done: &done_tx };
                    let scheduled = updates[index];
                    scheduled.update.run(&UpdateContext {
                        fence,
                        name: scheduled.update.name(),
                        frame,
                        task_index,
                        task_count: task_counts[index],
                        world,
                    });
                }
            });
        }
        drop(job_rx);
        drop(done_tx);

        let mut in_flight = 0usize;
        while !waiting.is_empty() || in_flight > 0 {
            waiting.retain(|&index| {
                if in_flight >= workers {
                    return true;
                }
                if !admit(locks, &updates[index].update) {
                    retries += 1;
                    return true;
                }
                for task_index in 0..task_counts[index] {
                    let _ = job_tx.send((index, task_index));
                }
                in_flight += 1;
                false
            });

            if in_flight == 0 {
                // Locks are held outside this fence; nothing here can release them.
                std::thread::yield_now();
                continue;
            }

            let Ok(first) = done_rx.recv() else {
                break;
            };
            for index in std::iter::once(first).chain(done_rx.try_iter()) {
                remaining[index] -= 1;
                if remaining[index] > 0 {
                    continue;
                }
                let scheduled = updates[index];
                locks.release_read(scheduled.update.read_kinds());
                locks.release_write(scheduled.update.write_kinds());
                scheduled.finish();
                in_flight -= 1;
                tracing::trace!(update = scheduled.update.name(), "concurrent update finished");
            }
        }
        drop(job_tx);
    });

    retries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::{
        ArchetypeStore, Component, ComponentId, ComponentRegistry, ComponentType, EntityIdAllocator, FrameRequests,
    };
    use bytemuck::{Pod, Zeroable};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
        z: f32,
    }
    impl Component for Position {}

    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Health {
        current: u32,
        max: u32,
    }
    impl Component for Health {}

    const A: FenceId = FenceId::new("A");
    const B: FenceId = FenceId::new("B");
    const C: FenceId = FenceId::new("C");

    struct Harness {
        registry: ComponentRegistry,
        store: ArchetypeStore,
        allocator: EntityIdAllocator,
        requests: FrameRequests,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                registry: ComponentRegistry::build(&[ComponentType::of::<Position>(), ComponentType::of::<Health>()])
                    .unwrap(),
                store: ArchetypeStore::new(0, &Span::none()),
                allocator: EntityIdAllocator::new(),
                requests: FrameRequests::default(),
            }
        }

        fn access(&self) -> WorldAccess<'_> {
            WorldAccess::new(&self.registry, &self.store, &self.allocator, &self.requests)
        }
    }

    fn config(worker_threads: usize) -> WorldConfig {
        WorldConfig {
            worker_threads,
            distributed_tasks: 3,
            ..WorldConfig::default()
        }
    }

    fn scheduler(kind_count: usize) -> FenceScheduler {
        let mut scheduler = FenceScheduler::new(&config(4), kind_count, &Span::none());
        scheduler.begin_fence_registration().unwrap();
        scheduler
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &str) -> impl Fn(&UpdateContext<'_>) + Send + Sync + 'static {
        let log = Arc::clone(log);
        let label = label.to_owned();
        move |ctx| log.lock().push(format!("{}@{}", label, ctx.fence()))
    }

    #[test]
    fn test_builtin_order() {
        let mut scheduler = scheduler(0);
        scheduler.finalize().unwrap();
        assert_eq!(
            scheduler.fence_order(),
            vec![FenceId::REGISTER, FenceId::UPDATE, FenceId::UNREGISTER]
        );
        assert_eq!(scheduler.phase(), SchedulerPhase::AcceptingUpdates);
    }

    #[test]
    fn test_fence_chain_order() {
        let mut scheduler = scheduler(0);
        scheduler.create_fence_after(A, FenceId::UPDATE).unwrap();
        scheduler.create_fence_after(B, A).unwrap();
        scheduler.create_fence_before(C, B).unwrap();
        scheduler.finalize().unwrap();
        assert_eq!(
            scheduler.fence_order(),
            vec![FenceId::REGISTER, FenceId::UPDATE, A, C, B, FenceId::UNREGISTER]
        );
    }

    #[test]
    fn test_forward_reference_resolves_in_later_pass() {
        let mut scheduler = scheduler(0);
        scheduler.create_fence_before(C, A).unwrap();
        scheduler.create_fence_after(A, FenceId::REGISTER).unwrap();
        scheduler.finalize().unwrap();
        assert_eq!(
            scheduler.fence_order(),
            vec![FenceId::REGISTER, C, A, FenceId::UPDATE, FenceId::UNREGISTER]
        );
    }

    #[test]
    fn test_cycle_leaves_only_builtins() {
        let mut scheduler = scheduler(0);
        scheduler.create_fence_after(A, FenceId::UPDATE).unwrap();
        scheduler.create_fence_after(B, C).unwrap();
        scheduler.create_fence_before(C, B).unwrap();

        let err = scheduler.finalize().unwrap_err();
        assert_eq!(err, FenceError::UnresolvedFences(vec![B, C]));
        assert_eq!(
            scheduler.fence_order(),
            vec![FenceId::REGISTER, FenceId::UPDATE, FenceId::UNREGISTER]
        );
    }

    #[test]
    fn test_dangling_target_rejected() {
        let mut scheduler = scheduler(0);
        scheduler.create_fence_after(A, FenceId::new("missing")).unwrap();
        assert!(matches!(scheduler.finalize(), Err(FenceError::UnresolvedFences(_))));
        assert_eq!(scheduler.fence_count(), 3);
    }

    #[test]
    fn test_fence_request_errors() {
        let mut early = FenceScheduler::new(&config(1), 0, &Span::none());
        assert!(matches!(
            early.create_fence_after(A, FenceId::UPDATE),
            Err(FenceError::WrongPhase { .. })
        ));

        let mut scheduler = scheduler(0);
        assert_eq!(scheduler.create_fence_after(A, A), Err(FenceError::SelfTarget(A)));
        assert_eq!(
            scheduler.create_fence_before(A, FenceId::REGISTER),
            Err(FenceError::BeforeRegister(A))
        );
        assert_eq!(
            scheduler.create_fence_after(A, FenceId::UNREGISTER),
            Err(FenceError::AfterUnregister(A))
        );
        assert_eq!(
            scheduler.create_fence_after(FenceId::UPDATE, FenceId::REGISTER),
            Err(FenceError::DuplicateFence(FenceId::UPDATE))
        );
        scheduler.create_fence_after(A, FenceId::UPDATE).unwrap();
        assert_eq!(
            scheduler.create_fence_before(A, FenceId::UNREGISTER),
            Err(FenceError::DuplicateFence(A))
        );

        scheduler.finalize().unwrap();
        assert!(matches!(
            scheduler.create_fence_after(B, A),
            Err(FenceError::WrongPhase { .. })
        ));
    }

    #[test]
    fn test_declaration_errors() {
        let mut scheduler = scheduler(2);
        assert!(matches!(
            scheduler.schedule_update(Update::new("early", |_| {})),
            Err(FenceError::WrongPhase { .. })
        ));
        scheduler.finalize().unwrap();

        assert_eq!(
            scheduler.schedule_update(Update::new("lost", |_| {}).on(A)),
            Err(FenceError::FenceNotFound(A))
        );
        scheduler.start_constant_update(Update::new("tick", |_| {})).unwrap();
        assert_eq!(
            scheduler.start_constant_update(Update::new("tick", |_| {})),
            Err(FenceError::DuplicateUpdate("tick".into()))
        );
        assert!(matches!(
            scheduler.schedule_update(Update::new("bad", |_| {}).writes([ComponentId::new(3)])),
            Err(FenceError::UnknownComponent { .. })
        ));
        assert_eq!(
            scheduler.stop_constant_update("nope"),
            Err(FenceError::UpdateNotFound("nope".into()))
        );
        scheduler.stop_constant_update("tick").unwrap();
        assert!(!scheduler.has_constant_update("tick"));
    }

    #[test]
    fn test_serial_order_and_one_shot_discarded() {
        let harness = Harness::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = scheduler(2);
        scheduler.create_fence_after(A, FenceId::UPDATE).unwrap();
        scheduler.finalize().unwrap();

        scheduler.start_constant_update(Update::new("const", recorder(&log, "const")).on(A)).unwrap();
        scheduler.schedule_update(Update::new("once", recorder(&log, "once"))).unwrap();
        scheduler.schedule_update(Update::new("reg", recorder(&log, "reg")).on(FenceId::REGISTER)).unwrap();

        let report = scheduler.update_fences(&harness.access()).unwrap();
        assert_eq!(report.frame, 1);
        assert_eq!(report.total_updates(), 3);
        assert_eq!(*log.lock(), vec!["reg@Register", "once@Update", "const@A"]);

        log.lock().clear();
        scheduler.open_declarations().unwrap();
        scheduler.update_fences(&harness.access()).unwrap();
        assert_eq!(*log.lock(), vec!["const@A"]);
    }

    #[test]
    fn test_discarded_one_shots_never_run() {
        let harness = Harness::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = scheduler(2);
        scheduler.finalize().unwrap();

        scheduler.start_constant_update(Update::new("const", recorder(&log, "const"))).unwrap();
        scheduler.schedule_update(Update::new("once", recorder(&log, "once"))).unwrap();
        scheduler.schedule_update(Update::new("reg", recorder(&log, "reg")).on(FenceId::REGISTER)).unwrap();
        assert_eq!(scheduler.discard_one_shots(), 2);

        scheduler.open_declarations().unwrap();
        let report = scheduler.update_fences(&harness.access()).unwrap();
        assert_eq!(report.total_updates(), 1);
        assert_eq!(*log.lock(), vec!["const@Update"]);
    }

    #[test]
    fn test_serial_runs_before_concurrent() {
        let harness = Harness::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = scheduler(2);
        scheduler.finalize().unwrap();

        scheduler
            .schedule_update(Update::new("par", recorder(&log, "par")).mode(UpdateMode::Concurrent))
            .unwrap();
        scheduler.schedule_update(Update::new("ser", recorder(&log, "ser"))).unwrap();
        let report = scheduler.update_fences(&harness.access()).unwrap();

        assert_eq!(*log.lock(), vec!["ser@Update", "par@Update"]);
        assert_eq!(report.fences[1].serial, 1);
        assert_eq!(report.fences[1].concurrent, 1);
    }

    #[test]
    fn test_conflicting_writers_all_complete_and_locks_released() {
        let harness = Harness::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = scheduler(2);
        scheduler.finalize().unwrap();

        let position = ComponentId::new(1);
        let health = ComponentId::new(2);
        for i in 0..8 {
            let counter = Arc::clone(&counter);
            let update = Update::new(format!("writer-{i}"), move |ctx| {
                let locks = ctx.world().registry().locks();
                assert_eq!(locks.writers(position), 1);
                assert_eq!(locks.readers(position), 0);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .mode(UpdateMode::Concurrent)
            .writes([position])
            .reads([health]);
            scheduler.schedule_update(update).unwrap();
        }

        scheduler.update_fences(&harness.access()).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert!(harness.registry.locks().is_idle());
    }

    #[test]
    fn test_distributed_modes_run_every_sub_task() {
        let harness = Harness::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = scheduler(2);
        scheduler.finalize().unwrap();

        for mode in [UpdateMode::SerialDistributed, UpdateMode::ConcurrentDistributed] {
            let seen = Arc::clone(&seen);
            scheduler
                .schedule_update(Update::new(format!("{mode:?}"), move |ctx| {
                    seen.lock().push((ctx.name().to_owned(), ctx.task_index(), ctx.task_count()));
                }).mode(mode))
                .unwrap();
        }
        scheduler.update_fences(&harness.access()).unwrap();

        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen.len(), 6);
        assert!(seen.iter().all(|(_, _, count)| *count == 3));
        let concurrent: Vec<usize> = seen
            .iter()
            .filter(|(name, _, _)| name == "ConcurrentDistributed")
            .map(|(_, task, _)| *task)
            .collect();
        assert_eq!(concurrent, vec![0, 1, 2]);
    }

    #[test]
    fn test_pass_phase_transitions() {
        let harness = Harness::new();
        let mut scheduler = scheduler(0);
        scheduler.finalize().unwrap();
        assert!(matches!(
            scheduler.run_fence(FenceId::UPDATE, &harness.access()),
            Err(FenceError::WrongPhase { .. })
        ));

        scheduler.begin_pass().unwrap();
        assert_eq!(scheduler.phase(), SchedulerPhase::Running);
        assert!(matches!(scheduler.open_declarations(), Err(FenceError::WrongPhase { .. })));
        scheduler.end_pass();
        assert_eq!(scheduler.phase(), SchedulerPhase::Steady);
        scheduler.open_declarations().unwrap();
    }
}
