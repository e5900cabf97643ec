//! # Updates
//!
//! An [`Update`] is a callback bound to one fence, together with the
//! component kinds it reads and writes. Declared access is what the lock
//! table admits concurrent updates on; access that is not declared is not
//! checked.
//!
//! ```rust,ignore
//! let update = Update::new("integrate", |ctx| { /* ... */ })
//!     .on(FenceId::UPDATE)
//!     .mode(UpdateMode::Concurrent)
//!     .reads([velocity])
//!     .writes([position]);
//! ```

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

use super::fence::FenceId;
use crate::ecs::{ComponentId, WorldAccess};
use crate::error::FenceError;

/// Callback executed by the scheduler.
pub type UpdateFn = Box<dyn Fn(&UpdateContext<'_>) + Send + Sync>;

/// How an update is executed within its fence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum UpdateMode {
    /// Once, on the frame thread, before any concurrent update.
    #[default]
    Serial,
    /// Once per sub-task, sequentially on the frame thread.
    SerialDistributed,
    /// Once, on a worker thread, after lock admission.
    Concurrent,
    /// Once per sub-task on worker threads, under one lock admission.
    ///
    /// Sub-tasks that take the write guard of the same column run one
    /// after another; only reads and work outside the guard overlap.
    ConcurrentDistributed,
}

impl UpdateMode {
    /// Whether the update runs on the frame thread.
    #[inline]
    #[must_use]
    pub const fn is_serial(self) -> bool {
        matches!(self, Self::Serial | Self::SerialDistributed)
    }

    /// Whether the callback is split into sub-tasks.
    #[inline]
    #[must_use]
    pub const fn is_distributed(self) -> bool {
        matches!(self, Self::SerialDistributed | Self::ConcurrentDistributed)
    }
}

/// What an update sees while it runs.
pub struct UpdateContext<'a> {
    pub(crate) fence: FenceId,
    pub(crate) name: &'a str,
    pub(crate) frame: u64,
    pub(crate) task_index: usize,
    pub(crate) task_count: usize,
    pub(crate) world: &'a WorldAccess<'a>,
}

impl<'a> UpdateContext<'a> {
    /// Fence being executed.
    #[inline]
    #[must_use]
    pub fn fence(&self) -> FenceId {
        self.fence
    }

    /// Name of the running update.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        self.name
    }

    /// Frame number, starting at 1.
    #[inline]
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Sub-task index, `0..task_count`.
    #[inline]
    #[must_use]
    pub fn task_index(&self) -> usize {
        self.task_index
    }

    /// Number of sub-tasks. `1` for non-distributed modes.
    #[inline]
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.task_count
    }

    /// The world, as visible to updates.
    #[inline]
    #[must_use]
    pub fn world(&self) -> &'a WorldAccess<'a> {
        self.world
    }

    /// Half-open row range this sub-task owns out of `len` rows.
    ///
    /// Splits `len` into `task_count` contiguous chunks; earlier tasks take
    /// the remainder. The range partitions work, not locking: a column
    /// write guard still covers the whole column.
    #[must_use]
    pub fn task_range(&self, len: usize) -> Range<usize> {
        split_rows(len, self.task_index, self.task_count)
    }
}

fn split_rows(len: usize, index: usize, count: usize) -> Range<usize> {
    let count = count.max(1);
    let base = len / count;
    let extra = len % count;
    let start = index * base + index.min(extra);
    let size = base + usize::from(index < extra);
    start.min(len)..(start + size).min(len)
}

/// A per-frame callback declaration.
pub struct Update {
    name: String,
    callback: UpdateFn,
    fence: FenceId,
    mode: UpdateMode,
    reads: Vec<ComponentId>,
    writes: Vec<ComponentId>,
}

impl Update {
    /// Creates a serial update on the Update fence with no declared access.
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&UpdateContext<'_>) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(callback),
            fence: FenceId::UPDATE,
            mode: UpdateMode::Serial,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Binds the update to `fence`.
    #[must_use]
    pub fn on(mut self, fence: FenceId) -> Self {
        self.fence = fence;
        self
    }

    /// Sets the execution mode.
    #[must_use]
    pub fn mode(mut self, mode: UpdateMode) -> Self {
        self.mode = mode;
        self
    }

    /// Declares component kinds read by the callback.
    #[must_use]
    pub fn reads(mut self, kinds: impl IntoIterator<Item = ComponentId>) -> Self {
        self.reads.extend(kinds);
        self
    }

    /// Declares component kinds written by the callback.
    #[must_use]
    pub fn writes(mut self, kinds: impl IntoIterator<Item = ComponentId>) -> Self {
        self.writes.extend(kinds);
        self
    }

    /// Update name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fence the update runs in.
    #[inline]
    #[must_use]
    pub fn fence(&self) -> FenceId {
        self.fence
    }

    /// Execution mode.
    #[inline]
    #[must_use]
    pub fn update_mode(&self) -> UpdateMode {
        self.mode
    }

    /// Declared reads.
    #[inline]
    #[must_use]
    pub fn read_kinds(&self) -> &[ComponentId] {
        &self.reads
    }

    /// Declared writes.
    #[inline]
    #[must_use]
    pub fn write_kinds(&self) -> &[ComponentId] {
        &self.writes
    }

    /// Checks declared access against the registry size.
    ///
    /// # Errors
    ///
    /// [`FenceError::UnknownComponent`], [`FenceError::DuplicateAccess`] or
    /// [`FenceError::AccessOverlap`], in that order of precedence.
    pub(crate) fn validate(&self, kind_count: usize) -> Result<(), FenceError> {
        let mut all = self.reads.iter().chain(&self.writes);
        if let Some(kind) = all.find(|k| k.is_invalid() || k.index() > kind_count) {
            return Err(FenceError::UnknownComponent {
                update: self.name.clone(),
                kind: *kind,
            });
        }

        for list in [&self.reads, &self.writes] {
            let mut seen = HashSet::with_capacity(list.len());
            if let Some(kind) = list.iter().find(|k| !seen.insert(**k)) {
                return Err(FenceError::DuplicateAccess {
                    update: self.name.clone(),
                    kind: *kind,
                });
            }
        }

        if let Some(kind) = self.reads.iter().find(|k| self.writes.contains(*k)) {
            return Err(FenceError::AccessOverlap {
                update: self.name.clone(),
                kind: *kind,
            });
        }
        Ok(())
    }

    pub(crate) fn run(&self, ctx: &UpdateContext<'_>) {
        (self.callback)(ctx);
    }
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Update")
            .field("name", &self.name)
            .field("fence", &self.fence)
            .field("mode", &self.mode)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish_non_exhaustive()
    }
}

/// An update placed in a fence, in registration order.
#[derive(Debug)]
pub(crate) struct ScheduledUpdate {
    pub(crate) update: Update,
    pub(crate) sequence: u64,
    finished: AtomicBool,
}

impl ScheduledUpdate {
    pub(crate) fn new(update: Update, sequence: u64) -> Self {
        Self {
            update,
            sequence,
            finished: AtomicBool::new(false),
        }
    }

    pub(crate) fn reset(&self) {
        self.finished.store(false, Ordering::Release);
    }

    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}
