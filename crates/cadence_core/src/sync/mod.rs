//! # Scheduling
//!
//! Fences order the frame, updates do the work, and the lock table keeps
//! concurrent updates from touching the same component kind in
//! conflicting ways.
//!
//! ```text
//! Frame:
//!   Register   [serial..] [concurrent..]   -> lifecycle boundary
//!   Update     [serial..] [concurrent..]   -> lifecycle boundary
//!   Unregister [serial..] [concurrent..]   -> lifecycle boundary
//! ```
//!
//! Concurrent updates are admitted only when every read and write lock
//! they declared can be taken at once.

mod fence;
mod lock_table;
mod update;

pub use fence::{FenceId, FenceReport, FenceScheduler, PassReport, SchedulerPhase};
pub use lock_table::ComponentLockTable;
pub use update::{Update, UpdateContext, UpdateFn, UpdateMode};
