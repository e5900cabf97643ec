//! # Component Lock Table
//!
//! One reader counter and one writer counter per component kind.
//!
//! ```text
//! acquire_read(ids)        acquire_write(ids)
//!   readers[id] += 1         CAS writers[id] 0 -> 1
//!   writers[id] > 0 ?        readers[id] > 0 ?
//!     undo, roll back          undo, roll back
//! ```
//!
//! Both sides publish first and check second (all `SeqCst`), so a reader
//! and a writer racing on the same kind can never both be admitted. At
//! worst both back off and retry. Acquisition never blocks.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::ecs::ComponentId;
use crate::error::misuse;

/// Per-kind reader/writer admission counters, indexed by dense id.
pub struct ComponentLockTable {
    readers: Box<[AtomicI32]>,
    writers: Box<[AtomicI32]>,
}

impl ComponentLockTable {
    /// Creates a table with `slots` counters per side. Slot 0 is unused.
    #[must_use]
    pub fn new(slots: usize) -> Self {
        Self {
            readers: (0..slots).map(|_| AtomicI32::new(0)).collect(),
            writers: (0..slots).map(|_| AtomicI32::new(0)).collect(),
        }
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    /// Whether the table has no slots.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Takes a read lock on every kind in `ids`, or on none of them.
    ///
    /// Returns `false` without side effects if any kind is being written.
    #[must_use]
    pub fn acquire_read(&self, ids: &[ComponentId]) -> bool {
        for (taken, id) in ids.iter().enumerate() {
            let (Some(readers), Some(writers)) = (self.readers.get(id.index()), self.writers.get(id.index())) else {
                misuse!("read lock requested on unknown component kind {}", id);
                self.undo_reads(&ids[..taken]);
                return false;
            };
            readers.fetch_add(1, Ordering::SeqCst);
            if writers.load(Ordering::SeqCst) > 0 {
                readers.fetch_sub(1, Ordering::SeqCst);
                self.undo_reads(&ids[..taken]);
                return false;
            }
        }
        true
    }

    /// Takes a write lock on every kind in `ids`, or on none of them.
    ///
    /// Returns `false` without side effects if any kind is being read or
    /// written.
    #[must_use]
    pub fn acquire_write(&self, ids: &[ComponentId]) -> bool {
        for (taken, id) in ids.iter().enumerate() {
            let (Some(readers), Some(writers)) = (self.readers.get(id.index()), self.writers.get(id.index())) else {
                misuse!("write lock requested on unknown component kind {}", id);
                self.undo_writes(&ids[..taken]);
                return false;
            };
            if writers
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                self.undo_writes(&ids[..taken]);
                return false;
            }
            if readers.load(Ordering::SeqCst) > 0 {
                writers.fetch_sub(1, Ordering::SeqCst);
                self.undo_writes(&ids[..taken]);
                return false;
            }
        }
        true
    }

    /// Releases read locks taken by [`acquire_read`](Self::acquire_read).
    pub fn release_read(&self, ids: &[ComponentId]) {
        for id in ids {
            Self::release(&self.readers, *id, "read");
        }
    }

    /// Releases write locks taken by [`acquire_write`](Self::acquire_write).
    pub fn release_write(&self, ids: &[ComponentId]) {
        for id in ids {
            Self::release(&self.writers, *id, "write");
        }
    }

    /// Current reader count of a kind.
    #[must_use]
    pub fn readers(&self, id: ComponentId) -> i32 {
        self.readers.get(id.index()).map_or(0, |c| c.load(Ordering::SeqCst))
    }

    /// Current writer count of a kind.
    #[must_use]
    pub fn writers(&self, id: ComponentId) -> i32 {
        self.writers.get(id.index()).map_or(0, |c| c.load(Ordering::SeqCst))
    }

    /// Whether no lock of either kind is held.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.readers
            .iter()
            .chain(self.writers.iter())
            .all(|c| c.load(Ordering::SeqCst) == 0)
    }

    fn release(counters: &[AtomicI32], id: ComponentId, side: &str) {
        let Some(counter) = counters.get(id.index()) else {
            misuse!("{} lock released on unknown component kind {}", side, id);
            return;
        };
        let previous = counter.fetch_sub(1, Ordering::SeqCst);
        if previous <= 0 {
            counter.fetch_add(1, Ordering::SeqCst);
            misuse!("{} lock released on component kind {} that is not held", side, id);
        }
    }

    fn undo_reads(&self, ids: &[ComponentId]) {
        for id in ids {
            self.readers[id.index()].fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn undo_writes(&self, ids: &[ComponentId]) {
        for id in ids {
            self.writers[id.index()].fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for ComponentLockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentLockTable")
            .field("slots", &self.len())
            .field("idle", &self.is_idle())
            .finish()
    }
}
