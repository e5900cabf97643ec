//! # Archetype Collections
//!
//! One [`EntityCollection`] per unique [`ComponentSequence`].
//!
//! ## Generations
//!
//! ```text
//!            create_entity (&self, any thread)
//!                       │
//!                       ▼
//!   ┌──────────┐  commit_changes  ┌──────────┐
//!   │ pending  │ ───────────────► │ current  │ ◄── read/write guards
//!   └──────────┘   (&mut self)    └──────────┘     (updates)
//! ```
//!
//! Creation appends to the pending generation behind its own lock, so it
//! never blocks readers of the current generation. `commit_changes` sweeps
//! DESTROYED rows out of current with swap-remove, then migrates pending.
//! Positional indices are invalid after a commit; [`RowIndex`] borrows the
//! collection so they cannot be carried across one.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::component::{Component, ComponentId, ComponentRegistry, ComponentSequence, DefinitionId};
use super::entity::{EntityId, LifeState};
use super::storage::{Column, ErasedColumn};
use crate::error::CollectionError;

/// Stable handle of a collection inside the store. Collections are never
/// removed, so a handle stays valid for the lifetime of the world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    /// Position in discovery order.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "archetype:{}", self.0)
    }
}

/// Row position valid only while the collection is borrowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowIndex<'a> {
    row: usize,
    _collection: PhantomData<&'a EntityCollection>,
}

impl RowIndex<'_> {
    const fn new(row: usize) -> Self {
        Self {
            row,
            _collection: PhantomData,
        }
    }

    /// The row number.
    #[inline]
    #[must_use]
    pub const fn get(self) -> usize {
        self.row
    }
}

/// Outcome of one `commit_changes`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// DESTROYED entities swept from current, plus pending entities
    /// destroyed before they were ever committed.
    pub removed: Vec<EntityId>,
    /// Pending entities moved into current, with their committed ids.
    pub migrated: Vec<EntityId>,
}

impl CommitReport {
    /// Whether the commit changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.migrated.is_empty()
    }
}

/// Entities created this frame.
struct PendingGeneration {
    ids: Vec<EntityId>,
    columns: Vec<Box<dyn ErasedColumn>>,
    rows: HashMap<u32, usize>,
}

impl PendingGeneration {
    fn empty() -> Self {
        Self {
            ids: Vec::new(),
            columns: Vec::new(),
            rows: HashMap::new(),
        }
    }
}

/// Storage for every entity sharing one component sequence.
pub struct EntityCollection {
    sequence: ComponentSequence,
    definitions: Vec<DefinitionId>,
    ids: Vec<EntityId>,
    columns: Vec<RwLock<Box<dyn ErasedColumn>>>,
    /// Raw id -> row in `ids`.
    rows: HashMap<u32, usize>,
    pending: Mutex<PendingGeneration>,
}

impl EntityCollection {
    /// Creates an uninitialized collection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sequence: ComponentSequence::default(),
            definitions: Vec::new(),
            ids: Vec::new(),
            columns: Vec::new(),
            rows: HashMap::new(),
            pending: Mutex::new(PendingGeneration::empty()),
        }
    }

    /// Binds the collection to `sequence` and optionally attaches a definition.
    ///
    /// The first call allocates one column per kind; later calls must pass
    /// the same sequence and only attach definitions.
    ///
    /// # Errors
    ///
    /// - [`CollectionError::EmptySequence`] for an empty sequence
    /// - [`CollectionError::SequenceMismatch`] if already bound to another sequence
    /// - [`CollectionError::UnknownKind`] if the registry cannot build a column
    pub fn initialize(
        &mut self,
        registry: &ComponentRegistry,
        definition: Option<DefinitionId>,
        sequence: &ComponentSequence,
    ) -> Result<(), CollectionError> {
        if sequence.is_empty() {
            return Err(CollectionError::EmptySequence);
        }

        if self.sequence.is_empty() {
            let mut current = Vec::with_capacity(sequence.len());
            let mut pending = Vec::with_capacity(sequence.len());
            for kind in sequence.iter() {
                let column = registry
                    .create_column(kind)
                    .map_err(|_| CollectionError::UnknownKind(kind))?;
                pending.push(registry.create_column(kind).map_err(|_| CollectionError::UnknownKind(kind))?);
                current.push(RwLock::new(column));
            }
            self.columns = current;
            self.pending.get_mut().columns = pending;
            self.sequence = sequence.clone();
        } else if self.sequence != *sequence {
            return Err(CollectionError::SequenceMismatch {
                expected: self.sequence.clone(),
                found: sequence.clone(),
            });
        }

        if let Some(definition) = definition {
            if self.definitions.contains(&definition) {
                tracing::warn!(%definition, "definition already attached to collection");
            } else {
                self.definitions.push(definition);
            }
        }
        Ok(())
    }

    /// Reserves room for `additional` pending entities.
    pub fn reserve_pending(&mut self, additional: usize) {
        let pending = self.pending.get_mut();
        pending.ids.reserve(additional);
        pending.rows.reserve(additional);
        for column in &mut pending.columns {
            column.reserve(additional);
        }
    }

    /// Appends `id` with default-constructed components to the pending
    /// generation.
    pub fn create_entity(&self, id: EntityId) {
        let mut pending = self.pending.lock();
        let row = pending.ids.len();
        pending.ids.push(id);
        for column in &mut pending.columns {
            column.push_default();
        }
        pending.rows.insert(id.raw_id(), row);
    }

    /// Overwrites the flags of `id` with those of `new_id`.
    ///
    /// `id` is matched by full value, first in current, then in pending.
    ///
    /// # Errors
    ///
    /// - [`CollectionError::RawIdMismatch`] if the raw ids differ
    /// - [`CollectionError::IllegalTransition`] for an illegal life-state change
    /// - [`CollectionError::NotFound`] if `id` is not stored here
    pub fn update_entity(&mut self, id: EntityId, new_id: EntityId) -> Result<(), CollectionError> {
        if id.raw_id() != new_id.raw_id() {
            return Err(CollectionError::RawIdMismatch { from: id, to: new_id });
        }
        if EntityId::is_life_changed(id, new_id) {
            id.transition(new_id.life_state())?;
        }

        if let Some(&row) = self.rows.get(&id.raw_id()) {
            if self.ids[row] == id {
                self.ids[row] = new_id;
                return Ok(());
            }
        }

        let pending = self.pending.get_mut();
        match pending.rows.get(&id.raw_id()) {
            Some(&row) if pending.ids[row] == id => {
                pending.ids[row] = new_id;
                Ok(())
            }
            _ => Err(CollectionError::NotFound(id)),
        }
    }

    /// Sweeps DESTROYED entities from current and migrates pending.
    ///
    /// # Errors
    ///
    /// Returns [`CollectionError::ColumnCopy`] if a pending column does not
    /// match its current column. Cannot happen for collections built by
    /// [`initialize`](Self::initialize).
    pub fn commit_changes(&mut self) -> Result<CommitReport, CollectionError> {
        let mut report = CommitReport::default();

        let mut row = 0;
        while row < self.ids.len() {
            let id = self.ids[row];
            if id.life_state() != LifeState::Destroyed {
                row += 1;
                continue;
            }
            self.ids.swap_remove(row);
            for column in &mut self.columns {
                column.get_mut().swap_remove(row);
            }
            self.rows.remove(&id.raw_id());
            if let Some(moved) = self.ids.get(row) {
                self.rows.insert(moved.raw_id(), row);
            }
            report.removed.push(id);
        }

        let pending = self.pending.get_mut();
        for (row, id) in pending.ids.iter().enumerate() {
            if id.life_state() == LifeState::Destroyed {
                report.removed.push(*id);
                continue;
            }
            for (column, source) in self.columns.iter_mut().zip(&pending.columns) {
                column.get_mut().push_from(source.as_ref(), row)?;
            }
            self.rows.insert(id.raw_id(), self.ids.len());
            self.ids.push(*id);
            report.migrated.push(*id);
        }

        pending.ids.clear();
        pending.rows.clear();
        for column in &mut pending.columns {
            column.clear();
        }
        Ok(report)
    }

    /// Row of `id` in current, matched by full value.
    #[must_use]
    pub fn get_index(&self, id: EntityId) -> Option<RowIndex<'_>> {
        self.rows
            .get(&id.raw_id())
            .copied()
            .filter(|&row| self.ids[row] == id)
            .map(RowIndex::new)
    }

    /// Row of `id` in pending, matched by full value.
    #[must_use]
    pub fn get_new_index(&self, id: EntityId) -> Option<RowIndex<'_>> {
        let pending = self.pending.lock();
        pending
            .rows
            .get(&id.raw_id())
            .copied()
            .filter(|&row| pending.ids[row] == id)
            .map(RowIndex::new)
    }

    /// Row of `id` in current, matched by raw id with a linear scan.
    #[must_use]
    pub fn get_index_slow(&self, id: EntityId) -> Option<RowIndex<'_>> {
        self.ids
            .iter()
            .position(|e| e.raw_id() == id.raw_id())
            .map(RowIndex::new)
    }

    /// Row of `id` in pending, matched by raw id with a linear scan.
    #[must_use]
    pub fn get_new_index_slow(&self, id: EntityId) -> Option<RowIndex<'_>> {
        self.pending
            .lock()
            .ids
            .iter()
            .position(|e| e.raw_id() == id.raw_id())
            .map(RowIndex::new)
    }

    /// Current value of the entity with this raw id, looking in current
    /// first, then pending.
    #[must_use]
    pub fn entity(&self, raw: u32) -> Option<EntityId> {
        if let Some(&row) = self.rows.get(&raw) {
            return Some(self.ids[row]);
        }
        let pending = self.pending.lock();
        pending.rows.get(&raw).map(|&row| pending.ids[row])
    }

    /// Read guard over the current column of `kind`.
    ///
    /// Blocks while a write guard on the same column is alive.
    ///
    /// # Errors
    ///
    /// - [`CollectionError::MissingKind`] if `kind` is not in the sequence
    /// - [`CollectionError::ColumnType`] if the column does not store `T`
    pub fn read<T: Component>(&self, kind: ComponentId) -> Result<MappedRwLockReadGuard<'_, [T]>, CollectionError> {
        let position = self.sequence.position(kind).ok_or(CollectionError::MissingKind(kind))?;
        RwLockReadGuard::try_map(self.columns[position].read(), typed_column::<T>).map_err(|_| {
            CollectionError::ColumnType {
                kind,
                requested: type_name::<T>(),
            }
        })
    }

    /// Write guard over the current column of `kind`.
    ///
    /// Blocks while any other guard on the same column is alive, including
    /// sub-tasks of the same distributed update.
    ///
    /// # Errors
    ///
    /// - [`CollectionError::MissingKind`] if `kind` is not in the sequence
    /// - [`CollectionError::ColumnType`] if the column does not store `T`
    pub fn write<T: Component>(&self, kind: ComponentId) -> Result<MappedRwLockWriteGuard<'_, [T]>, CollectionError> {
        let position = self.sequence.position(kind).ok_or(CollectionError::MissingKind(kind))?;
        RwLockWriteGuard::try_map(self.columns[position].write(), typed_column_mut::<T>).map_err(|_| {
            CollectionError::ColumnType {
                kind,
                requested: type_name::<T>(),
            }
        })
    }

    /// Copy of the raw bytes of the current column of `kind`.
    #[must_use]
    pub fn column_bytes(&self, kind: ComponentId) -> Option<Vec<u8>> {
        let position = self.sequence.position(kind)?;
        Some(self.columns[position].read().bytes().to_vec())
    }

    /// The sequence this collection is keyed by.
    #[inline]
    #[must_use]
    pub fn sequence(&self) -> &ComponentSequence {
        &self.sequence
    }

    /// Definitions attached to this collection.
    #[inline]
    #[must_use]
    pub fn definitions(&self) -> &[DefinitionId] {
        &self.definitions
    }

    /// Entity ids of the current generation, in row order.
    #[inline]
    #[must_use]
    pub fn entities(&self) -> &[EntityId] {
        &self.ids
    }

    /// Number of entities in current.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether current is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of entities waiting in pending.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().ids.len()
    }
}

impl Default for EntityCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntityCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCollection")
            .field("sequence", &self.sequence)
            .field("definitions", &self.definitions)
            .field("len", &self.ids.len())
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::borrowed_box)]
fn typed_column<T: Component>(column: &Box<dyn ErasedColumn>) -> Option<&[T]> {
    column.as_any().downcast_ref::<Column<T>>().map(Column::as_slice)
}

#[allow(clippy::borrowed_box)]
fn typed_column_mut<T: Component>(column: &mut Box<dyn ErasedColumn>) -> Option<&mut [T]> {
    column
        .as_any_mut()
        .downcast_mut::<Column<T>>()
        .map(Column::as_mut_slice)
}
