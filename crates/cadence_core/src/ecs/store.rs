//! # Archetype Store
//!
//! Owns every [`EntityCollection`] by value. Collections are created the
//! first time a sequence is needed and never removed, so [`ArchetypeId`]
//! handles stay valid. Entities are found through a raw id -> archetype
//! location map.
//!
//! The archetype index is rebuilt lazily: creating a collection or
//! registering a definition marks the store dirty, and
//! [`refresh_index`](ArchetypeStore::refresh_index) rebuilds only then.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::Span;

use super::archetype::{ArchetypeId, CommitReport, EntityCollection};
use super::component::{ComponentId, ComponentRegistry, ComponentSequence, DefinitionId, EntityDefinition, LoadState};
use super::entity::EntityId;
use super::index::ArchetypeIndex;
use crate::error::{CollectionError, WorldError, WorldResult};

/// A definition bound to its collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefinitionSlot {
    /// Collection entities of this definition live in.
    pub archetype: ArchetypeId,
    /// Load state reported by the asset layer.
    pub load_state: LoadState,
}

/// Every collection of the world.
#[derive(Debug)]
pub struct ArchetypeStore {
    collections: Vec<EntityCollection>,
    by_sequence: HashMap<ComponentSequence, ArchetypeId>,
    definitions: HashMap<DefinitionId, DefinitionSlot>,
    /// Raw id -> collection, for current and pending entities.
    locations: RwLock<HashMap<u32, ArchetypeId>>,
    index: ArchetypeIndex,
    dirty: bool,
    pending_capacity: usize,
    span: Span,
}

impl ArchetypeStore {
    /// Creates an empty store. New collections reserve `pending_capacity`
    /// pending rows.
    #[must_use]
    pub fn new(pending_capacity: usize, parent: &Span) -> Self {
        Self {
            collections: Vec::new(),
            by_sequence: HashMap::new(),
            definitions: HashMap::new(),
            locations: RwLock::new(HashMap::new()),
            index: ArchetypeIndex::default(),
            dirty: false,
            pending_capacity,
            span: tracing::debug_span!(parent: parent, "archetype_store"),
        }
    }

    /// Returns the collection for `sequence`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Fails if the sequence is empty or names a kind without a column.
    pub fn get_or_create(
        &mut self,
        registry: &ComponentRegistry,
        sequence: &ComponentSequence,
    ) -> Result<ArchetypeId, CollectionError> {
        if let Some(&id) = self.by_sequence.get(sequence) {
            return Ok(id);
        }

        let mut collection = EntityCollection::new();
        collection.initialize(registry, None, sequence)?;
        collection.reserve_pending(self.pending_capacity);

        let id = ArchetypeId(u32::try_from(self.collections.len()).unwrap_or(u32::MAX));
        self.collections.push(collection);
        self.by_sequence.insert(sequence.clone(), id);
        self.dirty = true;

        self.span.in_scope(|| {
            tracing::debug!(%id, kinds = sequence.len(), "archetype created");
        });
        Ok(id)
    }

    /// Binds a definition to the collection of its component list.
    ///
    /// # Errors
    ///
    /// Fails if a component type is unregistered or the list is empty.
    pub fn register_definition(
        &mut self,
        registry: &ComponentRegistry,
        definition: &EntityDefinition,
    ) -> WorldResult<ArchetypeId> {
        let sequence = registry.sequence_of(&definition.components)?;
        let archetype = self.get_or_create(registry, &sequence)?;
        self.collections[archetype.index()].initialize(registry, Some(definition.id), &sequence)?;
        self.definitions.insert(
            definition.id,
            DefinitionSlot {
                archetype,
                load_state: definition.load_state,
            },
        );
        self.dirty = true;

        self.span.in_scope(|| {
            tracing::debug!(definition = %definition.id, name = %definition.name, %archetype, "definition registered");
        });
        Ok(archetype)
    }

    /// Updates the load state of a registered definition.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::UnknownDefinition`] if it was never registered.
    pub fn set_load_state(&mut self, definition: DefinitionId, load_state: LoadState) -> WorldResult<()> {
        let slot = self
            .definitions
            .get_mut(&definition)
            .ok_or(WorldError::UnknownDefinition(definition))?;
        slot.load_state = load_state;
        Ok(())
    }

    /// The slot of a registered definition.
    #[must_use]
    pub fn definition(&self, definition: DefinitionId) -> Option<DefinitionSlot> {
        self.definitions.get(&definition).copied()
    }

    /// The collection keyed by `sequence`, if it exists.
    #[must_use]
    pub fn archetype_of(&self, sequence: &ComponentSequence) -> Option<ArchetypeId> {
        self.by_sequence.get(sequence).copied()
    }

    /// Appends `id` to the pending generation of `archetype`.
    ///
    /// # Errors
    ///
    /// Returns [`CollectionError::UnknownArchetype`] if the handle is out of
    /// range.
    pub fn create_entity(&self, archetype: ArchetypeId, id: EntityId) -> WorldResult<()> {
        let collection = self
            .collections
            .get(archetype.index())
            .ok_or(CollectionError::UnknownArchetype(archetype))?;
        collection.create_entity(id);
        self.locations.write().insert(id.raw_id(), archetype);
        Ok(())
    }

    /// Overwrites the flags of a stored entity.
    ///
    /// # Errors
    ///
    /// See [`EntityCollection::update_entity`].
    pub fn update_entity(&mut self, id: EntityId, new_id: EntityId) -> Result<(), CollectionError> {
        let archetype = self.locate(id.raw_id()).ok_or(CollectionError::NotFound(id))?;
        self.collections[archetype.index()].update_entity(id, new_id)
    }

    /// Commits every collection.
    ///
    /// # Errors
    ///
    /// See [`EntityCollection::commit_changes`].
    pub fn commit(&mut self) -> Result<CommitReport, CollectionError> {
        let mut total = CommitReport::default();
        let locations = self.locations.get_mut();
        for collection in &mut self.collections {
            let report = collection.commit_changes()?;
            for id in &report.removed {
                locations.remove(&id.raw_id());
            }
            total.migrated.extend(report.migrated);
            total.removed.extend(report.removed);
        }

        if !total.is_empty() {
            self.span.in_scope(|| {
                tracing::debug!(migrated = total.migrated.len(), removed = total.removed.len(), "store committed");
            });
        }
        Ok(total)
    }

    /// Rebuilds the index if the store is dirty. Returns whether it did.
    pub fn refresh_index(&mut self, kind_count: usize) -> bool {
        if !self.dirty {
            return false;
        }
        self.index = ArchetypeIndex::build(
            kind_count,
            self.collections
                .iter()
                .enumerate()
                .map(|(i, c)| (ArchetypeId(u32::try_from(i).unwrap_or(u32::MAX)), c.sequence())),
        );
        self.dirty = false;
        self.span.in_scope(|| {
            tracing::debug!(archetypes = self.collections.len(), "archetype index rebuilt");
        });
        true
    }

    /// Archetypes containing every `include` kind and no `exclude` kind.
    ///
    /// Reflects the index as of the last [`refresh_index`](Self::refresh_index).
    #[must_use]
    pub fn find_collections(&self, include: &[ComponentId], exclude: &[ComponentId]) -> Vec<ArchetypeId> {
        self.index.find(include, exclude)
    }

    /// Collection holding the entity with this raw id.
    #[must_use]
    pub fn locate(&self, raw: u32) -> Option<ArchetypeId> {
        self.locations.read().get(&raw).copied()
    }

    /// Current value of the entity with this raw id.
    #[must_use]
    pub fn entity(&self, raw: u32) -> Option<EntityId> {
        let archetype = self.locate(raw)?;
        self.collections[archetype.index()].entity(raw)
    }

    /// A collection by handle.
    #[must_use]
    pub fn collection(&self, id: ArchetypeId) -> Option<&EntityCollection> {
        self.collections.get(id.index())
    }

    /// A collection by handle, mutably.
    #[must_use]
    pub fn collection_mut(&mut self, id: ArchetypeId) -> Option<&mut EntityCollection> {
        self.collections.get_mut(id.index())
    }

    /// Every collection in discovery order.
    pub fn collections(&self) -> impl Iterator<Item = (ArchetypeId, &EntityCollection)> {
        self.collections
            .iter()
            .enumerate()
            .map(|(i, c)| (ArchetypeId(u32::try_from(i).unwrap_or(u32::MAX)), c))
    }

    /// Number of collections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.collections.len()
    }

    /// Whether no collection exists yet.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Whether the index is stale.
    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::component::{Component, ComponentType, ComponentTypeId};
    use crate::ecs::entity::LifeState;
    use bytemuck::{Pod, Zeroable};

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

    fn setup() -> (ComponentRegistry, ArchetypeStore) {
        let registry =
            ComponentRegistry::build(&[ComponentType::of::<Position>(), ComponentType::of::<Health>()]).unwrap();
        (registry, ArchetypeStore::new(4, &Span::none()))
    }

    #[test]
    fn test_get_or_create_dedups_by_sequence() {
        let (registry, mut store) = setup();
        let a = store
            .get_or_create(&registry, &ComponentSequence::new([ComponentId::new(2), ComponentId::new(1)]))
            .unwrap();
        let b = store
            .get_or_create(&registry, &ComponentSequence::new([ComponentId::new(1), ComponentId::new(2)]))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert!(store.is_dirty());
    }

    #[test]
    fn test_definitions_share_collections_and_mark_dirty() {
        let (registry, mut store) = setup();
        let walker = EntityDefinition::new(
            DefinitionId(1),
            "walker",
            vec![ComponentTypeId::of::<Position>(), ComponentTypeId::of::<Health>()],
        );
        let runner = EntityDefinition::new(
            DefinitionId(2),
            "runner",
            vec![ComponentTypeId::of::<Health>(), ComponentTypeId::of::<Position>()],
        );
        let a = store.register_definition(&registry, &walker).unwrap();
        assert!(store.refresh_index(registry.kind_count()));
        assert!(!store.refresh_index(registry.kind_count()));

        let b = store.register_definition(&registry, &runner).unwrap();
        assert_eq!(a, b);
        assert!(store.is_dirty());
        assert_eq!(store.collection(a).unwrap().definitions(), &[DefinitionId(1), DefinitionId(2)]);
        assert_eq!(store.definition(DefinitionId(2)).unwrap().load_state, LoadState::Unloaded);

        store.set_load_state(DefinitionId(2), LoadState::Loaded).unwrap();
        assert_eq!(store.definition(DefinitionId(2)).unwrap().load_state, LoadState::Loaded);
        assert!(store.set_load_state(DefinitionId(3), LoadState::Loaded).is_err());
    }

    #[test]
    fn test_commit_clears_locations_of_removed() {
        let (registry, mut store) = setup();
        let archetype = store
            .get_or_create(&registry, &ComponentSequence::new([ComponentId::new(1)]))
            .unwrap();
        let id = EntityId::from_raw(3).with_life_state(LifeState::Unregister);
        store.create_entity(archetype, id).unwrap();
        assert_eq!(store.locate(3), Some(archetype));

        store.commit().unwrap();
        store.update_entity(id, id.with_life_state(LifeState::Destroyed)).unwrap();
        let report = store.commit().unwrap();
        assert_eq!(report.removed.len(), 1);
        assert_eq!(store.locate(3), None);
        assert_eq!(store.entity(3), None);
    }

    #[test]
    fn test_create_entity_in_unknown_archetype() {
        let (_registry, store) = setup();
        let id = EntityId::from_raw(9);
        assert_eq!(
            store.create_entity(ArchetypeId(5), id),
            Err(WorldError::Collection(CollectionError::UnknownArchetype(ArchetypeId(5))))
        );
        assert_eq!(store.locate(9), None);
    }

    #[test]
    fn test_find_collections_after_refresh() {
        let (registry, mut store) = setup();
        let both = store
            .get_or_create(&registry, &ComponentSequence::new([ComponentId::new(1), ComponentId::new(2)]))
            .unwrap();
        let only_position = store
            .get_or_create(&registry, &ComponentSequence::new([ComponentId::new(1)]))
            .unwrap();
        assert!(store.find_collections(&[ComponentId::new(1)], &[]).is_empty());

        store.refresh_index(registry.kind_count());
        assert_eq!(store.find_collections(&[ComponentId::new(1)], &[]), vec![both, only_position]);
        assert_eq!(
            store.find_collections(&[ComponentId::new(1)], &[ComponentId::new(2)]),
            vec![only_position]
        );
    }
}
