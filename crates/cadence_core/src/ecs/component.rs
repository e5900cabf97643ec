//! # Component Kinds
//!
//! Components are pure data containers with no behavior. The registry is
//! built once from every component type the application knows about and
//! hands each concrete type a dense id starting at 1. Id 0 is reserved.
//!
//! Dense ids are stable for the lifetime of the process only; they are
//! never persisted.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::ecs::storage::{Column, ErasedColumn};
use crate::error::RegistryError;
use crate::sync::ComponentLockTable;

/// Largest number of concrete kinds the registry can address.
pub const MAX_COMPONENT_KINDS: usize = u16::MAX as usize;

/// Marker trait for component values.
///
/// Components must be:
/// - `Copy`: No heap allocations, bitwise copyable
/// - `Pod`: Plain old data, columns can be viewed as bytes
/// - `Zeroable`: Can be safely zeroed
/// - `Default`: The value a freshly created row holds
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone, Copy, Default, Pod, Zeroable)]
/// #[repr(C)]
/// struct Health {
///     current: u32,
///     max: u32,
/// }
///
/// impl Component for Health {}
/// ```
pub trait Component: Copy + Pod + Zeroable + Default + Send + Sync + 'static {}

/// Opaque, process-stable identifier of a component type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ComponentTypeId(TypeId);

impl ComponentTypeId {
    /// Identifier of `T`.
    #[inline]
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self(TypeId::of::<T>())
    }
}

/// Builds an empty column for one concrete kind.
pub type ColumnFactory = fn() -> Box<dyn ErasedColumn>;

/// Descriptor of a component type as supplied to the registry.
#[derive(Clone, Copy, Debug)]
pub struct ComponentType {
    type_id: ComponentTypeId,
    name: &'static str,
    factory: Option<ColumnFactory>,
}

impl ComponentType {
    /// Descriptor of a concrete component type.
    #[must_use]
    pub fn of<T: Component>() -> Self {
        Self {
            type_id: ComponentTypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            factory: Some(Column::<T>::boxed),
        }
    }

    /// Descriptor of an abstract type. Abstract types never receive an id.
    #[must_use]
    pub fn abstract_of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: ComponentTypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            factory: None,
        }
    }

    /// Opaque type identifier.
    #[inline]
    #[must_use]
    pub const fn type_id(&self) -> ComponentTypeId {
        self.type_id
    }

    /// Rust type name.
    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this type is abstract (skipped by the registry).
    #[inline]
    #[must_use]
    pub const fn is_abstract(&self) -> bool {
        self.factory.is_none()
    }

    /// Creates an empty column, or `None` for abstract types.
    #[must_use]
    pub fn create_column(&self) -> Option<Box<dyn ErasedColumn>> {
        self.factory.map(|factory| factory())
    }
}

/// Dense component kind id. `0` is invalid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ComponentId(u16);

impl ComponentId {
    /// The reserved invalid id.
    pub const INVALID: Self = Self(0);

    /// Wraps a raw dense id.
    #[inline]
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Raw dense id.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Id as a table index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Checks if this is the reserved id.
    #[inline]
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ascending, duplicate-free list of component kinds.
///
/// Only constructible through the normalizing constructor, so equality of
/// two sequences is set equality. One sequence keys exactly one archetype.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ComponentSequence(Vec<ComponentId>);

impl ComponentSequence {
    /// Sorts and deduplicates `ids`.
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = ComponentId>) -> Self {
        let mut ids: Vec<ComponentId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }

    /// The kinds in ascending order.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[ComponentId] {
        &self.0
    }

    /// Number of kinds.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the sequence has no kinds.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Column position of `kind`, if present.
    #[inline]
    #[must_use]
    pub fn position(&self, kind: ComponentId) -> Option<usize> {
        self.0.binary_search(&kind).ok()
    }

    /// Whether `kind` is part of the sequence.
    #[inline]
    #[must_use]
    pub fn contains(&self, kind: ComponentId) -> bool {
        self.position(kind).is_some()
    }

    /// Smallest kind id.
    #[inline]
    #[must_use]
    pub fn min(&self) -> Option<ComponentId> {
        self.0.first().copied()
    }

    /// Largest kind id.
    #[inline]
    #[must_use]
    pub fn max(&self) -> Option<ComponentId> {
        self.0.last().copied()
    }

    /// Iterates the kinds in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.0.iter().copied()
    }
}

// ============================================================================
// DEFINITIONS
// ============================================================================

/// Identifier of an entity definition asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefinitionId(pub u32);

impl fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "def:{}", self.0)
    }
}

/// Load state reported by the asset layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LoadState {
    /// Not requested yet.
    #[default]
    Unloaded,
    /// Load in progress.
    Loading,
    /// Ready for entity creation.
    Loaded,
    /// Load failed; creation is refused.
    Failed,
}

/// Ordered component list an entity can be created from.
#[derive(Clone, Debug)]
pub struct EntityDefinition {
    /// Asset identifier.
    pub id: DefinitionId,
    /// Human-readable name.
    pub name: String,
    /// Component types, in authoring order.
    pub components: Vec<ComponentTypeId>,
    /// Current load state.
    pub load_state: LoadState,
}

impl EntityDefinition {
    /// Creates an unloaded definition.
    #[must_use]
    pub fn new(id: DefinitionId, name: impl Into<String>, components: Vec<ComponentTypeId>) -> Self {
        Self {
            id,
            name: name.into(),
            components,
            load_state: LoadState::Unloaded,
        }
    }

    /// Returns the definition with its load state replaced.
    #[must_use]
    pub fn with_load_state(mut self, load_state: LoadState) -> Self {
        self.load_state = load_state;
        self
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Dense id assignment for every concrete component type.
///
/// Owns the [`ComponentLockTable`], sized `kind_count + 1` so it can be
/// indexed by dense id directly.
#[derive(Debug)]
pub struct ComponentRegistry {
    /// Descriptor of kind `id` at index `id - 1`.
    kinds: Vec<ComponentType>,
    by_type: HashMap<ComponentTypeId, ComponentId>,
    locks: ComponentLockTable,
}

impl ComponentRegistry {
    /// Assigns ids in discovery order. A type listed twice keeps its first id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::TooManyKinds`] if more than
    /// [`MAX_COMPONENT_KINDS`] distinct concrete kinds are supplied. No
    /// registry is built in that case.
    pub fn build(types: &[ComponentType]) -> Result<Self, RegistryError> {
        Self::build_with_limit(types, MAX_COMPONENT_KINDS)
    }

    pub(crate) fn build_with_limit(types: &[ComponentType], limit: usize) -> Result<Self, RegistryError> {
        let mut kinds = Vec::new();
        let mut by_type = HashMap::new();

        for ty in types.iter().filter(|ty| !ty.is_abstract()) {
            if by_type.contains_key(&ty.type_id()) {
                continue;
            }
            if kinds.len() == limit {
                let count = types
                    .iter()
                    .filter(|ty| !ty.is_abstract())
                    .map(ComponentType::type_id)
                    .collect::<std::collections::HashSet<_>>()
                    .len();
                return Err(RegistryError::TooManyKinds { count, limit });
            }
            kinds.push(*ty);
            // Bounded by `limit <= u16::MAX` above.
            let id = ComponentId(u16::try_from(kinds.len()).unwrap_or(u16::MAX));
            by_type.insert(ty.type_id(), id);
        }

        let locks = ComponentLockTable::new(kinds.len() + 1);
        Ok(Self { kinds, by_type, locks })
    }

    /// Number of registered kinds.
    #[inline]
    #[must_use]
    pub fn kind_count(&self) -> usize {
        self.kinds.len()
    }

    /// Dense id of a type, if registered.
    #[inline]
    #[must_use]
    pub fn id_of(&self, type_id: ComponentTypeId) -> Option<ComponentId> {
        self.by_type.get(&type_id).copied()
    }

    /// Dense id of `T`, if registered.
    #[inline]
    #[must_use]
    pub fn id_of_type<T: ?Sized + 'static>(&self) -> Option<ComponentId> {
        self.id_of(ComponentTypeId::of::<T>())
    }

    /// Descriptor of a kind.
    #[must_use]
    pub fn kind(&self, id: ComponentId) -> Option<&ComponentType> {
        if id.is_invalid() {
            return None;
        }
        self.kinds.get(id.index() - 1)
    }

    /// Whether `id` names a registered kind.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: ComponentId) -> bool {
        !id.is_invalid() && id.index() <= self.kinds.len()
    }

    /// Maps type ids to a normalized sequence.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownType`] for the first unregistered type.
    pub fn sequence_of(&self, types: &[ComponentTypeId]) -> Result<ComponentSequence, RegistryError> {
        let ids = types
            .iter()
            .map(|ty| self.id_of(*ty).ok_or(RegistryError::UnknownType(*ty)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ComponentSequence::new(ids))
    }

    /// Creates an empty column for a kind.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownKind`] if `id` is not registered.
    pub fn create_column(&self, id: ComponentId) -> Result<Box<dyn ErasedColumn>, RegistryError> {
        self.kind(id)
            .and_then(ComponentType::create_column)
            .ok_or(RegistryError::UnknownKind(id))
    }

    /// The lock table for every registered kind.
    #[inline]
    #[must_use]
    pub fn locks(&self) -> &ComponentLockTable {
        &self.locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    trait Shape {}

    #[test]
    fn test_dense_ids_in_discovery_order() {
        let registry = ComponentRegistry::build(&[
            ComponentType::of::<Health>(),
            ComponentType::abstract_of::<dyn Shape>(),
            ComponentType::of::<Position>(),
            ComponentType::of::<Health>(),
        ])
        .unwrap();

        assert_eq!(registry.kind_count(), 2);
        assert_eq!(registry.id_of_type::<Health>(), Some(ComponentId::new(1)));
        assert_eq!(registry.id_of_type::<Position>(), Some(ComponentId::new(2)));
        assert_eq!(registry.id_of_type::<dyn Shape>(), None);
        assert!(registry.kind(ComponentId::INVALID).is_none());
        assert_eq!(registry.locks().len(), 3);
    }

    #[test]
    fn test_too_many_kinds_fails_atomically() {
        let types = [ComponentType::of::<Health>(), ComponentType::of::<Position>()];
        let err = ComponentRegistry::build_with_limit(&types, 1).unwrap_err();
        assert_eq!(err, RegistryError::TooManyKinds { count: 2, limit: 1 });
    }

    #[test]
    fn test_sequence_is_sorted_and_deduplicated() {
        let seq = ComponentSequence::new([3, 1, 3, 2].map(ComponentId::new));
        assert_eq!(seq.as_slice(), &[1, 2, 3].map(ComponentId::new));
        assert_eq!(seq, ComponentSequence::new([2, 3, 1].map(ComponentId::new)));
        assert_eq!(seq.position(ComponentId::new(3)), Some(2));
        assert_eq!(seq.min(), Some(ComponentId::new(1)));
        assert_eq!(seq.max(), Some(ComponentId::new(3)));
    }

    #[test]
    fn test_sequence_of_rejects_unknown_types() {
        let registry = ComponentRegistry::build(&[ComponentType::of::<Position>()]).unwrap();
        let seq = registry
            .sequence_of(&[ComponentTypeId::of::<Position>(), ComponentTypeId::of::<Position>()])
            .unwrap();
        assert_eq!(seq.len(), 1);

        let err = registry.sequence_of(&[ComponentTypeId::of::<Health>()]).unwrap_err();
        assert_eq!(err, RegistryError::UnknownType(ComponentTypeId::of::<Health>()));
    }

    #[test]
    fn test_create_column_per_kind() {
        let registry = ComponentRegistry::build(&[ComponentType::of::<Position>()]).unwrap();
        let column = registry.create_column(ComponentId::new(1)).unwrap();
        assert_eq!(column.len(), 0);
        assert!(registry.create_column(ComponentId::new(2)).is_err());
    }
}
