//! # Error Types
//!
//! Configuration errors are `Result` values, one enum per layer, folded
//! into [`WorldError`] at the composition root.
//!
//! Programmer misuse (releasing a lock that is not held, an illegal life
//! transition reaching the world, a raw id mismatch on update) is not an
//! error value: it is reported through [`misuse!`], which panics in debug
//! builds and logs at `error` level in release builds.

use thiserror::Error;

use crate::ecs::{ArchetypeId, ComponentId, ComponentSequence, ComponentTypeId, DefinitionId, EntityId, LifeState, LoadState};
use crate::sync::{FenceId, SchedulerPhase};

/// Reports programmer misuse.
///
/// Fatal in debug builds, logged and otherwise ignored in release builds.
macro_rules! misuse {
    ($($arg:tt)+) => {{
        ::tracing::error!($($arg)+);
        if cfg!(debug_assertions) {
            panic!($($arg)+);
        }
    }};
}

pub(crate) use misuse;

/// Rejected life-state change.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal life-state transition: {from:?} -> {to:?}")]
pub struct IllegalTransition {
    /// State the entity was in.
    pub from: LifeState,
    /// State that was requested.
    pub to: LifeState,
}

/// The raw entity id space is exhausted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("entity id space exhausted: {limit} raw ids in use")]
pub struct CapacityError {
    /// Number of raw ids the allocator can hand out.
    pub limit: u32,
}

/// Errors raised while building or querying the component registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// More distinct component kinds than a dense id can address.
    #[error("too many component kinds: {count} exceeds limit of {limit}")]
    TooManyKinds {
        /// Number of distinct concrete kinds supplied.
        count: usize,
        /// Largest number of kinds the registry accepts.
        limit: usize,
    },

    /// A component type that was never registered.
    #[error("component type {0:?} is not registered")]
    UnknownType(ComponentTypeId),

    /// A component id outside `1..=kind_count`.
    #[error("component id {0} is not a registered kind")]
    UnknownKind(ComponentId),
}

/// Errors raised by an entity collection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    /// A collection cannot be keyed by an empty sequence.
    #[error("archetype sequence must not be empty")]
    EmptySequence,

    /// `initialize` was called again with a different sequence.
    #[error("archetype sequence mismatch: collection holds {expected:?}, got {found:?}")]
    SequenceMismatch {
        /// Sequence the collection was created with.
        expected: ComponentSequence,
        /// Sequence passed to the failing call.
        found: ComponentSequence,
    },

    /// No entity with this exact id lives in the collection.
    #[error("entity {0} not found in collection")]
    NotFound(EntityId),

    /// An archetype handle the store never issued.
    #[error("archetype {0} does not exist")]
    UnknownArchetype(ArchetypeId),

    /// An update tried to change the raw id of an entity.
    #[error("raw id mismatch: cannot update {from} to {to}")]
    RawIdMismatch {
        /// Id currently stored.
        from: EntityId,
        /// Replacement id.
        to: EntityId,
    },

    /// An update requested an illegal life-state change.
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    /// The registry has no column factory for this kind.
    #[error("component kind {0} has no column factory")]
    UnknownKind(ComponentId),

    /// The kind is not part of this collection's sequence.
    #[error("component kind {0} is not stored in this collection")]
    MissingKind(ComponentId),

    /// The column for this kind holds a different Rust type.
    #[error("column for component kind {kind} does not hold `{requested}`")]
    ColumnType {
        /// Kind whose column was requested.
        kind: ComponentId,
        /// Rust type name of the request.
        requested: &'static str,
    },

    /// Two columns of different kinds were crossed during a copy.
    #[error("column copy between mismatched component types")]
    ColumnCopy,
}

/// Errors raised by the fence scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FenceError {
    /// An operation was attempted in the wrong scheduler phase.
    #[error("`{operation}` is not allowed while the scheduler is {phase:?}")]
    WrongPhase {
        /// Name of the rejected operation.
        operation: &'static str,
        /// Phase the scheduler was in.
        phase: SchedulerPhase,
    },

    /// A fence with this id already exists or was already requested.
    #[error("fence `{0}` already exists")]
    DuplicateFence(FenceId),

    /// A fence anchored onto itself.
    #[error("fence `{0}` cannot be placed relative to itself")]
    SelfTarget(FenceId),

    /// A fence anchored before the Register fence.
    #[error("fence `{0}` cannot be placed before Register")]
    BeforeRegister(FenceId),

    /// A fence anchored after the Unregister fence.
    #[error("fence `{0}` cannot be placed after Unregister")]
    AfterUnregister(FenceId),

    /// Requests whose target never got placed: a cycle or a missing target.
    #[error("unresolved fence requests (cycle or missing target): {0:?}")]
    UnresolvedFences(Vec<FenceId>),

    /// A placed fence ended up on the wrong side of its target.
    #[error("fence `{fence}` is not on the requested side of `{target}`")]
    OrderingConflict {
        /// Fence that was misplaced.
        fence: FenceId,
        /// Fence it was anchored to.
        target: FenceId,
    },

    /// No fence with this id exists.
    #[error("fence `{0}` not found")]
    FenceNotFound(FenceId),

    /// A constant update with this name is already running.
    #[error("constant update `{0}` already exists")]
    DuplicateUpdate(String),

    /// No constant update with this name exists.
    #[error("constant update `{0}` not found")]
    UpdateNotFound(String),

    /// A component kind listed twice in the same access list.
    #[error("update `{update}` declares component kind {kind} twice")]
    DuplicateAccess {
        /// Update name.
        update: String,
        /// Kind listed twice.
        kind: ComponentId,
    },

    /// A component kind present in both the read and the write list.
    #[error("update `{update}` both reads and writes component kind {kind}")]
    AccessOverlap {
        /// Update name.
        update: String,
        /// Kind present in both lists.
        kind: ComponentId,
    },

    /// A component kind the registry does not know.
    #[error("update `{update}` declares unknown component kind {kind}")]
    UnknownComponent {
        /// Update name.
        update: String,
        /// Unknown kind.
        kind: ComponentId,
    },
}

/// Top-level error for world construction and the system-facing API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Collection failure.
    #[error(transparent)]
    Collection(#[from] CollectionError),

    /// Scheduler failure.
    #[error(transparent)]
    Fence(#[from] FenceError),

    /// Id space exhausted.
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// Illegal life-state change requested through the world.
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    /// Invalid configuration value or file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A definition id the world has never seen.
    #[error("entity definition {0} is not registered")]
    UnknownDefinition(DefinitionId),

    /// A definition that is not loaded yet (or failed to load).
    #[error("entity definition {definition} is {state:?}, not Loaded")]
    DefinitionNotLoaded {
        /// The definition.
        definition: DefinitionId,
        /// Its load state at the time of the call.
        state: LoadState,
    },

    /// The entity is not stored in any collection.
    #[error("entity {0} not found")]
    UnknownEntity(EntityId),

    /// A system failed during `initialize`.
    #[error("system `{system}` failed to initialize: {source}")]
    SystemInit {
        /// Name of the failing system.
        system: &'static str,
        /// Underlying failure.
        source: Box<WorldError>,
    },
}

/// Result type for world operations.
pub type WorldResult<T> = Result<T, WorldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_errors_convert_into_world_error() {
        let err: WorldError = FenceError::FenceNotFound(FenceId::new("physics")).into();
        assert!(matches!(err, WorldError::Fence(FenceError::FenceNotFound(_))));

        let err: WorldError = CapacityError { limit: 7 }.into();
        assert_eq!(err.to_string(), "entity id space exhausted: 7 raw ids in use");
    }

    #[test]
    fn test_illegal_transition_message() {
        let err = IllegalTransition {
            from: LifeState::Destroyed,
            to: LifeState::Alive,
        };
        assert_eq!(err.to_string(), "illegal life-state transition: Destroyed -> Alive");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "misuse reported")]
    fn test_misuse_is_fatal_in_debug() {
        misuse!("misuse reported: {}", 42);
    }
}
