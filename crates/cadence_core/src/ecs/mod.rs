//! # Entity Component System
//!
//! Entities are bit-packed ids grouped into archetype collections: one
//! collection per distinct set of component kinds, one column per kind.
//!
//! ## Layout
//!
//! - [`entity`]: id codec, life states and the raw id allocator
//! - [`component`]: type registry, dense kind ids and definitions
//! - [`archetype`]: double-generation collections (current + pending)
//! - [`store`]: every collection of the world, plus the lookup index
//! - [`world`]: the frame loop tying storage to the fence scheduler

pub mod archetype;
pub mod component;
pub mod entity;
mod index;
mod storage;
pub mod store;
pub mod world;

pub use archetype::{ArchetypeId, CommitReport, EntityCollection, RowIndex};
pub use component::{
    Component, ComponentId, ComponentRegistry, ComponentSequence, ComponentType, ComponentTypeId, DefinitionId,
    EntityDefinition, LoadState, MAX_COMPONENT_KINDS,
};
pub use entity::{EntityId, EntityIdAllocator, LifeState, Priority, MAX_RAW_ID};
pub use index::{ArchetypeIndex, IndexEntry};
pub use storage::{Column, ErasedColumn};
pub use store::{ArchetypeStore, DefinitionSlot};
pub use world::{
    FrameReport, LifecycleReport, QueryView, System, SystemSetup, UpdateDeclarations, World, WorldAccess,
};

pub(crate) use world::FrameRequests;
