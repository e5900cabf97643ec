//! # Cadence Core
//!
//! Frame scheduling for an archetype-based Entity Component System.
//!
//! - Entities are 32-bit ids carrying a raw identity, priority flags and a
//!   life state
//! - Components live in per-archetype columns with a pending generation
//!   that absorbs structural changes until the next commit
//! - Work is expressed as updates attached to fences; concurrent updates
//!   are admitted through per-kind reader/writer counters
//!
//! ## Frame
//!
//! ```text
//! commit ─► rebind ─► declare ─► Register ─► Update ─► ... ─► Unregister
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use cadence_core::{ComponentType, World, WorldConfig};
//!
//! let mut world = World::new(
//!     WorldConfig::default(),
//!     &[ComponentType::of::<Position>()],
//!     vec![Box::new(MovementSystem::default())],
//! )?;
//! world.run_frame()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod ecs;
pub mod error;
pub mod sync;

pub use config::WorldConfig;
pub use ecs::{
    ArchetypeId, ArchetypeStore, Component, ComponentId, ComponentRegistry, ComponentSequence, ComponentType,
    ComponentTypeId, DefinitionId, EntityCollection, EntityDefinition, EntityId, EntityIdAllocator, FrameReport,
    LifeState, LifecycleReport, LoadState, Priority, QueryView, System, SystemSetup, UpdateDeclarations, World,
    WorldAccess,
};
pub use error::{
    CapacityError, CollectionError, FenceError, IllegalTransition, RegistryError, WorldError, WorldResult,
};
pub use sync::{
    ComponentLockTable, FenceId, FenceReport, FenceScheduler, PassReport, SchedulerPhase, Update, UpdateContext,
    UpdateFn, UpdateMode,
};
