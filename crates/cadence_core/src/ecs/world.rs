//! # World
//!
//! The composition root. Owns the registry, the archetype store, the id
//! allocator and the fence scheduler, and drives one frame at a time:
//!
//! ```text
//! run_frame
//!   1. commit      deferred creations materialize, pending -> current,
//!                  DESTROYED rows swept, raw ids recycled
//!   2. rebind      index rebuilt if dirty, systems notified
//!   3. declare     systems (re)declare their updates
//!   4. execute     fences in order
//!   5. lifecycle   at every fence boundary: destroy requests applied
//!                  after Register:   REGISTER   -> ALIVE
//!                  after Unregister: UNREGISTER -> DESTROYED
//! ```
//!
//! A destroyed entity stays readable for the rest of the frame it was
//! destroyed in, goes DESTROYED during the next frame, and is swept by the
//! commit after that.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::Span;

use super::archetype::{ArchetypeId, EntityCollection};
use super::component::{
    ComponentId, ComponentRegistry, ComponentSequence, ComponentType, ComponentTypeId, DefinitionId,
    EntityDefinition, LoadState,
};
use super::entity::{EntityId, EntityIdAllocator, LifeState, Priority};
use super::store::ArchetypeStore;
use crate::config::WorldConfig;
use crate::error::{misuse, CollectionError, WorldError, WorldResult};
use crate::sync::{FenceId, FenceScheduler, PassReport, SchedulerPhase, Update};

// ============================================================================
// SYSTEMS
// ============================================================================

/// A unit of game logic that declares its data dependencies.
pub trait System: Send {
    /// Stable name, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Creates fences and registers definitions. Runs once, before the
    /// fence order is frozen.
    ///
    /// # Errors
    ///
    /// Any error aborts world construction.
    fn initialize(&mut self, setup: &mut SystemSetup<'_>) -> WorldResult<()>;

    /// Called after the archetype index was rebuilt.
    fn rebind(&mut self, _view: &QueryView<'_>) {}

    /// Declares this frame's updates.
    ///
    /// # Errors
    ///
    /// Any error aborts the frame.
    fn declare_updates(&mut self, updates: &mut UpdateDeclarations<'_>) -> WorldResult<()>;

    /// Called once when the world shuts down.
    fn shutdown(&mut self) {}
}

/// What a system may do during [`System::initialize`].
pub struct SystemSetup<'a> {
    registry: &'a ComponentRegistry,
    store: &'a mut ArchetypeStore,
    scheduler: &'a mut FenceScheduler,
}

impl SystemSetup<'_> {
    /// Requests `fence` immediately before `target`.
    ///
    /// # Errors
    ///
    /// See [`FenceScheduler::create_fence_before`].
    pub fn create_fence_before(&mut self, fence: FenceId, target: FenceId) -> WorldResult<()> {
        Ok(self.scheduler.create_fence_before(fence, target)?)
    }

    /// Requests `fence` immediately after `target`.
    ///
    /// # Errors
    ///
    /// See [`FenceScheduler::create_fence_after`].
    pub fn create_fence_after(&mut self, fence: FenceId, target: FenceId) -> WorldResult<()> {
        Ok(self.scheduler.create_fence_after(fence, target)?)
    }

    /// Binds a definition to its archetype.
    ///
    /// # Errors
    ///
    /// Fails for unregistered component types or an empty component list.
    pub fn register_definition(&mut self, definition: &EntityDefinition) -> WorldResult<ArchetypeId> {
        self.store.register_definition(self.registry, definition)
    }

    /// Dense id of `T`.
    #[must_use]
    pub fn component_id<T: ?Sized + 'static>(&self) -> Option<ComponentId> {
        self.registry.id_of_type::<T>()
    }

    /// The component registry.
    #[must_use]
    pub fn registry(&self) -> &ComponentRegistry {
        self.registry
    }
}

/// Read-only query access handed to [`System::rebind`].
pub struct QueryView<'a> {
    registry: &'a ComponentRegistry,
    store: &'a ArchetypeStore,
}

impl<'a> QueryView<'a> {
    /// Archetypes containing every `include` type and no `exclude` type.
    #[must_use]
    pub fn find_collections(&self, include: &[ComponentTypeId], exclude: &[ComponentTypeId]) -> Vec<ArchetypeId> {
        find_by_types(self.registry, self.store, include, exclude)
    }

    /// Same as [`find_collections`](Self::find_collections), by dense id.
    #[must_use]
    pub fn find_kinds(&self, include: &[ComponentId], exclude: &[ComponentId]) -> Vec<ArchetypeId> {
        self.store.find_collections(include, exclude)
    }

    /// A collection by handle.
    #[must_use]
    pub fn collection(&self, id: ArchetypeId) -> Option<&'a EntityCollection> {
        self.store.collection(id)
    }

    /// Dense id of `T`.
    #[must_use]
    pub fn component_id<T: ?Sized + 'static>(&self) -> Option<ComponentId> {
        self.registry.id_of_type::<T>()
    }
}

/// What a system may do during [`System::declare_updates`].
pub struct UpdateDeclarations<'a> {
    registry: &'a ComponentRegistry,
    scheduler: &'a mut FenceScheduler,
    frame: u64,
}

impl UpdateDeclarations<'_> {
    /// Schedules a one-shot update for this frame.
    ///
    /// # Errors
    ///
    /// See [`FenceScheduler::schedule_update`].
    pub fn schedule_update(&mut self, update: Update) -> WorldResult<()> {
        Ok(self.scheduler.schedule_update(update)?)
    }

    /// Starts a constant update.
    ///
    /// # Errors
    ///
    /// See [`FenceScheduler::start_constant_update`].
    pub fn start_constant_update(&mut self, update: Update) -> WorldResult<()> {
        Ok(self.scheduler.start_constant_update(update)?)
    }

    /// Stops a constant update by name.
    ///
    /// # Errors
    ///
    /// See [`FenceScheduler::stop_constant_update`].
    pub fn stop_constant_update(&mut self, name: &str) -> WorldResult<()> {
        Ok(self.scheduler.stop_constant_update(name)?)
    }

    /// Whether a constant update with this name runs.
    #[must_use]
    pub fn has_constant_update(&self, name: &str) -> bool {
        self.scheduler.has_constant_update(name)
    }

    /// Dense id of `T`.
    #[must_use]
    pub fn component_id<T: ?Sized + 'static>(&self) -> Option<ComponentId> {
        self.registry.id_of_type::<T>()
    }

    /// Number of the frame being declared.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

// ============================================================================
// UPDATE-SIDE ACCESS
// ============================================================================

#[derive(Clone, Debug)]
struct DeferredEntity {
    id: EntityId,
    sequence: ComponentSequence,
}

/// Requests made from updates, applied by the frame thread.
#[derive(Debug, Default)]
pub(crate) struct FrameRequests {
    destroy: Mutex<Vec<EntityId>>,
    /// Creations into archetypes that did not exist yet.
    deferred: Mutex<Vec<DeferredEntity>>,
}

/// The world as seen from inside an update.
///
/// Structural changes are never applied in place: creations land in the
/// pending generation (or are deferred to the next commit when their
/// archetype does not exist yet) and destroys are queued until the end of
/// the current fence.
#[derive(Clone, Copy)]
pub struct WorldAccess<'a> {
    registry: &'a ComponentRegistry,
    store: &'a ArchetypeStore,
    allocator: &'a EntityIdAllocator,
    requests: &'a FrameRequests,
}

impl<'a> WorldAccess<'a> {
    pub(crate) fn new(
        registry: &'a ComponentRegistry,
        store: &'a ArchetypeStore,
        allocator: &'a EntityIdAllocator,
        requests: &'a FrameRequests,
    ) -> Self {
        Self {
            registry,
            store,
            allocator,
            requests,
        }
    }

    /// The component registry.
    #[must_use]
    pub fn registry(&self) -> &'a ComponentRegistry {
        self.registry
    }

    /// Dense id of `T`.
    #[must_use]
    pub fn component_id<T: ?Sized + 'static>(&self) -> Option<ComponentId> {
        self.registry.id_of_type::<T>()
    }

    /// Archetypes containing every `include` type and no `exclude` type.
    #[must_use]
    pub fn find_collections(&self, include: &[ComponentTypeId], exclude: &[ComponentTypeId]) -> Vec<ArchetypeId> {
        find_by_types(self.registry, self.store, include, exclude)
    }

    /// Same as [`find_collections`](Self::find_collections), by dense id.
    #[must_use]
    pub fn find_kinds(&self, include: &[ComponentId], exclude: &[ComponentId]) -> Vec<ArchetypeId> {
        self.store.find_collections(include, exclude)
    }

    /// A collection by handle.
    #[must_use]
    pub fn collection(&self, id: ArchetypeId) -> Option<&'a EntityCollection> {
        self.store.collection(id)
    }

    /// Current value of the entity with this raw id.
    #[must_use]
    pub fn entity(&self, raw: u32) -> Option<EntityId> {
        self.store.entity(raw).or_else(|| {
            self.requests
                .deferred
                .lock()
                .iter()
                .find(|d| d.id.raw_id() == raw)
                .map(|d| d.id)
        })
    }

    /// Creates an entity from a loaded definition.
    ///
    /// # Errors
    ///
    /// - [`WorldError::UnknownDefinition`] if it was never registered
    /// - [`WorldError::DefinitionNotLoaded`] unless it is `Loaded`
    /// - [`WorldError::Capacity`] if the id space is exhausted
    pub fn create_entity(&self, definition: DefinitionId) -> WorldResult<EntityId> {
        let slot = self
            .store
            .definition(definition)
            .ok_or(WorldError::UnknownDefinition(definition))?;
        if slot.load_state != LoadState::Loaded {
            return Err(WorldError::DefinitionNotLoaded {
                definition,
                state: slot.load_state,
            });
        }

        let id = self.allocator.allocate()?;
        if let Err(err) = self.store.create_entity(slot.archetype, id) {
            self.allocator.release(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Creates an entity with exactly these component types.
    ///
    /// If no archetype holds this set yet, the creation is deferred and the
    /// archetype is created at the next commit.
    ///
    /// # Errors
    ///
    /// Fails for unregistered types, an empty set, or an exhausted id space.
    pub fn create_entity_with(&self, types: &[ComponentTypeId]) -> WorldResult<EntityId> {
        let sequence = self.registry.sequence_of(types)?;
        if sequence.is_empty() {
            return Err(CollectionError::EmptySequence.into());
        }

        let id = self.allocator.allocate()?;
        match self.store.archetype_of(&sequence) {
            Some(archetype) => {
                if let Err(err) = self.store.create_entity(archetype, id) {
                    self.allocator.release(id);
                    return Err(err);
                }
            }
            None => self.requests.deferred.lock().push(DeferredEntity { id, sequence }),
        }
        Ok(id)
    }

    /// Requests destruction of `id` at the end of the current fence.
    pub fn destroy_entity(&self, id: EntityId) {
        self.requests.destroy.lock().push(id);
    }
}

impl fmt::Debug for WorldAccess<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldAccess")
            .field("kinds", &self.registry.kind_count())
            .field("archetypes", &self.store.len())
            .finish_non_exhaustive()
    }
}

fn find_by_types(
    registry: &ComponentRegistry,
    store: &ArchetypeStore,
    include: &[ComponentTypeId],
    exclude: &[ComponentTypeId],
) -> Vec<ArchetypeId> {
    let mut kinds = Vec::with_capacity(include.len());
    for ty in include {
        match registry.id_of(*ty) {
            Some(id) => kinds.push(id),
            // Nothing can contain an unregistered type.
            None => return Vec::new(),
        }
    }
    let excluded: Vec<ComponentId> = exclude.iter().filter_map(|ty| registry.id_of(*ty)).collect();
    store.find_collections(&kinds, &excluded)
}

// ============================================================================
// REPORTS
// ============================================================================

/// Lifecycle transitions applied during one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LifecycleReport {
    /// REGISTER -> ALIVE after the Register fence.
    pub promoted: usize,
    /// Destroy requests that moved an entity to UNREGISTER.
    pub unregistered: usize,
    /// UNREGISTER -> DESTROYED after the Unregister fence.
    pub destroyed: usize,
}

/// What one frame did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameReport {
    /// Frame number, starting at 1.
    pub frame: u64,
    /// Entities moved from pending to current.
    pub migrated: usize,
    /// DESTROYED entities swept.
    pub removed: usize,
    /// Whether the archetype index was rebuilt.
    pub index_rebuilt: bool,
    /// Fence execution.
    pub pass: PassReport,
    /// Lifecycle transitions.
    pub lifecycle: LifecycleReport,
    /// Wall time of the whole frame.
    pub elapsed: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DestroyOutcome {
    Unregistered,
    NoOp,
    Unknown,
}

// ============================================================================
// WORLD
// ============================================================================

/// Entities, archetypes, fences and systems.
///
/// # Example
///
/// ```rust,ignore
/// let mut world = World::new(
///     WorldConfig::default(),
///     &[ComponentType::of::<Position>(), ComponentType::of::<Health>()],
///     vec![Box::new(MovementSystem::default())],
/// )?;
/// loop {
///     world.run_frame()?;
/// }
/// ```
pub struct World {
    config: WorldConfig,
    registry: ComponentRegistry,
    store: ArchetypeStore,
    allocator: EntityIdAllocator,
    scheduler: FenceScheduler,
    systems: Vec<Box<dyn System>>,
    requests: FrameRequests,
    /// Raw ids promoted after this frame's Register fence.
    registering: Vec<u32>,
    /// Raw ids destroyed after this frame's Unregister fence.
    unregistering: Vec<u32>,
    /// Raw ids that went UNREGISTER this frame.
    next_unregistering: Vec<u32>,
    span: Span,
}

impl World {
    /// Builds the registry, initializes every system and freezes the fence
    /// order.
    ///
    /// # Arguments
    ///
    /// * `config` - Runtime parameters, validated here
    /// * `component_types` - Every component type, abstract ones included
    /// * `systems` - Initialized in order
    ///
    /// # Errors
    ///
    /// Configuration errors of any layer; a failing system is reported as
    /// [`WorldError::SystemInit`].
    pub fn new(config: WorldConfig, component_types: &[ComponentType], mut systems: Vec<Box<dyn System>>) -> WorldResult<Self> {
        config.validate()?;
        let span = tracing::info_span!("world");
        let entered = span.enter();

        let registry = ComponentRegistry::build(component_types)?;
        let mut store = ArchetypeStore::new(config.pending_capacity, &span);
        let mut scheduler = FenceScheduler::new(&config, registry.kind_count(), &span);
        scheduler.begin_fence_registration()?;

        for system in &mut systems {
            let mut setup = SystemSetup {
                registry: &registry,
                store: &mut store,
                scheduler: &mut scheduler,
            };
            system.initialize(&mut setup).map_err(|source| WorldError::SystemInit {
                system: system.name(),
                source: Box::new(source),
            })?;
        }
        scheduler.finalize()?;

        store.refresh_index(registry.kind_count());
        let view = QueryView {
            registry: &registry,
            store: &store,
        };
        for system in &mut systems {
            system.rebind(&view);
        }

        tracing::info!(
            kinds = registry.kind_count(),
            archetypes = store.len(),
            systems = systems.len(),
            fences = ?scheduler.fence_order(),
            "world started"
        );
        drop(entered);

        Ok(Self {
            config,
            registry,
            store,
            allocator: EntityIdAllocator::new(),
            scheduler,
            systems,
            requests: FrameRequests::default(),
            registering: Vec::new(),
            unregistering: Vec::new(),
            next_unregistering: Vec::new(),
            span,
        })
    }

    /// Runs one frame.
    ///
    /// # Errors
    ///
    /// Declaration errors from systems and scheduler phase errors. The
    /// frame is abandoned and its one-shot updates are dropped. Lifecycle
    /// transitions it owed carry over to the next call.
    pub fn run_frame(&mut self) -> WorldResult<FrameReport> {
        let span = self.span.clone();
        let _entered = span.enter();
        let started = Instant::now();

        // 1. Commit.
        self.materialize_deferred()?;
        let commit = self.store.commit()?;
        for id in &commit.removed {
            self.allocator.release(*id);
        }
        // An abandoned frame leaves its ids here; they ride along.
        self.registering.extend(
            commit
                .migrated
                .iter()
                .filter(|id| id.life_state() == LifeState::Register)
                .map(|id| id.raw_id()),
        );
        self.unregistering.append(&mut self.next_unregistering);

        // 2. Rebind.
        let index_rebuilt = self.store.refresh_index(self.registry.kind_count());
        if index_rebuilt {
            let view = QueryView {
                registry: &self.registry,
                store: &self.store,
            };
            for system in &mut self.systems {
                system.rebind(&view);
            }
        }

        // 3. Declare.
        self.scheduler.open_declarations()?;
        let frame = self.scheduler.frame() + 1;
        let mut failure = None;
        for system in &mut self.systems {
            let mut declarations = UpdateDeclarations {
                registry: &self.registry,
                scheduler: &mut self.scheduler,
                frame,
            };
            if let Err(err) = system.declare_updates(&mut declarations) {
                failure = Some((system.name(), err));
                break;
            }
        }
        if let Some((culprit, err)) = failure {
            self.abandon_frame(frame, culprit, &err);
            return Err(err);
        }

        // 4 + 5. Execute with lifecycle boundaries.
        let executed = self.run_fences();
        self.scheduler.end_pass();
        let (pass, lifecycle) = match executed {
            Ok(executed) => executed,
            Err(err) => {
                self.abandon_frame(frame, "scheduler", &err);
                return Err(err);
            }
        };

        let report = FrameReport {
            frame: pass.frame,
            migrated: commit.migrated.len(),
            removed: commit.removed.len(),
            index_rebuilt,
            pass,
            lifecycle,
            elapsed: started.elapsed(),
        };
        if self.config.log_frame_timings {
            tracing::info!(
                frame = report.frame,
                elapsed_us = report.elapsed.as_micros(),
                updates = report.pass.total_updates(),
                retries = report.pass.total_retries(),
                "frame timings"
            );
        } else {
            tracing::debug!(frame = report.frame, migrated = report.migrated, removed = report.removed, "frame complete");
        }
        Ok(report)
    }

    fn run_fences(&mut self) -> WorldResult<(PassReport, LifecycleReport)> {
        let frame = self.scheduler.begin_pass()?;
        let mut pass = PassReport {
            frame,
            fences: Vec::with_capacity(self.scheduler.fence_count()),
        };
        let mut lifecycle = LifecycleReport::default();

        for fence in self.scheduler.fence_order() {
            let access = WorldAccess::new(&self.registry, &self.store, &self.allocator, &self.requests);
            pass.fences.push(self.scheduler.run_fence(fence, &access)?);
            self.apply_boundary(fence, &mut lifecycle);
        }
        Ok((pass, lifecycle))
    }

    fn abandon_frame(&mut self, frame: u64, culprit: &'static str, err: &WorldError) {
        let dropped = self.scheduler.discard_one_shots();
        tracing::warn!(
            frame,
            culprit,
            dropped,
            registering = self.registering.len(),
            unregistering = self.unregistering.len(),
            %err,
            "frame abandoned"
        );
    }

    fn materialize_deferred(&mut self) -> WorldResult<()> {
        for entry in std::mem::take(self.requests.deferred.get_mut()) {
            let archetype = self.store.get_or_create(&self.registry, &entry.sequence)?;
            self.store.create_entity(archetype, entry.id)?;
        }
        Ok(())
    }

    fn apply_boundary(&mut self, fence: FenceId, lifecycle: &mut LifecycleReport) {
        for id in std::mem::take(self.requests.destroy.get_mut()) {
            match self.apply_destroy(id) {
                DestroyOutcome::Unregistered => lifecycle.unregistered += 1,
                DestroyOutcome::NoOp => {}
                DestroyOutcome::Unknown => tracing::debug!(entity = %id, "destroy request for unknown entity ignored"),
            }
        }

        if fence == FenceId::REGISTER {
            for raw in std::mem::take(&mut self.registering) {
                if self.advance(raw, LifeState::Register, LifeState::Alive) {
                    lifecycle.promoted += 1;
                }
            }
        } else if fence == FenceId::UNREGISTER {
            for raw in std::mem::take(&mut self.unregistering) {
                if self.advance(raw, LifeState::Unregister, LifeState::Destroyed) {
                    lifecycle.destroyed += 1;
                }
            }
        }
    }

    fn apply_destroy(&mut self, id: EntityId) -> DestroyOutcome {
        let raw = id.raw_id();
        if let Some(current) = self.store.entity(raw) {
            return match current.life_state() {
                LifeState::Register | LifeState::Alive => {
                    if self.set_life_state(current, LifeState::Unregister) {
                        self.next_unregistering.push(raw);
                        DestroyOutcome::Unregistered
                    } else {
                        DestroyOutcome::NoOp
                    }
                }
                LifeState::Unregister | LifeState::Destroyed => DestroyOutcome::NoOp,
            };
        }

        let deferred = self.requests.deferred.get_mut();
        let Some(entry) = deferred.iter_mut().find(|d| d.id.raw_id() == raw) else {
            return DestroyOutcome::Unknown;
        };
        match entry.id.life_state() {
            LifeState::Register | LifeState::Alive => {
                entry.id = entry.id.with_life_state(LifeState::Unregister);
                self.next_unregistering.push(raw);
                DestroyOutcome::Unregistered
            }
            LifeState::Unregister | LifeState::Destroyed => DestroyOutcome::NoOp,
        }
    }

    /// Moves `raw` from `from` to `to` if it is still in `from`.
    fn advance(&mut self, raw: u32, from: LifeState, to: LifeState) -> bool {
        match self.store.entity(raw) {
            Some(current) if current.life_state() == from => self.set_life_state(current, to),
            _ => false,
        }
    }

    fn set_life_state(&mut self, current: EntityId, to: LifeState) -> bool {
        let next = match current.transition(to) {
            Ok(next) => next,
            Err(err) => {
                misuse!("{} requested for entity {}", err, current);
                return false;
            }
        };
        match self.store.update_entity(current, next) {
            Ok(()) => true,
            Err(err) => {
                misuse!("lifecycle update of entity {} failed: {}", current, err);
                false
            }
        }
    }

    // ========================================================================
    // SYSTEM-FACING API
    // ========================================================================

    /// The world as seen from inside an update.
    #[must_use]
    pub fn access(&self) -> WorldAccess<'_> {
        WorldAccess::new(&self.registry, &self.store, &self.allocator, &self.requests)
    }

    /// Creates an entity from a loaded definition. It becomes visible in
    /// its collection at the next commit.
    ///
    /// # Errors
    ///
    /// See [`WorldAccess::create_entity`].
    pub fn create_entity(&self, definition: DefinitionId) -> WorldResult<EntityId> {
        self.access().create_entity(definition)
    }

    /// Creates an entity with exactly these component types.
    ///
    /// # Errors
    ///
    /// See [`WorldAccess::create_entity_with`].
    pub fn create_entity_with(&self, types: &[ComponentTypeId]) -> WorldResult<EntityId> {
        self.access().create_entity_with(types)
    }

    /// Moves an entity to UNREGISTER immediately. It is DESTROYED during
    /// the next frame. Destroying an UNREGISTER or DESTROYED entity is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::UnknownEntity`] if no such entity exists.
    pub fn destroy_entity(&mut self, id: EntityId) -> WorldResult<()> {
        match self.apply_destroy(id) {
            DestroyOutcome::Unknown => Err(WorldError::UnknownEntity(id)),
            DestroyOutcome::Unregistered | DestroyOutcome::NoOp => Ok(()),
        }
    }

    /// Changes the priority flags of an entity, stored or still waiting
    /// for its collection. Returns the new id.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::UnknownEntity`] if no such entity exists.
    pub fn set_priority(&mut self, id: EntityId, priority: Priority) -> WorldResult<EntityId> {
        let raw = id.raw_id();
        if let Some(current) = self.store.entity(raw) {
            let next = current.with_priority(priority);
            self.store.update_entity(current, next)?;
            return Ok(next);
        }

        let entry = self
            .requests
            .deferred
            .get_mut()
            .iter_mut()
            .find(|d| d.id.raw_id() == raw)
            .ok_or(WorldError::UnknownEntity(id))?;
        entry.id = entry.id.with_priority(priority);
        Ok(entry.id)
    }

    /// Updates the load state of a registered definition.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::UnknownDefinition`] if it was never registered.
    pub fn set_definition_state(&mut self, definition: DefinitionId, state: LoadState) -> WorldResult<()> {
        self.store.set_load_state(definition, state)
    }

    /// Current value of the entity with this raw id.
    #[must_use]
    pub fn entity(&self, raw: u32) -> Option<EntityId> {
        self.access().entity(raw)
    }

    /// Archetypes containing every `include` type and no `exclude` type.
    #[must_use]
    pub fn find_collections(&self, include: &[ComponentTypeId], exclude: &[ComponentTypeId]) -> Vec<ArchetypeId> {
        find_by_types(&self.registry, &self.store, include, exclude)
    }

    /// A collection by handle.
    #[must_use]
    pub fn collection(&self, id: ArchetypeId) -> Option<&EntityCollection> {
        self.store.collection(id)
    }

    /// Collection holding the entity with this raw id.
    #[must_use]
    pub fn locate(&self, raw: u32) -> Option<ArchetypeId> {
        self.store.locate(raw)
    }

    /// Dense id of `T`.
    #[must_use]
    pub fn component_id<T: ?Sized + 'static>(&self) -> Option<ComponentId> {
        self.registry.id_of_type::<T>()
    }

    /// The component registry.
    #[must_use]
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// The configuration the world was built with.
    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Fence ids in execution order.
    #[must_use]
    pub fn fence_order(&self) -> Vec<FenceId> {
        self.scheduler.fence_order()
    }

    /// Scheduler phase.
    #[must_use]
    pub fn phase(&self) -> SchedulerPhase {
        self.scheduler.phase()
    }

    /// Number of frames run.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.scheduler.frame()
    }

    /// Number of raw ids in use.
    #[must_use]
    pub fn live_entities(&self) -> u32 {
        self.allocator.live_count()
    }

    /// Stops every update and shuts systems down in reverse order. Returns
    /// how many constant updates were stopped.
    pub fn shutdown(mut self) -> usize {
        let span = self.span.clone();
        let _entered = span.enter();
        let stopped = self.scheduler.clear_updates();
        for system in self.systems.iter_mut().rev() {
            system.shutdown();
        }
        tracing::info!(frames = self.frame(), stopped, "world shut down");
        stopped
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .field("archetypes", &self.store.len())
            .field("systems", &self.systems.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::Component;
    use crate::error::FenceError;
    use bytemuck::{Pod, Zeroable};
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

    const WALKER: DefinitionId = DefinitionId(1);

    /// Registers one definition; optionally creates a fence and counts calls.
    #[derive(Default)]
    struct Walkers {
        load_state: Option<LoadState>,
        fence: Option<(FenceId, FenceId)>,
        shutdowns: Arc<AtomicUsize>,
        rebinds: usize,
    }

    impl System for Walkers {
        fn name(&self) -> &'static str {
            "walkers"
        }

        fn initialize(&mut self, setup: &mut SystemSetup<'_>) -> WorldResult<()> {
            if let Some((fence, target)) = self.fence {
                setup.create_fence_after(fence, target)?;
            }
            if let Some(state) = self.load_state {
                let definition = EntityDefinition::new(
                    WALKER,
                    "walker",
                    vec![ComponentTypeId::of::<Position>(), ComponentTypeId::of::<Health>()],
                )
                .with_load_state(state);
                setup.register_definition(&definition)?;
            }
            Ok(())
        }

        fn rebind(&mut self, _view: &QueryView<'_>) {
            self.rebinds += 1;
        }

        fn declare_updates(&mut self, _updates: &mut UpdateDeclarations<'_>) -> WorldResult<()> {
            Ok(())
        }

        fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn types() -> [ComponentType; 2] {
        [ComponentType::of::<Position>(), ComponentType::of::<Health>()]
    }

    fn world(system: Walkers) -> World {
        World::new(WorldConfig::single_threaded(), &types(), vec![Box::new(system)]).unwrap()
    }

    #[test]
    fn test_definition_must_be_loaded() {
        let mut world = world(Walkers {
            load_state: Some(LoadState::Loading),
            ..Walkers::default()
        });
        assert_eq!(
            world.create_entity(WALKER),
            Err(WorldError::DefinitionNotLoaded {
                definition: WALKER,
                state: LoadState::Loading,
            })
        );
        assert_eq!(
            world.create_entity(DefinitionId(99)),
            Err(WorldError::UnknownDefinition(DefinitionId(99)))
        );

        world.set_definition_state(WALKER, LoadState::Loaded).unwrap();
        let id = world.create_entity(WALKER).unwrap();
        assert_eq!(id.life_state(), LifeState::Register);
        assert_eq!(world.live_entities(), 1);
    }

    #[test]
    fn test_create_with_missing_archetype_is_deferred() {
        let mut world = world(Walkers::default());
        let id = world
            .create_entity_with(&[ComponentTypeId::of::<Health>()])
            .unwrap();
        assert_eq!(world.locate(id.raw_id()), None);
        assert_eq!(world.entity(id.raw_id()), Some(id));

        let report = world.run_frame().unwrap();
        assert!(report.index_rebuilt);
        assert_eq!(report.migrated, 1);
        assert_eq!(report.lifecycle.promoted, 1);
        assert_eq!(
            world.find_collections(&[ComponentTypeId::of::<Health>()], &[]).len(),
            1
        );
        assert_eq!(world.entity(id.raw_id()).map(EntityId::life_state), Some(LifeState::Alive));
    }

    #[test]
    fn test_empty_component_set_rejected() {
        let world = world(Walkers::default());
        assert_eq!(
            world.create_entity_with(&[]),
            Err(WorldError::Collection(CollectionError::EmptySequence))
        );
        assert_eq!(world.live_entities(), 0);
    }

    #[test]
    fn test_set_priority_and_unknown_entity() {
        let mut world = world(Walkers {
            load_state: Some(LoadState::Loaded),
            ..Walkers::default()
        });
        let id = world.create_entity(WALKER).unwrap();
        let high = world.set_priority(id, Priority::High).unwrap();
        assert_eq!(high.priority(), Priority::High);
        assert_eq!(world.entity(id.raw_id()), Some(high));

        let ghost = EntityId::from_raw(500);
        assert_eq!(world.destroy_entity(ghost), Err(WorldError::UnknownEntity(ghost)));
        assert!(world.set_priority(ghost, Priority::Low).is_err());
    }

    #[test]
    fn test_set_priority_on_deferred_entity() {
        let mut world = world(Walkers::default());
        let id = world.create_entity_with(&[ComponentTypeId::of::<Health>()]).unwrap();
        assert_eq!(world.locate(id.raw_id()), None);

        let low = world.set_priority(id, Priority::Low).unwrap();
        assert_eq!(low.priority(), Priority::Low);
        assert_eq!(world.entity(id.raw_id()), Some(low));

        world.run_frame().unwrap();
        let stored = world.entity(id.raw_id()).unwrap();
        assert!(world.locate(id.raw_id()).is_some());
        assert_eq!(stored.priority(), Priority::Low);
        assert_eq!(stored.life_state(), LifeState::Alive);
    }

    #[test]
    fn test_system_init_failure_is_wrapped() {
        let system = Walkers {
            fence: Some((FenceId::new("late"), FenceId::UNREGISTER)),
            ..Walkers::default()
        };
        let err = World::new(WorldConfig::single_threaded(), &types(), vec![Box::new(system)]).unwrap_err();
        assert_eq!(
            err,
            WorldError::SystemInit {
                system: "walkers",
                source: Box::new(WorldError::Fence(FenceError::AfterUnregister(FenceId::new("late")))),
            }
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = WorldConfig {
            worker_threads: 0,
            ..WorldConfig::single_threaded()
        };
        assert!(matches!(
            World::new(config, &types(), Vec::new()),
            Err(WorldError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_shutdown_notifies_systems() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let world = world(Walkers {
            shutdowns: Arc::clone(&shutdowns),
            ..Walkers::default()
        });
        world.shutdown();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
