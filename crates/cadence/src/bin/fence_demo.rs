//! # Fence Demo
//!
//! Particles are spawned in the Register fence, integrated in a custom
//! fence after Update, and aged out in a custom fence before Unregister.
//!
//! ```text
//! Register ─► Update ─► Integrate ─► Cleanup ─► Unregister
//!  spawn                 move         age+reap
//! ```
//!
//! Usage: `fence_demo [config.toml]`. Log level via `RUST_LOG`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use cadence::cadence_core::{
    Component, ComponentId, ComponentType, ComponentTypeId, DefinitionId, EntityDefinition, FenceId, LifeState,
    LoadState, System, SystemSetup, Update, UpdateDeclarations, UpdateMode, World, WorldConfig, WorldResult,
};
use cadence::{FrameLoop, FrameLoopConfig};
use parking_lot::Mutex;
use tracing::info;

const INTEGRATE: FenceId = FenceId::new("Integrate");
const CLEANUP: FenceId = FenceId::new("Cleanup");
const PARTICLE: DefinitionId = DefinitionId(1);

const SPAWN_PER_FRAME: usize = 64;
const MAX_AGE: u32 = 30;

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
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}
impl Component for Velocity {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct Age(u32);
impl Component for Age {}

/// Owns the particle definition and spawns a batch every frame.
#[derive(Default)]
struct Spawner {
    spawned: Arc<AtomicU64>,
}

impl System for Spawner {
    fn name(&self) -> &'static str {
        "spawner"
    }

    fn initialize(&mut self, setup: &mut SystemSetup<'_>) -> WorldResult<()> {
        setup.create_fence_after(INTEGRATE, FenceId::UPDATE)?;
        setup.create_fence_before(CLEANUP, FenceId::UNREGISTER)?;
        let definition = EntityDefinition::new(
            PARTICLE,
            "particle",
            vec![
                ComponentTypeId::of::<Position>(),
                ComponentTypeId::of::<Velocity>(),
                ComponentTypeId::of::<Age>(),
            ],
        )
        .with_load_state(LoadState::Loaded);
        setup.register_definition(&definition)?;
        Ok(())
    }

    fn declare_updates(&mut self, updates: &mut UpdateDeclarations<'_>) -> WorldResult<()> {
        let spawned = Arc::clone(&self.spawned);
        updates.schedule_update(
            Update::new("spawn", move |ctx| {
                for _ in 0..SPAWN_PER_FRAME {
                    match ctx.world().create_entity(PARTICLE) {
                        Ok(_) => {
                            spawned.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            tracing::warn!(%err, "spawn failed");
                            return;
                        }
                    }
                }
            })
            .on(FenceId::REGISTER),
        )?;
        Ok(())
    }
}

/// Gives new particles a velocity and integrates positions.
struct Physics {
    position: Option<ComponentId>,
    velocity: Option<ComponentId>,
}

impl System for Physics {
    fn name(&self) -> &'static str {
        "physics"
    }

    fn initialize(&mut self, setup: &mut SystemSetup<'_>) -> WorldResult<()> {
        self.position = setup.component_id::<Position>();
        self.velocity = setup.component_id::<Velocity>();
        Ok(())
    }

    fn declare_updates(&mut self, updates: &mut UpdateDeclarations<'_>) -> WorldResult<()> {
        let (Some(position), Some(velocity)) = (self.position, self.velocity) else {
            return Ok(());
        };
        if updates.has_constant_update("integrate") {
            return Ok(());
        }

        updates.start_constant_update(
            Update::new("integrate", move |ctx| {
                let world = ctx.world();
                for archetype in world.find_kinds(&[position, velocity], &[]) {
                    let Some(collection) = world.collection(archetype) else {
                        continue;
                    };
                    let (Ok(mut positions), Ok(velocities)) =
                        (collection.write::<Position>(position), collection.read::<Velocity>(velocity))
                    else {
                        continue;
                    };
                    for row in ctx.task_range(positions.len()) {
                        let v = velocities[row];
                        let p = &mut positions[row];
                        p.x += v.x;
                        p.y += v.y;
                        p.z += v.z;
                    }
                }
            })
            .on(INTEGRATE)
            .mode(UpdateMode::ConcurrentDistributed)
            .reads([velocity])
            .writes([position]),
        )?;

        updates.start_constant_update(
            Update::new("launch", move |ctx| {
                let world = ctx.world();
                for archetype in world.find_kinds(&[velocity], &[]) {
                    let Some(collection) = world.collection(archetype) else {
                        continue;
                    };
                    let Ok(mut velocities) = collection.write::<Velocity>(velocity) else {
                        continue;
                    };
                    for (v, id) in velocities.iter_mut().zip(collection.entities()) {
                        if id.life_state() == LifeState::Alive && *v == Velocity::default() {
                            let seed = f32::from(u16::try_from(id.raw_id() % 16).unwrap_or(0));
                            *v = Velocity {
                                x: 1.0,
                                y: seed * 0.5,
                                z: -seed * 0.25,
                            };
                        }
                    }
                }
            })
            .mode(UpdateMode::Concurrent)
            .writes([velocity]),
        )?;
        Ok(())
    }
}

/// Ages particles and destroys the old ones.
struct Reaper {
    age: Option<ComponentId>,
    reaped: Arc<Mutex<u64>>,
}

impl System for Reaper {
    fn name(&self) -> &'static str {
        "reaper"
    }

    fn initialize(&mut self, setup: &mut SystemSetup<'_>) -> WorldResult<()> {
        self.age = setup.component_id::<Age>();
        Ok(())
    }

    fn declare_updates(&mut self, updates: &mut UpdateDeclarations<'_>) -> WorldResult<()> {
        let Some(age) = self.age else {
            return Ok(());
        };
        if updates.has_constant_update("age") {
            return Ok(());
        }

        let reaped = Arc::clone(&self.reaped);
        updates.start_constant_update(
            Update::new("age", move |ctx| {
                let world = ctx.world();
                let mut expired = 0;
                for archetype in world.find_kinds(&[age], &[]) {
                    let Some(collection) = world.collection(archetype) else {
                        continue;
                    };
                    let Ok(mut ages) = collection.write::<Age>(age) else {
                        continue;
                    };
                    for (a, id) in ages.iter_mut().zip(collection.entities()) {
                        if id.life_state() != LifeState::Alive {
                            continue;
                        }
                        a.0 += 1;
                        if a.0 >= MAX_AGE {
                            world.destroy_entity(*id);
                            expired += 1;
                        }
                    }
                }
                *reaped.lock() += expired;
            })
            .on(CLEANUP)
            .mode(UpdateMode::Concurrent)
            .writes([age]),
        )?;
        Ok(())
    }

    fn shutdown(&mut self) {
        info!(reaped = *self.reaped.lock(), "reaper shut down");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => WorldConfig::load(path)?,
        None => WorldConfig::default(),
    };
    info!(?config, "starting fence demo");

    let spawned = Arc::new(AtomicU64::new(0));
    let systems: Vec<Box<dyn System>> = vec![
        Box::new(Spawner {
            spawned: Arc::clone(&spawned),
        }),
        Box::new(Physics {
            position: None,
            velocity: None,
        }),
        Box::new(Reaper {
            age: None,
            reaped: Arc::new(Mutex::new(0)),
        }),
    ];
    let mut world = World::new(
        config,
        &[
            ComponentType::of::<Position>(),
            ComponentType::of::<Velocity>(),
            ComponentType::of::<Age>(),
        ],
        systems,
    )?;
    info!(fences = ?world.fence_order(), "fence order");

    let mut frame_loop = FrameLoop::new(FrameLoopConfig {
        target_fps: 60,
        budget_warning: Duration::from_millis(16),
        max_frames: 120,
    });
    let frames = frame_loop.run(&mut world)?;
    frame_loop.stats().log_summary();

    info!(
        frames,
        spawned = spawned.load(Ordering::Relaxed),
        live = world.live_entities(),
        "demo finished"
    );
    world.shutdown();
    Ok(())
}
