//! # Archetype Benchmarks
//!
//! Measures the structural hot paths of an entity collection:
//! 1. Pending creation + commit migration
//! 2. Sweeping DESTROYED rows
//! 3. Include/exclude queries over many archetypes
//! 4. Typed column iteration

#![allow(missing_docs)]

use bytemuck::{Pod, Zeroable};
use cadence_core::{
    ArchetypeStore, Component, ComponentId, ComponentRegistry, ComponentSequence, ComponentType, EntityId, LifeState,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tracing::Span;

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

#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Health {
    current: u32,
    max: u32,
}
impl Component for Health {}

fn registry() -> ComponentRegistry {
    ComponentRegistry::build(&[
        ComponentType::of::<Position>(),
        ComponentType::of::<Velocity>(),
        ComponentType::of::<Health>(),
    ])
    .expect("three kinds")
}

fn populated(count: u32) -> (ComponentRegistry, ArchetypeStore, ComponentId) {
    let registry = registry();
    let position = registry.id_of_type::<Position>().expect("registered");
    let velocity = registry.id_of_type::<Velocity>().expect("registered");
    let mut store = ArchetypeStore::new(count as usize, &Span::none());
    let archetype = store
        .get_or_create(&registry, &ComponentSequence::new([position, velocity]))
        .expect("archetype");
    for raw in 1..=count {
        store.create_entity(archetype, EntityId::from_raw(raw)).expect("create");
    }
    store.commit().expect("commit");
    (registry, store, position)
}

// =============================================================================
// STRUCTURAL CHANGES
// =============================================================================

fn bench_create_and_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_commit");
    for count in [1_000u32, 10_000, 100_000] {
        group.throughput(Throughput::Elements(u64::from(count)));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let (_, store, _) = populated(count);
                black_box(store.len())
            });
        });
    }
    group.finish();
}

fn bench_sweep_destroyed(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep_destroyed");
    for percent in [10u32, 50] {
        group.bench_function(format!("{percent}pct_of_100k"), |b| {
            b.iter_batched(
                || {
                    let (_, mut store, _) = populated(100_000);
                    for raw in (1..=100_000).filter(|raw| raw % 100 < percent) {
                        let id = EntityId::from_raw(raw);
                        let unregistered = id.with_life_state(LifeState::Unregister);
                        store.update_entity(id, unregistered).expect("unregister");
                        store
                            .update_entity(unregistered, id.with_life_state(LifeState::Destroyed))
                            .expect("destroy");
                    }
                    store
                },
                |mut store| black_box(store.commit().expect("commit").removed.len()),
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

// =============================================================================
// QUERIES
// =============================================================================

fn bench_find_collections(c: &mut Criterion) {
    let registry = registry();
    let ids: Vec<ComponentId> = (1..=3).map(ComponentId::new).collect();
    let mut store = ArchetypeStore::new(0, &Span::none());
    // Every non-empty subset of the three kinds.
    for mask in 1u8..8 {
        let kinds = ids.iter().enumerate().filter(|(i, _)| mask & (1 << i) != 0).map(|(_, k)| *k);
        store.get_or_create(&registry, &ComponentSequence::new(kinds)).expect("archetype");
    }
    store.refresh_index(registry.kind_count());

    c.bench_function("find_position_without_health", |b| {
        b.iter(|| black_box(store.find_collections(black_box(&ids[..1]), black_box(&ids[2..]))));
    });
}

fn bench_column_iterate(c: &mut Criterion) {
    let (_, store, position) = populated(100_000);
    let (_, collection) = store.collections().next().expect("one archetype");

    c.bench_function("write_position_100k", |b| {
        b.iter(|| {
            let mut column = collection.write::<Position>(position).expect("column");
            for p in column.iter_mut() {
                p.x += 0.016;
            }
            black_box(column.len())
        });
    });
}

criterion_group!(
    benches,
    bench_create_and_commit,
    bench_sweep_destroyed,
    bench_find_collections,
    bench_column_iterate,
);

criterion_main!(benches);
