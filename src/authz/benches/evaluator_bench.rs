//! Permission evaluation benchmarks
//!
//! Checks run against a loaded cache; deep chains exercise the nearest-holder
//! walk and nested groups exercise membership flattening.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;
use treeacl_authz::{BreakOptions, MemoryDataProvider, Principal, SecurityCache, SecurityConfig};
use treeacl_core::types::{
    AceInfo, EntityId, EntryType, PermissionType, SecurityGroup, StoredAce, StoredSecurityEntity,
};

const SEE: PermissionType = PermissionType::new(0, "See");
const OPEN: PermissionType = PermissionType::new(1, "Open");
const USER: u64 = 100_000;

fn entity(id: EntityId, parent_id: Option<EntityId>) -> StoredSecurityEntity {
    StoredSecurityEntity {
        id,
        parent_id,
        owner_id: None,
        is_inherited: true,
    }
}

fn allow(entity_id: EntityId, identity_id: u64, bits: u64) -> StoredAce {
    let mut entry = AceInfo::new(identity_id, EntryType::Normal, false);
    entry.allow_bits = bits;
    StoredAce { entity_id, entry }
}

/// Chain of `depth` entities with one grant at the root, plus `groups`
/// nested groups with the user at the bottom
fn build_cache(rt: &Runtime, depth: u64, groups: u64) -> SecurityCache {
    let entities = (1..=depth)
        .map(|id| entity(id, (id > 1).then(|| id - 1)))
        .collect();
    let top_group = USER + groups;
    let aces = vec![allow(1, top_group.max(USER), 0b11)];
    let groups = (1..=groups)
        .map(|i| {
            let group = SecurityGroup::new(USER + i);
            if i == 1 {
                group.with_users([USER])
            } else {
                group.with_groups([USER + i - 1])
            }
        })
        .collect();
    let data = MemoryDataProvider::with_data(entities, aces, groups);

    let config = SecurityConfig::default().with_permissions([SEE, OPEN]);
    let cache = SecurityCache::new(config).unwrap();
    rt.block_on(cache.load(&data)).unwrap();
    cache
}

fn bench_has_permission_depth(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("has_permission_depth");

    for depth in [1u64, 10, 100, 1000].iter() {
        let cache = build_cache(&rt, *depth, 0);
        group.bench_with_input(BenchmarkId::new("depth", depth), depth, |b, &depth| {
            b.iter(|| {
                black_box(
                    cache
                        .has_permission(black_box(depth), &[USER], &[SEE, OPEN])
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

fn bench_nested_groups(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("nested_groups");

    for nesting in [1u64, 8, 64].iter() {
        let cache = build_cache(&rt, 10, *nesting);
        let principal = Principal::new(USER);
        group.bench_with_input(BenchmarkId::new("levels", nesting), nesting, |b, _| {
            b.iter(|| {
                black_box(
                    cache
                        .has_permission_for(&principal, black_box(10), &[SEE])
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

fn bench_subtree_permission(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("subtree_permission");

    for depth in [10u64, 100, 1000].iter() {
        let cache = build_cache(&rt, *depth, 0);
        group.bench_with_input(BenchmarkId::new("subtree_size", depth), depth, |b, _| {
            b.iter(|| {
                black_box(
                    cache
                        .has_subtree_permission(1, &[USER], &[SEE], BreakOptions::DEFAULT)
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_has_permission_depth,
    bench_nested_groups,
    bench_subtree_permission
);
criterion_main!(benches);
