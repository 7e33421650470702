//! Replicas sharing one store and one transport

mod common;

use common::*;
use treeacl_authz::{LocalMessageBus, MemoryDataProvider};
use treeacl_core::traits::MessageProvider;
use treeacl_core::types::{Activity, ActivityMessage, MutationKind};
use uuid::Uuid;

const G1: u64 = 100;
const U1: u64 = 500;

#[tokio::test]
async fn test_activities_replicate_to_peer() {
    let data = MemoryDataProvider::new();
    let bus = LocalMessageBus::new();
    let a = start_replica(&data, &bus).await;
    let b = start_replica(&data, &bus).await;
    assert_ne!(a.origin(), b.origin());

    build_tree(&a, &[(1, None), (2, Some(1))]).await;
    a.add_members(G1, &[U1], &[], &[]).await.unwrap();
    let last = a
        .acl_editor()
        .allow(1, G1, false, &[SEE])
        .apply()
        .await
        .unwrap()
        .unwrap();

    b.wait_until_applied(last).await.unwrap();
    assert!(b.cache().has_permission(2, &[U1], &[SEE]).unwrap());
    assert_eq!(b.completion_state().floor(), last);
    assert_eq!(a.completion_state(), b.completion_state());
    b.cache().validate_invariants().unwrap();
}

#[tokio::test]
async fn test_lost_message_is_filled_from_log() {
    let data = MemoryDataProvider::new();
    let bus = LocalMessageBus::new();
    let a = start_replica(&data, &bus).await;
    let b = start_replica(&data, &bus).await;

    a.create_entity(1, None, None).await.unwrap();
    bus.set_muted(true);
    a.create_entity(2, Some(1), None).await.unwrap();
    bus.set_muted(false);
    let last = a.create_entity(3, Some(2), None).await.unwrap();

    b.wait_until_applied(last).await.unwrap();
    assert_eq!(b.cache().get_entity(3).unwrap().level, 2);
    assert!(b.completion_state().gaps().is_empty());
}

#[tokio::test]
async fn test_explicit_catch_up() {
    let data = MemoryDataProvider::new();
    let bus = LocalMessageBus::new();
    let a = start_replica(&data, &bus).await;
    let b = start_replica(&data, &bus).await;

    bus.set_muted(true);
    build_tree(&a, &[(1, None), (2, Some(1))]).await;
    assert!(b.cache().get_entity(1).is_none());

    let state = b.catch_up().await.unwrap();
    b.wait_until_applied(2).await.unwrap();
    assert!(state.floor() <= 2);
    assert!(b.cache().get_entity(2).is_some());
}

#[tokio::test]
async fn test_health_check_fills_gaps() {
    let data = MemoryDataProvider::new();
    let bus = LocalMessageBus::new();
    let a = start_replica(&data, &bus).await;
    let mut config = config();
    config.activity.health_check_interval_ms = 20;
    let b = start_with(config, &data, Some(&bus)).await;

    bus.set_muted(true);
    a.create_entity(1, None, None).await.unwrap();

    assert!(eventually(|| async { b.cache().get_entity(1).is_some() }).await);
    assert_eq!(b.completion_state().floor(), 1);
    b.stop().await;
}

#[tokio::test]
async fn test_late_replica_loads_state_and_ignores_old_messages() {
    let data = MemoryDataProvider::new();
    let bus = LocalMessageBus::new();
    let a = start_replica(&data, &bus).await;
    build_tree(&a, &[(1, None), (2, Some(1))]).await;
    a.acl_editor().allow(2, G1, false, &[OPEN]).apply().await.unwrap();

    let b = start_replica(&data, &bus).await;
    assert!(b.cache().has_permission(2, &[G1], &[OPEN]).unwrap());
    assert_eq!(b.completion_state().floor(), 3);

    // a stale duplicate is dropped
    let stale = ActivityMessage::new(
        Uuid::new_v4(),
        Activity::new(MutationKind::DeleteEntity { entity_id: 1 }).with_sequence_id(2),
    );
    bus.send(stale.encode().unwrap()).await.unwrap();
    a.create_entity(3, None, None).await.unwrap();
    b.wait_until_applied(4).await.unwrap();
    assert!(b.cache().get_entity(1).is_some());
}

#[tokio::test]
async fn test_garbage_on_the_bus_is_ignored() {
    let data = MemoryDataProvider::new();
    let bus = LocalMessageBus::new();
    let a = start_replica(&data, &bus).await;
    let b = start_replica(&data, &bus).await;

    bus.send(vec![0xde, 0xad]).await.unwrap();
    let id = a.create_entity(1, None, None).await.unwrap();
    b.wait_until_applied(id).await.unwrap();
    assert!(b.cache().get_entity(1).is_some());
}
