//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use treeacl_authz::{LocalMessageBus, MemoryDataProvider, SecurityConfig, SecuritySystem};
use treeacl_core::types::{EntityId, PermissionType};

pub const SEE: PermissionType = PermissionType::new(0, "See");
pub const PREVIEW: PermissionType = PermissionType::new(1, "Preview");
pub const OPEN: PermissionType = PermissionType::new(2, "Open");
pub const SAVE: PermissionType = PermissionType::new(3, "Save");

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

/// Install a test subscriber once, honouring `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Configuration with the test permissions and no background health check
pub fn config() -> SecurityConfig {
    let mut config = SecurityConfig::default().with_permissions([SEE, PREVIEW, OPEN, SAVE]);
    config.activity.health_check_interval_ms = 0;
    config
}

pub async fn start(data: &MemoryDataProvider) -> SecuritySystem {
    start_with(config(), data, None).await
}

pub async fn start_replica(data: &MemoryDataProvider, bus: &LocalMessageBus) -> SecuritySystem {
    start_with(config(), data, Some(bus)).await
}

pub async fn start_with(
    config: SecurityConfig,
    data: &MemoryDataProvider,
    bus: Option<&LocalMessageBus>,
) -> SecuritySystem {
    init_tracing();
    let mut builder = SecuritySystem::builder(config).data_provider(Arc::new(data.clone()));
    if let Some(bus) = bus {
        builder = builder.message_provider(Arc::new(bus.clone()));
    }
    builder.start().await.expect("system starts")
}

/// Create `(id, parent)` pairs in order
pub async fn build_tree(system: &SecuritySystem, nodes: &[(EntityId, Option<EntityId>)]) {
    for (id, parent) in nodes {
        system
            .create_entity(*id, *parent, None)
            .await
            .expect("entity created");
    }
}

/// Poll `condition` until it holds or the default timeout passes
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
