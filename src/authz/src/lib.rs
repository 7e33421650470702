//! # TreeACL Authorization Cache
//!
//! Embeddable permission engine for tree-shaped resource hierarchies.
//!
//! ## Features
//!
//! - **Inherited ACLs** resolved against the nearest ACL holder, with
//!   inheritance break points
//! - **Nested groups** flattened per user, tolerant of membership cycles
//! - **Deny overrides allow** across a principal's identities
//! - **Transactional ACL editing**: a batch commits atomically or not at all
//! - **Sequenced activities** with dependency ordering, gap recovery and
//!   replication over a pluggable transport
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use treeacl_authz::{MemoryDataProvider, SecurityConfig, SecuritySystem};
//! use treeacl_core::types::PermissionType;
//!
//! const SEE: PermissionType = PermissionType::new(0, "See");
//! const OPEN: PermissionType = PermissionType::new(1, "Open");
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SecurityConfig::default().with_permissions([SEE, OPEN]);
//!     let system = SecuritySystem::builder(config)
//!         .data_provider(Arc::new(MemoryDataProvider::new()))
//!         .start()
//!         .await?;
//!
//!     system.create_entity(1, None, None).await?;
//!     system.create_entity(2, Some(1), None).await?;
//!     system.acl_editor().allow(1, 100, false, &[SEE]).apply().await?;
//!
//!     assert!(system.cache().has_permission(2, &[100], &[SEE])?);
//!     assert!(!system.cache().has_permission(2, &[100], &[SEE, OPEN])?);
//!
//!     system.stop().await;
//!     Ok(())
//! }
//! ```

pub mod activity;
pub mod cache;
pub mod config;
pub mod editor;
pub mod entities;
pub mod evaluator;
pub mod membership;
pub mod providers;
pub mod query;
pub mod system;

// Re-export commonly used types
pub use activity::{ActivityEngine, ActivityState, CompletionState, FaultRecord};
pub use cache::{Principal, PreparedMutation, SecurityCache};
pub use config::{ActivitySection, SecurityConfig};
pub use editor::{AclEditor, AclOperation, MaskChange};
pub use entities::{EntityStore, StorePatch};
pub use evaluator::{AccessControlEntry, AccessControlList, BreakOptions};
pub use membership::{MembershipGraph, MembershipPatch};
pub use providers::{LocalMessageBus, MemoryDataProvider};
pub use query::SecurityQuery;
pub use system::{SecuritySystem, SecuritySystemBuilder};
pub use treeacl_core::{Result, SecurityError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
