//! Shared value types of the authorization cache

pub mod acl;
pub mod activity;
pub mod entity;
pub mod membership;
pub mod permission;

pub use acl::{AceInfo, AceKey, AclInfo, EntryType, StoredAce};
pub use activity::{
    AclChangeSet, AclOperation, Activity, ActivityId, ActivityMessage, ExecutionState,
    MaskChange, MutationKind,
};
pub use entity::{SecurityEntity, StoredSecurityEntity};
pub use membership::SecurityGroup;
pub use permission::{
    PermissionBitMask, PermissionType, PermissionTypeRegistry, PermissionValue, PERMISSION_COUNT,
};

/// Id of a securable entity. Zero is the "no entity" sentinel.
pub type EntityId = u64;

/// Id of a user or group. Users and groups share one id space.
pub type IdentityId = u64;
