//! # TreeACL Core
//!
//! Shared types, boundary traits, and error handling for the TreeACL
//! authorization cache. Holds no runtime state; the cache itself lives in
//! `treeacl-authz`.

pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SecurityError};
pub use traits::{DataProvider, MessageProvider, MissingEntityResolver};
pub use types::{
    AceInfo, AclInfo, Activity, ActivityId, EntityId, EntryType, IdentityId, MutationKind,
    PermissionBitMask, PermissionType, SecurityEntity,
};
