//! Securable entities

use super::{EntityId, IdentityId};
use serde::{Deserialize, Serialize};

/// One node of the securable entity tree as held by the cache.
///
/// Children are not stored here; the cache derives them from a parent index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEntity {
    pub id: EntityId,
    pub parent_id: Option<EntityId>,
    pub owner_id: Option<IdentityId>,
    /// Depth in the tree, 0 for roots
    pub level: u32,
    /// `false` iff this entity is an inheritance break point
    pub is_inherited: bool,
    /// Nearest ancestor (inclusive) that is a break point or holds a
    /// non-empty ACL
    pub first_acl_id: Option<EntityId>,
}

impl SecurityEntity {
    pub fn new(id: EntityId, parent_id: Option<EntityId>, owner_id: Option<IdentityId>) -> Self {
        Self {
            id,
            parent_id,
            owner_id,
            level: 0,
            is_inherited: true,
            first_acl_id: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Entity row as persisted by a data provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSecurityEntity {
    pub id: EntityId,
    pub parent_id: Option<EntityId>,
    pub owner_id: Option<IdentityId>,
    pub is_inherited: bool,
}

impl From<&SecurityEntity> for StoredSecurityEntity {
    fn from(entity: &SecurityEntity) -> Self {
        Self {
            id: entity.id,
            parent_id: entity.parent_id,
            owner_id: entity.owner_id,
            is_inherited: entity.is_inherited,
        }
    }
}
