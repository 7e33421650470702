//! Optional host hook for lazily materializing missing entities

use crate::types::{EntityId, IdentityId};

/// Placement of an entity the cache did not know about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedEntity {
    pub parent_id: Option<EntityId>,
    pub owner_id: Option<IdentityId>,
}

/// Answers "where does this entity live" for ids missing from the cache.
///
/// Used by cold caches after partial data loss; called synchronously on the
/// lookup path, so implementations should be cheap.
pub trait MissingEntityResolver: Send + Sync {
    fn resolve(&self, entity_id: EntityId) -> Option<ResolvedEntity>;
}
