//! Persistent store contract

use crate::error::Result;
use crate::types::{
    AclInfo, Activity, ActivityId, EntityId, ExecutionState, IdentityId, SecurityGroup,
    StoredAce, StoredSecurityEntity,
};
use async_trait::async_trait;

/// An activity log row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedActivity {
    pub activity: Activity,
    pub state: ExecutionState,
}

/// Durable storage for entities, ACLs, the membership graph and the
/// append-only activity log.
///
/// Every write must be idempotent: unprocessed activities are re-executed
/// after a restart and may repeat writes that already reached the store.
/// A write that returned `Ok` must be visible to a later full reload.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Load every entity
    async fn load_entities(&self) -> Result<Vec<StoredSecurityEntity>>;

    /// Load every stored entry
    async fn load_all_aces(&self) -> Result<Vec<StoredAce>>;

    /// Load the entries held by the given entities
    async fn load_aces(&self, entity_ids: &[EntityId]) -> Result<Vec<StoredAce>>;

    /// Load every group with its direct members
    async fn load_all_groups(&self) -> Result<Vec<SecurityGroup>>;

    /// Load one group's direct members
    async fn load_group(&self, group_id: IdentityId) -> Result<Option<SecurityGroup>>;

    /// Insert or overwrite an entity row
    async fn upsert_entity(&self, entity: StoredSecurityEntity) -> Result<()>;

    /// Delete entity rows together with their entries
    async fn delete_entities(&self, entity_ids: &[EntityId]) -> Result<()>;

    /// Replace the complete entry set of each ACL holder and its inheritance flag
    async fn write_acls(&self, acls: &[AclInfo]) -> Result<()>;

    /// Delete every entry of the given entities and mark them inheriting
    async fn remove_acls(&self, entity_ids: &[EntityId]) -> Result<()>;

    /// Add direct members to a group, creating the group when missing
    async fn add_members(
        &self,
        group_id: IdentityId,
        user_ids: &[IdentityId],
        group_ids: &[IdentityId],
    ) -> Result<()>;

    /// Remove direct members from a group
    async fn remove_members(
        &self,
        group_id: IdentityId,
        user_ids: &[IdentityId],
        group_ids: &[IdentityId],
    ) -> Result<()>;

    /// Remove a user or group from every membership relation
    async fn delete_identity(&self, identity_id: IdentityId) -> Result<()>;

    /// Append an activity to the log in `Wait` state and return its
    /// sequence id
    async fn save_activity(&self, activity: &Activity) -> Result<ActivityId>;

    /// Load logged activities with ids in `from..=to`, ascending, at most
    /// `limit` rows
    async fn load_activities(
        &self,
        from: ActivityId,
        to: ActivityId,
        limit: usize,
    ) -> Result<Vec<LoggedActivity>>;

    /// Record an execution state transition
    async fn set_execution_state(&self, id: ActivityId, state: ExecutionState) -> Result<()>;

    /// Highest logged sequence id, 0 for an empty log
    async fn last_activity_id(&self) -> Result<ActivityId>;

    /// Activities still in `Wait` or `Executing` state, ascending
    async fn load_unprocessed_activities(&self) -> Result<Vec<Activity>>;
}
