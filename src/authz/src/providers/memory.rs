//! In-memory data provider with an activity log

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use treeacl_core::error::{Result, SecurityError};
use treeacl_core::traits::{DataProvider, LoggedActivity};
use treeacl_core::types::{
    AceInfo, AceKey, AclInfo, Activity, ActivityId, EntityId, ExecutionState, IdentityId,
    SecurityGroup, StoredAce, StoredSecurityEntity,
};

#[derive(Default)]
struct Tables {
    entities: BTreeMap<EntityId, StoredSecurityEntity>,
    aces: BTreeMap<EntityId, BTreeMap<AceKey, AceInfo>>,
    groups: BTreeMap<IdentityId, SecurityGroup>,
    log: BTreeMap<ActivityId, LoggedActivity>,
    next_id: ActivityId,
}

/// Data provider keeping every table in memory.
///
/// Clones share the same tables, so several `SecuritySystem` replicas can
/// sit on one store.
#[derive(Clone, Default)]
pub struct MemoryDataProvider {
    tables: Arc<RwLock<Tables>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryDataProvider {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with rows
    pub fn with_data(
        entities: Vec<StoredSecurityEntity>,
        aces: Vec<StoredAce>,
        groups: Vec<SecurityGroup>,
    ) -> Self {
        let mut tables = Tables::default();
        for entity in entities {
            tables.entities.insert(entity.id, entity);
        }
        for ace in aces {
            tables
                .aces
                .entry(ace.entity_id)
                .or_default()
                .insert(ace.entry.key(), ace.entry);
        }
        for group in groups {
            tables.groups.insert(group.id, group);
        }
        Self {
            tables: Arc::new(RwLock::new(tables)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every data-table write fail with a storage error. The activity
    /// log keeps working.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Stored row of one entity
    pub async fn entity_row(&self, id: EntityId) -> Option<StoredSecurityEntity> {
        self.tables.read().await.entities.get(&id).cloned()
    }

    /// Execution state of a logged activity
    pub async fn execution_state(&self, id: ActivityId) -> Option<ExecutionState> {
        self.tables.read().await.log.get(&id).map(|l| l.state)
    }

    /// Append an activity to the log without running it, as another
    /// process would. Returns the assigned id.
    pub async fn append_foreign_activity(&self, activity: Activity, state: ExecutionState) -> ActivityId {
        let mut tables = self.tables.write().await;
        tables.next_id += 1;
        let id = tables.next_id;
        tables.log.insert(
            id,
            LoggedActivity {
                activity: activity.with_sequence_id(id),
                state,
            },
        );
        id
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SecurityError::Storage("store rejected the write".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DataProvider for MemoryDataProvider {
    async fn load_entities(&self) -> Result<Vec<StoredSecurityEntity>> {
        Ok(self.tables.read().await.entities.values().cloned().collect())
    }

    async fn load_all_aces(&self) -> Result<Vec<StoredAce>> {
        let tables = self.tables.read().await;
        Ok(tables
            .aces
            .iter()
            .flat_map(|(entity_id, entries)| {
                entries.values().map(move |entry| StoredAce {
                    entity_id: *entity_id,
                    entry: entry.clone(),
                })
            })
            .collect())
    }

    async fn load_aces(&self, entity_ids: &[EntityId]) -> Result<Vec<StoredAce>> {
        let tables = self.tables.read().await;
        Ok(entity_ids
            .iter()
            .filter_map(|id| tables.aces.get(id).map(|entries| (*id, entries)))
            .flat_map(|(entity_id, entries)| {
                entries.values().map(move |entry| StoredAce {
                    entity_id,
                    entry: entry.clone(),
                })
            })
            .collect())
    }

    async fn load_all_groups(&self) -> Result<Vec<SecurityGroup>> {
        Ok(self.tables.read().await.groups.values().cloned().collect())
    }

    async fn load_group(&self, group_id: IdentityId) -> Result<Option<SecurityGroup>> {
        Ok(self.tables.read().await.groups.get(&group_id).cloned())
    }

    async fn upsert_entity(&self, entity: StoredSecurityEntity) -> Result<()> {
        self.check_writable()?;
        self.tables.write().await.entities.insert(entity.id, entity);
        Ok(())
    }

    async fn delete_entities(&self, entity_ids: &[EntityId]) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        for id in entity_ids {
            tables.entities.remove(id);
            tables.aces.remove(id);
        }
        Ok(())
    }

    async fn write_acls(&self, acls: &[AclInfo]) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        for acl in acls {
            let id = acl.holder_entity_id;
            let entries: BTreeMap<AceKey, AceInfo> = acl
                .entries
                .iter()
                .filter(|e| !e.is_empty())
                .map(|e| (e.key(), e.clone()))
                .collect();
            if entries.is_empty() {
                tables.aces.remove(&id);
            } else {
                tables.aces.insert(id, entries);
            }
            if let Some(row) = tables.entities.get_mut(&id) {
                row.is_inherited = acl.inherits;
            }
        }
        Ok(())
    }

    async fn remove_acls(&self, entity_ids: &[EntityId]) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        for id in entity_ids {
            tables.aces.remove(id);
            if let Some(row) = tables.entities.get_mut(id) {
                row.is_inherited = true;
            }
        }
        Ok(())
    }

    async fn add_members(
        &self,
        group_id: IdentityId,
        user_ids: &[IdentityId],
        group_ids: &[IdentityId],
    ) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let group = tables
            .groups
            .entry(group_id)
            .or_insert_with(|| SecurityGroup::new(group_id));
        group.user_ids.extend(user_ids.iter().copied());
        group.group_ids.extend(group_ids.iter().copied());
        for member in group_ids {
            tables
                .groups
                .entry(*member)
                .or_insert_with(|| SecurityGroup::new(*member));
        }
        Ok(())
    }

    async fn remove_members(
        &self,
        group_id: IdentityId,
        user_ids: &[IdentityId],
        group_ids: &[IdentityId],
    ) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        if let Some(group) = tables.groups.get_mut(&group_id) {
            for user in user_ids {
                group.user_ids.remove(user);
            }
            for member in group_ids {
                group.group_ids.remove(member);
            }
        }
        Ok(())
    }

    async fn delete_identity(&self, identity_id: IdentityId) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        tables.groups.remove(&identity_id);
        for group in tables.groups.values_mut() {
            group.user_ids.remove(&identity_id);
            group.group_ids.remove(&identity_id);
        }
        Ok(())
    }

    async fn save_activity(&self, activity: &Activity) -> Result<ActivityId> {
        let mut tables = self.tables.write().await;
        tables.next_id += 1;
        let id = tables.next_id;
        tables.log.insert(
            id,
            LoggedActivity {
                activity: activity.clone().with_sequence_id(id),
                state: ExecutionState::Wait,
            },
        );
        Ok(id)
    }

    async fn load_activities(
        &self,
        from: ActivityId,
        to: ActivityId,
        limit: usize,
    ) -> Result<Vec<LoggedActivity>> {
        if from > to {
            return Ok(Vec::new());
        }
        let tables = self.tables.read().await;
        Ok(tables
            .log
            .range(from..=to)
            .take(limit)
            .map(|(_, logged)| logged.clone())
            .collect())
    }

    async fn set_execution_state(&self, id: ActivityId, state: ExecutionState) -> Result<()> {
        let mut tables = self.tables.write().await;
        let logged = tables
            .log
            .get_mut(&id)
            .ok_or_else(|| SecurityError::Storage(format!("activity {} is not logged", id)))?;
        logged.state = state;
        Ok(())
    }

    async fn last_activity_id(&self) -> Result<ActivityId> {
        Ok(self.tables.read().await.next_id)
    }

    async fn load_unprocessed_activities(&self) -> Result<Vec<Activity>> {
        let tables = self.tables.read().await;
        Ok(tables
            .log
            .values()
            .filter(|l| l.state.is_unprocessed())
            .map(|l| l.activity.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treeacl_core::types::{EntryType, MutationKind};

    fn row(id: EntityId, parent_id: Option<EntityId>) -> StoredSecurityEntity {
        StoredSecurityEntity {
            id,
            parent_id,
            owner_id: None,
            is_inherited: true,
        }
    }

    #[tokio::test]
    async fn test_acl_writes_replace_entries_and_flag() {
        let store = MemoryDataProvider::with_data(vec![row(1, None), row(2, Some(1))], vec![], vec![]);

        let mut acl = AclInfo::new(2, false);
        acl.entry_mut(AceKey::new(7, EntryType::Normal, false)).allow_bits = 0b1;
        store.write_acls(&[acl]).await.unwrap();

        assert_eq!(store.load_aces(&[2]).await.unwrap().len(), 1);
        assert!(!store.entity_row(2).await.unwrap().is_inherited);

        store.remove_acls(&[2]).await.unwrap();
        assert!(store.load_all_aces().await.unwrap().is_empty());
        assert!(store.entity_row(2).await.unwrap().is_inherited);
    }

    #[tokio::test]
    async fn test_activity_log() {
        let store = MemoryDataProvider::new();
        let activity = Activity::new(MutationKind::DeleteEntity { entity_id: 1 });
        assert_eq!(store.save_activity(&activity).await.unwrap(), 1);
        assert_eq!(store.save_activity(&activity).await.unwrap(), 2);
        store.set_execution_state(1, ExecutionState::Done).await.unwrap();

        let unprocessed = store.load_unprocessed_activities().await.unwrap();
        assert_eq!(unprocessed.len(), 1);
        assert_eq!(unprocessed[0].sequence_id, 2);

        let page = store.load_activities(1, 2, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].state, ExecutionState::Done);
        assert_eq!(store.last_activity_id().await.unwrap(), 2);
        assert!(store.set_execution_state(9, ExecutionState::Done).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_writes_leave_log_usable() {
        let store = MemoryDataProvider::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.upsert_entity(row(1, None)).await,
            Err(SecurityError::Storage(_))
        ));
        let activity = Activity::new(MutationKind::DeleteEntity { entity_id: 1 });
        assert!(store.save_activity(&activity).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_identity_removes_memberships() {
        let store = MemoryDataProvider::new();
        store.add_members(10, &[1, 2], &[11]).await.unwrap();
        store.add_members(11, &[1], &[]).await.unwrap();
        store.delete_identity(1).await.unwrap();
        store.delete_identity(11).await.unwrap();

        let group = store.load_group(10).await.unwrap().unwrap();
        assert_eq!(group.user_ids.into_iter().collect::<Vec<_>>(), vec![2]);
        assert!(group.group_ids.is_empty());
        assert!(store.load_group(11).await.unwrap().is_none());
    }
}
