//! Mapping of mutations onto data provider writes

use std::collections::BTreeSet;
use treeacl_core::error::{Result, SecurityError};
use treeacl_core::traits::DataProvider;
use treeacl_core::types::{AclChangeSet, MutationKind, StoredSecurityEntity};

use crate::cache::{PreparedMutation, SecurityCache};

/// Write a prepared mutation to the store.
///
/// Runs before the cache is updated, so current rows are read from the
/// cache. Every write is idempotent.
pub async fn persist(data: &dyn DataProvider, cache: &SecurityCache, mutation: &PreparedMutation<'_>) -> Result<()> {
    match mutation {
        PreparedMutation::Acl(changes) => persist_acl_changes(data, cache, changes).await,
        PreparedMutation::Direct(payload) => persist_payload(data, cache, payload).await,
    }
}

async fn persist_acl_changes(data: &dyn DataProvider, cache: &SecurityCache, changes: &AclChangeSet) -> Result<()> {
    if !changes.acls.is_empty() {
        data.write_acls(&changes.acls).await?;
    }
    if !changes.removed_acls.is_empty() {
        data.remove_acls(&changes.removed_acls).await?;
    }

    // flag flips not already carried by a written or removed ACL
    let covered: BTreeSet<_> = changes
        .acls
        .iter()
        .map(|a| a.holder_entity_id)
        .chain(changes.removed_acls.iter().copied())
        .collect();
    let flips = changes
        .breaks
        .iter()
        .map(|id| (*id, false))
        .chain(changes.unbreaks.iter().map(|id| (*id, true)))
        .filter(|(id, _)| !covered.contains(id));
    for (id, is_inherited) in flips {
        if let Some(existing) = cache.get_entity(id) {
            data.upsert_entity(StoredSecurityEntity {
                is_inherited,
                ..StoredSecurityEntity::from(&existing)
            })
            .await?;
        }
    }
    Ok(())
}

async fn persist_payload(data: &dyn DataProvider, cache: &SecurityCache, payload: &MutationKind) -> Result<()> {
    match payload {
        MutationKind::CreateEntity {
            entity_id,
            parent_id,
            owner_id,
        } => {
            let row = match cache.get_entity(*entity_id) {
                Some(existing) => StoredSecurityEntity {
                    owner_id: *owner_id,
                    ..StoredSecurityEntity::from(&existing)
                },
                None => StoredSecurityEntity {
                    id: *entity_id,
                    parent_id: *parent_id,
                    owner_id: *owner_id,
                    is_inherited: true,
                },
            };
            data.upsert_entity(row).await
        }
        MutationKind::DeleteEntity { entity_id } => {
            let removed = cache.entities().subtree(*entity_id);
            if removed.is_empty() {
                return Ok(());
            }
            data.delete_entities(&removed).await
        }
        MutationKind::MoveEntity {
            entity_id,
            target_id,
        } => match cache.get_entity(*entity_id) {
            Some(existing) => {
                data.upsert_entity(StoredSecurityEntity {
                    parent_id: Some(*target_id),
                    ..StoredSecurityEntity::from(&existing)
                })
                .await
            }
            None => Ok(()),
        },
        MutationKind::ModifyOwner {
            entity_id,
            owner_id,
        } => match cache.get_entity(*entity_id) {
            Some(existing) => {
                data.upsert_entity(StoredSecurityEntity {
                    owner_id: *owner_id,
                    ..StoredSecurityEntity::from(&existing)
                })
                .await
            }
            None => Ok(()),
        },
        MutationKind::EditAcl(_) => Err(SecurityError::Internal(
            "editor batch persisted without being prepared".into(),
        )),
        MutationKind::AddMembers {
            group_id,
            user_ids,
            group_ids,
            parent_group_ids,
        } => {
            data.add_members(*group_id, user_ids, group_ids).await?;
            for parent in parent_group_ids {
                data.add_members(*parent, &[], &[*group_id]).await?;
            }
            Ok(())
        }
        MutationKind::RemoveMembers {
            group_id,
            user_ids,
            group_ids,
            parent_group_ids,
        } => {
            data.remove_members(*group_id, user_ids, group_ids).await?;
            for parent in parent_group_ids {
                data.remove_members(*parent, &[], &[*group_id]).await?;
            }
            Ok(())
        }
        MutationKind::AddUserToGroups { user_id, group_ids } => {
            for group_id in group_ids {
                data.add_members(*group_id, &[*user_id], &[]).await?;
            }
            Ok(())
        }
        MutationKind::RemoveUserFromGroups { user_id, group_ids } => {
            for group_id in group_ids {
                data.remove_members(*group_id, &[*user_id], &[]).await?;
            }
            Ok(())
        }
        MutationKind::DeleteGroup { group_id } => data.delete_identity(*group_id).await,
        MutationKind::DeleteUser { user_id } => data.delete_identity(*user_id).await,
    }
}
