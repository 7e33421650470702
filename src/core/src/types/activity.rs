//! Sequenced mutations ("activities") and their wire envelope

use super::{AceKey, AclInfo, EntityId, EntryType, IdentityId, PermissionBitMask};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Sequence id of an activity. Zero means "not yet assigned".
pub type ActivityId = u64;

/// Edit applied to one entry's masks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskChange {
    /// Set allow bits, removing them from deny
    Allow(u64),
    /// Set deny bits, removing them from allow
    Deny(u64),
    /// Replace both masks
    Set(PermissionBitMask),
    /// Replace the allow mask and drop the same bits from deny
    Reset(u64),
    /// Remove bits from both masks
    Clear(u64),
}

/// One ACL editor operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclOperation {
    Modify {
        entity_id: EntityId,
        key: AceKey,
        change: MaskChange,
    },
    /// Stop inheriting, seeding the ACL with the effective entries of
    /// `copy_types`
    BreakInheritance {
        entity_id: EntityId,
        copy_types: Vec<EntryType>,
    },
    /// Inherit again, dropping redundant entries of `normalize_types`
    UnbreakInheritance {
        entity_id: EntityId,
        normalize_types: Vec<EntryType>,
    },
    NormalizeExplicitPermissions {
        entity_id: EntityId,
        entry_types: Vec<EntryType>,
    },
    CopyEffectivePermissions {
        entity_id: EntityId,
        entry_types: Vec<EntryType>,
    },
}

impl AclOperation {
    pub fn entity_id(&self) -> EntityId {
        match self {
            AclOperation::Modify { entity_id, .. }
            | AclOperation::BreakInheritance { entity_id, .. }
            | AclOperation::UnbreakInheritance { entity_id, .. }
            | AclOperation::NormalizeExplicitPermissions { entity_id, .. }
            | AclOperation::CopyEffectivePermissions { entity_id, .. } => *entity_id,
        }
    }
}

/// Final ACL states produced by running an operation batch against one
/// snapshot, ready to be committed atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclChangeSet {
    /// Final state of every ACL that exists after the batch
    pub acls: Vec<AclInfo>,
    /// Entities whose ACL record is deleted by the batch
    pub removed_acls: Vec<EntityId>,
    /// Entities that become break points
    pub breaks: Vec<EntityId>,
    /// Entities that stop being break points
    pub unbreaks: Vec<EntityId>,
}

impl AclChangeSet {
    pub fn is_empty(&self) -> bool {
        self.acls.is_empty()
            && self.removed_acls.is_empty()
            && self.breaks.is_empty()
            && self.unbreaks.is_empty()
    }

    /// Every entity touched by the change set
    pub fn entity_ids(&self) -> BTreeSet<EntityId> {
        self.acls
            .iter()
            .map(|a| a.holder_entity_id)
            .chain(self.removed_acls.iter().copied())
            .chain(self.breaks.iter().copied())
            .chain(self.unbreaks.iter().copied())
            .collect()
    }
}

/// Payload of an activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    CreateEntity {
        entity_id: EntityId,
        parent_id: Option<EntityId>,
        owner_id: Option<IdentityId>,
    },
    DeleteEntity {
        entity_id: EntityId,
    },
    MoveEntity {
        entity_id: EntityId,
        target_id: EntityId,
    },
    ModifyOwner {
        entity_id: EntityId,
        owner_id: Option<IdentityId>,
    },
    /// Editor batch. Operations run against the state left by every
    /// earlier related activity, so concurrent batches compose.
    EditAcl(Vec<AclOperation>),
    AddMembers {
        group_id: IdentityId,
        user_ids: Vec<IdentityId>,
        group_ids: Vec<IdentityId>,
        parent_group_ids: Vec<IdentityId>,
    },
    RemoveMembers {
        group_id: IdentityId,
        user_ids: Vec<IdentityId>,
        group_ids: Vec<IdentityId>,
        parent_group_ids: Vec<IdentityId>,
    },
    AddUserToGroups {
        user_id: IdentityId,
        group_ids: Vec<IdentityId>,
    },
    RemoveUserFromGroups {
        user_id: IdentityId,
        group_ids: Vec<IdentityId>,
    },
    DeleteGroup {
        group_id: IdentityId,
    },
    DeleteUser {
        user_id: IdentityId,
    },
}

impl MutationKind {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            MutationKind::CreateEntity { .. } => "CreateEntity",
            MutationKind::DeleteEntity { .. } => "DeleteEntity",
            MutationKind::MoveEntity { .. } => "MoveEntity",
            MutationKind::ModifyOwner { .. } => "ModifyOwner",
            MutationKind::EditAcl(_) => "EditAcl",
            MutationKind::AddMembers { .. } => "AddMembers",
            MutationKind::RemoveMembers { .. } => "RemoveMembers",
            MutationKind::AddUserToGroups { .. } => "AddUserToGroups",
            MutationKind::RemoveUserFromGroups { .. } => "RemoveUserFromGroups",
            MutationKind::DeleteGroup { .. } => "DeleteGroup",
            MutationKind::DeleteUser { .. } => "DeleteUser",
        }
    }

    fn affected_entities(&self) -> BTreeSet<EntityId> {
        match self {
            MutationKind::CreateEntity {
                entity_id,
                parent_id,
                ..
            } => std::iter::once(*entity_id).chain(*parent_id).collect(),
            MutationKind::DeleteEntity { entity_id } | MutationKind::ModifyOwner { entity_id, .. } => {
                BTreeSet::from([*entity_id])
            }
            MutationKind::MoveEntity {
                entity_id,
                target_id,
            } => BTreeSet::from([*entity_id, *target_id]),
            MutationKind::EditAcl(operations) => {
                operations.iter().map(AclOperation::entity_id).collect()
            }
            _ => BTreeSet::new(),
        }
    }

    fn affected_identities(&self) -> (BTreeSet<IdentityId>, BTreeSet<IdentityId>) {
        match self {
            MutationKind::AddMembers {
                group_id,
                user_ids,
                group_ids,
                parent_group_ids,
            }
            | MutationKind::RemoveMembers {
                group_id,
                user_ids,
                group_ids,
                parent_group_ids,
            } => (
                std::iter::once(*group_id)
                    .chain(group_ids.iter().copied())
                    .chain(parent_group_ids.iter().copied())
                    .collect(),
                user_ids.iter().copied().collect(),
            ),
            MutationKind::AddUserToGroups { user_id, group_ids }
            | MutationKind::RemoveUserFromGroups { user_id, group_ids } => (
                group_ids.iter().copied().collect(),
                BTreeSet::from([*user_id]),
            ),
            MutationKind::DeleteGroup { group_id } => {
                (BTreeSet::from([*group_id]), BTreeSet::new())
            }
            MutationKind::DeleteUser { user_id } => (BTreeSet::new(), BTreeSet::from([*user_id])),
            _ => (BTreeSet::new(), BTreeSet::new()),
        }
    }

    /// Whether the payload edits the membership graph (as opposed to the
    /// entity tree / ACL store)
    pub fn is_membership(&self) -> bool {
        matches!(
            self,
            MutationKind::AddMembers { .. }
                | MutationKind::RemoveMembers { .. }
                | MutationKind::AddUserToGroups { .. }
                | MutationKind::RemoveUserFromGroups { .. }
                | MutationKind::DeleteGroup { .. }
                | MutationKind::DeleteUser { .. }
        )
    }
}

/// Execution state recorded in the store's activity log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Logged, not yet started
    Wait,
    Executing,
    Done,
    /// Cancelled before execution; resolved without mutating anything
    Cancelled,
}

impl ExecutionState {
    /// Whether an activity in this state still has to be executed
    pub fn is_unprocessed(&self) -> bool {
        matches!(self, ExecutionState::Wait | ExecutionState::Executing)
    }
}

/// One sequenced, atomic mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub sequence_id: ActivityId,
    pub affected_entity_ids: BTreeSet<EntityId>,
    pub affected_group_ids: BTreeSet<IdentityId>,
    pub affected_user_ids: BTreeSet<IdentityId>,
    pub payload: MutationKind,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    /// Wrap a payload; the sequence id is assigned when the store logs it.
    pub fn new(payload: MutationKind) -> Self {
        let affected_entity_ids = payload.affected_entities();
        let (affected_group_ids, affected_user_ids) = payload.affected_identities();
        Self {
            sequence_id: 0,
            affected_entity_ids,
            affected_group_ids,
            affected_user_ids,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn with_sequence_id(mut self, sequence_id: ActivityId) -> Self {
        self.sequence_id = sequence_id;
        self
    }

    pub fn is_membership(&self) -> bool {
        self.payload.is_membership()
    }
}

/// Transport envelope: the activity plus the id of the instance that
/// produced it, so an instance can drop its own broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityMessage {
    pub origin: Uuid,
    pub activity: Activity,
}

impl ActivityMessage {
    pub fn new(origin: Uuid, activity: Activity) -> Self {
        Self { origin, activity }
    }

    /// Encode for the wire
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a wire payload
    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AceKey, EntryType};

    #[test]
    fn test_affected_ids_for_structural_payloads() {
        let create = Activity::new(MutationKind::CreateEntity {
            entity_id: 5,
            parent_id: Some(1),
            owner_id: Some(100),
        });
        assert_eq!(create.affected_entity_ids, BTreeSet::from([1, 5]));
        assert!(create.affected_group_ids.is_empty());
        assert!(!create.is_membership());

        let moved = Activity::new(MutationKind::MoveEntity {
            entity_id: 5,
            target_id: 9,
        });
        assert_eq!(moved.affected_entity_ids, BTreeSet::from([5, 9]));
    }

    #[test]
    fn test_affected_ids_for_membership_payloads() {
        let add = Activity::new(MutationKind::AddMembers {
            group_id: 10,
            user_ids: vec![1, 2],
            group_ids: vec![11],
            parent_group_ids: vec![12],
        });
        assert!(add.is_membership());
        assert_eq!(add.affected_group_ids, BTreeSet::from([10, 11, 12]));
        assert_eq!(add.affected_user_ids, BTreeSet::from([1, 2]));
        assert!(add.affected_entity_ids.is_empty());
    }

    #[test]
    fn test_message_codec() {
        let activity = Activity::new(MutationKind::EditAcl(vec![
            AclOperation::BreakInheritance {
                entity_id: 3,
                copy_types: vec![EntryType::Normal],
            },
            AclOperation::Modify {
                entity_id: 3,
                key: AceKey::new(8, EntryType::Normal, false),
                change: MaskChange::Allow(0b11),
            },
        ]))
        .with_sequence_id(17);

        let message = ActivityMessage::new(Uuid::new_v4(), activity);
        let bytes = message.encode().unwrap();
        let decoded = ActivityMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.activity.affected_entity_ids, BTreeSet::from([3]));
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let message = ActivityMessage::new(
            Uuid::new_v4(),
            Activity::new(MutationKind::DeleteEntity { entity_id: 1 }),
        );
        let bytes = message.encode().unwrap();
        assert!(ActivityMessage::decode(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = MutationKind::ModifyOwner {
            entity_id: 4,
            owner_id: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["ModifyOwner"]["entity_id"], 4);
        assert!(value["ModifyOwner"]["owner_id"].is_null());

        let back: MutationKind = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }
}
