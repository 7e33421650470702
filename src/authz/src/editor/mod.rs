//! Transactional ACL editor
//!
//! An [`AclEditor`] collects operations and commits them as one activity.
//! The activity carries the operations themselves. When it executes, after
//! every related earlier activity, they run in order against a private
//! overlay of the affected ACLs and the resulting final ACL states are
//! committed atomically, or the whole batch is rejected.

pub mod workspace;

pub use workspace::AclWorkspace;

use tracing::debug;
use treeacl_core::error::Result;
use treeacl_core::types::{
    AceKey, ActivityId, EntityId, EntryType, IdentityId, MutationKind, PermissionBitMask,
    PermissionType,
};

pub use treeacl_core::types::{AclOperation, MaskChange};

use crate::activity::ActivityEngine;

/// Builder for one atomic ACL batch.
///
/// Permission edits use the editor's entry type; structural operations
/// name their entry types explicitly.
pub struct AclEditor<'a> {
    engine: &'a ActivityEngine,
    entry_type: EntryType,
    operations: Vec<AclOperation>,
}

impl<'a> AclEditor<'a> {
    pub(crate) fn new(engine: &'a ActivityEngine, entry_type: EntryType) -> Self {
        Self {
            engine,
            entry_type,
            operations: Vec::new(),
        }
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    /// Operations collected so far
    pub fn operations(&self) -> &[AclOperation] {
        &self.operations
    }

    fn modify(mut self, entity_id: EntityId, identity_id: IdentityId, local_only: bool, change: MaskChange) -> Self {
        self.operations.push(AclOperation::Modify {
            entity_id,
            key: AceKey::new(identity_id, self.entry_type, local_only),
            change,
        });
        self
    }

    pub fn allow(self, entity_id: EntityId, identity_id: IdentityId, local_only: bool, permissions: &[PermissionType]) -> Self {
        let bits = PermissionType::mask_of(permissions);
        self.modify(entity_id, identity_id, local_only, MaskChange::Allow(bits))
    }

    pub fn deny(self, entity_id: EntityId, identity_id: IdentityId, local_only: bool, permissions: &[PermissionType]) -> Self {
        let bits = PermissionType::mask_of(permissions);
        self.modify(entity_id, identity_id, local_only, MaskChange::Deny(bits))
    }

    /// Replace both masks of the entry
    pub fn set(self, entity_id: EntityId, identity_id: IdentityId, local_only: bool, mask: PermissionBitMask) -> Self {
        self.modify(entity_id, identity_id, local_only, MaskChange::Set(mask))
    }

    /// Replace the allow mask with `permissions` and clear them from deny
    pub fn reset(self, entity_id: EntityId, identity_id: IdentityId, local_only: bool, permissions: &[PermissionType]) -> Self {
        let bits = PermissionType::mask_of(permissions);
        self.modify(entity_id, identity_id, local_only, MaskChange::Reset(bits))
    }

    pub fn clear_permission(self, entity_id: EntityId, identity_id: IdentityId, local_only: bool, permissions: &[PermissionType]) -> Self {
        let bits = PermissionType::mask_of(permissions);
        self.modify(entity_id, identity_id, local_only, MaskChange::Clear(bits))
    }

    /// Break inheritance, copying the effective entries of `copy_types`
    pub fn break_inheritance(mut self, entity_id: EntityId, copy_types: &[EntryType]) -> Self {
        self.operations.push(AclOperation::BreakInheritance {
            entity_id,
            copy_types: copy_types.to_vec(),
        });
        self
    }

    /// Break inheritance with an empty ACL
    pub fn break_inheritance_without_copy(self, entity_id: EntityId) -> Self {
        self.break_inheritance(entity_id, &[])
    }

    /// Restore inheritance, normalizing the entries of `normalize_types`
    pub fn unbreak_inheritance(mut self, entity_id: EntityId, normalize_types: &[EntryType]) -> Self {
        self.operations.push(AclOperation::UnbreakInheritance {
            entity_id,
            normalize_types: normalize_types.to_vec(),
        });
        self
    }

    /// Restore inheritance, keeping every explicit entry
    pub fn unbreak_inheritance_without_normalize(self, entity_id: EntityId) -> Self {
        self.unbreak_inheritance(entity_id, &[])
    }

    pub fn normalize_explicit_permissions(mut self, entity_id: EntityId, entry_types: &[EntryType]) -> Self {
        self.operations.push(AclOperation::NormalizeExplicitPermissions {
            entity_id,
            entry_types: entry_types.to_vec(),
        });
        self
    }

    pub fn copy_effective_permissions(mut self, entity_id: EntityId, entry_types: &[EntryType]) -> Self {
        self.operations.push(AclOperation::CopyEffectivePermissions {
            entity_id,
            entry_types: entry_types.to_vec(),
        });
        self
    }

    /// Commit the batch as one activity.
    ///
    /// The batch is checked against the current state first. Returns `None`
    /// when it would change nothing there.
    pub async fn apply(self) -> Result<Option<ActivityId>> {
        let changes = self.engine.cache().compute_acl_changes(&self.operations)?;
        if changes.is_empty() {
            debug!(operations = self.operations.len(), "ACL batch changes nothing");
            return Ok(None);
        }
        let id = self
            .engine
            .submit(MutationKind::EditAcl(self.operations))
            .await?;
        Ok(Some(id))
    }
}
