//! Shared authorization cache
//!
//! [`SecurityCache`] owns the entity store and the membership graph behind
//! reader-writer locks. Reads (permission checks, queries) share the locks.
//! A writer plans its change under an upgradable read, which readers can
//! still share, and upgrades to the write lock only to install the planned
//! values. Readers never observe a half-applied activity.

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};
use treeacl_core::error::{Result, SecurityError};
use treeacl_core::traits::{DataProvider, MissingEntityResolver};
use treeacl_core::types::{
    AceInfo, AclChangeSet, AclInfo, EntityId, EntryType, IdentityId, MutationKind,
    PermissionBitMask, PermissionType, PermissionTypeRegistry, SecurityEntity,
};

use crate::config::SecurityConfig;
use crate::editor::{AclOperation, AclWorkspace};
use crate::entities::{EntityStore, StorePatch};
use crate::evaluator::subtree::{subtree_allows, OwnerRule};
use crate::evaluator::{acl_chain, effective_view, resolve_mask, AccessControlList, BreakOptions};
use crate::membership::{MembershipGraph, MembershipPatch};
use crate::query::SecurityQuery;

/// The subject of a permission check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: IdentityId,
    /// Context-computed groups, valid for this check only
    #[serde(default)]
    pub dynamic_groups: Vec<IdentityId>,
}

impl Principal {
    pub fn new(user_id: IdentityId) -> Self {
        Self {
            user_id,
            dynamic_groups: Vec::new(),
        }
    }

    pub fn with_dynamic_groups(mut self, groups: impl IntoIterator<Item = IdentityId>) -> Self {
        self.dynamic_groups.extend(groups);
        self
    }
}

/// In-memory entity tree, ACLs and membership of one process
pub struct SecurityCache {
    config: SecurityConfig,
    registry: PermissionTypeRegistry,
    entities: RwLock<EntityStore>,
    membership: RwLock<MembershipGraph>,
    resolver: Option<Arc<dyn MissingEntityResolver>>,
}

impl SecurityCache {
    pub fn new(config: SecurityConfig) -> Result<Self> {
        config.validate()?;
        let registry = config.registry()?;
        Ok(Self {
            config,
            registry,
            entities: RwLock::new(EntityStore::new()),
            membership: RwLock::new(MembershipGraph::new()),
            resolver: None,
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn MissingEntityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replace the whole cache content with the provider's data
    pub async fn load(&self, data: &dyn DataProvider) -> Result<()> {
        let entities = data.load_entities().await?;
        let aces = data.load_all_aces().await?;
        let groups = data.load_all_groups().await?;

        let store = EntityStore::load(entities, aces);
        let graph = MembershipGraph::load(groups);
        info!(
            entities = store.len(),
            groups = graph.group_count(),
            "Security cache loaded"
        );
        *self.entities.write() = store;
        *self.membership.write() = graph;
        Ok(())
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn registry(&self) -> &PermissionTypeRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Entity lookups
    // ------------------------------------------------------------------

    /// Make sure every id is present, asking the resolver for missing ones
    fn ensure_entities(&self, ids: impl IntoIterator<Item = EntityId>) {
        let Some(resolver) = self.resolver.as_deref() else {
            return;
        };
        let missing: Vec<EntityId> = {
            let store = self.entities.read();
            ids.into_iter()
                .filter(|id| *id != 0 && !store.contains(*id))
                .collect()
        };
        // one at a time: chains of different ids may share missing ancestors
        for id in missing {
            let store = self.entities.upgradable_read();
            if store.contains(id) {
                continue;
            }
            let patch = store.plan_materialize(id, resolver);
            if let Some(patch) = patch {
                RwLockUpgradableReadGuard::upgrade(store).commit(patch);
            }
        }
    }

    fn read_entity(&self, entity_id: EntityId) -> Result<RwLockReadGuard<'_, EntityStore>> {
        if entity_id == 0 {
            return Err(SecurityError::InvalidArgument("entity id must not be 0".into()));
        }
        self.ensure_entities([entity_id]);
        let store = self.entities.read();
        if !store.contains(entity_id) {
            return Err(SecurityError::EntityNotFound(entity_id));
        }
        Ok(store)
    }

    pub fn get_entity(&self, entity_id: EntityId) -> Option<SecurityEntity> {
        self.ensure_entities([entity_id]);
        self.entities.read().get(entity_id).cloned()
    }

    pub fn is_entity_inherited(&self, entity_id: EntityId) -> Result<bool> {
        let store = self.read_entity(entity_id)?;
        Ok(store.get(entity_id).map_or(true, |e| e.is_inherited))
    }

    /// Read-only traversal over a consistent snapshot
    pub fn query(&self) -> SecurityQuery<'_> {
        SecurityQuery::new(self.entities.read())
    }

    // ------------------------------------------------------------------
    // ACL queries
    // ------------------------------------------------------------------

    /// Raw stored ACL, `None` when the entity holds none
    pub fn get_acl_info(&self, entity_id: EntityId) -> Result<Option<AclInfo>> {
        let store = self.read_entity(entity_id)?;
        Ok(store.acl(entity_id).cloned())
    }

    /// Entries stored on the entity itself
    pub fn get_explicit_entries(&self, entity_id: EntityId) -> Result<Vec<AceInfo>> {
        Ok(self
            .get_acl_info(entity_id)?
            .map(|acl| acl.entries)
            .unwrap_or_default())
    }

    /// Coalesced effective ACL with per-bit origins
    pub fn get_acl(&self, entity_id: EntityId) -> Result<AccessControlList> {
        let store = self.read_entity(entity_id)?;
        let chain = acl_chain(&*store, entity_id);
        let mut view = effective_view(&chain, entity_id, None);
        view.inherits = store.get(entity_id).map_or(true, |e| e.is_inherited);
        Ok(view)
    }

    /// Effective entries, optionally restricted to some entry types
    pub fn get_effective_entries(&self, entity_id: EntityId, entry_types: Option<&[EntryType]>) -> Result<Vec<AceInfo>> {
        let store = self.read_entity(entity_id)?;
        let chain = acl_chain(&*store, entity_id);
        Ok(effective_view(&chain, entity_id, entry_types).to_aces())
    }

    // ------------------------------------------------------------------
    // Identity-list evaluation
    // ------------------------------------------------------------------

    fn closure_of(&self, identities: &[IdentityId]) -> BTreeSet<IdentityId> {
        self.membership.read().closure(identities)
    }

    fn requested_bits(permissions: &[PermissionType]) -> Result<u64> {
        let bits = PermissionType::mask_of(permissions);
        if bits == 0 {
            return Err(SecurityError::InvalidArgument(
                "at least one permission must be requested".into(),
            ));
        }
        Ok(bits)
    }

    /// Resolved mask of the identities (and their group closure) on the entity
    pub fn get_permission_mask(&self, entity_id: EntityId, identities: &[IdentityId]) -> Result<PermissionBitMask> {
        let closure = self.closure_of(identities);
        self.mask_for(entity_id, &closure)
    }

    fn mask_for(&self, entity_id: EntityId, identities: &BTreeSet<IdentityId>) -> Result<PermissionBitMask> {
        let store = self.read_entity(entity_id)?;
        let chain = acl_chain(&*store, entity_id);
        Ok(resolve_mask(&chain, entity_id, identities))
    }

    pub fn has_permission(&self, entity_id: EntityId, identities: &[IdentityId], permissions: &[PermissionType]) -> Result<bool> {
        let bits = Self::requested_bits(permissions)?;
        let mask = self.get_permission_mask(entity_id, identities)?;
        Ok(mask.effective_allow() & bits == bits)
    }

    pub fn assert_permission(&self, entity_id: EntityId, identities: &[IdentityId], permissions: &[PermissionType]) -> Result<()> {
        let bits = Self::requested_bits(permissions)?;
        let mask = self.get_permission_mask(entity_id, identities)?;
        self.deny_missing(entity_id, bits, mask)
    }

    pub fn has_subtree_permission(
        &self,
        entity_id: EntityId,
        identities: &[IdentityId],
        permissions: &[PermissionType],
        options: BreakOptions,
    ) -> Result<bool> {
        let bits = Self::requested_bits(permissions)?;
        let closure = self.closure_of(identities);
        let store = self.read_entity(entity_id)?;
        Ok(subtree_allows(&store, entity_id, &closure, None, bits, options))
    }

    pub fn assert_subtree_permission(
        &self,
        entity_id: EntityId,
        identities: &[IdentityId],
        permissions: &[PermissionType],
        options: BreakOptions,
    ) -> Result<()> {
        if self.has_subtree_permission(entity_id, identities, permissions, options)? {
            Ok(())
        } else {
            Err(self.access_denied(entity_id, PermissionType::mask_of(permissions)))
        }
    }

    fn deny_missing(&self, entity_id: EntityId, bits: u64, mask: PermissionBitMask) -> Result<()> {
        let missing = bits & !mask.effective_allow();
        if missing == 0 {
            Ok(())
        } else {
            Err(self.access_denied(entity_id, missing))
        }
    }

    fn access_denied(&self, entity_id: EntityId, bits: u64) -> SecurityError {
        SecurityError::AccessDenied {
            entity_id,
            permissions: self.registry.names_of(bits),
        }
    }

    // ------------------------------------------------------------------
    // Principal evaluation
    // ------------------------------------------------------------------

    fn is_system(&self, principal: &Principal) -> bool {
        self.config.system_user_id == Some(principal.user_id)
    }

    /// User, flattened groups, dynamic groups with their containers, and the
    /// everyone group
    fn principal_identities(&self, principal: &Principal) -> BTreeSet<IdentityId> {
        let mut seeds = Vec::with_capacity(principal.dynamic_groups.len() + 2);
        seeds.push(principal.user_id);
        seeds.extend(principal.dynamic_groups.iter().copied());
        seeds.extend(self.config.everyone_group_id);
        self.closure_of(&seeds)
    }

    fn owner_rule(&self, principal: &Principal) -> Option<OwnerRule> {
        self.config.owner_group_id.map(|owner_group_id| OwnerRule {
            user_id: principal.user_id,
            owner_group_id,
        })
    }

    pub fn get_permission_mask_for(&self, principal: &Principal, entity_id: EntityId) -> Result<PermissionBitMask> {
        let mut identities = self.principal_identities(principal);
        if let Some(rule) = self.owner_rule(principal) {
            let owns = self
                .get_entity(entity_id)
                .is_some_and(|e| e.owner_id == Some(rule.user_id));
            if owns {
                identities.insert(rule.owner_group_id);
            }
        }
        self.mask_for(entity_id, &identities)
    }

    pub fn has_permission_for(&self, principal: &Principal, entity_id: EntityId, permissions: &[PermissionType]) -> Result<bool> {
        let bits = Self::requested_bits(permissions)?;
        if self.is_system(principal) {
            return Ok(true);
        }
        let mask = self.get_permission_mask_for(principal, entity_id)?;
        Ok(mask.effective_allow() & bits == bits)
    }

    pub fn assert_permission_for(&self, principal: &Principal, entity_id: EntityId, permissions: &[PermissionType]) -> Result<()> {
        let bits = Self::requested_bits(permissions)?;
        if self.is_system(principal) {
            return Ok(());
        }
        let mask = self.get_permission_mask_for(principal, entity_id)?;
        self.deny_missing(entity_id, bits, mask)
    }

    pub fn has_subtree_permission_for(
        &self,
        principal: &Principal,
        entity_id: EntityId,
        permissions: &[PermissionType],
        options: BreakOptions,
    ) -> Result<bool> {
        let bits = Self::requested_bits(permissions)?;
        if self.is_system(principal) {
            return Ok(true);
        }
        let identities = self.principal_identities(principal);
        let store = self.read_entity(entity_id)?;
        Ok(subtree_allows(
            &store,
            entity_id,
            &identities,
            self.owner_rule(principal),
            bits,
            options,
        ))
    }

    pub fn assert_subtree_permission_for(
        &self,
        principal: &Principal,
        entity_id: EntityId,
        permissions: &[PermissionType],
        options: BreakOptions,
    ) -> Result<()> {
        if self.has_subtree_permission_for(principal, entity_id, permissions, options)? {
            Ok(())
        } else {
            Err(self.access_denied(entity_id, PermissionType::mask_of(permissions)))
        }
    }

    // ------------------------------------------------------------------
    // Membership queries
    // ------------------------------------------------------------------

    pub fn is_in_group(&self, member: IdentityId, group_id: IdentityId) -> bool {
        self.membership.read().is_in_group(member, group_id)
    }

    pub fn get_flattened_groups(&self, user_id: IdentityId) -> BTreeSet<IdentityId> {
        self.membership.read().flattened_groups(user_id)
    }

    pub fn get_parent_groups(&self, identity: IdentityId) -> BTreeSet<IdentityId> {
        self.membership.read().parent_groups(identity)
    }

    // ------------------------------------------------------------------
    // Mutation support
    // ------------------------------------------------------------------

    /// Final ACL states an editor batch would commit
    pub fn compute_acl_changes(&self, operations: &[AclOperation]) -> Result<AclChangeSet> {
        self.ensure_entities(operations.iter().map(AclOperation::entity_id));
        let store = self.entities.read();
        let mut workspace = AclWorkspace::new(&store);
        workspace.apply(operations)?;
        Ok(workspace.into_change_set())
    }

    /// Check a mutation against the current state without changing anything
    pub fn validate(&self, payload: &MutationKind) -> Result<()> {
        match payload {
            MutationKind::CreateEntity {
                entity_id,
                parent_id,
                ..
            } => {
                self.ensure_entities(parent_id.iter().copied());
                self.entities.read().check_create(*entity_id, *parent_id)
            }
            MutationKind::DeleteEntity { entity_id } => {
                if *entity_id == 0 {
                    return Err(SecurityError::InvalidArgument("entity id must not be 0".into()));
                }
                Ok(())
            }
            MutationKind::MoveEntity {
                entity_id,
                target_id,
            } => {
                self.ensure_entities([*entity_id, *target_id]);
                self.entities.read().check_move(*entity_id, *target_id)
            }
            MutationKind::ModifyOwner { entity_id, .. } => {
                self.read_entity(*entity_id).map(|_| ())
            }
            MutationKind::EditAcl(operations) => {
                let changes = self.compute_acl_changes(operations)?;
                self.entities.read().check_acl_changes(&changes)
            }
            MutationKind::AddMembers { .. }
            | MutationKind::RemoveMembers { .. }
            | MutationKind::AddUserToGroups { .. }
            | MutationKind::RemoveUserFromGroups { .. }
            | MutationKind::DeleteGroup { .. }
            | MutationKind::DeleteUser { .. } => {
                // planned against an empty graph, which checks ids only
                plan_membership(&MembershipGraph::new(), payload).map(|_| ())
            }
        }
    }

    /// Resolve a mutation against the current state.
    ///
    /// Editor batches become the change set their operations produce now;
    /// call this only once every earlier related activity has been applied.
    pub fn prepare<'a>(&self, payload: &'a MutationKind) -> Result<PreparedMutation<'a>> {
        match payload {
            MutationKind::EditAcl(operations) => {
                Ok(PreparedMutation::Acl(self.compute_acl_changes(operations)?))
            }
            other => Ok(PreparedMutation::Direct(other)),
        }
    }

    /// Install a prepared mutation in memory
    pub fn commit(&self, mutation: &PreparedMutation<'_>) -> Result<()> {
        let payload = match mutation {
            PreparedMutation::Acl(changes) => {
                debug!(entities = changes.entity_ids().len(), "Applying ACL changes to cache");
                self.ensure_entities(changes.entity_ids());
                return self.commit_entities(|store| store.plan_acl_changes(changes));
            }
            PreparedMutation::Direct(payload) => *payload,
        };

        debug!(kind = payload.name(), "Applying mutation to cache");
        match payload {
            MutationKind::CreateEntity {
                entity_id,
                parent_id,
                owner_id,
            } => {
                self.ensure_entities(parent_id.iter().copied());
                self.commit_entities(|store| store.plan_create_entity(*entity_id, *parent_id, *owner_id))
            }
            MutationKind::DeleteEntity { entity_id } => {
                self.commit_entities(|store| Ok(store.plan_delete_entity(*entity_id)))
            }
            MutationKind::MoveEntity {
                entity_id,
                target_id,
            } => {
                self.ensure_entities([*entity_id, *target_id]);
                self.commit_entities(|store| store.plan_move_entity(*entity_id, *target_id))
            }
            MutationKind::ModifyOwner {
                entity_id,
                owner_id,
            } => {
                self.ensure_entities([*entity_id]);
                self.commit_entities(|store| store.plan_modify_owner(*entity_id, *owner_id))
            }
            MutationKind::EditAcl(_) => Err(SecurityError::Internal(
                "editor batch committed without being prepared".into(),
            )),
            _ => {
                let graph = self.membership.upgradable_read();
                let patch = plan_membership(&graph, payload)?;
                RwLockUpgradableReadGuard::upgrade(graph).commit(patch);
                Ok(())
            }
        }
    }

    /// Prepare and commit in one step
    pub fn apply(&self, payload: &MutationKind) -> Result<()> {
        let prepared = self.prepare(payload)?;
        self.commit(&prepared)
    }

    /// Plan under an upgradable read, then take the write lock to install
    fn commit_entities(&self, plan: impl FnOnce(&EntityStore) -> Result<StorePatch>) -> Result<()> {
        let store = self.entities.upgradable_read();
        let patch = plan(&*store)?;
        if patch.is_empty() {
            return Ok(());
        }
        RwLockUpgradableReadGuard::upgrade(store).commit(patch);
        Ok(())
    }

    /// Snapshot of the entity store, used by the activity engine to relate
    /// affected ids
    pub(crate) fn entities(&self) -> RwLockReadGuard<'_, EntityStore> {
        self.entities.read()
    }

    /// Check every structural invariant of the entity store
    pub fn validate_invariants(&self) -> Result<()> {
        self.entities.read().validate()
    }
}

/// A mutation resolved against the state it will be applied to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedMutation<'a> {
    /// Final ACL states of an editor batch
    Acl(AclChangeSet),
    /// Payloads applied as they are
    Direct(&'a MutationKind),
}

fn plan_membership(graph: &MembershipGraph, payload: &MutationKind) -> Result<MembershipPatch> {
    match payload {
        MutationKind::AddMembers {
            group_id,
            user_ids,
            group_ids,
            parent_group_ids,
        } => graph.plan_add_members(*group_id, user_ids, group_ids, parent_group_ids),
        MutationKind::RemoveMembers {
            group_id,
            user_ids,
            group_ids,
            parent_group_ids,
        } => graph.plan_remove_members(*group_id, user_ids, group_ids, parent_group_ids),
        MutationKind::AddUserToGroups { user_id, group_ids } => {
            graph.plan_add_user_to_groups(*user_id, group_ids)
        }
        MutationKind::RemoveUserFromGroups { user_id, group_ids } => {
            graph.plan_remove_user_from_groups(*user_id, group_ids)
        }
        MutationKind::DeleteGroup { group_id } => graph.plan_delete_group(*group_id),
        MutationKind::DeleteUser { user_id } => graph.plan_delete_user(*user_id),
        other => Err(SecurityError::Internal(format!(
            "{} is not a membership mutation",
            other.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treeacl_core::traits::ResolvedEntity;

    const SEE: PermissionType = PermissionType::new(0, "See");
    const OPEN: PermissionType = PermissionType::new(2, "Open");

    fn cache() -> SecurityCache {
        let config = SecurityConfig::default()
            .with_permissions([SEE, OPEN])
            .with_system_user(1)
            .with_everyone_group(8)
            .with_owner_group(9);
        let cache = SecurityCache::new(config).unwrap();
        for payload in [
            MutationKind::CreateEntity { entity_id: 1, parent_id: None, owner_id: Some(500) },
            MutationKind::CreateEntity { entity_id: 2, parent_id: Some(1), owner_id: None },
        ] {
            cache.apply(&payload).unwrap();
        }
        cache
    }

    fn allow(cache: &SecurityCache, entity_id: EntityId, identity: IdentityId, bits: u64) {
        cache
            .apply(&MutationKind::EditAcl(vec![AclOperation::Modify {
                entity_id,
                key: treeacl_core::types::AceKey::new(identity, EntryType::Normal, false),
                change: crate::editor::MaskChange::Allow(bits),
            }]))
            .unwrap();
    }

    #[test]
    fn test_empty_request_is_invalid() {
        let cache = cache();
        assert!(matches!(
            cache.has_permission(1, &[10], &[]),
            Err(SecurityError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unknown_entity_is_reported() {
        let cache = cache();
        assert!(matches!(
            cache.has_permission(77, &[10], &[SEE]),
            Err(SecurityError::EntityNotFound(77))
        ));
    }

    #[test]
    fn test_assert_lists_missing_permissions() {
        let cache = cache();
        allow(&cache, 1, 10, SEE.mask());
        let err = cache.assert_permission(2, &[10], &[SEE, OPEN]).unwrap_err();
        match err {
            SecurityError::AccessDenied { entity_id, permissions } => {
                assert_eq!(entity_id, 2);
                assert_eq!(permissions, vec!["Open".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_system_everyone_and_owner() {
        let cache = cache();
        allow(&cache, 1, 8, SEE.mask());
        allow(&cache, 1, 9, OPEN.mask());

        let stranger = Principal::new(600);
        assert!(cache.has_permission_for(&stranger, 2, &[SEE]).unwrap());
        assert!(!cache.has_permission_for(&stranger, 1, &[OPEN]).unwrap());

        let owner = Principal::new(500);
        assert!(cache.has_permission_for(&owner, 1, &[OPEN]).unwrap());
        assert!(!cache.has_permission_for(&owner, 2, &[OPEN]).unwrap());

        assert!(cache.has_permission_for(&Principal::new(1), 2, &[OPEN]).unwrap());
    }

    #[test]
    fn test_dynamic_groups_reach_static_containers() {
        let cache = cache();
        cache
            .apply(&MutationKind::AddMembers {
                group_id: 20,
                user_ids: vec![],
                group_ids: vec![21],
                parent_group_ids: vec![],
            })
            .unwrap();
        allow(&cache, 1, 20, OPEN.mask());

        let plain = Principal::new(600);
        assert!(!cache.has_permission_for(&plain, 2, &[OPEN]).unwrap());
        let dynamic = Principal::new(600).with_dynamic_groups([21]);
        assert!(cache.has_permission_for(&dynamic, 2, &[OPEN]).unwrap());
    }

    #[test]
    fn test_prepared_batch_reflects_state_at_prepare_time() {
        let cache = cache();
        let batch = MutationKind::EditAcl(vec![AclOperation::Modify {
            entity_id: 2,
            key: treeacl_core::types::AceKey::new(11, EntryType::Normal, false),
            change: crate::editor::MaskChange::Allow(OPEN.mask()),
        }]);
        allow(&cache, 2, 10, SEE.mask());

        let prepared = cache.prepare(&batch).unwrap();
        let PreparedMutation::Acl(changes) = &prepared else {
            panic!("editor batch must prepare into a change set");
        };
        assert_eq!(changes.acls.len(), 1);
        assert_eq!(changes.acls[0].entries.len(), 2);

        cache.commit(&prepared).unwrap();
        assert!(cache.has_permission(2, &[10], &[SEE]).unwrap());
        assert!(cache.has_permission(2, &[11], &[OPEN]).unwrap());
    }

    #[test]
    fn test_unprepared_batch_is_not_committed() {
        let cache = cache();
        let batch = MutationKind::EditAcl(vec![]);
        assert!(matches!(
            cache.commit(&PreparedMutation::Direct(&batch)),
            Err(SecurityError::Internal(_))
        ));
    }

    struct Resolver;

    impl MissingEntityResolver for Resolver {
        fn resolve(&self, entity_id: EntityId) -> Option<ResolvedEntity> {
            (entity_id == 30).then_some(ResolvedEntity { parent_id: Some(1), owner_id: None })
        }
    }

    #[test]
    fn test_resolver_materializes_on_lookup() {
        let cache = cache().with_resolver(Arc::new(Resolver));
        allow(&cache, 1, 10, SEE.mask());
        assert!(cache.has_permission(30, &[10], &[SEE]).unwrap());
        assert_eq!(cache.get_entity(30).unwrap().parent_id, Some(1));
    }
}
