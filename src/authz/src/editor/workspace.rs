//! Copy-on-write ACL overlay used to compute an editor batch

use std::collections::BTreeMap;
use tracing::debug;
use treeacl_core::error::{Result, SecurityError};
use treeacl_core::types::{
    AceInfo, AceKey, AclChangeSet, AclInfo, EntityId, EntryType, SecurityEntity, PERMISSION_COUNT,
};

use super::{AclOperation, MaskChange};
use crate::entities::EntityStore;
use crate::evaluator::{acl_chain, effective_view, inherited_chain, resolve_key, AclSource};

/// Pending ACL states layered over the committed store.
///
/// Readers of the store never see the overlay; it only becomes visible as
/// the change set committed by one activity.
pub struct AclWorkspace<'a> {
    store: &'a EntityStore,
    overlay: BTreeMap<EntityId, AclInfo>,
}

impl<'a> AclSource for AclWorkspace<'a> {
    fn entity(&self, id: EntityId) -> Option<&SecurityEntity> {
        self.store.get(id)
    }

    fn acl(&self, id: EntityId) -> Option<&AclInfo> {
        self.overlay.get(&id).or_else(|| self.store.acl(id))
    }
}

impl<'a> AclWorkspace<'a> {
    pub fn new(store: &'a EntityStore) -> Self {
        Self {
            store,
            overlay: BTreeMap::new(),
        }
    }

    /// Check every operation before any of them runs
    pub fn validate(&self, operations: &[AclOperation]) -> Result<()> {
        for op in operations {
            let entity_id = op.entity_id();
            if entity_id == 0 {
                return Err(SecurityError::InvalidArgument("entity id must not be 0".into()));
            }
            if !self.store.contains(entity_id) {
                return Err(SecurityError::EntityNotFound(entity_id));
            }
            if let AclOperation::Modify { key, .. } = op {
                if key.identity_id == 0 {
                    return Err(SecurityError::InvalidArgument(
                        "identity id must not be 0".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Run the operations in order against the overlay
    pub fn apply(&mut self, operations: &[AclOperation]) -> Result<()> {
        self.validate(operations)?;
        for op in operations {
            match op {
                AclOperation::Modify {
                    entity_id,
                    key,
                    change,
                } => self.modify(*entity_id, *key, *change),
                AclOperation::BreakInheritance {
                    entity_id,
                    copy_types,
                } => self.break_inheritance(*entity_id, copy_types),
                AclOperation::UnbreakInheritance {
                    entity_id,
                    normalize_types,
                } => self.unbreak_inheritance(*entity_id, normalize_types),
                AclOperation::NormalizeExplicitPermissions {
                    entity_id,
                    entry_types,
                } => self.normalize(*entity_id, entry_types),
                AclOperation::CopyEffectivePermissions {
                    entity_id,
                    entry_types,
                } => self.copy_effective(*entity_id, entry_types),
            }
        }
        Ok(())
    }

    fn acl_mut(&mut self, entity_id: EntityId) -> &mut AclInfo {
        let store = self.store;
        self.overlay.entry(entity_id).or_insert_with(|| {
            store.acl(entity_id).cloned().unwrap_or_else(|| {
                let inherits = store.get(entity_id).map_or(true, |e| e.is_inherited);
                AclInfo::new(entity_id, inherits)
            })
        })
    }

    fn inherits(&self, entity_id: EntityId) -> bool {
        match self.acl(entity_id) {
            Some(acl) => acl.inherits,
            None => self.store.get(entity_id).map_or(true, |e| e.is_inherited),
        }
    }

    fn modify(&mut self, entity_id: EntityId, key: AceKey, change: MaskChange) {
        let entry = self.acl_mut(entity_id).entry_mut(key);
        let mut mask = entry.mask();
        match change {
            MaskChange::Allow(bits) => mask.allow(bits),
            MaskChange::Deny(bits) => mask.deny(bits),
            MaskChange::Set(value) => mask = value,
            MaskChange::Reset(bits) => {
                mask.allow_bits = bits;
                mask.deny_bits &= !bits;
            }
            MaskChange::Clear(bits) => mask.clear(bits),
        }
        entry.set_mask(mask);
    }

    /// Effective entries of the given types as currently visible at `entity_id`
    fn effective_entries(&self, entity_id: EntityId, entry_types: &[EntryType]) -> Vec<AceInfo> {
        let chain = acl_chain(self, entity_id);
        effective_view(&chain, entity_id, Some(entry_types)).to_aces()
    }

    fn break_inheritance(&mut self, entity_id: EntityId, copy_types: &[EntryType]) {
        if !self.inherits(entity_id) {
            debug!(entity_id, "Already broken, break skipped");
            return;
        }
        let copied = self.effective_entries(entity_id, copy_types);
        let acl = self.acl_mut(entity_id);
        acl.inherits = false;
        for entry in copied {
            acl.upsert(entry);
        }
    }

    fn unbreak_inheritance(&mut self, entity_id: EntityId, normalize_types: &[EntryType]) {
        if self.inherits(entity_id) {
            debug!(entity_id, "Not broken, unbreak skipped");
            return;
        }
        self.acl_mut(entity_id).inherits = true;
        if !normalize_types.is_empty() {
            self.normalize(entity_id, normalize_types);
        }
    }

    /// Drop explicit bits whose value equals what inheritance already gives.
    ///
    /// Only inheritable entries are considered; a bit removed here resolves
    /// to the same value at the entity and, for descendants that reached it,
    /// to the same inherited value.
    fn normalize(&mut self, entity_id: EntityId, entry_types: &[EntryType]) {
        let Some(current) = self.acl(entity_id) else {
            return;
        };
        if !current.inherits {
            return;
        }

        let inherited = inherited_chain(self, entity_id);
        let mut updates = Vec::new();
        for entry in current
            .entries
            .iter()
            .filter(|e| !e.local_only && entry_types.contains(&e.entry_type))
        {
            let baseline = resolve_key(&inherited, entity_id, &entry.key());
            let own = entry.mask();
            let mut redundant = 0u64;
            for index in 0..PERMISSION_COUNT {
                let bit = 1u64 << index;
                if own.touched() & bit != 0 && own.value_of(index) == baseline.value_of(index) {
                    redundant |= bit;
                }
            }
            if redundant != 0 {
                updates.push((entry.key(), redundant));
            }
        }

        let acl = self.acl_mut(entity_id);
        for (key, redundant) in updates {
            let entry = acl.entry_mut(key);
            let mut mask = entry.mask();
            mask.clear(redundant);
            entry.set_mask(mask);
        }
    }

    fn copy_effective(&mut self, entity_id: EntityId, entry_types: &[EntryType]) {
        let copied = self.effective_entries(entity_id, entry_types);
        let acl = self.acl_mut(entity_id);
        for entry in copied {
            acl.upsert(entry);
        }
    }

    /// Diff the overlay against the store
    pub fn into_change_set(self) -> AclChangeSet {
        let mut changes = AclChangeSet::default();
        for (entity_id, mut acl) in self.overlay {
            acl.remove_empty_entries();
            let was_inherited = self.store.get(entity_id).map_or(true, |e| e.is_inherited);
            let stored = self.store.acl(entity_id);

            if was_inherited && !acl.inherits {
                changes.breaks.push(entity_id);
            } else if !was_inherited && acl.inherits {
                changes.unbreaks.push(entity_id);
            }

            if acl.is_removable() {
                if stored.is_some() {
                    changes.removed_acls.push(entity_id);
                }
            } else if stored != Some(&acl) {
                changes.acls.push(acl);
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::AclOperation;
    use treeacl_core::types::PermissionBitMask;

    const G1: u64 = 10;

    fn key(identity: u64) -> AceKey {
        AceKey::new(identity, EntryType::Normal, false)
    }

    fn tree() -> EntityStore {
        let mut store = EntityStore::new();
        store.create_entity(1, None, None).unwrap();
        store.create_entity(2, Some(1), None).unwrap();
        store.create_entity(3, Some(2), None).unwrap();
        store
    }

    fn run(store: &EntityStore, ops: &[AclOperation]) -> AclChangeSet {
        let mut workspace = AclWorkspace::new(store);
        workspace.apply(ops).unwrap();
        workspace.into_change_set()
    }

    #[test]
    fn test_allow_then_clear_produces_no_acl() {
        let store = tree();
        let changes = run(
            &store,
            &[
                AclOperation::Modify { entity_id: 2, key: key(G1), change: MaskChange::Allow(0b1) },
                AclOperation::Modify { entity_id: 2, key: key(G1), change: MaskChange::Clear(0b1) },
            ],
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn test_reset_replaces_allow_and_clears_deny() {
        let mut store = tree();
        store
            .apply_acl_changes(&run(
                &store.clone(),
                &[AclOperation::Modify {
                    entity_id: 1,
                    key: key(G1),
                    change: MaskChange::Set(PermissionBitMask::new(0b0011, 0b1100)),
                }],
            ))
            .unwrap();

        let changes = run(
            &store,
            &[AclOperation::Modify { entity_id: 1, key: key(G1), change: MaskChange::Reset(0b0100) }],
        );
        let entry = changes.acls[0].entry(&key(G1)).unwrap();
        assert_eq!((entry.allow_bits, entry.deny_bits), (0b0100, 0b1000));
    }

    #[test]
    fn test_break_with_copy_seeds_effective_entries() {
        let mut store = tree();
        store
            .apply_acl_changes(&run(
                &store.clone(),
                &[AclOperation::Modify { entity_id: 1, key: key(G1), change: MaskChange::Allow(0b11) }],
            ))
            .unwrap();

        let changes = run(
            &store,
            &[AclOperation::BreakInheritance { entity_id: 3, copy_types: vec![EntryType::Normal] }],
        );
        assert_eq!(changes.breaks, vec![3]);
        let acl = &changes.acls[0];
        assert!(!acl.inherits);
        assert_eq!(acl.entry(&key(G1)).unwrap().allow_bits, 0b11);
    }

    #[test]
    fn test_normalize_drops_redundant_bits_only() {
        let mut store = tree();
        store
            .apply_acl_changes(&run(
                &store.clone(),
                &[
                    AclOperation::Modify { entity_id: 1, key: key(G1), change: MaskChange::Allow(0b01) },
                    AclOperation::Modify { entity_id: 2, key: key(G1), change: MaskChange::Allow(0b11) },
                ],
            ))
            .unwrap();

        let changes = run(
            &store,
            &[AclOperation::NormalizeExplicitPermissions { entity_id: 2, entry_types: vec![EntryType::Normal] }],
        );
        assert_eq!(changes.acls.len(), 1);
        assert_eq!(changes.acls[0].entry(&key(G1)).unwrap().allow_bits, 0b10);
    }

    #[test]
    fn test_unknown_entity_rejects_batch() {
        let store = tree();
        let mut workspace = AclWorkspace::new(&store);
        let result = workspace.apply(&[
            AclOperation::Modify { entity_id: 2, key: key(G1), change: MaskChange::Allow(1) },
            AclOperation::Modify { entity_id: 42, key: key(G1), change: MaskChange::Allow(1) },
        ]);
        assert!(matches!(result, Err(SecurityError::EntityNotFound(42))));
    }
}
