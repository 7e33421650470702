//! Permission evaluation
//!
//! Resolution walks from an entity's nearest ACL holder up to and including
//! the first inheritance break. Per identity and entry type the nearest
//! level that touches a bit decides it; across identities a deny on any
//! applicable identity overrides every allow.
//!
//! Evaluation is written against [`AclSource`] so the same code serves the
//! committed store and the ACL editor's uncommitted workspace.

pub mod effective;
pub mod subtree;

pub use effective::{AccessControlEntry, AccessControlList};
pub use subtree::BreakOptions;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use treeacl_core::types::{
    AceInfo, AceKey, AclInfo, EntityId, EntryType, IdentityId, PermissionBitMask, SecurityEntity,
    PERMISSION_COUNT,
};

use crate::entities::EntityStore;

/// Read access to entities and their stored ACLs
pub trait AclSource {
    fn entity(&self, id: EntityId) -> Option<&SecurityEntity>;

    /// Stored ACL of `id`, if it has one
    fn acl(&self, id: EntityId) -> Option<&AclInfo>;

    /// Nearest holder of `id` (inclusive)
    fn first_holder(&self, id: EntityId) -> Option<EntityId> {
        let mut current = self.entity(id);
        while let Some(entity) = current {
            if self.acl(entity.id).is_some_and(AclInfo::is_holder) {
                return Some(entity.id);
            }
            current = entity.parent_id.and_then(|p| self.entity(p));
        }
        None
    }
}

impl AclSource for EntityStore {
    fn entity(&self, id: EntityId) -> Option<&SecurityEntity> {
        self.get(id)
    }

    fn acl(&self, id: EntityId) -> Option<&AclInfo> {
        EntityStore::acl(self, id)
    }

    fn first_holder(&self, id: EntityId) -> Option<EntityId> {
        self.get(id).and_then(|e| e.first_acl_id)
    }
}

/// Holders contributing to `entity_id`, nearest first, ending at the first
/// break (inclusive)
pub fn acl_chain<S: AclSource + ?Sized>(source: &S, entity_id: EntityId) -> Vec<&AclInfo> {
    collect_chain(source, source.first_holder(entity_id))
}

/// Holders an entity would inherit from: empty at a break point, otherwise
/// the chain of its parent
pub fn inherited_chain<S: AclSource + ?Sized>(source: &S, entity_id: EntityId) -> Vec<&AclInfo> {
    if source.acl(entity_id).is_some_and(|acl| !acl.inherits) {
        return Vec::new();
    }
    let start = source
        .entity(entity_id)
        .and_then(|e| e.parent_id)
        .and_then(|p| source.first_holder(p));
    collect_chain(source, start)
}

fn collect_chain<S: AclSource + ?Sized>(source: &S, start: Option<EntityId>) -> Vec<&AclInfo> {
    let mut chain = Vec::new();
    let mut next = start;
    while let Some(holder) = next {
        let Some(acl) = source.acl(holder) else {
            break;
        };
        chain.push(acl);
        if !acl.inherits {
            break;
        }
        next = source
            .entity(holder)
            .and_then(|e| e.parent_id)
            .and_then(|p| source.first_holder(p));
    }
    chain
}

/// Entries of one level that apply to `target`
fn applicable<'a>(acl: &'a AclInfo, target: EntityId) -> impl Iterator<Item = &'a AceInfo> {
    acl.entries
        .iter()
        .filter(move |e| !e.local_only || acl.holder_entity_id == target)
}

/// Nearest-wins resolution of one accumulated mask: bits already decided by
/// a nearer level are ignored
#[derive(Debug, Clone, Copy, Default)]
struct NearestWins {
    decided: u64,
    mask: PermissionBitMask,
}

impl NearestWins {
    fn apply_level(&mut self, level: PermissionBitMask) {
        let fresh = level.touched() & !self.decided;
        self.mask.allow_bits |= level.allow_bits & fresh;
        self.mask.deny_bits |= level.deny_bits & fresh;
        self.decided |= fresh;
    }
}

/// Resolve the combined mask of `identities` on `target` over `chain`.
///
/// Each (identity, entry type) pair is resolved nearest-wins; the results
/// are OR-ed, so a bit is effectively allowed only when no pair denies it.
pub fn resolve_mask(
    chain: &[&AclInfo],
    target: EntityId,
    identities: &BTreeSet<IdentityId>,
) -> PermissionBitMask {
    let mut per_key: HashMap<(IdentityId, EntryType), NearestWins> = HashMap::new();

    for acl in chain {
        let mut level: HashMap<(IdentityId, EntryType), PermissionBitMask> = HashMap::new();
        for entry in applicable(acl, target).filter(|e| identities.contains(&e.identity_id)) {
            level
                .entry((entry.identity_id, entry.entry_type))
                .or_default()
                .combine(entry.mask());
        }
        for (key, mask) in level {
            per_key.entry(key).or_default().apply_level(mask);
        }
    }

    per_key
        .values()
        .fold(PermissionBitMask::EMPTY, |acc, state| acc | state.mask)
}

/// Nearest-wins value of a single entry key over `chain`, as seen by `target`
pub fn resolve_key(chain: &[&AclInfo], target: EntityId, key: &AceKey) -> PermissionBitMask {
    let mut state = NearestWins::default();
    for acl in chain {
        if key.local_only && acl.holder_entity_id != target {
            continue;
        }
        if let Some(entry) = acl.entry(key) {
            state.apply_level(entry.mask());
        }
    }
    state.mask
}

/// Effective view of every entry key active on `target`, with the entity
/// that decided each bit
pub fn effective_view(
    chain: &[&AclInfo],
    target: EntityId,
    entry_types: Option<&[EntryType]>,
) -> AccessControlList {
    let mut entries: BTreeMap<AceKey, AccessControlEntry> = BTreeMap::new();
    let mut decided: HashMap<AceKey, u64> = HashMap::new();

    for acl in chain {
        for entry in applicable(acl, target) {
            if entry_types.is_some_and(|types| !types.contains(&entry.entry_type)) {
                continue;
            }
            let key = entry.key();
            let done = decided.entry(key).or_default();
            let fresh = entry.mask().touched() & !*done;
            if fresh == 0 {
                continue;
            }
            *done |= fresh;

            let view = entries
                .entry(key)
                .or_insert_with(|| AccessControlEntry::new(key));
            for index in 0..PERMISSION_COUNT {
                let bit = 1u64 << index;
                if fresh & bit == 0 {
                    continue;
                }
                if entry.deny_bits & bit != 0 {
                    view.deny_bits |= bit;
                    view.deny_from.insert(index, acl.holder_entity_id);
                }
                if entry.allow_bits & bit != 0 {
                    view.allow_bits |= bit;
                    view.allow_from.insert(index, acl.holder_entity_id);
                }
            }
        }
    }

    let inherits = chain
        .first()
        .map(|acl| acl.holder_entity_id != target || acl.inherits)
        .unwrap_or(true);

    AccessControlList {
        entity_id: target,
        inherits,
        entries: entries.into_values().collect(),
    }
}
