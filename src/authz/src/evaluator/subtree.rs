//! Subtree permission checks and traversal options

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::ops::BitOr;
use treeacl_core::types::{EntityId, IdentityId};

use super::{acl_chain, resolve_mask};
use crate::entities::EntityStore;

/// Controls where tree traversals stop at inheritance breaks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BreakOptions(u8);

impl BreakOptions {
    /// Visit everything
    pub const DEFAULT: BreakOptions = BreakOptions(0);
    /// Ancestor walks stop at the first break point (inclusive)
    pub const STOP_AT_PARENT_BREAK: BreakOptions = BreakOptions(1);
    /// Descendant walks skip broken descendants together with their subtree
    pub const STOP_AT_SUBTREE_BREAKS: BreakOptions = BreakOptions(2);

    pub fn contains(self, other: BreakOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BreakOptions {
    type Output = BreakOptions;

    fn bitor(self, rhs: BreakOptions) -> BreakOptions {
        BreakOptions(self.0 | rhs.0)
    }
}

/// Owner pseudo-group membership applied per visited entity
#[derive(Debug, Clone, Copy)]
pub struct OwnerRule {
    pub user_id: IdentityId,
    pub owner_group_id: IdentityId,
}

/// `true` when every requested bit is allowed on `root` and on every
/// visited descendant.
///
/// Results are memoized by nearest holder: entities sharing a holder (and
/// not being it themselves, which would expose local-only entries) resolve
/// identically.
pub fn subtree_allows(
    store: &EntityStore,
    root: EntityId,
    identities: &BTreeSet<IdentityId>,
    owner: Option<OwnerRule>,
    bits: u64,
    options: BreakOptions,
) -> bool {
    let mut with_owner: Option<BTreeSet<IdentityId>> = None;
    let mut memo: HashMap<(Option<EntityId>, bool, bool), bool> = HashMap::new();
    let mut stack = vec![root];

    while let Some(current) = stack.pop() {
        let Some(entity) = store.get(current) else {
            continue;
        };

        let is_owner = match (owner, entity.owner_id) {
            (Some(rule), Some(owner_id)) => rule.user_id == owner_id,
            _ => false,
        };
        let is_holder = entity.first_acl_id == Some(entity.id);
        let key = (entity.first_acl_id, is_holder, is_owner);

        let allowed = match memo.get(&key) {
            Some(allowed) if !is_holder => *allowed,
            _ => {
                let effective: &BTreeSet<IdentityId> = if is_owner {
                    with_owner.get_or_insert_with(|| {
                        let mut set = identities.clone();
                        if let Some(rule) = owner {
                            set.insert(rule.owner_group_id);
                        }
                        set
                    })
                } else {
                    identities
                };
                let chain = acl_chain(store, current);
                let allowed = resolve_mask(&chain, current, effective).effective_allow() & bits == bits;
                memo.insert(key, allowed);
                allowed
            }
        };
        if !allowed {
            return false;
        }

        for &child in store.children(current) {
            let skip = options.contains(BreakOptions::STOP_AT_SUBTREE_BREAKS)
                && store.get(child).is_some_and(|c| !c.is_inherited);
            if !skip {
                stack.push(child);
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use treeacl_core::types::{AceKey, AclChangeSet, AclInfo, EntryType};

    const G1: IdentityId = 10;

    fn store() -> EntityStore {
        // 1 -> 2 -> 3, 2 is broken and empty
        let mut store = EntityStore::new();
        store.create_entity(1, None, None).unwrap();
        store.create_entity(2, Some(1), Some(500)).unwrap();
        store.create_entity(3, Some(2), None).unwrap();
        let mut top = AclInfo::new(1, true);
        top.entry_mut(AceKey::new(G1, EntryType::Normal, false)).allow_bits = 1;
        store
            .apply_acl_changes(&AclChangeSet {
                acls: vec![top, AclInfo::new(2, false)],
                ..Default::default()
            })
            .unwrap();
        store
    }

    #[test]
    fn test_options_compose() {
        let both = BreakOptions::STOP_AT_PARENT_BREAK | BreakOptions::STOP_AT_SUBTREE_BREAKS;
        assert!(both.contains(BreakOptions::STOP_AT_SUBTREE_BREAKS));
        assert!(!BreakOptions::DEFAULT.contains(BreakOptions::STOP_AT_PARENT_BREAK));
    }

    #[test]
    fn test_break_modes_differ() {
        let store = store();
        let ids = BTreeSet::from([G1]);
        assert!(!subtree_allows(&store, 1, &ids, None, 1, BreakOptions::DEFAULT));
        assert!(subtree_allows(&store, 1, &ids, None, 1, BreakOptions::STOP_AT_SUBTREE_BREAKS));
    }

    #[test]
    fn test_leaf_subtree_equals_entity_check() {
        let store = store();
        let ids = BTreeSet::from([G1]);
        assert!(!subtree_allows(&store, 3, &ids, None, 1, BreakOptions::DEFAULT));
        assert!(!subtree_allows(&store, 3, &ids, None, 1, BreakOptions::STOP_AT_SUBTREE_BREAKS));
    }

    #[test]
    fn test_owner_rule_is_per_entity() {
        let mut store = store();
        let mut brk = AclInfo::new(2, false);
        brk.entry_mut(AceKey::new(99, EntryType::Normal, false)).allow_bits = 1;
        store
            .apply_acl_changes(&AclChangeSet {
                acls: vec![brk],
                ..Default::default()
            })
            .unwrap();

        let ids = BTreeSet::from([500]);
        let owner = Some(OwnerRule { user_id: 500, owner_group_id: 99 });
        // owner of 2 only, so 3 fails
        assert!(!subtree_allows(&store, 2, &ids, owner, 1, BreakOptions::DEFAULT));
        store.modify_owner(3, Some(500)).unwrap();
        assert!(subtree_allows(&store, 2, &ids, owner, 1, BreakOptions::DEFAULT));
    }
}
