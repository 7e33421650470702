//! Dependency rule between activities

use treeacl_core::types::Activity;

use crate::entities::EntityStore;

/// Whether `later` has to wait for `earlier`.
///
/// Entity activities are related when any pair of their affected entities
/// is equal or on one ancestor chain. Membership activities are related when
/// their group or user sets intersect. The two families never depend on each
/// other.
pub fn must_wait_for(later: &Activity, earlier: &Activity, store: &EntityStore) -> bool {
    if later.sequence_id <= earlier.sequence_id {
        return false;
    }

    match (later.is_membership(), earlier.is_membership()) {
        (true, true) => {
            !later.affected_group_ids.is_disjoint(&earlier.affected_group_ids)
                || !later.affected_user_ids.is_disjoint(&earlier.affected_user_ids)
        }
        (false, false) => later.affected_entity_ids.iter().any(|a| {
            earlier
                .affected_entity_ids
                .iter()
                .any(|b| a == b || store.is_related(*a, *b))
        }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treeacl_core::types::MutationKind;

    fn store() -> EntityStore {
        let mut store = EntityStore::new();
        store.create_entity(1, None, None).unwrap();
        store.create_entity(2, Some(1), None).unwrap();
        store.create_entity(3, Some(1), None).unwrap();
        store
    }

    fn owner_change(id: u64, entity_id: u64) -> Activity {
        Activity::new(MutationKind::ModifyOwner { entity_id, owner_id: None }).with_sequence_id(id)
    }

    #[test]
    fn test_entity_relation() {
        let store = store();
        assert!(must_wait_for(&owner_change(2, 2), &owner_change(1, 1), &store));
        assert!(must_wait_for(&owner_change(2, 1), &owner_change(1, 3), &store));
        assert!(!must_wait_for(&owner_change(2, 2), &owner_change(1, 3), &store));
        assert!(!must_wait_for(&owner_change(1, 1), &owner_change(2, 1), &store));
    }

    #[test]
    fn test_membership_relation() {
        let store = store();
        let add = |id, group_id, user| {
            Activity::new(MutationKind::AddMembers {
                group_id,
                user_ids: vec![user],
                group_ids: vec![],
                parent_group_ids: vec![],
            })
            .with_sequence_id(id)
        };
        assert!(must_wait_for(&add(2, 10, 100), &add(1, 10, 101), &store));
        assert!(must_wait_for(&add(2, 11, 100), &add(1, 10, 100), &store));
        assert!(!must_wait_for(&add(2, 11, 100), &add(1, 10, 101), &store));
        assert!(!must_wait_for(&add(2, 1, 100), &owner_change(1, 1), &store));
    }
}
