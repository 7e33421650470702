//! Read-only traversal over a snapshot of the entity store
//!
//! Every sequence is lazy and shares the break semantics of
//! [`BreakOptions`]. A [`SecurityQuery`] holds the store's read lock for its
//! lifetime, so keep it short-lived.

use parking_lot::RwLockReadGuard;
use std::collections::{BTreeSet, VecDeque};
use treeacl_core::types::{AceInfo, EntityId, IdentityId, SecurityEntity};

use crate::entities::EntityStore;
use crate::evaluator::BreakOptions;

pub struct SecurityQuery<'a> {
    store: RwLockReadGuard<'a, EntityStore>,
}

impl<'a> SecurityQuery<'a> {
    pub(crate) fn new(store: RwLockReadGuard<'a, EntityStore>) -> Self {
        Self { store }
    }

    /// Parent chain of `entity_id`, starting at its parent.
    ///
    /// With `STOP_AT_PARENT_BREAK` the walk ends after the first ancestor
    /// that is a break point.
    pub fn ancestors(&self, entity_id: EntityId, options: BreakOptions) -> Ancestors<'_> {
        Ancestors {
            store: &*self.store,
            next: self.store.get(entity_id).and_then(|e| e.parent_id),
            stop_at_break: options.contains(BreakOptions::STOP_AT_PARENT_BREAK),
        }
    }

    /// Descendants of `entity_id` in breadth-first order, excluding itself.
    ///
    /// With `STOP_AT_SUBTREE_BREAKS` broken descendants are skipped together
    /// with their subtree.
    pub fn descendants(&self, entity_id: EntityId, options: BreakOptions) -> Descendants<'_> {
        let mut queue = VecDeque::new();
        if self.store.contains(entity_id) {
            queue.extend(self.store.children(entity_id).iter().copied());
        }
        Descendants {
            store: &*self.store,
            queue,
            skip_breaks: options.contains(BreakOptions::STOP_AT_SUBTREE_BREAKS),
        }
    }

    /// `entity_id` followed by its descendants
    pub fn subtree(&self, entity_id: EntityId, options: BreakOptions) -> impl Iterator<Item = &SecurityEntity> + '_ {
        self.store
            .get(entity_id)
            .into_iter()
            .chain(self.descendants(entity_id, options))
    }

    /// Stored entries reachable through the subtree view, paired with their
    /// holder
    pub fn related_entries(&self, entity_id: EntityId, options: BreakOptions) -> impl Iterator<Item = (EntityId, &AceInfo)> + '_ {
        self.subtree(entity_id, options).flat_map(move |entity| {
            self.store
                .acl(entity.id)
                .into_iter()
                .flat_map(|acl| acl.entries.iter().map(move |e| (acl.holder_entity_id, e)))
        })
    }

    /// Distinct identities that hold an entry anywhere in the subtree view
    pub fn related_identities(&self, entity_id: EntityId, options: BreakOptions) -> BTreeSet<IdentityId> {
        self.related_entries(entity_id, options)
            .map(|(_, entry)| entry.identity_id)
            .collect()
    }

    /// Entities in the subtree view where `identity_id` holds an entry
    pub fn entities_with_entries_for(&self, entity_id: EntityId, identity_id: IdentityId, options: BreakOptions) -> impl Iterator<Item = EntityId> + '_ {
        self.subtree(entity_id, options)
            .filter(move |entity| {
                self.store
                    .acl(entity.id)
                    .is_some_and(|acl| acl.entries.iter().any(|e| e.identity_id == identity_id))
            })
            .map(|entity| entity.id)
    }
}

/// Lazy parent walk
pub struct Ancestors<'a> {
    store: &'a EntityStore,
    next: Option<EntityId>,
    stop_at_break: bool,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a SecurityEntity;

    fn next(&mut self) -> Option<Self::Item> {
        let entity = self.store.get(self.next?)?;
        self.next = if self.stop_at_break && !entity.is_inherited {
            None
        } else {
            entity.parent_id
        };
        Some(entity)
    }
}

/// Lazy breadth-first descendant walk
pub struct Descendants<'a> {
    store: &'a EntityStore,
    queue: VecDeque<EntityId>,
    skip_breaks: bool,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a SecurityEntity;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.queue.pop_front() {
            let Some(entity) = self.store.get(id) else {
                continue;
            };
            if self.skip_breaks && !entity.is_inherited {
                continue;
            }
            self.queue.extend(self.store.children(id).iter().copied());
            return Some(entity);
        }
        None
    }
}
