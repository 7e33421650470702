//! Entity tree with nearest-ACL-holder bookkeeping

use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};
use treeacl_core::error::{Result, SecurityError};
use treeacl_core::traits::MissingEntityResolver;
use treeacl_core::types::{
    AclChangeSet, AclInfo, EntityId, IdentityId, SecurityEntity, StoredAce, StoredSecurityEntity,
};

/// Resolver recursion limit when materializing ancestor chains
const MAX_MATERIALIZE_DEPTH: usize = 256;

/// Entity tree plus stored ACLs.
///
/// Only ACL holders are kept in `acls`: every break point has a record
/// (possibly without entries) and every other record carries at least one
/// entry.
///
/// Edits are planned against `&self` into a [`StorePatch`] and installed
/// with [`commit`](Self::commit), so derived levels and holders are
/// computed without exclusive access.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    entities: HashMap<EntityId, SecurityEntity>,
    children: HashMap<EntityId, Vec<EntityId>>,
    acls: HashMap<EntityId, AclInfo>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the store from persisted rows.
    ///
    /// Rows that reference a missing parent become roots; rows caught in a
    /// parent cycle and entries of unknown entities are dropped.
    pub fn load(entities: Vec<StoredSecurityEntity>, aces: Vec<StoredAce>) -> Self {
        let mut store = Self::new();

        for row in &entities {
            store.entities.insert(
                row.id,
                SecurityEntity {
                    is_inherited: row.is_inherited,
                    ..SecurityEntity::new(row.id, row.parent_id, row.owner_id)
                },
            );
        }

        let ids: Vec<EntityId> = store.entities.keys().copied().collect();
        for id in ids {
            let parent_id = store.entities[&id].parent_id;
            match parent_id {
                Some(parent) if store.entities.contains_key(&parent) => {
                    store.children.entry(parent).or_default().push(id);
                }
                Some(parent) => {
                    warn!(entity_id = id, parent_id = parent, "Parent missing on load, treating entity as root");
                    if let Some(entity) = store.entities.get_mut(&id) {
                        entity.parent_id = None;
                    }
                }
                None => {}
            }
        }
        for list in store.children.values_mut() {
            list.sort_unstable();
        }

        let mut grouped: HashMap<EntityId, AclInfo> = HashMap::new();
        for ace in aces {
            let Some(entity) = store.entities.get(&ace.entity_id) else {
                warn!(entity_id = ace.entity_id, "Dropping entry of unknown entity");
                continue;
            };
            grouped
                .entry(ace.entity_id)
                .or_insert_with(|| AclInfo::new(entity.id, entity.is_inherited))
                .entries
                .push(ace.entry);
        }
        for entity in store.entities.values() {
            if !entity.is_inherited {
                grouped
                    .entry(entity.id)
                    .or_insert_with(|| AclInfo::new(entity.id, false));
            }
        }
        for (id, mut acl) in grouped {
            acl.normalize_order();
            acl.remove_empty_entries();
            if acl.is_holder() {
                store.acls.insert(id, acl);
            }
        }

        let mut draft = Draft::new(&store);
        let reached = draft.refresh(store.roots());
        let patch = draft.finish();
        store.commit(patch);
        if reached < store.entities.len() {
            let orphaned: Vec<EntityId> = store
                .entities
                .keys()
                .copied()
                .filter(|id| !store.is_reachable(*id))
                .collect();
            warn!(count = orphaned.len(), "Dropping entities caught in a parent cycle");
            for id in orphaned {
                store.entities.remove(&id);
                store.children.remove(&id);
                store.acls.remove(&id);
            }
            for list in store.children.values_mut() {
                list.retain(|c| store.entities.contains_key(c));
            }
        }

        debug!(
            entities = store.entities.len(),
            acls = store.acls.len(),
            "Entity store loaded"
        );
        store
    }

    fn is_reachable(&self, id: EntityId) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            if !seen.insert(cur) {
                return false;
            }
            match self.entities.get(&cur) {
                Some(entity) => current = entity.parent_id,
                None => return false,
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn get(&self, id: EntityId) -> Option<&SecurityEntity> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Stored ACL of a holder entity
    pub fn acl(&self, id: EntityId) -> Option<&AclInfo> {
        self.acls.get(&id)
    }

    /// Every stored ACL
    pub fn acls(&self) -> impl Iterator<Item = &AclInfo> {
        self.acls.values()
    }

    /// Direct children, ascending by id
    pub fn children(&self, id: EntityId) -> &[EntityId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Root entities, ascending by id
    pub fn roots(&self) -> Vec<EntityId> {
        let mut roots: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.parent_id.is_none())
            .map(|e| e.id)
            .collect();
        roots.sort_unstable();
        roots
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = &SecurityEntity> {
        self.entities.values()
    }

    /// `ancestor` equals `id` or lies on its parent chain
    pub fn is_ancestor_or_self(&self, ancestor: EntityId, id: EntityId) -> bool {
        let mut current = Some(id);
        while let Some(cur) = current {
            if cur == ancestor {
                return true;
            }
            current = self.entities.get(&cur).and_then(|e| e.parent_id);
        }
        false
    }

    /// Whether one entity contains the other
    pub fn is_related(&self, a: EntityId, b: EntityId) -> bool {
        self.is_ancestor_or_self(a, b) || self.is_ancestor_or_self(b, a)
    }

    /// Parent chain starting at `id` itself
    pub fn ancestors_inclusive(&self, id: EntityId) -> Vec<EntityId> {
        let mut chain = Vec::new();
        let mut current = self.entities.get(&id);
        while let Some(entity) = current {
            chain.push(entity.id);
            current = entity.parent_id.and_then(|p| self.entities.get(&p));
        }
        chain
    }

    /// `id` and every descendant, parents before children
    pub fn subtree(&self, id: EntityId) -> Vec<EntityId> {
        if !self.contains(id) {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            out.push(current);
            queue.extend(self.children(current).iter().copied());
        }
        out
    }

    // ------------------------------------------------------------------
    // Validation (no mutation)
    // ------------------------------------------------------------------

    pub fn check_create(&self, id: EntityId, parent_id: Option<EntityId>) -> Result<()> {
        if id == 0 {
            return Err(SecurityError::InvalidArgument("entity id must not be 0".into()));
        }
        match parent_id {
            Some(0) => Err(SecurityError::InvalidArgument("parent id must not be 0".into())),
            Some(parent) if !self.contains(parent) => Err(SecurityError::EntityNotFound(parent)),
            _ => Ok(()),
        }
    }

    pub fn check_move(&self, id: EntityId, target_id: EntityId) -> Result<()> {
        if id == 0 || target_id == 0 {
            return Err(SecurityError::InvalidArgument("entity id must not be 0".into()));
        }
        if !self.contains(id) {
            return Err(SecurityError::EntityNotFound(id));
        }
        if !self.contains(target_id) {
            return Err(SecurityError::EntityNotFound(target_id));
        }
        if self.is_ancestor_or_self(id, target_id) {
            return Err(SecurityError::InvalidArgument(format!(
                "cannot move entity {} under its own subtree ({})",
                id, target_id
            )));
        }
        Ok(())
    }

    pub fn check_acl_changes(&self, changes: &AclChangeSet) -> Result<()> {
        for id in changes.entity_ids() {
            if id == 0 {
                return Err(SecurityError::InvalidArgument("entity id must not be 0".into()));
            }
            if !self.contains(id) {
                return Err(SecurityError::EntityNotFound(id));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Insert an entity under `parent_id`.
    ///
    /// Re-creating an existing id only overwrites its owner.
    pub fn create_entity(
        &mut self,
        id: EntityId,
        parent_id: Option<EntityId>,
        owner_id: Option<IdentityId>,
    ) -> Result<()> {
        let patch = self.plan_create_entity(id, parent_id, owner_id)?;
        self.commit(patch);
        Ok(())
    }

    /// Remove an entity with its whole subtree and their ACLs.
    ///
    /// Unknown ids are a no-op. Returns the removed ids.
    pub fn delete_entity(&mut self, id: EntityId) -> Vec<EntityId> {
        let patch = self.plan_delete_entity(id);
        let removed = patch.removed.clone();
        self.commit(patch);
        removed
    }

    /// Reparent an entity, keeping its own ACL and break flag
    pub fn move_entity(&mut self, id: EntityId, target_id: EntityId) -> Result<()> {
        let patch = self.plan_move_entity(id, target_id)?;
        self.commit(patch);
        Ok(())
    }

    pub fn modify_owner(&mut self, id: EntityId, owner_id: Option<IdentityId>) -> Result<()> {
        let patch = self.plan_modify_owner(id, owner_id)?;
        self.commit(patch);
        Ok(())
    }

    /// Commit an ACL change set atomically.
    ///
    /// Every referenced entity is checked before anything changes.
    pub fn apply_acl_changes(&mut self, changes: &AclChangeSet) -> Result<()> {
        let patch = self.plan_acl_changes(changes)?;
        self.commit(patch);
        Ok(())
    }

    /// Make sure `id` is present, asking the resolver to place it (and any
    /// missing ancestors) when it is not. Returns whether it exists afterwards.
    pub fn materialize(&mut self, id: EntityId, resolver: &dyn MissingEntityResolver) -> bool {
        match self.plan_materialize(id, resolver) {
            Some(patch) => {
                self.commit(patch);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    pub fn plan_create_entity(
        &self,
        id: EntityId,
        parent_id: Option<EntityId>,
        owner_id: Option<IdentityId>,
    ) -> Result<StorePatch> {
        self.check_create(id, parent_id)?;
        let mut draft = Draft::new(self);
        draft.create(id, parent_id, owner_id);
        Ok(draft.finish())
    }

    pub fn plan_delete_entity(&self, id: EntityId) -> StorePatch {
        let mut draft = Draft::new(self);
        let removed = self.subtree(id);
        if removed.is_empty() {
            return draft.finish();
        }
        if let Some(parent) = self.entities.get(&id).and_then(|e| e.parent_id) {
            draft.children_mut(parent).retain(|c| *c != id);
        }
        debug!(entity_id = id, removed = removed.len(), "Entity subtree deletion planned");
        draft.removed = removed;
        draft.finish()
    }

    pub fn plan_move_entity(&self, id: EntityId, target_id: EntityId) -> Result<StorePatch> {
        self.check_move(id, target_id)?;

        let mut draft = Draft::new(self);
        let old_parent = self.entities.get(&id).and_then(|e| e.parent_id);
        if old_parent == Some(target_id) {
            return Ok(draft.finish());
        }
        if let Some(parent) = old_parent {
            draft.children_mut(parent).retain(|c| *c != id);
        }
        let siblings = draft.children_mut(target_id);
        if let Err(pos) = siblings.binary_search(&id) {
            siblings.insert(pos, id);
        }
        if let Some(entity) = draft.entity_mut(id) {
            entity.parent_id = Some(target_id);
        }

        draft.refresh(vec![id]);
        Ok(draft.finish())
    }

    pub fn plan_modify_owner(&self, id: EntityId, owner_id: Option<IdentityId>) -> Result<StorePatch> {
        let mut draft = Draft::new(self);
        match draft.entity_mut(id) {
            Some(entity) => entity.owner_id = owner_id,
            None => return Err(SecurityError::EntityNotFound(id)),
        }
        Ok(draft.finish())
    }

    pub fn plan_acl_changes(&self, changes: &AclChangeSet) -> Result<StorePatch> {
        self.check_acl_changes(changes)?;

        let mut draft = Draft::new(self);
        let mut touched: Vec<EntityId> = Vec::new();

        for id in &changes.removed_acls {
            draft.set_acl(*id, None);
            if let Some(entity) = draft.entity_mut(*id) {
                entity.is_inherited = true;
            }
            touched.push(*id);
        }

        for acl in &changes.acls {
            let mut acl = acl.clone();
            acl.remove_empty_entries();
            acl.normalize_order();
            let id = acl.holder_entity_id;
            if let Some(entity) = draft.entity_mut(id) {
                entity.is_inherited = acl.inherits;
            }
            if acl.is_holder() {
                draft.set_acl(id, Some(acl));
            } else {
                draft.set_acl(id, None);
            }
            touched.push(id);
        }

        for id in &changes.breaks {
            if let Some(entity) = draft.entity_mut(*id) {
                entity.is_inherited = false;
            }
            let mut acl = draft
                .acl(*id)
                .cloned()
                .unwrap_or_else(|| AclInfo::new(*id, false));
            acl.inherits = false;
            draft.set_acl(*id, Some(acl));
            touched.push(*id);
        }

        for id in &changes.unbreaks {
            if let Some(entity) = draft.entity_mut(*id) {
                entity.is_inherited = true;
            }
            if let Some(mut acl) = draft.acl(*id).cloned() {
                acl.inherits = true;
                let kept = (!acl.is_removable()).then_some(acl);
                draft.set_acl(*id, kept);
            }
            touched.push(*id);
        }

        draft.refresh(touched);
        Ok(draft.finish())
    }

    /// Place `id` and any missing ancestors through the resolver. `None`
    /// when the chain cannot be resolved; an empty patch when `id` exists.
    pub fn plan_materialize(&self, id: EntityId, resolver: &dyn MissingEntityResolver) -> Option<StorePatch> {
        let mut draft = Draft::new(self);
        if self.contains(id) {
            return Some(draft.finish());
        }

        let mut pending = Vec::new();
        let mut current = id;
        loop {
            if pending.len() >= MAX_MATERIALIZE_DEPTH || pending.iter().any(|(p, _)| *p == current) {
                warn!(entity_id = id, "Resolver returned an unusable ancestor chain");
                return None;
            }
            let resolved = resolver.resolve(current)?;
            pending.push((current, resolved));
            match resolved.parent_id {
                Some(parent) if !self.contains(parent) => current = parent,
                _ => break,
            }
        }

        for (entity_id, resolved) in pending.into_iter().rev() {
            if let Err(e) = draft.check_create(entity_id, resolved.parent_id) {
                warn!(entity_id, error = %e, "Could not materialize entity");
                return None;
            }
            draft.create(entity_id, resolved.parent_id, resolved.owner_id);
            debug!(entity_id, "Materialized entity from resolver");
        }
        Some(draft.finish())
    }

    /// Install a planned change. Only moves precomputed values into place.
    pub fn commit(&mut self, patch: StorePatch) {
        for id in &patch.removed {
            self.entities.remove(id);
            self.children.remove(id);
            self.acls.remove(id);
        }
        for (id, list) in patch.children {
            if list.is_empty() {
                self.children.remove(&id);
            } else {
                self.children.insert(id, list);
            }
        }
        for entity in patch.entities {
            self.entities.insert(entity.id, entity);
        }
        for (id, acl) in patch.acls {
            match acl {
                Some(acl) => self.acls.insert(id, acl),
                None => self.acls.remove(&id),
            };
        }
    }

    /// Check every structural invariant; used by tests and debug tooling.
    pub fn validate(&self) -> Result<()> {
        for entity in self.entities.values() {
            let (expected_level, expected_holder) = match entity.parent_id {
                Some(parent_id) => {
                    let parent = self.entities.get(&parent_id).ok_or_else(|| {
                        SecurityError::Internal(format!(
                            "entity {} references missing parent {}",
                            entity.id, parent_id
                        ))
                    })?;
                    if !self.children(parent_id).contains(&entity.id) {
                        return Err(SecurityError::Internal(format!(
                            "entity {} missing from children of {}",
                            entity.id, parent_id
                        )));
                    }
                    (parent.level + 1, parent.first_acl_id)
                }
                None => (0, None),
            };
            let expected_holder = if self.acls.contains_key(&entity.id) {
                Some(entity.id)
            } else {
                expected_holder
            };

            if entity.level != expected_level {
                return Err(SecurityError::Internal(format!(
                    "entity {} has level {}, expected {}",
                    entity.id, entity.level, expected_level
                )));
            }
            if entity.first_acl_id != expected_holder {
                return Err(SecurityError::Internal(format!(
                    "entity {} has holder {:?}, expected {:?}",
                    entity.id, entity.first_acl_id, expected_holder
                )));
            }
            if !entity.is_inherited && self.acls.get(&entity.id).map(|a| a.inherits) != Some(false) {
                return Err(SecurityError::Internal(format!(
                    "break point {} has no breaking ACL",
                    entity.id
                )));
            }
        }

        for acl in self.acls.values() {
            let entity = self
                .entities
                .get(&acl.holder_entity_id)
                .ok_or(SecurityError::EntityNotFound(acl.holder_entity_id))?;
            if !acl.is_holder() || acl.entries.iter().any(|e| e.is_empty()) {
                return Err(SecurityError::Internal(format!(
                    "ACL of {} carries no information",
                    acl.holder_entity_id
                )));
            }
            if acl.inherits != entity.is_inherited {
                return Err(SecurityError::Internal(format!(
                    "ACL of {} disagrees with entity break flag",
                    acl.holder_entity_id
                )));
            }
        }
        Ok(())
    }
}

/// Precomputed result of one store edit. Entities, child lists and ACLs
/// listed here replace the stored values; an empty child list or a `None`
/// ACL removes the record.
#[derive(Debug, Clone, Default)]
pub struct StorePatch {
    removed: Vec<EntityId>,
    entities: Vec<SecurityEntity>,
    children: Vec<(EntityId, Vec<EntityId>)>,
    acls: Vec<(EntityId, Option<AclInfo>)>,
}

impl StorePatch {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.entities.is_empty()
            && self.children.is_empty()
            && self.acls.is_empty()
    }
}

/// Copy-on-write overlay over a store while an edit is planned
struct Draft<'a> {
    base: &'a EntityStore,
    entities: HashMap<EntityId, SecurityEntity>,
    children: HashMap<EntityId, Vec<EntityId>>,
    acls: HashMap<EntityId, Option<AclInfo>>,
    removed: Vec<EntityId>,
}

impl<'a> Draft<'a> {
    fn new(base: &'a EntityStore) -> Self {
        Self {
            base,
            entities: HashMap::new(),
            children: HashMap::new(),
            acls: HashMap::new(),
            removed: Vec::new(),
        }
    }

    fn entity(&self, id: EntityId) -> Option<&SecurityEntity> {
        self.entities.get(&id).or_else(|| self.base.entities.get(&id))
    }

    fn entity_mut(&mut self, id: EntityId) -> Option<&mut SecurityEntity> {
        if !self.entities.contains_key(&id) {
            let entity = self.base.entities.get(&id)?.clone();
            self.entities.insert(id, entity);
        }
        self.entities.get_mut(&id)
    }

    fn children(&self, id: EntityId) -> &[EntityId] {
        match self.children.get(&id) {
            Some(list) => list.as_slice(),
            None => self.base.children(id),
        }
    }

    fn children_mut(&mut self, id: EntityId) -> &mut Vec<EntityId> {
        let base = self.base;
        self.children
            .entry(id)
            .or_insert_with(|| base.children(id).to_vec())
    }

    fn acl(&self, id: EntityId) -> Option<&AclInfo> {
        match self.acls.get(&id) {
            Some(acl) => acl.as_ref(),
            None => self.base.acls.get(&id),
        }
    }

    fn has_acl(&self, id: EntityId) -> bool {
        self.acl(id).is_some()
    }

    fn set_acl(&mut self, id: EntityId, acl: Option<AclInfo>) {
        self.acls.insert(id, acl);
    }

    fn check_create(&self, id: EntityId, parent_id: Option<EntityId>) -> Result<()> {
        if id == 0 {
            return Err(SecurityError::InvalidArgument("entity id must not be 0".into()));
        }
        match parent_id {
            Some(0) => Err(SecurityError::InvalidArgument("parent id must not be 0".into())),
            Some(parent) if self.entity(parent).is_none() => Err(SecurityError::EntityNotFound(parent)),
            _ => Ok(()),
        }
    }

    fn create(&mut self, id: EntityId, parent_id: Option<EntityId>, owner_id: Option<IdentityId>) {
        if let Some(existing) = self.entity_mut(id) {
            debug!(entity_id = id, "Entity exists, updating owner only");
            existing.owner_id = owner_id;
            return;
        }

        let mut entity = SecurityEntity::new(id, parent_id, owner_id);
        if let Some(parent) = parent_id.and_then(|p| self.entity(p)) {
            entity.level = parent.level + 1;
            entity.first_acl_id = parent.first_acl_id;
        }
        if let Some(parent) = parent_id {
            let siblings = self.children_mut(parent);
            if let Err(pos) = siblings.binary_search(&id) {
                siblings.insert(pos, id);
            }
        }
        self.entities.insert(id, entity);
    }

    /// Recompute level and nearest holder below every touched entity,
    /// returning how many entities were visited.
    ///
    /// Walks run in level order and never revisit an entity. A walk stops
    /// at an untouched descendant whose values come out unchanged, since
    /// nothing below it can change either.
    fn refresh(&mut self, touched: Vec<EntityId>) -> usize {
        let starts: HashSet<EntityId> = touched.iter().copied().collect();
        let mut order: Vec<(u32, EntityId)> = touched
            .into_iter()
            .filter_map(|id| self.entity(id).map(|e| (e.level, id)))
            .collect();
        order.sort_unstable();
        order.dedup();

        let mut visited = HashSet::new();
        for (_, start) in order {
            let mut queue = VecDeque::from([start]);
            while let Some(current) = queue.pop_front() {
                if !visited.insert(current) {
                    continue;
                }
                let Some(entity) = self.entity(current) else {
                    continue;
                };
                let (level, inherited_holder) =
                    match entity.parent_id.and_then(|p| self.entity(p)) {
                        Some(parent) => (parent.level + 1, parent.first_acl_id),
                        None => (0, None),
                    };
                let holder = if self.has_acl(current) {
                    Some(current)
                } else {
                    inherited_holder
                };
                let changed = entity.level != level || entity.first_acl_id != holder;
                if changed {
                    if let Some(entity) = self.entity_mut(current) {
                        entity.level = level;
                        entity.first_acl_id = holder;
                    }
                }
                if changed || starts.contains(&current) {
                    queue.extend(self.children(current).iter().copied());
                }
            }
        }
        visited.len()
    }

    fn finish(self) -> StorePatch {
        StorePatch {
            removed: self.removed,
            entities: self.entities.into_values().collect(),
            children: self.children.into_iter().collect(),
            acls: self.acls.into_iter().collect(),
        }
    }
}
