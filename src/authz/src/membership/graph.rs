//! Membership graph with incremental closure maintenance
//!
//! Closures are recomputed while planning an edit, so the cache only needs
//! exclusive access to install the result.

use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;
use treeacl_core::error::{Result, SecurityError};
use treeacl_core::types::{IdentityId, SecurityGroup};

/// Raw membership edges plus the flattened closure of every user.
///
/// Group containment is stored as `member -> container` edges, so a
/// depth-first walk from a group visits every group it transitively
/// belongs to. The walk marks visited nodes, which terminates on cycles.
///
/// Every edit is split in two: `plan_*` computes a [`MembershipPatch`]
/// against `&self`, and [`commit`](Self::commit) installs it.
#[derive(Debug, Clone, Default)]
pub struct MembershipGraph {
    /// Direct user members of each group
    users_of: HashMap<IdentityId, BTreeSet<IdentityId>>,
    /// Direct groups of each user
    groups_of_user: HashMap<IdentityId, BTreeSet<IdentityId>>,
    /// `member group -> containing group`
    containment: DiGraphMap<IdentityId, ()>,
    /// Every group each user transitively belongs to
    flattened: HashMap<IdentityId, BTreeSet<IdentityId>>,
}

impl MembershipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from stored groups and flatten every user
    pub fn load(groups: Vec<SecurityGroup>) -> Self {
        let mut graph = Self::new();
        for group in groups {
            graph.containment.add_node(group.id);
            for &user_id in &group.user_ids {
                graph.groups_of_user.entry(user_id).or_default().insert(group.id);
            }
            if !group.user_ids.is_empty() {
                graph.users_of.entry(group.id).or_default().extend(group.user_ids);
            }
            for member in group.group_ids {
                graph.containment.add_edge(member, group.id, ());
            }
        }

        let mut flattened = HashMap::with_capacity(graph.groups_of_user.len());
        for (&user_id, direct) in &graph.groups_of_user {
            let mut closure = BTreeSet::new();
            for &group_id in direct {
                if !closure.contains(&group_id) {
                    closure.extend(graph.containers_of(group_id));
                }
            }
            flattened.insert(user_id, closure);
        }
        graph.flattened = flattened;
        debug!(
            groups = graph.containment.node_count(),
            users = graph.flattened.len(),
            "Membership graph loaded"
        );
        graph
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether `member` (a user or a group) belongs to `group_id`, directly
    /// or transitively. Unknown ids are simply not members.
    pub fn is_in_group(&self, member: IdentityId, group_id: IdentityId) -> bool {
        if self
            .flattened
            .get(&member)
            .is_some_and(|groups| groups.contains(&group_id))
        {
            return true;
        }
        self.containment.contains_node(member)
            && self.containment.contains_node(group_id)
            && member != group_id
            && has_path_connecting(&self.containment, member, group_id, None)
    }

    /// Every group the user transitively belongs to
    pub fn flattened_groups(&self, user_id: IdentityId) -> BTreeSet<IdentityId> {
        self.flattened.get(&user_id).cloned().unwrap_or_default()
    }

    /// Groups that directly contain `identity` (a user or a group)
    pub fn parent_groups(&self, identity: IdentityId) -> BTreeSet<IdentityId> {
        let mut parents: BTreeSet<IdentityId> = self
            .groups_of_user
            .get(&identity)
            .cloned()
            .unwrap_or_default();
        if self.containment.contains_node(identity) {
            parents.extend(
                self.containment
                    .neighbors_directed(identity, Direction::Outgoing),
            );
        }
        parents
    }

    /// Direct members of a group
    pub fn group(&self, group_id: IdentityId) -> Option<SecurityGroup> {
        if !self.containment.contains_node(group_id) {
            return None;
        }
        Some(SecurityGroup {
            id: group_id,
            user_ids: self.users_of.get(&group_id).cloned().unwrap_or_default(),
            group_ids: self
                .containment
                .neighbors_directed(group_id, Direction::Incoming)
                .collect(),
        })
    }

    /// The given identities plus every group each of them transitively
    /// belongs to. Works for users and groups alike, so dynamic groups
    /// pick up the static groups that contain them.
    pub fn closure(&self, identities: &[IdentityId]) -> BTreeSet<IdentityId> {
        let mut out: BTreeSet<IdentityId> = identities.iter().copied().collect();
        for identity in identities {
            if let Some(groups) = self.flattened.get(identity) {
                out.extend(groups.iter().copied());
            }
            if self.containment.contains_node(*identity) {
                out.extend(self.containers_of(*identity));
            }
        }
        out
    }

    pub fn group_count(&self) -> usize {
        self.containment.node_count()
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Add users and groups to `group_id`, and `group_id` to each of
    /// `parent_group_ids`.
    pub fn add_members(
        &mut self,
        group_id: IdentityId,
        user_ids: &[IdentityId],
        group_ids: &[IdentityId],
        parent_group_ids: &[IdentityId],
    ) -> Result<()> {
        let patch = self.plan_add_members(group_id, user_ids, group_ids, parent_group_ids)?;
        self.commit(patch);
        Ok(())
    }

    /// Inverse of [`add_members`](Self::add_members). Missing edges are ignored.
    pub fn remove_members(
        &mut self,
        group_id: IdentityId,
        user_ids: &[IdentityId],
        group_ids: &[IdentityId],
        parent_group_ids: &[IdentityId],
    ) -> Result<()> {
        let patch = self.plan_remove_members(group_id, user_ids, group_ids, parent_group_ids)?;
        self.commit(patch);
        Ok(())
    }

    pub fn add_user_to_groups(&mut self, user_id: IdentityId, group_ids: &[IdentityId]) -> Result<()> {
        let patch = self.plan_add_user_to_groups(user_id, group_ids)?;
        self.commit(patch);
        Ok(())
    }

    pub fn remove_user_from_groups(
        &mut self,
        user_id: IdentityId,
        group_ids: &[IdentityId],
    ) -> Result<()> {
        let patch = self.plan_remove_user_from_groups(user_id, group_ids)?;
        self.commit(patch);
        Ok(())
    }

    /// Detach a group from every container and every member. Member
    /// identities themselves survive.
    pub fn delete_group(&mut self, group_id: IdentityId) -> Result<()> {
        let patch = self.plan_delete_group(group_id)?;
        self.commit(patch);
        Ok(())
    }

    /// Remove a user from every group
    pub fn delete_user(&mut self, user_id: IdentityId) -> Result<()> {
        let patch = self.plan_delete_user(user_id)?;
        self.commit(patch);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    pub fn plan_add_members(
        &self,
        group_id: IdentityId,
        user_ids: &[IdentityId],
        group_ids: &[IdentityId],
        parent_group_ids: &[IdentityId],
    ) -> Result<MembershipPatch> {
        check_ids(std::iter::once(&group_id).chain(user_ids).chain(group_ids).chain(parent_group_ids))?;

        let mut draft = Draft::new(self);
        let graph = draft.graph_mut();
        graph.add_node(group_id);
        for &member in group_ids {
            graph.add_edge(member, group_id, ());
        }
        for &parent in parent_group_ids {
            graph.add_edge(group_id, parent, ());
        }
        for &user_id in user_ids {
            draft.link(group_id, user_id);
        }

        let mut affected = draft.users_below(group_id);
        for &member in group_ids {
            affected.extend(draft.users_below(member));
        }
        affected.extend(user_ids.iter().copied());
        Ok(draft.finish(affected))
    }

    pub fn plan_remove_members(
        &self,
        group_id: IdentityId,
        user_ids: &[IdentityId],
        group_ids: &[IdentityId],
        parent_group_ids: &[IdentityId],
    ) -> Result<MembershipPatch> {
        check_ids(std::iter::once(&group_id).chain(user_ids).chain(group_ids).chain(parent_group_ids))?;

        // affected users must be collected while the edges still exist
        let mut draft = Draft::new(self);
        let mut affected = draft.users_below(group_id);
        for &member in group_ids {
            affected.extend(draft.users_below(member));
        }
        affected.extend(user_ids.iter().copied());

        for &user_id in user_ids {
            draft.unlink(group_id, user_id);
        }
        let graph = draft.graph_mut();
        for &member in group_ids {
            graph.remove_edge(member, group_id);
        }
        for &parent in parent_group_ids {
            graph.remove_edge(group_id, parent);
        }
        Ok(draft.finish(affected))
    }

    pub fn plan_add_user_to_groups(&self, user_id: IdentityId, group_ids: &[IdentityId]) -> Result<MembershipPatch> {
        check_ids(std::iter::once(&user_id).chain(group_ids))?;
        let mut draft = Draft::new(self);
        for &group_id in group_ids {
            if !draft.graph().contains_node(group_id) {
                draft.graph_mut().add_node(group_id);
            }
            draft.link(group_id, user_id);
        }
        Ok(draft.finish(BTreeSet::from([user_id])))
    }

    pub fn plan_remove_user_from_groups(
        &self,
        user_id: IdentityId,
        group_ids: &[IdentityId],
    ) -> Result<MembershipPatch> {
        check_ids(std::iter::once(&user_id).chain(group_ids))?;
        let mut draft = Draft::new(self);
        for &group_id in group_ids {
            draft.unlink(group_id, user_id);
        }
        Ok(draft.finish(BTreeSet::from([user_id])))
    }

    pub fn plan_delete_group(&self, group_id: IdentityId) -> Result<MembershipPatch> {
        check_ids(std::iter::once(&group_id))?;
        let mut draft = Draft::new(self);
        if !self.containment.contains_node(group_id) {
            return Ok(draft.finish(BTreeSet::new()));
        }

        let affected = draft.users_below(group_id);
        let users: Vec<IdentityId> = draft.direct_users(group_id).into_iter().collect();
        for user_id in users {
            draft.unlink(group_id, user_id);
        }
        draft.graph_mut().remove_node(group_id);
        debug!(group_id, users = affected.len(), "Group deletion planned");
        Ok(draft.finish(affected))
    }

    pub fn plan_delete_user(&self, user_id: IdentityId) -> Result<MembershipPatch> {
        check_ids(std::iter::once(&user_id))?;
        let mut draft = Draft::new(self);
        let groups: Vec<IdentityId> = draft.direct_groups(user_id).into_iter().collect();
        for group_id in groups {
            draft.unlink(group_id, user_id);
        }
        Ok(draft.finish(BTreeSet::from([user_id])))
    }

    /// Install a planned change. Only assigns precomputed values.
    pub fn commit(&mut self, patch: MembershipPatch) {
        if let Some(containment) = patch.containment {
            self.containment = containment;
        }
        for (group_id, users) in patch.users_of {
            if users.is_empty() {
                self.users_of.remove(&group_id);
            } else {
                self.users_of.insert(group_id, users);
            }
        }
        for (user_id, groups) in patch.groups_of_user {
            if groups.is_empty() {
                self.groups_of_user.remove(&user_id);
            } else {
                self.groups_of_user.insert(user_id, groups);
            }
        }
        let count = patch.flattened.len();
        for (user_id, closure) in patch.flattened {
            if closure.is_empty() {
                self.flattened.remove(&user_id);
            } else {
                self.flattened.insert(user_id, closure);
            }
        }
        debug!(users = count, "Flattened membership recomputed");
    }

    fn containers_of(&self, group_id: IdentityId) -> BTreeSet<IdentityId> {
        containers(&self.containment, group_id)
    }
}

/// A membership change computed against a snapshot: the replaced
/// containment graph (if edges changed), the new direct member sets and the
/// new closures of every affected user. Empty sets mean "remove".
#[derive(Debug, Default)]
pub struct MembershipPatch {
    containment: Option<DiGraphMap<IdentityId, ()>>,
    users_of: HashMap<IdentityId, BTreeSet<IdentityId>>,
    groups_of_user: HashMap<IdentityId, BTreeSet<IdentityId>>,
    flattened: Vec<(IdentityId, BTreeSet<IdentityId>)>,
}

/// Copy-on-write view over a graph used while planning
struct Draft<'a> {
    base: &'a MembershipGraph,
    containment: Option<DiGraphMap<IdentityId, ()>>,
    users_of: HashMap<IdentityId, BTreeSet<IdentityId>>,
    groups_of_user: HashMap<IdentityId, BTreeSet<IdentityId>>,
}

impl<'a> Draft<'a> {
    fn new(base: &'a MembershipGraph) -> Self {
        Self {
            base,
            containment: None,
            users_of: HashMap::new(),
            groups_of_user: HashMap::new(),
        }
    }

    fn graph(&self) -> &DiGraphMap<IdentityId, ()> {
        self.containment.as_ref().unwrap_or(&self.base.containment)
    }

    fn graph_mut(&mut self) -> &mut DiGraphMap<IdentityId, ()> {
        let base = self.base;
        self.containment
            .get_or_insert_with(|| base.containment.clone())
    }

    fn direct_users(&self, group_id: IdentityId) -> BTreeSet<IdentityId> {
        self.users_of
            .get(&group_id)
            .or_else(|| self.base.users_of.get(&group_id))
            .cloned()
            .unwrap_or_default()
    }

    fn direct_groups(&self, user_id: IdentityId) -> BTreeSet<IdentityId> {
        self.groups_of_user
            .get(&user_id)
            .or_else(|| self.base.groups_of_user.get(&user_id))
            .cloned()
            .unwrap_or_default()
    }

    fn link(&mut self, group_id: IdentityId, user_id: IdentityId) {
        let base = self.base;
        self.users_of
            .entry(group_id)
            .or_insert_with(|| base.users_of.get(&group_id).cloned().unwrap_or_default())
            .insert(user_id);
        self.groups_of_user
            .entry(user_id)
            .or_insert_with(|| base.groups_of_user.get(&user_id).cloned().unwrap_or_default())
            .insert(group_id);
    }

    fn unlink(&mut self, group_id: IdentityId, user_id: IdentityId) {
        let base = self.base;
        self.users_of
            .entry(group_id)
            .or_insert_with(|| base.users_of.get(&group_id).cloned().unwrap_or_default())
            .remove(&user_id);
        self.groups_of_user
            .entry(user_id)
            .or_insert_with(|| base.groups_of_user.get(&user_id).cloned().unwrap_or_default())
            .remove(&group_id);
    }

    /// Users whose closure can contain `group_id`: direct users of the group
    /// and of every group transitively inside it
    fn users_below(&self, group_id: IdentityId) -> BTreeSet<IdentityId> {
        let graph = self.graph();
        let mut users = BTreeSet::new();
        if !graph.contains_node(group_id) {
            return users;
        }
        let reversed = Reversed(graph);
        let mut dfs = Dfs::new(reversed, group_id);
        while let Some(node) = dfs.next(reversed) {
            users.extend(self.direct_users(node));
        }
        users
    }

    fn closure_of(&self, user_id: IdentityId) -> BTreeSet<IdentityId> {
        let graph = self.graph();
        let mut closure = BTreeSet::new();
        for group_id in self.direct_groups(user_id) {
            if !closure.contains(&group_id) && graph.contains_node(group_id) {
                closure.extend(containers(graph, group_id));
            }
        }
        closure
    }

    fn finish(self, affected: BTreeSet<IdentityId>) -> MembershipPatch {
        let flattened = affected
            .into_iter()
            .map(|user_id| (user_id, self.closure_of(user_id)))
            .collect();
        MembershipPatch {
            containment: self.containment,
            users_of: self.users_of,
            groups_of_user: self.groups_of_user,
            flattened,
        }
    }
}

/// Groups reachable from `group_id` through containment, itself included
fn containers(graph: &DiGraphMap<IdentityId, ()>, group_id: IdentityId) -> BTreeSet<IdentityId> {
    let mut out = BTreeSet::new();
    let mut dfs = Dfs::new(graph, group_id);
    while let Some(node) = dfs.next(graph) {
        out.insert(node);
    }
    out
}

fn check_ids<'a>(mut ids: impl Iterator<Item = &'a IdentityId>) -> Result<()> {
    if ids.any(|id| *id == 0) {
        return Err(SecurityError::InvalidArgument(
            "identity id must not be 0".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_flattens_to_both_groups() {
        // G1 = {U1, G2}, G2 = {U2, G1}
        let graph = MembershipGraph::load(vec![
            SecurityGroup::new(1).with_users([101]).with_groups([2]),
            SecurityGroup::new(2).with_users([102]).with_groups([1]),
        ]);

        assert_eq!(graph.flattened_groups(101), BTreeSet::from([1, 2]));
        assert_eq!(graph.flattened_groups(102), BTreeSet::from([1, 2]));
        assert!(graph.is_in_group(1, 2));
        assert!(graph.is_in_group(2, 1));
    }

    #[test]
    fn test_chain_update_reaches_indirect_users() {
        let mut graph = MembershipGraph::new();
        graph.add_members(1, &[101], &[], &[]).unwrap();
        graph.add_members(2, &[], &[1], &[]).unwrap();
        graph.add_members(3, &[], &[2], &[]).unwrap();
        assert_eq!(graph.flattened_groups(101), BTreeSet::from([1, 2, 3]));

        graph.remove_members(2, &[], &[1], &[]).unwrap();
        assert_eq!(graph.flattened_groups(101), BTreeSet::from([1]));
    }

    #[test]
    fn test_parent_group_ids_join_containers() {
        let mut graph = MembershipGraph::new();
        graph.add_members(1, &[101], &[], &[5, 6]).unwrap();
        assert!(graph.is_in_group(101, 5));
        assert!(graph.is_in_group(1, 6));
        assert_eq!(graph.parent_groups(1), BTreeSet::from([5, 6]));
        assert_eq!(graph.parent_groups(101), BTreeSet::from([1]));
    }

    #[test]
    fn test_delete_group_detaches_everything() {
        let mut graph = MembershipGraph::new();
        graph.add_members(1, &[101], &[], &[]).unwrap();
        graph.add_members(2, &[102], &[1], &[]).unwrap();
        graph.delete_group(1).unwrap();

        assert!(graph.flattened_groups(101).is_empty());
        assert_eq!(graph.flattened_groups(102), BTreeSet::from([2]));
        assert!(graph.group(1).is_none());
        assert_eq!(graph.group(2).unwrap().group_ids, BTreeSet::new());
    }

    #[test]
    fn test_user_operations() {
        let mut graph = MembershipGraph::new();
        graph.add_members(2, &[], &[1], &[]).unwrap();
        graph.add_user_to_groups(101, &[1]).unwrap();
        assert_eq!(graph.flattened_groups(101), BTreeSet::from([1, 2]));

        graph.remove_user_from_groups(101, &[1]).unwrap();
        assert!(!graph.is_in_group(101, 2));

        graph.add_user_to_groups(101, &[2]).unwrap();
        graph.delete_user(101).unwrap();
        assert!(graph.flattened_groups(101).is_empty());
        assert!(graph.group(2).unwrap().user_ids.is_empty());
    }

    #[test]
    fn test_unknown_ids_are_not_members() {
        let graph = MembershipGraph::new();
        assert!(!graph.is_in_group(7, 8));
        assert!(graph.flattened_groups(7).is_empty());
    }

    #[test]
    fn test_closure_covers_users_and_dynamic_groups() {
        let mut graph = MembershipGraph::new();
        graph.add_members(10, &[101], &[20], &[]).unwrap();
        assert_eq!(graph.closure(&[20, 30]), BTreeSet::from([10, 20, 30]));
        assert_eq!(graph.closure(&[101]), BTreeSet::from([10, 101]));
    }

    #[test]
    fn test_plan_leaves_graph_untouched_until_commit() {
        let mut graph = MembershipGraph::new();
        graph.add_members(1, &[101], &[], &[]).unwrap();
        graph.add_members(2, &[102], &[], &[]).unwrap();

        let patch = graph.plan_add_members(2, &[], &[1], &[]).unwrap();
        assert_eq!(graph.flattened_groups(101), BTreeSet::from([1]));
        assert!(!graph.is_in_group(1, 2));

        graph.commit(patch);
        assert_eq!(graph.flattened_groups(101), BTreeSet::from([1, 2]));
        assert_eq!(graph.flattened_groups(102), BTreeSet::from([2]));

        let patch = graph.plan_delete_group(1).unwrap();
        assert!(graph.group(1).is_some());
        graph.commit(patch);
        assert!(graph.group(1).is_none());
        assert!(graph.flattened_groups(101).is_empty());
    }

    #[test]
    fn test_zero_ids_are_rejected() {
        let mut graph = MembershipGraph::new();
        assert!(graph.add_members(0, &[1], &[], &[]).is_err());
        assert!(graph.add_user_to_groups(1, &[0]).is_err());
    }
}
