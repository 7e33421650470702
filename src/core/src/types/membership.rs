//! Raw group membership records

use super::IdentityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A security group with its direct members, as loaded from the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: IdentityId,
    /// Users that are direct members
    pub user_ids: BTreeSet<IdentityId>,
    /// Groups that are direct members
    pub group_ids: BTreeSet<IdentityId>,
}

impl SecurityGroup {
    pub fn new(id: IdentityId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn with_users(mut self, users: impl IntoIterator<Item = IdentityId>) -> Self {
        self.user_ids.extend(users);
        self
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = IdentityId>) -> Self {
        self.group_ids.extend(groups);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty() && self.group_ids.is_empty()
    }
}
