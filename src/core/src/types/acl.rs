//! Stored access control lists and entries

use super::{EntityId, IdentityId, PermissionBitMask};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of an access control entry.
///
/// Categories are evaluated and normalized independently; an editor
/// operation never mixes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryType {
    Normal,
    Sharing,
}

impl EntryType {
    pub const ALL: [EntryType; 2] = [EntryType::Normal, EntryType::Sharing];
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Normal => write!(f, "normal"),
            EntryType::Sharing => write!(f, "sharing"),
        }
    }
}

/// Uniqueness key of an entry within one ACL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AceKey {
    pub entry_type: EntryType,
    pub identity_id: IdentityId,
    pub local_only: bool,
}

impl AceKey {
    pub fn new(identity_id: IdentityId, entry_type: EntryType, local_only: bool) -> Self {
        Self {
            entry_type,
            identity_id,
            local_only,
        }
    }
}

/// Access control entry: one identity's bitmask pair on one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AceInfo {
    pub identity_id: IdentityId,
    pub entry_type: EntryType,
    /// Visible only on the holder entity, never inherited
    pub local_only: bool,
    pub allow_bits: u64,
    pub deny_bits: u64,
}

impl AceInfo {
    pub fn new(identity_id: IdentityId, entry_type: EntryType, local_only: bool) -> Self {
        Self {
            identity_id,
            entry_type,
            local_only,
            allow_bits: 0,
            deny_bits: 0,
        }
    }

    pub fn key(&self) -> AceKey {
        AceKey::new(self.identity_id, self.entry_type, self.local_only)
    }

    pub fn mask(&self) -> PermissionBitMask {
        PermissionBitMask::new(self.allow_bits, self.deny_bits)
    }

    pub fn set_mask(&mut self, mask: PermissionBitMask) {
        self.allow_bits = mask.allow_bits;
        self.deny_bits = mask.deny_bits;
    }

    pub fn is_empty(&self) -> bool {
        self.allow_bits == 0 && self.deny_bits == 0
    }
}

/// Stored ACL attached to one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclInfo {
    pub holder_entity_id: EntityId,
    pub inherits: bool,
    /// Unique by [`AceKey`], kept sorted by it
    pub entries: Vec<AceInfo>,
}

impl AclInfo {
    pub fn new(holder_entity_id: EntityId, inherits: bool) -> Self {
        Self {
            holder_entity_id,
            inherits,
            entries: Vec::new(),
        }
    }

    pub fn entry(&self, key: &AceKey) -> Option<&AceInfo> {
        self.entries
            .binary_search_by(|e| e.key().cmp(key))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Entry for `key`, inserted empty when missing
    pub fn entry_mut(&mut self, key: AceKey) -> &mut AceInfo {
        let index = match self.entries.binary_search_by(|e| e.key().cmp(&key)) {
            Ok(i) => i,
            Err(i) => {
                self.entries.insert(
                    i,
                    AceInfo::new(key.identity_id, key.entry_type, key.local_only),
                );
                i
            }
        };
        &mut self.entries[index]
    }

    /// Insert or replace an entry, keeping the sort order
    pub fn upsert(&mut self, entry: AceInfo) {
        let key = entry.key();
        match self.entries.binary_search_by(|e| e.key().cmp(&key)) {
            Ok(i) => self.entries[i] = entry,
            Err(i) => self.entries.insert(i, entry),
        }
    }

    /// Drop entries whose masks are both zero
    pub fn remove_empty_entries(&mut self) {
        self.entries.retain(|e| !e.is_empty());
    }

    /// A holder anchors effective-permission resolution: it is a break point
    /// or carries at least one entry.
    pub fn is_holder(&self) -> bool {
        !self.inherits || !self.entries.is_empty()
    }

    /// An inheriting ACL with no entries carries no information.
    pub fn is_removable(&self) -> bool {
        self.inherits && self.entries.is_empty()
    }

    /// Sort entries by key; used after bulk loads.
    pub fn normalize_order(&mut self) {
        self.entries.sort_by_key(|e| e.key());
        self.entries.dedup_by_key(|e| e.key());
    }
}

/// Entry row as persisted by a data provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAce {
    pub entity_id: EntityId,
    pub entry: AceInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_stay_sorted_and_unique() {
        let mut acl = AclInfo::new(1, true);
        acl.entry_mut(AceKey::new(7, EntryType::Normal, false)).allow_bits = 1;
        acl.entry_mut(AceKey::new(3, EntryType::Normal, false)).allow_bits = 2;
        acl.entry_mut(AceKey::new(7, EntryType::Normal, false)).deny_bits = 4;
        acl.entry_mut(AceKey::new(3, EntryType::Sharing, false)).allow_bits = 8;

        assert_eq!(acl.entries.len(), 3);
        let keys: Vec<_> = acl.entries.iter().map(|e| e.key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        let seven = acl.entry(&AceKey::new(7, EntryType::Normal, false)).unwrap();
        assert_eq!((seven.allow_bits, seven.deny_bits), (1, 4));
    }

    #[test]
    fn test_holder_and_removable() {
        let mut acl = AclInfo::new(1, true);
        assert!(!acl.is_holder());
        assert!(acl.is_removable());

        acl.inherits = false;
        assert!(acl.is_holder(), "an empty break is still a holder");
        assert!(!acl.is_removable());

        acl.inherits = true;
        acl.entry_mut(AceKey::new(5, EntryType::Normal, true));
        acl.remove_empty_entries();
        assert!(acl.entries.is_empty());
    }
}
