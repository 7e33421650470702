//! Coalesced ACL view returned by `get_acl`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use treeacl_core::types::{
    AceInfo, AceKey, EntityId, EntryType, IdentityId, PermissionBitMask, PermissionValue,
};

/// Effective entry of one identity on one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlEntry {
    pub identity_id: IdentityId,
    pub entry_type: EntryType,
    pub local_only: bool,
    pub allow_bits: u64,
    pub deny_bits: u64,
    /// Bit index -> entity whose entry allowed it
    pub allow_from: BTreeMap<u8, EntityId>,
    /// Bit index -> entity whose entry denied it
    pub deny_from: BTreeMap<u8, EntityId>,
}

impl AccessControlEntry {
    pub(crate) fn new(key: AceKey) -> Self {
        Self {
            identity_id: key.identity_id,
            entry_type: key.entry_type,
            local_only: key.local_only,
            allow_bits: 0,
            deny_bits: 0,
            allow_from: BTreeMap::new(),
            deny_from: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> AceKey {
        AceKey::new(self.identity_id, self.entry_type, self.local_only)
    }

    pub fn mask(&self) -> PermissionBitMask {
        PermissionBitMask::new(self.allow_bits, self.deny_bits)
    }

    pub fn value_of(&self, index: u8) -> PermissionValue {
        self.mask().value_of(index)
    }

    /// Plain entry carrying the effective masks
    pub fn to_ace(&self) -> AceInfo {
        AceInfo {
            identity_id: self.identity_id,
            entry_type: self.entry_type,
            local_only: self.local_only,
            allow_bits: self.allow_bits,
            deny_bits: self.deny_bits,
        }
    }
}

/// Effective access control list of one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlList {
    pub entity_id: EntityId,
    /// `false` when the entity itself is a break point
    pub inherits: bool,
    /// Sorted by entry type, identity, locality
    pub entries: Vec<AccessControlEntry>,
}

impl AccessControlList {
    /// Effective entry of an identity
    pub fn entry(&self, identity_id: IdentityId, entry_type: EntryType, local_only: bool) -> Option<&AccessControlEntry> {
        let key = AceKey::new(identity_id, entry_type, local_only);
        self.entries.iter().find(|e| e.key() == key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_aces(&self) -> Vec<AceInfo> {
        self.entries.iter().map(AccessControlEntry::to_ace).collect()
    }
}
