//! Permission descriptors and the 64-bit allow/deny bitmask

use crate::error::{Result, SecurityError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::ops::BitOr;

/// Number of permission bits carried by a mask
pub const PERMISSION_COUNT: u8 = 64;

/// Immutable permission descriptor defined by the host application.
///
/// The core never interprets the name; it only uses the bit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionType {
    /// Bit index, `0..64`
    pub index: u8,
    /// Human readable name, used in `AccessDenied` reports
    pub name: Cow<'static, str>,
}

impl PermissionType {
    /// Declare a permission type. Usable in `const` items.
    pub const fn new(index: u8, name: &'static str) -> Self {
        Self {
            index,
            name: Cow::Borrowed(name),
        }
    }

    /// Single-bit mask of this permission
    pub fn mask(&self) -> u64 {
        1u64 << self.index
    }

    /// Combined mask of a permission list
    pub fn mask_of(permissions: &[PermissionType]) -> u64 {
        permissions.iter().fold(0, |acc, p| acc | p.mask())
    }
}

impl fmt::Display for PermissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Host-defined permission registry (name <-> bit index)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionTypeRegistry {
    by_index: Vec<Option<PermissionType>>,
}

impl PermissionTypeRegistry {
    /// Build a registry, rejecting out-of-range or duplicated indices and names.
    pub fn new(types: impl IntoIterator<Item = PermissionType>) -> Result<Self> {
        let mut by_index = vec![None; PERMISSION_COUNT as usize];
        let mut names = HashSet::new();

        for permission in types {
            if permission.index >= PERMISSION_COUNT {
                return Err(SecurityError::Configuration(format!(
                    "permission '{}' has index {} (max {})",
                    permission.name,
                    permission.index,
                    PERMISSION_COUNT - 1
                )));
            }
            if !names.insert(permission.name.clone()) {
                return Err(SecurityError::Configuration(format!(
                    "duplicate permission name '{}'",
                    permission.name
                )));
            }
            let slot = &mut by_index[permission.index as usize];
            if slot.is_some() {
                return Err(SecurityError::Configuration(format!(
                    "duplicate permission index {}",
                    permission.index
                )));
            }
            *slot = Some(permission);
        }

        Ok(Self { by_index })
    }

    /// Look up a permission by bit index
    pub fn by_index(&self, index: u8) -> Option<&PermissionType> {
        self.by_index.get(index as usize).and_then(Option::as_ref)
    }

    /// Look up a permission by name
    pub fn by_name(&self, name: &str) -> Option<&PermissionType> {
        self.by_index.iter().flatten().find(|p| p.name == name)
    }

    /// Names of every bit in `mask`, lowest bit first.
    ///
    /// Bits without a registered type are reported as `#<index>`.
    pub fn names_of(&self, mask: u64) -> Vec<String> {
        let mut names = Vec::with_capacity(mask.count_ones() as usize);
        let mut bits = mask;
        while bits != 0 {
            let index = bits.trailing_zeros() as u8;
            names.push(match self.by_index(index) {
                Some(p) => p.name.to_string(),
                None => format!("#{}", index),
            });
            bits &= bits - 1;
        }
        names
    }

    /// Number of registered permissions
    pub fn len(&self) -> usize {
        self.by_index.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolved state of a single permission bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionValue {
    Undefined,
    Allowed,
    Denied,
}

/// Independent allow and deny bit sets.
///
/// A bit may be set on both sides at the raw level; evaluation always
/// resolves such a bit to [`PermissionValue::Denied`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionBitMask {
    pub allow_bits: u64,
    pub deny_bits: u64,
}

impl PermissionBitMask {
    pub const EMPTY: PermissionBitMask = PermissionBitMask {
        allow_bits: 0,
        deny_bits: 0,
    };

    pub fn new(allow_bits: u64, deny_bits: u64) -> Self {
        Self {
            allow_bits,
            deny_bits,
        }
    }

    /// Mask allowing exactly `bits`
    pub fn allowing(bits: u64) -> Self {
        Self::new(bits, 0)
    }

    /// Mask denying exactly `bits`
    pub fn denying(bits: u64) -> Self {
        Self::new(0, bits)
    }

    /// OR both sides of `other` into `self`
    pub fn combine(&mut self, other: PermissionBitMask) {
        self.allow_bits |= other.allow_bits;
        self.deny_bits |= other.deny_bits;
    }

    /// Allow `bits`, removing them from the deny side
    pub fn allow(&mut self, bits: u64) {
        self.allow_bits |= bits;
        self.deny_bits &= !bits;
    }

    /// Deny `bits`, removing them from the allow side
    pub fn deny(&mut self, bits: u64) {
        self.deny_bits |= bits;
        self.allow_bits &= !bits;
    }

    /// Remove `bits` from both sides
    pub fn clear(&mut self, bits: u64) {
        self.allow_bits &= !bits;
        self.deny_bits &= !bits;
    }

    /// Bits that are set on either side
    pub fn touched(&self) -> u64 {
        self.allow_bits | self.deny_bits
    }

    /// Bits that resolve to allowed (allowed and not denied)
    pub fn effective_allow(&self) -> u64 {
        self.allow_bits & !self.deny_bits
    }

    pub fn is_empty(&self) -> bool {
        self.allow_bits == 0 && self.deny_bits == 0
    }

    /// Resolve one bit index, deny over allow. Indexes past the mask width
    /// are undefined.
    pub fn value_of(&self, index: u8) -> PermissionValue {
        let Some(bit) = 1u64.checked_shl(u32::from(index)) else {
            return PermissionValue::Undefined;
        };
        if self.deny_bits & bit != 0 {
            PermissionValue::Denied
        } else if self.allow_bits & bit != 0 {
            PermissionValue::Allowed
        } else {
            PermissionValue::Undefined
        }
    }
}

impl BitOr for PermissionBitMask {
    type Output = PermissionBitMask;

    fn bitor(mut self, rhs: PermissionBitMask) -> PermissionBitMask {
        self.combine(rhs);
        self
    }
}

impl fmt::Display for PermissionBitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:016x} -{:016x}", self.allow_bits, self.deny_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEE: PermissionType = PermissionType::new(0, "See");
    const PREVIEW: PermissionType = PermissionType::new(1, "Preview");
    const OPEN: PermissionType = PermissionType::new(2, "Open");

    #[test]
    fn test_mask_of() {
        assert_eq!(PermissionType::mask_of(&[SEE, OPEN]), 0b101);
        assert_eq!(PermissionType::mask_of(&[]), 0);
    }

    #[test]
    fn test_allow_then_deny_moves_bit() {
        let mut mask = PermissionBitMask::default();
        mask.allow(SEE.mask() | PREVIEW.mask());
        mask.deny(SEE.mask());

        assert_eq!(mask.allow_bits, PREVIEW.mask());
        assert_eq!(mask.deny_bits, SEE.mask());

        mask.clear(SEE.mask());
        assert_eq!(mask.deny_bits, 0);
        assert_eq!(mask.allow_bits, PREVIEW.mask());
    }

    #[test]
    fn test_combine_is_independent_or() {
        let a = PermissionBitMask::new(0b001, 0b100);
        let b = PermissionBitMask::new(0b100, 0b010);
        let c = a | b;
        assert_eq!(c.allow_bits, 0b101);
        assert_eq!(c.deny_bits, 0b110);
        // raw masks may overlap, resolution prefers deny
        assert_eq!(c.value_of(2), PermissionValue::Denied);
        assert_eq!(c.value_of(0), PermissionValue::Allowed);
        assert_eq!(c.value_of(5), PermissionValue::Undefined);
        assert_eq!(c.effective_allow(), 0b001);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        assert!(PermissionTypeRegistry::new([SEE, PermissionType::new(0, "Other")]).is_err());
        assert!(PermissionTypeRegistry::new([SEE, PermissionType::new(3, "See")]).is_err());
        assert!(PermissionTypeRegistry::new([PermissionType::new(64, "Overflow")]).is_err());
    }

    #[test]
    fn test_registry_names() {
        let registry = PermissionTypeRegistry::new([SEE, PREVIEW, OPEN]).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.by_name("Open"), Some(&OPEN));
        assert_eq!(
            registry.names_of(SEE.mask() | OPEN.mask() | (1 << 9)),
            vec!["See".to_string(), "Open".to_string(), "#9".to_string()]
        );
        assert_eq!(registry.names_of(1 << 63), vec!["#63".to_string()]);
        assert!(registry.names_of(0).is_empty());
    }

    #[test]
    fn test_value_of_out_of_range_index() {
        let mask = PermissionBitMask {
            allow_bits: u64::MAX,
            deny_bits: 0,
        };
        assert_eq!(mask.value_of(63), PermissionValue::Allowed);
        assert_eq!(mask.value_of(64), PermissionValue::Undefined);
        assert_eq!(mask.value_of(200), PermissionValue::Undefined);
    }
}
