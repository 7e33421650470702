//! Cache configuration loading and validation

use serde::{Deserialize, Serialize};
use std::path::Path;
use treeacl_core::error::{Result, SecurityError};
use treeacl_core::types::{IdentityId, PermissionType, PermissionTypeRegistry};

/// Complete cache configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Identity that passes every permission check
    #[serde(default)]
    pub system_user_id: Option<IdentityId>,

    /// Group every principal implicitly belongs to during evaluation
    #[serde(default)]
    pub everyone_group_id: Option<IdentityId>,

    /// Pseudo-group a principal joins while it owns the evaluated entity
    #[serde(default)]
    pub owner_group_id: Option<IdentityId>,

    /// Host permission registry
    #[serde(default)]
    pub permissions: Vec<PermissionType>,

    #[serde(default)]
    pub activity: ActivitySection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActivitySection {
    /// Maximum activities fetched from the log per gap-fill round
    #[serde(default = "default_gap_batch")]
    pub gap_load_batch_size: usize,

    /// Period of the background gap check, 0 disables it
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,
}

impl Default for ActivitySection {
    fn default() -> Self {
        Self {
            gap_load_batch_size: default_gap_batch(),
            health_check_interval_ms: default_health_interval(),
        }
    }
}

fn default_gap_batch() -> usize {
    100
}

fn default_health_interval() -> u64 {
    30_000
}

impl SecurityConfig {
    /// Load and validate a TOML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: SecurityConfig = toml::from_str(contents)
            .map_err(|e| SecurityError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.activity.gap_load_batch_size == 0 {
            return Err(SecurityError::Configuration(
                "activity.gap_load_batch_size must be positive".to_string(),
            ));
        }

        for (name, id) in [
            ("system_user_id", self.system_user_id),
            ("everyone_group_id", self.everyone_group_id),
            ("owner_group_id", self.owner_group_id),
        ] {
            if id == Some(0) {
                return Err(SecurityError::Configuration(format!(
                    "{} must not be the zero id",
                    name
                )));
            }
        }

        if self.everyone_group_id.is_some() && self.everyone_group_id == self.owner_group_id {
            return Err(SecurityError::Configuration(
                "everyone and owner groups must differ".to_string(),
            ));
        }

        self.registry().map(|_| ())
    }

    /// Build the permission registry
    pub fn registry(&self) -> Result<PermissionTypeRegistry> {
        PermissionTypeRegistry::new(self.permissions.iter().cloned())
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = PermissionType>) -> Self {
        self.permissions = permissions.into_iter().collect();
        self
    }

    pub fn with_everyone_group(mut self, group_id: IdentityId) -> Self {
        self.everyone_group_id = Some(group_id);
        self
    }

    pub fn with_owner_group(mut self, group_id: IdentityId) -> Self {
        self.owner_group_id = Some(group_id);
        self
    }

    pub fn with_system_user(mut self, user_id: IdentityId) -> Self {
        self.system_user_id = Some(user_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        everyone_group_id = 8
        owner_group_id = 9

        [[permissions]]
        index = 0
        name = "See"

        [[permissions]]
        index = 1
        name = "Preview"

        [activity]
        gap_load_batch_size = 25
    "#;

    #[test]
    fn test_parse_sample() {
        let config = SecurityConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.everyone_group_id, Some(8));
        assert_eq!(config.owner_group_id, Some(9));
        assert_eq!(config.system_user_id, None);
        assert_eq!(config.activity.gap_load_batch_size, 25);
        assert_eq!(config.activity.health_check_interval_ms, 30_000);

        let registry = config.registry().unwrap();
        assert_eq!(registry.by_name("Preview").map(|p| p.index), Some(1));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = SecurityConfig::from_toml_str("").unwrap();
        assert_eq!(config, SecurityConfig::default());
        assert_eq!(config.activity.gap_load_batch_size, 100);
        assert_eq!(config.activity.health_check_interval_ms, 30_000);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(SecurityConfig::from_toml_str("system_user_id = 0").is_err());
        assert!(SecurityConfig::from_toml_str(
            "everyone_group_id = 4\nowner_group_id = 4"
        )
        .is_err());
        assert!(SecurityConfig::from_toml_str("[activity]\ngap_load_batch_size = 0").is_err());
        assert!(SecurityConfig::from_toml_str(
            "[[permissions]]\nindex = 70\nname = \"Huge\""
        )
        .is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = SecurityConfig::load(file.path()).unwrap();
        assert_eq!(config.permissions.len(), 2);
    }
}
