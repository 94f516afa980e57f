//! Database open options.
//!
//! The legacy process-wide switches (old-style revision ids, the default
//! configuration) are explicit fields here. A single process-wide
//! default is retained for convenience, but it freezes as soon as the
//! first handle opens; later mutation is an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::DEFAULT_MAX_REV_TREE_DEPTH;

/// Which revision-identity scheme a database stores. The order matters:
/// migration is only defined in the upward direction.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum VersioningScheme {
    /// Revision trees stored in the record body (2.x layout).
    RevTreesV2,
    /// Revision trees with the tree in the `extra` column (3.x layout).
    #[default]
    RevTreesV3,
    /// Version vectors.
    Vectors,
}

impl VersioningScheme {
    pub fn name(self) -> &'static str {
        match self {
            VersioningScheme::RevTreesV2 => "v2.x rev-trees",
            VersioningScheme::RevTreesV3 => "v3.x rev-trees",
            VersioningScheme::Vectors => "version vectors",
        }
    }

    pub fn is_vectors(self) -> bool {
        matches!(self, VersioningScheme::Vectors)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Create the database if it does not exist.
    pub create: bool,
    /// Fail any mutation.
    pub read_only: bool,
    /// Fail open if the stored schema would need an upgrade.
    pub no_upgrade: bool,
    pub versioning: VersioningScheme,
    /// Prune bound applied at save; at least 1.
    pub max_rev_tree_depth: u32,
    /// Generate MD5 revision ids with the historical length-byte quirk.
    pub legacy_rev_ids: bool,
    /// Explicit local peer id; a random one is assigned at create when
    /// absent. Must be nonzero.
    pub local_peer_id: Option<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            create: false,
            read_only: false,
            no_upgrade: false,
            versioning: VersioningScheme::default(),
            max_rev_tree_depth: DEFAULT_MAX_REV_TREE_DEPTH,
            legacy_rev_ids: false,
            local_peer_id: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("process-wide defaults are frozen once a database handle has opened")]
    DefaultsFrozen,

    #[error("config field {field} is invalid: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rev_tree_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "max_rev_tree_depth",
                reason: "must be at least 1",
            });
        }
        if self.local_peer_id == Some(0) {
            return Err(ConfigError::Invalid {
                field: "local_peer_id",
                reason: "0 is reserved for the local placeholder",
            });
        }
        Ok(())
    }
}

static DEFAULTS: Mutex<Option<DatabaseConfig>> = Mutex::new(None);
static FROZEN: AtomicBool = AtomicBool::new(false);

/// The process-wide default configuration, as set by
/// [`set_default_config`], or `DatabaseConfig::default()`.
pub fn default_config() -> DatabaseConfig {
    DEFAULTS
        .lock()
        .expect("defaults mutex poisoned")
        .clone()
        .unwrap_or_default()
}

/// Replaces the process-wide default configuration. Fails once any
/// database handle has been opened in this process.
pub fn set_default_config(config: DatabaseConfig) -> Result<(), ConfigError> {
    config.validate()?;
    if FROZEN.load(Ordering::Acquire) {
        return Err(ConfigError::DefaultsFrozen);
    }
    *DEFAULTS.lock().expect("defaults mutex poisoned") = Some(config);
    Ok(())
}

/// Called by `Database::open`; freezes the process-wide defaults.
pub(crate) fn freeze_defaults() {
    FROZEN.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_catches_bad_fields() {
        let mut config = DatabaseConfig::default();
        assert!(config.validate().is_ok());
        config.max_rev_tree_depth = 0;
        assert!(config.validate().is_err());

        let mut config = DatabaseConfig::default();
        config.local_peer_id = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn schemes_order_for_migration() {
        assert!(VersioningScheme::RevTreesV2 < VersioningScheme::RevTreesV3);
        assert!(VersioningScheme::RevTreesV3 < VersioningScheme::Vectors);
    }
}
