//! Mapping configuration relevant to source-only snapshots.
//!
//! The snapshot precondition lives here: a shard can only be captured as a
//! source-only snapshot if its mapping retains the complete stored source,
//! i.e. source storage is enabled and no include/exclude filters apply.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardsnapError};

/// Configuration of the stored-source field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFieldConfig {
    /// Whether the original document payload is stored at all.
    pub enabled: bool,
    /// Field path patterns kept in the stored source ("includes" filter).
    #[serde(default)]
    pub includes: Vec<String>,
    /// Field path patterns removed from the stored source ("excludes" filter).
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl Default for SourceFieldConfig {
    fn default() -> Self {
        SourceFieldConfig {
            enabled: true,
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }
}

/// The slice of an index mapping the snapshot core needs.
///
/// Supplied by the external metadata collaborator and embedded verbatim in
/// the finalized snapshot manifest so a restore can rebuild a shard with a
/// matching mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Stored-source configuration.
    pub source: SourceFieldConfig,
}

impl MappingConfig {
    /// A mapping with complete source retention.
    pub fn with_complete_source() -> Self {
        MappingConfig::default()
    }

    /// A mapping with source storage disabled.
    pub fn with_source_disabled() -> Self {
        MappingConfig {
            source: SourceFieldConfig {
                enabled: false,
                ..SourceFieldConfig::default()
            },
        }
    }

    /// Whether the mapping retains complete stored source.
    pub fn retains_complete_source(&self) -> bool {
        self.source.enabled && self.source.includes.is_empty() && self.source.excludes.is_empty()
    }

    /// Fail with the stable incomplete-source error unless complete source
    /// is retained. Checked before any file is touched on the snapshot path.
    pub fn ensure_complete_source(&self) -> Result<()> {
        if self.retains_complete_source() {
            Ok(())
        } else {
            Err(ShardsnapError::IncompleteSource)
        }
    }
}
