//! Service configuration.
//!
//! A config is fixed for the lifetime of a [`crate::ContextGroup`]. Every resource manager
//! captures the values it needs at construction.

use bitflags::bitflags;
use gpucmd_protocol::Capability;
use serde::{Deserialize, Serialize};
use thiserror::Error;

bitflags! {
    /// Optional features. Disabled features turn their opcodes into unknown commands and their
    /// enums into `GL_INVALID_ENUM`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FeatureSet: u32 {
        const MAILBOX = 1 << 0;
        const SYNC_POINTS = 1 << 1;
        const OCCLUSION_QUERY = 1 << 2;
        const COMMANDS_ISSUED_QUERY = 1 << 3;
        const COMMANDS_COMPLETED_QUERY = 1 << 4;
        const ASYNC_PIXEL_TRANSFERS = 1 << 5;
        const IMAGES = 1 << 6;
        const TEXTURE_EXTERNAL = 1 << 7;
        const TEXTURE_RECTANGLE = 1 << 8;
    }
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FeatureSet {
    pub fn supports(self, capability: Capability) -> bool {
        match capability {
            Capability::Mailbox => self.contains(Self::MAILBOX),
            Capability::SyncPoints => self.contains(Self::SYNC_POINTS),
            Capability::AsyncPixelTransfers => self.contains(Self::ASYNC_PIXEL_TRANSFERS),
            Capability::Images => self.contains(Self::IMAGES),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Uploads run from `process_more_pending_transfers` on the decoder thread.
    #[default]
    Idle,
    /// Uploads run on a dedicated worker thread.
    Threaded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind_generates_resource: bool,
    pub max_texture_size: u32,
    pub max_cube_map_texture_size: u32,
    pub max_renderbuffer_size: u32,
    pub max_texture_units: u32,
    /// Largest `BufferData` size in bytes. Larger requests fail with `GL_OUT_OF_MEMORY` before
    /// reaching the backend.
    pub max_buffer_size: u32,
    pub features: FeatureSet,
    pub transfer_mode: TransferMode,
    /// Transfers advanced per `process_more_pending_transfers` call in idle mode.
    pub idle_transfer_budget: usize,
    /// Snapshots retained per shared texture group in synchronized mailbox mode.
    pub max_snapshot_history: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_generates_resource: true,
            max_texture_size: 4096,
            max_cube_map_texture_size: 4096,
            max_renderbuffer_size: 4096,
            max_texture_units: 8,
            max_buffer_size: 256 << 20,
            features: FeatureSet::all(),
            transfer_mode: TransferMode::Idle,
            idle_transfer_budget: 4,
            max_snapshot_history: 16,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

impl ServiceConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, size) in [
            ("max_texture_size", self.max_texture_size),
            ("max_cube_map_texture_size", self.max_cube_map_texture_size),
            ("max_renderbuffer_size", self.max_renderbuffer_size),
        ] {
            if size == 0 || !size.is_power_of_two() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be a non-zero power of two",
                });
            }
        }
        if !(1..=32).contains(&self.max_texture_units) {
            return Err(ConfigError::Invalid {
                field: "max_texture_units",
                reason: "must be between 1 and 32",
            });
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_buffer_size",
                reason: "must be at least 1",
            });
        }
        if self.idle_transfer_budget == 0 {
            return Err(ConfigError::Invalid {
                field: "idle_transfer_budget",
                reason: "must be at least 1",
            });
        }
        if self.max_snapshot_history == 0 {
            return Err(ConfigError::Invalid {
                field: "max_snapshot_history",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Number of mip levels addressable for a base size.
    pub fn max_levels(size: u32) -> u32 {
        32 - size.leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_json_yields_defaults() {
        assert_eq!(ServiceConfig::from_json_str("{}").unwrap(), ServiceConfig::default());
    }

    #[test]
    fn parses_features_by_name() {
        let config = ServiceConfig::from_json_str(
            r#"{"bind_generates_resource": false, "features": "MAILBOX | SYNC_POINTS", "transfer_mode": "threaded"}"#,
        )
        .unwrap();
        assert!(!config.bind_generates_resource);
        assert_eq!(config.features, FeatureSet::MAILBOX | FeatureSet::SYNC_POINTS);
        assert_eq!(config.transfer_mode, TransferMode::Threaded);
        assert!(!config.features.supports(Capability::Images));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = ServiceConfig::from_json_str(r#"{"max_texture_size": 1000}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_texture_size", .. }));
        let err = ServiceConfig::from_json_str(r#"{"max_texture_units": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_texture_units", .. }));
        let err = ServiceConfig::from_json_str(r#"{"max_buffer_size": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_buffer_size", .. }));
        assert!(matches!(
            ServiceConfig::from_json_str("not json").unwrap_err(),
            ConfigError::Json(_)
        ));
    }

    #[test]
    fn max_levels_counts_the_base_level() {
        assert_eq!(ServiceConfig::max_levels(1), 1);
        assert_eq!(ServiceConfig::max_levels(4096), 13);
    }
}
