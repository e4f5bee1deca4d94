//! Prism: a camera frame pipeline scheduler with an isolated tuning engine.
//!
//! The pipeline runs the sensor, the ISP and an out-of-process-style tuning
//! engine in lock-step, one frame cycle at a time. The engine is only ever
//! reached through a flat call boundary ([`engine::EngineShim`]) carrying
//! scalar arrays, serialized control lists and buffer identities.

pub mod allocator;
pub mod controls;
pub mod engine;
pub mod pipeline;
pub mod wire;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allocator::AllocError;
use crate::pipeline::sizing::BufferTuning;
use crate::wire::WireError;

/// Config-file version this build understands.
pub const CONFIG_VERSION: f64 = 1.0;
/// Pipeline target the tunables are written for.
pub const CONFIG_TARGET: &str = "vc4";

/// Top-level configuration. Loaded per session; there is deliberately no
/// process-global config state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: f64,
    pub target: String,
    pub buffers: BufferTuning,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            target: CONFIG_TARGET.to_string(),
            buffers: BufferTuning::default(),
        }
    }
}

impl Config {
    /// Load and validate a TOML config file. The version and target headers
    /// guard against tunables written for a different pipeline generation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        let parsed: Config = settings.try_deserialize()?;

        if (parsed.version - CONFIG_VERSION).abs() > f64::EPSILON {
            return Err(ConfigError::UnexpectedVersion(parsed.version));
        }
        if parsed.target != CONFIG_TARGET {
            return Err(ConfigError::UnexpectedTarget(parsed.target));
        }
        parsed.buffers.validate()?;
        Ok(parsed)
    }
}

/// Fatal setup errors. Nothing here is retried; the session fails to come up.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid buffer tuning: {0}")]
    InvalidTuning(&'static str),
    #[error("control schema {id} is malformed: {source}")]
    MalformedInfoMap { id: u32, source: WireError },
    #[error("unsupported config version {0}")]
    UnexpectedVersion(f64),
    #[error("config written for target {0:?}, this build wants {CONFIG_TARGET:?}")]
    UnexpectedTarget(String),
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("lens-shading table allocation failed: {0}")]
    Table(#[from] AllocError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.buffers.validate().is_ok());
        assert_eq!(config.target, CONFIG_TARGET);
    }

    #[test]
    fn config_file_round_trips() {
        let file = write_config(
            "version = 1.0\ntarget = \"vc4\"\n\n[buffers]\nmin_working_set = 2\nmin_combined = 6\n",
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.buffers.min_combined, 6);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let file = write_config(
            "version = 2.0\ntarget = \"vc4\"\n\n[buffers]\nmin_working_set = 2\nmin_combined = 4\n",
        );
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::UnexpectedVersion(_))
        ));
    }

    #[test]
    fn wrong_target_is_rejected() {
        let file = write_config(
            "version = 1.0\ntarget = \"pisp\"\n\n[buffers]\nmin_working_set = 2\nmin_combined = 4\n",
        );
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::UnexpectedTarget(_))
        ));
    }

    #[test]
    fn invalid_tuning_in_file_is_rejected() {
        let file = write_config(
            "version = 1.0\ntarget = \"vc4\"\n\n[buffers]\nmin_working_set = 4\nmin_combined = 2\n",
        );
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::InvalidTuning(_))
        ));
    }
}
