use std::{env, path::PathBuf};

use log::LevelFilter;
use thiserror::Error;

pub const FRAMES_VAR: &str = "APEX_FRAMES";
pub const LOG_VAR: &str = "APEX_LOG";
pub const MEMORY_FILE_VAR: &str = "APEX_MEMORY_FILE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("APEX_FRAMES must be a frame count, got {0:?}")]
    Frames(String),
    #[error("APEX_LOG must be a log level, got {0:?}")]
    LogLevel(String),
}

/// Boot parameters of the simulated machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    /// 4MiB frames of RAM.
    pub physical_frames: usize,
    /// Frames at the bottom of RAM holding the kernel, mapped 1:1 at boot.
    pub kernel_frames: usize,
    pub log_level: LevelFilter,
    /// Back RAM with this file instead of anonymous memory.
    pub memory_file: Option<PathBuf>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            physical_frames: 16,
            kernel_frames: 1,
            log_level: LevelFilter::Info,
            memory_file: None,
        }
    }
}

impl BootConfig {
    /// The defaults, overridden by `APEX_FRAMES`, `APEX_LOG` and `APEX_MEMORY_FILE` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(
            env::var(FRAMES_VAR).ok(),
            env::var(LOG_VAR).ok(),
            env::var_os(MEMORY_FILE_VAR).map(PathBuf::from),
        )
    }

    pub fn from_vars(
        frames: Option<String>,
        level: Option<String>,
        memory_file: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self {
            memory_file,
            ..Self::default()
        };

        if let Some(frames) = frames {
            config.physical_frames = frames
                .trim()
                .parse()
                .map_err(|_| ConfigError::Frames(frames.clone()))?;
        }
        if let Some(level) = level {
            config.log_level = level
                .trim()
                .parse()
                .map_err(|_| ConfigError::LogLevel(level.clone()))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_vars_keep_defaults() {
        assert_eq!(BootConfig::from_vars(None, None, None).unwrap(), BootConfig::default());
    }

    #[test]
    fn vars_override_defaults() {
        let config = BootConfig::from_vars(
            Some("32".into()),
            Some("trace".into()),
            Some(PathBuf::from("/tmp/ram.img")),
        )
        .unwrap();
        assert_eq!(config.physical_frames, 32);
        assert_eq!(config.log_level, LevelFilter::Trace);
        assert_eq!(config.kernel_frames, 1);
        assert_eq!(config.memory_file, Some(PathBuf::from("/tmp/ram.img")));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            BootConfig::from_vars(Some("lots".into()), None, None),
            Err(ConfigError::Frames(_))
        ));
        assert!(matches!(
            BootConfig::from_vars(None, Some("loud".into()), None),
            Err(ConfigError::LogLevel(_))
        ));
    }
}
