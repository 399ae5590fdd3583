//! Configuration stored in `boardclaw.toml`.
//!
//! Every field has a serde default so a partial (or absent) file works;
//! `validate()` rejects combinations that would misbehave at runtime with
//! actionable messages.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub upload: UploadConfig,
}

/// `[pool]` — worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of worker threads.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// How long an idle worker lingers before exiting (milliseconds).
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

/// `[monitor]` — hotplug tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Grace period a board may stay missing before it is dropped
    /// (milliseconds). Bridges the disconnect/reconnect of a bootloader
    /// transition.
    #[serde(default = "default_drop_delay_ms")]
    pub drop_delay_ms: u64,
}

/// `[upload]` — firmware upload behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// How long to wait for the bootloader after a reboot request before
    /// asking the user to press the button (milliseconds).
    #[serde(default = "default_reboot_delay_ms")]
    pub reboot_delay_ms: u64,

    /// Verify the firmware signature against the board model before
    /// uploading. Turning this off allows images the registry does not
    /// recognize.
    #[serde(default = "default_true")]
    pub check_firmware: bool,
}

fn default_max_threads() -> usize {
    16
}

fn default_idle_timeout_ms() -> u64 {
    10_000
}

fn default_drop_delay_ms() -> u64 {
    5_000
}

fn default_reboot_delay_ms() -> u64 {
    4_000
}

fn default_true() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            drop_delay_ms: default_drop_delay_ms(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            reboot_delay_ms: default_reboot_delay_ms(),
            check_firmware: default_true(),
        }
    }
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_threads == 0 {
            bail!("pool.max_threads must be at least 1.");
        }
        if self.pool.max_threads > 1024 {
            bail!(
                "pool.max_threads of {} exceeds the 1024 sanity limit.",
                self.pool.max_threads
            );
        }
        if self.monitor.drop_delay_ms == 0 {
            bail!("monitor.drop_delay_ms must be greater than 0; boards would be dropped on the first missed event.");
        }
        if self.upload.reboot_delay_ms == 0 {
            bail!("upload.reboot_delay_ms must be greater than 0.");
        }
        Ok(())
    }
}
