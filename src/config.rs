// Runtime configuration for the firmware pipeline.
//
// Every section has sensible defaults for an embedded Linux router and can be overridden from a
// JSON file; missing keys fall back to the defaults.

use crate::tftp;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Well-known TFTP server port.
pub const DEFAULT_TFTP_PORT: u16 = 69;

/// Settings for a TFTP client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub port: u16,

    /// Receive timeout for every packet.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Number of times a failed transfer is restarted from scratch.
    pub retries: u32,

    pub block_size: usize,
}

impl TftpConfig {
    /// Quick reachability check.
    pub fn for_connection_test() -> TftpConfig {
        TftpConfig {
            port: DEFAULT_TFTP_PORT,
            timeout: Duration::from_secs(5),
            retries: 3,
            block_size: tftp::DEFAULT_BLOCK_SIZE,
        }
    }

    /// Full firmware download.
    pub fn for_download() -> TftpConfig {
        TftpConfig {
            timeout: Duration::from_secs(15),
            retries: 5,
            ..TftpConfig::for_connection_test()
        }
    }

    pub fn effective_block_size(&self) -> usize {
        self.block_size
            .clamp(tftp::MIN_BLOCK_SIZE, tftp::MAX_BLOCK_SIZE)
    }
}

impl Default for TftpConfig {
    fn default() -> Self {
        TftpConfig::for_download()
    }
}

/// Settings for manual firmware uploads.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Each upload gets its own subdirectory in here.
    pub upload_dir: PathBuf,
    pub max_file_size: u64,
    /// How many uploads survive a cleanup.
    pub retention: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            upload_dir: PathBuf::from("/tmp/firmware_uploads"),
            max_file_size: 32 * 1024 * 1024,
            retention: 3,
        }
    }
}

/// Settings for the upgrade orchestrator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Name (looked up on PATH) or absolute path of the flashing tool.
    pub tool: String,

    /// Where the tool's output log lives and where free space is checked.
    pub scratch_dir: PathBuf,

    /// Last known progress, rewritten on every update.
    pub recovery_file: PathBuf,

    /// Destination of the configuration backup taken when config is preserved.
    pub backup_file: PathBuf,

    /// Pause between a successful flash and the reboot stage completing.
    #[serde(with = "duration_secs")]
    pub settle_delay: Duration,

    /// Used to compute the estimated completion time shown to the user.
    #[serde(with = "duration_secs")]
    pub estimated_duration: Duration,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        UpgradeConfig {
            tool: "sysupgrade".to_string(),
            scratch_dir: PathBuf::from("/tmp"),
            recovery_file: PathBuf::from("/tmp/sysupgrade_progress.json"),
            backup_file: PathBuf::from("/tmp/sysupgrade_backup.tar.gz"),
            settle_delay: Duration::from_secs(2),
            estimated_duration: Duration::from_secs(300),
        }
    }
}

/// Top level of a configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub upload: UploadConfig,
    pub upgrade: UpgradeConfig,
}

impl Config {
    pub fn from_json(text: &str) -> Result<Config, serde_json::Error> {
        serde_json::from_str(text)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tftp_presets() {
        let check = TftpConfig::for_connection_test();
        assert_eq!(check.port, 69);
        assert_eq!(check.timeout, Duration::from_secs(5));
        assert_eq!(check.retries, 3);

        let download = TftpConfig::for_download();
        assert_eq!(download.timeout, Duration::from_secs(15));
        assert_eq!(download.retries, 5);
        assert_eq!(download.block_size, 512);
    }

    #[test]
    fn test_block_size_is_clamped() {
        let mut config = TftpConfig::default();
        config.block_size = 100_000;
        assert_eq!(config.effective_block_size(), 65464);
        config.block_size = 1;
        assert_eq!(config.effective_block_size(), 8);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json(
            r#"{ "upgrade": { "tool": "/sbin/sysupgrade", "settle_delay": 0.5 }, "upload": { "retention": 5 } }"#,
        )
        .unwrap();

        assert_eq!(config.upgrade.tool, "/sbin/sysupgrade");
        assert_eq!(config.upgrade.settle_delay, Duration::from_millis(500));
        assert_eq!(config.upgrade.scratch_dir, PathBuf::from("/tmp"));
        assert_eq!(config.upload.retention, 5);
        assert_eq!(config.upload.max_file_size, 32 * 1024 * 1024);
    }
}
