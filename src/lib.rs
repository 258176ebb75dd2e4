//! Firmware acquisition and installation for a network appliance.
//!
//! Images arrive either over TFTP ([`client::TftpClient`]) or as a manual upload
//! ([`upload::UploadIngest`]), are checked by [`validator`] and are then flashed by
//! [`upgrade::SysupgradeOrchestrator`], which reports staged progress while it runs.

mod callback;

pub mod client;
pub mod config;
pub mod processor;
pub mod progress;
pub mod tftp;
pub mod upgrade;
pub mod upload;
pub mod validator;

pub use client::{TftpClient, TftpError, TftpProgress};
pub use config::{Config, TftpConfig, UpgradeConfig, UploadConfig};
pub use progress::{Stage, UpgradeProgress, UpgradeStatus};
pub use upgrade::{SysupgradeOrchestrator, UpgradeError};
pub use upload::{UploadIngest, UploadInfo};
