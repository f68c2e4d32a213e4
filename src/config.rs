// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: TOML configuration for the collector and the daemon binary.
// Author: Lukas Bower

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::Baseband;
use crate::recording::UploadTarget;
use crate::sinks::SinkKind;

/// Errors loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("read {path}: {source}")]
    Io {
        /// Configuration file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// TOML syntax or schema error.
    #[error("parse {path}: {source}")]
    Parse {
        /// Configuration file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// Semantically invalid value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Polling and recording settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Poll period per (device, CPU) task.
    pub polling_interval_ms: u64,
    /// Directory receiving recordings.
    pub target_dir: PathBuf,
    /// Rotation threshold per file; 0 disables rotation.
    pub max_file_size_mb: u64,
    /// Closed recordings kept on disk; 0 keeps everything.
    pub max_retained_files: usize,
    /// Drain the buffer even before the firmware reports ready.
    pub poll_before_fw_ready: bool,
    /// Directory holding `fw_strings.bin` / `ucode_strings.bin`.
    pub string_table_dir: Option<PathBuf>,
    /// Sinks started for every device as soon as it is added.
    pub auto_start: Vec<SinkKind>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 100,
            target_dir: PathBuf::from("/var/log/fwlogd"),
            max_file_size_mb: 10,
            max_retained_files: 0,
            poll_before_fw_ready: false,
            string_table_dir: None,
            auto_start: Vec::new(),
        }
    }
}

/// Compression and upload of closed recordings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostCollectionConfig {
    /// Compress closed recordings.
    pub compress: bool,
    /// Compressor invoked as `<tool> <file>`.
    pub compression_tool: String,
    /// Extension the compressor appends.
    pub compressed_extension: String,
    /// Upload closed recordings.
    pub upload: bool,
    /// Upload host.
    pub upload_host: String,
    /// Upload user.
    pub upload_user: String,
    /// Remote directory.
    pub upload_remote_path: String,
}

impl Default for PostCollectionConfig {
    fn default() -> Self {
        Self {
            compress: false,
            compression_tool: "gzip".into(),
            compressed_extension: "gz".into(),
            upload: false,
            upload_host: String::new(),
            upload_user: String::new(),
            upload_remote_path: String::new(),
        }
    }
}

impl PostCollectionConfig {
    /// Upload target when a host is configured.
    pub fn upload_target(&self) -> Option<UploadTarget> {
        if self.upload_host.is_empty() {
            return None;
        }
        Some(UploadTarget {
            host: self.upload_host.clone(),
            user: self.upload_user.clone(),
            remote_path: self.upload_remote_path.clone(),
        })
    }
}

/// Raw event publishing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Unix datagram socket receiving raw events; no raw sink when unset.
    pub socket: Option<PathBuf>,
}

/// Memory image replayed by the daemon as a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name.
    pub name: String,
    /// Baseband selecting the remap table.
    pub baseband: Baseband,
    /// Little-endian memory dump.
    pub dump: PathBuf,
    /// Device address of the first dumped dword.
    #[serde(default)]
    pub base_address: u32,
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `[collection]`
    pub collection: CollectionConfig,
    /// `[post_collection]`
    pub post_collection: PostCollectionConfig,
    /// `[publish]`
    pub publish: PublishConfig,
    /// `[[device]]`
    #[serde(rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load and validate `path`; relative paths are resolved against its
    /// directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.rebase_paths(path);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the collector cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.polling_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "collection.polling_interval_ms must be greater than zero".into(),
            ));
        }
        if self.post_collection.upload && self.post_collection.upload_target().is_none() {
            return Err(ConfigError::Invalid(
                "post_collection.upload requires upload_host".into(),
            ));
        }
        let mut names: Vec<&str> = self.devices.iter().map(|d| d.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::Invalid(format!("device {} listed twice", pair[0])));
        }
        Ok(())
    }

    /// Poll period.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.collection.polling_interval_ms)
    }

    /// Rotation threshold in bytes.
    pub fn max_file_bytes(&self) -> u64 {
        self.collection.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    fn rebase_paths(&mut self, path: &Path) {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        self.collection.target_dir = join_base(base, &self.collection.target_dir);
        if let Some(dir) = &mut self.collection.string_table_dir {
            *dir = join_base(base, dir);
        }
        if let Some(socket) = &mut self.publish.socket {
            *socket = join_base(base, socket);
        }
        for device in &mut self.devices {
            device.dump = join_base(base, &device.dump);
        }
    }
}

fn join_base(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}
