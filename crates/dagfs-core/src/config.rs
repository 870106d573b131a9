// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount configuration for DagFS Core

use crate::error::{FsError, FsResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub mount: MountOptions,
    pub roots: NamespaceRoots,
    pub cache: CachePolicy,
    pub timeouts: TimeoutPolicy,
    pub limits: FsLimits,
    pub publish: PublishPolicy,
    /// Directory whose host filesystem backs statfs reports.
    pub data_dir: PathBuf,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            mount: MountOptions::default(),
            roots: NamespaceRoots::default(),
            cache: CachePolicy::default(),
            timeouts: TimeoutPolicy::default(),
            limits: FsLimits::default(),
            publish: PublishPolicy::default(),
            data_dir: std::env::temp_dir(),
        }
    }
}

impl FsConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Rejects option combinations that cannot be mounted.
    pub fn validate(&self) -> FsResult<()> {
        self.mount.validate()?;
        self.roots.validate()?;
        if self.cache.capacity == 0 {
            return Err(FsError::InvalidConfig(
                "cache.capacity must be greater than zero".to_string(),
            ));
        }
        if self.limits.max_open_handles == 0 {
            return Err(FsError::InvalidConfig(
                "limits.max_open_handles must be greater than zero".to_string(),
            ));
        }
        if self.limits.max_file_size == 0 {
            return Err(FsError::InvalidConfig(
                "limits.max_file_size must be greater than zero".to_string(),
            ));
        }
        if self.publish.long_window_ms < self.publish.short_window_ms {
            return Err(FsError::InvalidConfig(
                "publish.long_window_ms must not be shorter than publish.short_window_ms"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    pub mount_point: Option<PathBuf>,
    pub readdirplus: bool,
    pub allow_other: bool,
    pub allow_root: bool,
    pub fs_name: String,
    /// Only honoured by hosts whose platform has volume labels.
    pub volume_label: Option<String>,
    pub uid_override: Option<u32>,
    pub gid_override: Option<u32>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            mount_point: None,
            readdirplus: false,
            allow_other: false,
            allow_root: false,
            fs_name: "dagfs".to_string(),
            volume_label: None,
            uid_override: None,
            gid_override: None,
        }
    }
}

impl MountOptions {
    pub fn validate(&self) -> FsResult<()> {
        if self.allow_other && self.allow_root {
            return Err(FsError::InvalidConfig(
                "allow_other and allow_root are mutually exclusive".to_string(),
            ));
        }
        if self.fs_name.is_empty() || self.fs_name.contains(',') {
            return Err(FsError::InvalidConfig(format!(
                "fs_name {:?} must be non-empty and contain no commas",
                self.fs_name
            )));
        }
        Ok(())
    }
}

/// Names of the three namespace roots under the mount root.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceRoots {
    pub immutable: String,
    pub named: String,
    pub mutable: String,
}

impl Default for NamespaceRoots {
    fn default() -> Self {
        Self {
            immutable: "/immutable".to_string(),
            named: "/named".to_string(),
            mutable: "/mutable".to_string(),
        }
    }
}

impl NamespaceRoots {
    pub fn validate(&self) -> FsResult<()> {
        let roots = [&self.immutable, &self.named, &self.mutable];
        for root in roots {
            let name = root.strip_prefix('/').unwrap_or("");
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(FsError::InvalidConfig(format!(
                    "namespace root {root:?} must be a single absolute path segment"
                )));
            }
        }
        if self.immutable == self.named
            || self.immutable == self.mutable
            || self.named == self.mutable
        {
            return Err(FsError::InvalidConfig(
                "namespace roots must be distinct".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Maximum number of path resolutions retained.
    pub capacity: usize,
    /// Attribute TTL reported to the kernel.
    pub attr_ttl_ms: u64,
    /// Entry TTL reported to the kernel.
    pub entry_ttl_ms: u64,
    /// Blanket invalidation cadence for the named namespace.
    pub named_ttl_ms: u64,
    /// Blanket invalidation cadence for the mutable namespace.
    pub mutable_ttl_ms: u64,
    /// Cadence at which idle nodes are dropped from the registry.
    pub prune_interval_ms: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            capacity: 1024,
            attr_ttl_ms: 1000,
            entry_ttl_ms: 1000,
            named_ttl_ms: 10_000,
            mutable_ttl_ms: 120_000,
            prune_interval_ms: 11_000,
        }
    }
}

impl CachePolicy {
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_ttl_ms)
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_millis(self.entry_ttl_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    pub interactive_ms: u64,
    pub directory_ms: u64,
    pub structural_ms: u64,
    /// Silence allowed between two directory entries before the stream fails.
    pub dir_entry_inactivity_ms: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            interactive_ms: 10_000,
            directory_ms: 60_000,
            structural_ms: 10_000,
            dir_entry_inactivity_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsLimits {
    pub max_open_handles: u64,
    /// Depth limit for symlink and name-record indirection chains.
    pub max_link_depth: u32,
    pub name_max: u32,
    /// Largest size a file may be written or truncated to.
    pub max_file_size: u64,
}

impl Default for FsLimits {
    fn default() -> Self {
        Self {
            max_open_handles: 4096,
            max_link_depth: 32,
            name_max: 255,
            max_file_size: 1 << 30,
        }
    }
}

/// Coalescing windows for republishing a named root.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishPolicy {
    /// Quiet period restarted by every update.
    pub short_window_ms: u64,
    /// Upper bound on how long an update may wait.
    pub long_window_ms: u64,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            short_window_ms: 300,
            long_window_ms: 3000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        FsConfig::default().validate().expect("default config is valid");
    }

    #[test]
    fn allow_other_with_allow_root_is_rejected() {
        let mut config = FsConfig::default();
        config.mount.allow_other = true;
        config.mount.allow_root = true;
        let err = config.validate().expect_err("conflicting options");
        assert!(matches!(err, FsError::InvalidConfig(msg) if msg.contains("mutually exclusive")));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = FsConfig::from_json_str(r#"{ "cache": { "capacity": 16 } }"#).expect("parse");
        assert_eq!(config.cache.capacity, 16);
        assert_eq!(config.cache.named_ttl_ms, 10_000);
        assert_eq!(config.roots.named, "/named");
    }

    #[test]
    fn nested_or_duplicate_roots_are_rejected() {
        let mut config = FsConfig::default();
        config.roots.mutable = "/a/b".to_string();
        assert!(config.validate().is_err());
        config.roots.mutable = "/named".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_cache_capacity_is_fatal() {
        let mut config = FsConfig::default();
        config.cache.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_file_size_is_fatal() {
        let mut config = FsConfig::default();
        config.limits.max_file_size = 0;
        let err = config.validate().expect_err("zero file size limit");
        assert!(err.to_string().contains("max_file_size"));
    }
}
