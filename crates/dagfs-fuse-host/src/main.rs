// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! DagFS FUSE Host: Linux filesystem adapter
//!
//! Mounts a DagFS gateway through libfuse. Without the `fuse` feature the
//! binary only validates its configuration and exercises the core start-up
//! and teardown paths.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod adapter;
#[cfg_attr(not(all(feature = "fuse", target_os = "linux")), allow(dead_code))]
mod inodes;

use anyhow::{Context, Result};
use clap::Parser;
use dagfs_core::memory::MemoryStack;
use dagfs_core::{Cid, FsConfig, Key, MountContext};
use dagfs_logging::CliLoggingArgs;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const COMPONENT: &str = "dagfs-fuse-host";

#[derive(Parser)]
#[command(version, about = "Mount a DagFS gateway through FUSE")]
struct Args {
    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,

    /// Directory whose host filesystem is reported by statfs
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Report this uid as the owner of every node
    #[arg(long)]
    uid: Option<u32>,

    /// Report this gid as the group of every node
    #[arg(long)]
    gid: Option<u32>,

    /// Name of the key owned by this node
    #[arg(long, default_value = "self")]
    key_name: String,

    /// Id of the owned key (default: derived from its name)
    #[arg(long)]
    key_id: Option<String>,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

impl Args {
    fn self_key(&self) -> Key {
        let id = self
            .key_id
            .clone()
            .unwrap_or_else(|| Cid::for_bytes(self.key_name.as_bytes()).to_string());
        Key {
            name: self.key_name.clone(),
            id,
        }
    }
}

fn load_config(config_path: Option<&PathBuf>) -> Result<FsConfig> {
    match config_path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config = FsConfig::from_json_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok(config)
        }
        None => Ok(FsConfig::default()),
    }
}

/// Command-line flags take precedence over the configuration file.
fn apply_overrides(config: &mut FsConfig, args: &Args) {
    config.mount.mount_point = Some(args.mount_point.clone());
    config.mount.allow_other |= args.allow_other;
    config.mount.allow_root |= args.allow_root;
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if args.uid.is_some() {
        config.mount.uid_override = args.uid;
    }
    if args.gid.is_some() {
        config.mount.gid_override = args.gid;
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    args.logging.clone().init(COMPONENT)?;

    info!(mount_point = %args.mount_point.display(), "Starting DagFS FUSE Host");

    let mut config = load_config(args.config.as_ref())?;
    apply_overrides(&mut config, &args);
    config.validate()?;
    info!(?config, "Configuration loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("dagfs-worker")
        .build()?;
    let stack = MemoryStack::new(args.self_key());
    let ctx = Arc::new(runtime.block_on(MountContext::new(config.clone(), stack.backends()))?);

    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        let shutdown = tokio_util::sync::CancellationToken::new();
        let (filesystem, mut mount_options) =
            adapter::build(&config, ctx.clone(), runtime.handle().clone(), shutdown.clone());
        if args.auto_unmount {
            mount_options.push(fuser::MountOption::AutoUnmount);
        }

        info!(
            attr_ttl_ms = config.cache.attr_ttl_ms,
            entry_ttl_ms = config.cache.entry_ttl_ms,
            allow_other = config.mount.allow_other,
            "Mounting filesystem"
        );
        let session = fuser::spawn_mount2(filesystem, &args.mount_point, &mount_options)
            .with_context(|| format!("failed to mount {}", args.mount_point.display()))?;
        info!("DagFS FUSE host mounted; waiting for interrupt");
        runtime.block_on(tokio::signal::ctrl_c())?;
        info!("Interrupt received, unmounting");
        shutdown.cancel();
        drop(session);
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        warn!("FUSE support not compiled in. This binary is for testing only.");
        info!(keys = 1, "DagFS core initialized");
        info!("To enable FUSE support, compile with: cargo build --features fuse");
    }

    runtime.block_on(ctx.shutdown())?;
    info!("DagFS FUSE host stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["dagfs-fuse-host", "/mnt/dagfs"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_config_loading_default() {
        let config = load_config(None).unwrap();
        assert_eq!(config.roots.immutable, "/immutable");
        assert_eq!(config.mount.fs_name, "dagfs");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_loading_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let config_json = r#"{
            "mount": { "fs_name": "gateway", "allow_root": true },
            "roots": { "immutable": "/ipfs", "named": "/ipns", "mutable": "/mfs" },
            "cache": { "capacity": 64, "attr_ttl_ms": 500 },
            "limits": { "max_open_handles": 100 }
        }"#;
        temp_file.write_all(config_json.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let path = temp_file.path().to_path_buf();
        let config = load_config(Some(&path)).unwrap();

        assert_eq!(config.mount.fs_name, "gateway");
        assert!(config.mount.allow_root);
        assert_eq!(config.roots.named, "/ipns");
        assert_eq!(config.cache.capacity, 64);
        assert_eq!(config.cache.attr_ttl_ms, 500);
        assert_eq!(config.limits.max_open_handles, 100);
    }

    #[test]
    fn test_config_loading_rejects_garbage() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"{ not json").unwrap();
        let path = temp_file.path().to_path_buf();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_overrides_win_over_file() {
        let args = args(&["--allow-other", "--uid", "501", "--data-dir", "/var/lib/dagfs"]);
        let mut config = FsConfig::default();
        apply_overrides(&mut config, &args);

        assert_eq!(config.mount.mount_point, Some(PathBuf::from("/mnt/dagfs")));
        assert!(config.mount.allow_other);
        assert_eq!(config.mount.uid_override, Some(501));
        assert_eq!(config.mount.gid_override, None);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/dagfs"));
    }

    #[test]
    fn test_conflicting_access_flags_fail_validation() {
        let args = args(&["--allow-other", "--allow-root"]);
        let mut config = FsConfig::default();
        apply_overrides(&mut config, &args);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_self_key_id_defaults_to_name_digest() {
        let key = args(&["--key-name", "alice"]).self_key();
        assert_eq!(key.name, "alice");
        assert_eq!(key.id, Cid::for_bytes(b"alice").to_string());

        let key = args(&["--key-id", "k-explicit"]).self_key();
        assert_eq!(key.name, "self");
        assert_eq!(key.id, "k-explicit");
    }

    #[tokio::test]
    async fn test_core_starts_and_stops_with_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(&["--data-dir", dir.path().to_str().unwrap()]);
        let mut config = FsConfig::default();
        apply_overrides(&mut config, &args);

        let stack = MemoryStack::new(args.self_key());
        let ctx = MountContext::new(config, stack.backends()).await.unwrap();
        assert_eq!(ctx.open_handles(), 0);
        ctx.shutdown().await.unwrap();
    }
}
