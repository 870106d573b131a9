// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Deadline, cancellation and registry-lock discipline for kernel ops

use crate::config::TimeoutPolicy;
use crate::error::{FsError, FsResult};
use crate::registry::NodeRegistry;
use crate::types::OpContext;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpClass {
    /// Data and attribute ops; registry lock shared.
    Interactive,
    /// Directory enumeration; registry lock shared, longer deadline.
    Directory,
    /// create, mkdir, mknod, unlink, rmdir, rename, symlink. The scheduler
    /// takes no registry lock: the op resolves under the shared lock, drops it
    /// and takes the exclusive lock for the mutation alone.
    Structural,
}

pub struct Scheduler {
    registry: Arc<NodeRegistry>,
    timeouts: TimeoutPolicy,
}

impl Scheduler {
    pub fn new(registry: Arc<NodeRegistry>, timeouts: TimeoutPolicy) -> Self {
        Self { registry, timeouts }
    }

    pub fn deadline(&self, class: OpClass) -> Duration {
        Duration::from_millis(match class {
            OpClass::Interactive => self.timeouts.interactive_ms,
            OpClass::Directory => self.timeouts.directory_ms,
            OpClass::Structural => self.timeouts.structural_ms,
        })
    }

    /// Runs `work` bounded by the class deadline and by `ctx.cancel`, under
    /// the shared registry lock for interactive and directory ops.
    ///
    /// Dropping `work` on cancellation or timeout discards its result, so
    /// nothing an abandoned op computed reaches the caches.
    pub async fn run<T, F>(
        &self,
        op: &'static str,
        class: OpClass,
        ctx: &OpContext,
        work: F,
    ) -> FsResult<T>
    where
        F: Future<Output = FsResult<T>>,
    {
        let deadline = self.deadline(class);
        let gate = self.registry.gate();
        let locked = async {
            match class {
                OpClass::Structural => work.await,
                OpClass::Interactive | OpClass::Directory => {
                    let _shared = gate.read().await;
                    work.await
                }
            }
        };

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                tracing::debug!(op, pid = ctx.pid, "operation interrupted");
                Err(FsError::Interrupted)
            }
            result = tokio::time::timeout(deadline, locked) => match result {
                Ok(result) => {
                    if let Err(err) = &result {
                        tracing::trace!(op, %err, "operation failed");
                    }
                    result
                }
                Err(_) => {
                    tracing::warn!(op, ?deadline, "operation timed out");
                    Err(FsError::io(format!("{op} timed out after {deadline:?}")))
                }
            },
        }
    }
}
