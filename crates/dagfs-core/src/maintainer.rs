// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Periodic cache expiry and registry pruning

use crate::cache::ResolutionCache;
use crate::config::CachePolicy;
use crate::path::Namespace;
use crate::registry::NodeRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Background task enforcing time-bounded consistency for the named and
/// mutable namespaces.
pub struct BackgroundMaintainer {
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundMaintainer {
    pub fn spawn(
        registry: Arc<NodeRegistry>,
        cache: Arc<ResolutionCache>,
        policy: &CachePolicy,
    ) -> Self {
        let cancel = CancellationToken::new();
        let named = interval(policy.named_ttl_ms);
        let mutable = interval(policy.mutable_ttl_ms);
        let prune = interval(policy.prune_interval_ms);
        let task = tokio::spawn(run(registry, cache, cancel.clone(), named, mutable, prune));
        Self {
            cancel,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(%err, "maintainer task ended abnormally");
            }
        }
    }
}

impl Drop for BackgroundMaintainer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn interval(ms: u64) -> tokio::time::Interval {
    let period = Duration::from_millis(ms.max(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn run(
    registry: Arc<NodeRegistry>,
    cache: Arc<ResolutionCache>,
    cancel: CancellationToken,
    mut named: tokio::time::Interval,
    mut mutable: tokio::time::Interval,
    mut prune: tokio::time::Interval,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = named.tick() => {
                cache.invalidate_namespace(Namespace::Named);
                tracing::trace!("expired named cache entries");
            }
            _ = mutable.tick() => {
                cache.invalidate_namespace(Namespace::Mutable);
                tracing::trace!("expired mutable cache entries");
            }
            _ = prune.tick() => {
                let _exclusive = tokio::select! {
                    _ = cancel.cancelled() => break,
                    guard = registry.gate().write() => guard,
                };
                let dropped = registry.prune(None);
                if dropped > 0 {
                    tracing::debug!(dropped, "pruned idle nodes");
                }
            }
        }
    }
    tracing::debug!("maintainer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathKind;
    use crate::registry::FsNode;

    #[tokio::test]
    async fn named_entries_expire_on_their_own_cadence() {
        let cache = Arc::new(ResolutionCache::new(16).expect("cache"));
        let registry = crate::testing::registry(cache.clone()).await;
        let named = Arc::new(FsNode::new(
            "/named/k".into(),
            PathKind::NamedKey { key: "k".into() },
        ));
        let mutable = Arc::new(FsNode::new(
            "/mutable/a".into(),
            PathKind::MutableNode { rest: "/a".into() },
        ));
        cache.add("/named/k", named);
        cache.add("/mutable/a", mutable);

        let policy = CachePolicy {
            named_ttl_ms: 20,
            mutable_ttl_ms: 300,
            prune_interval_ms: 10_000,
            ..CachePolicy::default()
        };
        let maintainer = BackgroundMaintainer::spawn(registry, cache.clone(), &policy);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("/named/k").is_none());
        assert!(cache.get("/mutable/a").is_some());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(cache.get("/mutable/a").is_none());
        maintainer.stop().await;
    }
}
