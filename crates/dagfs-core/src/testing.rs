// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fixtures shared by unit tests

use crate::backend::Key;
use crate::cache::ResolutionCache;
use crate::config::{NamespaceRoots, PublishPolicy};
use crate::memory::MemoryStack;
use crate::names::NameRootIndex;
use crate::path::PathClassifier;
use crate::registry::NodeRegistry;
use crate::resolve::Resolver;
use std::sync::Arc;
use std::time::Duration;

pub fn self_key() -> Key {
    Key {
        name: "self".to_string(),
        id: "k-self".to_string(),
    }
}

/// Registry over a fresh in-memory stack.
pub async fn registry(cache: Arc<ResolutionCache>) -> Arc<NodeRegistry> {
    registry_over(&MemoryStack::new(self_key()), cache).await
}

pub async fn registry_over(
    stack: &MemoryStack,
    cache: Arc<ResolutionCache>,
) -> Arc<NodeRegistry> {
    let backends = stack.backends();
    let ttl = Duration::from_secs(10);
    let names = NameRootIndex::new(backends.clone(), PublishPolicy::default(), ttl)
        .await
        .expect("name index");
    let resolver = Resolver::new(backends, Arc::new(names), 32, "/mnt/immutable".to_string());
    Arc::new(NodeRegistry::new(
        PathClassifier::new(&NamespaceRoots::default()),
        Arc::new(resolver),
        cache,
    ))
}
