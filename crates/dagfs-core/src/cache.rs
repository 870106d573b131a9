// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bounded path-resolution cache

use crate::error::{FsError, FsResult};
use crate::path::Namespace;
use crate::registry::FsNode;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Stable 64-bit fingerprint of a path string.
pub fn fingerprint(path: &str) -> u64 {
    let digest = blake3::hash(path.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

struct CachedEntry {
    path: String,
    namespace: Namespace,
    node: Arc<FsNode>,
}

/// LRU of path fingerprints to registered nodes.
///
/// Entries keep the full path so that a fingerprint collision degrades to a
/// miss instead of returning another path's node.
pub struct ResolutionCache {
    entries: Mutex<LruCache<u64, CachedEntry>>,
}

impl ResolutionCache {
    pub fn new(capacity: usize) -> FsResult<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            FsError::InvalidConfig("resolution cache capacity must be non-zero".to_string())
        })?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn add(&self, path: &str, node: Arc<FsNode>) {
        let entry = CachedEntry {
            path: path.to_string(),
            namespace: node.kind().namespace(),
            node,
        };
        self.entries.lock().unwrap().put(fingerprint(path), entry);
    }

    pub fn get(&self, path: &str) -> Option<Arc<FsNode>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&fingerprint(path)) {
            Some(entry) if entry.path == path => Some(entry.node.clone()),
            _ => None,
        }
    }

    pub fn invalidate(&self, path: &str) {
        let mut entries = self.entries.lock().unwrap();
        let key = fingerprint(path);
        if entries.peek(&key).is_some_and(|e| e.path == path) {
            entries.pop(&key);
        }
    }

    /// Drops `path` and every entry below it.
    pub fn invalidate_tree(&self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.retain(|entry| entry.path != path && !entry.path.starts_with(&prefix));
    }

    pub fn invalidate_namespace(&self, namespace: Namespace) {
        self.retain(|entry| entry.namespace != namespace);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn retain(&self, keep: impl Fn(&CachedEntry) -> bool) {
        let mut entries = self.entries.lock().unwrap();
        let doomed: Vec<u64> =
            entries.iter().filter(|(_, e)| !keep(e)).map(|(k, _)| *k).collect();
        for key in doomed {
            entries.pop(&key);
        }
    }
}
