// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory name records and key store

use crate::backend::{Key, KeyService, NameService, NameTarget, PublishOptions, ResolveOptions};
use crate::error::{FsError, FsResult};
use crate::fault::{FaultInjector, FaultOp};
use crate::types::Cid;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const MAX_RECURSION: usize = 32;

#[derive(Default)]
struct NamesState {
    keys: Vec<Key>,
    records: HashMap<String, NameTarget>,
    published: Vec<(String, Cid)>,
}

/// Name records plus the set of locally owned keys. The first key added is
/// the node's own key.
pub struct MemoryNames {
    state: Mutex<NamesState>,
    faults: Arc<FaultInjector>,
}

impl MemoryNames {
    pub fn new(self_key: Key) -> Self {
        Self::with_faults(self_key, Arc::new(FaultInjector::new()))
    }

    pub fn with_faults(self_key: Key, faults: Arc<FaultInjector>) -> Self {
        Self {
            state: Mutex::new(NamesState {
                keys: vec![self_key],
                ..NamesState::default()
            }),
            faults,
        }
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    pub fn add_key(&self, key: Key) {
        self.state.lock().unwrap().keys.push(key);
    }

    /// Sets a record directly, bypassing the publish log.
    pub fn set_record(&self, name: &str, target: NameTarget) {
        self.state.lock().unwrap().records.insert(name.to_string(), target);
    }

    /// Every successful publish, oldest first, as `(key id, root)`.
    pub fn published(&self) -> Vec<(String, Cid)> {
        self.state.lock().unwrap().published.clone()
    }
}

#[async_trait]
impl NameService for MemoryNames {
    async fn resolve(&self, name: &str, opts: &ResolveOptions) -> FsResult<NameTarget> {
        self.faults.gate(FaultOp::NameResolve).await?;
        let state = self.state.lock().unwrap();
        let mut target = state.records.get(name).cloned().ok_or(FsError::NotFound)?;
        if !opts.recursive {
            return Ok(target);
        }
        for _ in 0..MAX_RECURSION {
            match target {
                NameTarget::Content(_) => return Ok(target),
                NameTarget::Name(next) => {
                    target = state.records.get(&next).cloned().ok_or(FsError::NotFound)?;
                }
            }
        }
        Err(FsError::RecursionLimit)
    }

    async fn publish(&self, key: &Key, root: &Cid, _opts: &PublishOptions) -> FsResult<()> {
        self.faults.gate(FaultOp::Publish).await?;
        let mut state = self.state.lock().unwrap();
        state.records.insert(key.id.clone(), NameTarget::Content(*root));
        state.published.push((key.id.clone(), *root));
        Ok(())
    }
}

#[async_trait]
impl KeyService for MemoryNames {
    async fn list(&self) -> FsResult<Vec<Key>> {
        Ok(self.state.lock().unwrap().keys.clone())
    }

    async fn remove(&self, name: &str) -> FsResult<Key> {
        let mut state = self.state.lock().unwrap();
        let idx = state
            .keys
            .iter()
            .position(|k| k.name == name || k.id == name)
            .ok_or_else(|| FsError::NoKey(name.to_string()))?;
        if idx == 0 {
            return Err(FsError::AccessDenied);
        }
        let key = state.keys.remove(idx);
        state.records.remove(&key.id);
        Ok(key)
    }

    async fn self_key(&self) -> FsResult<Key> {
        self.state.lock().unwrap().keys.first().cloned().ok_or(FsError::NotInitialized)
    }
}
