// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-key roots of the named namespace and their republishing

use crate::backend::{
    Backends, DagNode, Key, MutableTree, NameService, NameTarget, PublishOptions, ResolveOptions,
};
use crate::config::PublishPolicy;
use crate::error::{FsError, FsResult};
use crate::fileio::DagModifier;
use crate::types::Cid;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// How a name relates to the locally owned keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Owned {
    /// The name is the key's published id.
    Id(Key),
    /// The name is the key's local alias.
    Alias(Key),
}

/// Current value of an owned key.
pub enum KeyValue {
    Tree(Arc<dyn MutableTree>),
    File(Arc<Mutex<DagModifier>>),
}

/// Writable root of one owned key.
pub struct KeyRoot {
    key: Key,
    value: KeyValue,
    republisher: Republisher,
}

impl KeyRoot {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn value(&self) -> &KeyValue {
        &self.value
    }

    pub fn is_file(&self) -> bool {
        matches!(self.value, KeyValue::File(_))
    }

    /// Records that the root changed and schedules a coalesced publish.
    pub fn touch(&self) {
        self.republisher.touch();
    }

    pub async fn publish_now(&self) -> FsResult<()> {
        self.republisher.publish_now().await
    }
}

/// Lazily populated index of owned-key roots.
pub struct NameRootIndex {
    backends: Backends,
    policy: PublishPolicy,
    publish_opts: PublishOptions,
    keys: std::sync::Mutex<Vec<Key>>,
    roots: Mutex<HashMap<String, Arc<KeyRoot>>>,
}

impl NameRootIndex {
    /// Lists the owned keys. Failure to do so is fatal for the mount.
    pub async fn new(
        backends: Backends,
        policy: PublishPolicy,
        record_ttl: Duration,
    ) -> FsResult<Self> {
        let keys = backends.keys.list().await?;
        tracing::debug!(count = keys.len(), "loaded owned keys");
        Ok(Self {
            backends,
            policy,
            publish_opts: PublishOptions {
                ttl: Some(record_ttl),
            },
            keys: std::sync::Mutex::new(keys),
            roots: Mutex::new(HashMap::new()),
        })
    }

    pub fn keys(&self) -> Vec<Key> {
        self.keys.lock().unwrap().clone()
    }

    pub fn owned(&self, name: &str) -> Option<Owned> {
        let keys = self.keys.lock().unwrap();
        if let Some(key) = keys.iter().find(|k| k.id == name) {
            return Some(Owned::Id(key.clone()));
        }
        keys.iter().find(|k| k.name == name).map(|k| Owned::Alias(k.clone()))
    }

    /// Root for an owned key, initializing it on first use. A key without a
    /// published record starts out as an empty directory.
    pub async fn root_for(&self, key: &Key) -> FsResult<Arc<KeyRoot>> {
        let mut roots = self.roots.lock().await;
        if let Some(root) = roots.get(&key.id) {
            return Ok(root.clone());
        }

        let current = match self.current_value(key).await {
            Ok(cid) => Some(cid),
            Err(FsError::NotFound) => None,
            Err(err) => return Err(err),
        };
        let (value, source) = match current {
            None => {
                let tree = self.backends.trees.load(None).await?;
                (KeyValue::Tree(tree.clone()), RootSource::Tree(tree))
            }
            Some(cid) => match self.backends.dag.get(&cid).await? {
                DagNode::Directory { .. } => {
                    let tree = self.backends.trees.load(Some(cid)).await?;
                    (KeyValue::Tree(tree.clone()), RootSource::Tree(tree))
                }
                DagNode::File { .. } => {
                    let modifier =
                        Arc::new(Mutex::new(DagModifier::new(self.backends.dag.clone(), cid)));
                    (KeyValue::File(modifier.clone()), RootSource::File(modifier))
                }
                DagNode::Symlink { .. } => {
                    return Err(FsError::Unexpected(format!(
                        "value of key {} is a symlink",
                        key.id
                    )));
                }
            },
        };
        tracing::info!(key = %key.id, root = ?current, "initialized key root");

        let republisher = Republisher::spawn(
            PublishWorker {
                key: key.clone(),
                source,
                names: self.backends.names.clone(),
                opts: self.publish_opts.clone(),
                last: current,
                dirty: false,
            },
            &self.policy,
        );
        let root = Arc::new(KeyRoot {
            key: key.clone(),
            value,
            republisher,
        });
        roots.insert(key.id.clone(), root.clone());
        Ok(root)
    }

    /// Root for an owned name (id or alias).
    pub async fn root_for_name(&self, name: &str) -> FsResult<Arc<KeyRoot>> {
        match self.owned(name) {
            Some(Owned::Id(key)) | Some(Owned::Alias(key)) => self.root_for(&key).await,
            None => Err(FsError::NoKey(name.to_string())),
        }
    }

    /// Already-initialized root, if any.
    pub async fn loaded(&self, id: &str) -> Option<Arc<KeyRoot>> {
        self.roots.lock().await.get(id).cloned()
    }

    /// Deletes an owned key through the key service.
    pub async fn remove_key(&self, name: &str) -> FsResult<Key> {
        let Some(Owned::Id(key) | Owned::Alias(key)) = self.owned(name) else {
            return Err(FsError::NoKey(name.to_string()));
        };
        let removed = self.backends.keys.remove(&key.name).await?;
        self.keys.lock().unwrap().retain(|k| k.id != removed.id);
        if let Some(root) = self.roots.lock().await.remove(&removed.id) {
            root.republisher.abort();
        }
        tracing::info!(key = %removed.id, alias = %removed.name, "removed key");
        Ok(removed)
    }

    /// Publishes pending roots and stops every republisher.
    pub async fn shutdown(&self) {
        let roots: Vec<Arc<KeyRoot>> = self.roots.lock().await.drain().map(|(_, r)| r).collect();
        for root in roots {
            root.republisher.shutdown().await;
        }
    }

    async fn current_value(&self, key: &Key) -> FsResult<Cid> {
        match self
            .backends
            .names
            .resolve(&key.id, &ResolveOptions { recursive: true })
            .await?
        {
            NameTarget::Content(cid) => Ok(cid),
            NameTarget::Name(name) => Err(FsError::Unexpected(format!(
                "record for {} still points at name {name}",
                key.id
            ))),
        }
    }
}

/// Where the republisher reads the latest root from.
enum RootSource {
    Tree(Arc<dyn MutableTree>),
    File(Arc<Mutex<DagModifier>>),
}

impl RootSource {
    async fn current(&self) -> FsResult<Cid> {
        match self {
            RootSource::Tree(tree) => tree.flush("").await,
            RootSource::File(modifier) => Ok(modifier.lock().await.committed()),
        }
    }
}

enum Signal {
    Touch,
    Now(oneshot::Sender<FsResult<()>>),
}

/// Coalesces root changes into publishes.
///
/// Each change restarts a short quiet timer; a long timer started by the
/// first change of a burst bounds the total delay. Whichever fires first
/// publishes the latest root once.
struct Republisher {
    tx: mpsc::UnboundedSender<Signal>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Republisher {
    fn spawn(worker: PublishWorker, policy: &PublishPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let short = Duration::from_millis(policy.short_window_ms);
        let long = Duration::from_millis(policy.long_window_ms);
        let task = tokio::spawn(worker.run(rx, cancel.clone(), short, long));
        Self {
            tx,
            cancel,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    fn touch(&self) {
        let _ = self.tx.send(Signal::Touch);
    }

    async fn publish_now(&self) -> FsResult<()> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(Signal::Now(reply))
            .map_err(|_| FsError::Unexpected("republisher stopped".to_string()))?;
        done.await.map_err(|_| FsError::Unexpected("republisher stopped".to_string()))?
    }

    /// Stops the worker after a final publish of any pending change.
    async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(%err, "republisher task failed");
            }
        }
    }

    /// Stops the worker without publishing.
    fn abort(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

struct PublishWorker {
    key: Key,
    source: RootSource,
    names: Arc<dyn NameService>,
    opts: PublishOptions,
    last: Option<Cid>,
    dirty: bool,
}

impl PublishWorker {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Signal>,
        cancel: CancellationToken,
        short: Duration,
        long: Duration,
    ) {
        'idle: loop {
            // Signals queued before cancellation are still processed.
            let first = tokio::select! {
                biased;
                signal = rx.recv() => signal,
                _ = cancel.cancelled() => break 'idle,
            };
            let mut waiters = Vec::new();
            match first {
                None => break 'idle,
                Some(Signal::Now(reply)) => waiters.push(reply),
                Some(Signal::Touch) => {
                    self.dirty = true;
                    let long_timer = sleep(long);
                    let short_timer = sleep(short);
                    tokio::pin!(long_timer, short_timer);
                    loop {
                        tokio::select! {
                            _ = &mut short_timer => break,
                            _ = &mut long_timer => break,
                            _ = cancel.cancelled() => break,
                            signal = rx.recv() => match signal {
                                Some(Signal::Touch) => {
                                    short_timer.as_mut().reset(Instant::now() + short);
                                }
                                Some(Signal::Now(reply)) => {
                                    waiters.push(reply);
                                    break;
                                }
                                None => break,
                            },
                        }
                    }
                }
            }

            let result = self.publish().await;
            if let Err(err) = &result {
                tracing::error!(key = %self.key.id, %err, "failed to publish key root");
            }
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
            if cancel.is_cancelled() {
                return;
            }
        }

        if self.dirty {
            if let Err(err) = self.publish().await {
                tracing::error!(key = %self.key.id, %err, "failed to publish key root on shutdown");
            }
        }
    }

    async fn publish(&mut self) -> FsResult<()> {
        let root = self.source.current().await?;
        if self.last == Some(root) {
            self.dirty = false;
            return Ok(());
        }
        self.names.publish(&self.key, &root, &self.opts).await?;
        tracing::info!(key = %self.key.id, %root, "published key root");
        self.last = Some(root);
        self.dirty = false;
        Ok(())
    }
}
