// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Handle allocation and lookup

use crate::dirstream::DirStream;
use crate::error::{FsError, FsResult};
use crate::fileio::FileIo;
use crate::registry::{FsNode, NodeRegistry};
use crate::types::{HandleId, HandleState, OpenFlags};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// IO object bound to a handle.
pub enum HandleIo {
    File(tokio::sync::Mutex<Box<dyn FileIo>>),
    Dir(Arc<DirStream>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    File,
    Dir,
}

pub struct OpenHandle {
    id: HandleId,
    node: Arc<FsNode>,
    flags: OpenFlags,
    io: HandleIo,
    state: Mutex<HandleState>,
}

impl OpenHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn node(&self) -> &Arc<FsNode> {
        &self.node
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn io_kind(&self) -> IoKind {
        match self.io {
            HandleIo::File(_) => IoKind::File,
            HandleIo::Dir(_) => IoKind::Dir,
        }
    }

    /// File IO; callers lock it for the duration of one operation.
    pub fn file(&self) -> FsResult<&tokio::sync::Mutex<Box<dyn FileIo>>> {
        match &self.io {
            HandleIo::File(io) => Ok(io),
            HandleIo::Dir(_) => Err(FsError::WrongIoType),
        }
    }

    pub fn dir(&self) -> FsResult<&Arc<DirStream>> {
        match &self.io {
            HandleIo::Dir(stream) => Ok(stream),
            HandleIo::File(_) => Err(FsError::WrongIoType),
        }
    }

    pub fn state(&self) -> HandleState {
        *self.state.lock().unwrap()
    }

    pub fn mark_dirty(&self) {
        *self.state.lock().unwrap() = HandleState::Dirty;
    }

    pub fn mark_clean(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == HandleState::Dirty {
            *state = HandleState::Clean;
        }
    }
}

/// Table of open handles.
///
/// Identifiers come from a monotonically increasing counter starting at 1,
/// so a released identifier is never handed out again during the mount.
pub struct HandleTable {
    capacity: u64,
    next: AtomicU64,
    /// Open handles plus outstanding reservations.
    in_use: Mutex<u64>,
    entries: RwLock<HashMap<HandleId, Arc<OpenHandle>>>,
}

impl HandleTable {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            next: AtomicU64::new(1),
            in_use: Mutex::new(0),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn open_count(&self) -> u64 {
        self.entries.read().unwrap().len() as u64
    }

    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(*self.in_use.lock().unwrap())
    }

    /// Claims a slot before any node is touched, so that exhaustion leaves
    /// the filesystem unchanged. The slot is returned when the reservation
    /// is dropped uncommitted.
    pub fn reserve(&self) -> FsResult<Reservation<'_>> {
        let mut in_use = self.in_use.lock().unwrap();
        if *in_use >= self.capacity {
            tracing::warn!(capacity = self.capacity, "handle table exhausted");
            return Err(FsError::HandleExhausted);
        }
        *in_use += 1;
        Ok(Reservation {
            table: self,
            committed: false,
        })
    }

    pub fn get(&self, id: HandleId) -> FsResult<Arc<OpenHandle>> {
        if id.is_none() {
            return Err(FsError::BadHandle);
        }
        self.entries.read().unwrap().get(&id).cloned().ok_or(FsError::BadHandle)
    }

    /// Looks up a handle and checks its IO kind.
    pub fn lookup(&self, id: HandleId, kind: IoKind) -> FsResult<Arc<OpenHandle>> {
        let handle = self.get(id)?;
        if handle.io_kind() != kind {
            return Err(FsError::WrongIoType);
        }
        Ok(handle)
    }

    /// Removes a handle, detaches it from its node and closes its IO.
    pub async fn release(&self, id: HandleId, registry: &NodeRegistry) -> FsResult<()> {
        let handle = self.entries.write().unwrap().remove(&id).ok_or(FsError::BadHandle)?;
        {
            let mut in_use = self.in_use.lock().unwrap();
            *in_use = in_use.saturating_sub(1);
        }
        registry.detach_handle(&handle.node, id);
        match &handle.io {
            HandleIo::File(io) => io.lock().await.close().await,
            HandleIo::Dir(stream) => {
                stream.close();
                Ok(())
            }
        }
    }

    /// Identifiers of every open handle.
    pub fn ids(&self) -> Vec<HandleId> {
        self.entries.read().unwrap().keys().copied().collect()
    }
}

pub struct Reservation<'a> {
    table: &'a HandleTable,
    committed: bool,
}

impl Reservation<'_> {
    pub fn commit_file(
        self,
        registry: &NodeRegistry,
        node: Arc<FsNode>,
        flags: OpenFlags,
        io: Box<dyn FileIo>,
    ) -> HandleId {
        self.commit(registry, node, flags, HandleIo::File(tokio::sync::Mutex::new(io)))
    }

    pub fn commit_dir(
        self,
        registry: &NodeRegistry,
        node: Arc<FsNode>,
        stream: Arc<DirStream>,
    ) -> HandleId {
        self.commit(registry, node, OpenFlags::read_only(), HandleIo::Dir(stream))
    }

    fn commit(
        mut self,
        registry: &NodeRegistry,
        node: Arc<FsNode>,
        flags: OpenFlags,
        io: HandleIo,
    ) -> HandleId {
        let id = HandleId(self.table.next.fetch_add(1, Ordering::Relaxed));
        registry.attach_handle(&node, id);
        let handle = Arc::new(OpenHandle {
            id,
            node,
            flags,
            io,
            state: Mutex::new(HandleState::OpenReadable),
        });
        self.table.entries.write().unwrap().insert(id, handle);
        self.committed = true;
        id
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let mut in_use = self.table.in_use.lock().unwrap();
            *in_use = in_use.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResolutionCache;
    use crate::testing;
    use crate::types::Whence;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct NullIo {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FileIo for NullIo {
        async fn read(&mut self, _buf: &mut [u8], _offset: u64) -> FsResult<usize> {
            Ok(0)
        }
        async fn write(&mut self, buf: &[u8], _offset: u64) -> FsResult<usize> {
            Ok(buf.len())
        }
        async fn seek(&mut self, _offset: i64, _whence: Whence) -> FsResult<u64> {
            Ok(0)
        }
        async fn size(&mut self) -> FsResult<u64> {
            Ok(0)
        }
        async fn truncate(&mut self, _size: u64) -> FsResult<()> {
            Ok(())
        }
        async fn sync(&mut self) -> FsResult<()> {
            Ok(())
        }
        async fn close(&mut self) -> FsResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn registry() -> Arc<NodeRegistry> {
        testing::registry(Arc::new(ResolutionCache::new(16).expect("cache"))).await
    }

    #[tokio::test]
    async fn handles_pin_nodes_until_released() {
        let registry = registry().await;
        let table = HandleTable::new(4);
        let node = registry.lookup("/mutable").await.expect("root");
        let closed = Arc::new(AtomicBool::new(false));
        let io = NullIo {
            closed: closed.clone(),
        };

        let id = table
            .reserve()
            .expect("slot")
            .commit_file(&registry, node.clone(), OpenFlags::read_write(), Box::new(io));
        assert!(!id.is_none());
        assert!(node.has_handle(id));
        assert_eq!(table.free(), 3);

        let handle = table.lookup(id, IoKind::File).expect("file handle");
        assert!(Arc::ptr_eq(handle.node(), &node));
        assert_eq!(table.lookup(id, IoKind::Dir).err(), Some(FsError::WrongIoType));
        assert_eq!(handle.state(), HandleState::OpenReadable);
        handle.mark_clean();
        assert_eq!(handle.state(), HandleState::OpenReadable);
        handle.mark_dirty();
        handle.mark_clean();
        assert_eq!(handle.state(), HandleState::Clean);

        table.release(id, &registry).await.expect("release");
        assert!(closed.load(Ordering::SeqCst));
        assert!(!node.has_handle(id));
        assert_eq!(table.get(id).err(), Some(FsError::BadHandle));
        assert_eq!(table.release(id, &registry).await, Err(FsError::BadHandle));
        assert_eq!(table.free(), 4);
    }

    #[tokio::test]
    async fn exhaustion_is_reported_before_commit() {
        let registry = registry().await;
        let table = HandleTable::new(1);
        let node = registry.lookup("/mutable").await.expect("root");

        let held = table.reserve().expect("slot");
        assert_eq!(table.reserve().err(), Some(FsError::HandleExhausted));
        drop(held);

        let first = table
            .reserve()
            .expect("slot")
            .commit_file(
                &registry,
                node.clone(),
                OpenFlags::read_only(),
                Box::new(NullIo::default()),
            );
        assert_eq!(table.reserve().err(), Some(FsError::HandleExhausted));
        table.release(first, &registry).await.expect("release");

        let second = table
            .reserve()
            .expect("slot")
            .commit_file(&registry, node, OpenFlags::read_only(), Box::new(NullIo::default()));
        assert_ne!(first, second);
        assert_eq!(table.get(HandleId::NONE).err(), Some(FsError::BadHandle));
    }
}
