// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Offset-indexed directory enumeration fed by a background producer

use crate::error::{FsError, FsResult};
use crate::types::{DirItem, Metadata};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Buffer {
    entries: Vec<DirItem>,
    /// Set once the producer stops; `Err` when it stopped abnormally.
    done: Option<FsResult<()>>,
}

/// Directory snapshot bound to a directory handle.
///
/// Entries are appended in backend order by a producer task; readers ask for
/// an offset and wait until it is populated or the stream ends. Entry `i`
/// is stable for the lifetime of the stream.
pub struct DirStream {
    buffer: Arc<Mutex<Buffer>>,
    progress: Arc<watch::Sender<usize>>,
    cancel: CancellationToken,
}

impl DirStream {
    /// Starts draining `source` in the background.
    ///
    /// `expected` is the entry count from a pre-enumeration stat, if known.
    /// Silence longer than `inactivity` between two entries ends the stream
    /// with [`FsError::Interrupted`]. When the backend yields nothing, `.`
    /// and `..` carrying `dir_attrs` are synthesized.
    pub fn spawn(
        source: BoxStream<'static, FsResult<DirItem>>,
        expected: Option<u64>,
        inactivity: Duration,
        dir_attrs: Metadata,
    ) -> Arc<Self> {
        let stream = Arc::new(Self {
            buffer: Arc::new(Mutex::new(Buffer::default())),
            progress: Arc::new(watch::Sender::new(0)),
            cancel: CancellationToken::new(),
        });
        let producer = Producer {
            buffer: stream.buffer.clone(),
            progress: stream.progress.clone(),
            cancel: stream.cancel.clone(),
        };
        tokio::spawn(producer.run(source, expected, inactivity, dir_attrs));
        stream
    }

    /// Entry at `offset`, waiting for the producer if needed. `None` means
    /// end of directory.
    pub async fn entry_at(&self, offset: u64) -> FsResult<Option<DirItem>> {
        let offset = usize::try_from(offset).map_err(|_| FsError::InvalidArgument)?;
        let mut progress = self.progress.subscribe();
        loop {
            {
                let buffer = self.buffer.lock().unwrap();
                if let Some(item) = buffer.entries.get(offset) {
                    return Ok(Some(item.clone()));
                }
                match &buffer.done {
                    Some(Ok(())) => return Ok(None),
                    Some(Err(err)) => return Err(err.clone()),
                    None => {}
                }
            }
            if progress.changed().await.is_err() {
                return Err(FsError::Interrupted);
            }
        }
    }

    /// Number of entries produced so far.
    pub fn populated(&self) -> usize {
        self.buffer.lock().unwrap().entries.len()
    }

    pub fn is_complete(&self) -> bool {
        self.buffer.lock().unwrap().done.is_some()
    }

    /// Cancels the producer and releases buffered entries.
    pub fn close(&self) {
        self.cancel.cancel();
        let mut buffer = self.buffer.lock().unwrap();
        buffer.entries = Vec::new();
        if buffer.done.is_none() {
            buffer.done = Some(Err(FsError::Interrupted));
        }
        drop(buffer);
        self.progress.send_modify(|n| *n = n.wrapping_add(1));
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Producer {
    buffer: Arc<Mutex<Buffer>>,
    progress: Arc<watch::Sender<usize>>,
    cancel: CancellationToken,
}

impl Producer {
    async fn run(
        self,
        mut source: BoxStream<'static, FsResult<DirItem>>,
        expected: Option<u64>,
        inactivity: Duration,
        dir_attrs: Metadata,
    ) {
        let mut produced: u64 = 0;
        let outcome = loop {
            if expected.is_some_and(|n| produced >= n) {
                break Ok(());
            }
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break Err(FsError::Interrupted),
                next = tokio::time::timeout(inactivity, source.next()) => next,
            };
            match next {
                Err(_) => {
                    tracing::warn!(produced, ?inactivity, "directory stream went silent");
                    break Err(FsError::Interrupted);
                }
                Ok(None) => break Ok(()),
                Ok(Some(Err(err))) => break Err(err),
                Ok(Some(Ok(item))) => {
                    self.push(item);
                    produced += 1;
                }
            }
        };

        if outcome.is_ok() && produced == 0 {
            for name in [".", ".."] {
                self.push(DirItem {
                    name: name.to_string(),
                    attrs: dir_attrs,
                });
            }
        }
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.done.is_none() {
            buffer.done = Some(outcome);
        }
        drop(buffer);
        self.progress.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn push(&self, item: DirItem) {
        self.buffer.lock().unwrap().entries.push(item);
        self.progress.send_modify(|n| *n = n.wrapping_add(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileKind;
    use futures::stream;

    fn item(name: &str) -> DirItem {
        DirItem {
            name: name.to_string(),
            attrs: Metadata::uninitialized(FileKind::File),
        }
    }

    fn dir_attrs() -> Metadata {
        Metadata::uninitialized(FileKind::Directory)
    }

    async fn collect(stream: &DirStream, from: u64) -> FsResult<Vec<String>> {
        let mut names = Vec::new();
        let mut offset = from;
        while let Some(entry) = stream.entry_at(offset).await? {
            names.push(entry.name);
            offset += 1;
        }
        Ok(names)
    }

    #[tokio::test]
    async fn yields_entries_in_backend_order() {
        let source = stream::iter(vec![Ok(item("b")), Ok(item("a")), Ok(item("c"))]).boxed();
        let dir = DirStream::spawn(source, None, Duration::from_secs(1), dir_attrs());
        assert_eq!(collect(&dir, 0).await.expect("entries"), vec!["b", "a", "c"]);
        assert_eq!(collect(&dir, 1).await.expect("resume"), vec!["a", "c"]);
        assert_eq!(dir.entry_at(1).await.expect("repeat"), Some(item("a")));
        assert!(dir.is_complete());
    }

    #[tokio::test]
    async fn empty_directories_get_dot_entries() {
        let dir = DirStream::spawn(
            stream::empty().boxed(),
            Some(0),
            Duration::from_secs(1),
            dir_attrs(),
        );
        assert_eq!(collect(&dir, 0).await.expect("entries"), vec![".", ".."]);
    }

    #[tokio::test]
    async fn known_count_ends_without_waiting_for_close() {
        let source = stream::iter(vec![Ok(item("x"))]).chain(stream::pending()).boxed();
        let dir = DirStream::spawn(source, Some(1), Duration::from_secs(30), dir_attrs());
        let names = tokio::time::timeout(Duration::from_secs(1), collect(&dir, 0))
            .await
            .expect("no wait")
            .expect("entries");
        assert_eq!(names, vec!["x"]);
    }

    #[tokio::test]
    async fn silence_between_entries_interrupts() {
        let source = stream::iter(vec![Ok(item("x"))]).chain(stream::pending()).boxed();
        let dir = DirStream::spawn(source, None, Duration::from_millis(30), dir_attrs());
        assert_eq!(dir.entry_at(0).await.expect("first"), Some(item("x")));
        assert_eq!(dir.entry_at(1).await, Err(FsError::Interrupted));
    }

    #[tokio::test]
    async fn backend_errors_end_the_stream() {
        let source =
            stream::iter(vec![Ok(item("x")), Err(FsError::io("list failed"))]).boxed();
        let dir = DirStream::spawn(source, None, Duration::from_secs(1), dir_attrs());
        assert!(matches!(collect(&dir, 0).await, Err(FsError::Io(_))));
        assert_eq!(dir.entry_at(0).await.expect("kept"), Some(item("x")));
    }

    #[tokio::test]
    async fn close_wakes_waiting_readers() {
        let dir = DirStream::spawn(
            stream::pending().boxed(),
            None,
            Duration::from_secs(30),
            dir_attrs(),
        );
        let reader = {
            let dir = dir.clone();
            tokio::spawn(async move { dir.entry_at(0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        dir.close();
        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("woken")
            .expect("join");
        assert_eq!(result, Err(FsError::Interrupted));
        assert_eq!(dir.populated(), 0);
    }
}
