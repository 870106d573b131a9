// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inode numbers for mount paths
//!
//! The core addresses everything by canonical path; the kernel addresses
//! everything by inode. Numbers are handed out on first sight of a path and
//! follow the path through renames. An inode outlives its path while the
//! kernel still holds lookups on it.

use std::collections::HashMap;

pub const ROOT_INO: u64 = 1;

struct Inode {
    path: String,
    /// Lookups the kernel has not forgotten yet.
    lookups: u64,
    /// False once the path was unlinked or renamed over.
    linked: bool,
}

pub struct InodeTable {
    entries: HashMap<u64, Inode>,
    inodes: HashMap<String, u64>,
    next: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            entries: HashMap::new(),
            inodes: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.entries.insert(
            ROOT_INO,
            Inode {
                path: "/".to_string(),
                lookups: 1,
                linked: true,
            },
        );
        table.inodes.insert("/".to_string(), ROOT_INO);
        table
    }

    /// Last path of `ino`, whether or not it still names the inode.
    pub fn path(&self, ino: u64) -> Option<&str> {
        self.entries.get(&ino).map(|entry| entry.path.as_str())
    }

    pub fn is_linked(&self, ino: u64) -> bool {
        self.entries.get(&ino).map_or(false, |entry| entry.linked)
    }

    /// Path of `name` inside the directory `parent`.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        let parent = self.path(parent)?;
        Some(if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        })
    }

    /// Inode for `path` without counting a kernel reference.
    pub fn get_or_alloc(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.inodes.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.entries.insert(
            ino,
            Inode {
                path: path.to_string(),
                lookups: 0,
                linked: true,
            },
        );
        self.inodes.insert(path.to_string(), ino);
        ino
    }

    /// Inode for `path`, counting one kernel reference to it.
    pub fn lookup(&mut self, path: &str) -> u64 {
        let ino = self.get_or_alloc(path);
        self.add_lookup(ino);
        ino
    }

    pub fn add_lookup(&mut self, ino: u64) {
        if let Some(entry) = self.entries.get_mut(&ino) {
            entry.lookups += 1;
        }
    }

    /// Drops `nlookup` kernel references to `ino`. The inode goes away with
    /// the last one; the root never does.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(entry) = self.entries.get_mut(&ino) else {
            return;
        };
        entry.lookups = entry.lookups.saturating_sub(nlookup);
        if entry.lookups > 0 {
            return;
        }
        if let Some(entry) = self.entries.remove(&ino) {
            if self.inodes.get(&entry.path) == Some(&ino) {
                self.inodes.remove(&entry.path);
            }
        }
    }

    /// Unbinds `path` from its inode. An inode the kernel still references
    /// stays until forgotten so handles on it keep answering.
    pub fn remove_path(&mut self, path: &str) {
        let Some(ino) = self.inodes.remove(path) else {
            return;
        };
        match self.entries.get_mut(&ino) {
            Some(entry) if entry.lookups > 0 => entry.linked = false,
            Some(_) => {
                self.entries.remove(&ino);
            }
            None => {}
        }
    }

    /// Moves `from` and everything below it to `to`, keeping inode numbers.
    /// Whatever `to` pointed at before is unbound.
    pub fn rename(&mut self, from: &str, to: &str) {
        self.remove_path(to);
        let prefix = format!("{from}/");
        let moved: Vec<(String, u64)> = self
            .inodes
            .iter()
            .filter(|(path, _)| path.as_str() == from || path.starts_with(&prefix))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect();
        for (old, ino) in moved {
            let new = format!("{to}{}", &old[from.len()..]);
            self.inodes.remove(&old);
            self.inodes.insert(new.clone(), ino);
            if let Some(entry) = self.entries.get_mut(&ino) {
                entry.path = new;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
