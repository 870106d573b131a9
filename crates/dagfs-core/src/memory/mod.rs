// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process collaborator implementations.
//!
//! Used by standalone mounts and by the test-suite. All three share one
//! [`FaultInjector`] so a single policy can fail or stall any backend call.

mod dag;
mod names;
mod tree;

pub use dag::MemoryDag;
pub use names::MemoryNames;
pub use tree::{MemoryTree, MemoryTreeFactory};

use crate::backend::{Backends, Key};
use crate::fault::FaultInjector;
use std::sync::Arc;

/// Fully wired set of in-memory collaborators.
#[derive(Clone)]
pub struct MemoryStack {
    pub dag: Arc<MemoryDag>,
    pub names: Arc<MemoryNames>,
    pub files: Arc<MemoryTree>,
    pub trees: Arc<MemoryTreeFactory>,
    pub faults: Arc<FaultInjector>,
}

impl MemoryStack {
    pub fn new(self_key: Key) -> Self {
        let faults = Arc::new(FaultInjector::new());
        let dag = Arc::new(MemoryDag::with_faults(faults.clone()));
        let names = Arc::new(MemoryNames::with_faults(self_key, faults.clone()));
        let files = Arc::new(MemoryTree::new(dag.clone()));
        let trees = Arc::new(MemoryTreeFactory::new(dag.clone()));
        Self {
            dag,
            names,
            files,
            trees,
            faults,
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            dag: self.dag.clone(),
            names: self.names.clone(),
            keys: self.names.clone(),
            files: self.files.clone(),
            trees: self.trees.clone(),
        }
    }
}
