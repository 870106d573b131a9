// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount-relative path classification

use crate::config::NamespaceRoots;
use crate::error::{FsError, FsResult};

/// Top-level namespace a path belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    Root,
    Immutable,
    Named,
    Mutable,
}

/// Result of classifying a canonical mount path.
///
/// Sub-paths are either empty or start with `/` and never end with one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathKind {
    MountRoot,
    ImmutableRoot,
    NamedRoot,
    MutableRoot,
    ImmutableNode { addr: String, rest: String },
    NamedKey { key: String },
    NamedNode { key: String, rest: String },
    MutableNode { rest: String },
}

impl PathKind {
    pub fn namespace(&self) -> Namespace {
        match self {
            PathKind::MountRoot => Namespace::Root,
            PathKind::ImmutableRoot | PathKind::ImmutableNode { .. } => Namespace::Immutable,
            PathKind::NamedRoot | PathKind::NamedKey { .. } | PathKind::NamedNode { .. } => {
                Namespace::Named
            }
            PathKind::MutableRoot | PathKind::MutableNode { .. } => Namespace::Mutable,
        }
    }

    /// Whether nodes reached through this path may ever be written.
    pub fn is_mutable(&self) -> bool {
        matches!(self.namespace(), Namespace::Named | Namespace::Mutable)
    }

    /// Synthetic directories that exist regardless of backend state.
    pub fn is_synthetic_root(&self) -> bool {
        matches!(
            self,
            PathKind::MountRoot
                | PathKind::ImmutableRoot
                | PathKind::NamedRoot
                | PathKind::MutableRoot
        )
    }
}

/// Pure parser from mount paths to [`PathKind`].
#[derive(Clone, Debug)]
pub struct PathClassifier {
    immutable: String,
    named: String,
    mutable: String,
}

impl PathClassifier {
    pub fn new(roots: &NamespaceRoots) -> Self {
        let strip = |root: &str| root.trim_start_matches('/').to_string();
        Self {
            immutable: strip(&roots.immutable),
            named: strip(&roots.named),
            mutable: strip(&roots.mutable),
        }
    }

    pub fn classify(&self, path: &str) -> FsResult<PathKind> {
        validate(path)?;
        if path == "/" {
            return Ok(PathKind::MountRoot);
        }

        let mut segments = path[1..].split('/');
        let top = segments.next().unwrap_or_default();
        let rest: Vec<&str> = segments.collect();
        let sub = |parts: &[&str]| -> String {
            parts.iter().map(|s| format!("/{s}")).collect()
        };

        if top == self.immutable {
            match rest.split_first() {
                None => Ok(PathKind::ImmutableRoot),
                Some((addr, tail)) => Ok(PathKind::ImmutableNode {
                    addr: addr.to_string(),
                    rest: sub(tail),
                }),
            }
        } else if top == self.named {
            match rest.split_first() {
                None => Ok(PathKind::NamedRoot),
                Some((key, [])) => Ok(PathKind::NamedKey {
                    key: key.to_string(),
                }),
                Some((key, tail)) => Ok(PathKind::NamedNode {
                    key: key.to_string(),
                    rest: sub(tail),
                }),
            }
        } else if top == self.mutable {
            if rest.is_empty() {
                Ok(PathKind::MutableRoot)
            } else {
                Ok(PathKind::MutableNode { rest: sub(&rest) })
            }
        } else {
            Err(FsError::NotFound)
        }
    }

    /// Mount path of a namespace root, e.g. `/mutable`.
    pub fn root_path(&self, ns: Namespace) -> String {
        match ns {
            Namespace::Root => "/".to_string(),
            Namespace::Immutable => format!("/{}", self.immutable),
            Namespace::Named => format!("/{}", self.named),
            Namespace::Mutable => format!("/{}", self.mutable),
        }
    }

    /// Names listed in the synthetic mount root.
    pub fn root_entries(&self) -> [(&str, Namespace); 3] {
        [
            (self.immutable.as_str(), Namespace::Immutable),
            (self.named.as_str(), Namespace::Named),
            (self.mutable.as_str(), Namespace::Mutable),
        ]
    }
}

fn validate(path: &str) -> FsResult<()> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidPath(format!("{path:?} is not absolute")));
    }
    if path.contains('\0') {
        return Err(FsError::InvalidPath("path contains NUL".to_string()));
    }
    if path == "/" {
        return Ok(());
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(FsError::InvalidPath(format!("{path:?} has an empty segment"))),
            "." | ".." => {
                return Err(FsError::InvalidPath(format!("{path:?} is not canonical")));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Syntactic parent of a canonical path; `None` for the mount root.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Mount path a symlink at `link` leads to.
///
/// Absolute targets under `mount_point` are rebased onto the mount; other
/// absolute targets are already mount paths. Relative targets resolve
/// against the directory holding the link.
pub fn follow_link(link: &str, target: &str, mount_point: Option<&str>) -> String {
    let rebased = mount_point
        .and_then(|mount| target.strip_prefix(mount.trim_end_matches('/')))
        .filter(|rest| rest.is_empty() || rest.starts_with('/'));
    let absolute = match rebased {
        Some(rest) => format!("/{rest}"),
        None if target.starts_with('/') => target.to_string(),
        None => join(parent_of(link).unwrap_or("/"), target),
    };
    let mut segments: Vec<&str> = Vec::new();
    for segment in absolute.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Validates a single entry name supplied by the kernel.
pub fn validate_name(name: &str, name_max: u32) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(FsError::InvalidArgument);
    }
    if name.len() > name_max as usize {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}
