//! Compressed radix tree for route matching.
//!
//! Patterns are `/`-separated sequences of literal segments, `:name`
//! parameters (matching exactly one segment) and `*name` catch-alls
//! (matching the rest of the path, value including the introducing `/`).
//! Conflicting registrations are rejected at insertion time; lookup walks
//! the tree byte-wise in O(path length) and captures parameters as spans
//! into the looked-up path without allocating.

use std::sync::Arc;

use crate::error::RouteError;
use crate::router::params::PathParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum NodeKind {
    Plain,
    Root,
    Param,
    CatchAll,
}

/// A node owns the edge label from its parent (`path`) and dispatches on the
/// first byte of the remaining path: literal children through `indices`
/// (kept sorted by descending priority, permuted in lockstep), or a single
/// wildcard child when `has_wild_child` is set.
pub(crate) struct Node<T> {
    pub(super) path: String,
    pub(super) indices: Vec<u8>,
    pub(super) has_wild_child: bool,
    pub(super) kind: NodeKind,
    pub(super) priority: u32,
    pub(super) children: Vec<Node<T>>,
    pub(super) handler: Option<T>,
    // Parameter name without its `:`/`*` marker, precomputed at insertion so
    // captures share it instead of slicing per lookup.
    pub(super) wild_name: Option<Arc<str>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            path: String::new(),
            indices: Vec::new(),
            has_wild_child: false,
            kind: NodeKind::Plain,
            priority: 0,
            children: Vec::new(),
            handler: None,
            wild_name: None,
        }
    }
}

impl<T> Node<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `path` with the given handler value.
    ///
    /// The subtree rooted here gains one more route, so the priority is
    /// incremented up front; a registration that is ultimately rejected
    /// leaves the counter overcounted, which lookup never observes.
    pub(crate) fn insert(&mut self, path: &str, value: T) -> Result<(), RouteError> {
        self.priority += 1;

        if self.path.is_empty() && self.indices.is_empty() {
            self.insert_path(path, path, value)?;
            self.kind = NodeKind::Root;
            return Ok(());
        }

        self.insert_route(path, path, value)
    }

    /// Look up `path`, capturing parameters into `params`.
    ///
    /// Captures are pushed as soon as a wildcard matches, even when the
    /// descent ultimately finds no handler; callers treat `params` as
    /// in-out state scoped to one lookup.
    pub(crate) fn locate(&self, path: &str, params: &mut PathParams) -> Option<&T> {
        self.locate_in(path, 0, params)
    }

    fn locate_in<'n>(&'n self, full: &str, pos: usize, params: &mut PathParams) -> Option<&'n T> {
        let path = &full[pos..];

        if path.len() == self.path.len() {
            if path == self.path {
                return self.handler.as_ref();
            }
            return None;
        }

        if path.len() > self.path.len() && path.starts_with(self.path.as_str()) {
            let pos = pos + self.path.len();
            let path = &full[pos..];

            if !self.has_wild_child {
                let idxc = path.as_bytes()[0];
                let slot = self.indices.iter().position(|&c| c == idxc)?;
                return self.children[slot].locate_in(full, pos, params);
            }

            let child = &self.children[0];
            match child.kind {
                NodeKind::Param => {
                    let end = path.find('/').unwrap_or(path.len());
                    if let Some(name) = &child.wild_name {
                        params.push(name.clone(), pos..pos + end);
                    }

                    if end == path.len() {
                        return child.handler.as_ref();
                    }

                    // Go deeper.
                    let grand = child.children.first()?;
                    return grand.locate_in(full, pos + end, params);
                }
                NodeKind::CatchAll => {
                    if let Some(name) = &child.wild_name {
                        params.push(name.clone(), pos..full.len());
                    }
                    return child.handler.as_ref();
                }
                NodeKind::Plain | NodeKind::Root => {
                    debug_assert!(false, "wild child with non-wild kind");
                    return None;
                }
            }
        }

        None
    }

    /// Find the node the remaining path belongs under, splitting edges on
    /// the way down, and detect conflicts against existing wildcards.
    fn insert_route(&mut self, path: &str, full_path: &str, value: T) -> Result<(), RouteError> {
        let len = longest_common_prefix(path, &self.path);

        // Split the current node so its path equals the common prefix.
        if len < self.path.len() {
            let child = Node {
                path: self.path[len..].to_string(),
                indices: std::mem::take(&mut self.indices),
                has_wild_child: self.has_wild_child,
                kind: NodeKind::Plain,
                priority: self.priority - 1,
                children: std::mem::take(&mut self.children),
                handler: self.handler.take(),
                wild_name: self.wild_name.take(),
            };

            self.indices = vec![self.path.as_bytes()[len]];
            self.path.truncate(len);
            self.has_wild_child = false;
            self.children.push(child);
        }

        // `path` is a subset of the route path denoted by the current node.
        if len == path.len() {
            if self.handler.is_some() {
                return Err(RouteError::DuplicateRoute {
                    path: full_path.to_string(),
                });
            }
            self.handler = Some(value);
            return Ok(());
        }

        let path = &path[len..];

        // Can have only one child if it is a wild child.
        if self.has_wild_child {
            let child = &mut self.children[0];
            child.priority += 1;

            if path.starts_with(child.path.as_str())
                && child.kind != NodeKind::CatchAll
                && (child.path.len() == path.len() || path.as_bytes()[child.path.len()] == b'/')
            {
                return child.insert_route(path, full_path, value);
            }

            // Wildcard conflict.
            let segment = if child.kind == NodeKind::CatchAll {
                path
            } else {
                path.split('/').next().unwrap_or(path)
            };
            let mut prefix = full_path[..full_path.find(segment).unwrap_or(0)].to_string();
            prefix.push_str(&child.path);
            return Err(RouteError::WildcardConflict {
                segment: segment.to_string(),
                path: full_path.to_string(),
                wildcard: child.path.clone(),
                prefix,
            });
        }

        let idxc = path.as_bytes()[0];

        // A param node keeps `indices` empty and has at most one child whose
        // path is `/` or starts with `/`.
        if self.kind == NodeKind::Param && idxc == b'/' && !self.children.is_empty() {
            let child = &mut self.children[0];
            child.priority += 1;
            return child.insert_route(path, full_path, value);
        }

        // Check if a child with the next path byte exists.
        if let Some(pos) = self.indices.iter().position(|&c| c == idxc) {
            let pos = self.increment_child_priority(pos);
            return self.children[pos].insert_route(path, full_path, value);
        }

        if idxc != b':' && idxc != b'*' {
            self.indices.push(idxc);
            self.children.push(Node::default());
            let pos = self.increment_child_priority(self.indices.len() - 1);
            return self.children[pos].insert_path(path, full_path, value);
        }

        self.insert_path(path, full_path, value)
    }

    /// Lay the remaining path down from a fresh (or wildcard-hosting) node.
    fn insert_path(&mut self, path: &str, full_path: &str, value: T) -> Result<(), RouteError> {
        let (name, pos) = match find_wildcard(path) {
            Wildcard::None => {
                self.path = path.to_string();
                self.handler = Some(value);
                return Ok(());
            }
            Wildcard::Invalid => {
                return Err(RouteError::InvalidWildcard {
                    path: full_path.to_string(),
                });
            }
            Wildcard::Token { name, pos } => (name, pos),
        };

        if !self.children.is_empty() {
            return Err(RouteError::WildcardChildren {
                segment: name.to_string(),
                path: full_path.to_string(),
            });
        }

        if name.starts_with(':') {
            // The literal prefix before the parameter stays on this node.
            if pos > 0 {
                self.path = path[..pos].to_string();
            }
            self.has_wild_child = true;

            let mut child = Node {
                kind: NodeKind::Param,
                path: name.to_string(),
                priority: 1,
                wild_name: Some(Arc::from(&name[1..])),
                ..Node::default()
            };

            // The path ends with the wildcard, the param node is the leaf.
            if path.len() == pos + name.len() {
                child.handler = Some(value);
                self.children.push(child);
                return Ok(());
            }

            // There is another non-wildcard subpath; it necessarily starts
            // with `/`.
            let mut grand_child = Node {
                priority: 1,
                ..Node::default()
            };
            grand_child.insert_path(&path[pos + name.len()..], full_path, value)?;
            child.children.push(grand_child);
            self.children.push(child);
            return Ok(());
        }

        // Catch-all.
        if pos + name.len() != path.len() {
            return Err(RouteError::CatchAllPosition {
                path: full_path.to_string(),
            });
        }

        // e.g. `/hello/*name` would conflict with `/hello/` but not `/hello`.
        if !self.path.is_empty() && self.path.ends_with('/') {
            return Err(RouteError::CatchAllRootConflict {
                path: full_path.to_string(),
            });
        }

        // Move to the leading `/`.
        if pos == 0 || path.as_bytes()[pos - 1] != b'/' {
            return Err(RouteError::CatchAllNoSlash {
                path: full_path.to_string(),
            });
        }
        let pos = pos - 1;

        self.path = path[..pos].to_string();

        // First node is a catch-all gateway with an empty path; the second
        // holds the variable and the handler.
        let leaf = Node {
            kind: NodeKind::CatchAll,
            path: path[pos..].to_string(),
            priority: 1,
            handler: Some(value),
            wild_name: Some(Arc::from(&name[1..])),
            ..Node::default()
        };
        let mut gateway = Node {
            kind: NodeKind::CatchAll,
            has_wild_child: true,
            priority: 1,
            ..Node::default()
        };
        gateway.children.push(leaf);

        self.children.push(gateway);
        self.indices = vec![b'/'];
        Ok(())
    }

    /// Increment the priority of the child at `pos` and bubble it left past
    /// lower-priority siblings, moving its `indices` byte in lockstep.
    /// Returns the child's new position.
    fn increment_child_priority(&mut self, pos: usize) -> usize {
        debug_assert_eq!(self.indices.len(), self.children.len());

        self.children[pos].priority += 1;
        let prio = self.children[pos].priority;

        let mut new_pos = pos;
        while new_pos > 0 && self.children[new_pos - 1].priority < prio {
            new_pos -= 1;
        }

        if new_pos != pos {
            self.children[new_pos..=pos].rotate_right(1);
            self.indices[new_pos..=pos].rotate_right(1);
        }

        new_pos
    }

    /// Walk the subtree checking that every node's priority equals the
    /// number of handlers below it. Used by the tree tests.
    #[cfg(test)]
    pub(crate) fn check_priority(&self) -> u32 {
        let mut prio = u32::from(self.handler.is_some());
        for child in &self.children {
            prio += child.check_priority();
        }
        assert_eq!(
            prio, self.priority,
            "priority mismatch at node path={:?}",
            self.path
        );
        prio
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Wildcard<'a> {
    /// No wildcard in the path.
    None,
    /// A wildcard marker is present but the token is malformed: empty name,
    /// or a second `:`/`*` before the next `/`.
    Invalid,
    /// A well-formed wildcard token, name including its `:`/`*` marker.
    Token { name: &'a str, pos: usize },
}

/// Find the first wildcard token in a pattern.
pub(super) fn find_wildcard(path: &str) -> Wildcard<'_> {
    let Some(start) = path.find([':', '*']) else {
        return Wildcard::None;
    };

    let rest = &path[start + 1..];
    let token = match rest.find([':', '*', '/']) {
        None => &path[start..],
        Some(stop) if rest.as_bytes()[stop] == b'/' => &path[start..=start + stop],
        Some(_) => return Wildcard::Invalid,
    };

    if token.len() > 1 {
        Wildcard::Token { name: token, pos: start }
    } else {
        Wildcard::Invalid
    }
}

/// Length of the common prefix of two strings, in bytes.
pub(super) fn longest_common_prefix(s1: &str, s2: &str) -> usize {
    s1.bytes()
        .zip(s2.bytes())
        .take_while(|(a, b)| a == b)
        .count()
}
