//! Namespace paths and the pool layout.
//!
//! Paths are absolute, `/`-separated and normalized: no trailing slash, no
//! empty, `.` or `..` segments. `/` itself is the namespace root.

use crate::error::{CoordinationError, Result};

/// Default parent of one child node per slot.
pub const DEFAULT_POOL_ROOT: &str = "/nameplate/server-names";

/// Default bookkeeping path of the admission semaphore.
pub const DEFAULT_SEMAPHORE_PATH: &str = "/nameplate/server-names-semaphore";

/// Where the pool and its admission semaphore live in the namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceLayout {
    pub root: String,
    pub semaphore: String,
}

impl Default for NamespaceLayout {
    fn default() -> Self {
        Self {
            root: DEFAULT_POOL_ROOT.to_owned(),
            semaphore: DEFAULT_SEMAPHORE_PATH.to_owned(),
        }
    }
}

impl NamespaceLayout {
    /// Builds a layout after checking both paths.
    ///
    /// The semaphore must not live under the pool root, otherwise its
    /// bookkeeping nodes would show up as slots.
    pub fn new(root: impl Into<String>, semaphore: impl Into<String>) -> Result<Self> {
        let root = root.into();
        let semaphore = semaphore.into();
        validate_path(&root)?;
        validate_path(&semaphore)?;
        if root == "/" || semaphore == root || semaphore.starts_with(&format!("{root}/")) {
            return Err(CoordinationError::BadPath {
                path: semaphore,
                reason: "semaphore path must be outside the pool root",
            });
        }
        Ok(Self { root, semaphore })
    }

    pub fn slot_path(&self, slot: &str) -> String {
        join(&self.root, slot)
    }
}

/// Checks that `path` is absolute and normalized.
pub fn validate_path(path: &str) -> Result<()> {
    let bad = |reason| {
        Err(CoordinationError::BadPath {
            path: path.to_owned(),
            reason,
        })
    };

    if !path.starts_with('/') {
        return bad("must start with '/'");
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return bad("must not end with '/'");
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return bad("empty segment"),
            "." | ".." => return bad("relative segment"),
            _ => {}
        }
    }
    Ok(())
}

/// Appends one segment to `parent`.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of a non-root path; `/` for top-level nodes.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last segment of a path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unnormalized_paths() {
        for path in ["", "relative", "/trailing/", "/a//b", "/a/./b", "/a/.."] {
            assert!(validate_path(path).is_err(), "{path:?} should be rejected");
        }
        for path in ["/", "/a", "/a/b-c/d_0000000001"] {
            assert!(validate_path(path).is_ok(), "{path:?} should be accepted");
        }
    }

    #[test]
    fn joins_and_splits() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/a/b/c"), "/a/b");
        assert_eq!(node_name("/a/b/c"), "c");
    }

    #[test]
    fn semaphore_must_sit_outside_the_pool() {
        assert!(NamespaceLayout::new("/pool", "/pool/sem").is_err());
        assert!(NamespaceLayout::new("/pool", "/pool").is_err());
        let layout = NamespaceLayout::new("/pool", "/pool-sem").unwrap();
        assert_eq!(layout.slot_path("alpha"), "/pool/alpha");
    }
}
