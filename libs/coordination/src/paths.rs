//! Path layout under the configured root.
//!
//! Paths are `/`-separated and absolute. The layout is a pure translator from
//! logical entries (a node report, a watcher registration) to concrete paths;
//! no path strings are built elsewhere.

use crate::error::{CoordinationError, CoordinationResult};

const NODES: &str = "nodes";
const WATCHERS: &str = "watchers";

/// Check that `path` is absolute, has no empty components and no trailing
/// slash (the root `/` excepted).
pub fn validate(path: &str) -> CoordinationResult<()> {
    if !path.starts_with('/') {
        return Err(CoordinationError::BadArguments(format!(
            "path must be absolute: {path:?}"
        )));
    }
    if path == "/" {
        return Ok(());
    }
    if path[1..].split('/').any(str::is_empty) {
        return Err(CoordinationError::BadArguments(format!(
            "path has an empty component: {path:?}"
        )));
    }
    Ok(())
}

/// Parent of a valid path, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Every ancestor of a valid path below the root, then the path itself.
/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`.
pub fn ancestors_and_self(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/')
        .skip(1)
        .map(move |(idx, _)| &path[..idx])
        .chain((path != "/").then_some(path))
}

/// Replace anything outside `[A-Za-z0-9-_.]` so a value can be used as a
/// single path component.
pub fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Maps logical entries to concrete paths below `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLayout {
    root: String,
}

impl PathLayout {
    /// Returns an error if `root` is not a valid absolute path.
    pub fn new(root: impl Into<String>) -> CoordinationResult<Self> {
        let root = root.into();
        validate(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn join(&self, rest: &str) -> String {
        if self.root == "/" {
            format!("/{rest}")
        } else {
            format!("{}/{rest}", self.root)
        }
    }

    /// Parent of all node reports.
    pub fn nodes(&self) -> String {
        self.join(NODES)
    }

    /// Directory holding every watcher's report for one node.
    pub fn node(&self, host: &str, port: u16) -> String {
        self.join(&format!(
            "{NODES}/{}",
            sanitize_component(&format!("{host}:{port}"))
        ))
    }

    /// One watcher's report for one node.
    pub fn node_report(&self, host: &str, port: u16, watcher_id: &str) -> String {
        format!(
            "{}/{}",
            self.node(host, port),
            sanitize_component(watcher_id)
        )
    }

    /// Parent of all watcher registrations.
    pub fn watchers(&self) -> String {
        self.join(WATCHERS)
    }

    /// Ephemeral membership entry of one watcher.
    pub fn watcher(&self, watcher_id: &str) -> String {
        format!("{}/{}", self.watchers(), sanitize_component(watcher_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(validate("/").is_ok());
        assert!(validate("/a").is_ok());
        assert!(validate("/a/b.c/d-e").is_ok());
        assert!(validate("").is_err());
        assert!(validate("a/b").is_err());
        assert!(validate("/a/").is_err());
        assert!(validate("/a//b").is_err());
    }

    #[test]
    fn test_parent() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/a/b/c"), Some("/a/b"));
    }

    #[test]
    fn test_ancestors_and_self() {
        let all = ancestors_and_self("/a/b/c").collect::<Vec<_>>();
        assert_eq!(all, vec!["/a", "/a/b", "/a/b/c"]);
        assert_eq!(ancestors_and_self("/a").collect::<Vec<_>>(), vec!["/a"]);
        assert_eq!(ancestors_and_self("/").count(), 0);
    }

    #[test]
    fn test_layout() {
        let layout = PathLayout::new("/vigil").unwrap();
        assert_eq!(layout.nodes(), "/vigil/nodes");
        assert_eq!(layout.node("10.0.0.1", 6379), "/vigil/nodes/10.0.0.1_6379");
        assert_eq!(
            layout.node_report("10.0.0.1", 6379, "watcher a"),
            "/vigil/nodes/10.0.0.1_6379/watcher_a"
        );
        assert_eq!(layout.watcher("w1"), "/vigil/watchers/w1");

        let root = PathLayout::new("/").unwrap();
        assert_eq!(root.watchers(), "/watchers");
        assert!(PathLayout::new("vigil").is_err());
    }
}
