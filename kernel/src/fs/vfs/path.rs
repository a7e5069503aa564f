//! Filesystem paths.
//!
//! Paths are `/`-separated ASCII strings. Absolute paths start with `/`;
//! relative paths are resolved against a working directory before they
//! reach a driver. Normalization collapses `.`, `..` and repeated
//! separators and is idempotent.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Path {
    inner: String,
}

impl Path {
    pub fn new(path: &str) -> Self {
        Self {
            inner: path.to_string(),
        }
    }

    pub fn root() -> Self {
        Self {
            inner: String::from("/"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn is_absolute(&self) -> bool {
        self.inner.starts_with('/')
    }

    pub fn is_root(&self) -> bool {
        self.inner == "/"
    }

    /// The path's components, skipping empty segments.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.inner.split('/').filter(|c| !c.is_empty())
    }

    /// Collapse `.` and `..` segments and repeated separators.
    ///
    /// On absolute paths `..` never climbs above the root. Relative paths
    /// keep leading `..` segments.
    pub fn normalize(&self) -> Path {
        let absolute = self.is_absolute();
        let mut parts: Vec<&str> = Vec::new();
        for component in self.components() {
            match component {
                "." => {}
                ".." => {
                    if parts.last().map(|p| *p != "..").unwrap_or(false) {
                        parts.pop();
                    } else if !absolute {
                        parts.push("..");
                    }
                }
                other => parts.push(other),
            }
        }
        let mut result = String::new();
        if absolute {
            result.push('/');
        }
        result.push_str(&parts.join("/"));
        if result.is_empty() {
            result.push('.');
        }
        Path { inner: result }
    }

    /// Append a component.
    pub fn join(&self, component: &str) -> Path {
        let mut inner = self.inner.clone();
        if !inner.ends_with('/') {
            inner.push('/');
        }
        inner.push_str(component.trim_start_matches('/'));
        Path { inner }
    }

    /// Resolve against a base directory: absolute paths stand alone,
    /// relative ones are appended to `base`. The result is normalized.
    pub fn resolve(&self, base: &Path) -> Path {
        if self.is_absolute() {
            self.normalize()
        } else {
            base.join(&self.inner).normalize()
        }
    }

    /// Everything before the final component (`/` for top-level entries).
    pub fn parent(&self) -> Path {
        let normalized = self.normalize();
        match normalized.inner.rfind('/') {
            Some(0) => Path::root(),
            Some(pos) => Path {
                inner: normalized.inner[..pos].to_string(),
            },
            None => Path::new("."),
        }
    }

    /// The final component, empty for the root.
    pub fn file_name(&self) -> &str {
        self.inner.rsplit('/').next().unwrap_or("")
    }

    /// The path relative to `prefix`, when `prefix` leads this path.
    pub fn strip_prefix(&self, prefix: &Path) -> Option<Path> {
        if prefix.is_root() {
            if self.is_absolute() {
                return Some(Path {
                    inner: self.inner.trim_start_matches('/').to_string(),
                });
            }
            return None;
        }
        let rest = self.inner.strip_prefix(prefix.inner.as_str())?;
        if rest.is_empty() {
            return Some(Path::new(""));
        }
        // Reject partial component matches like "/mnt" vs "/mntx".
        if !rest.starts_with('/') {
            return None;
        }
        Some(Path {
            inner: rest.trim_start_matches('/').to_string(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl core::fmt::Display for Path {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_dots() {
        assert_eq!(Path::new("/a/./b/../c").normalize().as_str(), "/a/c");
        assert_eq!(Path::new("/a//b///c").normalize().as_str(), "/a/b/c");
        assert_eq!(Path::new("/..").normalize().as_str(), "/");
        assert_eq!(Path::new("/").normalize().as_str(), "/");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in ["/a/./b/../c", "a/../../b", "/x//y/.", "./rel/path"] {
            let once = Path::new(raw).normalize();
            let twice = once.normalize();
            assert_eq!(once, twice, "normalize not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_relative_keeps_leading_parent_refs() {
        assert_eq!(Path::new("../x").normalize().as_str(), "../x");
        assert_eq!(Path::new("a/../../b").normalize().as_str(), "../b");
    }

    #[test]
    fn test_resolve_against_working_directory() {
        let cwd = Path::new("/home/user");
        assert_eq!(Path::new("notes.txt").resolve(&cwd).as_str(), "/home/user/notes.txt");
        assert_eq!(Path::new("../other").resolve(&cwd).as_str(), "/home/other");
        assert_eq!(Path::new("/abs").resolve(&cwd).as_str(), "/abs");
    }

    #[test]
    fn test_parent_and_file_name() {
        let p = Path::new("/a/b/c.txt");
        assert_eq!(p.parent().as_str(), "/a/b");
        assert_eq!(p.file_name(), "c.txt");
        assert_eq!(Path::new("/top").parent().as_str(), "/");
    }

    #[test]
    fn test_strip_prefix() {
        let p = Path::new("/mnt/data/file");
        assert_eq!(p.strip_prefix(&Path::new("/mnt/data")).unwrap().as_str(), "file");
        assert_eq!(p.strip_prefix(&Path::root()).unwrap().as_str(), "mnt/data/file");
        assert!(p.strip_prefix(&Path::new("/mnt/da")).is_none());
        assert_eq!(
            Path::new("/mnt/data").strip_prefix(&Path::new("/mnt/data")).unwrap().as_str(),
            ""
        );
    }
}
