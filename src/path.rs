//! Normalised site paths.
//!
//! Destinations, web paths and source references all travel as
//! [`SitePath`]: forward-slash separated, with `.` and `..` resolved at
//! parse time. A separate helper normalises real filesystem paths for the
//! module registry's cache key.

use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A normalised path with `/` separators.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SitePath {
    absolute: bool,
    segments: Vec<String>,
}

impl SitePath {
    /// Parse and normalise. `.` segments vanish, `..` pops where it can;
    /// a relative path keeps leading `..` segments, an absolute one drops
    /// them.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let absolute = text.starts_with('/');
        let mut segments: Vec<String> = Vec::new();
        for part in text.split('/') {
            match part {
                "" | "." => (),
                ".." => {
                    if segments.last().is_some_and(|s| s != "..") {
                        segments.pop();
                    } else if !absolute {
                        segments.push("..".to_string());
                    }
                }
                other => segments.push(other.to_string()),
            }
        }
        Self { absolute, segments }
    }

    #[must_use]
    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Append `other`; an absolute `other` replaces `self` entirely.
    #[must_use]
    pub fn join(&self, other: &str) -> Self {
        let other = Self::parse(other);
        if other.absolute {
            return other;
        }
        let mut joined = self.clone();
        for segment in other.segments {
            if segment == ".." {
                if joined.segments.last().is_some_and(|s| s != "..") {
                    joined.segments.pop();
                } else if !joined.absolute {
                    joined.segments.push(segment);
                }
            } else {
                joined.segments.push(segment);
            }
        }
        joined
    }

    /// The path without its final segment; `None` when there is nothing
    /// left to drop.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        let mut parent = self.clone();
        parent.segments.pop();
        Some(parent)
    }

    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The extension of the final segment, without the dot.
    #[must_use]
    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() {
            None
        } else {
            Some(ext)
        }
    }

    /// Express `self` relative to `base` (both must agree on
    /// absoluteness): the shared prefix is stripped and remaining base
    /// segments become `..`.
    #[must_use]
    pub fn relative_to(&self, base: &Self) -> Option<Self> {
        if self.absolute != base.absolute {
            return None;
        }
        let common = self
            .segments
            .iter()
            .zip(base.segments.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let mut segments: Vec<String> =
            std::iter::repeat("..".to_string()).take(base.segments.len() - common).collect();
        segments.extend(self.segments[common..].iter().cloned());
        Some(Self { absolute: false, segments })
    }

    /// Convert for filesystem use.
    #[must_use]
    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(self.to_string())
    }
}

impl fmt::Display for SitePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            f.write_str("/")?;
        } else if self.segments.is_empty() {
            return f.write_str(".");
        }
        f.write_str(&self.segments.join("/"))
    }
}

impl From<&str> for SitePath {
    fn from(text: &str) -> Self {
        Self::parse(text)
    }
}

/// Normalise a filesystem path for cache keying: make it absolute against
/// the current directory and resolve `.`/`..` lexically (no symlink
/// traversal, so missing files still normalise).
#[must_use]
pub fn normalize_fs(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => (),
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalises() {
        assert_eq!(SitePath::parse("/a/./b/../c").to_string(), "/a/c");
        assert_eq!(SitePath::parse("a//b/").to_string(), "a/b");
        assert_eq!(SitePath::parse("../x").to_string(), "../x");
        assert_eq!(SitePath::parse("/../x").to_string(), "/x");
        assert_eq!(SitePath::parse("").to_string(), ".");
    }

    #[test]
    fn join_resolves_parents() {
        let base = SitePath::parse("posts/2024");
        assert_eq!(base.join("img/cover.png").to_string(), "posts/2024/img/cover.png");
        assert_eq!(base.join("../index.html").to_string(), "posts/index.html");
        assert_eq!(base.join("/top.html").to_string(), "/top.html");
    }

    #[test]
    fn parent_and_names() {
        let path = SitePath::parse("a/b/page.html");
        assert_eq!(path.parent().map(|p| p.to_string()), Some("a/b".to_string()));
        assert_eq!(path.file_name(), Some("page.html"));
        assert_eq!(path.extension(), Some("html"));
        assert_eq!(SitePath::parse("a/.hidden").extension(), None);
        assert!(SitePath::parse("").parent().is_none());
    }

    #[test]
    fn relative_to_strips_common_prefix() {
        let page = SitePath::parse("/dist/posts/a.html");
        let root = SitePath::parse("/dist");
        assert_eq!(page.relative_to(&root).map(|p| p.to_string()), Some("posts/a.html".to_string()));

        let sibling = SitePath::parse("/dist/img/x.png");
        assert_eq!(
            sibling.relative_to(&SitePath::parse("/dist/posts")).map(|p| p.to_string()),
            Some("../img/x.png".to_string())
        );
        assert!(page.relative_to(&SitePath::parse("dist")).is_none());
    }

    #[test]
    fn normalize_fs_resolves_lexically() {
        let normalized = normalize_fs(Path::new("/a/b/../c/./d.html"));
        assert_eq!(normalized, PathBuf::from("/a/c/d.html"));
        // Relative paths become absolute.
        assert!(normalize_fs(Path::new("x.html")).is_absolute());
    }
}
