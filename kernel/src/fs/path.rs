//! Path canonicalisation
//!
//! Every path entering the VFS is simplified first: `//` runs collapse,
//! `.` vanishes, `..` pops a component, nothing ends with a trailing
//! slash. The canonical form of the root is `/`. Simplification is
//! idempotent, which the name cache relies on for exact-match probing.

use alloc::string::String;
use alloc::vec::Vec;

/// Canonicalise `path`. Leading `..` components at the root are dropped
/// (`/../a` is `/a`).
pub fn simplify(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();

    for sub in path.split('/') {
        match sub {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return String::from("/");
    }

    let mut out = String::with_capacity(path.len());
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

/// True for absolute paths.
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Join `path` onto `cwd` unless it is already absolute, then simplify.
pub fn absolute(cwd: &str, path: &str) -> String {
    if is_absolute(path) {
        simplify(path)
    } else {
        let mut joined = String::with_capacity(cwd.len() + path.len() + 1);
        joined.push_str(cwd);
        joined.push('/');
        joined.push_str(path);
        simplify(&joined)
    }
}

/// Split a canonical path into parent and leaf name. The root has no
/// parent.
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let cut = path.rfind('/')?;
    let parent = if cut == 0 { "/" } else { &path[..cut] };
    Some((parent, &path[cut + 1..]))
}

/// Iterate the components of a canonical path.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_slashes_and_dots() {
        assert_eq!(simplify("//a///b//"), "/a/b");
        assert_eq!(simplify("/a/./b/."), "/a/b");
        assert_eq!(simplify("/a/b/.."), "/a");
        assert_eq!(simplify("/a/b/../.."), "/");
        assert_eq!(simplify("/a/b/../../.."), "/");
        assert_eq!(simplify("/"), "/");
        assert_eq!(simplify(""), "/");
    }

    #[test]
    fn simplify_is_idempotent() {
        for p in ["//x/../y//z", "/", "/a", "/a/b/c/../d", "a/b/../c"] {
            let once = simplify(p);
            assert_eq!(simplify(&once), once);
        }
    }

    #[test]
    fn absolute_joins_cwd() {
        assert_eq!(absolute("/home", "file"), "/home/file");
        assert_eq!(absolute("/home", "/etc/x"), "/etc/x");
        assert_eq!(absolute("/home", "../etc"), "/etc");
        assert_eq!(absolute("/", "a"), "/a");
    }

    #[test]
    fn parent_split() {
        assert_eq!(split_parent("/a/b"), Some(("/a", "b")));
        assert_eq!(split_parent("/a"), Some(("/", "a")));
        assert_eq!(split_parent("/"), None);
    }

    #[test]
    fn component_iteration() {
        let c: alloc::vec::Vec<&str> = components("/a/b/c").collect();
        assert_eq!(c, ["a", "b", "c"]);
        assert_eq!(components("/").count(), 0);
    }
}
