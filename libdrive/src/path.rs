//! Normalized path helpers. Paths are forward-slash separated with no
//! leading or trailing slash; the empty string is the root.

/// Normalize a raw path: resolve `.` and `..`, collapse separators,
/// strip control characters.
pub fn clean(raw: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in raw.split('/') {
        let seg = seg.trim_matches(|c: char| c.is_control());
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Parent of a normalized path; the root's parent is the root.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

/// Last segment of a normalized path; `""` for the root.
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        parent.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

pub fn is_root(path: &str) -> bool {
    path.is_empty()
}

/// Number of segments; the root has depth zero.
pub fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split('/').count()
    }
}

pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// True when `ancestor` is `path` itself or a path prefix of it at a
/// segment boundary. The root is an ancestor of everything.
pub fn is_self_or_ancestor(ancestor: &str, path: &str) -> bool {
    if ancestor.is_empty() || ancestor == path {
        return true;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Strip a normalized ancestor prefix; `None` when it does not apply.
pub fn strip_prefix<'a>(path: &'a str, ancestor: &str) -> Option<&'a str> {
    if ancestor.is_empty() {
        return Some(path);
    }
    if path == ancestor {
        return Some("");
    }
    if is_self_or_ancestor(ancestor, path) {
        Some(&path[ancestor.len() + 1..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_resolves_dots_and_slashes() {
        assert_eq!(clean("/a/b/"), "a/b");
        assert_eq!(clean("a//b"), "a/b");
        assert_eq!(clean("a/./b"), "a/b");
        assert_eq!(clean("a/b/../c"), "a/c");
        assert_eq!(clean("../../a"), "a");
        assert_eq!(clean(""), "");
        assert_eq!(clean("/"), "");
        assert_eq!(clean("a/\u{1}b"), "a/b");
    }

    #[test]
    fn parent_and_base() {
        assert_eq!(parent("a/b/c"), "a/b");
        assert_eq!(parent("a"), "");
        assert_eq!(parent(""), "");
        assert_eq!(base_name("a/b/c"), "c");
        assert_eq!(base_name("a"), "a");
        assert_eq!(base_name(""), "");
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a", "b"), "a/b");
        assert_eq!(join("a", ""), "a");
    }

    #[test]
    fn ancestor_checks() {
        assert!(is_self_or_ancestor("", "a/b"));
        assert!(is_self_or_ancestor("a", "a/b"));
        assert!(is_self_or_ancestor("a/b", "a/b"));
        assert!(!is_self_or_ancestor("a/b", "a/bc"));
        assert!(!is_self_or_ancestor("a/b", "a"));
        assert_eq!(strip_prefix("a/b/c", "a"), Some("b/c"));
        assert_eq!(strip_prefix("a/b", "a/b"), Some(""));
        assert_eq!(strip_prefix("a/bc", "a/b"), None);
        assert_eq!(strip_prefix("x", ""), Some("x"));
    }

    #[test]
    fn depth_counts_segments() {
        assert_eq!(depth(""), 0);
        assert_eq!(depth("a"), 1);
        assert_eq!(depth("a/b/c"), 3);
    }
}
