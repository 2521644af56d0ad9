//! Pure path manipulation utilities.
//!
//! Every function here is total and allocation-free except `join`,
//! `resolve` and `resolve_dot`, which build a new path and therefore need
//! somewhere to put it. There is no notion of a current working directory
//! below this module and no filesystem access happens here: callers own
//! that state and pass it in.
//!
//! Paths are plain `&str`. A leading `X:` (single ASCII letter or digit)
//! marks a drive-rooted path; everything else is unix-style. Drive paths
//! are "jailed" to their drive root: `..` above the root silently stays at
//! the root instead of escaping it, mirroring how removable/ROM media is
//! addressed on these targets.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

/// Path separator.
pub const SEPARATOR: char = '/';

/// Default bound used by callers that don't have a more specific limit.
pub const PATH_MAX: usize = 256;

/// Default bound on a single path component.
pub const NAME_MAX: usize = 255;

/// Returned by [`join`] and friends when the composed path would not fit
/// in the caller-supplied limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooLong;

fn drive_letter(s: &str) -> Option<u8> {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphanumeric() {
        Some(bytes[0])
    } else {
        None
    }
}

/// The drive letter prefixing `path`, if any.
pub fn drive(path: &str) -> Option<char> {
    drive_letter(path).map(|b| b as char)
}

/// Splits `path` into an optional drive prefix and the remainder that
/// follows it (including any leading `/`).
fn split_drive(path: &str) -> (Option<u8>, &str) {
    match drive_letter(path) {
        Some(d) => (Some(d), &path[2..]),
        None => (None, path),
    }
}

/// True if `path` is rooted: either a unix path starting with `/`, or a
/// drive path (`C:`, `C:/...`).
pub fn is_absolute(path: &str) -> bool {
    let (d, rest) = split_drive(path);
    d.is_some() || rest.starts_with(SEPARATOR)
}

/// The complement of [`is_absolute`].
pub fn is_relative(path: &str) -> bool {
    !is_absolute(path)
}

/// True if `path` names a filesystem root: `/`, or a bare drive root
/// (`C:`, `C:/`).
pub fn is_root(path: &str) -> bool {
    let (d, rest) = split_drive(path);
    match d {
        Some(_) => rest.is_empty() || rest == "/",
        None => path == "/",
    }
}

/// Splits off the first path segment, returning `(segment, remainder)`.
/// The remainder starts with `/` if more segments follow; callers loop by
/// feeding the remainder back in. Returns `None` once nothing is left.
///
/// Drive prefixes are not a segment of their own; call [`drive`]
/// separately if you need it.
pub fn top(path: &str) -> Option<(&str, &str)> {
    let (_, rest) = split_drive(path);
    let mut s = rest;
    while let Some(stripped) = s.strip_prefix(SEPARATOR) {
        s = stripped;
    }
    if s.is_empty() {
        return None;
    }
    match s.find(SEPARATOR) {
        Some(i) => Some((&s[..i], &s[i..])),
        None => Some((s, "")),
    }
}

/// Splits off the last path segment, returning `(remainder, segment)`.
/// Symmetric to [`top`]: the remainder is fed back into further calls to
/// `tail` to walk from the end towards the front.
pub fn tail(path: &str) -> Option<(&str, &str)> {
    let (_drv, rest) = split_drive(path);
    let mut s = rest;
    while s.len() > 1 && s.ends_with(SEPARATOR) {
        s = &s[..s.len() - 1];
    }
    if s.is_empty() || s == "/" {
        return None;
    }
    let (before, last) = match s.rfind(SEPARATOR) {
        Some(0) => ("/", &s[1..]),
        Some(i) => (&s[..i], &s[i + 1..]),
        None => ("", s),
    };
    Some((before, last))
}

/// The final path segment: the file or directory name. `None` for the
/// root and for an empty path.
pub fn name(path: &str) -> Option<&str> {
    tail(path).map(|(_, n)| n)
}

fn is_all_dots(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b == b'.')
}

/// The suffix (extension) of the final segment, dot included. `None` when
/// the segment has no meaningful suffix: it is empty, made entirely of
/// dots, or its only dot is the leading character (a hidden file like
/// `.vim` has no suffix; `..vim` does, `.vim`).
pub fn suffix(path: &str) -> Option<&str> {
    let seg = name(path)?;
    if is_all_dots(seg) {
        return None;
    }
    match seg.rfind('.') {
        Some(0) | None => None,
        Some(pos) => Some(&seg[pos..]),
    }
}

/// The final segment with its [`suffix`] removed, if any.
pub fn stem(path: &str) -> Option<&str> {
    let seg = name(path)?;
    if is_all_dots(seg) {
        return Some(seg);
    }
    match seg.rfind('.') {
        Some(0) | None => Some(seg),
        Some(pos) => Some(&seg[..pos]),
    }
}

/// The path with the final segment removed. `None` for the root and for
/// a single relative segment with nothing above it.
pub fn parent(path: &str) -> Option<&str> {
    let (before, _) = tail(path)?;
    if before.is_empty() {
        None
    } else {
        Some(before)
    }
}

/// Appends `component` to `base`. If `component` is itself absolute (or
/// carries its own drive letter) it replaces `base` entirely, matching
/// the usual "join with an absolute path resets the base" convention.
/// Fails with [`TooLong`] if the result would not fit in `limit` bytes.
pub fn join(base: &str, component: &str, limit: usize) -> Result<String, TooLong> {
    let joined = if is_absolute(component) {
        String::from(component)
    } else if base.is_empty() {
        String::from(component)
    } else if base.ends_with(SEPARATOR) {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    };
    if joined.len() > limit {
        Err(TooLong)
    } else {
        Ok(joined)
    }
}

/// Resolves `.` and `..` segments in `path` without touching the
/// filesystem. A drive-rooted path is jailed: `..` above the drive root
/// stays at the root. A unix absolute path behaves the same way. A unix
/// relative path may accumulate leading `..` segments, since there is no
/// root to clamp against. A trailing `/` on the input is preserved on the
/// output, if the result is not itself the root.
pub fn resolve_dot(path: &str) -> String {
    let (drv, rest) = split_drive(path);
    let absolute = drv.is_some() || rest.starts_with(SEPARATOR);
    let had_trailing_slash = rest.len() > 1 && rest.ends_with(SEPARATOR);

    let mut components: Vec<&str> = Vec::new();
    for part in rest.split(SEPARATOR) {
        match part {
            "" | "." => continue,
            ".." => {
                if absolute {
                    components.pop();
                } else if components.last() == Some(&"..") || components.is_empty() {
                    components.push("..");
                } else {
                    components.pop();
                }
            }
            _ => components.push(part),
        }
    }

    let mut out = String::new();
    if let Some(d) = drv {
        out.push(d as char);
        out.push(':');
    }
    if absolute {
        out.push(SEPARATOR);
        out.push_str(&components.join("/"));
        if out.len() > 1 && out.ends_with(SEPARATOR) {
            out.pop();
        }
    } else if components.is_empty() {
        out.push('.');
    } else {
        out.push_str(&components.join("/"));
    }

    if had_trailing_slash && !out.ends_with(SEPARATOR) {
        out.push(SEPARATOR);
    }
    out
}

/// Resolves `path` against `cwd` (joining it first if `path` is relative)
/// and then collapses `.`/`..` segments, failing with [`TooLong`] if the
/// intermediate or final result would not fit in `limit` bytes.
pub fn resolve(cwd: &str, path: &str, limit: usize) -> Result<String, TooLong> {
    let joined = join(cwd, path, limit)?;
    let resolved = resolve_dot(&joined);
    if resolved.len() > limit {
        Err(TooLong)
    } else {
        Ok(resolved)
    }
}

/// True if a single path component is a legal file/directory name: not
/// empty, not `.`/`..`, free of separators and NUL, and within
/// [`NAME_MAX`] bytes.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(SEPARATOR)
        && !name.contains('\\')
        && !name.contains('\0')
        && name.len() <= NAME_MAX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_dot_drive_jail() {
        assert_eq!(
            resolve_dot("C:/ABC/DEF/./GHI/../.././JKL"),
            "C:/ABC/JKL"
        );
    }

    #[test]
    fn resolve_dot_cannot_escape_root() {
        assert_eq!(resolve_dot("/../../etc"), "/etc");
        assert_eq!(resolve_dot("C:/../../x"), "C:/x");
    }

    #[test]
    fn resolve_dot_relative_keeps_leading_dotdot() {
        assert_eq!(resolve_dot("../a/../b"), "../b");
    }

    #[test]
    fn suffix_and_stem_hidden_files() {
        assert_eq!(suffix("/foo/bar/..vim"), Some(".vim"));
        assert_eq!(suffix("/foo/bar/.vim"), None);
        assert_eq!(stem("/foo/bar/..vim"), Some("."));
        assert_eq!(stem("/foo/bar/baz.tar.gz"), Some("baz.tar"));
        assert_eq!(suffix("/foo/bar/baz.tar.gz"), Some(".gz"));
    }

    #[test]
    fn name_and_parent() {
        assert_eq!(name("/foo/bar"), Some("bar"));
        assert_eq!(parent("/foo/bar"), Some("/foo"));
        assert_eq!(parent("/foo"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(parent("foo"), None);
    }

    #[test]
    fn top_walks_forward() {
        let mut rest = "/a/b/c";
        let mut segs = Vec::new();
        while let Some((seg, next)) = top(rest) {
            segs.push(seg);
            rest = next;
        }
        assert_eq!(segs, alloc::vec!["a", "b", "c"]);
    }

    #[test]
    fn tail_walks_backward() {
        let mut rest = "/a/b/c";
        let mut segs = Vec::new();
        while let Some((before, seg)) = tail(rest) {
            segs.push(seg);
            rest = before;
        }
        assert_eq!(segs, alloc::vec!["c", "b", "a"]);
    }

    #[test]
    fn drive_and_root() {
        assert_eq!(drive("C:/foo"), Some('C'));
        assert_eq!(drive("/foo"), None);
        assert!(is_root("/"));
        assert!(is_root("C:/"));
        assert!(is_root("C:"));
        assert!(!is_root("/foo"));
    }

    #[test]
    fn join_absolute_component_resets_base() {
        assert_eq!(join("/a/b", "/c", 256).unwrap(), "/c");
        assert_eq!(join("/a/b", "c", 256).unwrap(), "/a/b/c");
        assert_eq!(join("/a/b/", "c", 256).unwrap(), "/a/b/c");
    }

    #[test]
    fn join_respects_limit() {
        assert_eq!(join("/a", "bbbbb", 5), Err(TooLong));
    }

    #[test]
    fn is_valid_name_rejects_dots_and_separators() {
        assert!(is_valid_name("readme.txt"));
        assert!(!is_valid_name("."));
        assert!(!is_valid_name(".."));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name(""));
    }
}
