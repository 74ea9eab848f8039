//! Path helpers shared by the writer and extensions.

use regex::Regex;
use std::path::{Path, PathBuf};

use crate::store::Value;

/// Join URL path segments with single slashes, keeping a leading slash if
/// the first segment has one.
///
/// ```
/// use sitekiln::util::url_path_helper;
/// assert_eq!(url_path_helper(&["/blog/", "/2024/", "post"]), "/blog/2024/post");
/// ```
pub fn url_path_helper(parts: &[&str]) -> String {
    let leading = parts.first().is_some_and(|p| p.starts_with('/'));
    let joined = parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if leading { format!("/{joined}") } else { joined }
}

/// Absolute URL path of `parts` under the site root URL's path.
pub fn site_path_helper(site_url: &str, parts: &[&str]) -> String {
    let root = url::Url::parse(site_url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| "/".to_string());
    let mut all = vec![root.as_str()];
    all.extend_from_slice(parts);
    let path = url_path_helper(&all);
    if path.is_empty() { "/".to_string() } else { path }
}

/// Filesystem-relative form of [`site_path_helper`]: no leading slash,
/// native separators.
pub fn fs_site_path_helper(site_url: &str, parts: &[&str]) -> PathBuf {
    site_path_helper(site_url, parts)
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// `./`-prefixed, slash-separated form of `path` relative to `root`, the
/// shape ignore patterns are written against.
pub fn pattern_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    format!("./{rel}")
}

/// Whether any compiled pattern matches `path` starting at its first byte.
pub fn should_ignore_path(patterns: &[Value], path: &str) -> bool {
    patterns.iter().any(|pattern| match pattern {
        Value::Pattern(re) => matches_at_start(re, path),
        _ => false,
    })
}

fn matches_at_start(re: &Regex, text: &str) -> bool {
    re.find(text).is_some_and(|m| m.start() == 0)
}
