// src/kernel/fs/path.rs
//! Path normalization
//!
//! Turns a user-supplied path plus the process cwd into the canonical
//! component list the filesystem consumes: no empty components, no
//! `.`, every `..` resolved. Sanitizing is idempotent - feeding the
//! joined result back in yields the same components.

use alloc::string::String;
use alloc::vec::Vec;

/// The path could not be normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadPath;

/// Normalize `path` against `cwd` into filesystem components.
///
/// Relative paths are resolved under `cwd` (which must be absolute).
/// An empty path and a `..` that would climb above the root are
/// malformed. An empty component list names the root itself.
pub fn path_sanitize(cwd: &str, path: &str) -> Result<Vec<String>, BadPath> {
    if path.is_empty() {
        return Err(BadPath);
    }
    let full = if path.starts_with('/') {
        String::from(path)
    } else {
        let mut f = String::from(cwd);
        f.push('/');
        f.push_str(path);
        f
    };
    let mut parts: Vec<String> = Vec::new();
    for c in full.split('/') {
        match c {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(BadPath);
                }
            }
            _ => parts.push(String::from(c)),
        }
    }
    Ok(parts)
}
