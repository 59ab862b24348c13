use crate::constants::PATH_SEPARATOR;

/// Parent of an absolute path; the root is its own parent
pub fn parent_path(path: &str) -> String {
    match path.rfind(PATH_SEPARATOR) {
        Some(0) | None => PATH_SEPARATOR.to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Last segment of an absolute path, empty for the root
pub fn node_name(path: &str) -> &str {
    match path.rfind(PATH_SEPARATOR) {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Joins a parent path and a child name
pub fn make_path(
    parent: &str,
    child: &str,
) -> String {
    if parent.ends_with(PATH_SEPARATOR) {
        format!("{parent}{child}")
    } else {
        format!("{parent}{PATH_SEPARATOR}{child}")
    }
}

/// True if `path` lies strictly below `base`
pub fn is_descendant(
    base: &str,
    path: &str,
) -> bool {
    if path.len() <= base.len() || !path.starts_with(base) {
        return false;
    }
    base.ends_with(PATH_SEPARATOR) || path.as_bytes()[base.len()] == PATH_SEPARATOR as u8
}

/// Number of segments between `base` and `path`; 0 when equal.
///
/// Returns `None` if `path` is neither `base` nor below it.
pub fn depth_below(
    base: &str,
    path: &str,
) -> Option<usize> {
    if path == base {
        return Some(0);
    }
    if !is_descendant(base, path) {
        return None;
    }
    let rest = path[base.len()..].trim_start_matches(PATH_SEPARATOR);
    Some(rest.split(PATH_SEPARATOR).count())
}

/// Checks that `path` is absolute, has no empty segments and no trailing
/// separator (except for the root itself).
pub fn validate_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("path must not be empty".to_string());
    }
    if !path.starts_with(PATH_SEPARATOR) {
        return Err(format!("path must be absolute: {path}"));
    }
    if path.len() > 1 && path.ends_with(PATH_SEPARATOR) {
        return Err(format!("path must not end with '{PATH_SEPARATOR}': {path}"));
    }
    if path.len() > 1 && path[1..].split(PATH_SEPARATOR).any(str::is_empty) {
        return Err(format!("path contains an empty segment: {path}"));
    }
    Ok(())
}
