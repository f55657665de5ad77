//! Helpers to deal with the absolute, slash-separated paths handed to the
//! filesystem adapter.
//!
//! Resolution is segment by segment and case-sensitive. Empty segments
//! (leading, trailing or doubled slashes) are skipped, so `""`, `/` and `//`
//! all name the root.

use crate::Error;

/// Checks whether the passed name can be used as a node name.
/// Disallows the empty string, `.` and `..`, as well as slashes and null
/// bytes.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['\0', '/'])
}

/// Like [is_valid_name], but returns an [Error::InvalidRequest].
pub fn validate_name(name: &str) -> Result<&str, Error> {
    if !is_valid_name(name) {
        return Err(Error::InvalidRequest(format!("invalid name: {:?}", name)));
    }
    Ok(name)
}

/// Splits a path into its validated segments.
pub fn components(path: &str) -> Result<Vec<&str>, Error> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(validate_name)
        .collect()
}

/// Splits a path into the path of its parent and its final segment.
/// Fails for paths naming the root, which has no name and no parent.
pub fn split_parent(path: &str) -> Result<(&str, &str), Error> {
    let trimmed = path.trim_end_matches('/');

    let (parent, name) = match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    };

    if name.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "{:?} does not name a child",
            path
        )));
    }

    Ok((parent, validate_name(name)?))
}
