//! Validation of single path components received from clients.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use crate::error::{FsError, Result};

/// Longest accepted component, in bytes.
pub const NAME_MAX: usize = 255;

/// Validate a name that will be created, removed or renamed.
///
/// Names are compared byte for byte; `.` and `..` never name a real entry.
pub fn validate_name(name: &OsStr) -> Result<()> {
    validate_lookup_name(name)?;
    if is_dot_entry(name) {
        return Err(FsError::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// Validate a name used for lookup, where `.` and `..` are allowed.
pub fn validate_lookup_name(name: &OsStr) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.contains(&b'/') || bytes.contains(&0) {
        return Err(FsError::InvalidName(name.to_owned()));
    }
    if bytes.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

pub(crate) fn is_dot_entry(name: &OsStr) -> bool {
    matches!(name.as_bytes(), b"." | b"..")
}

/// Whether `name` can be a link stored by the registry.
pub(crate) fn is_plain_component(name: &[u8]) -> bool {
    !name.is_empty()
        && name.len() <= NAME_MAX
        && !name.contains(&b'/')
        && !name.contains(&0)
        && name != b"."
        && name != b".."
}
