pub mod validate;

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::paths::normalize_abs;

/// A sanitation failure: the input is malformed or points somewhere it
/// must not. Distinct from [`validate::ValidateError`], which covers
/// missing or unknown business-level request fields.
#[derive(Debug, Error)]
pub enum SanityError {
    #[error("path is not an absolute path")]
    RelativePath,

    #[error("file does not exist")]
    Missing,

    #[error("path is not a regular file")]
    NotAFile,

    #[error("path is outside the document root")]
    OutsideDocRoot,

    #[error("value contains control characters")]
    ControlChars,

    #[error("value is not a JSON object")]
    NotAJsonObject,

    #[error("path is not below the uploads dir or the document root")]
    NoRelativeBase,

    #[error("overrides do not fit the configuration schema")]
    BadOverrides,

    #[error("conversion options are missing")]
    MissingOptions,
}

/// Checks that `path` is absolute, exists and is a regular file.
pub fn abs_path_exists_and_is_file(path: &Path) -> Result<&Path, SanityError> {
    if !path.is_absolute() {
        return Err(SanityError::RelativePath);
    }
    let meta = std::fs::metadata(path).map_err(|_| SanityError::Missing)?;
    if !meta.is_file() {
        return Err(SanityError::NotAFile);
    }
    Ok(path)
}

/// Checks that `path` is absolute and falls under `doc_root` after lexical
/// normalization. The path does not have to exist, so a destination can be
/// checked before it is written. Returns the normalized path.
pub fn abs_path_is_in_doc_root(path: &Path, doc_root: &Path) -> Result<PathBuf, SanityError> {
    if !path.is_absolute() {
        return Err(SanityError::RelativePath);
    }
    let normalized = normalize_abs(path);
    if !normalized.starts_with(normalize_abs(doc_root)) {
        return Err(SanityError::OutsideDocRoot);
    }
    Ok(normalized)
}

/// Rejects strings carrying control characters. Run before any parsing of
/// request-supplied blobs.
pub fn no_control_chars(value: &str) -> Result<&str, SanityError> {
    if value.chars().any(|c| c.is_control()) {
        return Err(SanityError::ControlChars);
    }
    Ok(value)
}

/// Parses `value` and requires the top level to be a JSON object.
pub fn is_json_object(value: &str) -> Result<Map<String, Value>, SanityError> {
    match serde_json::from_str::<Value>(value) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(SanityError::NotAJsonObject),
    }
}
