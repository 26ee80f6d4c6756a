use thiserror::Error;

/// A validation failure: a required request field is absent or names
/// something the service does not know about.
#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("missing required field \"{0}\"")]
    MissingField(&'static str),

    #[error("unknown converter: {0}")]
    UnknownConverter(String),
}

/// Requires an optional request field to be present and non-empty.
pub fn require<'a>(value: Option<&'a str>, field: &'static str) -> Result<&'a str, ValidateError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidateError::MissingField(field)),
    }
}

/// Requires a converter identifier to name a registered converter.
pub fn known_converter_id<'a>(id: &'a str, known: &[&str]) -> Result<&'a str, ValidateError> {
    if known.contains(&id) {
        Ok(id)
    } else {
        Err(ValidateError::UnknownConverter(id.to_string()))
    }
}
