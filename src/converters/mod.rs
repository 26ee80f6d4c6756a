mod cwebp;
mod magick;
mod vips;

pub use cwebp::CwebpConverter;
pub use magick::MagickConverter;
pub use vips::VipsConverter;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

/// Loosely-typed option map handed to a converter invocation. Converters
/// read what they understand and ignore the rest.
pub type ConvertOptions = Map<String, Value>;

#[derive(Debug, Error)]
pub enum ConverterError {
    #[error("converter is not operational: {0}")]
    NotOperational(String),

    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a conversion request, in the shape the admin UI consumes.
/// File sizes are attached best-effort after a successful conversion.
#[derive(Debug, Serialize)]
pub struct ConvertOutcome {
    pub success: bool,
    pub msg: String,
    pub log: String,
    #[serde(rename = "filesize-original", skip_serializing_if = "Option::is_none")]
    pub filesize_original: Option<u64>,
    #[serde(rename = "filesize-webp", skip_serializing_if = "Option::is_none")]
    pub filesize_webp: Option<u64>,
}

impl ConvertOutcome {
    pub fn success(msg: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            success: true,
            msg: msg.into(),
            log: log.into(),
            filesize_original: None,
            filesize_webp: None,
        }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self::failure_with_log(msg, String::new())
    }

    pub fn failure_with_log(msg: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            success: false,
            msg: msg.into(),
            log: log.into(),
            filesize_original: None,
            filesize_webp: None,
        }
    }
}

/// A backend capable of turning a jpeg/png into a webp file.
#[async_trait]
pub trait WebpConverter: Send + Sync {
    /// Identifier used in config and request fields.
    fn id(&self) -> &'static str;

    /// Whether the backing executable is installed and runnable.
    async fn is_available(&self) -> bool;

    /// Convert `source` into `destination`. The destination directory
    /// exists when this is called.
    async fn convert(
        &self,
        source: &Path,
        destination: &Path,
        options: &ConvertOptions,
    ) -> Result<(), ConverterError>;
}

/// Reads a numeric option, accepting numeric strings as well (request
/// fields arrive stringly typed from form-encoded bodies).
pub fn option_u64(options: &ConvertOptions, key: &str, default: u64) -> u64 {
    match options.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
        Some(Value::String(s)) => s.parse().unwrap_or(default),
        _ => default,
    }
}

pub fn option_str<'a>(options: &'a ConvertOptions, key: &str, default: &'a str) -> &'a str {
    options
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
}
