use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::sanity::validate::ValidateError;
use crate::sanity::SanityError;

/// Which step of the conversion pipeline a check belongs to. The label is
/// part of the response contract, so the admin UI can tell the user which
/// input was bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStage {
    SourcePath,
    ConfigFile,
    ConfigOptions,
    Destination,
    LogDir,
    FilenameArg,
    ConverterArg,
    OverridesArg,
}

impl fmt::Display for CheckStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStage::SourcePath => "source path",
            CheckStage::ConfigFile => "configuration file",
            CheckStage::ConfigOptions => "configuration file (options)",
            CheckStage::Destination => "destination",
            CheckStage::LogDir => "conversion log dir",
            CheckStage::FilenameArg => "\"filename\" argument",
            CheckStage::ConverterArg => "\"converter\" argument",
            CheckStage::OverridesArg => "\"config-overrides\" argument",
        };
        f.write_str(label)
    }
}

/// A failed sanitation or validation check, tagged with the stage it
/// belongs to. Sanitation covers malformed or unsafe paths and data
/// shapes; validation covers missing or unknown business-level fields.
#[derive(Debug, Error)]
pub enum CheckFailure {
    #[error("Sanitation check failed for {stage}: {source}")]
    Sanity {
        stage: CheckStage,
        source: SanityError,
    },

    #[error("Validation failed for {stage}: {source}")]
    Validate {
        stage: CheckStage,
        source: ValidateError,
    },
}

impl CheckFailure {
    pub fn sanity(stage: CheckStage, source: SanityError) -> Self {
        CheckFailure::Sanity { stage, source }
    }

    pub fn validate(stage: CheckStage, source: ValidateError) -> Self {
        CheckFailure::Validate { stage, source }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid security nonce (it has probably expired - try refreshing)")]
    InvalidNonce,

    #[error(transparent)]
    Check(#[from] CheckFailure),

    #[error("Converter could not be loaded")]
    ConverterNotLoaded,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidNonce => StatusCode::UNAUTHORIZED,
            AppError::Check(_) => StatusCode::BAD_REQUEST,
            AppError::ConverterNotLoaded => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Same body shape as a conversion outcome, so the caller only has
        // to deal with one response format.
        let body = Json(json!({
            "success": false,
            "msg": self.to_string(),
            "log": "",
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
