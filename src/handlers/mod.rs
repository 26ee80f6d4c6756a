use crate::config::Config;
use crate::converters::{ConvertOptions, ConvertOutcome};
use crate::error::{AppError, CheckFailure, CheckStage, Result};
use crate::paths::{self, Paths};
use crate::registry::ConverterRegistry;
use crate::sanity::{self, validate, SanityError};
use axum::{
    extract::{Form, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Action name the conversion nonce is tied to. Matches what the plugin's
/// admin JS sends, so the service is a drop-in backend for it.
pub const AJAX_CONVERT_ACTION: &str = "webpexpress-ajax-convert-nonce";

pub struct AppState {
    pub paths: Paths,
    pub registry: ConverterRegistry,
    pub nonce_secret: String,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/convert", post(convert_handler))
        .route("/source", get(find_source_handler))
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .route("/", get(info_handler))
        .with_state(state)
}

/// Mints the token a client must present for `action`.
fn create_nonce(secret: &str, action: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(action.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn verify_nonce(secret: &str, action: &str, supplied: &str) -> bool {
    let expected = create_nonce(secret, action);
    if expected.len() != supplied.len() {
        return false;
    }
    expected
        .bytes()
        .zip(supplied.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Removes one level of backslash escaping. Request transports on the
/// WordPress side add slashes to every field.
fn unslash(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// The fields of a conversion request. `filename` stays optional at the
/// type level so its absence is reported through the staged error path
/// instead of an extractor rejection.
#[derive(Debug, Deserialize)]
pub struct ConvertRequest {
    pub nonce: String,
    pub filename: Option<String>,
    pub converter: Option<String>,
    #[serde(rename = "config-overrides")]
    pub config_overrides: Option<String>,
}

struct ConvertPlan {
    source: PathBuf,
    destination: PathBuf,
    options: ConvertOptions,
    log_dir: PathBuf,
}

/// Runs the sanitation pipeline for a single conversion: source, config,
/// options, destination, log dir. Each failure is tagged with the stage
/// it belongs to.
fn checked_convert_inputs(
    state: &AppState,
    filename: &str,
    config: Option<Config>,
    convert_options: Option<ConvertOptions>,
) -> std::result::Result<ConvertPlan, CheckFailure> {
    // Check source
    let source = state.paths.resolve_request_path(filename);
    sanity::abs_path_exists_and_is_file(&source)
        .map_err(|e| CheckFailure::sanity(CheckStage::SourcePath, e))?;

    // Check config. Loading substitutes defaults on failure, so a missing
    // config file never sinks the conversion.
    let config = match config {
        Some(config) => config,
        None => Config::load_and_fix(&state.paths.config_file()),
    };

    // Check convert options
    let options = match convert_options {
        Some(options) => options,
        None => config
            .conversion_options()
            .map_err(|e| CheckFailure::sanity(CheckStage::ConfigOptions, e))?,
    };

    // Check destination
    let destination = paths::get_destination(
        &source,
        config.destination_folder,
        config.destination_extension,
        &state.paths,
    )
    .map_err(|e| CheckFailure::sanity(CheckStage::Destination, e))?;
    let destination = sanity::abs_path_is_in_doc_root(&destination, state.paths.doc_root())
        .map_err(|e| CheckFailure::sanity(CheckStage::Destination, e))?;

    // Check log dir
    let log_dir = sanity::abs_path_is_in_doc_root(&state.paths.log_dir(), state.paths.doc_root())
        .map_err(|e| CheckFailure::sanity(CheckStage::LogDir, e))?;

    Ok(ConvertPlan {
        source,
        destination,
        options,
        log_dir,
    })
}

/// Converts a single file and reports the outcome. Never fails outward:
/// every failed check folds into a `{success: false, ...}` outcome naming
/// the stage that failed.
pub async fn convert_file(
    state: &AppState,
    filename: &str,
    config: Option<Config>,
    convert_options: Option<ConvertOptions>,
    converter_id: Option<&str>,
) -> ConvertOutcome {
    let plan = match checked_convert_inputs(state, filename, config, convert_options) {
        Ok(plan) => plan,
        Err(failure) => return ConvertOutcome::failure(failure.to_string()),
    };

    // Done sanitizing, hand over to the delegate.
    let mut outcome = state
        .registry
        .convert(
            &plan.source,
            &plan.destination,
            &plan.options,
            &plan.log_dir,
            converter_id,
        )
        .await;

    if outcome.success {
        // Best effort; a failed stat just leaves the size out.
        outcome.filesize_original = tokio::fs::metadata(&plan.source).await.ok().map(|m| m.len());
        outcome.filesize_webp = tokio::fs::metadata(&plan.destination)
            .await
            .ok()
            .map(|m| m.len());
    }
    outcome
}

/// Regenerates the general conversion options and merges the
/// converter-specific ones over them. The embedded `converters` stack is
/// dropped so a single-converter invocation never carries the full list.
pub fn single_converter_options(
    config: &Config,
    converter_options: &ConvertOptions,
) -> std::result::Result<ConvertOptions, SanityError> {
    let mut options = config.conversion_options()?;
    // TODO: confirm that converter-specific options should keep winning
    // over the regenerated general options; this preserves long-standing
    // behavior.
    for (key, value) in converter_options {
        options.insert(key.clone(), value.clone());
    }
    options.remove("converters");
    Ok(options)
}

/// The conversion endpoint. Verifies the security token, validates the
/// request fields, applies config overrides and dispatches to
/// [`convert_file`].
pub async fn convert_handler(
    State(state): State<Arc<AppState>>,
    Form(request): Form<ConvertRequest>,
) -> Result<Response> {
    // Verify the security token before touching any other field.
    if !verify_nonce(&state.nonce_secret, AJAX_CONVERT_ACTION, &request.nonce) {
        return Err(AppError::InvalidNonce);
    }

    // Check "filename"
    let filename = validate::require(request.filename.as_deref(), "filename")
        .map_err(|e| CheckFailure::validate(CheckStage::FilenameArg, e))?;
    let filename = unslash(filename);

    // Check converter id
    let converter_id = match &request.converter {
        Some(id) => {
            let known = state.registry.ids();
            validate::known_converter_id(id, &known)
                .map_err(|e| CheckFailure::validate(CheckStage::ConverterArg, e))?;
            Some(id.as_str())
        }
        None => None,
    };

    // Check "config-overrides"
    let config_overrides = match &request.config_overrides {
        Some(raw) => {
            let raw = sanity::no_control_chars(raw)
                .map_err(|e| CheckFailure::sanity(CheckStage::OverridesArg, e))?;
            // jQuery-side serialization escapes the quotes; undo that
            // before parsing.
            let cleaned = raw.replace("\\\"", "\"");
            let overrides = sanity::is_json_object(&cleaned)
                .map_err(|e| CheckFailure::sanity(CheckStage::OverridesArg, e))?;
            Some(overrides)
        }
        None => None,
    };

    let request_id = Uuid::new_v4();
    info!(%request_id, "convert request for {}", filename);

    // Input has been processed, now lets get to work.
    let outcome = match config_overrides {
        Some(overrides) => {
            let config = Config::load_and_fix(&state.paths.config_file());
            // Overrides only take effect when converting; they are not
            // written back to the config file.
            let config = config
                .with_overrides(&overrides)
                .map_err(|e| CheckFailure::sanity(CheckStage::ConfigFile, e))?;

            match converter_id {
                Some(id) => {
                    let converter_options = config
                        .converter_by_id(id)
                        .ok_or(AppError::ConverterNotLoaded)?
                        .options
                        .clone();
                    let options = single_converter_options(&config, &converter_options)
                        .map_err(|e| CheckFailure::sanity(CheckStage::ConfigOptions, e))?;
                    convert_file(&state, &filename, Some(config), Some(options), Some(id)).await
                }
                None => convert_file(&state, &filename, Some(config), None, None).await,
            }
        }
        None => convert_file(&state, &filename, None, None, None).await,
    };

    pretty_json(&outcome)
}

#[derive(Debug, Deserialize)]
pub struct FindSourceQuery {
    pub destination: String,
}

/// Reverse mapping: which source image does a destination path belong to.
pub async fn find_source_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FindSourceQuery>,
) -> impl IntoResponse {
    let config = Config::load_and_fix(&state.paths.config_file());
    let destination = state.paths.resolve_request_path(&query.destination);

    match paths::find_source(
        &destination,
        config.destination_folder,
        config.destination_extension,
        &state.paths,
    ) {
        Some(source) => Json(json!({ "success": true, "source": source })),
        None => Json(json!({
            "success": false,
            "msg": "no source found for destination",
            "log": "",
        })),
    }
}

/// Health check endpoint
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "webpmill"
    }))
}

/// Information endpoint - lists converters and the request contract
pub async fn info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let converters: Vec<_> = state
        .registry
        .ids()
        .iter()
        .map(|&id| {
            json!({
                "id": id,
                "available": state.registry.is_available(id),
            })
        })
        .collect();

    Json(json!({
        "service": "webpmill",
        "version": env!("CARGO_PKG_VERSION"),
        "converters": converters,
        "endpoints": {
            "convert": {
                "path": "/convert",
                "method": "POST",
                "content_type": "application/x-www-form-urlencoded",
                "fields": {
                    "nonce": "Security token tied to the convert action (required)",
                    "filename": "Source image, absolute or document-root relative (required)",
                    "converter": "Convert with this specific converter only (optional)",
                    "config-overrides": "JSON object merged over the stored configuration (optional)"
                }
            },
            "source": {
                "path": "/source",
                "method": "GET",
                "description": "Find the source image a destination path maps back to"
            },
            "health": {
                "path": "/health",
                "method": "GET",
                "description": "Health check endpoint"
            },
            "info": {
                "path": "/info",
                "method": "GET",
                "description": "Service information and converter availability"
            }
        }
    }))
}

fn pretty_json(outcome: &ConvertOutcome) -> Result<Response> {
    let body =
        serde_json::to_string_pretty(outcome).map_err(|e| AppError::Internal(e.to_string()))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converters::testing::StubConverter;
    use crate::converters::WebpConverter;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::fs;
    use std::path::Path;
    use tower::ServiceExt;

    const TEST_SECRET: &str = "test-secret";

    async fn stub_state(root: &Path, stub: Arc<StubConverter>) -> Arc<AppState> {
        let paths = Paths::new(root, root.join("webpmill-content"), root.join("uploads"));
        let registry =
            ConverterRegistry::with_converters(vec![stub as Arc<dyn WebpConverter>]).await;
        Arc::new(AppState {
            paths,
            registry,
            nonce_secret: TEST_SECRET.to_string(),
        })
    }

    fn write_source(root: &Path) -> PathBuf {
        let img_dir = root.join("img");
        fs::create_dir_all(&img_dir).unwrap();
        let source = img_dir.join("logo.jpg");
        fs::write(&source, b"jpeg bytes").unwrap();
        source
    }

    fn good_nonce() -> String {
        create_nonce(TEST_SECRET, AJAX_CONVERT_ACTION)
    }

    async fn post_form(app: Router, body: String) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/convert")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn unslash_removes_one_escaping_level() {
        assert_eq!(unslash(r#"a\"b\\c"#), r#"a"b\c"#);
        assert_eq!(unslash("img/logo.jpg"), "img/logo.jpg");
        assert_eq!(unslash(r"trailing\"), "trailing");
    }

    #[test]
    fn nonce_round_trips_and_rejects_others() {
        let nonce = create_nonce("secret", AJAX_CONVERT_ACTION);
        assert!(verify_nonce("secret", AJAX_CONVERT_ACTION, &nonce));
        assert!(!verify_nonce("secret", AJAX_CONVERT_ACTION, "forged"));
        assert!(!verify_nonce("other", AJAX_CONVERT_ACTION, &nonce));
    }

    #[test]
    fn converter_specific_options_win_and_stack_is_dropped() {
        let config = Config::default();
        let mut converter_options = ConvertOptions::new();
        converter_options.insert("quality".to_string(), json!(92));

        let options = single_converter_options(&config, &converter_options).unwrap();
        assert_eq!(options["quality"], json!(92));
        assert_eq!(options["metadata"], json!("none"));
        assert!(options.get("converters").is_none());
    }

    #[tokio::test]
    async fn convert_file_reports_a_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubConverter::new("cwebp", true, true));
        let state = stub_state(dir.path(), Arc::clone(&stub)).await;

        let outcome = convert_file(&state, "img/missing.jpg", None, None, None).await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.msg,
            "Sanitation check failed for source path: file does not exist"
        );
        assert!(stub.invocations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn convert_file_converts_and_attaches_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubConverter::new("cwebp", true, true));
        let state = stub_state(dir.path(), Arc::clone(&stub)).await;
        let source = write_source(dir.path());

        let outcome = convert_file(&state, "img/logo.jpg", None, None, None).await;
        assert!(outcome.success, "msg: {}", outcome.msg);
        assert_eq!(outcome.msg, "Converted with cwebp");
        assert!(source.with_file_name("logo.jpg.webp").is_file());
        assert!(outcome.filesize_original.is_some());
        assert!(outcome.filesize_webp.is_some());
    }

    #[tokio::test]
    async fn convert_file_rejects_a_log_dir_outside_the_doc_root() {
        let dir = tempfile::tempdir().unwrap();
        let doc_root = dir.path().join("docroot");
        fs::create_dir_all(doc_root.join("img")).unwrap();
        fs::write(doc_root.join("img/logo.jpg"), b"jpeg").unwrap();

        let paths = Paths::new(
            &doc_root,
            dir.path().join("content-outside"),
            doc_root.join("uploads"),
        );
        let registry = ConverterRegistry::with_converters(vec![
            Arc::new(StubConverter::new("cwebp", true, true)) as Arc<dyn WebpConverter>,
        ])
        .await;
        let state = AppState {
            paths,
            registry,
            nonce_secret: TEST_SECRET.to_string(),
        };

        let outcome = convert_file(&state, "img/logo.jpg", None, None, None).await;
        assert!(!outcome.success);
        assert!(outcome
            .msg
            .starts_with("Sanitation check failed for conversion log dir:"));
    }

    #[tokio::test]
    async fn invalid_nonce_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubConverter::new("cwebp", true, true));
        let state = stub_state(dir.path(), Arc::clone(&stub)).await;
        write_source(dir.path());

        let (status, body) = post_form(
            app(state),
            "nonce=forged&filename=img%2Flogo.jpg".to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], json!(false));
        assert!(body["msg"].as_str().unwrap().contains("security nonce"));
        assert!(stub.invocations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_filename_names_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubConverter::new("cwebp", true, true));
        let state = stub_state(dir.path(), Arc::clone(&stub)).await;

        let (status, body) = post_form(app(state), format!("nonce={}", good_nonce())).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));
        assert_eq!(
            body["msg"],
            json!("Validation failed for \"filename\" argument: missing required field \"filename\"")
        );
        assert!(stub.invocations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_converter_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubConverter::new("cwebp", true, true));
        let state = stub_state(dir.path(), Arc::clone(&stub)).await;
        write_source(dir.path());

        let (status, body) = post_form(
            app(state),
            format!("nonce={}&filename=img%2Flogo.jpg&converter=gd", good_nonce()),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["msg"],
            json!("Validation failed for \"converter\" argument: unknown converter: gd")
        );
    }

    #[tokio::test]
    async fn overrides_with_control_chars_never_reach_the_parser() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubConverter::new("cwebp", true, true));
        let state = stub_state(dir.path(), Arc::clone(&stub)).await;
        write_source(dir.path());

        // %0A is a newline inside the overrides value.
        let (status, body) = post_form(
            app(state),
            format!(
                "nonce={}&filename=img%2Flogo.jpg&config-overrides=%7B%0A%7D",
                good_nonce()
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["msg"],
            json!("Sanitation check failed for \"config-overrides\" argument: value contains control characters")
        );
        assert!(stub.invocations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_convert_responds_with_the_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubConverter::new("cwebp", true, true));
        let state = stub_state(dir.path(), Arc::clone(&stub)).await;
        write_source(dir.path());

        let (status, body) = post_form(
            app(state),
            format!("nonce={}&filename=img%2Flogo.jpg", good_nonce()),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["msg"], json!("Converted with cwebp"));
        assert!(body["filesize-webp"].is_u64());
    }

    #[tokio::test]
    async fn overrides_reach_the_requested_converter() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubConverter::new("cwebp", true, true));
        let state = stub_state(dir.path(), Arc::clone(&stub)).await;
        write_source(dir.path());

        // config-overrides={"quality":92}, converter=cwebp
        let (status, body) = post_form(
            app(state),
            format!(
                "nonce={}&filename=img%2Flogo.jpg&converter=cwebp&config-overrides=%7B%22quality%22%3A92%7D",
                good_nonce()
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));

        let invocations = stub.invocations.lock().unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0]["quality"], json!(92));
        assert!(invocations[0].get("converters").is_none());
    }

    #[tokio::test]
    async fn source_endpoint_reverses_a_destination() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubConverter::new("cwebp", true, true));
        let state = stub_state(dir.path(), Arc::clone(&stub)).await;
        let source = write_source(dir.path());

        let response = app(state)
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/source?destination=img%2Flogo.jpg.webp")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["source"], json!(source.to_string_lossy()));
    }
}
