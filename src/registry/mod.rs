use crate::converters::{
    ConvertOptions, ConvertOutcome, CwebpConverter, MagickConverter, VipsConverter, WebpConverter,
};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Registry of converter backends. Availability is probed once at startup
/// and cached, so a request never pays for repeated `--version` spawns.
pub struct ConverterRegistry {
    converters: Vec<Arc<dyn WebpConverter>>,
    availability: HashMap<&'static str, bool>,
}

impl ConverterRegistry {
    pub async fn new() -> Self {
        Self::with_converters(vec![
            Arc::new(CwebpConverter::new()),
            Arc::new(VipsConverter::new()),
            Arc::new(MagickConverter::new()),
        ])
        .await
    }

    pub async fn with_converters(converters: Vec<Arc<dyn WebpConverter>>) -> Self {
        let mut availability = HashMap::new();
        for converter in &converters {
            let available = converter.is_available().await;
            let status = if available { "✓" } else { "✗" };
            info!("{} {} converter", status, converter.id());
            availability.insert(converter.id(), available);
        }

        Self {
            converters,
            availability,
        }
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.converters.iter().map(|c| c.id()).collect()
    }

    pub fn is_available(&self, id: &str) -> bool {
        *self.availability.get(id).unwrap_or(&false)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn WebpConverter>> {
        self.converters
            .iter()
            .find(|c| c.id() == id)
            .map(Arc::clone)
    }

    /// Converts `source` into `destination`. With a `converter_id` only
    /// that backend is tried; otherwise the converter stack embedded in
    /// the option map decides the attempt order, falling back to every
    /// registered backend. The first successful attempt wins. A log of
    /// all attempts is written under `log_dir` and returned in the
    /// outcome.
    pub async fn convert(
        &self,
        source: &Path,
        destination: &Path,
        options: &ConvertOptions,
        log_dir: &Path,
        converter_id: Option<&str>,
    ) -> ConvertOutcome {
        let conversion_id = Uuid::new_v4();

        // The converter backends only accept jpeg and png input.
        let mime_type = mime_guess::from_path(source).first();
        let accepted = matches!(
            &mime_type,
            Some(m) if *m == mime::IMAGE_JPEG || *m == mime::IMAGE_PNG
        );
        if !accepted {
            let shown = mime_type
                .map(|m| m.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return ConvertOutcome::failure(format!("unsupported mime type: {}", shown));
        }

        if let Some(parent) = destination.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ConvertOutcome::failure(format!(
                    "could not create destination dir: {}",
                    e
                ));
            }
        }
        if let Err(e) = tokio::fs::create_dir_all(log_dir).await {
            return ConvertOutcome::failure(format!("could not create log dir: {}", e));
        }

        let mut log = format!(
            "conversion: {}\nsource: {}\ndestination: {}\n",
            conversion_id,
            source.display(),
            destination.display()
        );

        let attempts = self.attempt_plan(options, converter_id);
        if attempts.is_empty() {
            log.push_str("no matching converters registered\n");
            self.write_log(source, log_dir, &log).await;
            return ConvertOutcome::failure_with_log("No matching converters registered", log);
        }

        let mut converted_with = None;
        for (converter, attempt_options) in attempts {
            let id = converter.id();
            if !self.is_available(id) {
                log.push_str(&format!("{}: skipped, not operational\n", id));
                continue;
            }

            info!(%conversion_id, "trying {} for {}", id, source.display());
            match converter.convert(source, destination, &attempt_options).await {
                Ok(()) => {
                    log.push_str(&format!("{}: ok\n", id));
                    converted_with = Some(id);
                    break;
                }
                Err(e) => {
                    log.push_str(&format!("{}: {}\n", id, e));
                    warn!(%conversion_id, "{} failed: {}", id, e);
                }
            }
        }

        self.write_log(source, log_dir, &log).await;

        match converted_with {
            Some(id) => ConvertOutcome::success(format!("Converted with {}", id), log),
            None => ConvertOutcome::failure_with_log(
                "No operational converter could convert the file",
                log,
            ),
        }
    }

    /// Builds the ordered list of (converter, options) attempts. Each
    /// attempt gets the general options with any entry-specific options
    /// merged over them; the `converters` key itself never reaches a
    /// backend.
    fn attempt_plan(
        &self,
        options: &ConvertOptions,
        converter_id: Option<&str>,
    ) -> Vec<(Arc<dyn WebpConverter>, ConvertOptions)> {
        let mut general = options.clone();
        general.remove("converters");

        if let Some(id) = converter_id {
            return self
                .get(id)
                .map(|c| vec![(c, general.clone())])
                .unwrap_or_default();
        }

        let mut plan = Vec::new();
        if let Some(Value::Array(stack)) = options.get("converters") {
            for entry in stack {
                let (id, entry_options, deactivated) = match entry {
                    Value::String(id) => (id.as_str(), None, false),
                    Value::Object(map) => (
                        map.get("converter").and_then(Value::as_str).unwrap_or(""),
                        map.get("options").and_then(Value::as_object),
                        map.get("deactivated").and_then(Value::as_bool).unwrap_or(false),
                    ),
                    _ => continue,
                };
                if deactivated {
                    continue;
                }
                let Some(converter) = self.get(id) else {
                    continue;
                };

                let mut merged = general.clone();
                if let Some(entry_options) = entry_options {
                    for (key, value) in entry_options {
                        merged.insert(key.clone(), value.clone());
                    }
                }
                merged.remove("converters");
                plan.push((converter, merged));
            }
        }

        if plan.is_empty() {
            plan = self
                .converters
                .iter()
                .map(|c| (Arc::clone(c), general.clone()))
                .collect();
        }
        plan
    }

    async fn write_log(&self, source: &Path, log_dir: &Path, log: &str) {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "conversion".to_string());
        let log_file = log_dir.join(format!("{}.log", name));
        if let Err(e) = tokio::fs::write(&log_file, log).await {
            warn!("could not write conversion log {}: {}", log_file.display(), e);
        }
    }
}
