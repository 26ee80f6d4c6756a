use super::{option_str, option_u64, ConvertOptions, ConverterError, WebpConverter};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Converter backed by Google's `cwebp` command line encoder.
pub struct CwebpConverter {
    cwebp_path: Option<String>,
}

impl CwebpConverter {
    pub fn new() -> Self {
        Self { cwebp_path: None }
    }

    fn get_cwebp_path(&self) -> String {
        if let Some(path) = &self.cwebp_path {
            return path.clone();
        }

        if let Ok(path) = std::env::var("CWEBP_PATH") {
            return path;
        }

        for path in &["/usr/bin/cwebp", "/usr/local/bin/cwebp", "/opt/homebrew/bin/cwebp"] {
            if std::path::Path::new(path).exists() {
                return path.to_string();
            }
        }
        "cwebp".to_string()
    }
}

impl Default for CwebpConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebpConverter for CwebpConverter {
    fn id(&self) -> &'static str {
        "cwebp"
    }

    async fn is_available(&self) -> bool {
        Command::new(self.get_cwebp_path())
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn convert(
        &self,
        source: &Path,
        destination: &Path,
        options: &ConvertOptions,
    ) -> Result<(), ConverterError> {
        let parent = destination
            .parent()
            .ok_or_else(|| ConverterError::Failed("destination has no parent dir".to_string()))?;
        let staged = tempfile::Builder::new()
            .prefix(".webpmill-")
            .suffix(".webp")
            .tempfile_in(parent)?;

        let args = vec![
            "-quiet".to_string(),
            "-q".to_string(),
            option_u64(options, "quality", 75).to_string(),
            "-m".to_string(),
            option_u64(options, "method", 6).to_string(),
            "-metadata".to_string(),
            option_str(options, "metadata", "none").to_string(),
            source.to_string_lossy().into_owned(),
            "-o".to_string(),
            staged.path().to_string_lossy().into_owned(),
        ];

        let output = Command::new(self.get_cwebp_path())
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ConverterError::NotOperational(format!("cwebp not found: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConverterError::Failed(format!(
                "cwebp failed: {}",
                stderr.trim()
            )));
        }

        staged
            .persist(destination)
            .map_err(|e| ConverterError::Io(e.error))?;
        Ok(())
    }
}
