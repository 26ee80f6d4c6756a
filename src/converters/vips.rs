use super::{option_str, option_u64, ConvertOptions, ConverterError, WebpConverter};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Converter backed by the libvips `vips` command line tool.
pub struct VipsConverter {
    vips_path: Option<String>,
}

impl VipsConverter {
    pub fn new() -> Self {
        Self { vips_path: None }
    }

    fn get_vips_path(&self) -> String {
        if let Some(path) = &self.vips_path {
            return path.clone();
        }

        if let Ok(path) = std::env::var("VIPS_PATH") {
            return path;
        }

        for path in &["/usr/bin/vips", "/usr/local/bin/vips", "/opt/homebrew/bin/vips"] {
            if std::path::Path::new(path).exists() {
                return path.to_string();
            }
        }
        "vips".to_string()
    }
}

impl Default for VipsConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebpConverter for VipsConverter {
    fn id(&self) -> &'static str {
        "vips"
    }

    async fn is_available(&self) -> bool {
        Command::new(self.get_vips_path())
            .arg("--version")
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

        let mut args = vec![
            "webpsave".to_string(),
            source.to_string_lossy().into_owned(),
            staged.path().to_string_lossy().into_owned(),
            format!("--Q={}", option_u64(options, "quality", 75)),
        ];
        if option_str(options, "metadata", "none") == "none" {
            args.push("--strip".to_string());
        }

        let output = Command::new(self.get_vips_path())
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ConverterError::NotOperational(format!("vips not found: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConverterError::Failed(format!(
                "vips failed: {}",
                stderr.trim()
            )));
        }

        staged
            .persist(destination)
            .map_err(|e| ConverterError::Io(e.error))?;
        Ok(())
    }
}
