use super::{option_str, option_u64, ConvertOptions, ConverterError, WebpConverter};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Converter backed by ImageMagick. The output format is inferred from
/// the `.webp` suffix of the staged output file.
pub struct MagickConverter {
    magick_path: Option<String>,
}

impl MagickConverter {
    pub fn new() -> Self {
        Self { magick_path: None }
    }

    fn get_magick_path(&self) -> String {
        if let Some(path) = &self.magick_path {
            return path.clone();
        }

        if let Ok(path) = std::env::var("MAGICK_PATH") {
            return path;
        }

        if cfg!(target_os = "windows") {
            r"C:\Program Files\ImageMagick\magick.exe".to_string()
        } else {
            // IM 7 ships `magick`, IM 6 only `convert`.
            for path in &[
                "/usr/bin/magick",
                "/usr/local/bin/magick",
                "/opt/homebrew/bin/magick",
                "/usr/bin/convert",
            ] {
                if std::path::Path::new(path).exists() {
                    return path.to_string();
                }
            }
            "magick".to_string()
        }
    }
}

impl Default for MagickConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebpConverter for MagickConverter {
    fn id(&self) -> &'static str {
        "imagemagick"
    }

    async fn is_available(&self) -> bool {
        Command::new(self.get_magick_path())
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
            source.to_string_lossy().into_owned(),
            "-quality".to_string(),
            option_u64(options, "quality", 75).to_string(),
        ];
        if option_str(options, "metadata", "none") == "none" {
            args.push("-strip".to_string());
        }
        args.push(staged.path().to_string_lossy().into_owned());

        let output = Command::new(self.get_magick_path())
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ConverterError::NotOperational(format!("ImageMagick not found: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConverterError::Failed(format!(
                "ImageMagick failed: {}",
                stderr.trim()
            )));
        }

        staged
            .persist(destination)
            .map_err(|e| ConverterError::Io(e.error))?;
        Ok(())
    }
}
