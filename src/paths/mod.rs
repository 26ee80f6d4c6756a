use anyhow::Context;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::config::{DestinationExtension, DestinationFolder};
use crate::sanity::{self, SanityError};

/// Source extensions probed when reversing the `set` policy, most common
/// first.
const SOURCE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Absolute directories the service is allowed to work with: the document
/// root, the plugin content dir (config, converted files and logs live
/// here) and the uploads dir.
#[derive(Debug, Clone)]
pub struct Paths {
    doc_root: PathBuf,
    content_dir: PathBuf,
    upload_dir: PathBuf,
}

impl Paths {
    pub fn new(
        doc_root: impl Into<PathBuf>,
        content_dir: impl Into<PathBuf>,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            doc_root: normalize_abs(&doc_root.into()),
            content_dir: normalize_abs(&content_dir.into()),
            upload_dir: normalize_abs(&upload_dir.into()),
        }
    }

    /// Resolve the directory layout from the environment. The document
    /// root defaults to the current directory; content and uploads default
    /// to conventional locations below it.
    pub fn from_env() -> anyhow::Result<Self> {
        let doc_root = match std::env::var_os("WEBPMILL_DOC_ROOT") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().context("failed to resolve current dir")?,
        };
        let doc_root = doc_root
            .canonicalize()
            .with_context(|| format!("document root {} does not exist", doc_root.display()))?;

        let content_dir = std::env::var_os("WEBPMILL_CONTENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| doc_root.join("webpmill-content"));
        let upload_dir = std::env::var_os("WEBPMILL_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| doc_root.join("uploads"));

        anyhow::ensure!(
            content_dir.is_absolute() && upload_dir.is_absolute(),
            "WEBPMILL_CONTENT_DIR and WEBPMILL_UPLOAD_DIR must be absolute paths"
        );

        Ok(Self::new(doc_root, content_dir, upload_dir))
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    pub fn content_dir(&self) -> &Path {
        &self.content_dir
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Where separate/custom mode destinations live.
    pub fn converted_dir(&self) -> PathBuf {
        self.content_dir.join("converted")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.content_dir.join("log")
    }

    pub fn config_file(&self) -> PathBuf {
        self.content_dir.join("config").join("config.json")
    }

    /// Request paths may be absolute or document-root relative.
    pub fn resolve_request_path(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.doc_root.join(path)
        }
    }
}

/// Lexically resolves `.` and `..` components without touching the
/// filesystem, so paths that do not exist yet can still be compared
/// against a containment root.
pub fn normalize_abs(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Computes the destination path for a source image. Pure path
/// arithmetic; existence is the caller's concern.
pub fn get_destination(
    source: &Path,
    folder: DestinationFolder,
    extension: DestinationExtension,
    paths: &Paths,
) -> Result<PathBuf, SanityError> {
    match folder {
        DestinationFolder::Mingled => Ok(apply_extension(source, extension)),
        DestinationFolder::Separate => {
            // Mirror the path relative to the uploads dir; sources outside
            // uploads (theme images etc.) mirror relative to the document
            // root instead.
            let rel = source
                .strip_prefix(paths.upload_dir())
                .or_else(|_| source.strip_prefix(paths.doc_root()))
                .map_err(|_| SanityError::NoRelativeBase)?;
            Ok(apply_extension(&paths.converted_dir().join(rel), extension))
        }
        DestinationFolder::Custom => {
            let rel = source
                .strip_prefix(paths.doc_root())
                .map_err(|_| SanityError::NoRelativeBase)?;
            Ok(apply_extension(&paths.converted_dir().join(rel), extension))
        }
    }
}

/// Determines the source location for a destination path, reversing the
/// extension policy and the folder mapping, and confirms the source
/// exists. Returns None when the destination is not sane, not inside the
/// document root, or no matching source is on disk. The destination
/// itself does not have to exist.
pub fn find_source(
    destination: &Path,
    folder: DestinationFolder,
    extension: DestinationExtension,
    paths: &Paths,
) -> Option<PathBuf> {
    let destination = sanity::abs_path_is_in_doc_root(destination, paths.doc_root()).ok()?;

    let file_name = destination.file_name()?.to_str()?;
    let stem = file_name.strip_suffix(".webp")?;
    if stem.is_empty() {
        return None;
    }

    let names: Vec<String> = match extension {
        DestinationExtension::Append => vec![stem.to_string()],
        // The original extension was replaced, so probe the known ones.
        DestinationExtension::Set => SOURCE_EXTENSIONS
            .iter()
            .map(|ext| format!("{stem}.{ext}"))
            .collect(),
    };

    let dirs: Vec<PathBuf> = match folder {
        DestinationFolder::Mingled => vec![destination.parent()?.to_path_buf()],
        DestinationFolder::Separate | DestinationFolder::Custom => {
            let rel = destination.strip_prefix(paths.converted_dir()).ok()?;
            let rel_dir = rel.parent().unwrap_or(Path::new(""));
            let mut bases = Vec::new();
            if folder == DestinationFolder::Separate {
                bases.push(paths.upload_dir().join(rel_dir));
            }
            bases.push(paths.doc_root().join(rel_dir));
            bases
        }
    };

    for dir in &dirs {
        for name in &names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

fn apply_extension(path: &Path, extension: DestinationExtension) -> PathBuf {
    match extension {
        DestinationExtension::Append => {
            let mut name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(OsString::new);
            name.push(".webp");
            path.with_file_name(name)
        }
        DestinationExtension::Set => path.with_extension("webp"),
    }
}
