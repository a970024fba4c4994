//! Model file resolution and acquisition.

pub mod catalog;
#[cfg(feature = "model-download")]
pub mod download;

use crate::error::{ModelhostError, Result};
use std::path::{Path, PathBuf};

/// Get the directory where downloaded models are cached.
///
/// Uses `~/.cache/modelhost/models/` on Linux/Unix.
pub fn models_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("modelhost")
        .join("models")
}

/// Where a model spec points to.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    /// A file on disk, used as is.
    Local(PathBuf),
    /// A remote file cached at `path`.
    Remote {
        url: String,
        sha1: Option<String>,
        path: PathBuf,
    },
}

impl ModelSource {
    /// Local path the model is (or will be) loaded from.
    pub fn path(&self) -> &Path {
        match self {
            ModelSource::Local(path) => path,
            ModelSource::Remote { path, .. } => path,
        }
    }
}

fn is_url(spec: &str) -> bool {
    spec.starts_with("http://") || spec.starts_with("https://")
}

/// Resolve a model spec: a catalog name, a URL, or a file path.
pub fn resolve(spec: &str) -> ModelSource {
    resolve_in(spec, &models_dir())
}

fn resolve_in(spec: &str, cache_dir: &Path) -> ModelSource {
    if let Some(info) = catalog::get_model(spec) {
        return ModelSource::Remote {
            url: info.url(),
            sha1: Some(info.sha1.to_string()),
            path: cache_dir.join(info.file_name()),
        };
    }

    if is_url(spec) {
        let file_name = spec
            .split(['?', '#'])
            .next()
            .and_then(|s| s.rsplit('/').next())
            .filter(|s| !s.is_empty())
            .unwrap_or("model.bin");
        return ModelSource::Remote {
            url: spec.to_string(),
            sha1: None,
            path: cache_dir.join(file_name),
        };
    }

    ModelSource::Local(PathBuf::from(spec))
}

/// Make the model named by `spec` available on disk and return its path.
///
/// Cached files are reused. Missing remote files are downloaded when the
/// `model-download` feature is enabled; `on_progress` receives fractions.
pub async fn acquire(spec: &str, on_progress: &mut (dyn FnMut(f32) + Send)) -> Result<PathBuf> {
    match resolve(spec) {
        ModelSource::Local(path) => {
            if path.exists() {
                Ok(path)
            } else {
                Err(ModelhostError::ModelNotFound {
                    path: path.display().to_string(),
                })
            }
        }
        ModelSource::Remote { path, .. } if path.exists() => Ok(path),
        #[cfg(feature = "model-download")]
        ModelSource::Remote { url, sha1, path } => {
            download::download_to_path(&url, sha1.as_deref(), &path, on_progress).await?;
            Ok(path)
        }
        #[cfg(not(feature = "model-download"))]
        ModelSource::Remote { path, .. } => {
            let _ = on_progress;
            Err(ModelhostError::ModelNotFound {
                path: path.display().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_models_dir_is_valid_path() {
        let dir = models_dir();
        assert!(dir.to_string_lossy().contains("modelhost"));
        assert!(dir.to_string_lossy().contains("models"));
    }

    #[test]
    fn test_catalog_name_resolves_to_remote() {
        let cache = Path::new("/cache");
        match resolve_in("base", cache) {
            ModelSource::Remote { url, sha1, path } => {
                assert!(url.ends_with("ggml-base.bin"));
                assert!(sha1.is_some());
                assert_eq!(path, PathBuf::from("/cache/ggml-base.bin"));
            }
            other => panic!("expected remote source, got {other:?}"),
        }
    }

    #[test]
    fn test_url_resolves_to_cached_file_name() {
        let source = resolve_in("https://example.com/models/voice.onnx?download=1", Path::new("/c"));
        assert_eq!(
            source,
            ModelSource::Remote {
                url: "https://example.com/models/voice.onnx?download=1".to_string(),
                sha1: None,
                path: PathBuf::from("/c/voice.onnx"),
            }
        );
    }

    #[test]
    fn test_url_without_file_name_gets_default() {
        let source = resolve_in("https://example.com/", Path::new("/c"));
        assert_eq!(source.path(), Path::new("/c/model.bin"));
    }

    #[test]
    fn test_other_specs_are_local_paths() {
        let source = resolve_in("./weights/ggml-custom.bin", Path::new("/c"));
        assert_eq!(
            source,
            ModelSource::Local(PathBuf::from("./weights/ggml-custom.bin"))
        );
    }

    #[tokio::test]
    async fn test_acquire_existing_local_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let spec = file.path().to_string_lossy().to_string();
        let mut progress = |_f: f32| {};
        let path = acquire(&spec, &mut progress).await.unwrap();
        assert_eq!(path, file.path());
    }

    #[tokio::test]
    async fn test_acquire_missing_local_file() {
        let mut progress = |_f: f32| {};
        let result = acquire("/nonexistent/modelhost/model.bin", &mut progress).await;
        assert!(matches!(result, Err(ModelhostError::ModelNotFound { .. })));
    }
}
