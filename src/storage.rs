use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use tracing::debug;

use crate::config::model::StorageConfig;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to download {url}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("download of {url} failed with HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("invalid image filename '{0}'")]
    InvalidName(String),
}

/// Local blob storage for generated images, keyed by filename.
pub trait BlobStore: Send + Sync {
    /// Fetch `source` (an `http(s)://` URL, `file://` URL, or local path) and
    /// store it under `filename`, returning the local path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the source cannot be fetched or written.
    fn save(&self, source: &str, filename: &str) -> Result<PathBuf, StorageError>;

    /// Remove a stored image. Missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file exists but cannot be removed.
    fn delete(&self, path: &Path) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    timeout: Duration,
}

impl LocalBlobStore {
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.images_dir.clone(),
            timeout: config.download_timeout,
        }
    }

    fn target(&self, filename: &str) -> Result<PathBuf, StorageError> {
        let name = Path::new(filename);
        if filename.is_empty() || name.file_name() != Some(name.as_os_str()) {
            return Err(StorageError::InvalidName(filename.to_string()));
        }
        fs::create_dir_all(&self.root).map_err(|source| StorageError::Io {
            path: self.root.clone(),
            source,
        })?;
        Ok(self.root.join(name))
    }

    fn download(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        let wrap = |source| StorageError::Download {
            url: url.to_string(),
            source,
        };
        let client = HttpClient::builder()
            .timeout(self.timeout)
            .build()
            .map_err(wrap)?;
        let response = client.get(url).send().map_err(wrap)?;
        if !response.status().is_success() {
            return Err(StorageError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.bytes().map_err(wrap)?.to_vec())
    }
}

impl BlobStore for LocalBlobStore {
    fn save(&self, source: &str, filename: &str) -> Result<PathBuf, StorageError> {
        let target = self.target(filename)?;
        if source.starts_with("http://") || source.starts_with("https://") {
            let bytes = self.download(source)?;
            fs::write(&target, bytes).map_err(|source| StorageError::Io {
                path: target.clone(),
                source,
            })?;
        } else {
            let local = source.strip_prefix("file://").unwrap_or(source);
            fs::copy(local, &target).map_err(|source| StorageError::Io {
                path: target.clone(),
                source,
            })?;
        }
        debug!(path = %target.display(), "saved image");
        Ok(target)
    }

    fn delete(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}
