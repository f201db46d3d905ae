//! Where scanned images come from: HTTP(S) URLs or the local filesystem.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::error::IngestError;
use crate::sanitize;

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Fetches one image. Non-2xx responses and payloads over the size
    /// limit are errors for that image only.
    async fn fetch(&self, url: &str) -> Result<FetchedImage, IngestError>;
}

pub struct HttpImageSource {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpImageSource {
    pub fn new(max_bytes: usize, timeout_secs: u64) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("folio/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Fetch {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client, max_bytes })
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, IngestError> {
        let shown = sanitize::redact_url(url);
        let fetch_err = |reason: String| IngestError::Fetch {
            url: shown.clone(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::HttpStatus {
                url: shown,
                status: status.as_u16(),
            });
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes as u64 {
                return Err(IngestError::TooLarge {
                    name: shown,
                    size: len as usize,
                    limit: self.max_bytes,
                });
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if bytes.len() > self.max_bytes {
            return Err(IngestError::TooLarge {
                name: shown,
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }

        tracing::debug!(url = %shown, size = bytes.len(), "fetched image");
        Ok(FetchedImage {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// Reads plain paths and `file://` URLs.
pub struct FsImageSource {
    max_bytes: usize,
}

impl FsImageSource {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

/// Local path for a plain path or `file://` URL.
pub fn local_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

#[async_trait]
impl ImageSource for FsImageSource {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, IngestError> {
        let path = local_path(url);
        let read_err = |source| IngestError::ReadFile {
            path: path.clone(),
            source,
        };

        let metadata = tokio::fs::metadata(&path).await.map_err(read_err)?;
        if metadata.len() > self.max_bytes as u64 {
            return Err(IngestError::TooLarge {
                name: sanitize::redact_path(&path),
                size: metadata.len() as usize,
                limit: self.max_bytes,
            });
        }

        let bytes = tokio::fs::read(&path).await.map_err(read_err)?;
        let content_type = mime_guess::from_path(&path).first().map(|m| m.to_string());
        Ok(FetchedImage {
            bytes,
            content_type,
        })
    }
}

/// Routes `http(s)://` URLs to HTTP and everything else to the filesystem.
pub struct AnyImageSource {
    http: HttpImageSource,
    fs: FsImageSource,
}

impl AnyImageSource {
    pub fn new(max_bytes: usize, timeout_secs: u64) -> Result<Self, IngestError> {
        Ok(Self {
            http: HttpImageSource::new(max_bytes, timeout_secs)?,
            fs: FsImageSource::new(max_bytes),
        })
    }
}

#[async_trait]
impl ImageSource for AnyImageSource {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, IngestError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.http.fetch(url).await
        } else {
            self.fs.fetch(url).await
        }
    }
}

/// Image files under `dir`, sorted by path so page order follows file names.
pub fn collect_image_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            !e.file_name()
                .to_str()
                .map(|n| n.starts_with('.'))
                .unwrap_or(false)
        })
        .filter(|e| {
            mime_guess::from_path(e.path())
                .first()
                .map(|m| m.type_() == mime_guess::mime::IMAGE)
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_source_reads_path_and_file_url() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("0001.png");
        std::fs::write(&path, b"not really a png").unwrap();

        let source = FsImageSource::new(1024);
        let by_path = source.fetch(path.to_str().unwrap()).await.unwrap();
        assert_eq!(by_path.bytes, b"not really a png");
        assert_eq!(by_path.content_type.as_deref(), Some("image/png"));

        let url = format!("file://{}", path.display());
        let by_url = source.fetch(&url).await.unwrap();
        assert_eq!(by_url.bytes.len(), 16);
    }

    #[tokio::test]
    async fn test_fs_source_rejects_oversized() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("big.jpg");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        let source = FsImageSource::new(1024);
        let result = source.fetch(path.to_str().unwrap()).await;
        assert!(matches!(result, Err(IngestError::TooLarge { size: 2048, .. })));
    }

    #[tokio::test]
    async fn test_fs_source_missing_file() {
        let source = FsImageSource::new(1024);
        let result = source.fetch("/nonexistent/scan.jpg").await;
        assert!(matches!(result, Err(IngestError::ReadFile { .. })));
    }

    #[test]
    fn test_collect_image_files_sorted_and_filtered() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();
        for name in ["b.jpg", "a.png", "notes.txt", ".hidden.jpg", "sub/c.tif"] {
            std::fs::write(temp.path().join(name), b"x").unwrap();
        }

        let files = collect_image_files(temp.path());
        let names: Vec<String> = files
            .iter()
            .map(|p| {
                p.strip_prefix(temp.path())
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["a.png", "b.jpg", "sub/c.tif"]);
    }

    #[test]
    fn test_local_path() {
        assert_eq!(local_path("file:///srv/a.jpg"), PathBuf::from("/srv/a.jpg"));
        assert_eq!(local_path("/srv/a.jpg"), PathBuf::from("/srv/a.jpg"));
    }
}
