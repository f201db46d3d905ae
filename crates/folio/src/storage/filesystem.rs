use std::io::Write;
use std::path::{Component, Path, PathBuf};

use super::ObjectStore;
use crate::error::StorageError;

/// Move a file from `src` to `dst`. Uses `rename` first (atomic on the same
/// filesystem) and falls back to copy + delete for cross-device moves.
fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    std::fs::copy(src, dst).map_err(|e| StorageError::WriteFile {
        path: dst.to_path_buf(),
        source: e,
    })?;
    std::fs::remove_file(src).map_err(|e| StorageError::WriteFile {
        path: src.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// File extension for a content type, used when the object path has none.
fn extension_for(content_type: &str) -> Option<&'static str> {
    match content_type {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "application/json" => Some("json"),
        other => mime_guess::get_mime_extensions_str(other).and_then(|exts| exts.first().copied()),
    }
}

/// Object store rooted at a local directory. URLs are `file://` URLs.
pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an object path to a location under the root, rejecting anything
    /// that could escape it.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let invalid = |reason: &str| StorageError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        if path.is_empty() {
            return Err(invalid("empty path"));
        }
        let relative = Path::new(path);
        if relative.is_absolute() {
            return Err(invalid("absolute paths are not allowed"));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                Component::CurDir => {}
                _ => return Err(invalid("path must stay inside the store")),
            }
        }
        Ok(self.root.join(relative))
    }

    fn ensure_directory(&self, path: &Path) -> Result<(), StorageError> {
        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }
}

impl ObjectStore for FileObjectStore {
    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError> {
        let mut target = self.resolve(path)?;
        if target.extension().is_none() {
            if let Some(ext) = extension_for(content_type) {
                target.set_extension(ext);
            }
        }

        if let Some(parent) = target.parent() {
            self.ensure_directory(parent)?;
        }

        // Write next to the target, then rename, so readers never see a
        // partially written object.
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = target.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        {
            let mut file = std::fs::File::create(&tmp).map_err(|e| StorageError::WriteFile {
                path: tmp.clone(),
                source: e,
            })?;
            file.write_all(bytes).map_err(|e| StorageError::WriteFile {
                path: tmp.clone(),
                source: e,
            })?;
        }
        if let Err(e) = move_file(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }

        tracing::debug!(
            object = %path,
            content_type,
            size = bytes.len(),
            "stored object"
        );

        Ok(format!("file://{}", target.to_string_lossy()))
    }
}
