use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub const AVATAR_FOLDER: &str = "avatars";
pub const KNOWLEDGE_FOLDER: &str = "knowledge";
pub const PROFILE_FOLDER: &str = "profiles";
/// Folders served back under `/uploads/{folder}/{file}`.
pub const PUBLIC_FOLDERS: [&str; 3] = [AVATAR_FOLDER, KNOWLEDGE_FOLDER, PROFILE_FOLDER];
const URL_PREFIX: &str = "/uploads";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid file name: {0}")]
    InvalidName(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub url: String,
    pub stored_name: String,
    pub size: i64,
}

/// Object storage for avatars, profile pictures and knowledge files.
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn save(
        &self,
        folder: &str,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, StorageError>;
    /// `Ok(false)` when nothing was stored at `url`.
    async fn delete(&self, url: &str) -> Result<bool, StorageError>;
    async fn read(&self, folder: &str, file_name: &str) -> Result<Option<Vec<u8>>, StorageError>;
}

pub fn is_safe_file_name(value: &str) -> bool {
    !value.is_empty()
        && !value.contains('/')
        && !value.contains('\\')
        && !value.contains("..")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

pub fn extension_of(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.trim().to_ascii_lowercase();
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext)
}

pub fn content_type_from_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "txt" => "text/plain; charset=utf-8",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}

/// Files under `<root>/<folder>/<uuid>.<ext>`, served from `/uploads`.
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn locate(&self, folder: &str, file_name: &str) -> Result<PathBuf, StorageError> {
        if !is_safe_file_name(folder) || !is_safe_file_name(file_name) {
            return Err(StorageError::InvalidName(format!("{folder}/{file_name}")));
        }
        Ok(self.root.join(folder).join(file_name))
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn save(
        &self,
        folder: &str,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, StorageError> {
        let stored_name = match extension_of(original_name) {
            Some(ext) => format!("{}.{ext}", Uuid::new_v4()),
            None => Uuid::new_v4().to_string(),
        };
        let path = self.locate(folder, &stored_name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(StoredFile {
            url: format!("{URL_PREFIX}/{folder}/{stored_name}"),
            stored_name,
            size: bytes.len() as i64,
        })
    }

    async fn delete(&self, url: &str) -> Result<bool, StorageError> {
        let Some(rest) = url
            .strip_prefix(URL_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return Ok(false);
        };
        let Some((folder, file_name)) = rest.split_once('/') else {
            return Ok(false);
        };
        let path = self.locate(folder, file_name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn read(&self, folder: &str, file_name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.locate(folder, file_name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
