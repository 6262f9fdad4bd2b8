use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use yomu_lib::prelude::PageImage;

use crate::{domain::entities::work::Work, infrastructure::local::WorkDetails};

const PAUSE_MARKER: &str = ".pause";
const DETAILS_FILE: &str = "details.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenPage {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
}

/// Page files of downloaded chapters, laid out as
/// `<root>/<work id>/<chapter id>/<index:04>.<ext>`.
#[derive(Debug, Clone)]
pub struct PageStore {
    root: PathBuf,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();

    match essence.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/avif" => "avif",
        other => mime_guess::get_mime_extensions_str(other)
            .and_then(|exts| exts.first().copied())
            .unwrap_or("img"),
    }
}

fn page_index(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }

    path.file_stem()?.to_str()?.parse().ok()
}

impl PageStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: PathBuf::new().join(root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn work_dir(&self, work_id: i64) -> PathBuf {
        self.root.join(work_id.to_string())
    }

    pub fn chapter_dir(&self, work_id: i64, chapter_id: i64) -> PathBuf {
        self.work_dir(work_id).join(chapter_id.to_string())
    }

    /// Pages already on disk keyed by index, partial files are ignored.
    pub async fn scan(
        &self,
        work_id: i64,
        chapter_id: i64,
    ) -> Result<BTreeMap<usize, StoredPage>, StorageError> {
        let dir = self.chapter_dir(work_id, chapter_id);
        let mut pages = BTreeMap::new();

        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pages),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let Some(index) = page_index(&path) else {
                continue;
            };
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            pages.insert(
                index,
                StoredPage {
                    path,
                    size: meta.len(),
                },
            );
        }

        Ok(pages)
    }

    /// Writes a page to a temp file, syncs it, then renames it into place.
    pub async fn write_page(
        &self,
        work_id: i64,
        chapter_id: i64,
        index: usize,
        image: &PageImage,
    ) -> Result<WrittenPage, StorageError> {
        let dir = self.chapter_dir(work_id, chapter_id);
        tokio::fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!(".{index:04}.part"));
        let path = dir.join(format!("{index:04}.{}", extension_for(&image.content_type)));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&image.bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        self.remove_stale_siblings(&dir, index, &path).await?;

        Ok(WrittenPage {
            path,
            size: image.bytes.len() as u64,
            checksum: sha256_hex(&image.bytes),
        })
    }

    // an earlier copy of the same page saved under another extension
    async fn remove_stale_siblings(
        &self,
        dir: &Path,
        index: usize,
        keep: &Path,
    ) -> Result<(), StorageError> {
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path != keep && page_index(&path) == Some(index) {
                debug!("removing stale page file {}", path.display());
                tokio::fs::remove_file(&path).await?;
            }
        }

        Ok(())
    }

    pub async fn checksum<P: AsRef<Path>>(&self, path: P) -> Result<String, StorageError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(sha256_hex(&bytes))
    }

    /// Removes leftover temp files of a chapter.
    pub async fn discard_partial(&self, work_id: i64, chapter_id: i64) -> Result<(), StorageError> {
        let dir = self.chapter_dir(work_id, chapter_id);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(".part") {
                debug!("removing {}", entry.path().display());
                tokio::fs::remove_file(entry.path()).await?;
            }
        }

        Ok(())
    }

    pub async fn remove_chapter(&self, work_id: i64, chapter_id: i64) -> Result<(), StorageError> {
        let dir = self.chapter_dir(work_id, chapter_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("removed {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_work_info_if_not_exists(&self, work: &Work) -> Result<(), StorageError> {
        let work_dir = self.work_dir(work.id);
        let path = work_dir.join(DETAILS_FILE);
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }

        info!("creating directory: {}", work_dir.display());
        tokio::fs::create_dir_all(&work_dir).await?;

        let details = WorkDetails {
            title: Some(work.title.clone()),
            author: (!work.authors.is_empty()).then(|| work.authors.clone()),
            genre: None,
            status: Some(work.status.as_str().to_string()),
            description: work.synopsis.clone(),
            cover_path: None,
        };

        tokio::fs::write(&path, serde_json::to_vec_pretty(&details)?).await?;

        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.root.join(PAUSE_MARKER).exists()
    }

    pub async fn set_paused(&self, paused: bool) -> Result<(), StorageError> {
        let marker = self.root.join(PAUSE_MARKER);
        if paused {
            tokio::fs::create_dir_all(&self.root).await?;
            tokio::fs::write(&marker, b"").await?;
        } else {
            match tokio::fs::remove_file(&marker).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }
}
