use std::{
    fs::{DirEntry, ReadDir},
    io::Read,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::UNIX_EPOCH,
};

use async_trait::async_trait;
use bytes::Bytes;
use fancy_regex::Regex;
use mime_guess::mime;
use serde::{Deserialize, Serialize};
use yomu_lib::prelude::{
    Capabilities, ChapterInfo, Lang, PageImage, PageInfo, Provider, ProviderError, SourceInfo,
    WorkInfo,
};

/// Source ids from this value up are reserved for local folders.
pub const LOCAL_SOURCE_ID: i64 = 10000;

const ARCHIVE_EXTENSION: &str = "cbz";
const PAGE_SIZE: usize = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkDetails {
    pub title: Option<String>,
    pub author: Option<Vec<String>>,
    pub genre: Option<Vec<String>>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub cover_path: Option<String>,
}

/// Reads works from a folder on disk, each sub-directory is a work and each
/// sub-directory or `.cbz` inside it is a chapter.
pub struct LocalProvider {
    id: i64,
    name: String,
    path: PathBuf,
}

impl LocalProvider {
    pub fn new<P: AsRef<Path>>(id: i64, name: String, path: P) -> Self {
        let path = PathBuf::new().join(path);
        Self { id, name, path }
    }
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
}

fn is_image(path: &str) -> bool {
    mime_guess::from_path(path)
        .first()
        .is_some_and(|m| m.type_() == mime::IMAGE)
}

fn filter_supported_files_and_folders(entry: Result<DirEntry, std::io::Error>) -> Option<DirEntry> {
    let entry = entry.ok()?;
    if entry.path().is_dir() || is_archive(&entry.path()) {
        Some(entry)
    } else {
        None
    }
}

fn sort_dir(dir: ReadDir) -> Vec<DirEntry> {
    let mut dir: Vec<DirEntry> = dir.into_iter().filter_map(Result::ok).collect();
    dir.sort_by(|a, b| {
        human_sort::compare(
            a.path().display().to_string().as_str(),
            b.path().display().to_string().as_str(),
        )
    });
    dir
}

fn find_details(path: &Path) -> Option<WorkDetails> {
    let data = std::fs::read(path.join("details.json")).ok()?;
    serde_json::from_slice(&data).ok()
}

// first image of the first chapter
fn find_cover_url(path: &Path) -> Option<String> {
    let chapter = sort_dir(path.read_dir().ok()?)
        .into_iter()
        .find(|entry| entry.path().is_dir() || is_archive(&entry.path()))?;

    if chapter.path().is_dir() {
        get_pages_from_dir(&chapter.path()).ok()?.into_iter().next()
    } else {
        get_pages_from_archive(&chapter.path()).ok()?.into_iter().next()
    }
}

fn get_pages_from_archive(path: &Path) -> Result<Vec<String>, ProviderError> {
    let file = std::fs::File::open(path).map_err(ProviderError::content_missing)?;
    let archive = zip::ZipArchive::new(file).map_err(ProviderError::format_changed)?;

    let pages = archive
        .file_names()
        .filter(|name| is_image(name))
        .map(|name| path.join(name).display().to_string())
        .collect();

    Ok(pages)
}

fn get_pages_from_dir(path: &Path) -> Result<Vec<String>, ProviderError> {
    let mut pages: Vec<String> = path
        .read_dir()
        .map_err(ProviderError::content_missing)?
        .filter_map(Result::ok)
        .filter_map(|f| (f.path().is_file()).then(|| f.path().display().to_string()))
        .filter(|p| is_image(p))
        .collect();
    pages.sort_by(|a, b| human_sort::compare(a, b));

    Ok(pages)
}

// splits `<archive>.cbz/<entry>` into the archive and the entry name
fn split_archive_path(path: &Path) -> Option<(PathBuf, String)> {
    let archive = path.ancestors().skip(1).find(|p| p.is_file() && is_archive(p))?;
    let entry = path.strip_prefix(archive).ok()?;

    Some((archive.to_path_buf(), entry.to_string_lossy().replace('\\', "/")))
}

// ASCII classes only, fancy-regex is built without its unicode tables
static CHAPTER_NUMBER: LazyLock<Result<Regex, fancy_regex::Error>> = LazyLock::new(|| {
    Regex::new(
        r"(?<=[vV])([0-9]+(?:\.[0-9]+)?)|(?<=[vV]olume)[ \t]*([0-9]+)|(?<=[vV]ol)[ \t]*([0-9]+)|(?<=[ \t])([0-9]+(?:\.[0-9]+)?)|([0-9]+(?:\.[0-9]+)?)",
    )
});

fn chapter_number_regex() -> Result<&'static Regex, ProviderError> {
    CHAPTER_NUMBER
        .as_ref()
        .map_err(|e| ProviderError::format_changed(format!("chapter number pattern: {e}")))
}

fn chapter_number(number_re: &Regex, file_name: &str) -> f64 {
    match number_re.find(file_name).ok().flatten() {
        Some(mat) => mat.as_str().trim().parse().unwrap_or(0_f64),
        None => 10000_f64,
    }
}

fn map_entry_to_chapter(source_id: i64, number_re: &Regex, path: &Path) -> Option<ChapterInfo> {
    let modified = path
        .metadata()
        .ok()
        .and_then(|metadata| metadata.modified().ok())
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())?
        .as_secs();

    let file_name = path.file_stem()?.to_string_lossy().to_string();
    let number = chapter_number(number_re, &file_name);

    Some(ChapterInfo {
        source_id,
        title: file_name,
        path: path.display().to_string(),
        number,
        scanlator: None,
        uploaded: modified as i64,
    })
}

async fn blocking<T, F>(f: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(ProviderError::unavailable)?
}

fn search_dir(
    source_id: i64,
    root: &Path,
    query: &str,
    page: i64,
) -> Result<Vec<WorkInfo>, ProviderError> {
    let offset = (page.max(1) as usize - 1) * PAGE_SIZE;
    let keyword = query.to_lowercase();

    let read_dir = std::fs::read_dir(root).map_err(ProviderError::unavailable)?;

    let works = sort_dir(read_dir)
        .into_iter()
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| {
            keyword.is_empty()
                || entry
                    .file_name()
                    .to_string_lossy()
                    .to_lowercase()
                    .contains(&keyword)
        })
        .skip(offset)
        .take(PAGE_SIZE)
        .map(|entry| WorkInfo {
            source_id,
            title: entry.file_name().to_string_lossy().to_string(),
            path: entry.path().display().to_string(),
            cover_url: find_cover_url(&entry.path()),
            ..Default::default()
        })
        .collect();

    Ok(works)
}

fn read_work_detail(source_id: i64, path: PathBuf) -> Result<WorkInfo, ProviderError> {
    if !path.is_dir() {
        return Err(ProviderError::content_missing(path.display()));
    }

    let title = path
        .file_name()
        .map_or(String::new(), |s| s.to_string_lossy().to_string());

    let mut work = WorkInfo {
        source_id,
        title,
        path: path.display().to_string(),
        cover_url: find_cover_url(&path),
        ..Default::default()
    };

    if let Some(info) = find_details(&path) {
        if let Some(title) = info.title {
            work.title = title;
        }
        if let Some(cover_path) = info.cover_path {
            work.cover_url = Some(path.join(cover_path).display().to_string());
        }
        if let Some(author) = info.author {
            work.authors = author;
        }
        if let Some(genre) = info.genre {
            work.genres = genre;
        }
        work.status = info.status;
        work.description = info.description;
    }

    Ok(work)
}

fn read_chapters(source_id: i64, path: &str) -> Result<Vec<ChapterInfo>, ProviderError> {
    let number_re = chapter_number_regex()?;
    let read_dir = std::fs::read_dir(path).map_err(ProviderError::content_missing)?;

    let mut data: Vec<ChapterInfo> = read_dir
        .into_iter()
        .filter_map(filter_supported_files_and_folders)
        .filter_map(|entry| map_entry_to_chapter(source_id, number_re, &entry.path()))
        .collect();

    data.sort_by(|a, b| a.number.total_cmp(&b.number));

    Ok(data)
}

fn read_pages(path: PathBuf) -> Result<Vec<PageInfo>, ProviderError> {
    let pages = if path.is_dir() {
        get_pages_from_dir(&path)?
    } else if path.is_file() {
        let mut pages = get_pages_from_archive(&path)?;
        pages.sort_by(|a, b| human_sort::compare(a, b));
        pages
    } else {
        return Err(ProviderError::content_missing(format!(
            "{} is neither file or dir",
            path.display()
        )));
    };

    Ok(PageInfo::from_urls(pages))
}

fn read_page_image(page: PageInfo) -> Result<PageImage, ProviderError> {
    let path = PathBuf::from(&page.url);
    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();

    if path.is_file() {
        let bytes = std::fs::read(&path).map_err(ProviderError::content_missing)?;
        return Ok(PageImage {
            bytes: Bytes::from(bytes),
            content_type,
        });
    }

    let (archive, entry) = split_archive_path(&path)
        .ok_or_else(|| ProviderError::content_missing(path.display()))?;
    let file = std::fs::File::open(&archive).map_err(ProviderError::content_missing)?;
    let mut archive = zip::ZipArchive::new(file).map_err(ProviderError::format_changed)?;
    let mut file = archive
        .by_name(&entry)
        .map_err(ProviderError::content_missing)?;

    let mut bytes = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut bytes)
        .map_err(ProviderError::format_changed)?;

    Ok(PageImage {
        bytes: Bytes::from(bytes),
        content_type,
    })
}

#[async_trait]
impl Provider for LocalProvider {
    fn source_info(&self) -> SourceInfo {
        SourceInfo {
            id: self.id,
            name: self.name.clone(),
            url: self.path.display().to_string(),
            version: "0.0.0".to_string(),
            languages: Lang::All,
            capabilities: Capabilities {
                downloads: false,
                ..Default::default()
            },
        }
    }

    async fn search_works(&self, query: String, page: i64) -> Result<Vec<WorkInfo>, ProviderError> {
        let (source_id, root) = (self.id, self.path.clone());
        blocking(move || search_dir(source_id, &root, &query, page)).await
    }

    async fn get_work_detail(&self, path: String) -> Result<WorkInfo, ProviderError> {
        let source_id = self.id;
        blocking(move || read_work_detail(source_id, PathBuf::from(path))).await
    }

    async fn get_chapters(&self, path: String) -> Result<Vec<ChapterInfo>, ProviderError> {
        let source_id = self.id;
        blocking(move || read_chapters(source_id, &path)).await
    }

    async fn get_pages(&self, path: String) -> Result<Vec<PageInfo>, ProviderError> {
        blocking(move || read_pages(PathBuf::from(path))).await
    }

    async fn get_page_image(&self, page: PageInfo) -> Result<PageImage, ProviderError> {
        blocking(move || read_page_image(page)).await
    }
}
