use std::{fmt::Display, str::FromStr};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use yomu_lib::prelude::ChapterInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    NotDownloaded,
    Downloading,
    Downloaded,
    Error,
}

#[derive(Debug, Error)]
#[error("unknown download status {0:?}")]
pub struct UnknownDownloadStatus(pub String);

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::NotDownloaded => "not_downloaded",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Downloaded => "downloaded",
            DownloadStatus::Error => "error",
        }
    }

    /// Whether the persisted status may move from `self` to `to`.
    pub fn can_transition(&self, to: DownloadStatus) -> bool {
        use DownloadStatus::*;

        matches!(
            (self, to),
            (NotDownloaded, Downloading)
                | (Downloading, Downloaded)
                | (Downloading, Error)
                | (Downloading, NotDownloaded)
                | (Error, Downloading)
                | (Error, NotDownloaded)
                | (Downloaded, NotDownloaded)
                | (Downloaded, Error)
        )
    }
}

impl Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = UnknownDownloadStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_downloaded" => Ok(DownloadStatus::NotDownloaded),
            "downloading" => Ok(DownloadStatus::Downloading),
            "downloaded" => Ok(DownloadStatus::Downloaded),
            "error" => Ok(DownloadStatus::Error),
            other => Err(UnknownDownloadStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chapter {
    pub id: i64,
    pub work_id: i64,
    pub source_id: i64,
    pub path: String,
    pub title: String,
    pub rank: f64,
    pub scanlator: Option<String>,
    pub uploaded: i64,
    pub read: bool,
    pub last_page_read: i64,
    pub download_status: DownloadStatus,
    pub download_error: Option<String>,
    pub date_added: NaiveDateTime,
}

/// Fields of a chapter that come from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChapter {
    pub source_id: i64,
    pub path: String,
    pub title: String,
    pub rank: f64,
    pub scanlator: Option<String>,
    pub uploaded: i64,
}

impl From<ChapterInfo> for NewChapter {
    fn from(ch: ChapterInfo) -> Self {
        Self {
            source_id: ch.source_id,
            path: ch.path,
            title: ch.title,
            rank: ch.number,
            scanlator: ch.scanlator,
            uploaded: ch.uploaded,
        }
    }
}

impl NewChapter {
    pub fn differs_from(&self, chapter: &Chapter) -> bool {
        self.title != chapter.title
            || self.rank != chapter.rank
            || self.scanlator != chapter.scanlator
            || self.uploaded != chapter.uploaded
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChapterChange {
    pub id: i64,
    pub title: String,
    pub rank: f64,
    pub scanlator: Option<String>,
    pub uploaded: i64,
}

/// Writes needed to bring the local chapter list of a work in line with its source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChapterDiff {
    pub added: Vec<NewChapter>,
    pub changed: Vec<ChapterChange>,
    pub removed: Vec<i64>,
}

impl ChapterDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn writes(&self) -> usize {
        self.added.len() + self.changed.len() + self.removed.len()
    }
}
