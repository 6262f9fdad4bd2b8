use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use yomu_lib::prelude::WorkInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Ongoing,
    Completed,
    Hiatus,
    #[default]
    Unknown,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Ongoing => "ongoing",
            WorkStatus::Completed => "completed",
            WorkStatus::Hiatus => "hiatus",
            WorkStatus::Unknown => "unknown",
        }
    }
}

// sources report free text, anything unrecognized is unknown
impl From<&str> for WorkStatus {
    fn from(status: &str) -> Self {
        let status = status.trim().to_lowercase();
        if status.contains("ongoing") || status.contains("publishing") {
            WorkStatus::Ongoing
        } else if status.contains("complete") || status.contains("finished") {
            WorkStatus::Completed
        } else if status.contains("hiatus") {
            WorkStatus::Hiatus
        } else {
            WorkStatus::Unknown
        }
    }
}

#[derive(Debug, Clone)]
pub struct Work {
    pub id: i64,
    pub source_id: i64,
    pub path: String,
    pub title: String,
    pub authors: Vec<String>,
    pub synopsis: Option<String>,
    pub status: WorkStatus,
    pub cover_url: Option<String>,
    pub in_library: bool,
    pub last_read_chapter_id: Option<i64>,
    pub last_update: Option<NaiveDateTime>,
    pub update_error: Option<String>,
    pub date_added: NaiveDateTime,
}

impl Work {
    pub fn metadata(&self) -> WorkMetadata {
        WorkMetadata {
            title: self.title.clone(),
            authors: self.authors.clone(),
            synopsis: self.synopsis.clone(),
            status: self.status,
            cover_url: self.cover_url.clone(),
        }
    }
}

/// The part of a work a source is allowed to overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkMetadata {
    pub title: String,
    pub authors: Vec<String>,
    pub synopsis: Option<String>,
    pub status: WorkStatus,
    pub cover_url: Option<String>,
}

impl From<&WorkInfo> for WorkMetadata {
    fn from(info: &WorkInfo) -> Self {
        Self {
            title: info.title.clone(),
            authors: info.authors.clone(),
            synopsis: info.description.clone(),
            status: info
                .status
                .as_deref()
                .map(WorkStatus::from)
                .unwrap_or_default(),
            cover_url: info.cover_url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewWork {
    pub source_id: i64,
    pub path: String,
    pub metadata: WorkMetadata,
    pub in_library: bool,
}

impl From<WorkInfo> for NewWork {
    fn from(info: WorkInfo) -> Self {
        Self {
            source_id: info.source_id,
            metadata: WorkMetadata::from(&info),
            path: info.path,
            in_library: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub auto_download: bool,
}
