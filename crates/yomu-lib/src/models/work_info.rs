use serde::{Deserialize, Serialize};

/// A type represent work details, normalized across source
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct WorkInfo {
    pub source_id: i64,
    pub title: String,
    pub authors: Vec<String>,
    pub genres: Vec<String>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub path: String,
    pub cover_url: Option<String>,
}
