use serde::{Deserialize, Serialize};

/// A type represent chapter, normalized across source
///
/// `path` is the remote identifier of the chapter and stays stable when a
/// source renumbers its chapters, `number` is only an ordering key.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChapterInfo {
    pub source_id: i64,
    pub title: String,
    pub path: String,
    pub number: f64,
    pub scanlator: Option<String>,
    /// unix timestamp in seconds
    pub uploaded: i64,
}
