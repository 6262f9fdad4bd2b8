use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Lang {
    All,
    Single(String),
    Multi(Vec<String>),
}

/// What a source can do, consulted before calling it.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct Capabilities {
    pub nsfw: bool,
    pub requires_login: bool,
    pub search: bool,
    pub chapter_updates: bool,
    pub downloads: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            nsfw: false,
            requires_login: false,
            search: true,
            chapter_updates: true,
            downloads: true,
        }
    }
}

/// A type represent source
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceInfo {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub version: String,
    pub languages: Lang,
    #[serde(default)]
    pub capabilities: Capabilities,
}
