use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A page reference as listed by a source, `index` is 0-based.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PageInfo {
    pub index: usize,
    pub url: String,
}

impl PageInfo {
    pub fn from_urls<I, S>(urls: I) -> Vec<PageInfo>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        urls.into_iter()
            .enumerate()
            .map(|(index, url)| PageInfo {
                index,
                url: url.into(),
            })
            .collect()
    }
}

/// Raw image content of a page.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub bytes: Bytes,
    pub content_type: String,
}
