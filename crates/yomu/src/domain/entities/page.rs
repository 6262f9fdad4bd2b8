/// A downloaded page, only persisted once its chapter is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub chapter_id: i64,
    pub index: i64,
    pub remote_url: String,
    pub local_path: String,
    pub size: i64,
    pub checksum: String,
}
