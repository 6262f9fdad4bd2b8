pub use crate::fetch::{FetchError, Fetched, Fetcher, RetryPolicy};
pub use crate::manager::{SourceError, SourceManager};
pub use yomu_lib::prelude::*;
