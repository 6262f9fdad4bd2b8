pub mod chapter;
pub mod download;
pub mod page;
pub mod work;
