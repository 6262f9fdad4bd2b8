pub mod chapter;
pub mod download;
pub mod work;
