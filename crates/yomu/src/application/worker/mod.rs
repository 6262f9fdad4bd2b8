pub mod downloads;
pub mod job;
pub mod pool;
pub mod updates;
