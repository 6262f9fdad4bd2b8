pub mod config;
pub mod database;
pub mod domain;
pub mod local;
pub mod storage;
