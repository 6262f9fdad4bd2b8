#[macro_use]
extern crate log;

pub mod api;
pub mod fetch;
pub mod manager;
pub mod prelude;
