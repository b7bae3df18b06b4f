pub mod api;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod limits;
pub mod locks;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod roles;
pub mod store;
pub mod tasks;
pub mod wal;
