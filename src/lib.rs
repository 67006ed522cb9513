pub mod api;
pub mod app;
pub mod catalog;
pub mod config;
pub mod database;
pub mod download;
pub mod env_flags;
pub mod layout;
pub mod model;
pub mod preview;
pub mod reveal;
pub mod sidecar;
