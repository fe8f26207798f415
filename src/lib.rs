pub mod application;
pub mod cache;
pub mod config;
pub mod content;
pub mod infra;
