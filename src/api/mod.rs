pub mod catalog;
pub mod config;
pub mod downloader;
pub mod error;
pub mod logging;
pub mod models;
pub mod remote;
pub mod store;
