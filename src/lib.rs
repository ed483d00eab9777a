//! Mirror the file tree served by an ez Share Wi-Fi SD card onto a local
//! directory, fetching only new or changed files.

pub mod config;
pub mod error;
pub mod ezshare;
pub mod network;
pub mod sync;

pub use error::{Result, SyncError};
