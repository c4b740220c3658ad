//! signd signing plugin for homecore.
//!
//! Sends host files to signd.it for e-signing, keeps a table mapping host
//! files to signd processes and periodically drops rows whose file is gone.

pub mod account;
pub mod api;
pub mod config;
pub mod core_bridge;
pub mod db;
pub mod error;
pub mod housekeeping;
pub mod model;
pub mod overview;
pub mod plugin;
pub mod processes;
pub mod settings;
pub mod sign_api;
pub mod signing;
pub mod storage;
