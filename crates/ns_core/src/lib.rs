pub mod app_error;
pub mod canon_json;
pub mod hashing;
pub mod types;
pub mod workspace;
pub mod db;
pub mod config;
pub mod ledger;
pub mod remote;
pub mod remote_memory;
pub mod github;
pub mod lock;
pub mod sync;
pub mod conflict;
pub mod optimize;
pub mod backup;
pub mod notify;
pub mod service;

pub use app_error::{AppError, AppResult, ErrorCode};
