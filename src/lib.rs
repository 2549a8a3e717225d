#![forbid(unsafe_code)]

//! Line-oriented JSON control protocol between a caller and an agent host
//! running as a child process.

pub mod client;
pub mod config;
pub mod errors;
pub mod host;
pub mod protocol;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
