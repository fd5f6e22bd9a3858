pub mod config;
pub mod error;
pub mod types;

pub use config::AppConfig;
pub use error::FetchError;
pub use types::*;
