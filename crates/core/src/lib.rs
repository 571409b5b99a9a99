pub mod backoff;
pub mod config;
pub mod error;
pub mod types;
pub mod urlnorm;

pub use backoff::Backoff;
pub use config::AppConfig;
pub use error::CrawlError;
pub use types::*;
