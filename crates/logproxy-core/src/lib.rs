pub mod config;
pub mod error;
pub mod types;

pub use error::{LogproxyError, Result};
pub use types::{ConsumerId, LogEvent};
