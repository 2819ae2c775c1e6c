mod error;

pub mod gateway;
pub mod utils;

pub use error::{AdaError, Result};
pub use gateway::message::{CacheControl, ContentPart, ImageUrl, Message, MessageContent, Role};
pub use gateway::settings::{CostSettings, SettingsStore};
