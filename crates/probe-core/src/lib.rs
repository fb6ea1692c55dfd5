pub mod config;
pub mod decision;
pub mod events;
pub mod knowledge;
pub mod prompt;
pub mod tasks;
pub mod types;

pub use config::Config;
pub use knowledge::KnowledgeStore;
pub use types::*;
