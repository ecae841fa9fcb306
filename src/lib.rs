// Library modules, also used by the integration tests
pub mod chat;
pub mod models;
pub mod transport;

// Re-export main types for convenience
pub use chat::{ChatError, ChatSession, SessionConfig, SessionUpdate};
pub use models::*;
