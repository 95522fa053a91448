pub mod chat;
pub mod health;

// Re-export all handlers for easy route registration
pub use chat::{chat_abort_handler, chat_handler, chat_history_handler, chat_inject_handler};
pub use health::{health_handler, health_live_handler, health_ready_handler, metrics_handler};
