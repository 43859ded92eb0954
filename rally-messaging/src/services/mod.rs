pub mod chat_service;

pub use chat_service::{ChatService, MAX_MESSAGE_LEN};
