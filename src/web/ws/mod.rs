//! WebSocket endpoint for real-time chat.

pub mod handler;

pub use handler::chat_ws_handler;
