//! Parley - Real-time chat relay server
//!
//! A WebSocket chat relay with private pair conversations, group rooms,
//! persistent history, and mention-scoped message visibility.

pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod web;

pub use chat::{ClientEvent, Dispatcher, RoomKey, RoomManager, ServerEvent, SessionRegistry};
pub use config::Config;
pub use db::{
    ChatUser, Database, Group, GroupRepository, HistoryPage, MessageRepository, NewMessage,
    StoredMessage, UserRepository,
};
pub use error::{ParleyError, Result};
pub use web::WebServer;
