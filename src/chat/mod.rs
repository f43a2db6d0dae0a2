//! Chat subsystem for Parley.
//!
//! The dispatcher routes inbound wire events over the shared session and
//! room state, persisting messages through the db layer and fanning
//! delivery out to subscribed connections.

pub mod dispatcher;
pub mod events;
pub mod mentions;
pub mod room;
pub mod session;

pub use dispatcher::Dispatcher;
pub use events::{
    ClientEvent, GroupMessageRecord, MentionUser, PrivateMessageRecord, ServerEvent,
};
pub use mentions::resolve_mentions;
pub use room::{RoomKey, RoomManager, RoomMember};
pub use session::{Session, SessionRegistry};
