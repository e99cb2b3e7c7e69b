//! # parlor-shared
//!
//! Domain models, identifiers, and the push-channel wire protocol shared by
//! every Parlor crate.  All JSON shapes here mirror the server's API: struct
//! fields serialize as camelCase, message kind/status enums as
//! SCREAMING_SNAKE_CASE strings.

pub mod constants;
pub mod protocol;
pub mod types;

pub use protocol::{ClientFrame, PushQueue, ServerFrame};
pub use types::{
    ChatId, ChatKind, ChatRoom, GroupRequest, Message, MessageId, MessageKind, MessagePage,
    MessageRequest, MessageSearchResult, MessageStatus, Reaction, TypingIndicator, User, UserId,
};
