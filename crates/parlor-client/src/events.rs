//! Events emitted by the engine toward whatever frontend is driving it.
//!
//! Delivered over a `tokio::sync::broadcast` channel so any number of
//! views can observe the same session. A slow subscriber that lags only
//! loses its own backlog.

use parlor_shared::types::{ChatId, Message, MessageId};

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The visible message list of a chat changed for any reason
    /// (history page merged, push arrival, edit, delete).
    TimelineUpdated { chat_id: ChatId },
    /// A message from another party was inserted into the timeline.
    MessageReceived { message: Message },
    /// An optimistic send came back confirmed. `local_id` is the
    /// placeholder id the message carried until now.
    SendConfirmed {
        local_id: MessageId,
        message: Message,
    },
    /// An optimistic send failed. The placeholder entry stays visible
    /// and is flagged for retry.
    SendFailed { local_id: MessageId },
    /// The set of users currently typing changed.
    TypingChanged,
    /// Chat room list or unread counts changed.
    DirectoryUpdated,
    /// Push channel went up or down.
    ConnectionChanged { connected: bool },
    /// The push channel rejected our credential. Not retried.
    AuthFailed,
}
