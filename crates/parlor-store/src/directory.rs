//! Chat room directory: id-to-metadata mapping for the chat list.
//!
//! Refreshed wholesale from the list API and patched incrementally as push
//! messages arrive.  `last_message` here is display-only denormalization;
//! the timeline store owns message content and ordering.

use tracing::debug;

use parlor_shared::types::{ChatId, ChatKind, ChatRoom, Message, UserId};

/// In-memory chat list, ordered as the server returned it.
#[derive(Debug, Default)]
pub struct ChatDirectory {
    rooms: Vec<ChatRoom>,
}

impl ChatDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole list from a list-API refresh.
    pub fn replace_all(&mut self, rooms: Vec<ChatRoom>) {
        debug!(count = rooms.len(), "Chat directory refreshed");
        self.rooms = rooms;
    }

    /// Insert a room, or replace the existing room with the same id.
    /// Returns true when the room was new.
    pub fn upsert(&mut self, room: ChatRoom) -> bool {
        if let Some(existing) = self.rooms.iter_mut().find(|r| r.id == room.id) {
            *existing = room;
            false
        } else {
            self.rooms.push(room);
            true
        }
    }

    pub fn get(&self, chat_id: &ChatId) -> Option<&ChatRoom> {
        self.rooms.iter().find(|r| r.id == *chat_id)
    }

    pub fn rooms(&self) -> &[ChatRoom] {
        &self.rooms
    }

    /// Patch the directory for a push-delivered message: update the
    /// denormalized last message, and bump the unread count unless the
    /// viewer authored it.  Returns whether a room was patched.
    pub fn note_incoming(&mut self, message: &Message, viewer: &UserId) -> bool {
        let Some(room) = self.rooms.iter_mut().find(|r| r.id == message.chat_id) else {
            return false;
        };

        room.last_message = Some(message.clone());
        if message.sender_id != *viewer {
            room.unread_count += 1;
        }
        true
    }

    /// Reset a room's unread count (the viewer read the chat).
    pub fn reset_unread(&mut self, chat_id: &ChatId) {
        if let Some(room) = self.rooms.iter_mut().find(|r| r.id == *chat_id) {
            room.unread_count = 0;
        }
    }

    /// For a direct chat, the participant who is not the viewer.  Message
    /// creates into direct chats carry this as the receiver.
    pub fn receiver_for_direct(&self, chat_id: &ChatId, viewer: &UserId) -> Option<UserId> {
        let room = self.get(chat_id)?;
        if room.kind != ChatKind::Direct {
            return None;
        }
        room.participants
            .iter()
            .find(|p| p.id != *viewer)
            .map(|p| p.id.clone())
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
    }
}
