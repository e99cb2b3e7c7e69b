//! Ephemeral typing presence, keyed by user.
//!
//! A reducer over inbound typing events: `isTyping = true` upserts,
//! `isTyping = false` removes.  Entries also expire after a bounded TTL,
//! because a peer that disconnects mid-type never sends the stop event, and
//! the whole set is cleared when the push channel drops.  Time is passed in
//! explicitly so expiry is testable without sleeping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parlor_shared::constants::TYPING_TTL_SECS;
use parlor_shared::types::{ChatId, TypingIndicator, UserId};

#[derive(Debug, Clone)]
struct TypingEntry {
    indicator: TypingIndicator,
    last_seen: Instant,
}

/// The set of users currently typing, across all chats.
#[derive(Debug)]
pub struct TypingTracker {
    ttl: Duration,
    entries: HashMap<UserId, TypingEntry>,
}

impl TypingTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Apply one inbound typing event.
    pub fn apply(&mut self, indicator: TypingIndicator, now: Instant) {
        if indicator.is_typing {
            self.entries.insert(
                indicator.user_id.clone(),
                TypingEntry {
                    indicator,
                    last_seen: now,
                },
            );
        } else {
            self.entries.remove(&indicator.user_id);
        }
    }

    /// Users typing in the given chat, excluding expired entries.
    pub fn typing_in(&self, chat_id: &ChatId, now: Instant) -> Vec<TypingIndicator> {
        self.entries
            .values()
            .filter(|e| e.indicator.chat_id == *chat_id && !self.expired(e, now))
            .map(|e| e.indicator.clone())
            .collect()
    }

    /// Drop expired entries.  Optional housekeeping; readers already filter.
    pub fn sweep(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.duration_since(e.last_seen) < ttl);
    }

    /// Forget everyone.  Called on push-channel disconnect so no indicator
    /// survives the connection that delivered it.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expired(&self, entry: &TypingEntry, now: Instant) -> bool {
        now.duration_since(entry.last_seen) >= self.ttl
    }
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(TYPING_TTL_SECS))
    }
}
