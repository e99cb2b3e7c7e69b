//! The message timeline: a per-session ordered collection of messages for
//! the currently selected chat.
//!
//! Three producers feed it (history pages, push deliveries, optimistic local
//! sends) and one reader consumes it.  Every insertion funnels through
//! id-based idempotent merges, so push and poll can race a history fetch in
//! any order without producing duplicates or reordering.  Invariants after
//! every operation: messages are unique by id and sorted by
//! `(timestamp, insertion sequence)`.

use tracing::debug;

use parlor_shared::types::{ChatId, Message, MessageId, MessageStatus};

/// Result of merging a fetched history page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The page belonged to the active chat; `inserted` new messages landed.
    Merged { inserted: usize },
    /// The page was empty: no more history exists for this chat.
    EndOfHistory,
    /// The page was requested for a chat that is no longer selected and was
    /// discarded without touching any state.
    StaleChat,
}

/// Confirmation state of a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Server-confirmed (history, push, or a resolved create request).
    Confirmed,
    /// Optimistic local send, create request still in flight.
    Pending,
    /// Optimistic local send whose create request failed.  The entry stays
    /// visible under its temporary id so the user can retry.
    Failed,
}

#[derive(Debug, Clone)]
struct TimelineEntry {
    message: Message,
    /// Monotonic insertion sequence, the tie-breaker for equal timestamps.
    seq: u64,
    send_state: SendState,
}

/// Ordered, deduplicated message collection for the selected chat.
#[derive(Debug, Default)]
pub struct TimelineStore {
    active_chat: Option<ChatId>,
    entries: Vec<TimelineEntry>,
    next_seq: u64,
    has_more: bool,
}

impl TimelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The chat the timeline currently belongs to.
    pub fn active_chat(&self) -> Option<&ChatId> {
        self.active_chat.as_ref()
    }

    /// Select a chat: drops all previous entries *before* anything for the
    /// new chat is loaded, so a reader never sees the new chat id paired
    /// with the old chat's messages.
    pub fn select_chat(&mut self, chat_id: ChatId) {
        debug!(chat = %chat_id, "Timeline switched to chat");
        self.active_chat = Some(chat_id);
        self.entries.clear();
        self.has_more = true;
    }

    /// Drop all state (session teardown).
    pub fn clear(&mut self) {
        self.active_chat = None;
        self.entries.clear();
        self.has_more = false;
    }

    /// Merge one fetched history page.
    ///
    /// Existing entries win: duplicates from a re-fetch are dropped, not
    /// overwritten.  A response for a chat other than the active one is
    /// discarded wholesale, which is what makes in-flight responses from a
    /// previous chat selection harmless.
    pub fn merge_page(
        &mut self,
        chat_id: &ChatId,
        messages: Vec<Message>,
        has_more: bool,
    ) -> MergeOutcome {
        if self.active_chat.as_ref() != Some(chat_id) {
            debug!(chat = %chat_id, "Discarding history page for unselected chat");
            return MergeOutcome::StaleChat;
        }

        if messages.is_empty() {
            self.has_more = false;
            return MergeOutcome::EndOfHistory;
        }

        let mut inserted = 0;
        for message in messages {
            if self.contains(&message.id) {
                continue;
            }
            self.push_entry(message, SendState::Confirmed);
            inserted += 1;
        }
        self.has_more = has_more;
        self.resort();

        debug!(chat = %chat_id, inserted, "Merged history page");
        MergeOutcome::Merged { inserted }
    }

    /// The single dedup choke point for push deliveries and poll refreshes.
    ///
    /// Idempotent: a message whose id is already present is a no-op, and a
    /// message for a chat other than the active one is ignored.  Returns
    /// whether the message was inserted.
    pub fn append_incoming(&mut self, message: Message) -> bool {
        if self.active_chat.as_ref() != Some(&message.chat_id) {
            return false;
        }
        if self.contains(&message.id) {
            return false;
        }

        self.push_entry(message, SendState::Confirmed);
        self.resort();
        true
    }

    /// Insert an optimistic local send under its temporary id.
    pub fn insert_local(&mut self, message: Message) -> bool {
        if self.active_chat.as_ref() != Some(&message.chat_id) {
            return false;
        }

        debug!(local_id = %message.id, "Inserted optimistic message");
        self.push_entry(message, SendState::Pending);
        self.resort();
        true
    }

    /// Replace an optimistic entry with its server-confirmed counterpart.
    ///
    /// The confirmed entry keeps the temp entry's insertion sequence (stable
    /// position among equal timestamps) while the server timestamp governs
    /// future sorts.  If the confirmed id already arrived through another
    /// source, the temp entry is simply dropped so exactly one copy remains.
    /// Status advances to at least `Delivered`, never backwards.
    pub fn confirm_local(&mut self, local_id: &MessageId, mut confirmed: Message) -> bool {
        confirmed.status = confirmed.status.advanced_to(MessageStatus::Delivered);

        if self.contains(&confirmed.id) {
            let existed = self.remove(local_id);
            if existed {
                debug!(local_id = %local_id, id = %confirmed.id, "Confirmed message already present, dropped temp entry");
            }
            return existed;
        }

        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.message.id == *local_id)
        else {
            // Chat switched while the create request was in flight.
            return false;
        };

        debug!(local_id = %local_id, id = %confirmed.id, "Optimistic message confirmed");
        entry.message = confirmed;
        entry.send_state = SendState::Confirmed;
        self.resort();
        true
    }

    /// Mark an optimistic entry as failed.  The entry stays in place under
    /// its temporary id with status unchanged.
    pub fn mark_send_failed(&mut self, local_id: &MessageId) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.message.id == *local_id)
        else {
            return false;
        };
        entry.send_state = SendState::Failed;
        true
    }

    /// Apply a server-returned updated entity (edit, reaction, pin) by id.
    /// Status stays monotonic even if the server echoes an older one.
    pub fn apply_update(&mut self, mut updated: Message) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.message.id == updated.id)
        else {
            return false;
        };

        updated.status = entry.message.status.advanced_to(updated.status);
        entry.message = updated;
        self.resort();
        true
    }

    /// Remove a message by id (server-confirmed delete).
    pub fn remove(&mut self, id: &MessageId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.message.id != *id);
        self.entries.len() != before
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.iter().any(|e| e.message.id == *id)
    }

    /// Messages in display order.
    pub fn messages(&self) -> Vec<&Message> {
        self.entries.iter().map(|e| &e.message).collect()
    }

    /// Confirmation state of one entry, if present.
    pub fn send_state(&self, id: &MessageId) -> Option<SendState> {
        self.entries
            .iter()
            .find(|e| e.message.id == *id)
            .map(|e| e.send_state)
    }

    /// Whether older history pages may still exist.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push_entry(&mut self, message: Message, send_state: SendState) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(TimelineEntry {
            message,
            seq,
            send_state,
        });
    }

    fn resort(&mut self) {
        self.entries
            .sort_by(|a, b| a.message.timestamp.cmp(&b.message.timestamp).then(a.seq.cmp(&b.seq)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parlor_shared::types::{MessageKind, UserId};

    fn msg(id: &str, chat: &str, ts: i64) -> Message {
        Message {
            id: MessageId::new(id),
            chat_id: ChatId::new(chat),
            sender_id: UserId::new("u1"),
            receiver_id: None,
            content: format!("msg {id}"),
            kind: MessageKind::Text,
            timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
            status: MessageStatus::Sent,
            reactions: Vec::new(),
            pinned: false,
            edited_at: None,
            file_url: None,
            file_name: None,
            file_size: None,
        }
    }

    fn ids(store: &TimelineStore) -> Vec<String> {
        store.messages().iter().map(|m| m.id.0.clone()).collect()
    }

    fn assert_sorted(store: &TimelineStore) {
        let messages = store.messages();
        for pair in messages.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp, "order invariant violated");
        }
    }

    #[test]
    fn test_append_incoming_is_idempotent() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("c1"));

        assert!(store.append_incoming(msg("m1", "c1", 100)));
        assert!(!store.append_incoming(msg("m1", "c1", 100)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_dedup_across_history_and_push() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("c1"));

        // Push delivery for m2 lands before the history fetch that also
        // contains m2 resolves.
        assert!(store.append_incoming(msg("m2", "c1", 200)));
        let outcome = store.merge_page(
            &ChatId::new("c1"),
            vec![msg("m1", "c1", 100), msg("m2", "c1", 200)],
            false,
        );

        assert_eq!(outcome, MergeOutcome::Merged { inserted: 1 });
        assert_eq!(ids(&store), vec!["m1", "m2"]);
        assert_sorted(&store);
    }

    #[test]
    fn test_order_invariant_under_out_of_order_arrival() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("c1"));

        store.append_incoming(msg("m3", "c1", 300));
        store.append_incoming(msg("m1", "c1", 100));
        store.merge_page(&ChatId::new("c1"), vec![msg("m2", "c1", 200)], true);

        assert_eq!(ids(&store), vec!["m1", "m2", "m3"]);
        assert_sorted(&store);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("c1"));

        store.append_incoming(msg("a", "c1", 100));
        store.append_incoming(msg("b", "c1", 100));
        store.append_incoming(msg("c", "c1", 100));
        // Re-sorting repeatedly must not shuffle ties.
        store.merge_page(&ChatId::new("c1"), vec![msg("d", "c1", 50)], true);

        assert_eq!(ids(&store), vec!["d", "a", "b", "c"]);
    }

    #[test]
    fn test_empty_page_records_end_of_history() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("c1"));
        assert!(store.has_more());

        assert_eq!(
            store.merge_page(&ChatId::new("c1"), Vec::new(), false),
            MergeOutcome::EndOfHistory
        );
        assert!(!store.has_more());

        // Calling again is a harmless no-op.
        assert_eq!(
            store.merge_page(&ChatId::new("c1"), Vec::new(), false),
            MergeOutcome::EndOfHistory
        );
    }

    #[test]
    fn test_refetch_does_not_overwrite_existing_entries() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("c1"));

        let mut original = msg("m1", "c1", 100);
        original.content = "original".into();
        store.append_incoming(original);

        let mut refetched = msg("m1", "c1", 100);
        refetched.content = "refetched".into();
        store.merge_page(&ChatId::new("c1"), vec![refetched], false);

        assert_eq!(store.messages()[0].content, "original");
    }

    #[test]
    fn test_stale_page_for_previous_chat_is_discarded() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("x"));
        store.select_chat(ChatId::new("y"));

        // The page requested for chat x resolves after the switch to y.
        let outcome = store.merge_page(&ChatId::new("x"), vec![msg("m1", "x", 100)], true);

        assert_eq!(outcome, MergeOutcome::StaleChat);
        assert!(store.is_empty());
        assert_eq!(store.active_chat(), Some(&ChatId::new("y")));
    }

    #[test]
    fn test_chat_switch_clears_before_new_load() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("x"));
        store.append_incoming(msg("m1", "x", 100));

        store.select_chat(ChatId::new("y"));
        assert!(store.is_empty());
        assert!(store.has_more());
    }

    #[test]
    fn test_incoming_for_other_chat_is_ignored() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("c1"));

        assert!(!store.append_incoming(msg("m1", "c2", 100)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_optimistic_confirm_replaces_in_place() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("c1"));

        let local_id = MessageId::temp();
        let mut local = msg("ignored", "c1", 500);
        local.id = local_id.clone();
        assert!(store.insert_local(local));
        assert_eq!(store.send_state(&local_id), Some(SendState::Pending));

        // Server assigns the real id and an authoritative timestamp.
        assert!(store.confirm_local(&local_id, msg("srv-1", "c1", 510)));

        assert_eq!(store.len(), 1);
        assert!(!store.contains(&local_id));
        let confirmed = store.messages()[0].clone();
        assert_eq!(confirmed.id, MessageId::new("srv-1"));
        assert_eq!(confirmed.status, MessageStatus::Delivered);
        assert_eq!(store.send_state(&confirmed.id), Some(SendState::Confirmed));
    }

    #[test]
    fn test_optimistic_failure_keeps_temp_entry() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("c1"));

        let local_id = MessageId::temp();
        let mut local = msg("ignored", "c1", 500);
        local.id = local_id.clone();
        store.insert_local(local);

        assert!(store.mark_send_failed(&local_id));
        assert_eq!(store.len(), 1);
        assert!(store.contains(&local_id));
        assert_eq!(store.messages()[0].status, MessageStatus::Sent);
        assert_eq!(store.send_state(&local_id), Some(SendState::Failed));
    }

    #[test]
    fn test_confirm_after_push_echo_leaves_single_copy() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("c1"));

        let local_id = MessageId::temp();
        let mut local = msg("ignored", "c1", 500);
        local.id = local_id.clone();
        store.insert_local(local);

        // The server's push echo of our own message wins the race against
        // the create response.
        store.append_incoming(msg("srv-1", "c1", 510));
        store.confirm_local(&local_id, msg("srv-1", "c1", 510));

        assert_eq!(store.len(), 1);
        assert_eq!(ids(&store), vec!["srv-1"]);
    }

    #[test]
    fn test_confirm_after_chat_switch_is_noop() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("x"));

        let local_id = MessageId::temp();
        let mut local = msg("ignored", "x", 500);
        local.id = local_id.clone();
        store.insert_local(local);

        store.select_chat(ChatId::new("y"));
        assert!(!store.confirm_local(&local_id, msg("srv-1", "x", 510)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_apply_update_keeps_status_monotonic() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("c1"));

        let mut delivered = msg("m1", "c1", 100);
        delivered.status = MessageStatus::Read;
        store.append_incoming(delivered);

        // Server echoes SENT on the edited entity; the local READ wins.
        let mut edited = msg("m1", "c1", 100);
        edited.content = "edited".into();
        assert!(store.apply_update(edited));

        let m = store.messages()[0];
        assert_eq!(m.content, "edited");
        assert_eq!(m.status, MessageStatus::Read);
    }

    #[test]
    fn test_remove_deletes_by_id() {
        let mut store = TimelineStore::new();
        store.select_chat(ChatId::new("c1"));
        store.append_incoming(msg("m1", "c1", 100));
        store.append_incoming(msg("m2", "c1", 200));

        assert!(store.remove(&MessageId::new("m1")));
        assert!(!store.remove(&MessageId::new("m1")));
        assert_eq!(ids(&store), vec!["m2"]);
    }
}
