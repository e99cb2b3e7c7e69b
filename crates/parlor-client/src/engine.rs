//! The session orchestrator.
//!
//! `ChatEngine` owns the timeline, directory and typing state behind one
//! mutex, bridges the push channel into them, and runs the fallback poll
//! for the active chat.  It is `Clone` and cheap to share; every clone
//! observes the same session.
//!
//! Delivery model: history pages and the poll loop fill the timeline over
//! HTTP, the push channel delivers live entities, and
//! `TimelineStore::append_incoming` dedups whatever arrives twice.  All
//! mutations go through the HTTP API; the push channel never originates
//! state changes on our side except typing signals and read receipts.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use parlor_net::{spawn_push, ConnectionState, PushCommand, PushConfig, PushEvent};
use parlor_shared::constants::ENGINE_EVENT_CAPACITY;
use parlor_shared::protocol::ClientFrame;
use parlor_shared::types::{
    ChatId, ChatRoom, GroupRequest, Message, MessageId, MessageKind, MessagePage, MessageRequest,
    MessageSearchResult, MessageStatus, TypingIndicator, User, UserId,
};
use parlor_store::{ChatDirectory, MergeOutcome, SendState, TimelineStore, TypingTracker};

use crate::api::{ApiError, ChatApi, Result};
use crate::config::EngineConfig;
use crate::events::EngineEvent;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineState {
    timeline: TimelineStore,
    directory: ChatDirectory,
    typing: TypingTracker,
    initialized: bool,
    /// Whether the view is pinned to the newest message.  The engine only
    /// tracks the flag; scrolling itself belongs to the frontend.
    stick_to_bottom: bool,
}

struct EngineInner {
    api: Arc<dyn ChatApi>,
    config: EngineConfig,
    viewer: User,
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
    push_tx: Mutex<Option<mpsc::Sender<PushCommand>>>,
    conn_state: Mutex<Option<watch::Receiver<ConnectionState>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    bridge_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one chat session.
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<EngineInner>,
}

impl ChatEngine {
    pub fn new(api: Arc<dyn ChatApi>, viewer: User, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(ENGINE_EVENT_CAPACITY);
        let state = EngineState {
            timeline: TimelineStore::new(),
            directory: ChatDirectory::new(),
            typing: TypingTracker::new(config.typing_ttl),
            initialized: false,
            stick_to_bottom: true,
        };
        Self {
            inner: Arc::new(EngineInner {
                api,
                config,
                viewer,
                state: Mutex::new(state),
                events,
                push_tx: Mutex::new(None),
                conn_state: Mutex::new(None),
                poll_task: Mutex::new(None),
                bridge_task: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to engine events.  Any number of subscribers is fine.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    // -- Lifecycle --

    /// Load the chat room list and announce presence.  Presence is
    /// best-effort: a failure there does not block the session.
    pub async fn start(&self) -> Result<()> {
        let rooms = self.inner.api.list_chats().await?;
        {
            let mut state = self.lock_state();
            state.directory.replace_all(rooms);
            state.initialized = true;
        }
        self.emit(EngineEvent::DirectoryUpdated);

        if let Err(e) = self.inner.api.set_presence(true).await {
            warn!(error = %e, "Presence announcement failed");
        }

        info!(user = %self.inner.viewer.id, "Chat engine started");
        Ok(())
    }

    /// Bring up the push channel and bridge its events into the stores.
    pub fn connect_push(&self) {
        let push_config = PushConfig {
            url: self.inner.config.push_url.clone(),
            token: self.inner.config.token.clone(),
            reconnect_delay: self.inner.config.reconnect_delay,
        };
        let (cmd_tx, mut event_rx, state_rx) = spawn_push(push_config);
        *lock(&self.inner.push_tx) = Some(cmd_tx);
        *lock(&self.inner.conn_state) = Some(state_rx);

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                engine.handle_push_event(event);
            }
            debug!("Push bridge ended");
        });
        if let Some(old) = lock(&self.inner.bridge_task).replace(handle) {
            old.abort();
        }
    }

    /// Stop background tasks, close the push channel and reset state.
    pub async fn shutdown(&self) {
        self.stop_poll();

        let push_tx = lock(&self.inner.push_tx).take();
        if let Some(tx) = push_tx {
            let _ = tx.send(PushCommand::Shutdown).await;
        }
        // The bridge ends on its own once the connection task closes the
        // event channel.
        lock(&self.inner.bridge_task).take();
        lock(&self.inner.conn_state).take();

        if let Err(e) = self.inner.api.set_presence(false).await {
            warn!(error = %e, "Offline announcement failed");
        }

        {
            let mut state = self.lock_state();
            state.timeline.clear();
            state.typing.clear();
            state.initialized = false;
            state.stick_to_bottom = true;
        }
        info!("Chat engine shut down");
    }

    // -- Chat selection and history --

    /// Make `chat_id` the active chat: the timeline is cleared before any
    /// fetch so stale messages are never visible, unread resets, and the
    /// fallback poll restarts against the new chat.
    pub async fn select_chat(&self, chat_id: ChatId) -> Result<()> {
        {
            let mut state = self.lock_state();
            state.timeline.select_chat(chat_id.clone());
            state.directory.reset_unread(&chat_id);
            state.stick_to_bottom = true;
        }
        self.emit(EngineEvent::TimelineUpdated {
            chat_id: chat_id.clone(),
        });
        self.emit(EngineEvent::DirectoryUpdated);

        self.stop_poll();
        let result = self.load_history_page(&chat_id, 0).await;
        self.spawn_poll(chat_id);
        result.map(|_| ())
    }

    /// Fetch one history page and merge it.  A response that lands after
    /// the user switched away is discarded by the store.
    pub async fn load_history_page(&self, chat_id: &ChatId, page: u32) -> Result<MergeOutcome> {
        let fetched: MessagePage = self
            .inner
            .api
            .fetch_messages(chat_id, page, self.inner.config.page_size)
            .await?;
        let outcome = {
            let mut state = self.lock_state();
            state
                .timeline
                .merge_page(chat_id, fetched.messages, fetched.has_more)
        };
        if matches!(outcome, MergeOutcome::Merged { .. }) {
            self.emit(EngineEvent::TimelineUpdated {
                chat_id: chat_id.clone(),
            });
        }
        Ok(outcome)
    }

    // -- Sending and mutating --

    /// Optimistic send: the message appears in the timeline immediately
    /// under a temporary id, which the server response later replaces.
    /// Returns the temporary id so callers can track the entry.
    pub async fn send_message(
        &self,
        content: &str,
        kind: MessageKind,
        file_url: Option<String>,
    ) -> Result<MessageId> {
        if content.trim().is_empty() && file_url.is_none() {
            return Err(ApiError::Validation("Message content is empty".into()));
        }

        let (chat_id, receiver_id) = {
            let state = self.lock_state();
            let chat_id = state
                .timeline
                .active_chat()
                .cloned()
                .ok_or_else(|| ApiError::Validation("No chat selected".into()))?;
            let receiver_id = state
                .directory
                .receiver_for_direct(&chat_id, &self.inner.viewer.id);
            (chat_id, receiver_id)
        };

        let local_id = MessageId::temp();
        let local = Message {
            id: local_id.clone(),
            chat_id: chat_id.clone(),
            sender_id: self.inner.viewer.id.clone(),
            receiver_id: receiver_id.clone(),
            content: content.to_string(),
            kind,
            timestamp: Utc::now(),
            status: MessageStatus::Sent,
            reactions: Vec::new(),
            pinned: false,
            edited_at: None,
            file_url: file_url.clone(),
            file_name: None,
            file_size: None,
        };
        {
            let mut state = self.lock_state();
            state.timeline.insert_local(local);
        }
        self.emit(EngineEvent::TimelineUpdated {
            chat_id: chat_id.clone(),
        });

        let request = MessageRequest {
            chat_id: chat_id.clone(),
            content: content.to_string(),
            kind,
            file_url,
            receiver_id,
        };
        let engine = self.clone();
        let task_local_id = local_id.clone();
        tokio::spawn(async move {
            match engine.inner.api.create_message(&request).await {
                Ok(confirmed) => {
                    debug!(local_id = %task_local_id, id = %confirmed.id, "Send confirmed");
                    {
                        let mut state = engine.lock_state();
                        state.timeline.confirm_local(&task_local_id, confirmed.clone());
                    }
                    engine.emit(EngineEvent::SendConfirmed {
                        local_id: task_local_id,
                        message: confirmed,
                    });
                    engine.emit(EngineEvent::TimelineUpdated { chat_id });
                }
                Err(e) => {
                    warn!(local_id = %task_local_id, error = %e, "Send failed");
                    {
                        let mut state = engine.lock_state();
                        state.timeline.mark_send_failed(&task_local_id);
                    }
                    engine.emit(EngineEvent::SendFailed {
                        local_id: task_local_id,
                    });
                    engine.emit(EngineEvent::TimelineUpdated { chat_id });
                }
            }
        });

        Ok(local_id)
    }

    pub async fn edit_message(&self, message_id: &MessageId, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(ApiError::Validation("Edited content is empty".into()));
        }
        let updated = self.inner.api.edit_message(message_id, content).await?;
        self.apply_server_entity(updated);
        Ok(())
    }

    pub async fn react_to_message(&self, message_id: &MessageId, emoji: &str) -> Result<()> {
        let updated = self.inner.api.react_to_message(message_id, emoji).await?;
        self.apply_server_entity(updated);
        Ok(())
    }

    pub async fn pin_message(&self, message_id: &MessageId, pinned: bool) -> Result<()> {
        let updated = self.inner.api.pin_message(message_id, pinned).await?;
        self.apply_server_entity(updated);
        Ok(())
    }

    pub async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        self.inner.api.delete_message(message_id).await?;
        let chat_id = {
            let mut state = self.lock_state();
            state.timeline.remove(message_id);
            state.timeline.active_chat().cloned()
        };
        if let Some(chat_id) = chat_id {
            self.emit(EngineEvent::TimelineUpdated { chat_id });
        }
        Ok(())
    }

    /// The server entity from a mutation response is authoritative; it is
    /// applied directly instead of re-fetching the page it lives on.
    fn apply_server_entity(&self, updated: Message) {
        let chat_id = updated.chat_id.clone();
        let applied = {
            let mut state = self.lock_state();
            state.timeline.apply_update(updated)
        };
        if applied {
            self.emit(EngineEvent::TimelineUpdated { chat_id });
        }
    }

    // -- Push-only signals --

    /// Typing is inherently lossy: while the push channel is down the
    /// signal is dropped silently, never queued and never sent over HTTP.
    pub async fn send_typing(&self, chat_id: &ChatId, is_typing: bool) {
        if !self.is_connected() {
            debug!(chat = %chat_id, "Push channel down, typing signal dropped");
            return;
        }
        let tx = lock(&self.inner.push_tx).clone();
        if let Some(tx) = tx {
            let _ = tx
                .send(PushCommand::Publish(ClientFrame::Typing {
                    chat_id: chat_id.clone(),
                    is_typing,
                }))
                .await;
        }
    }

    /// Read receipt: over the push channel while connected, over HTTP
    /// otherwise.  Resets the chat's unread count either way.
    pub async fn mark_read(&self, chat_id: &ChatId, message_id: &MessageId) -> Result<()> {
        if self.is_connected() {
            let tx = lock(&self.inner.push_tx).clone();
            if let Some(tx) = tx {
                let _ = tx
                    .send(PushCommand::Publish(ClientFrame::MarkRead {
                        message_id: message_id.clone(),
                    }))
                    .await;
            }
        } else {
            self.inner.api.mark_read(message_id).await?;
        }
        {
            let mut state = self.lock_state();
            state.directory.reset_unread(chat_id);
        }
        self.emit(EngineEvent::DirectoryUpdated);
        Ok(())
    }

    // -- Directory operations --

    pub async fn refresh_chat_rooms(&self) -> Result<()> {
        let rooms = self.inner.api.list_chats().await?;
        {
            let mut state = self.lock_state();
            state.directory.replace_all(rooms);
        }
        self.emit(EngineEvent::DirectoryUpdated);
        Ok(())
    }

    /// Open (or create) the direct chat with `user_id` and select it.
    pub async fn start_direct_chat(&self, user_id: &UserId) -> Result<ChatRoom> {
        let room = self.inner.api.start_direct_chat(user_id).await?;
        {
            let mut state = self.lock_state();
            state.directory.upsert(room.clone());
        }
        self.emit(EngineEvent::DirectoryUpdated);
        self.select_chat(room.id.clone()).await?;
        Ok(room)
    }

    pub async fn create_group(&self, request: &GroupRequest) -> Result<()> {
        self.inner.api.create_group(request).await?;
        self.refresh_chat_rooms().await
    }

    // -- Search --

    pub async fn search_messages(
        &self,
        query: &str,
        chat_id: Option<&ChatId>,
    ) -> Result<MessageSearchResult> {
        self.inner.api.search_messages(query, chat_id).await
    }

    /// User search never returns the viewer themself.
    pub async fn search_users(&self, query: &str) -> Result<Vec<User>> {
        let users = self.inner.api.search_users(query).await?;
        Ok(users
            .into_iter()
            .filter(|u| u.id != self.inner.viewer.id)
            .collect())
    }

    // -- Accessors --

    pub fn messages(&self) -> Vec<Message> {
        let state = self.lock_state();
        state.timeline.messages().into_iter().cloned().collect()
    }

    pub fn current_chat(&self) -> Option<ChatId> {
        self.lock_state().timeline.active_chat().cloned()
    }

    pub fn chat_rooms(&self) -> Vec<ChatRoom> {
        self.lock_state().directory.rooms().to_vec()
    }

    pub fn chat_room(&self, chat_id: &ChatId) -> Option<ChatRoom> {
        self.lock_state().directory.get(chat_id).cloned()
    }

    /// Users currently typing in `chat_id`, expired entries excluded.
    pub fn typing_users(&self, chat_id: &ChatId) -> Vec<TypingIndicator> {
        self.lock_state().typing.typing_in(chat_id, Instant::now())
    }

    pub fn has_more_history(&self) -> bool {
        self.lock_state().timeline.has_more()
    }

    pub fn send_state(&self, id: &MessageId) -> Option<SendState> {
        self.lock_state().timeline.send_state(id)
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_state().initialized
    }

    pub fn stick_to_bottom(&self) -> bool {
        self.lock_state().stick_to_bottom
    }

    pub fn set_stick_to_bottom(&self, stick: bool) {
        self.lock_state().stick_to_bottom = stick;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.conn_state)
            .as_ref()
            .map(|rx| *rx.borrow() == ConnectionState::Connected)
            .unwrap_or(false)
    }

    pub fn viewer(&self) -> &User {
        &self.inner.viewer
    }

    // -- Internals --

    fn handle_push_event(&self, event: PushEvent) {
        match event {
            PushEvent::Connected => {
                self.emit(EngineEvent::ConnectionChanged { connected: true });
            }
            PushEvent::Disconnected => {
                // Typing state is only valid while the channel is live.
                {
                    let mut state = self.lock_state();
                    state.typing.clear();
                }
                self.emit(EngineEvent::TypingChanged);
                self.emit(EngineEvent::ConnectionChanged { connected: false });
            }
            PushEvent::AuthRejected => {
                self.emit(EngineEvent::AuthFailed);
            }
            PushEvent::Message(message) => {
                let inserted = {
                    let mut state = self.lock_state();
                    let inserted = state.timeline.append_incoming(message.clone());
                    state
                        .directory
                        .note_incoming(&message, &self.inner.viewer.id);
                    inserted
                };
                self.emit(EngineEvent::DirectoryUpdated);
                if inserted {
                    self.emit(EngineEvent::TimelineUpdated {
                        chat_id: message.chat_id.clone(),
                    });
                    self.emit(EngineEvent::MessageReceived { message });
                }
            }
            PushEvent::Typing(indicator) => {
                {
                    let mut state = self.lock_state();
                    state.typing.apply(indicator, Instant::now());
                }
                self.emit(EngineEvent::TypingChanged);
            }
        }
    }

    /// Fallback poll for the active chat: a small newest-page fetch on a
    /// fixed interval, deduped by the store.  Replaced on every chat
    /// switch, stopped on shutdown.
    fn spawn_poll(&self, chat_id: ChatId) {
        let engine = self.clone();
        let interval_len = self.inner.config.poll_interval;
        let window = self.inner.config.poll_window;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval_len);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; history was just loaded.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.inner.api.fetch_messages(&chat_id, 0, window).await {
                    Ok(page) => {
                        let inserted = {
                            let mut state = engine.lock_state();
                            let mut inserted = 0;
                            for message in page.messages {
                                if state.timeline.append_incoming(message) {
                                    inserted += 1;
                                }
                            }
                            inserted
                        };
                        if inserted > 0 {
                            debug!(chat = %chat_id, inserted, "Poll pass picked up messages");
                            engine.emit(EngineEvent::TimelineUpdated {
                                chat_id: chat_id.clone(),
                            });
                        }
                    }
                    Err(e) => debug!(chat = %chat_id, error = %e, "Poll pass failed"),
                }
            }
        });
        if let Some(old) = lock(&self.inner.poll_task).replace(handle) {
            old.abort();
        }
    }

    fn stop_poll(&self) {
        if let Some(handle) = lock(&self.inner.poll_task).take() {
            handle.abort();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        lock(&self.inner.state)
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

/// Lock recovering from poisoning; state stays usable after a panicked
/// holder since every mutation leaves it consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
