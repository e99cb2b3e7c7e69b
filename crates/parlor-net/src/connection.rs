//! Push-channel connection lifecycle with tokio mpsc command/event pattern.
//!
//! The connection loop runs in a dedicated tokio task.  External code talks
//! to it through a command channel, receives inbound frames through an event
//! channel, and observes connectivity through a `watch` channel.  Because
//! the channel endpoints outlive individual connections, a reconnect can
//! never bind a stale handler: whoever holds the receiver keeps getting
//! events from every successive connection.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use parlor_shared::constants::{PUSH_CHANNEL_CAPACITY, RECONNECT_DELAY_SECS};
use parlor_shared::protocol::{ClientFrame, PushQueue, ServerFrame};
use parlor_shared::types::{Message, TypingIndicator};

// ---------------------------------------------------------------------------
// Command / event types
// ---------------------------------------------------------------------------

/// Commands sent *into* the connection task.
#[derive(Debug)]
pub enum PushCommand {
    /// Publish a frame.  Dropped (with a log line) while not connected;
    /// callers needing guaranteed delivery use the request-reply channel.
    Publish(ClientFrame),
    /// Close the connection and stop reconnecting.
    Shutdown,
}

/// Events sent *from* the connection task to the application.
#[derive(Debug, Clone)]
pub enum PushEvent {
    /// The connection is up and both personal queues are subscribed.
    Connected,
    /// The connection dropped; a reconnect attempt follows after the
    /// configured delay.
    Disconnected,
    /// The credential was missing or rejected.  Terminal: no retry.
    AuthRejected,
    /// A message arrived on the personal message queue.
    Message(Message),
    /// A typing signal arrived on the personal typing queue.
    Typing(TypingIndicator),
}

/// Connectivity as observed by the rest of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Distinct from `Connecting`: the credential was absent or rejected
    /// and no further attempts will be made this session.
    AuthFailed,
}

/// Configuration for the push channel.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// WebSocket URL of the chat push endpoint.
    pub url: String,
    /// Bearer credential presented at connect time (and again on every
    /// reconnect).  `None` means the channel stays down.
    pub token: Option<String>,
    /// Minimum delay between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws/chat".to_string(),
            token: None,
            reconnect_delay: Duration::from_secs(RECONNECT_DELAY_SECS),
        }
    }
}

#[derive(Error, Debug)]
pub enum PushError {
    #[error("Invalid push channel request: {0}")]
    Request(#[from] WsError),

    #[error("Credential is not a valid header value")]
    Credential,
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Spawn the push-channel task.
///
/// Returns `(command_tx, event_rx, state_rx)`.  The task reconnects with a
/// fixed delay after transport drops, re-presenting the credential and
/// re-subscribing once per fresh connection.  Auth rejection ends the task.
pub fn spawn_push(
    config: PushConfig,
) -> (
    mpsc::Sender<PushCommand>,
    mpsc::Receiver<PushEvent>,
    watch::Receiver<ConnectionState>,
) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<PushCommand>(PUSH_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel::<PushEvent>(PUSH_CHANNEL_CAPACITY);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

    tokio::spawn(async move {
        let Some(token) = config.token.clone() else {
            warn!("No push credential available, channel stays down");
            let _ = state_tx.send(ConnectionState::AuthFailed);
            let _ = event_tx.send(PushEvent::AuthRejected).await;
            return;
        };

        'reconnect: loop {
            let _ = state_tx.send(ConnectionState::Connecting);

            let request = match build_request(&config.url, &token) {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "Cannot build push channel request");
                    let _ = state_tx.send(ConnectionState::Disconnected);
                    break 'reconnect;
                }
            };

            let mut stream = match connect_async(request).await {
                Ok((stream, _response)) => stream,
                Err(WsError::Http(response))
                    if response.status() == StatusCode::UNAUTHORIZED
                        || response.status() == StatusCode::FORBIDDEN =>
                {
                    warn!(status = %response.status(), "Push credential rejected");
                    let _ = state_tx.send(ConnectionState::AuthFailed);
                    let _ = event_tx.send(PushEvent::AuthRejected).await;
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "Push connect failed");
                    let _ = state_tx.send(ConnectionState::Disconnected);
                    if !wait_before_reconnect(&mut cmd_rx, config.reconnect_delay).await {
                        break 'reconnect;
                    }
                    continue 'reconnect;
                }
            };

            // Subscribe the personal queues, exactly once per connection
            // instance.
            let mut subscribed = true;
            for queue in [PushQueue::Messages, PushQueue::Typing] {
                let frame = ClientFrame::Subscribe { queue };
                let text = match frame.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        error!(error = %e, "Subscribe frame serialization failed");
                        subscribed = false;
                        break;
                    }
                };
                if let Err(e) = stream.send(WsMessage::Text(text)).await {
                    warn!(error = %e, "Subscribe failed, reconnecting");
                    subscribed = false;
                    break;
                }
            }
            if !subscribed {
                let _ = state_tx.send(ConnectionState::Disconnected);
                if !wait_before_reconnect(&mut cmd_rx, config.reconnect_delay).await {
                    break 'reconnect;
                }
                continue 'reconnect;
            }

            info!(url = %config.url, "Push channel connected");
            let _ = state_tx.send(ConnectionState::Connected);
            let _ = event_tx.send(PushEvent::Connected).await;

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(PushCommand::Publish(frame)) => {
                            match frame.to_json() {
                                Ok(text) => {
                                    if let Err(e) = stream.send(WsMessage::Text(text)).await {
                                        warn!(error = %e, "Publish failed, reconnecting");
                                        break;
                                    }
                                }
                                Err(e) => error!(error = %e, "Frame serialization failed"),
                            }
                        }
                        Some(PushCommand::Shutdown) | None => {
                            info!("Push channel shutdown requested");
                            let _ = stream.close(None).await;
                            let _ = state_tx.send(ConnectionState::Disconnected);
                            let _ = event_tx.send(PushEvent::Disconnected).await;
                            break 'reconnect;
                        }
                    },

                    incoming = stream.next() => match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            match ServerFrame::from_json(&text) {
                                Ok(ServerFrame::Message(message)) => {
                                    debug!(id = %message.id, chat = %message.chat_id, "Push message received");
                                    let _ = event_tx.send(PushEvent::Message(message)).await;
                                }
                                Ok(ServerFrame::Typing(typing)) => {
                                    let _ = event_tx.send(PushEvent::Typing(typing)).await;
                                }
                                Err(e) => {
                                    debug!(error = %e, "Ignoring malformed push frame");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            let _ = stream.send(WsMessage::Pong(payload)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            info!("Push channel closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Push channel transport error");
                            break;
                        }
                    },
                }
            }

            let _ = state_tx.send(ConnectionState::Disconnected);
            let _ = event_tx.send(PushEvent::Disconnected).await;

            if !wait_before_reconnect(&mut cmd_rx, config.reconnect_delay).await {
                break 'reconnect;
            }
        }

        info!("Push channel task terminated");
    });

    (cmd_tx, event_rx, state_rx)
}

/// Sleep out the reconnect delay while still reacting to commands.
/// Publishes while disconnected are dropped with a log line rather than
/// queued.  Returns false when the task should stop.
async fn wait_before_reconnect(
    cmd_rx: &mut mpsc::Receiver<PushCommand>,
    delay: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            cmd = cmd_rx.recv() => match cmd {
                Some(PushCommand::Publish(_)) => {
                    debug!("Dropping publish while disconnected");
                }
                Some(PushCommand::Shutdown) | None => return false,
            },
        }
    }
}

fn build_request(url: &str, token: &str) -> Result<Request, PushError> {
    let mut request = url.into_client_request()?;
    let value = format!("Bearer {token}")
        .parse()
        .map_err(|_| PushError::Credential)?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parlor_shared::types::{
        ChatId, Message, MessageId, MessageKind, MessageStatus, UserId,
    };
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as ServerRequest, Response as ServerResponse,
    };
    use tokio_tungstenite::WebSocketStream;

    const TOKEN: &str = "secret-token";

    fn test_config(addr: std::net::SocketAddr, token: Option<&str>) -> PushConfig {
        PushConfig {
            url: format!("ws://{addr}/ws/chat"),
            token: token.map(str::to_string),
            reconnect_delay: Duration::from_millis(50),
        }
    }

    fn sample_message(id: &str) -> Message {
        Message {
            id: MessageId::new(id),
            chat_id: ChatId::new("c1"),
            sender_id: UserId::new("u1"),
            receiver_id: None,
            content: "hello".into(),
            kind: MessageKind::Text,
            timestamp: Utc.timestamp_opt(100, 0).unwrap(),
            status: MessageStatus::Sent,
            reactions: Vec::new(),
            pinned: false,
            edited_at: None,
            file_url: None,
            file_name: None,
            file_size: None,
        }
    }

    /// Accept one client, enforcing the bearer credential.
    async fn accept_client(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.expect("accept");
        tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &ServerRequest, resp: ServerResponse| {
                let ok = req
                    .headers()
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v == format!("Bearer {TOKEN}"))
                    .unwrap_or(false);
                if ok {
                    Ok(resp)
                } else {
                    let mut err = ErrorResponse::new(Some("unauthorized".into()));
                    *err.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(err)
                }
            },
        )
        .await
        .expect("handshake")
    }

    async fn next_event(rx: &mut mpsc::Receiver<PushEvent>) -> PushEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for push event")
            .expect("event channel closed")
    }

    async fn read_client_frame(server: &mut WebSocketStream<TcpStream>) -> ClientFrame {
        loop {
            match timeout(Duration::from_secs(5), server.next())
                .await
                .expect("timed out waiting for client frame")
                .expect("client closed")
                .expect("transport")
            {
                WsMessage::Text(text) => return ClientFrame::from_json(&text).expect("frame"),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_connects_subscribes_and_receives_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (_cmd_tx, mut event_rx, state_rx) = spawn_push(test_config(addr, Some(TOKEN)));
        let mut server = accept_client(&listener).await;

        // Exactly one subscription per queue, per connection instance.
        assert!(matches!(
            read_client_frame(&mut server).await,
            ClientFrame::Subscribe { queue: PushQueue::Messages }
        ));
        assert!(matches!(
            read_client_frame(&mut server).await,
            ClientFrame::Subscribe { queue: PushQueue::Typing }
        ));

        assert!(matches!(next_event(&mut event_rx).await, PushEvent::Connected));
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);

        let frame = ServerFrame::Message(sample_message("m1")).to_json().unwrap();
        server.send(WsMessage::Text(frame)).await.unwrap();

        match next_event(&mut event_rx).await {
            PushEvent::Message(m) => assert_eq!(m.id, MessageId::new("m1")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (cmd_tx, mut event_rx, _state_rx) = spawn_push(test_config(addr, Some(TOKEN)));
        let mut server = accept_client(&listener).await;

        read_client_frame(&mut server).await;
        read_client_frame(&mut server).await;
        assert!(matches!(next_event(&mut event_rx).await, PushEvent::Connected));

        cmd_tx
            .send(PushCommand::Publish(ClientFrame::Typing {
                chat_id: ChatId::new("c1"),
                is_typing: true,
            }))
            .await
            .unwrap();

        match read_client_frame(&mut server).await {
            ClientFrame::Typing { chat_id, is_typing } => {
                assert_eq!(chat_id, ChatId::new("c1"));
                assert!(is_typing);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // Shutdown closes the connection and ends the task.
        cmd_tx.send(PushCommand::Shutdown).await.unwrap();
        assert!(matches!(
            next_event(&mut event_rx).await,
            PushEvent::Disconnected
        ));
        assert!(timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .expect("task should end")
            .is_none());
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (_cmd_tx, mut event_rx, state_rx) = spawn_push(test_config(addr, Some(TOKEN)));

        let server = accept_client(&listener).await;
        assert!(matches!(next_event(&mut event_rx).await, PushEvent::Connected));
        drop(server);

        assert!(matches!(
            next_event(&mut event_rx).await,
            PushEvent::Disconnected
        ));

        // A fresh connection re-presents the credential and re-subscribes.
        let mut server = accept_client(&listener).await;
        assert!(matches!(
            read_client_frame(&mut server).await,
            ClientFrame::Subscribe { queue: PushQueue::Messages }
        ));
        assert!(matches!(next_event(&mut event_rx).await, PushEvent::Connected));
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_rejected_credential_is_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (_cmd_tx, mut event_rx, state_rx) = spawn_push(test_config(addr, Some("wrong")));

        // The handshake fails server-side with 401.
        let (stream, _) = listener.accept().await.unwrap();
        let _ = tokio_tungstenite::accept_hdr_async(
            stream,
            |_req: &ServerRequest, _resp: ServerResponse| {
                let mut err = ErrorResponse::new(Some("unauthorized".into()));
                *err.status_mut() = StatusCode::UNAUTHORIZED;
                Err::<ServerResponse, _>(err)
            },
        )
        .await;

        assert!(matches!(
            next_event(&mut event_rx).await,
            PushEvent::AuthRejected
        ));
        assert_eq!(*state_rx.borrow(), ConnectionState::AuthFailed);

        // Terminal: the task ends instead of retrying.
        assert!(timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .expect("task should end")
            .is_none());
    }

    #[tokio::test]
    async fn test_missing_credential_never_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (_cmd_tx, mut event_rx, state_rx) = spawn_push(test_config(addr, None));

        assert!(matches!(
            next_event(&mut event_rx).await,
            PushEvent::AuthRejected
        ));
        assert_eq!(*state_rx.borrow(), ConnectionState::AuthFailed);
    }
}
