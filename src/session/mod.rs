//! Connection sessions.
//!
//! One [`Session`] per WebSocket connection, moving through
//! `Connecting -> Active -> Draining -> Closed`:
//!
//! - `Connecting`: the first frame must be `login`; the [`Authenticator`]
//!   is asked once and a failure rejects the connection.
//! - `Active`: the inbound half decodes frames and appends them to the
//!   store; the outbound half drains the hub subscription. Both run inside
//!   the session task, so ending either one cancels the other.
//! - `Draining`: unsubscribe, flush pending replies, send a close frame.
//!
//! A session never delivers its own messages directly; they come back (or
//! not, see `echo_to_sender`) through the store tail and the hub like
//! everyone else's.

mod state;

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::config::Settings;
use crate::fanout::StoreHealth;
use crate::hub::{BroadcastHub, CloseReason, Subscription};
use crate::message::{NewMessage, SessionId};
use crate::store::MessageStore;
use crate::transport::codec::{self, Inbound};
use crate::transport::message::ServerMessage;
use crate::utils::error::SessionError;

pub use state::SessionState;

/// Replies queued from the inbound half to the outbound half.
const REPLY_QUEUE: usize = 16;

/// Everything a session needs from the rest of the server.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn MessageStore>,
    pub hub: BroadcastHub,
    pub auth: Arc<dyn Authenticator>,
    pub health: StoreHealth,
    pub settings: Arc<Settings>,
    pub shutdown: CancellationToken,
}

type WsSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;
type WsSource<S> = SplitStream<WebSocketStream<S>>;

pub struct Session {
    id: SessionId,
    state: SessionState,
    ctx: SessionContext,
}

impl Session {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            id: format!("session-{}", Uuid::new_v4()),
            state: SessionState::Connecting,
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        if self.state.can_become(next) {
            debug!(session = %self.id, from = %self.state, to = %next, "session state");
            self.state = next;
        } else {
            warn!(session = %self.id, from = %self.state, to = %next, "ignored invalid transition");
        }
    }

    /// Drive the connection to completion. `Ok` means a clean close by the
    /// client or the server; `Err` says why the session ended early.
    pub async fn run<S>(mut self, ws: WebSocketStream<S>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut sink, mut source) = ws.split();

        let handshake = tokio::select! {
            result = self.handshake(&mut source) => result,
            _ = self.ctx.shutdown.cancelled() => Err(SessionError::ShuttingDown),
        };
        let username = match handshake {
            Ok(username) => username,
            Err(e) => {
                warn!(session = %self.id, error = %e, "connection rejected");
                reject(&mut sink, &e).await;
                self.transition(SessionState::Closed);
                return Err(e);
            }
        };

        // Registered before the client hears back, so anything appended after
        // `authenticated` arrives is delivered.
        let subscription = self.ctx.hub.subscribe_as(self.id.clone());
        self.transition(SessionState::Active);
        info!(session = %self.id, user = %username, "session active");

        let (reply_tx, mut reply_rx) = mpsc::channel(REPLY_QUEUE);
        let greeting = ServerMessage::Authenticated { username };
        let outcome = match self.greet(&mut sink, &greeting).await {
            Err(e) => Err(e),
            Ok(()) => {
                tokio::select! {
                    result = self.inbound(&mut source, &reply_tx) => result,
                    result = self.outbound(&mut sink, &subscription, &mut reply_rx) => result,
                    _ = self.ctx.shutdown.cancelled() => Ok(()),
                }
            }
        };

        self.transition(SessionState::Draining);
        subscription.unsubscribe();
        drop(reply_tx);

        if !matches!(outcome, Err(SessionError::Transport(_))) {
            while let Ok(reply) = reply_rx.try_recv() {
                if send(&mut sink, &reply).await.is_err() {
                    break;
                }
            }
            let (code, reason) = drain_close(&outcome);
            let _ = sink.send(close_frame(code, reason)).await;
        }
        let _ = sink.close().await;

        self.transition(SessionState::Closed);
        match &outcome {
            Ok(()) => info!(session = %self.id, "session closed"),
            Err(e) => info!(session = %self.id, reason = %e, "session closed"),
        }
        outcome
    }

    async fn handshake<S>(&self, source: &mut WsSource<S>) -> Result<String, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let timeout = Duration::from_secs(self.ctx.settings.server.handshake_timeout_secs);
        let (username, password) = tokio::time::timeout(timeout, self.read_login(source))
            .await
            .map_err(|_| SessionError::HandshakeTimeout)??;

        let result = self.ctx.auth.authenticate(&username, &password).await;
        if !result.ok {
            let reason = result.reason.unwrap_or_else(|| "denied".to_string());
            return Err(SessionError::Unauthorized(reason));
        }
        Ok(username)
    }

    async fn read_login<S>(&self, source: &mut WsSource<S>) -> Result<(String, String), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        while let Some(frame) = source.next().await {
            let payload = match frame? {
                frame @ (WsMessage::Text(_) | WsMessage::Binary(_)) => frame.into_data(),
                WsMessage::Close(_) => break,
                _ => continue,
            };
            return match codec::decode(&payload, &self.id)? {
                Inbound::Login { username, password } => Ok((username, password)),
                _ => Err(SessionError::Unauthorized(
                    "must authenticate first".to_string(),
                )),
            };
        }
        Err(SessionError::ClosedDuringHandshake)
    }

    /// Confirm the login, then replay recent history if configured.
    async fn greet<S>(
        &self,
        sink: &mut WsSink<S>,
        greeting: &ServerMessage,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        send(sink, greeting).await?;

        let count = self.ctx.settings.store.replay_on_connect;
        if count == 0 {
            return Ok(());
        }
        match self.ctx.store.history(count).await {
            Ok(messages) => send(sink, &ServerMessage::history(&messages)).await,
            Err(e) => {
                warn!(session = %self.id, error = %e, "history replay failed");
                Ok(())
            }
        }
    }

    /// Inbound suspension point: read, decode, append.
    async fn inbound<S>(
        &self,
        source: &mut WsSource<S>,
        replies: &mpsc::Sender<ServerMessage>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        while let Some(frame) = source.next().await {
            let payload = match frame? {
                frame @ (WsMessage::Text(_) | WsMessage::Binary(_)) => frame.into_data(),
                WsMessage::Close(_) => break,
                _ => continue,
            };

            match codec::decode(&payload, &self.id) {
                Ok(Inbound::Chat(msg)) => self.append(msg, replies).await?,
                Ok(Inbound::History { limit }) => self.history(limit, replies).await?,
                Ok(Inbound::Login { .. }) => {
                    let _ = replies.send(ServerMessage::error("already authenticated")).await;
                }
                Err(e) => {
                    warn!(session = %self.id, error = %e, "dropping malformed frame");
                    let _ = replies.send(ServerMessage::error(e.to_string())).await;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn append(
        &self,
        msg: NewMessage,
        replies: &mpsc::Sender<ServerMessage>,
    ) -> Result<(), SessionError> {
        match self.ctx.store.append(msg).await {
            Ok(stored) => {
                self.ctx.health.record_success();
                debug!(session = %self.id, id = %stored.id, "message accepted");
                Ok(())
            }
            Err(e) => {
                self.ctx.health.record_failure();
                warn!(session = %self.id, error = %e, "append failed");
                let _ = replies
                    .send(ServerMessage::error(format!("message not stored: {e}")))
                    .await;
                if e.is_unavailable() { Err(e.into()) } else { Ok(()) }
            }
        }
    }

    async fn history(
        &self,
        limit: Option<usize>,
        replies: &mpsc::Sender<ServerMessage>,
    ) -> Result<(), SessionError> {
        let max = self.ctx.settings.store.max_history;
        let limit = limit.unwrap_or(max).min(max);
        match self.ctx.store.history(limit).await {
            Ok(messages) => {
                let _ = replies.send(ServerMessage::history(&messages)).await;
                Ok(())
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "history read failed");
                let _ = replies
                    .send(ServerMessage::error(format!("history unavailable: {e}")))
                    .await;
                if e.is_unavailable() { Err(e.into()) } else { Ok(()) }
            }
        }
    }

    /// Outbound suspension point: replies first, then hub deliveries.
    async fn outbound<S>(
        &self,
        sink: &mut WsSink<S>,
        subscription: &Subscription,
        replies: &mut mpsc::Receiver<ServerMessage>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            tokio::select! {
                biased;
                Some(reply) = replies.recv() => send(sink, &reply).await?,
                delivered = subscription.recv() => {
                    let Some(msg) = delivered else {
                        return match subscription.close_reason() {
                            Some(CloseReason::Overflow) => {
                                warn!(session = %self.id, "dropped by hub for falling behind");
                                Err(SessionError::SubscriptionClosed)
                            }
                            _ => Ok(()),
                        };
                    };

                    let missed = subscription.take_missed();
                    if missed > 0 {
                        send(sink, &ServerMessage::Lagged { missed }).await?;
                    }
                    sink.send(codec::encode_message(&msg)?).await?;
                }
            }
        }
    }
}

async fn send<S>(sink: &mut WsSink<S>, msg: &ServerMessage) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    sink.send(codec::encode(msg)?).await?;
    Ok(())
}

/// Close code and reason sent when an active session drains.
fn drain_close(outcome: &Result<(), SessionError>) -> (CloseCode, &'static str) {
    match outcome {
        Ok(()) => (CloseCode::Normal, "bye"),
        Err(SessionError::Decode(_)) => (CloseCode::Invalid, "malformed frame"),
        Err(SessionError::SubscriptionClosed) => (CloseCode::Policy, "too slow"),
        Err(SessionError::ShuttingDown) => (CloseCode::Away, "server shutting down"),
        Err(_) => (CloseCode::Error, "server error"),
    }
}

async fn reject<S>(sink: &mut WsSink<S>, err: &SessionError)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (message, reason) = match err {
        SessionError::Transport(_) | SessionError::ClosedDuringHandshake => {
            let _ = sink.close().await;
            return;
        }
        SessionError::ShuttingDown => {
            let _ = sink
                .send(close_frame(CloseCode::Away, "server shutting down"))
                .await;
            let _ = sink.close().await;
            return;
        }
        SessionError::HandshakeTimeout => ("unauthorized: login timed out".to_string(), "unauthorized"),
        SessionError::Unauthorized(reason) => (format!("unauthorized: {reason}"), "unauthorized"),
        other => (format!("unauthorized: {other}"), "unauthorized"),
    };
    let _ = send(sink, &ServerMessage::error(message)).await;
    let _ = sink.send(close_frame(CloseCode::Policy, reason)).await;
    let _ = sink.close().await;
}

fn close_frame(code: CloseCode, reason: &str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

#[cfg(test)]
mod tests;
