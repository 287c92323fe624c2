use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{Message as WsMessage, Role};

use super::{Session, SessionContext, SessionState};
use crate::auth::StaticAuthenticator;
use crate::config::{HubSettings, OverflowPolicy, Settings};
use crate::fanout::{StoreHealth, StoreStatus};
use crate::hub::BroadcastHub;
use crate::message::{Message, NewMessage};
use crate::store::{MessageStore, SledStore, Tail};
use crate::transport::codec;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::{PersistenceError, SessionError};

type Client = WebSocketStream<DuplexStream>;

/// Store double whose appends always fail with the given error kind.
struct FailingStore {
    unavailable: bool,
}

#[async_trait]
impl MessageStore for FailingStore {
    async fn append(&self, _msg: NewMessage) -> Result<Message, PersistenceError> {
        if self.unavailable {
            Err(PersistenceError::Unavailable("disk gone".into()))
        } else {
            Err(PersistenceError::Write("conflict".into()))
        }
    }

    async fn tail(&self) -> Result<Tail, PersistenceError> {
        Err(PersistenceError::TailBroken)
    }

    async fn history(&self, _limit: usize) -> Result<Vec<Message>, PersistenceError> {
        Ok(Vec::new())
    }
}

fn context(settings: Settings, store: Arc<dyn MessageStore>) -> SessionContext {
    SessionContext {
        store,
        hub: BroadcastHub::new(settings.hub.clone()),
        auth: Arc::new(StaticAuthenticator::from_settings(&settings.auth)),
        health: StoreHealth::new(settings.fanout.failure_threshold),
        settings: Arc::new(settings),
        shutdown: CancellationToken::new(),
    }
}

async fn start(ctx: &SessionContext) -> (Client, JoinHandle<Result<(), SessionError>>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let session = Session::new(ctx.clone());
    assert_eq!(session.state(), SessionState::Connecting);

    let task = tokio::spawn(async move {
        let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        session.run(ws).await
    });
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    (client, task)
}

async fn send(client: &mut Client, msg: &ClientMessage) {
    client
        .send(codec::encode_client(msg).unwrap())
        .await
        .expect("client send");
}

async fn send_raw(client: &mut Client, text: &str) {
    client
        .send(WsMessage::text(text.to_string()))
        .await
        .expect("client send");
}

/// Next data frame from the server; `None` on close.
async fn next(client: &mut Client) -> Option<ServerMessage> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("server went quiet")?;
        match frame.ok()? {
            frame @ (WsMessage::Text(_) | WsMessage::Binary(_)) => {
                return Some(codec::decode_server(&frame.into_data()).unwrap());
            }
            WsMessage::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn close_code(client: &mut Client) -> Option<CloseCode> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("server went quiet")?;
        match frame.ok()? {
            WsMessage::Close(frame) => return frame.map(|f| f.code),
            _ => continue,
        }
    }
}

async fn login(client: &mut Client) {
    send(
        client,
        &ClientMessage::Login {
            username: "admin".into(),
            password: "password".into(),
        },
    )
    .await;
    assert_eq!(
        next(client).await,
        Some(ServerMessage::Authenticated {
            username: "admin".into()
        })
    );
}

fn chat(sender: &str, body: &str) -> ClientMessage {
    ClientMessage::Chat {
        sender: sender.into(),
        body: body.into(),
    }
}

fn sled() -> Arc<SledStore> {
    Arc::new(SledStore::temporary(None).unwrap())
}

#[test]
fn state_transitions_follow_lifecycle() {
    use SessionState::*;
    assert!(Connecting.can_become(Active));
    assert!(Connecting.can_become(Closed));
    assert!(Active.can_become(Draining));
    assert!(Draining.can_become(Closed));
    assert!(!Active.can_become(Closed));
    assert!(!Closed.can_become(Active));
    assert!(!Draining.can_become(Active));
    assert_eq!(Draining.to_string(), "draining");
}

#[tokio::test]
async fn login_subscribes_and_client_close_unsubscribes() {
    let ctx = context(Settings::default(), sled());
    let (mut client, task) = start(&ctx).await;

    login(&mut client).await;
    assert_eq!(ctx.hub.subscriber_count(), 1);

    client.close(None).await.unwrap();
    let result = task.await.unwrap();
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(ctx.hub.subscriber_count(), 0);
}

#[tokio::test]
async fn invalid_credentials_are_rejected() {
    let ctx = context(Settings::default(), sled());
    let (mut client, task) = start(&ctx).await;

    send(
        &mut client,
        &ClientMessage::Login {
            username: "admin".into(),
            password: "wrong".into(),
        },
    )
    .await;

    match next(&mut client).await {
        Some(ServerMessage::Error { message }) => {
            assert_eq!(message, "unauthorized: invalid credentials")
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(close_code(&mut client).await, Some(CloseCode::Policy));
    assert!(matches!(
        task.await.unwrap(),
        Err(SessionError::Unauthorized(_))
    ));
    assert_eq!(ctx.hub.subscriber_count(), 0);
}

#[tokio::test]
async fn message_before_login_is_rejected_without_append() {
    let store = sled();
    let ctx = context(Settings::default(), store.clone());
    let (mut client, task) = start(&ctx).await;

    send(&mut client, &chat("alice", "sneaky")).await;

    match next(&mut client).await {
        Some(ServerMessage::Error { message }) => assert!(message.starts_with("unauthorized")),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(task.await.unwrap().is_err());
    assert!(store.is_empty());
}

#[tokio::test]
async fn silent_client_times_out() {
    let mut settings = Settings::default();
    settings.server.handshake_timeout_secs = 1;
    let ctx = context(settings, sled());
    let (mut client, task) = start(&ctx).await;

    match next(&mut client).await {
        Some(ServerMessage::Error { message }) => assert!(message.contains("timed out")),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(matches!(
        task.await.unwrap(),
        Err(SessionError::HandshakeTimeout)
    ));
}

#[tokio::test]
async fn chat_is_appended_without_self_delivery() {
    let store = sled();
    let ctx = context(Settings::default(), store.clone());
    let (mut client, task) = start(&ctx).await;
    login(&mut client).await;

    send(&mut client, &chat("alice", "hi")).await;
    send(&mut client, &ClientMessage::History { limit: Some(10) }).await;

    // Without a fan-out task nothing comes back through the hub; the only
    // frame is the history reply, which shows the append happened.
    match next(&mut client).await {
        Some(ServerMessage::History { messages }) => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].sender, "alice");
            assert_eq!(messages[0].body, "hi");
            assert_eq!(messages[0].id, "1");
        }
        other => panic!("expected history, got {other:?}"),
    }

    let stored = store.history(1).await.unwrap();
    assert!(stored[0].origin.as_deref().unwrap().starts_with("session-"));

    client.close(None).await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn client_supplied_id_and_timestamp_are_ignored() {
    let store = sled();
    let ctx = context(Settings::default(), store.clone());
    let (mut client, task) = start(&ctx).await;
    login(&mut client).await;

    send_raw(
        &mut client,
        r#"{"type":"message","sender":"alice","body":"hi","id":"forged","timestamp":1}"#,
    )
    .await;
    send(&mut client, &ClientMessage::History { limit: None }).await;

    match next(&mut client).await {
        Some(ServerMessage::History { messages }) => {
            assert_eq!(messages[0].id, "1");
            assert!(messages[0].timestamp > 1);
        }
        other => panic!("expected history, got {other:?}"),
    }

    client.close(None).await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_frame_drains_session_and_appends_nothing() {
    let store = sled();
    let ctx = context(Settings::default(), store.clone());
    let (mut client, task) = start(&ctx).await;
    login(&mut client).await;

    send_raw(&mut client, r#"{"type":"message","sender":"alice"}"#).await;

    match next(&mut client).await {
        Some(ServerMessage::Error { message }) => assert!(message.starts_with("malformed frame")),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(close_code(&mut client).await, Some(CloseCode::Invalid));
    assert!(matches!(task.await.unwrap(), Err(SessionError::Decode(_))));
    assert!(store.is_empty());
    assert_eq!(ctx.hub.subscriber_count(), 0);
}

#[tokio::test]
async fn empty_sender_is_a_decode_error() {
    let store = sled();
    let ctx = context(Settings::default(), store.clone());
    let (mut client, task) = start(&ctx).await;
    login(&mut client).await;

    send(&mut client, &chat("", "nobody")).await;

    assert!(matches!(next(&mut client).await, Some(ServerMessage::Error { .. })));
    assert!(matches!(task.await.unwrap(), Err(SessionError::Decode(_))));
    assert!(store.is_empty());
}

#[tokio::test]
async fn write_failure_is_reported_and_session_continues() {
    let ctx = context(
        Settings::default(),
        Arc::new(FailingStore { unavailable: false }),
    );
    let (mut client, task) = start(&ctx).await;
    login(&mut client).await;

    send(&mut client, &chat("alice", "hi")).await;
    match next(&mut client).await {
        Some(ServerMessage::Error { message }) => assert!(message.starts_with("message not stored")),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(ctx.health.consecutive_failures(), 1);

    // Still active: requests keep getting answered.
    send(&mut client, &ClientMessage::History { limit: None }).await;
    assert!(matches!(
        next(&mut client).await,
        Some(ServerMessage::History { .. })
    ));

    client.close(None).await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unavailable_store_drains_session() {
    let mut settings = Settings::default();
    settings.fanout.failure_threshold = 1;
    let ctx = context(settings, Arc::new(FailingStore { unavailable: true }));
    let (mut client, task) = start(&ctx).await;
    login(&mut client).await;

    send(&mut client, &chat("alice", "hi")).await;
    assert!(matches!(next(&mut client).await, Some(ServerMessage::Error { .. })));
    assert!(matches!(
        task.await.unwrap(),
        Err(SessionError::Persistence(PersistenceError::Unavailable(_)))
    ));
    assert_eq!(ctx.health.status(), StoreStatus::Degraded);
}

#[tokio::test]
async fn hub_deliveries_are_encoded_to_the_client() {
    let ctx = context(Settings::default(), sled());
    let (mut client, task) = start(&ctx).await;
    login(&mut client).await;

    ctx.hub.publish(Message {
        id: "42".into(),
        sender: "bob".into(),
        body: "yo".into(),
        timestamp: 1234,
        origin: Some("elsewhere".into()),
    });

    match next(&mut client).await {
        Some(ServerMessage::Message(frame)) => {
            assert_eq!(frame.id, "42");
            assert_eq!(frame.sender, "bob");
            assert_eq!(frame.body, "yo");
            assert_eq!(frame.timestamp, 1234);
        }
        other => panic!("expected message, got {other:?}"),
    }

    client.close(None).await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn overflowing_subscriber_is_disconnected() {
    let mut settings = Settings::default();
    settings.hub = HubSettings {
        subscriber_buffer_capacity: 1,
        overflow_policy: OverflowPolicy::DisconnectSubscriber,
        echo_to_sender: true,
    };
    let ctx = context(settings, sled());
    let (mut client, task) = start(&ctx).await;
    login(&mut client).await;

    // No await between publishes, so the session cannot drain in between.
    for id in 0..3 {
        ctx.hub.publish(Message {
            id: id.to_string(),
            sender: "bob".into(),
            body: String::new(),
            timestamp: 0,
            origin: None,
        });
    }

    assert_eq!(close_code(&mut client).await, Some(CloseCode::Policy));
    assert!(matches!(
        task.await.unwrap(),
        Err(SessionError::SubscriptionClosed)
    ));
    assert_eq!(ctx.hub.subscriber_count(), 0);
}

#[tokio::test]
async fn lag_is_reported_before_next_delivery() {
    let mut settings = Settings::default();
    settings.hub.subscriber_buffer_capacity = 1;
    let ctx = context(settings, sled());
    let (mut client, task) = start(&ctx).await;
    login(&mut client).await;

    for id in 0..3 {
        ctx.hub.publish(Message {
            id: id.to_string(),
            sender: "bob".into(),
            body: String::new(),
            timestamp: 0,
            origin: None,
        });
    }

    assert_eq!(
        next(&mut client).await,
        Some(ServerMessage::Lagged { missed: 2 })
    );
    match next(&mut client).await {
        Some(ServerMessage::Message(frame)) => assert_eq!(frame.id, "0"),
        other => panic!("expected message, got {other:?}"),
    }

    client.close(None).await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn replay_on_connect_sends_recent_history() {
    let store = sled();
    for i in 0..5 {
        store
            .append(NewMessage::now("alice", format!("old{i}")))
            .await
            .unwrap();
    }
    let mut settings = Settings::default();
    settings.store.replay_on_connect = 2;
    let ctx = context(settings, store);
    let (mut client, task) = start(&ctx).await;
    login(&mut client).await;

    match next(&mut client).await {
        Some(ServerMessage::History { messages }) => {
            let bodies: Vec<_> = messages.iter().map(|m| m.body.as_str()).collect();
            assert_eq!(bodies, vec!["old3", "old4"]);
        }
        other => panic!("expected history, got {other:?}"),
    }

    client.close(None).await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn history_requests_are_capped() {
    let store = sled();
    for i in 0..5 {
        store
            .append(NewMessage::now("alice", format!("m{i}")))
            .await
            .unwrap();
    }
    let mut settings = Settings::default();
    settings.store.max_history = 3;
    let ctx = context(settings, store);
    let (mut client, task) = start(&ctx).await;
    login(&mut client).await;

    send(&mut client, &ClientMessage::History { limit: Some(100) }).await;
    match next(&mut client).await {
        Some(ServerMessage::History { messages }) => assert_eq!(messages.len(), 3),
        other => panic!("expected history, got {other:?}"),
    }

    client.close(None).await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_closes_active_session() {
    let ctx = context(Settings::default(), sled());
    let (mut client, task) = start(&ctx).await;
    login(&mut client).await;

    ctx.shutdown.cancel();
    assert_eq!(close_code(&mut client).await, Some(CloseCode::Normal));
    task.await.unwrap().unwrap();
    assert_eq!(ctx.hub.subscriber_count(), 0);
}

#[tokio::test]
async fn shutdown_rejects_session_still_logging_in() {
    let mut settings = Settings::default();
    settings.server.handshake_timeout_secs = 30;
    let ctx = context(settings, sled());
    let (mut client, task) = start(&ctx).await;

    ctx.shutdown.cancel();
    assert_eq!(close_code(&mut client).await, Some(CloseCode::Away));

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("session did not stop")
        .unwrap();
    assert!(matches!(result, Err(SessionError::ShuttingDown)));
    assert_eq!(ctx.hub.subscriber_count(), 0);
}

#[test]
fn encode_failure_drains_with_server_error() {
    let err = serde_json::from_str::<u8>("x").unwrap_err();
    let outcome = Err(SessionError::from(err));
    assert!(matches!(outcome, Err(SessionError::Encode(_))));
    assert_eq!(super::drain_close(&outcome).0, CloseCode::Error);

    assert_eq!(super::drain_close(&Ok(())).0, CloseCode::Normal);
    assert_eq!(
        super::drain_close(&Err(SessionError::SubscriptionClosed)).0,
        CloseCode::Policy
    );
}
