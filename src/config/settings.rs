use std::collections::HashMap;

use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub hub: HubSettings,
    pub store: StoreSettings,
    pub fanout: FanOutSettings,
    pub auth: AuthSettings,
}

/// Defines the host and port the server will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// How long a fresh connection may take to send its `login` frame.
    pub handshake_timeout_secs: u64,
}

/// What the hub does when a subscriber's queue is full.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Drop the incoming message for that subscriber only.
    #[default]
    DropNewest,
    /// Evict the oldest queued message to make room.
    DropOldest,
    /// Close the subscription and unregister it.
    DisconnectSubscriber,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HubSettings {
    pub subscriber_buffer_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Deliver a message back to the session that sent it.
    pub echo_to_sender: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub path: String,
    /// Retention cap; oldest records are trimmed after an append.
    pub max_messages: Option<usize>,
    /// Number of recent messages sent to a session once it is active.
    pub replay_on_connect: usize,
    /// Upper bound for a client `history` request.
    pub max_history: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FanOutSettings {
    pub reconnect_backoff_ms: u64,
    pub degraded_probe_interval_ms: u64,
    /// Consecutive append failures before the store is reported degraded.
    pub failure_threshold: u32,
}

/// Credentials accepted by the bundled static authenticator.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    pub users: HashMap<String, String>,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub hub: Option<PartialHubSettings>,
    pub store: Option<PartialStoreSettings>,
    pub fanout: Option<PartialFanOutSettings>,
    pub auth: Option<PartialAuthSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub handshake_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialHubSettings {
    pub subscriber_buffer_capacity: Option<usize>,
    pub overflow_policy: Option<OverflowPolicy>,
    pub echo_to_sender: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStoreSettings {
    pub path: Option<String>,
    pub max_messages: Option<usize>,
    pub replay_on_connect: Option<usize>,
    pub max_history: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialFanOutSettings {
    pub reconnect_backoff_ms: Option<u64>,
    pub degraded_probe_interval_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialAuthSettings {
    pub users: Option<HashMap<String, String>>,
}

impl PartialSettings {
    /// Merge with defaults, section by section.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let hub = self.hub.unwrap_or_default();
        let store = self.store.unwrap_or_default();
        let fanout = self.fanout.unwrap_or_default();
        let auth = self.auth.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                handshake_timeout_secs: server
                    .handshake_timeout_secs
                    .unwrap_or(default.server.handshake_timeout_secs),
            },
            hub: HubSettings {
                subscriber_buffer_capacity: hub
                    .subscriber_buffer_capacity
                    .unwrap_or(default.hub.subscriber_buffer_capacity),
                overflow_policy: hub.overflow_policy.unwrap_or(default.hub.overflow_policy),
                echo_to_sender: hub.echo_to_sender.unwrap_or(default.hub.echo_to_sender),
            },
            store: StoreSettings {
                path: store.path.unwrap_or(default.store.path),
                max_messages: store.max_messages.or(default.store.max_messages),
                replay_on_connect: store
                    .replay_on_connect
                    .unwrap_or(default.store.replay_on_connect),
                max_history: store.max_history.unwrap_or(default.store.max_history),
            },
            fanout: FanOutSettings {
                reconnect_backoff_ms: fanout
                    .reconnect_backoff_ms
                    .unwrap_or(default.fanout.reconnect_backoff_ms),
                degraded_probe_interval_ms: fanout
                    .degraded_probe_interval_ms
                    .unwrap_or(default.fanout.degraded_probe_interval_ms),
                failure_threshold: fanout
                    .failure_threshold
                    .unwrap_or(default.fanout.failure_threshold),
            },
            auth: AuthSettings {
                users: auth.users.unwrap_or(default.auth.users),
            },
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                handshake_timeout_secs: 10,
            },
            hub: HubSettings::default(),
            store: StoreSettings {
                path: "chatcast_db".to_string(),
                max_messages: None,
                replay_on_connect: 0,
                max_history: 500,
            },
            fanout: FanOutSettings::default(),
            auth: AuthSettings {
                users: HashMap::from([("admin".to_string(), "password".to_string())]),
            },
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer_capacity: 64,
            overflow_policy: OverflowPolicy::DropNewest,
            echo_to_sender: true,
        }
    }
}

impl Default for FanOutSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: 500,
            degraded_probe_interval_ms: 5000,
            failure_threshold: 3,
        }
    }
}
