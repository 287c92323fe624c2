//! WebSocket server
//!
//! Accepts TCP connections, upgrades them and hands each one to a
//! [`Session`]. The server also owns the fan-out task, and a tail is
//! attached while binding so records appended by the first clients are
//! never missed.
//!
//! Shutdown: cancelling the token returned by [`ChatServer::shutdown_token`]
//! stops the accept loop and the fan-out task, closes the hub and waits for
//! every session to drain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::Settings;
use crate::fanout::{FanOut, FanOutState, StoreHealth};
use crate::hub::BroadcastHub;
use crate::session::{Session, SessionContext};
use crate::store::{MessageStore, Tail};
use crate::utils::error::{ServerError, SessionError};

pub struct ChatServer {
    listener: TcpListener,
    ctx: SessionContext,
    fanout: FanOut,
    initial_tail: Option<Tail>,
}

impl ChatServer {
    pub async fn bind(
        settings: Settings,
        store: Arc<dyn MessageStore>,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Self, ServerError> {
        let addr = format!("{}:{}", settings.server.host, settings.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        let hub = BroadcastHub::new(settings.hub.clone());
        let health = StoreHealth::new(settings.fanout.failure_threshold);
        let fanout = FanOut::new(
            Arc::clone(&store),
            hub.clone(),
            health.clone(),
            settings.fanout.clone(),
        );

        let initial_tail = match store.tail().await {
            Ok(tail) => Some(tail),
            Err(e) => {
                warn!(error = %e, "store tail unavailable at startup");
                None
            }
        };

        Ok(Self {
            listener,
            ctx: SessionContext {
                store,
                hub,
                auth,
                health,
                settings: Arc::new(settings),
                shutdown: CancellationToken::new(),
            },
            fanout,
            initial_tail,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> BroadcastHub {
        self.ctx.hub.clone()
    }

    pub fn health(&self) -> StoreHealth {
        self.ctx.health.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    pub fn fanout_state(&self) -> watch::Receiver<FanOutState> {
        self.fanout.state()
    }

    /// Serve until the shutdown token is cancelled.
    pub async fn run(self) {
        let ChatServer {
            listener,
            ctx,
            fanout,
            initial_tail,
        } = self;
        let shutdown = ctx.shutdown.clone();
        let tracker = TaskTracker::new();

        tracker.spawn(fanout.run(initial_tail, shutdown.clone()));

        match listener.local_addr() {
            Ok(addr) => info!("WebSocket server listening on ws://{addr}"),
            Err(_) => info!("WebSocket server listening"),
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracker.spawn(handle_connection(stream, peer, ctx.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!("shutting down");
        ctx.hub.close();
        tracker.close();
        tracker.wait().await;
        info!("server stopped");
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: SessionContext) {
    let timeout = Duration::from_secs(ctx.settings.server.handshake_timeout_secs);
    let ws = tokio::select! {
        _ = ctx.shutdown.cancelled() => {
            debug!(%peer, "shutdown before WebSocket upgrade");
            return;
        }
        upgraded = tokio::time::timeout(timeout, accept_async(stream)) => match upgraded {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "WebSocket handshake error");
                return;
            }
            Err(_) => {
                warn!(%peer, "WebSocket upgrade timed out");
                return;
            }
        },
    };

    let session = Session::new(ctx);
    debug!(%peer, session = %session.id(), "connection accepted");

    match session.run(ws).await {
        Ok(()) | Err(SessionError::Transport(_) | SessionError::ShuttingDown) => {}
        Err(e) => debug!(%peer, error = %e, "session ended with error"),
    }
}

/// Bind and run with the production store and authenticator until Ctrl-C.
pub async fn start_websocket_server(
    settings: Settings,
    store: Arc<dyn MessageStore>,
    auth: Arc<dyn Authenticator>,
) -> Result<(), ServerError> {
    let server = ChatServer::bind(settings, store, auth).await?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received. Exiting gracefully.");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "unable to listen for shutdown signal"),
        }
    });

    server.run().await;
    Ok(())
}
