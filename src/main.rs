//! CLI for chatcast
//!
//! Subcommands:
//! - `server`: run the WebSocket server
//! - `client`: log in, send one message and print what comes back

use std::sync::Arc;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tracing::{error, info};

use chatcast::auth::StaticAuthenticator;
use chatcast::config::load_config_from;
use chatcast::store::SledStore;
use chatcast::transport::codec;
use chatcast::transport::message::{ClientMessage, ServerMessage};
use chatcast::transport::start_websocket_server;

#[derive(Parser)]
#[command(name = "chatcast")]
enum Command {
    /// Start the WebSocket server
    Server {
        /// Configuration file stem (any format the `config` crate reads)
        #[arg(long, default_value = "config/default")]
        config: String,
    },
    /// Run a one-shot client: login, send a message, print replies
    Client {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long, default_value = "admin")]
        username: String,
        #[arg(long, default_value = "password")]
        password: String,
        #[arg(long, default_value = "admin")]
        sender: String,
        #[arg(long, default_value = "Hello from chatcast")]
        body: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    chatcast::utils::logging::init("info");

    match Command::parse() {
        Command::Server { config } => {
            if let Err(e) = run_server(&config).await {
                error!("Server failed: {}", e);
            }
        }
        Command::Client {
            url,
            username,
            password,
            sender,
            body,
        } => {
            if let Err(e) = run_client(&url, username, password, sender, body).await {
                error!("Client failed: {}", e);
            }
        }
    }
}

async fn run_server(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_config_from(config_path)?;
    let store = SledStore::open(&settings.store.path, settings.store.max_messages)?;
    info!(path = %settings.store.path, records = store.len(), "message store opened");

    let auth = StaticAuthenticator::from_settings(&settings.auth);
    start_websocket_server(settings, Arc::new(store), Arc::new(auth)).await?;
    Ok(())
}

async fn run_client(
    url: &str,
    username: String,
    password: String,
    sender: String,
    body: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mut ws_stream, _response) = connect_async(url).await?;

    ws_stream
        .send(codec::encode_client(&ClientMessage::Login { username, password })?)
        .await?;

    match next_frame(&mut ws_stream).await? {
        Some(ServerMessage::Authenticated { username }) => {
            println!("Logged in as {username}");
        }
        Some(other) => {
            println!("Login refused: {other:?}");
            return Ok(());
        }
        None => return Ok(()),
    }

    ws_stream
        .send(codec::encode_client(&ClientMessage::Chat { sender, body })?)
        .await?;

    while let Some(frame) = next_frame(&mut ws_stream).await? {
        match frame {
            ServerMessage::Message(msg) => {
                println!("[{}] {}: {}", msg.id, msg.sender, msg.body);
                break;
            }
            other => println!("Incoming: {other:?}"),
        }
    }

    ws_stream.close(None).await?;
    Ok(())
}

async fn next_frame<S>(ws: &mut S) -> Result<Option<ServerMessage>, Box<dyn std::error::Error>>
where
    S: futures_util::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = ws.next().await {
        match frame? {
            frame @ (tungstenite::Message::Text(_) | tungstenite::Message::Binary(_)) => {
                return Ok(Some(codec::decode_server(&frame.into_data())?));
            }
            tungstenite::Message::Close(_) => return Ok(None),
            _ => continue,
        }
    }
    Ok(None)
}
