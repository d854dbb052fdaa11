use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "porthole-relay")]
#[command(about = "Porthole session relay server and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a session as a viewer and print the event stream
    Watch {
        /// Relay server URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Session code to join
        #[arg(short, long)]
        session: String,

        /// Bearer token for the auth handshake
        #[arg(short, long)]
        token: String,
    },
}

/// Minimal viewer-side client for poking at a running relay: performs the
/// auth handshake, joins the room, and prints every event it receives.
pub async fn run_watch_client(url: String, session: String, token: String) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("connecting to {ws_url}");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {ws_url}: {e}");
            return Err(anyhow::anyhow!("connection failed: {e}"));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the relay server running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let auth = serde_json::to_string(&ClientMessage::Auth { token })?;
    write.send(Message::Text(auth.into())).await?;

    // The server answers auth before anything else; anything other than
    // auth:ok here is fatal.
    let authed = timeout(Duration::from_secs(5), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                match serde_json::from_str::<ServerMessage>(text.as_str())? {
                    ServerMessage::AuthOk { user_id, .. } => return Ok(user_id),
                    ServerMessage::Error { code, message } => {
                        return Err(anyhow::anyhow!("auth rejected: {code}: {message}"))
                    }
                    other => debug!("ignoring pre-auth message: {other:?}"),
                }
            }
        }
        Err(anyhow::anyhow!("connection closed during handshake"))
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for auth response"))??;
    println!("authenticated as {authed}");

    let join = serde_json::to_string(&ClientMessage::SessionJoin {
        session_code: session.clone(),
    })?;
    write.send(Message::Text(join.into())).await?;

    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                match serde_json::from_str::<serde_json::Value>(text.as_str()) {
                    Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                    Err(_) => println!("{text}"),
                }
                if let Ok(ServerMessage::SessionEnded { reason, .. }) =
                    serde_json::from_str::<ServerMessage>(text.as_str())
                {
                    println!("session ended: {reason}");
                    break;
                }
            }
            Message::Close(_) => {
                println!("connection closed by server");
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
