//! Websocket plumbing shared by the Bybit and Binance push channels.
//!
//! [`Socket::connect`] spawns one task that owns the stream and multiplexes
//! outbound commands, inbound frames and the heartbeat with `tokio::select!`.
//! Text frames are forwarded as-is; the returned receiver ends when the
//! socket closes for any reason.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::exchange::{AdapterError, AdapterResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Command {
    Send(String, oneshot::Sender<AdapterResult<()>>),
    Close,
}

/// Keep-alive sent on a fixed cadence.  `payload: None` sends a protocol
/// ping frame instead of an application message.
#[derive(Debug, Clone)]
pub(crate) struct Heartbeat {
    pub every: Duration,
    pub payload: Option<String>,
}

/// Cheap handle to a running socket task.
#[derive(Clone)]
pub(crate) struct Socket {
    commands: mpsc::UnboundedSender<Command>,
}

impl Socket {
    pub async fn connect(
        url: &str,
        heartbeat: Heartbeat,
    ) -> AdapterResult<(Socket, mpsc::UnboundedReceiver<String>)> {
        let (stream, _) = connect_async(url).await.map_err(AdapterError::transport)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let label = url.to_string();
        tokio::spawn(async move {
            match run_socket(stream, cmd_rx, text_tx, heartbeat).await {
                Ok(()) => debug!(url = %label, "websocket closed"),
                Err(err) => debug!(url = %label, error = %err, "websocket terminated"),
            }
        });
        Ok((Socket { commands: cmd_tx }, text_rx))
    }

    /// Send one text frame and wait until it is on the wire.
    pub async fn send(&self, text: String) -> AdapterResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Send(text, ack_tx))
            .map_err(|_| AdapterError::Transport("websocket closed".into()))?;
        ack_rx
            .await
            .map_err(|_| AdapterError::Transport("websocket closed".into()))?
    }

    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

async fn run_socket(
    mut socket: WsStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    text_tx: mpsc::UnboundedSender<String>,
    heartbeat: Heartbeat,
) -> AdapterResult<()> {
    let mut ticker = interval(heartbeat.every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Send(text, ack)) => {
                    let result = socket
                        .send(Message::Text(text))
                        .await
                        .map_err(AdapterError::transport);
                    let failed = result.is_err();
                    let _ = ack.send(result.clone());
                    if failed {
                        return result;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = socket.send(Message::Close(None)).await;
                    return Ok(());
                }
            },
            msg = socket.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if text_tx.send(text).is_err() {
                        return Ok(());
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if let Ok(text) = String::from_utf8(bytes) {
                        if text_tx.send(text).is_err() {
                            return Ok(());
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    socket
                        .send(Message::Pong(payload))
                        .await
                        .map_err(AdapterError::transport)?;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "close frame received");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(AdapterError::transport(err)),
                None => return Ok(()),
            },
            _ = ticker.tick() => {
                trace!("websocket heartbeat");
                let frame = match &heartbeat.payload {
                    Some(text) => Message::Text(text.clone()),
                    None => Message::Ping(Vec::new()),
                };
                socket.send(frame).await.map_err(AdapterError::transport)?;
            }
        }
    }
}
