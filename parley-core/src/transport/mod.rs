//! WebSocket client for the inference backend.
//!
//! The client is a tokio task. The frame loop talks to it through a
//! [`TransportHandle`] (outbound commands) and receives [`TransportEvent`]s on
//! a crossbeam channel it drains once per frame, so network I/O never blocks
//! detection.
//!
//! Reconnection: an unclean drop (error, EOF without a close frame, failed
//! connect) backs off `base · 2^n` capped at `max_delay`, for at most
//! `max_attempts` tries. A clean close from the server does not reconnect
//! until the next explicit [`TransportHandle::connect`].

pub mod protocol;

use std::time::Duration;

use crossbeam_channel::Sender;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

pub use protocol::{ClientMessage, ServerMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based), or `None` once exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        Some(
            self.base
                .checked_mul(factor)
                .unwrap_or(self.max_delay)
                .min(self.max_delay),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    /// An established connection went away.
    Closed { clean: bool },
    /// Every reconnect attempt failed; waiting for an explicit connect.
    Unavailable,
    Message(ServerMessage),
}

#[derive(Debug)]
enum TransportCommand {
    Send(ClientMessage),
    Connect,
    Shutdown,
}

/// Cheap, cloneable sender side of the client task.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportHandle {
    /// Queue a message. Returns `false` if the client task is gone.
    pub fn send(&self, message: ClientMessage) -> bool {
        self.commands.send(TransportCommand::Send(message)).is_ok()
    }

    /// Ask for a connection if there is none (no-op while connected).
    pub fn connect(&self) {
        let _ = self.commands.send(TransportCommand::Connect);
    }

    /// Close the connection and end the task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(TransportCommand::Shutdown);
    }
}

/// Start the client task on the current tokio runtime. It connects right away.
pub fn spawn(
    url: String,
    policy: ReconnectPolicy,
    events: Sender<TransportEvent>,
) -> (TransportHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(TransportCommand::Connect);
    let task = tokio::spawn(run(url, policy, rx, events));
    (TransportHandle { commands: tx }, task)
}

enum Ended {
    Shutdown,
    Closed { clean: bool },
}

async fn run(
    url: String,
    policy: ReconnectPolicy,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: Sender<TransportEvent>,
) {
    let mut wanted = false;
    let mut attempt = 0u32;

    loop {
        if !wanted {
            match commands.recv().await {
                Some(TransportCommand::Connect) => wanted = true,
                Some(TransportCommand::Send(_)) => {
                    warn!("not connected, dropping outbound message");
                }
                Some(TransportCommand::Shutdown) | None => break,
            }
            continue;
        }

        match connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                attempt = 0;
                info!(url = url.as_str(), "transport connected");
                if events.send(TransportEvent::Opened).is_err() {
                    break;
                }
                match serve(ws, &mut commands, &events).await {
                    Ended::Shutdown => break,
                    Ended::Closed { clean } => {
                        info!(clean, "transport closed");
                        if events.send(TransportEvent::Closed { clean }).is_err() {
                            break;
                        }
                        if clean {
                            wanted = false;
                            continue;
                        }
                    }
                }
            }
            Err(e) => warn!(attempt, "connect to {url} failed: {e}"),
        }

        let Some(delay) = policy.delay_for(attempt) else {
            error!(attempts = attempt, "backend unreachable, giving up until next activation");
            attempt = 0;
            wanted = false;
            if events.send(TransportEvent::Unavailable).is_err() {
                break;
            }
            continue;
        };
        attempt += 1;
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        if !backoff(delay, &mut commands).await {
            break;
        }
    }
    debug!("transport task finished");
}

/// Sleep for `delay` while still honouring commands. Returns `false` on shutdown.
async fn backoff(delay: Duration, commands: &mut mpsc::UnboundedReceiver<TransportCommand>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(TransportCommand::Connect) => return true,
                Some(TransportCommand::Send(_)) => warn!("reconnecting, dropping outbound message"),
                Some(TransportCommand::Shutdown) | None => return false,
            },
        }
    }
}

async fn serve(
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    commands: &mut mpsc::UnboundedReceiver<TransportCommand>,
    events: &Sender<TransportEvent>,
) -> Ended {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::parse(&text) {
                    Ok(message) => {
                        debug!(kind = message.kind(), "inbound message");
                        if events.send(TransportEvent::Message(message)).is_err() {
                            let _ = sink.send(Message::Close(None)).await;
                            return Ended::Shutdown;
                        }
                    }
                    Err(e) => warn!("dropping malformed inbound message: {e}"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "close frame received");
                    return Ended::Closed { clean: true };
                }
                Some(Ok(Message::Binary(data))) => {
                    warn!(bytes = data.len(), "unexpected binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("transport error: {e}");
                    return Ended::Closed { clean: false };
                }
                None => return Ended::Closed { clean: false },
            },
            command = commands.recv() => match command {
                Some(TransportCommand::Send(message)) => {
                    let json = match message.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            error!("failed to encode outbound message: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(json)).await {
                        warn!("send failed: {e}");
                        return Ended::Closed { clean: false };
                    }
                }
                Some(TransportCommand::Connect) => {}
                Some(TransportCommand::Shutdown) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ended::Shutdown;
                }
            },
        }
    }
}
