//! # WebSocket Transport
//!
//! Opens one authenticated WebSocket and pumps frames between it and a
//! pair of channels. Reconnection policy lives in the push channel; this
//! module only knows how to connect once.
//!
//! ## Connection Pump
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Connection Pump                                 │
//! │                                                                         │
//! │   PushChannel                 pump task                  Server         │
//! │   ───────────                 ─────────                  ──────         │
//! │   outgoing.send(msg) ───────► Text(json) ──────────────► WS            │
//! │   incoming.recv()    ◄─────── ServerFrame ◄───────────── Text(json)    │
//! │                               Ping every 30s ──────────► WS            │
//! │                                                                         │
//! │   outgoing dropped   ───────► Close frame, task ends                    │
//! │   socket closed      ───────► incoming closed (recv → None)             │
//! │                                                                         │
//! │  BACKOFF STRATEGY (Exponential with Jitter)                            │
//! │  ───────────────────────────────────────────                           │
//! │  Attempt 1: 1s   (+ up to 20% jitter)                                   │
//! │  Attempt 2: 2s                                                          │
//! │  Attempt 3: 4s                                                          │
//! │  ...                                                                    │
//! │  Max: 30s                                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ChannelSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, ServerFrame};

// =============================================================================
// Connection
// =============================================================================

/// An open push connection, seen as two channels.
///
/// Dropping `outgoing` closes the socket. `incoming` yields `None` once the
/// server side is gone.
pub struct Connection {
    pub outgoing: mpsc::Sender<ClientMessage>,
    pub incoming: mpsc::Receiver<ServerFrame>,
}

/// Opens push connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url, token: &str) -> SyncResult<Connection>;
}

// =============================================================================
// WebSocket Connector
// =============================================================================

/// [`Connector`] over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
    ping_interval: Duration,
}

impl WsConnector {
    pub fn new(settings: &ChannelSettings) -> Self {
        WsConnector {
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            ping_interval: Duration::from_secs(settings.ping_interval_secs),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url, token: &str) -> SyncResult<Connection> {
        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| SyncError::InvalidConfig(format!("unusable push token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let ws_stream = match timeout(self.connect_timeout, connect_async(request)).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                ws_stream
            }
            Ok(Err(e)) => return Err(SyncError::from(e)),
            Err(_) => return Err(SyncError::Timeout(self.connect_timeout.as_secs())),
        };

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<ClientMessage>(64);
        let (incoming_tx, incoming_rx) = mpsc::channel::<ServerFrame>(256);

        tokio::spawn(pump(ws_stream, outgoing_rx, incoming_tx, self.ping_interval));

        Ok(Connection {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

/// Moves frames until either side goes away.
async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing_rx: mpsc::Receiver<ClientMessage>,
    incoming_tx: mpsc::Sender<ServerFrame>,
    ping_every: Duration,
) {
    let (mut write, mut read) = ws_stream.split();

    let mut ping_interval = tokio::time::interval(ping_every);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            msg = outgoing_rx.recv() => {
                let Some(msg) = msg else {
                    debug!("Channel released connection, closing socket");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return;
                };
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Dropping unserializable frame");
                        continue;
                    }
                };
                debug!(msg_type = %msg.type_name(), "Sending frame");
                if let Err(e) = write.send(WsMessage::Text(json.into())).await {
                    warn!(error = %e, "WebSocket send failed");
                    return;
                }
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => match ServerFrame::from_json(&text) {
                        Ok(frame) => {
                            debug!(frame_type = %frame.type_name(), "Received frame");
                            if incoming_tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to parse frame"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        if write.send(WsMessage::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => debug!("Received pong"),
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Server closed push channel");
                        return;
                    }
                    Some(Ok(WsMessage::Binary(_))) => warn!("Received unexpected binary frame"),
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        return;
                    }
                    None => return,
                }
            }

            _ = ping_interval.tick() => {
                if write.send(WsMessage::Ping(Vec::<u8>::new().into())).await.is_err() {
                    return;
                }
                debug!("Sent ping");
            }
        }
    }
}

// =============================================================================
// Reconnect Backoff
// =============================================================================

/// Exponential reconnect delay with additive jitter.
///
/// `delay = min(base * (1 + jitter * r), max)` with `r` in `[0, 1)` and the
/// base doubling each attempt. With `jitter <= 1` the sequence never
/// decreases and never exceeds `max`. [`reset`](Self::reset) after a
/// successful handshake.
pub struct ReconnectBackoff {
    inner: ExponentialBackoff,
    jitter: f64,
    max: Duration,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        let mut inner = ExponentialBackoff {
            initial_interval: initial,
            max_interval: max,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        inner.reset();
        ReconnectBackoff {
            inner,
            jitter: jitter.clamp(0.0, 1.0),
            max,
            attempts: 0,
        }
    }

    pub fn from_settings(settings: &ChannelSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_secs(settings.max_backoff_secs),
            settings.jitter,
        )
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.inner.next_backoff().unwrap_or(self.max).min(self.max);
        self.attempts += 1;
        let extra = base.mul_f64(self.jitter * rand::random::<f64>());
        (base + extra).min(self.max)
    }

    pub fn reset(&mut self) {
        self.inner.reset();
        self.attempts = 0;
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
