//! Pusher-protocol websocket transport and private channel authorization.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode};
use shared::protocol::{
    ChannelAuthResponse, ConnectionEstablished, PusherErrorData, PusherFrame,
    EVENT_CONNECTION_ESTABLISHED, EVENT_ERROR, EVENT_PING,
};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

use crate::{credentials::Credential, error::SessionError, subscriptions::ChannelName};

const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Live socket handed to the connection manager. Aborting `task` closes the
/// socket; the `inbound` stream ends when the socket goes away.
pub struct TransportLink {
    pub socket_id: String,
    pub outbound: mpsc::UnboundedSender<PusherFrame>,
    pub inbound: mpsc::UnboundedReceiver<PusherFrame>,
    pub task: JoinHandle<()>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<TransportLink, SessionError>;
}

#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    /// Returns the `auth` signature for subscribing `channel` on `socket_id`.
    async fn authorize(
        &self,
        socket_id: &str,
        channel: &ChannelName,
        credential: &Credential,
    ) -> Result<String, SessionError>;
}

pub struct WebSocketTransport {
    url: Url,
    handshake_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(url: Url, handshake_timeout: Duration) -> Self {
        Self {
            url,
            handshake_timeout,
        }
    }
}

/// Pusher error codes 4000-4099 close the connection without retry; 4009 is
/// "connection is unauthorized".
fn classify_pusher_error(data: &PusherErrorData) -> SessionError {
    let message = data
        .message
        .clone()
        .unwrap_or_else(|| "broadcast server rejected the connection".to_string());
    match data.code {
        Some(4001) | Some(4009) => SessionError::Authentication(message),
        Some(code) => SessionError::Transport(format!("pusher error {code}: {message}")),
        None => SessionError::Transport(message),
    }
}

async fn await_established<S>(reader: &mut S) -> Result<ConnectionEstablished, SessionError>
where
    S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                let frame: PusherFrame = serde_json::from_str(&text).map_err(|err| {
                    SessionError::Transport(format!("invalid handshake frame: {err}"))
                })?;
                if frame.event == EVENT_CONNECTION_ESTABLISHED {
                    return frame.decode_data().map_err(|err| {
                        SessionError::Transport(format!("invalid connection_established: {err}"))
                    });
                }
                if frame.event == EVENT_ERROR {
                    let data: PusherErrorData = frame.decode_data().unwrap_or(PusherErrorData {
                        message: None,
                        code: None,
                    });
                    return Err(classify_pusher_error(&data));
                }
                debug!(event = %frame.event, "realtime: ignoring frame before handshake");
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(SessionError::Transport(format!(
                    "websocket handshake failed: {err}"
                )))
            }
        }
    }
    Err(SessionError::Transport(
        "websocket closed before connection was established".into(),
    ))
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<TransportLink, SessionError> {
        let (ws_stream, _) = timeout(self.handshake_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| SessionError::Transport(format!("timed out connecting to {}", self.url)))?
            .map_err(|err| {
                SessionError::Transport(format!("failed to connect websocket {}: {err}", self.url))
            })?;
        let (mut writer, mut reader) = ws_stream.split();

        let established = timeout(self.handshake_timeout, await_established(&mut reader))
            .await
            .map_err(|_| {
                SessionError::Transport("timed out waiting for connection_established".into())
            })??;

        let activity_timeout = established
            .activity_timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_ACTIVITY_TIMEOUT);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<PusherFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<PusherFrame>();
        let socket_id = established.socket_id.clone();

        let task = tokio::spawn(async move {
            let mut keepalive = tokio::time::interval_at(
                tokio::time::Instant::now() + activity_timeout,
                activity_timeout,
            );
            loop {
                let to_send = tokio::select! {
                    outbound = outbound_rx.recv() => match outbound {
                        Some(frame) => Some(frame),
                        None => break,
                    },
                    _ = keepalive.tick() => Some(PusherFrame::new(EVENT_PING, None, serde_json::json!({}))),
                    inbound = reader.next() => match inbound {
                        Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<PusherFrame>(&text) {
                            Ok(frame) if frame.event == EVENT_PING => Some(PusherFrame::pong()),
                            Ok(frame) => {
                                if inbound_tx.send(frame).is_err() {
                                    break;
                                }
                                None
                            }
                            Err(err) => {
                                warn!("realtime: dropping undecodable frame: {err}");
                                None
                            }
                        },
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => None,
                        Some(Err(err)) => {
                            warn!("realtime: websocket receive failed: {err}");
                            break;
                        }
                    },
                };

                if let Some(frame) = to_send {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!("realtime: failed to encode frame {}: {err}", frame.event);
                            continue;
                        }
                    };
                    if let Err(err) = writer.send(WsMessage::Text(text)).await {
                        warn!("realtime: websocket send failed: {err}");
                        break;
                    }
                }
            }
            let _ = writer.close().await;
        });

        Ok(TransportLink {
            socket_id,
            outbound: outbound_tx,
            inbound: inbound_rx,
            task,
        })
    }
}

pub struct HttpChannelAuthorizer {
    http: Client,
    endpoint: String,
}

impl HttpChannelAuthorizer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ChannelAuthorizer for HttpChannelAuthorizer {
    async fn authorize(
        &self,
        socket_id: &str,
        channel: &ChannelName,
        credential: &Credential,
    ) -> Result<String, SessionError> {
        let res = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, credential.bearer())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[("socket_id", socket_id), ("channel_name", channel.as_str())])
            .send()
            .await
            .map_err(|err| {
                SessionError::Transport(format!("channel auth request failed: {err}"))
            })?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SessionError::Authentication(format!(
                "channel {channel} rejected with status {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(SessionError::Transport(format!(
                "channel auth for {channel} failed with status {}",
                status.as_u16()
            )));
        }

        let body: ChannelAuthResponse = res.json().await.map_err(|err| {
            SessionError::Transport(format!("invalid channel auth response: {err}"))
        })?;
        Ok(body.auth)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
