//! Push transports. Each one turns a live connection into a pair of frame channels so the
//! connection supervisor never has to know which wire it is talking over.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::Value;
use shared::protocol::{PushFrame, PushSessionResponse};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};

use crate::{config::SyncSettings, error::TransportError};

const LINK_CAPACITY: usize = 64;
const POLL_IDLE_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSocket,
    Polling,
}

impl TransportKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Polling => "polling",
        }
    }

    /// The transport to fall back to when this one cannot be negotiated.
    pub fn degraded(self) -> Option<Self> {
        match self {
            Self::WebSocket => Some(Self::Polling),
            Self::Polling => None,
        }
    }
}

/// Client side of an open push connection. The link is dead once `inbound` yields `None`.
#[derive(Debug)]
pub struct PushLink {
    pub kind: TransportKind,
    pub outbound: mpsc::Sender<PushFrame>,
    pub inbound: mpsc::Receiver<PushFrame>,
}

/// Wire side of a [`PushLink`]: frames decoded from the wire go into `inbound`, frames the
/// client wants written come out of `outbound`.
#[derive(Debug)]
pub struct PushLinkRemote {
    pub inbound: mpsc::Sender<PushFrame>,
    pub outbound: mpsc::Receiver<PushFrame>,
}

impl PushLink {
    pub fn pair(kind: TransportKind) -> (PushLink, PushLinkRemote) {
        let (inbound_tx, inbound_rx) = mpsc::channel(LINK_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(LINK_CAPACITY);
        (
            PushLink {
                kind,
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            PushLinkRemote {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, kind: TransportKind) -> Result<PushLink, TransportError>;
}

pub struct HttpPushConnector {
    ws_url: String,
    rest_base: String,
    http: Client,
}

impl HttpPushConnector {
    pub fn new(settings: &SyncSettings) -> anyhow::Result<Self> {
        // Long-poll requests outlive the regular request timeout on purpose.
        let http = Client::builder().build()?;
        Ok(Self {
            ws_url: settings.push_ws_url()?,
            rest_base: settings.rest_base_url().to_string(),
            http,
        })
    }

    async fn connect_websocket(&self) -> Result<PushLink, TransportError> {
        let kind = TransportKind::WebSocket;
        let (stream, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|err| negotiation(kind, err))?;
        let (mut sink, mut reader) = stream.split();
        let (link, remote) = PushLink::pair(kind);
        let PushLinkRemote {
            inbound,
            mut outbound,
        } = remote;

        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("push: failed to encode outbound frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = sink.send(WsMessage::Text(text)).await {
                    debug!("push: websocket write failed: {err}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        let Some(frame) = decode_frame(&text) else {
                            continue;
                        };
                        if inbound.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("push: websocket read failed: {err}");
                        break;
                    }
                }
            }
            debug!("push: websocket reader finished");
        });

        Ok(link)
    }

    async fn connect_polling(&self) -> Result<PushLink, TransportError> {
        let kind = TransportKind::Polling;
        let response = self
            .http
            .post(format!("{}/push/session", self.rest_base))
            .send()
            .await
            .map_err(|err| negotiation(kind, err))?;
        if !response.status().is_success() {
            return Err(negotiation(
                kind,
                format!("session request returned {}", response.status()),
            ));
        }
        let session: PushSessionResponse =
            response.json().await.map_err(|err| negotiation(kind, err))?;

        let (link, remote) = PushLink::pair(kind);
        let PushLinkRemote {
            inbound,
            mut outbound,
        } = remote;

        let http = self.http.clone();
        let emit_url = format!("{}/push/emit", self.rest_base);
        let session_id = session.session_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let result = http
                    .post(&emit_url)
                    .query(&[("session", session_id.as_str())])
                    .json(&frame)
                    .send()
                    .await
                    .and_then(|response| response.error_for_status());
                if let Err(err) = result {
                    warn!("push: polling emit failed: {err}");
                    break;
                }
            }
        });

        let http = self.http.clone();
        let poll_url = format!("{}/push/poll", self.rest_base);
        let session_id = session.session_id;
        tokio::spawn(async move {
            loop {
                let request = http
                    .get(&poll_url)
                    .query(&[("session", session_id.as_str())])
                    .send();
                let response = tokio::select! {
                    _ = inbound.closed() => break,
                    response = request => response,
                };
                let batch = match response.and_then(|response| response.error_for_status()) {
                    Ok(response) => response.json::<Vec<Value>>().await,
                    Err(err) => {
                        warn!("push: poll request failed: {err}");
                        break;
                    }
                };
                let batch = match batch {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!("push: poll response unreadable: {err}");
                        break;
                    }
                };
                if batch.is_empty() {
                    tokio::time::sleep(POLL_IDLE_DELAY).await;
                    continue;
                }
                for raw in batch {
                    match serde_json::from_value::<PushFrame>(raw) {
                        Ok(frame) => {
                            if inbound.send(frame).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!("push: ignoring undecodable frame: {err}"),
                    }
                }
            }
            debug!("push: poll loop finished");
        });

        Ok(link)
    }
}

#[async_trait]
impl PushConnector for HttpPushConnector {
    async fn connect(&self, kind: TransportKind) -> Result<PushLink, TransportError> {
        match kind {
            TransportKind::WebSocket => self.connect_websocket().await,
            TransportKind::Polling => self.connect_polling().await,
        }
    }
}

fn negotiation(kind: TransportKind, reason: impl ToString) -> TransportError {
    TransportError::Negotiation {
        transport: kind.label(),
        reason: reason.to_string(),
    }
}

fn decode_frame(text: &str) -> Option<PushFrame> {
    match serde_json::from_str::<PushFrame>(text) {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!("push: ignoring undecodable frame: {err}");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
