//! The single push connection of the process and the viewer's registration on it.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::ProfileId,
    protocol::{PushFrame, PushMessage, SeenAck},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    config::SyncSettings,
    error::TransportError,
    transport::{PushConnector, PushLink, TransportKind},
};

const PREFERRED_TRANSPORT: TransportKind = TransportKind::WebSocket;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Connected(TransportKind),
    Reconnecting { attempt: u32, last_error: String },
    /// Reconnect attempts for the current outage ran out.
    Failed,
    Disconnected,
}

impl ConnectivityState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

/// Lifecycle notifications, in the order they happen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityChange {
    Connected(TransportKind),
    Reconnected(TransportKind),
    Disconnected,
    ConnectError(String),
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(PushMessage),
    SeenAck(SeenAck),
    Connectivity(ConnectivityChange),
}

#[derive(Default)]
struct ConnectionInner {
    identity: Option<ProfileId>,
    supervisor: Option<JoinHandle<()>>,
    control: Option<mpsc::UnboundedSender<PushFrame>>,
}

pub struct ConnectionManager {
    connector: Arc<dyn PushConnector>,
    settings: SyncSettings,
    inner: Mutex<ConnectionInner>,
    status: watch::Sender<ConnectivityState>,
    events: broadcast::Sender<TransportEvent>,
}

impl ConnectionManager {
    pub fn init(connector: Arc<dyn PushConnector>, settings: &SyncSettings) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectivityState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            connector,
            settings: settings.clone(),
            inner: Mutex::new(ConnectionInner::default()),
            status,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> ConnectivityState {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectivityState> {
        self.status.subscribe()
    }

    /// Opens the push connection for `identity` unless it is already running, in which case
    /// the identity is registered again. Returns once the first attempt has settled.
    pub async fn connect(self: &Arc<Self>, identity: ProfileId) {
        {
            let mut inner = self.inner.lock().await;
            let running = inner
                .supervisor
                .as_ref()
                .is_some_and(|handle| !handle.is_finished());
            if running && inner.identity.as_ref() == Some(&identity) {
                drop(inner);
                self.register_now().await;
                return;
            }
            if let Some(handle) = inner.supervisor.take() {
                handle.abort();
            }

            info!(profile_id = %identity, "push: connecting");
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            inner.identity = Some(identity.clone());
            inner.control = Some(control_tx);
            self.status.send_replace(ConnectivityState::Connecting);
            let manager = Arc::clone(self);
            inner.supervisor = Some(tokio::spawn(async move {
                manager.supervise(identity, control_rx).await;
            }));
        }

        let mut status = self.status.subscribe();
        let _ = status
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectivityState::Connected(_)
                        | ConnectivityState::Reconnecting { .. }
                        | ConnectivityState::Failed
                )
            })
            .await;
    }

    /// Re-asserts registration before a send. Returns whether the connection was live
    /// within `wait`; the caller proceeds either way.
    pub async fn ensure_registered(self: &Arc<Self>, identity: &ProfileId, wait: Duration) -> bool {
        if self.status().is_connected() {
            return self.register_now().await;
        }

        let running = {
            let inner = self.inner.lock().await;
            inner.identity.as_ref() == Some(identity)
                && inner
                    .supervisor
                    .as_ref()
                    .is_some_and(|handle| !handle.is_finished())
        };
        if !running {
            let manager = Arc::clone(self);
            let identity = identity.clone();
            tokio::spawn(async move { manager.connect(identity).await });
        }

        // A fresh link registers itself before it reports Connected.
        let mut status = self.status.subscribe();
        let connected = matches!(
            timeout(wait, status.wait_for(ConnectivityState::is_connected)).await,
            Ok(Ok(_))
        );
        if !connected {
            warn!(profile_id = %identity, "push: not connected; sending without live registration");
        }
        connected
    }

    pub async fn dispose(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.supervisor.take() {
            handle.abort();
        }
        inner.control = None;
        inner.identity = None;
        drop(inner);
        if self.status.send_replace(ConnectivityState::Disconnected).is_connected() {
            let _ = self
                .events
                .send(TransportEvent::Connectivity(ConnectivityChange::Disconnected));
        }
        info!("push: disposed");
    }

    async fn register_now(&self) -> bool {
        let inner = self.inner.lock().await;
        let (Some(identity), Some(control)) = (inner.identity.clone(), inner.control.as_ref()) else {
            return false;
        };
        debug!(profile_id = %identity, "push: re-registering");
        control.send(PushFrame::RegisterUser(identity)).is_ok()
    }

    async fn supervise(self: Arc<Self>, identity: ProfileId, mut control: mpsc::UnboundedReceiver<PushFrame>) {
        let mut ever_connected = false;
        let mut attempt = 0u32;

        loop {
            let outcome = match self.negotiate().await {
                Ok(link) => {
                    let kind = link.kind;
                    match self.drive(link, &identity, &mut control, ever_connected).await {
                        LinkEnd::RegisterFailed => Err(TransportError::Negotiation {
                            transport: kind.label(),
                            reason: "link closed before registration".into(),
                        }),
                        end => Ok((kind, end)),
                    }
                }
                Err(err) => Err(err),
            };
            match outcome {
                Ok((kind, end)) => {
                    attempt = 0;
                    ever_connected = true;
                    if end == LinkEnd::ControlClosed {
                        return;
                    }
                    self.status.send_replace(ConnectivityState::Reconnecting {
                        attempt: 1,
                        last_error: TransportError::Closed.to_string(),
                    });
                    let _ = self
                        .events
                        .send(TransportEvent::Connectivity(ConnectivityChange::Disconnected));
                    warn!(transport = kind.label(), "push: connection dropped");
                    sleep(self.settings.reconnect_delay(1)).await;
                }
                Err(err) => {
                    attempt += 1;
                    let reason = err.to_string();
                    let _ = self.events.send(TransportEvent::Connectivity(
                        ConnectivityChange::ConnectError(reason.clone()),
                    ));
                    if attempt >= self.settings.max_reconnect_attempts.max(1) {
                        let gave_up = TransportError::Exhausted { attempts: attempt };
                        warn!(profile_id = %identity, "push: {gave_up}");
                        self.status.send_replace(ConnectivityState::Failed);
                        let _ = self.events.send(TransportEvent::Connectivity(
                            ConnectivityChange::GaveUp { attempts: attempt },
                        ));
                        return;
                    }
                    let delay = self.settings.reconnect_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "push: connect failed, backing off: {reason}"
                    );
                    self.status.send_replace(ConnectivityState::Reconnecting {
                        attempt,
                        last_error: reason,
                    });
                    sleep(delay).await;
                }
            }
        }
    }

    /// Preferred transport first, then the degraded one once.
    async fn negotiate(&self) -> Result<PushLink, TransportError> {
        match self.connector.connect(PREFERRED_TRANSPORT).await {
            Ok(link) => Ok(link),
            Err(err) => {
                let Some(fallback) = PREFERRED_TRANSPORT.degraded() else {
                    return Err(err);
                };
                warn!(
                    from = PREFERRED_TRANSPORT.label(),
                    to = fallback.label(),
                    "push: negotiation failed, falling back: {err}"
                );
                self.connector.connect(fallback).await
            }
        }
    }

    async fn drive(
        &self,
        mut link: PushLink,
        identity: &ProfileId,
        control: &mut mpsc::UnboundedReceiver<PushFrame>,
        reconnected: bool,
    ) -> LinkEnd {
        // The server forgets registrations on every drop, so nothing counts as delivered
        // on this link until the identity has been written to it.
        if link
            .outbound
            .send(PushFrame::RegisterUser(identity.clone()))
            .await
            .is_err()
        {
            return LinkEnd::RegisterFailed;
        }
        info!(profile_id = %identity, transport = link.kind.label(), "push: registered");

        self.status.send_replace(ConnectivityState::Connected(link.kind));
        let change = if reconnected {
            ConnectivityChange::Reconnected(link.kind)
        } else {
            ConnectivityChange::Connected(link.kind)
        };
        let _ = self.events.send(TransportEvent::Connectivity(change));

        loop {
            tokio::select! {
                frame = link.inbound.recv() => match frame {
                    Some(PushFrame::ReceiveMessage(message)) => {
                        let _ = self.events.send(TransportEvent::Message(message));
                    }
                    Some(PushFrame::MessageSeen(ack)) => {
                        let _ = self.events.send(TransportEvent::SeenAck(ack));
                    }
                    Some(PushFrame::RegisterUser(_)) => {
                        debug!("push: ignoring inbound registerUser frame");
                    }
                    None => return LinkEnd::Dropped,
                },
                outbound = control.recv() => match outbound {
                    Some(frame) => {
                        if link.outbound.send(frame).await.is_err() {
                            return LinkEnd::Dropped;
                        }
                    }
                    None => return LinkEnd::ControlClosed,
                },
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkEnd {
    RegisterFailed,
    Dropped,
    ControlClosed,
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
