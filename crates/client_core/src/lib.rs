use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use shared::domain::{ConversationHandle, ConversationId, Message, MessageId, ProfileId, SeenRecord};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, info, warn};

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod guard;
pub mod pagination;
pub mod seen;
pub mod send;
pub mod store;
pub mod transport;

use api::{ChatApi, HistoryRequest, HttpChatApi, SeenRequest};
use config::SyncSettings;
use connection::{ConnectionManager, ConnectivityChange, ConnectivityState, TransportEvent};
use error::{SyncError, SyncResult};
use guard::{ConversationSwitchGuard, ConversationTicket};
use pagination::{BeginLoad, PaginationController, ScrollAnchor, ScrollMetrics};
use seen::{SeenTracker, VisibilityChange};
use send::{AttachmentUpload, SendPipeline};
use store::{MessageStore, PushOutcome};
use transport::{HttpPushConnector, PushConnector};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    TimelineUpdated {
        conversation: ConversationId,
        messages: Vec<Message>,
    },
    Connectivity(ConnectivityChange),
    SendFailed {
        provisional_id: MessageId,
        reason: String,
    },
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded {
        inserted: usize,
        duplicates: usize,
        exhausted: bool,
        /// Apply once the merged page has been rendered to keep the old top row in place.
        anchor: Option<ScrollAnchor>,
    },
    AlreadyLoading,
    Exhausted,
    /// The conversation changed while the page was in flight; nothing was merged.
    Stale,
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn start(&self);
    async fn switch_to(&self, handle: ConversationHandle) -> SyncResult<LoadOutcome>;
    async fn load_older(&self, scroll: Option<ScrollMetrics>) -> SyncResult<LoadOutcome>;
    async fn send(&self, body: &str, attachment: Option<AttachmentUpload>) -> SyncResult<Message>;
    async fn report_visibility(&self, message_id: &MessageId, visible_fraction: f32);
    async fn timeline(&self) -> Vec<Message>;
    async fn dispose(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

struct SyncState {
    store: MessageStore,
    pagination: PaginationController,
    sends: SendPipeline,
    seen: SeenTracker,
    handle: Option<ConversationHandle>,
}

/// Keeps the active conversation's timeline in sync with history, live pushes and the
/// viewer's own sends.
pub struct SyncClient {
    settings: SyncSettings,
    viewer: ProfileId,
    api: Arc<dyn ChatApi>,
    connection: Arc<ConnectionManager>,
    guard: ConversationSwitchGuard,
    inner: Mutex<SyncState>,
    pump: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(
        viewer: ProfileId,
        settings: SyncSettings,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn PushConnector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = SyncState {
            store: MessageStore::new(viewer.clone()),
            pagination: PaginationController::new(settings.first_page_size, settings.older_page_size),
            sends: SendPipeline::new(settings.max_attachment_bytes, settings.settle_window()),
            seen: SeenTracker::new(
                viewer.clone(),
                settings.seen_visible_fraction,
                settings.seen_dwell(),
            ),
            handle: None,
        };
        Arc::new(Self {
            connection: ConnectionManager::init(connector, &settings),
            settings,
            viewer,
            api,
            guard: ConversationSwitchGuard::new(),
            inner: Mutex::new(state),
            pump: Mutex::new(None),
            events,
        })
    }

    /// Client backed by the HTTP endpoints and the WebSocket/long-polling push transports.
    pub fn with_http(viewer: ProfileId, settings: SyncSettings) -> Result<Arc<Self>> {
        let api = Arc::new(HttpChatApi::new(&settings)?);
        let connector = Arc::new(HttpPushConnector::new(&settings)?);
        Ok(Self::new(viewer, settings, api, connector))
    }

    pub fn viewer(&self) -> &ProfileId {
        &self.viewer
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.connection.status()
    }

    pub async fn timeline(&self) -> Vec<Message> {
        self.inner.lock().await.store.snapshot()
    }

    pub async fn active_conversation(&self) -> Option<ConversationHandle> {
        self.inner.lock().await.handle.clone()
    }

    /// Starts the inbound event pump, then connects. Safe to call again.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut pump = self.pump.lock().await;
            if pump.as_ref().is_some_and(|handle| !handle.is_finished()) {
                drop(pump);
                self.connection.connect(self.viewer.clone()).await;
                return;
            }
            let mut transport = self.connection.subscribe();
            let client = Arc::clone(self);
            *pump = Some(tokio::spawn(async move {
                loop {
                    match transport.recv().await {
                        Ok(event) => client.handle_transport_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "sync: push events lagged");
                            let _ = client.events.send(ClientEvent::Error(format!(
                                "{skipped} push events were skipped"
                            )));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        info!(profile_id = %self.viewer, "sync: started");
        self.connection.connect(self.viewer.clone()).await;
    }

    pub async fn dispose(&self) {
        if let Some(handle) = self.pump.lock().await.take() {
            handle.abort();
        }
        self.connection.dispose().await;
        info!(profile_id = %self.viewer, "sync: disposed");
    }

    /// Makes `handle` the active conversation and loads its first history page. Every
    /// operation issued for the previous conversation is stale from here on.
    pub async fn switch_to(&self, handle: ConversationHandle) -> SyncResult<LoadOutcome> {
        let conversation = handle.conversation_id.clone();
        let ticket = {
            let mut state = self.inner.lock().await;
            let ticket = self.guard.switch_to(conversation.clone());
            state.store.replace_active_conversation(conversation.clone());
            state.pagination.reset(ticket.clone());
            state.sends.discard_pending();
            state.seen.reset();
            state.handle = Some(handle);
            self.emit_timeline(&state);
            ticket
        };
        info!(conversation = %conversation, epoch = ticket.epoch, "sync: switched conversation");

        if conversation.is_chatbot() {
            return Ok(LoadOutcome::Exhausted);
        }
        self.load_older(None).await
    }

    /// Fetches the next older page of the active conversation.
    pub async fn load_older(&self, scroll: Option<ScrollMetrics>) -> SyncResult<LoadOutcome> {
        let (request, peer) = {
            let mut state = self.inner.lock().await;
            let ticket = self.guard.ticket();
            let Some(conversation) = ticket.conversation.as_ref() else {
                return Err(SyncError::NoActiveConversation);
            };
            let Some(peer) = conversation.peer().cloned() else {
                return Ok(LoadOutcome::Exhausted);
            };
            match state.pagination.begin(&ticket, scroll) {
                BeginLoad::Request(request) => (request, peer),
                BeginLoad::AlreadyLoading => return Ok(LoadOutcome::AlreadyLoading),
                BeginLoad::Exhausted => return Ok(LoadOutcome::Exhausted),
                BeginLoad::Stale => return Ok(LoadOutcome::Stale),
            }
        };

        let result = self
            .api
            .fetch_history(HistoryRequest {
                peer: peer.clone(),
                viewer: self.viewer.clone(),
                query: request.query,
            })
            .await;

        let mut state = self.inner.lock().await;
        if !self.guard.is_current(&request.ticket) {
            debug!(
                conversation = %peer,
                page = request.query.page,
                "sync: discarding history page for an inactive conversation"
            );
            return Ok(LoadOutcome::Stale);
        }

        match result {
            Ok(page) => {
                let returned = page.messages.len();
                let merged = state.store.merge_fetched(page.messages);
                let exhausted = state
                    .pagination
                    .complete(&request, returned, page.total_pages)
                    .unwrap_or(true);
                if merged.duplicates > 0 {
                    debug!(duplicates = merged.duplicates, "sync: history page overlapped timeline");
                }
                self.emit_timeline(&state);
                Ok(LoadOutcome::Loaded {
                    inserted: merged.inserted,
                    duplicates: merged.duplicates,
                    exhausted,
                    anchor: request.anchor,
                })
            }
            Err(err) => {
                state.pagination.fail(&request);
                warn!(conversation = %peer, page = request.query.page, "sync: history fetch failed: {err}");
                Err(err)
            }
        }
    }

    /// Sends a message to the active peer. The optimistic entry appears immediately and is
    /// swapped in place for the confirmed record, or removed if the send fails.
    pub async fn send(&self, body: &str, attachment: Option<AttachmentUpload>) -> SyncResult<Message> {
        let (ticket, prepared) = {
            let mut state = self.inner.lock().await;
            let ticket = self.guard.ticket();
            let Some(conversation) = ticket.conversation.as_ref() else {
                return Err(SyncError::NoActiveConversation);
            };
            let Some(peer) = conversation.peer().cloned() else {
                return Err(SyncError::LocalOnlyConversation(conversation.to_string()));
            };
            let prepared = state
                .sends
                .prepare(&peer, &self.viewer, body, attachment, Utc::now())?;
            state.store.insert_optimistic(prepared.optimistic.clone());
            self.emit_timeline(&state);
            (ticket, prepared)
        };
        let provisional = prepared.pending.provisional_id.clone();

        self.connection
            .ensure_registered(&self.viewer, self.settings.register_wait())
            .await;
        let result = self.api.send_message(prepared.request).await;

        let mut state = self.inner.lock().await;
        let current = self.guard.is_current(&ticket);
        match result {
            Ok(confirmed) => {
                state.sends.confirm(&provisional, &confirmed.id, Instant::now());
                if current {
                    let outcome = state.store.reconcile(&provisional, confirmed.clone());
                    debug!(message_id = %confirmed.id, ?outcome, "sync: send confirmed");
                    self.emit_timeline(&state);
                } else {
                    debug!(message_id = %confirmed.id, "sync: send confirmed after conversation switch");
                }
                Ok(confirmed)
            }
            Err(err) => {
                state.sends.fail(&provisional);
                warn!(provisional_id = %provisional, "sync: send failed: {err}");
                if current {
                    state.store.remove(&provisional);
                    self.emit_timeline(&state);
                    let _ = self.events.send(ClientEvent::SendFailed {
                        provisional_id: provisional,
                        reason: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    /// Feeds a visibility sample from the renderer. A message that stays visible for the
    /// dwell time is acknowledged once.
    pub async fn report_visibility(self: &Arc<Self>, message_id: &MessageId, visible_fraction: f32) {
        let now = Instant::now();
        let ticket = self.guard.ticket();
        let (claimed, wait_for_dwell) = {
            let mut state = self.inner.lock().await;
            let change = state.seen.observe(message_id, visible_fraction, now);
            let Some(message) = state.store.get(message_id).cloned() else {
                return;
            };
            match state.seen.claim(&message, now) {
                Some(record) => (Some(record), false),
                None => {
                    let pending =
                        change == VisibilityChange::Entered && state.seen.is_eligible(&message);
                    (None, pending)
                }
            }
        };

        if let Some(record) = claimed {
            self.acknowledge(&ticket, record).await;
        } else if wait_for_dwell {
            let client = Arc::clone(self);
            let message_id = message_id.clone();
            let dwell = self.settings.seen_dwell();
            tokio::spawn(async move {
                sleep(dwell).await;
                client.claim_after_dwell(ticket, message_id).await;
            });
        }
    }

    async fn claim_after_dwell(&self, ticket: ConversationTicket, message_id: MessageId) {
        if !self.guard.is_current(&ticket) {
            return;
        }
        let claimed = {
            let mut state = self.inner.lock().await;
            let Some(message) = state.store.get(&message_id).cloned() else {
                return;
            };
            state.seen.claim(&message, Instant::now())
        };
        if let Some(record) = claimed {
            self.acknowledge(&ticket, record).await;
        }
    }

    async fn acknowledge(&self, ticket: &ConversationTicket, record: SeenRecord) {
        let SeenRecord {
            message_id,
            observed_by,
            observed_at,
        } = record;
        debug!(message_id = %message_id, %observed_at, "seen: acknowledging");
        let result = self
            .api
            .mark_seen(SeenRequest {
                message_id: message_id.clone(),
                viewer: observed_by,
            })
            .await;
        match result {
            Ok(()) => {
                let mut state = self.inner.lock().await;
                if self.guard.is_current(ticket) && state.store.mark_seen(&message_id) {
                    self.emit_timeline(&state);
                }
            }
            Err(err) => debug!(message_id = %message_id, "seen: acknowledgement dropped: {err}"),
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => {
                let mut state = self.inner.lock().await;
                let pushed_id = message
                    .message_id
                    .as_deref()
                    .filter(|id| !id.is_empty())
                    .map(MessageId::from);
                if let Some(id) = pushed_id {
                    if state.sends.is_settling(&id, Instant::now()) {
                        debug!(message_id = %id, "sync: push echo inside settling window");
                        return;
                    }
                }
                match state.store.apply_pushed(message) {
                    PushOutcome::Applied(id) => {
                        debug!(message_id = %id, "sync: applied pushed message");
                        self.emit_timeline(&state);
                    }
                    PushOutcome::Malformed(reason) => warn!("sync: dropping malformed push: {reason}"),
                    outcome => debug!(?outcome, "sync: push not applied"),
                }
            }
            TransportEvent::SeenAck(ack) => {
                let mut state = self.inner.lock().await;
                if state.store.mark_seen(&MessageId::new(ack.message_id)) {
                    self.emit_timeline(&state);
                }
            }
            TransportEvent::Connectivity(change) => {
                let _ = self.events.send(ClientEvent::Connectivity(change));
            }
        }
    }

    fn emit_timeline(&self, state: &SyncState) {
        let Some(conversation) = state.store.active().cloned() else {
            return;
        };
        let _ = self.events.send(ClientEvent::TimelineUpdated {
            conversation,
            messages: state.store.snapshot(),
        });
    }
}

#[async_trait]
impl ClientHandle for Arc<SyncClient> {
    async fn start(&self) {
        SyncClient::start(self).await
    }

    async fn switch_to(&self, handle: ConversationHandle) -> SyncResult<LoadOutcome> {
        SyncClient::switch_to(self, handle).await
    }

    async fn load_older(&self, scroll: Option<ScrollMetrics>) -> SyncResult<LoadOutcome> {
        SyncClient::load_older(self, scroll).await
    }

    async fn send(&self, body: &str, attachment: Option<AttachmentUpload>) -> SyncResult<Message> {
        SyncClient::send(self, body, attachment).await
    }

    async fn report_visibility(&self, message_id: &MessageId, visible_fraction: f32) {
        SyncClient::report_visibility(self, message_id, visible_fraction).await
    }

    async fn timeline(&self) -> Vec<Message> {
        SyncClient::timeline(self).await
    }

    async fn dispose(&self) {
        SyncClient::dispose(self).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        SyncClient::subscribe_events(self)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
