//! Session actors and the hub that routes commands to them.
//!
//! Every live session is one tokio task owning its `SessionState`. Commands
//! arrive through a bounded mailbox and are handled strictly in order, so
//! turn numbering, persistence order and delivery order all follow the
//! mailbox. Sessions never share a lock with each other.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use desk_core::{
    AgentId, ConversationEvent, OperatorFrame, Responder, ResponderError, SessionId, SharedContext,
    UserFrame,
};
use desk_store::{EventStore, SessionRow, StoreError};

use crate::config::DeskConfig;
use crate::connections::ConnectionRegistry;
use crate::error::OrchestratorError;
use crate::session::SessionState;

pub const JOINED_NOTICE: &str = "A human support agent has joined the conversation.";
pub const RELEASED_NOTICE: &str = "You're now back with our automated assistant.";
pub const APOLOGY: &str = "Sorry, something went wrong on our side. Please try again in a moment.";

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub mailbox_capacity: usize,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &DeskConfig) -> Self {
        Self {
            mailbox_capacity: config.server.mailbox_capacity,
            retry_attempts: config.storage.retry_attempts,
            retry_backoff: Duration::from_millis(config.storage.retry_backoff_ms),
        }
    }
}

/// Result of an override enable/release request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct OverrideChange {
    pub human_override: bool,
    /// False when the session was already in the requested mode.
    pub changed: bool,
}

/// Point-in-time view of a live session, including events not yet persisted.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub active_agent: AgentId,
    pub human_override: bool,
    pub resolved: bool,
    pub next_turn: u64,
    pub context: SharedContext,
    pub pending_writes: usize,
    pub transcript: Vec<ConversationEvent>,
}

/// Session metadata plus its full transcript.
#[derive(Clone, Debug, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: SessionRow,
    pub live: bool,
    pub pending_writes: usize,
    pub transcript: Vec<ConversationEvent>,
}

enum SessionCommand {
    UserMessage(String),
    OperatorMessage(String),
    SetOverride {
        enabled: bool,
        reply: oneshot::Sender<OverrideChange>,
    },
    /// `None` flips the current value.
    SetResolved {
        resolved: Option<bool>,
        reply: oneshot::Sender<bool>,
    },
    ToggleFlag {
        turn_id: u64,
        reply: oneshot::Sender<Result<bool, OrchestratorError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

struct Shared {
    store: Arc<dyn EventStore>,
    responder: Arc<dyn Responder>,
    connections: Arc<ConnectionRegistry>,
    settings: OrchestratorSettings,
}

/// Hub entry for one session id.
#[derive(Clone)]
enum Slot {
    Live(mpsc::Sender<SessionCommand>),
    /// The actor is draining after a close; cancelled once it has exited
    /// and the entry is gone.
    Closing(CancellationToken),
}

impl Slot {
    fn live(&self) -> Option<&mpsc::Sender<SessionCommand>> {
        match self {
            Slot::Live(tx) if !tx.is_closed() => Some(tx),
            _ => None,
        }
    }
}

/// Maps session ids to their actor mailboxes; starts actors on demand.
pub struct SessionHub {
    sessions: Arc<DashMap<SessionId, Slot>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    /// Bumped whenever a closed actor's entry is about to be removed.
    retired: Arc<AtomicU64>,
}

impl SessionHub {
    pub fn new(
        store: Arc<dyn EventStore>,
        responder: Arc<dyn Responder>,
        connections: Arc<ConnectionRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            shared: Arc::new(Shared { store, responder, connections, settings }),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            retired: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.shared.store
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.connections
    }

    pub fn is_live(&self, id: &SessionId) -> bool {
        self.sessions.get(id).is_some_and(|slot| slot.live().is_some())
    }

    pub fn live_count(&self) -> usize {
        self.sessions.iter().filter(|slot| slot.live().is_some()).count()
    }

    /// Make sure the session exists and its actor is running.
    pub async fn open(&self, id: &SessionId) -> Result<(), OrchestratorError> {
        self.mailbox(id, true).await.map(|_| ())
    }

    /// Queue an end-user message. Creates the session on first sight.
    pub async fn user_message(&self, id: &SessionId, text: String) -> Result<(), OrchestratorError> {
        self.send(id, true, SessionCommand::UserMessage(text)).await
    }

    /// Queue an operator message; it is relayed to the user as `HumanSupport`.
    pub async fn operator_message(&self, id: &SessionId, text: String) -> Result<(), OrchestratorError> {
        self.send(id, true, SessionCommand::OperatorMessage(text)).await
    }

    pub async fn enable_override(&self, id: &SessionId) -> Result<OverrideChange, OrchestratorError> {
        self.request(id, |reply| SessionCommand::SetOverride { enabled: true, reply })
            .await
    }

    pub async fn release_override(&self, id: &SessionId) -> Result<OverrideChange, OrchestratorError> {
        self.request(id, |reply| SessionCommand::SetOverride { enabled: false, reply })
            .await
    }

    /// Set `resolved`, or flip it when `resolved` is `None`. Returns the new value.
    pub async fn set_resolved(
        &self,
        id: &SessionId,
        resolved: Option<bool>,
    ) -> Result<bool, OrchestratorError> {
        self.request(id, |reply| SessionCommand::SetResolved { resolved, reply })
            .await
    }

    pub async fn toggle_flag(&self, id: &SessionId, turn_id: u64) -> Result<bool, OrchestratorError> {
        self.request(id, |reply| SessionCommand::ToggleFlag { turn_id, reply })
            .await?
    }

    /// Snapshot of a live session; `None` if no actor is running for it.
    pub async fn snapshot(&self, id: &SessionId) -> Result<Option<SessionSnapshot>, OrchestratorError> {
        let Some(tx) = self.live_mailbox(id) else {
            return Ok(None);
        };
        let (reply, rx) = oneshot::channel();
        tx.send(SessionCommand::Snapshot { reply })
            .await
            .map_err(|_| OrchestratorError::SessionClosed(id.clone()))?;
        rx.await
            .map(Some)
            .map_err(|_| OrchestratorError::SessionClosed(id.clone()))
    }

    /// Stored metadata and transcript, overlaid with live state when the
    /// session has a running actor.
    pub async fn describe(&self, id: &SessionId) -> Result<SessionDetail, OrchestratorError> {
        let mut session = self
            .shared
            .store
            .get_session(id)
            .map_err(|e| OrchestratorError::from_lookup(id, e))?;

        match self.snapshot(id).await? {
            Some(snap) => {
                session.active_agent = snap.active_agent;
                session.human_override = snap.human_override;
                session.resolved = snap.resolved;
                session.shared_context = snap.context;
                Ok(SessionDetail {
                    session,
                    live: true,
                    pending_writes: snap.pending_writes,
                    transcript: snap.transcript,
                })
            }
            None => {
                let transcript = self.shared.store.list_events(id)?;
                Ok(SessionDetail { session, live: false, pending_writes: 0, transcript })
            }
        }
    }

    /// Stop the session's actor after flushing its pending writes and mark
    /// the session ended. A later message starts it again from storage.
    ///
    /// The hub entry stays as a tombstone until the actor has exited, so
    /// nothing can hydrate a second actor from a store that is still
    /// missing the first one's writes.
    pub async fn close(&self, id: &SessionId) -> Result<(), OrchestratorError> {
        let done = CancellationToken::new();
        let claimed = match self.sessions.entry(id.clone()) {
            Entry::Occupied(mut entry) => match entry.get().clone() {
                Slot::Closing(other) => Err(other),
                Slot::Live(tx) => {
                    entry.insert(Slot::Closing(done.clone()));
                    Ok(Some(tx))
                }
            },
            Entry::Vacant(_) => Ok(None),
        };

        let tx = match claimed {
            // Someone else is already closing it.
            Err(other) => {
                other.cancelled().await;
                return Ok(());
            }
            Ok(Some(tx)) => tx,
            Ok(None) => {
                self.shared
                    .store
                    .get_session(id)
                    .map_err(|e| OrchestratorError::from_lookup(id, e))?;
                self.shared.store.mark_ended(id)?;
                info!(session_id = %id, "session closed");
                return Ok(());
            }
        };

        let sessions = Arc::clone(&self.sessions);
        let retired = Arc::clone(&self.retired);
        let store = Arc::clone(&self.shared.store);
        let session_id = id.clone();
        // Detached: the tombstone is cleared even if the caller is dropped.
        let finish = self.tracker.spawn(async move {
            let (reply, rx) = oneshot::channel();
            if tx.send(SessionCommand::Close { reply }).await.is_ok() {
                let _ = rx.await;
            }
            tx.closed().await;

            let ended = store.mark_ended(&session_id);
            retired.fetch_add(1, Ordering::SeqCst);
            sessions.remove_if(&session_id, |_, slot| matches!(slot, Slot::Closing(_)));
            done.cancel();
            ended
        });
        finish
            .await
            .map_err(|_| OrchestratorError::SessionClosed(id.clone()))??;
        info!(session_id = %id, "session closed");
        Ok(())
    }

    /// Cancel every actor and wait for their final flush.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.sessions.clear();
        info!("all sessions stopped");
    }

    fn live_mailbox(&self, id: &SessionId) -> Option<mpsc::Sender<SessionCommand>> {
        self.sessions.get(id).and_then(|slot| slot.live().cloned())
    }

    /// The running actor's mailbox, starting the actor if needed. With
    /// `create`, a session unknown to the store is created; without it,
    /// the lookup fails with `UnknownSession`.
    ///
    /// Hydration reads the store without holding the map entry; the entry
    /// is re-checked before the new actor is installed.
    async fn mailbox(&self, id: &SessionId, create: bool) -> Result<mpsc::Sender<SessionCommand>, OrchestratorError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(OrchestratorError::SessionClosed(id.clone()));
            }

            let closing = match self.sessions.get(id).map(|slot| slot.clone()) {
                Some(Slot::Closing(done)) => Some(done),
                Some(slot) => match slot.live() {
                    Some(tx) => return Ok(tx.clone()),
                    None => None,
                },
                None => None,
            };
            if let Some(done) = closing {
                done.cancelled().await;
                continue;
            }

            let retired = self.retired.load(Ordering::SeqCst);
            let state = self.load(id, create)?;

            let entry = self.sessions.entry(id.clone());
            if let Entry::Occupied(existing) = &entry {
                if let Some(tx) = existing.get().live() {
                    return Ok(tx.clone());
                }
                if matches!(existing.get(), Slot::Closing(_)) {
                    continue;
                }
            }
            // A close finished while we were loading; what we read may be stale.
            if self.retired.load(Ordering::SeqCst) != retired {
                continue;
            }
            let tx = self.spawn(id, state);
            entry.insert(Slot::Live(tx.clone()));
            debug!(session_id = %id, "session actor started");
            return Ok(tx);
        }
    }

    fn spawn(&self, id: &SessionId, state: SessionState) -> mpsc::Sender<SessionCommand> {
        let (tx, rx) = mpsc::channel(self.shared.settings.mailbox_capacity);
        let actor = SessionOrchestrator {
            state,
            mailbox: rx,
            shared: Arc::clone(&self.shared),
            cancel: self.cancel.child_token(),
            pending: VecDeque::new(),
        };
        let span = info_span!("session", session_id = %id);
        self.tracker.spawn(actor.run().instrument(span));
        tx
    }

    fn load(&self, id: &SessionId, create: bool) -> Result<SessionState, OrchestratorError> {
        let store = &self.shared.store;
        let row = if create {
            store.ensure_session(id)?
        } else {
            store
                .get_session(id)
                .map_err(|e| OrchestratorError::from_lookup(id, e))?
        };
        let events = store.list_events(id)?;
        if !events.is_empty() {
            debug!(session_id = %id, events = events.len(), "session hydrated from store");
        }
        Ok(SessionState::restore(&row, events))
    }

    async fn send(&self, id: &SessionId, create: bool, command: SessionCommand) -> Result<(), OrchestratorError> {
        let tx = self.mailbox(id, create).await?;
        tx.send(command)
            .await
            .map_err(|_| OrchestratorError::SessionClosed(id.clone()))
    }

    /// Request/response command against an existing session.
    async fn request<T>(
        &self,
        id: &SessionId,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(id, false, make(reply)).await?;
        rx.await.map_err(|_| OrchestratorError::SessionClosed(id.clone()))
    }
}

struct SessionOrchestrator {
    state: SessionState,
    mailbox: mpsc::Receiver<SessionCommand>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    /// Events already applied and broadcast but not yet in the store, oldest first.
    pending: VecDeque<ConversationEvent>,
}

impl SessionOrchestrator {
    async fn run(mut self) {
        loop {
            let command = tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.mailbox.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            if let SessionCommand::Close { reply } = command {
                // Commands queued behind the close still belong to this actor.
                self.mailbox.close();
                while let Some(queued) = self.mailbox.recv().await {
                    self.handle(queued).await;
                }
                self.flush_pending().await;
                let _ = reply.send(());
                break;
            }
            self.handle(command).await;
        }

        self.flush_pending().await;
        if !self.pending.is_empty() {
            error!(
                session_id = %self.state.id(),
                pending = self.pending.len(),
                "session stopped with unpersisted events"
            );
        }
        debug!(session_id = %self.state.id(), "session actor stopped");
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::UserMessage(text) => self.on_user_message(&text).await,
            SessionCommand::OperatorMessage(text) => self.on_operator_message(&text).await,
            SessionCommand::SetOverride { enabled, reply } => {
                let change = self.set_override(enabled).await;
                let _ = reply.send(change);
            }
            SessionCommand::SetResolved { resolved, reply } => {
                let value = resolved.unwrap_or(!self.state.resolved());
                if self.state.set_resolved(value) {
                    self.write_meta("set_resolved", |store, id| store.set_resolved(id, value));
                    info!(session_id = %self.state.id(), resolved = value, "resolved changed");
                }
                let _ = reply.send(value);
            }
            SessionCommand::ToggleFlag { turn_id, reply } => {
                let _ = reply.send(self.toggle_flag(turn_id));
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn on_user_message(&mut self, text: &str) {
        let (event, forward) = self.state.record_user_message(text);
        self.emit(event).await;
        if !forward {
            debug!(session_id = %self.state.id(), "human override active, responder skipped");
            return;
        }

        let agent = self.state.active_agent();
        let was_resolved = self.state.resolved();
        let request = self.state.responder_request();
        let responder = Arc::clone(&self.shared.responder);
        let span = info_span!(
            "responder_turn",
            session_id = %self.state.id(),
            agent = %agent,
            responder = responder.name()
        );

        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!(session_id = %self.state.id(), "shutdown while awaiting responder");
                return;
            }
            result = responder.respond(request).instrument(span) => result,
        };

        match result.and_then(|output| self.state.apply_responder_output(output)) {
            Ok(events) => {
                for event in events {
                    self.emit(event).await;
                }
                let next = self.state.active_agent();
                if next != agent {
                    info!(session_id = %self.state.id(), from = %agent, to = %next, "agent handoff");
                }
                let context = self.state.context().clone();
                self.write_meta("record_agent_state", |store, id| {
                    store.record_agent_state(id, next, &context)
                });
                if self.state.resolved() && !was_resolved {
                    self.write_meta("set_resolved", |store, id| store.set_resolved(id, true));
                }
            }
            Err(err) => self.on_responder_failure(agent, err).await,
        }
    }

    async fn on_responder_failure(&mut self, agent: AgentId, err: ResponderError) {
        warn!(
            session_id = %self.state.id(),
            agent = %agent,
            error_kind = err.error_kind(),
            retryable = err.is_retryable(),
            error = %err,
            "responder failed"
        );
        let note = self
            .state
            .record_system(format!("Responder failed ({}): {err}", err.error_kind()));
        self.emit(note).await;
        self.shared
            .connections
            .send_to_user(self.state.id(), &UserFrame::system(APOLOGY));
    }

    async fn on_operator_message(&mut self, text: &str) {
        if !self.state.human_override() {
            debug!(session_id = %self.state.id(), "operator message without override");
        }
        let event = self.state.record_operator_message(text);
        self.emit(event).await;
    }

    async fn set_override(&mut self, enabled: bool) -> OverrideChange {
        let event = if enabled {
            self.state.enable_override()
        } else {
            self.state.release_override()
        };
        let Some(event) = event else {
            return OverrideChange { human_override: enabled, changed: false };
        };

        self.write_meta("set_override", |store, id| store.set_override(id, enabled));
        self.emit(event).await;
        let notice = if enabled { JOINED_NOTICE } else { RELEASED_NOTICE };
        self.shared
            .connections
            .send_to_user(self.state.id(), &UserFrame::system(notice));
        info!(session_id = %self.state.id(), human_override = enabled, "human override changed");
        OverrideChange { human_override: enabled, changed: true }
    }

    fn toggle_flag(&mut self, turn_id: u64) -> Result<bool, OrchestratorError> {
        if let Some(parked) = self.pending.iter_mut().find(|e| e.turn_id == turn_id) {
            parked.flagged = !parked.flagged;
            let flagged = parked.flagged;
            self.state.set_flag(turn_id, flagged);
            return Ok(flagged);
        }
        match self.shared.store.toggle_flag(self.state.id(), turn_id) {
            Ok(flagged) => {
                self.state.set_flag(turn_id, flagged);
                Ok(flagged)
            }
            Err(StoreError::NotFound(_)) => Err(OrchestratorError::UnknownTurn {
                session_id: self.state.id().clone(),
                turn_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.state.id().clone(),
            active_agent: self.state.active_agent(),
            human_override: self.state.human_override(),
            resolved: self.state.resolved(),
            next_turn: self.state.next_turn(),
            context: self.state.context().clone(),
            pending_writes: self.pending.len(),
            transcript: self.state.transcript().to_vec(),
        }
    }

    /// Persist, then deliver: the user sees messages and handoffs, the
    /// operator sees everything.
    async fn emit(&mut self, event: ConversationEvent) {
        self.pending.push_back(event.clone());
        self.flush_pending().await;

        let connections = &self.shared.connections;
        if let Some(frame) = UserFrame::from_event(&event) {
            connections.send_to_user(self.state.id(), &frame);
        }
        connections.send_to_operator(self.state.id(), &OperatorFrame::from(event));
    }

    /// Write parked events in order; stop at the first one that still fails.
    async fn flush_pending(&mut self) {
        while let Some(event) = self.pending.front() {
            match self.write_with_retry(event).await {
                Ok(()) => {
                    self.pending.pop_front();
                }
                Err(e) => {
                    error!(
                        session_id = %self.state.id(),
                        turn_id = event.turn_id,
                        pending = self.pending.len(),
                        error = %e,
                        "event write failed, parked for a later flush"
                    );
                    break;
                }
            }
        }
    }

    async fn write_with_retry(&self, event: &ConversationEvent) -> Result<(), StoreError> {
        let attempts = self.shared.settings.retry_attempts.max(1);
        let mut backoff = self.shared.settings.retry_backoff;
        let mut attempt = 1;
        loop {
            match self.shared.store.append_event(event) {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict(reason)) => return self.confirm_stored(event, reason),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        session_id = %event.session_id,
                        turn_id = event.turn_id,
                        attempt,
                        error = %e,
                        "event write failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A turn that is already taken only counts as written when the stored
    /// row is this very event, i.e. an earlier attempt landed after
    /// reporting failure. Anything else is a second writer; keep it parked.
    fn confirm_stored(&self, event: &ConversationEvent, reason: String) -> Result<(), StoreError> {
        let stored = self.shared.store.get_event(&event.session_id, event.turn_id)?;
        if stored.role == event.role && stored.agent_name == event.agent_name && stored.body == event.body {
            debug!(session_id = %event.session_id, turn_id = event.turn_id, "event already stored");
            return Ok(());
        }
        error!(
            session_id = %event.session_id,
            turn_id = event.turn_id,
            stored_kind = stored.body.kind(),
            "turn already holds a different event"
        );
        Err(StoreError::Conflict(reason))
    }

    fn write_meta(&self, op: &'static str, write: impl FnOnce(&dyn EventStore, &SessionId) -> Result<(), StoreError>) {
        if let Err(e) = write(self.shared.store.as_ref(), self.state.id()) {
            error!(session_id = %self.state.id(), op, error = %e, "session metadata write failed");
        }
    }
}
