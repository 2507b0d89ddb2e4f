use std::fmt;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use desk_core::{ConnectionId, OperatorFrame, SessionId, UserFrame};

/// Which side of a session a socket serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    User,
    Operator,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Operator => "operator",
        })
    }
}

struct Handle {
    id: ConnectionId,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct Slots {
    user: Option<Handle>,
    operator: Option<Handle>,
}

impl Slots {
    fn slot(&mut self, channel: Channel) -> &mut Option<Handle> {
        match channel {
            Channel::User => &mut self.user,
            Channel::Operator => &mut self.operator,
        }
    }

    fn is_empty(&self) -> bool {
        self.user.is_none() && self.operator.is_none()
    }
}

/// At most one end-user and one operator connection per session.
///
/// Each handle is the sending half of a bounded queue drained by the
/// connection's writer task. Sends never block: a full queue drops the frame.
pub struct ConnectionRegistry {
    sessions: DashMap<SessionId, Slots>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_send_queue,
        }
    }

    /// Bind a new connection, replacing any previous one on that channel.
    /// The replaced connection's queue closes, which ends its writer.
    pub fn bind(&self, session_id: &SessionId, channel: Channel) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let previous = self
            .sessions
            .entry(session_id.clone())
            .or_default()
            .slot(channel)
            .replace(Handle { id: id.clone(), tx });
        if let Some(old) = previous {
            tracing::info!(
                session_id = %session_id,
                channel = %channel,
                replaced = %old.id,
                "connection replaced"
            );
        }
        (id, rx)
    }

    /// Remove the handle only if it is still `conn_id`. Returns whether
    /// anything was removed.
    pub fn unbind(&self, session_id: &SessionId, channel: Channel, conn_id: &ConnectionId) -> bool {
        let removed = match self.sessions.get_mut(session_id) {
            Some(mut slots) => {
                let slot = slots.slot(channel);
                if slot.as_ref().is_some_and(|h| &h.id == conn_id) {
                    *slot = None;
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if removed {
            self.sessions.remove_if(session_id, |_, slots| slots.is_empty());
        }
        removed
    }

    pub fn is_bound(&self, session_id: &SessionId, channel: Channel) -> bool {
        self.sessions.get(session_id).is_some_and(|slots| match channel {
            Channel::User => slots.user.is_some(),
            Channel::Operator => slots.operator.is_some(),
        })
    }

    pub fn send_to_user(&self, session_id: &SessionId, frame: &UserFrame) -> bool {
        self.send(session_id, Channel::User, frame)
    }

    pub fn send_to_operator(&self, session_id: &SessionId, frame: &OperatorFrame) -> bool {
        self.send(session_id, Channel::Operator, frame)
    }

    /// Fire-and-forget. No-op when nothing is bound.
    pub fn send<T: Serialize>(&self, session_id: &SessionId, channel: Channel, frame: &T) -> bool {
        let Some(tx) = self.sender(session_id, channel) else {
            return false;
        };
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(session_id = %session_id, channel = %channel, error = %e, "frame serialization failed");
                return false;
            }
        };
        match tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    session_id = %session_id,
                    channel = %channel,
                    msg_len = msg.len(),
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(session_id = %session_id, channel = %channel, "connection closed, dropping frame");
                false
            }
        }
    }

    fn sender(&self, session_id: &SessionId, channel: Channel) -> Option<mpsc::Sender<String>> {
        let slots = self.sessions.get(session_id)?;
        let handle = match channel {
            Channel::User => slots.user.as_ref(),
            Channel::Operator => slots.operator.as_ref(),
        }?;
        Some(handle.tx.clone())
    }

    /// Sessions with at least one bound connection.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|slots| usize::from(slots.user.is_some()) + usize::from(slots.operator.is_some()))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::from_raw("abc123")
    }

    #[test]
    fn bind_and_unbind() {
        let registry = ConnectionRegistry::new(8);
        let (user, _urx) = registry.bind(&sid(), Channel::User);
        let (op, _orx) = registry.bind(&sid(), Channel::Operator);
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.connection_count(), 2);

        assert!(registry.unbind(&sid(), Channel::User, &user));
        assert!(!registry.is_bound(&sid(), Channel::User));
        assert!(registry.is_bound(&sid(), Channel::Operator));

        assert!(registry.unbind(&sid(), Channel::Operator, &op));
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn unbind_is_idempotent() {
        let registry = ConnectionRegistry::new(8);
        let (user, _rx) = registry.bind(&sid(), Channel::User);
        assert!(registry.unbind(&sid(), Channel::User, &user));
        assert!(!registry.unbind(&sid(), Channel::User, &user));
        assert!(!registry.unbind(&SessionId::from_raw("nope"), Channel::User, &user));
    }

    #[tokio::test]
    async fn rebind_replaces_and_stale_unbind_is_ignored() {
        let registry = ConnectionRegistry::new(8);
        let (first, mut first_rx) = registry.bind(&sid(), Channel::User);
        let (second, mut second_rx) = registry.bind(&sid(), Channel::User);
        assert_ne!(first, second);

        // The old queue is closed once its sender is replaced.
        assert!(first_rx.recv().await.is_none());

        assert!(!registry.unbind(&sid(), Channel::User, &first));
        assert!(registry.is_bound(&sid(), Channel::User));

        assert!(registry.send_to_user(&sid(), &UserFrame::system("hi")));
        let text = second_rx.recv().await.unwrap();
        assert_eq!(text, r#"{"type":"system","content":"hi"}"#);
    }

    #[test]
    fn send_without_binding_is_a_noop() {
        let registry = ConnectionRegistry::new(8);
        assert!(!registry.send_to_user(&sid(), &UserFrame::system("lost")));
        let (_op, _rx) = registry.bind(&sid(), Channel::Operator);
        assert!(!registry.send_to_user(&sid(), &UserFrame::system("still lost")));
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let registry = ConnectionRegistry::new(2);
        let (_id, _rx) = registry.bind(&sid(), Channel::User);
        assert!(registry.send_to_user(&sid(), &UserFrame::system("1")));
        assert!(registry.send_to_user(&sid(), &UserFrame::system("2")));
        assert!(!registry.send_to_user(&sid(), &UserFrame::system("3")));
    }

    #[test]
    fn closed_receiver_reports_failure() {
        let registry = ConnectionRegistry::new(2);
        let (_id, rx) = registry.bind(&sid(), Channel::Operator);
        drop(rx);
        assert!(!registry.send(&sid(), Channel::Operator, &UserFrame::system("gone")));
    }

    #[test]
    fn channels_are_independent() {
        let registry = ConnectionRegistry::new(4);
        let (_u, mut user_rx) = registry.bind(&sid(), Channel::User);
        let (_o, mut op_rx) = registry.bind(&sid(), Channel::Operator);
        registry.send_to_user(&sid(), &UserFrame::system("to user"));
        assert!(user_rx.try_recv().is_ok());
        assert!(op_rx.try_recv().is_err());
    }
}
