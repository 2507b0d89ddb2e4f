use desk_core::SessionId;
use desk_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("session {session_id} has no turn {turn_id}")]
    UnknownTurn { session_id: SessionId, turn_id: u64 },

    /// The session actor stopped before it could take the command.
    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// Stable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownSession(_) | Self::UnknownTurn { .. } => "NOT_FOUND",
            Self::SessionClosed(_) => "SESSION_CLOSED",
            Self::Store(_) => "STORAGE_ERROR",
        }
    }

    /// Map a store lookup miss onto the session it was about.
    pub(crate) fn from_lookup(session_id: &SessionId, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::UnknownSession(session_id.clone()),
            other => Self::Store(other),
        }
    }
}
