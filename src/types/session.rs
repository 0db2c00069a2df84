use std::collections::HashSet;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{JobId, SessionId, TubeName};

/// What a session's reserve call is ultimately waiting for.
#[derive(Debug)]
pub enum ReserveDelivery {
    Job(JobId),
    TimedOut,
}

/// One client connection's view of the engine.
///
/// A session is created on that connection's first command and destroyed
/// when the connection closes (or `quit` is issued); destruction releases
/// every job it still holds back to `ready`.
pub struct Session {
    pub id: SessionId,
    pub kind: SessionKind,
    pub used_tube: TubeName,
    pub watched_tubes: HashSet<TubeName>,
    pub state: SessionState,
    /// Set while `state == Waiting`; the wall time the pending reserve call
    /// expires, or `None` for a reserve with no timeout.
    pub deadline_at: Option<Instant>,
    /// The delivery channel for a pending reserve. Consumed (taken) the
    /// moment either a dispatch or the reserve-timeout sweep fires it.
    pub waiting_tx: Option<oneshot::Sender<ReserveDelivery>>,
    pub reserved_jobs: HashSet<JobId>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionKind {
    Unknown,
    Producer,
    Worker,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Waiting,
    Working,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let mut watched_tubes = HashSet::new();
        watched_tubes.insert(TubeName::default());

        Self {
            id,
            kind: SessionKind::Unknown,
            used_tube: TubeName::default(),
            watched_tubes,
            state: SessionState::Idle,
            deadline_at: None,
            waiting_tx: None,
            reserved_jobs: HashSet::new(),
        }
    }
}
