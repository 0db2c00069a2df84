use tokio::time::Instant;

use super::states::JobState;
use super::{JobId, SessionId, TubeName};

/// A single unit of work submitted by a producer and eventually consumed by
/// a worker.
///
/// `reserver` is a back-pointer, not an ownership edge: jobs are owned
/// solely by [`crate::engine::Engine`]'s jobs map, and a session owns
/// nothing. It exists so `release`/`bury`/`touch`/`delete` can check that
/// the caller is the current holder of the reservation.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub tube: TubeName,
    pub priority: u32,
    pub delay_secs: u32,
    pub ttr_secs: u32,
    pub body: Vec<u8>,
    pub state: JobState,
    pub created_at: Instant,
    /// Meaning depends on `state`: the wall time a delayed job becomes
    /// ready, or the wall time a reservation's TTR expires. Unused (and left
    /// `None`) in the `Ready`/`Buried` states.
    pub deadline_at: Option<Instant>,
    pub reserver: Option<SessionId>,
    pub reserves: u32,
    pub timeouts: u32,
    pub releases: u32,
    pub buries: u32,
    pub kicks: u32,
}

/// Jobs with priority below this threshold are reported as "urgent" in
/// stats, per the beanstalkd convention.
pub const URGENT_THRESHOLD: u32 = 1024;

impl Job {
    pub fn is_urgent(&self) -> bool {
        self.priority < URGENT_THRESHOLD
    }

    /// A TTR of zero means "no expiry": such a reservation must never be
    /// picked up by the TTR-expiry sweep.
    pub fn ttr_is_infinite(&self) -> bool {
        self.ttr_secs == 0
    }
}
