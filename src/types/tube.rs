use std::collections::{BTreeSet, VecDeque};

use serde::Serialize;
use tokio::time::Instant;

use super::{JobId, SessionId, TubeName};

// Required tube functionality:
// * State transitions:
//   * Reserve by ID or by head of tube.
//   * Release by ID.
//   * Bury/unbury by ID.
//   * Touch by ID.
//   * Delayed -> Ready.
// * Meta:
//   * Count jobs in the tube by state.
//   * Get job stats or data by ID.
// NB: reserve by ID, delete are global operations that can be performed
// regardless of the queue being watched by the client.
// NB: bury and touch can be executed regardless of the current watch set,
// provided the client reserved that particular job.

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TubeStats {
    /// number of jobs in ready state with priority < 1024
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    /// number of jobs in ready state
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    /// number of jobs reserved by clients
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    /// number of jobs in delayed state
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    /// number of jobs in buried state
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,
    /// total jobs created in this tube
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    /// number of clients that have `use`d this queue
    #[serde(rename = "current-using")]
    pub current_using: u64,
    /// number of clients that have `watch`ed this queue and are waiting on a
    /// `reserve`
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    /// number of clients that have `watch`ed this queue
    #[serde(rename = "current-watching")]
    pub current_watching: u64,
    /// number of seconds this queue has been paused for in total
    pub pause: u32,
    /// number of `delete` commands issued for this tube
    #[serde(rename = "cmd-delete")]
    pub cmd_delete: u64,
    /// number of `pause-tube` commands issued for this tube
    #[serde(rename = "cmd-pause-tube")]
    pub cmd_pause_tube: u64,
}

/// A named, isolated queue. Ready/delayed jobs are kept in ordered sets
/// keyed so that the natural `BTreeSet` ordering matches the spec's
/// selection rule; buried jobs and waiting sessions are kept in arrival
/// order in `VecDeque`s, since both are genuinely FIFO structures with no
/// need for priority ordering.
#[derive(Debug, Default)]
pub struct Tube {
    pub name: TubeName,
    /// (priority, id) — lowest sorts first; ties break on lowest id.
    ready_set: BTreeSet<(u32, u64)>,
    /// (deadline, id).
    delay_set: BTreeSet<(Instant, u64)>,
    buried_list: VecDeque<JobId>,
    pub waiting_list: VecDeque<SessionId>,
    pub paused: bool,
    pub pause_deadline: Option<Instant>,
    /// When the current pause episode started, used to fold its length into
    /// `stats.pause` once it ends.
    pub pause_started_at: Option<Instant>,
    pub stats: TubeStats,
}

impl Tube {
    pub fn new(name: TubeName) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn put_ready(&mut self, id: JobId, priority: u32, urgent: bool) {
        self.ready_set.insert((priority, id.0));
        self.stats.current_jobs_ready += 1;
        if urgent {
            self.stats.current_jobs_urgent += 1;
        }
    }

    pub fn take_ready(&mut self, id: JobId, priority: u32, urgent: bool) {
        self.ready_set.remove(&(priority, id.0));
        self.stats.current_jobs_ready -= 1;
        if urgent {
            self.stats.current_jobs_urgent -= 1;
        }
    }

    /// The lowest `(priority, id)` ready job, without removing it.
    pub fn peek_ready(&self) -> Option<JobId> {
        self.ready_set.first().map(|&(_, id)| JobId(id))
    }

    pub fn put_delayed(&mut self, id: JobId, deadline: Instant) {
        self.delay_set.insert((deadline, id.0));
        self.stats.current_jobs_delayed += 1;
    }

    pub fn take_delayed(&mut self, id: JobId, deadline: Instant) {
        self.delay_set.remove(&(deadline, id.0));
        self.stats.current_jobs_delayed -= 1;
    }

    pub fn peek_delayed(&self) -> Option<JobId> {
        self.delay_set.first().map(|&(_, id)| JobId(id))
    }

    /// Every `(deadline, id)` pair currently delayed with `deadline` at or
    /// before `now`, in deadline order.
    pub fn expired_delayed(&self, now: Instant) -> Vec<(Instant, JobId)> {
        self.delay_set
            .range(..=(now, u64::MAX))
            .map(|&(deadline, id)| (deadline, JobId(id)))
            .collect()
    }

    pub fn put_buried(&mut self, id: JobId) {
        self.buried_list.push_back(id);
        self.stats.current_jobs_buried += 1;
    }

    pub fn take_buried(&mut self, id: JobId) {
        if let Some(pos) = self.buried_list.iter().position(|&j| j == id) {
            self.buried_list.remove(pos);
            self.stats.current_jobs_buried -= 1;
        }
    }

    pub fn peek_buried(&self) -> Option<JobId> {
        self.buried_list.front().copied()
    }

    pub fn buried_front_n(&self, bound: u64) -> Vec<JobId> {
        self.buried_list.iter().take(bound as usize).copied().collect()
    }

    pub fn delayed_front_n(&self, bound: u64) -> Vec<JobId> {
        self.delay_set
            .iter()
            .take(bound as usize)
            .map(|&(_, id)| JobId(id))
            .collect()
    }

    pub fn has_buried(&self) -> bool {
        !self.buried_list.is_empty()
    }

    pub fn incr_reserved(&mut self) {
        self.stats.current_jobs_reserved += 1;
    }

    pub fn decr_reserved(&mut self) {
        self.stats.current_jobs_reserved -= 1;
    }

    /// Starts (or restarts) a pause episode lasting `delay_secs`.
    pub fn pause(&mut self, now: Instant, delay_secs: u32) {
        if self.paused {
            self.end_pause(now);
        }
        self.paused = true;
        self.pause_started_at = Some(now);
        self.pause_deadline = Some(now + std::time::Duration::from_secs(delay_secs as u64));
    }

    /// Ends the current pause episode, folding its elapsed length into
    /// `stats.pause`. No-op if not currently paused.
    pub fn end_pause(&mut self, now: Instant) {
        if let Some(started) = self.pause_started_at.take() {
            self.stats.pause += now.saturating_duration_since(started).as_secs() as u32;
        }
        self.paused = false;
        self.pause_deadline = None;
    }
}
