//! Immediate dispatch: pairing a newly-ready job, or a newly-unpaused tube,
//! with a session that is already blocked in `reserve`.
//!
//! Both paths are simple head-of-queue pairing, not a re-run of the
//! watched-tube top-ready scan that `reserve_immediate` does on the calling
//! session's behalf — by the time a session is on a tube's `waiting_list` it
//! has already confirmed no ready job exists anywhere in its watch set, so
//! the next job to land in that tube is unambiguously its catch.

use tokio::time::Instant;

use super::Engine;
use crate::types::{JobId, TubeName};

impl Engine {
    /// Called immediately after `job_id` becomes ready in `tube_name` (from
    /// `put`, `release`, `kick`, or a delay/TTR sweep). If a session is
    /// waiting on this tube, hands it the job right away.
    pub(crate) fn dispatch_ready(&mut self, tube_name: &TubeName, job_id: JobId) {
        let Some(tube) = self.tubes.get(tube_name) else {
            return;
        };
        if tube.paused {
            return;
        }

        let Some(tube) = self.tubes.get_mut(tube_name) else {
            return;
        };
        let Some(session_id) = tube.waiting_list.pop_front() else {
            return;
        };

        self.reserve_for_session(session_id, job_id);
    }

    /// Called when a tube's pause expires. Pairs the head of its
    /// `ready_set` with the head of its `waiting_list`, repeatedly, until
    /// one side runs out.
    pub(crate) fn drain_paused_tube(&mut self, tube_name: &TubeName) {
        loop {
            let Some(tube) = self.tubes.get(tube_name) else {
                return;
            };
            if tube.paused {
                return;
            }
            let Some(job_id) = tube.peek_ready() else {
                return;
            };

            let Some(tube) = self.tubes.get_mut(tube_name) else {
                return;
            };
            let Some(session_id) = tube.waiting_list.pop_front() else {
                return;
            };

            self.reserve_for_session(session_id, job_id);
        }
    }

    /// Ends `tube_name`'s pause (if any) and drains it, per §4.2. Used by
    /// both an explicit `pause-tube 0` episode and the periodic sweep's
    /// pause-expiry check.
    pub(crate) fn end_pause_and_drain(&mut self, tube_name: &TubeName, now: Instant) {
        if let Some(tube) = self.tubes.get_mut(tube_name) {
            tube.end_pause(now);
        }
        self.drain_paused_tube(tube_name);
    }
}
