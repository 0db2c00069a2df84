//! The engine's only notion of time passing on its own: one coalesced sweep
//! that the connection-independent periodic task (see
//! [`super::handle::EngineHandle::spawn_periodic_sweep`]) drives at roughly
//! 1Hz. All four jobs it does — expiring delays, expiring TTRs, expiring
//! pauses, and timing out blocked reserves — share the same "walk a small
//! set, collect ids, then mutate" shape to keep borrows simple.

use tokio::time::Instant;

use super::Engine;
use crate::types::session::SessionState;
use crate::types::states::JobState;

impl Engine {
    /// Runs one sweep pass. Cheap when nothing is due: each of the four
    /// checks below is a linear scan bounded by the number of tubes or
    /// sessions, not the number of jobs.
    pub fn run_periodic_sweep(&mut self) {
        let now = Instant::now();
        self.expire_delayed(now);
        self.expire_reservations(now);
        self.expire_pauses(now);
        self.expire_waits(now);
    }

    fn expire_delayed(&mut self, now: Instant) {
        let tube_names: Vec<_> = self.tubes.keys().cloned().collect();
        for tube_name in tube_names {
            let expired = match self.tubes.get(&tube_name) {
                Some(tube) => tube.expired_delayed(now),
                None => continue,
            };
            for (deadline, job_id) in expired {
                let (priority, urgent) = match self.jobs.get_mut(&job_id) {
                    Some(job) if job.state == JobState::Delayed => {
                        job.state = JobState::Ready;
                        job.deadline_at = None;
                        (job.priority, job.is_urgent())
                    },
                    _ => continue,
                };

                if let Some(tube) = self.tubes.get_mut(&tube_name) {
                    tube.take_delayed(job_id, deadline);
                    tube.put_ready(job_id, priority, urgent);
                }

                self.write_wal_delta_for(job_id);
                self.dispatch_ready(&tube_name, job_id);
            }
        }
    }

    fn expire_reservations(&mut self, now: Instant) {
        let expired: Vec<_> = self
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Reserved
                    && job.deadline_at.map(|d| d <= now).unwrap_or(false)
            })
            .map(|job| job.id)
            .collect();

        for job_id in expired {
            self.requeue_reserved_job(job_id, true);
        }
    }

    fn expire_pauses(&mut self, now: Instant) {
        let expired: Vec<_> = self
            .tubes
            .values()
            .filter(|tube| tube.paused && tube.pause_deadline.map(|d| d <= now).unwrap_or(false))
            .map(|tube| tube.name.clone())
            .collect();

        for tube_name in expired {
            self.end_pause_and_drain(&tube_name, now);
        }
    }

    fn expire_waits(&mut self, now: Instant) {
        let expired: Vec<_> = self
            .sessions
            .values()
            .filter(|s| s.state == SessionState::Waiting && s.deadline_at.map(|d| d <= now).unwrap_or(false))
            .map(|s| s.id)
            .collect();

        for session_id in expired {
            self.cancel_wait_timeout(session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TubeName;
    use std::time::Duration;

    #[test]
    fn sweep_leaves_unexpired_delay_alone() {
        let mut engine = Engine::new();
        let producer = engine.create_session();

        let delayed = engine.put(producer, 10, 3600, 60, vec![]).unwrap();
        assert_eq!(engine.peek(delayed).unwrap().state, JobState::Delayed);

        // Can't fast-forward tokio::time::Instant in a unit test without
        // pausing the runtime clock; this just exercises that the sweep
        // doesn't touch a delay that hasn't expired yet.
        engine.run_periodic_sweep();
        assert_eq!(engine.peek(delayed).unwrap().state, JobState::Delayed);
    }

    #[test]
    fn pause_expiry_drains_waiting_session() {
        let mut engine = Engine::new();
        let producer = engine.create_session();
        engine.pause_tube(&TubeName::default(), 3600).unwrap();

        let id = engine.put(producer, 10, 0, 60, vec![]).unwrap();
        assert_eq!(engine.peek(id).unwrap().state, JobState::Ready);

        engine.end_pause_and_drain(&TubeName::default(), Instant::now() + Duration::from_secs(1));
        // No waiting session yet, so the job should simply remain ready.
        assert_eq!(engine.peek(id).unwrap().state, JobState::Ready);
    }
}
