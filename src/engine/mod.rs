//! The job-queue engine: the single piece of mutable state a `stalkd`
//! process holds, and the only place job/tube/session invariants are
//! enforced. Every public method here runs to completion inside whatever
//! lock [`handle::EngineHandle`] takes out — none of it is `async` itself.

pub mod dispatch;
pub mod error;
pub mod handle;
pub mod periodic;
pub mod stats;

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

pub use error::{EngineError, EngineResult};
pub use handle::EngineHandle;
pub use stats::{EngineStats, JobStatsSnapshot, TubeStatsSnapshot};

use crate::types::job::Job;
use crate::types::session::{ReserveDelivery, Session, SessionKind, SessionState};
use crate::types::states::JobState;
use crate::types::tube::Tube;
use crate::types::{JobId, SessionId, TubeName};
use crate::wal::{EpochClock, Record, RecordState, WalWriter};

pub struct Engine {
    jobs: HashMap<JobId, Job>,
    tubes: HashMap<TubeName, Tube>,
    sessions: HashMap<SessionId, Session>,
    next_job_id: u64,
    next_session_id: u64,
    draining: bool,
    wal: Option<WalWriter>,
    epoch: EpochClock,
    started_at: Instant,
    stats: EngineStats,
}

impl Engine {
    /// A fresh engine with no durability: every mutation is in-memory only.
    pub fn new() -> Self {
        Self::empty(None)
    }

    /// An engine backed by a write-ahead log, with no prior state to
    /// recover (the log directory is empty or doesn't exist yet).
    pub fn with_wal(wal: WalWriter) -> Self {
        Self::empty(Some(wal))
    }

    /// Replays `shards` WAL files under `dir`, builds an engine from the
    /// recovered image, then rotates the log to fresh self-sufficient full
    /// records (§4.6 step 5) so future restarts don't need to walk a
    /// combined history of every delta this process has ever written.
    pub fn recover(dir: &Path, shards: usize) -> io::Result<Self> {
        let recovered = crate::wal::recovery::replay(dir, shards)?;
        let mut engine = Self::empty(None);
        engine.next_job_id = recovered.max_id_seen + 1;

        for job in recovered.jobs.into_values() {
            let tube_name = TubeName::new(job.tube);
            engine.ensure_tube(&tube_name);

            let created_at = engine.epoch.to_instant(job.created_at_ms);
            let deadline_at = if job.deadline_at_ms == 0 {
                None
            } else {
                Some(engine.epoch.to_instant(job.deadline_at_ms))
            };

            let state = match job.state {
                RecordState::Ready => JobState::Ready,
                RecordState::Delayed => JobState::Delayed,
                RecordState::Buried => JobState::Buried,
                // Replay already downgrades Reserved to Ready; Invalid
                // records remove their job entirely rather than appearing
                // here.
                RecordState::Reserved | RecordState::Invalid => JobState::Ready,
            };

            let restored = Job {
                id: JobId(job.id),
                tube: tube_name.clone(),
                priority: job.priority,
                delay_secs: job.delay_secs,
                ttr_secs: job.ttr_secs,
                body: job.body,
                state,
                created_at,
                deadline_at,
                reserver: None,
                reserves: job.reserves,
                timeouts: job.timeouts,
                releases: job.releases,
                buries: job.buries,
                kicks: job.kicks,
            };

            let urgent = restored.is_urgent();
            let priority = restored.priority;
            let tube = engine.tubes.get_mut(&tube_name).expect("just ensured");
            match state {
                JobState::Ready => tube.put_ready(JobId(job.id), priority, urgent),
                JobState::Delayed => tube.put_delayed(JobId(job.id), deadline_at.expect("delayed job has deadline")),
                JobState::Buried => tube.put_buried(JobId(job.id)),
                JobState::Reserved => unreachable!(),
            }
            tube.stats.total_jobs += 1;

            engine.stats.total_jobs += 1;
            engine.jobs.insert(JobId(job.id), restored);
        }

        engine.wal = Some(WalWriter::rotate(dir, shards)?);

        // Re-persist every recovered job as a fresh full record, so the
        // rotated log is self-sufficient without the history of deltas
        // that produced this state.
        let records: Vec<Record> = engine.jobs.values().map(|j| full_record(&engine.epoch, j)).collect();
        for record in records {
            engine.append_wal(record);
        }

        Ok(engine)
    }

    fn empty(wal: Option<WalWriter>) -> Self {
        let mut tubes = HashMap::new();
        tubes.insert(TubeName::default(), Tube::new(TubeName::default()));

        Self {
            jobs: HashMap::new(),
            tubes,
            sessions: HashMap::new(),
            next_job_id: 1,
            next_session_id: 1,
            draining: false,
            wal,
            epoch: EpochClock::now(),
            started_at: Instant::now(),
            stats: EngineStats::default(),
        }
    }

    fn ensure_tube(&mut self, name: &TubeName) {
        self.tubes
            .entry(name.clone())
            .or_insert_with(|| Tube::new(name.clone()));
    }

    fn append_wal(&mut self, record: Record) {
        if let Some(wal) = self.wal.as_mut() {
            if let Err(err) = wal.append(&record) {
                tracing::error!(id = record.id, error = %err, "WAL append failed");
            }
        }
    }

    fn write_wal_full(&mut self, job: &Job) {
        let record = full_record(&self.epoch, job);
        self.append_wal(record);
    }

    fn write_wal_delta_for(&mut self, id: JobId) {
        let record = match self.jobs.get(&id) {
            Some(job) => delta_record(&self.epoch, job),
            None => return,
        };
        self.append_wal(record);
    }

    // -- session lifecycle --------------------------------------------

    pub fn create_session(&mut self) -> SessionId {
        let id = SessionId(self.next_session_id);
        self.next_session_id += 1;
        self.sessions.insert(id, Session::new(id));
        self.stats.current_connections += 1;
        self.stats.total_connections += 1;
        id
    }

    /// Tears down a session: drops it from every waiting list it might be
    /// on, and releases every job it still holds back to `ready`.
    pub fn close_session(&mut self, session_id: SessionId) {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return;
        };
        session.waiting_tx = None;

        for tube_name in &session.watched_tubes {
            if let Some(tube) = self.tubes.get_mut(tube_name) {
                tube.waiting_list.retain(|&s| s != session_id);
            }
        }

        self.stats.current_connections = self.stats.current_connections.saturating_sub(1);
        if session.state == SessionState::Waiting {
            self.stats.current_waiting = self.stats.current_waiting.saturating_sub(1);
        }

        let reserved: Vec<JobId> = session.reserved_jobs.iter().copied().collect();
        for job_id in reserved {
            self.requeue_reserved_job(job_id, false);
        }
    }

    fn requeue_reserved_job(&mut self, job_id: JobId, bump_timeout: bool) {
        let (tube_name, priority, urgent, reserver) = {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                return;
            };
            if job.state != JobState::Reserved {
                return;
            }
            job.state = JobState::Ready;
            let reserver = job.reserver.take();
            job.deadline_at = None;
            if bump_timeout {
                job.timeouts += 1;
            }
            (job.tube.clone(), job.priority, job.is_urgent(), reserver)
        };

        if bump_timeout {
            self.stats.job_timeouts += 1;
        }

        if let Some(sess_id) = reserver {
            if let Some(session) = self.sessions.get_mut(&sess_id) {
                session.reserved_jobs.remove(&job_id);
            }
        }

        self.write_wal_delta_for(job_id);

        if let Some(tube) = self.tubes.get_mut(&tube_name) {
            tube.decr_reserved();
            tube.put_ready(job_id, priority, urgent);
        }

        self.dispatch_ready(&tube_name, job_id);
    }

    // -- tube selection ---------------------------------------------------

    pub fn use_tube(&mut self, session_id: SessionId, tube: TubeName) -> TubeName {
        self.ensure_tube(&tube);
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.used_tube = tube.clone();
        }
        self.stats.cmd_use += 1;
        tube
    }

    pub fn watch(&mut self, session_id: SessionId, tube: TubeName) -> u32 {
        self.ensure_tube(&tube);
        let count = match self.sessions.get_mut(&session_id) {
            Some(session) => {
                session.watched_tubes.insert(tube);
                session.watched_tubes.len() as u32
            },
            None => 0,
        };
        self.stats.cmd_watch += 1;
        count
    }

    pub fn ignore(&mut self, session_id: SessionId, tube: &TubeName) -> EngineResult<u32> {
        self.stats.cmd_ignore += 1;
        let session = self.sessions.get_mut(&session_id).ok_or(EngineError::NotFound)?;
        if session.watched_tubes.len() <= 1 && session.watched_tubes.contains(tube) {
            return Err(EngineError::NotIgnored);
        }
        session.watched_tubes.remove(tube);
        Ok(session.watched_tubes.len() as u32)
    }

    pub fn list_tubes(&self) -> Vec<TubeName> {
        self.tubes.keys().cloned().collect()
    }

    pub fn list_tube_used(&self, session_id: SessionId) -> Option<TubeName> {
        self.sessions.get(&session_id).map(|s| s.used_tube.clone())
    }

    pub fn list_tubes_watched(&self, session_id: SessionId) -> Vec<TubeName> {
        self.sessions
            .get(&session_id)
            .map(|s| s.watched_tubes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_draining(&mut self, draining: bool) {
        self.draining = draining;
    }

    // -- put ---------------------------------------------------------------

    pub fn put(
        &mut self,
        session_id: SessionId,
        priority: u32,
        delay_secs: u32,
        ttr_secs: u32,
        body: Vec<u8>,
    ) -> EngineResult<JobId> {
        self.stats.cmd_put += 1;
        if self.draining {
            return Err(EngineError::Draining);
        }

        let tube_name = self
            .sessions
            .get(&session_id)
            .ok_or(EngineError::NotFound)?
            .used_tube
            .clone();
        self.ensure_tube(&tube_name);

        let id = JobId(self.next_job_id);
        self.next_job_id += 1;

        let now = Instant::now();
        let (state, deadline_at) = if delay_secs > 0 {
            (JobState::Delayed, Some(now + Duration::from_secs(delay_secs as u64)))
        } else {
            (JobState::Ready, None)
        };

        let job = Job {
            id,
            tube: tube_name.clone(),
            priority,
            delay_secs,
            ttr_secs,
            body,
            state,
            created_at: now,
            deadline_at,
            reserver: None,
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
        };

        self.write_wal_full(&job);

        let urgent = job.is_urgent();
        {
            let tube = self.tubes.get_mut(&tube_name).expect("just ensured");
            match state {
                JobState::Ready => tube.put_ready(id, priority, urgent),
                JobState::Delayed => tube.put_delayed(id, deadline_at.expect("delayed job has deadline")),
                _ => unreachable!(),
            }
            tube.stats.total_jobs += 1;
        }

        self.jobs.insert(id, job);
        self.stats.total_jobs += 1;

        if state == JobState::Ready {
            self.dispatch_ready(&tube_name, id);
        }

        if self.sessions.get(&session_id).map(|s| s.kind) == Some(SessionKind::Unknown) {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.kind = SessionKind::Producer;
            }
        }

        Ok(id)
    }

    // -- reserve family ------------------------------------------------

    /// The best ready job across every watched, unpaused tube, without
    /// reserving it.
    pub(crate) fn top_ready_for(&self, session_id: SessionId) -> Option<JobId> {
        let session = self.sessions.get(&session_id)?;
        session
            .watched_tubes
            .iter()
            .filter_map(|name| self.tubes.get(name))
            .filter(|tube| !tube.paused)
            .filter_map(|tube| tube.peek_ready())
            .min_by_key(|&job_id| {
                let job = &self.jobs[&job_id];
                (job.priority, job_id.0)
            })
    }

    /// Attributes a `reserve`/`reserve-with-timeout` command dispatch to the
    /// matching counter. Called once per [`handle::EngineHandle::reserve`]
    /// call, regardless of whether the job arrives immediately or after a
    /// wait — unlike [`Self::reserve_for_session`], which also runs when a
    /// job is handed to an already-waiting session as a side effect of
    /// `put`/`release`/`kick`/expiry, none of which is a client issuing a
    /// reserve command at that moment.
    pub fn note_reserve_command(&mut self, with_timeout: bool) {
        if with_timeout {
            self.stats.cmd_reserve_with_timeout += 1;
        } else {
            self.stats.cmd_reserve += 1;
        }
    }

    /// Attempts an immediate reservation (the first step of every `reserve*`
    /// command). Marks the session as a worker on its first call regardless
    /// of whether a job was actually available.
    pub fn reserve_immediate(&mut self, session_id: SessionId) -> Option<JobId> {
        self.mark_worker(session_id);
        let job_id = self.top_ready_for(session_id)?;
        self.reserve_for_session(session_id, job_id);
        Some(job_id)
    }

    /// Reserves a specific job by id, regardless of the caller's watch set.
    pub fn reserve_job(&mut self, session_id: SessionId, id: JobId) -> EngineResult<JobId> {
        self.mark_worker(session_id);
        let ready = self.jobs.get(&id).map(|j| j.state == JobState::Ready).unwrap_or(false);
        if !ready {
            return Err(EngineError::NotFound);
        }
        self.reserve_for_session(session_id, id);
        Ok(id)
    }

    fn mark_worker(&mut self, session_id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.kind = SessionKind::Worker;
        }
    }

    /// Registers `session_id` as waiting on every tube it watches, with an
    /// optional deadline for the reserve-timeout sweep to enforce. Returns
    /// the receiving half of the channel the session's connection task
    /// should await outside of the engine lock.
    pub fn begin_wait(&mut self, session_id: SessionId, timeout: Option<Duration>) -> oneshot::Receiver<ReserveDelivery> {
        let (tx, rx) = oneshot::channel();

        let watched: Vec<TubeName> = self
            .sessions
            .get(&session_id)
            .map(|s| s.watched_tubes.iter().cloned().collect())
            .unwrap_or_default();

        for tube_name in &watched {
            if let Some(tube) = self.tubes.get_mut(tube_name) {
                tube.waiting_list.push_back(session_id);
            }
        }

        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.state = SessionState::Waiting;
            session.deadline_at = timeout.map(|d| Instant::now() + d);
            session.waiting_tx = Some(tx);
        }

        self.stats.current_waiting += 1;
        rx
    }

    /// Removes `session_id` from every waiting list without delivering a
    /// result — used when its connection drops while waiting.
    pub fn cancel_wait_silent(&mut self, session_id: SessionId) {
        self.cancel_wait_inner(session_id, false);
    }

    /// As [`Self::cancel_wait_silent`], but delivers `TimedOut` to the
    /// session's pending reserve — used by the reserve-timeout sweep.
    pub fn cancel_wait_timeout(&mut self, session_id: SessionId) {
        self.cancel_wait_inner(session_id, true);
    }

    fn cancel_wait_inner(&mut self, session_id: SessionId, deliver_timeout: bool) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if session.state != SessionState::Waiting {
            return;
        }
        session.state = SessionState::Idle;
        session.deadline_at = None;
        let tx = session.waiting_tx.take();
        let watched: Vec<TubeName> = session.watched_tubes.iter().cloned().collect();

        for tube_name in &watched {
            if let Some(tube) = self.tubes.get_mut(tube_name) {
                tube.waiting_list.retain(|&s| s != session_id);
            }
        }

        self.stats.current_waiting = self.stats.current_waiting.saturating_sub(1);

        if deliver_timeout {
            if let Some(tx) = tx {
                let _ = tx.send(ReserveDelivery::TimedOut);
            }
        }
    }

    /// Transitions `job_id` from ready to reserved by `session_id`, removing
    /// the session from every waiting list it might still be on and
    /// delivering the job over its pending channel, if any.
    pub(crate) fn reserve_for_session(&mut self, session_id: SessionId, job_id: JobId) {
        let was_waiting = self
            .sessions
            .get(&session_id)
            .map(|s| s.state == SessionState::Waiting)
            .unwrap_or(false);

        let watched: Vec<TubeName> = self
            .sessions
            .get(&session_id)
            .map(|s| s.watched_tubes.iter().cloned().collect())
            .unwrap_or_default();
        for tube_name in &watched {
            if let Some(tube) = self.tubes.get_mut(tube_name) {
                tube.waiting_list.retain(|&s| s != session_id);
            }
        }

        let (tube_name, priority, urgent) = {
            let Some(job) = self.jobs.get_mut(&job_id) else { return };
            job.state = JobState::Reserved;
            job.reserver = Some(session_id);
            job.reserves += 1;
            job.deadline_at = if job.ttr_is_infinite() {
                None
            } else {
                Some(Instant::now() + Duration::from_secs(job.ttr_secs as u64))
            };
            (job.tube.clone(), job.priority, job.is_urgent())
        };

        if let Some(tube) = self.tubes.get_mut(&tube_name) {
            tube.take_ready(job_id, priority, urgent);
            tube.incr_reserved();
        }

        let tx = if let Some(session) = self.sessions.get_mut(&session_id) {
            session.state = SessionState::Working;
            session.deadline_at = None;
            session.reserved_jobs.insert(job_id);
            session.waiting_tx.take()
        } else {
            None
        };

        if was_waiting {
            self.stats.current_waiting = self.stats.current_waiting.saturating_sub(1);
        }

        if let Some(tx) = tx {
            let _ = tx.send(ReserveDelivery::Job(job_id));
        }
    }

    // -- per-job commands ------------------------------------------------

    pub fn delete(&mut self, session_id: SessionId, id: JobId) -> EngineResult<()> {
        self.stats.cmd_delete += 1;
        let job = self.jobs.get(&id).ok_or(EngineError::NotFound)?;
        match job.state {
            JobState::Delayed => return Err(EngineError::NotFound),
            JobState::Reserved if job.reserver != Some(session_id) => return Err(EngineError::NotFound),
            _ => {},
        }

        let tube_name = job.tube.clone();
        let priority = job.priority;
        let urgent = job.is_urgent();
        let state = job.state;
        let reserver = job.reserver;

        if let Some(tube) = self.tubes.get_mut(&tube_name) {
            match state {
                JobState::Ready => tube.take_ready(id, priority, urgent),
                JobState::Buried => tube.take_buried(id),
                JobState::Reserved => tube.decr_reserved(),
                JobState::Delayed => unreachable!(),
            }
            tube.stats.cmd_delete += 1;
        }

        if let Some(sess_id) = reserver {
            if let Some(session) = self.sessions.get_mut(&sess_id) {
                session.reserved_jobs.remove(&id);
            }
        }

        self.jobs.remove(&id);
        self.append_wal(invalid_record(id));
        Ok(())
    }

    pub fn release(&mut self, session_id: SessionId, id: JobId, priority: u32, delay_secs: u32) -> EngineResult<()> {
        self.stats.cmd_release += 1;

        let tube_name = {
            let job = self.jobs.get_mut(&id).ok_or(EngineError::NotFound)?;
            if job.state != JobState::Reserved || job.reserver != Some(session_id) {
                return Err(EngineError::NotFound);
            }
            job.priority = priority;
            job.delay_secs = delay_secs;
            job.releases += 1;
            job.reserver = None;
            if delay_secs > 0 {
                job.state = JobState::Delayed;
                job.deadline_at = Some(Instant::now() + Duration::from_secs(delay_secs as u64));
            } else {
                job.state = JobState::Ready;
                job.deadline_at = None;
            }
            job.tube.clone()
        };

        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.reserved_jobs.remove(&id);
        }

        let (new_state, urgent, deadline) = {
            let job = &self.jobs[&id];
            (job.state, job.is_urgent(), job.deadline_at)
        };

        if let Some(tube) = self.tubes.get_mut(&tube_name) {
            tube.decr_reserved();
            match new_state {
                JobState::Ready => tube.put_ready(id, priority, urgent),
                JobState::Delayed => tube.put_delayed(id, deadline.expect("delayed job has deadline")),
                _ => unreachable!(),
            }
        }

        self.write_wal_delta_for(id);

        if new_state == JobState::Ready {
            self.dispatch_ready(&tube_name, id);
        }

        Ok(())
    }

    pub fn bury(&mut self, session_id: SessionId, id: JobId, priority: u32) -> EngineResult<()> {
        self.stats.cmd_bury += 1;

        let tube_name = {
            let job = self.jobs.get_mut(&id).ok_or(EngineError::NotFound)?;
            if job.state != JobState::Reserved || job.reserver != Some(session_id) {
                return Err(EngineError::NotFound);
            }
            job.priority = priority;
            job.buries += 1;
            job.reserver = None;
            job.state = JobState::Buried;
            job.deadline_at = None;
            job.tube.clone()
        };

        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.reserved_jobs.remove(&id);
        }

        if let Some(tube) = self.tubes.get_mut(&tube_name) {
            tube.decr_reserved();
            tube.put_buried(id);
        }

        self.write_wal_delta_for(id);
        Ok(())
    }

    pub fn touch(&mut self, session_id: SessionId, id: JobId) -> EngineResult<()> {
        self.stats.cmd_touch += 1;

        let job = self.jobs.get_mut(&id).ok_or(EngineError::NotFound)?;
        if job.state != JobState::Reserved || job.reserver != Some(session_id) {
            return Err(EngineError::NotFound);
        }
        job.deadline_at = if job.ttr_is_infinite() {
            None
        } else {
            Some(Instant::now() + Duration::from_secs(job.ttr_secs as u64))
        };

        self.write_wal_delta_for(id);
        Ok(())
    }

    // -- kick family -------------------------------------------------------

    pub fn kick(&mut self, session_id: SessionId, bound: u64) -> u64 {
        self.stats.cmd_kick += 1;

        let tube_name = match self.sessions.get(&session_id) {
            Some(session) => session.used_tube.clone(),
            None => return 0,
        };

        let ids = match self.tubes.get(&tube_name) {
            Some(tube) if tube.has_buried() => tube.buried_front_n(bound),
            Some(tube) => tube.delayed_front_n(bound),
            None => Vec::new(),
        };

        let mut count = 0;
        for id in ids {
            if self.kick_job_unchecked(id) {
                count += 1;
            }
        }

        count
    }

    pub fn kick_job(&mut self, id: JobId) -> EngineResult<()> {
        self.stats.cmd_kick += 1;
        if !self.jobs.contains_key(&id) {
            return Err(EngineError::NotFound);
        }
        if self.kick_job_unchecked(id) {
            Ok(())
        } else {
            Err(EngineError::NotFound)
        }
    }

    fn kick_job_unchecked(&mut self, id: JobId) -> bool {
        let (tube_name, priority, from_state, old_deadline) = {
            let Some(job) = self.jobs.get_mut(&id) else {
                return false;
            };
            let from_state = job.state;
            if from_state != JobState::Buried && from_state != JobState::Delayed {
                return false;
            }
            let old_deadline = job.deadline_at;
            job.state = JobState::Ready;
            job.deadline_at = None;
            job.kicks += 1;
            (job.tube.clone(), job.priority, from_state, old_deadline)
        };

        let urgent = self.jobs[&id].is_urgent();

        if let Some(tube) = self.tubes.get_mut(&tube_name) {
            match from_state {
                JobState::Buried => tube.take_buried(id),
                JobState::Delayed => tube.take_delayed(id, old_deadline.expect("delayed job has deadline")),
                _ => unreachable!(),
            }
            tube.put_ready(id, priority, urgent);
        }

        self.write_wal_delta_for(id);
        self.dispatch_ready(&tube_name, id);
        true
    }

    // -- pause-tube ----------------------------------------------------

    pub fn pause_tube(&mut self, name: &TubeName, delay_secs: u32) -> EngineResult<()> {
        self.stats.cmd_pause_tube += 1;
        let tube = self.tubes.get_mut(name).ok_or(EngineError::NotFound)?;
        tube.pause(Instant::now(), delay_secs);
        tube.stats.cmd_pause_tube += 1;
        Ok(())
    }

    // -- peek family -------------------------------------------------------

    pub fn peek(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    /// The `peek <id>` command: looks a job up by id directly, regardless of
    /// its tube or state. Distinct from [`Self::peek`] so that `cmd_peek` is
    /// bumped exactly once per `peek` dispatch — `peek` itself is also used
    /// internally to fetch a job's body for `reserve`/`reserve-job`/
    /// `peek-ready`/`peek-delayed`/`peek-buried` deliveries, none of which
    /// should count as a `peek` command.
    pub fn peek_job(&mut self, id: JobId) -> Option<JobId> {
        self.stats.cmd_peek += 1;
        self.jobs.contains_key(&id).then_some(id)
    }

    pub fn peek_ready(&mut self, session_id: SessionId) -> Option<JobId> {
        self.stats.cmd_peek_ready += 1;
        let tube = self.sessions.get(&session_id)?.used_tube.clone();
        self.tubes.get(&tube)?.peek_ready()
    }

    pub fn peek_delayed(&mut self, session_id: SessionId) -> Option<JobId> {
        self.stats.cmd_peek_delayed += 1;
        let tube = self.sessions.get(&session_id)?.used_tube.clone();
        self.tubes.get(&tube)?.peek_delayed()
    }

    pub fn peek_buried(&mut self, session_id: SessionId) -> Option<JobId> {
        self.stats.cmd_peek_buried += 1;
        let tube = self.sessions.get(&session_id)?.used_tube.clone();
        self.tubes.get(&tube)?.peek_buried()
    }

    // -- stats ---------------------------------------------------------

    pub fn stats_job(&mut self, id: JobId) -> EngineResult<JobStatsSnapshot> {
        self.stats.cmd_stats_job += 1;
        let job = self.jobs.get(&id).ok_or(EngineError::NotFound)?;
        let now = Instant::now();
        let age_secs = now.saturating_duration_since(job.created_at).as_secs();
        let time_left_secs = job
            .deadline_at
            .map(|d| d.saturating_duration_since(now).as_secs())
            .unwrap_or(0);

        Ok(JobStatsSnapshot {
            id,
            tube: job.tube.clone(),
            state: job.state,
            priority: job.priority,
            age_secs,
            delay_secs: job.delay_secs,
            ttr_secs: job.ttr_secs,
            time_left_secs,
            reserves: job.reserves,
            timeouts: job.timeouts,
            releases: job.releases,
            buries: job.buries,
            kicks: job.kicks,
        })
    }

    pub fn stats_tube(&mut self, name: &TubeName) -> EngineResult<TubeStatsSnapshot> {
        self.stats.cmd_stats_tube += 1;
        let now = Instant::now();

        let current_using = self.sessions.values().filter(|s| &s.used_tube == name).count() as u64;
        let current_watching = self
            .sessions
            .values()
            .filter(|s| s.watched_tubes.contains(name))
            .count() as u64;

        let tube = self.tubes.get(name).ok_or(EngineError::NotFound)?;
        let pause_time_left_secs = if tube.paused {
            tube.pause_deadline
                .map(|d| d.saturating_duration_since(now).as_secs())
                .unwrap_or(0)
        } else {
            0
        };

        let mut stats = tube.stats.clone();
        stats.current_using = current_using;
        stats.current_watching = current_watching;
        stats.current_waiting = tube.waiting_list.len() as u64;

        Ok(TubeStatsSnapshot {
            name: name.clone(),
            stats,
            pause_time_left_secs,
        })
    }

    pub fn stats(&mut self) -> EngineStats {
        self.stats.cmd_stats += 1;

        let mut snapshot = self.stats.clone();
        snapshot.current_tubes = self.tubes.len() as u64;
        snapshot.current_jobs_ready = 0;
        snapshot.current_jobs_urgent = 0;
        snapshot.current_jobs_delayed = 0;
        snapshot.current_jobs_buried = 0;
        snapshot.current_jobs_reserved = 0;

        for tube in self.tubes.values() {
            snapshot.current_jobs_ready += tube.stats.current_jobs_ready;
            snapshot.current_jobs_urgent += tube.stats.current_jobs_urgent;
            snapshot.current_jobs_delayed += tube.stats.current_jobs_delayed;
            snapshot.current_jobs_buried += tube.stats.current_jobs_buried;
            snapshot.current_jobs_reserved += tube.stats.current_jobs_reserved;
        }

        snapshot.current_producers = self
            .sessions
            .values()
            .filter(|s| s.kind == SessionKind::Producer)
            .count() as u64;
        snapshot.current_workers = self
            .sessions
            .values()
            .filter(|s| s.kind == SessionKind::Worker)
            .count() as u64;
        snapshot.draining = self.draining;
        snapshot.uptime_secs = Instant::now().saturating_duration_since(self.started_at).as_secs();

        snapshot
    }

    pub fn epoch(&self) -> &EpochClock {
        &self.epoch
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn record_state_of(state: JobState) -> RecordState {
    match state {
        JobState::Ready => RecordState::Ready,
        JobState::Delayed => RecordState::Delayed,
        JobState::Reserved => RecordState::Reserved,
        JobState::Buried => RecordState::Buried,
    }
}

fn delta_record(epoch: &EpochClock, job: &Job) -> Record {
    Record {
        id: job.id.0,
        delay_secs: job.delay_secs,
        ttr_secs: job.ttr_secs,
        priority: job.priority,
        created_at_ms: epoch.to_epoch_ms(job.created_at),
        deadline_at_ms: job.deadline_at.map(|d| epoch.to_epoch_ms(d)).unwrap_or(0),
        state: record_state_of(job.state),
        reserves: job.reserves,
        timeouts: job.timeouts,
        releases: job.releases,
        buries: job.buries,
        kicks: job.kicks,
        tube: None,
        body: None,
    }
}

fn full_record(epoch: &EpochClock, job: &Job) -> Record {
    Record {
        tube: Some(job.tube.as_str().to_string()),
        body: Some(job.body.clone()),
        ..delta_record(epoch, job)
    }
}

fn invalid_record(id: JobId) -> Record {
    Record {
        id: id.0,
        delay_secs: 0,
        ttr_secs: 0,
        priority: 0,
        created_at_ms: 0,
        deadline_at_ms: 0,
        state: RecordState::Invalid,
        reserves: 0,
        timeouts: 0,
        releases: 0,
        buries: 0,
        kicks: 0,
        tube: None,
        body: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_default(engine: &mut Engine, session: SessionId, pri: u32) -> JobId {
        engine.put(session, pri, 0, 60, b"job".to_vec()).unwrap()
    }

    #[test]
    fn put_then_reserve_round_trips() {
        let mut engine = Engine::new();
        let producer = engine.create_session();
        let worker = engine.create_session();

        let id = put_default(&mut engine, producer, 100);
        let reserved = engine.reserve_immediate(worker);
        assert_eq!(reserved, Some(id));
        assert_eq!(engine.peek(id).unwrap().state, JobState::Reserved);
    }

    #[test]
    fn reserve_picks_lowest_priority_then_lowest_id() {
        let mut engine = Engine::new();
        let producer = engine.create_session();
        let worker = engine.create_session();

        let _high = put_default(&mut engine, producer, 500);
        let low = put_default(&mut engine, producer, 10);

        assert_eq!(engine.reserve_immediate(worker), Some(low));
    }

    #[test]
    fn delete_rejects_other_sessions_reservation() {
        let mut engine = Engine::new();
        let producer = engine.create_session();
        let worker_a = engine.create_session();
        let worker_b = engine.create_session();

        let id = put_default(&mut engine, producer, 10);
        engine.reserve_immediate(worker_a);

        assert_eq!(engine.delete(worker_b, id), Err(EngineError::NotFound));
        assert_eq!(engine.delete(worker_a, id), Ok(()));
    }

    #[test]
    fn release_with_delay_moves_job_to_delayed() {
        let mut engine = Engine::new();
        let producer = engine.create_session();
        let worker = engine.create_session();

        let id = put_default(&mut engine, producer, 10);
        engine.reserve_immediate(worker);
        engine.release(worker, id, 20, 5).unwrap();

        assert_eq!(engine.peek(id).unwrap().state, JobState::Delayed);
        assert_eq!(engine.peek(id).unwrap().priority, 20);
    }

    #[test]
    fn bury_then_kick_returns_job_to_ready() {
        let mut engine = Engine::new();
        let producer = engine.create_session();
        let worker = engine.create_session();

        let id = put_default(&mut engine, producer, 10);
        engine.reserve_immediate(worker);
        engine.bury(worker, id, 10).unwrap();
        assert_eq!(engine.peek(id).unwrap().state, JobState::Buried);

        let kicked = engine.kick(producer, 10);
        assert_eq!(kicked, 1);
        assert_eq!(engine.peek(id).unwrap().state, JobState::Ready);
    }

    #[test]
    fn ignore_last_watched_tube_fails() {
        let mut engine = Engine::new();
        let session = engine.create_session();
        assert_eq!(engine.ignore(session, &TubeName::default()), Err(EngineError::NotIgnored));
    }

    #[test]
    fn watch_then_ignore_non_default_succeeds() {
        let mut engine = Engine::new();
        let session = engine.create_session();
        engine.watch(session, TubeName::new("jobs"));
        assert_eq!(engine.ignore(session, &TubeName::default()), Ok(1));
    }

    #[test]
    fn close_session_requeues_its_reservations() {
        let mut engine = Engine::new();
        let producer = engine.create_session();
        let worker = engine.create_session();

        let id = put_default(&mut engine, producer, 10);
        engine.reserve_immediate(worker);
        engine.close_session(worker);

        assert_eq!(engine.peek(id).unwrap().state, JobState::Ready);
    }

    #[test]
    fn draining_rejects_put() {
        let mut engine = Engine::new();
        let producer = engine.create_session();
        engine.set_draining(true);
        assert_eq!(engine.put(producer, 10, 0, 60, vec![]), Err(EngineError::Draining));
    }
}
