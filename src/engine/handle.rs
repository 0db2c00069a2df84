//! The shared, cloneable front door to an [`Engine`]: a single
//! `parking_lot::Mutex` behind an `Arc`, chosen over an `RwLock` because
//! almost every engine call mutates something, and over a poisoning
//! `std::sync::Mutex` because a panicking command should produce
//! `INTERNAL_ERROR` for its caller, not wedge the lock for every other
//! connection (§7).

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::error;

use super::Engine;
use crate::types::session::ReserveDelivery;
use crate::types::SessionId;

#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Mutex<Engine>>,
}

impl EngineHandle {
    pub fn new(engine: Engine) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    /// Runs `f` against the locked engine. Returns `None` (instead of
    /// propagating) if `f` panics — the caller should treat that as
    /// `INTERNAL_ERROR`, per the protocol layer's error policy.
    pub fn with<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> Option<R> {
        let mut guard = self.inner.lock();
        match panic::catch_unwind(AssertUnwindSafe(|| f(&mut guard))) {
            Ok(result) => Some(result),
            Err(payload) => {
                error!(panic = %panic_message(&payload), "engine command panicked");
                None
            },
        }
    }

    /// The full `reserve`/`reserve-with-timeout`/`reserve-job` protocol:
    /// try for an immediate job, and if none is ready, block on the
    /// session's delivery channel outside the lock until one arrives, the
    /// deadline passes, or the sender is dropped (session closed).
    pub async fn reserve(&self, session_id: SessionId, timeout: Option<Duration>) -> Option<ReserveDelivery> {
        let immediate = self.with(|engine| {
            engine.note_reserve_command(timeout.is_some());
            engine.reserve_immediate(session_id)
        })?;
        if let Some(id) = immediate {
            return Some(ReserveDelivery::Job(id));
        }

        // `reserve-with-timeout 0` is a non-blocking poll: fail fast rather
        // than waiting out a sweep period for the timeout to be noticed.
        if timeout == Some(Duration::ZERO) {
            return Some(ReserveDelivery::TimedOut);
        }

        let rx = self.with(|engine| engine.begin_wait(session_id, timeout))?;

        match rx.await {
            Ok(delivery) => Some(delivery),
            Err(_) => None,
        }
    }

    /// Spawns the background task that drives delay/TTR/pause/reserve-
    /// timeout expiry. The returned handle is aborted by the caller on
    /// shutdown.
    pub fn spawn_periodic_sweep(&self, period: Duration) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            loop {
                ticker.tick().await;
                handle.with(|engine| engine.run_periodic_sweep());
            }
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_delivers_immediately_available_job() {
        let handle = EngineHandle::new(Engine::new());
        let producer = handle.with(|e| e.create_session()).unwrap();
        let worker = handle.with(|e| e.create_session()).unwrap();

        let id = handle.with(|e| e.put(producer, 10, 0, 60, vec![]).unwrap()).unwrap();

        let delivery = handle.reserve(worker, None).await.unwrap();
        match delivery {
            ReserveDelivery::Job(got) => assert_eq!(got, id),
            ReserveDelivery::TimedOut => panic!("expected a job"),
        }
    }

    #[tokio::test]
    async fn with_survives_a_panicking_command() {
        let handle = EngineHandle::new(Engine::new());
        let result = handle.with(|_engine| -> i32 { panic!("boom") });
        assert!(result.is_none());

        // The lock must still be usable afterward.
        let session = handle.with(|e| e.create_session());
        assert!(session.is_some());
    }
}
