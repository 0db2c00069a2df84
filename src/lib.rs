//! Core of a standalone, in-memory job queue server compatible with the
//! beanstalkd wire protocol.
//!
//! [`engine`] owns the job-lifecycle state machine: jobs, tubes, sessions,
//! the priority-ordered ready queues, dispatch of ready jobs to waiting
//! workers, and the periodic sweeps that drive delay/TTR/pause/reserve-
//! timeout expiry. [`wal`] makes that state crash-recoverable. [`wire`] and
//! [`config`] are the ambient collaborators that translate the beanstalkd
//! text protocol and process configuration into calls against the engine;
//! they hold no job-lifecycle state of their own.

pub mod config;
pub mod engine;
pub mod types;
pub mod wal;
pub mod wire;
