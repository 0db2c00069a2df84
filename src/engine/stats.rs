use crate::types::states::JobState;
use crate::types::tube::TubeStats;
use crate::types::{JobId, TubeName};

/// The engine's own view of a job's stats, independent of the wire format —
/// [`crate::wire::protocol::JobStats`] is built from this by the command
/// dispatch layer, which also knows the server's binlog-index and file
/// fields (always zero here; this server keeps no binlog index).
#[derive(Debug, Clone)]
pub struct JobStatsSnapshot {
    pub id: JobId,
    pub tube: TubeName,
    pub state: JobState,
    pub priority: u32,
    pub age_secs: u64,
    pub delay_secs: u32,
    pub ttr_secs: u32,
    pub time_left_secs: u64,
    pub reserves: u32,
    pub timeouts: u32,
    pub releases: u32,
    pub buries: u32,
    pub kicks: u32,
}

#[derive(Debug, Clone)]
pub struct TubeStatsSnapshot {
    pub name: TubeName,
    pub stats: TubeStats,
    pub pause_time_left_secs: u64,
}

/// Server-wide counters, bridged into
/// [`crate::wire::protocol::ServerStats`] by the caller, which fills in the
/// process-level fields (pid, hostname, rusage, ...) this module has no
/// business knowing about.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub current_jobs_urgent: u64,
    pub current_jobs_ready: u64,
    pub current_jobs_reserved: u64,
    pub current_jobs_delayed: u64,
    pub current_jobs_buried: u64,
    pub current_tubes: u64,
    pub current_connections: u64,
    pub current_producers: u64,
    pub current_workers: u64,
    pub current_waiting: u64,
    pub total_connections: u64,
    pub total_jobs: u64,
    pub job_timeouts: u64,
    pub draining: bool,
    pub uptime_secs: u64,

    pub cmd_put: u64,
    pub cmd_peek: u64,
    pub cmd_peek_ready: u64,
    pub cmd_peek_delayed: u64,
    pub cmd_peek_buried: u64,
    pub cmd_reserve: u64,
    pub cmd_reserve_with_timeout: u64,
    pub cmd_touch: u64,
    pub cmd_use: u64,
    pub cmd_watch: u64,
    pub cmd_ignore: u64,
    pub cmd_delete: u64,
    pub cmd_release: u64,
    pub cmd_bury: u64,
    pub cmd_kick: u64,
    pub cmd_stats: u64,
    pub cmd_stats_job: u64,
    pub cmd_stats_tube: u64,
    pub cmd_list_tubes: u64,
    pub cmd_list_tube_used: u64,
    pub cmd_list_tubes_watched: u64,
    pub cmd_pause_tube: u64,
}
