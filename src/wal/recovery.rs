use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;

use super::record::{Record, RecordState};
use super::writer::shard_path;

/// A job as reconstructed from the log, merging its full `put` record with
/// every subsequent delta. `state` has already had `Reserved` reduced to
/// `Ready`, per "no reservation may survive restart".
#[derive(Debug, Clone)]
pub struct RecoveredJob {
    pub id: u64,
    pub tube: String,
    pub priority: u32,
    pub delay_secs: u32,
    pub ttr_secs: u32,
    pub created_at_ms: u64,
    pub deadline_at_ms: u64,
    pub state: RecordState,
    pub reserves: u32,
    pub timeouts: u32,
    pub releases: u32,
    pub buries: u32,
    pub kicks: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct RecoveredState {
    pub jobs: HashMap<u64, RecoveredJob>,
    /// The highest job id seen in the log, including ids later deleted —
    /// the id counter must never reuse a deleted id.
    pub max_id_seen: u64,
}

/// Replays every shard file under `dir`, folding full and delta records
/// into a final in-memory image (§4.6 "Replay").
pub fn replay(dir: &Path, shards: usize) -> io::Result<RecoveredState> {
    let mut state = RecoveredState::default();

    for shard in 0..shards {
        let path = shard_path(dir, shard);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };

        let mut offset = 0usize;
        while offset < data.len() {
            let Some((record, consumed)) = Record::decode(&data[offset..]) else {
                warn!(
                    path = %path.display(),
                    offset,
                    remaining = data.len() - offset,
                    "unreadable WAL tail, treating as end of file"
                );
                break;
            };

            apply(&mut state, record);
            offset += consumed;
        }
    }

    Ok(state)
}

fn apply(state: &mut RecoveredState, record: Record) {
    state.max_id_seen = state.max_id_seen.max(record.id);

    if record.state == RecordState::Invalid {
        state.jobs.remove(&record.id);
        return;
    }

    let normalized_state = if record.state == RecordState::Reserved {
        RecordState::Ready
    } else {
        record.state
    };

    if let (Some(tube), Some(body)) = (record.tube, record.body) {
        state.jobs.insert(
            record.id,
            RecoveredJob {
                id: record.id,
                tube,
                priority: record.priority,
                delay_secs: record.delay_secs,
                ttr_secs: record.ttr_secs,
                created_at_ms: record.created_at_ms,
                deadline_at_ms: record.deadline_at_ms,
                state: normalized_state,
                reserves: record.reserves,
                timeouts: record.timeouts,
                releases: record.releases,
                buries: record.buries,
                kicks: record.kicks,
                body,
            },
        );
        return;
    }

    // Delta: merge onto an existing full record. A delta for an id with no
    // prior full record is a corrupt/truncated log artifact — there is no
    // tube or body to construct a job from, so it is dropped.
    match state.jobs.get_mut(&record.id) {
        Some(existing) => {
            existing.priority = record.priority;
            existing.delay_secs = record.delay_secs;
            existing.ttr_secs = record.ttr_secs;
            existing.created_at_ms = record.created_at_ms;
            existing.deadline_at_ms = record.deadline_at_ms;
            existing.state = normalized_state;
            existing.reserves = record.reserves;
            existing.timeouts = record.timeouts;
            existing.releases = record.releases;
            existing.buries = record.buries;
            existing.kicks = record.kicks;
        },
        None => {
            warn!(id = record.id, "delta record for unknown job id, ignoring");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::writer::WalWriter;

    fn full(id: u64, tube: &str, state: RecordState) -> Record {
        Record {
            id,
            delay_secs: 0,
            ttr_secs: 60,
            priority: 100,
            created_at_ms: 1_000,
            deadline_at_ms: 0,
            state,
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
            tube: Some(tube.into()),
            body: Some(b"x".to_vec()),
        }
    }

    fn delta(id: u64, state: RecordState) -> Record {
        Record {
            id,
            delay_secs: 0,
            ttr_secs: 60,
            priority: 200,
            created_at_ms: 1_000,
            deadline_at_ms: 0,
            state,
            reserves: 1,
            timeouts: 0,
            releases: 1,
            buries: 0,
            kicks: 0,
            tube: None,
            body: None,
        }
    }

    #[test]
    fn replays_put_then_release_delta() {
        let dir = tempdir();
        let mut w = WalWriter::open(dir.path(), 2).unwrap();
        w.append(&full(1, "default", RecordState::Ready)).unwrap();
        w.append(&delta(1, RecordState::Ready)).unwrap();

        let state = replay(dir.path(), 2).unwrap();
        let job = state.jobs.get(&1).unwrap();
        assert_eq!(job.priority, 200);
        assert_eq!(job.releases, 1);
        assert_eq!(state.max_id_seen, 1);
    }

    #[test]
    fn delete_removes_job() {
        let dir = tempdir();
        let mut w = WalWriter::open(dir.path(), 1).unwrap();
        w.append(&full(5, "default", RecordState::Ready)).unwrap();
        w.append(&delta(5, RecordState::Invalid)).unwrap();

        let state = replay(dir.path(), 1).unwrap();
        assert!(state.jobs.get(&5).is_none());
        assert_eq!(state.max_id_seen, 5);
    }

    #[test]
    fn reserved_downgrades_to_ready_on_recovery() {
        let dir = tempdir();
        let mut w = WalWriter::open(dir.path(), 1).unwrap();
        w.append(&full(9, "default", RecordState::Reserved))
            .unwrap();

        let state = replay(dir.path(), 1).unwrap();
        assert_eq!(state.jobs.get(&9).unwrap().state, RecordState::Ready);
    }

    fn tempdir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }
}
