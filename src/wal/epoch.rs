use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Converts between [`tokio::time::Instant`] (monotonic, process-local) and
/// milliseconds since the Unix epoch (the timestamp representation the WAL
/// record format uses, per its on-disk layout).
///
/// A single `EpochClock` is created once at process startup by pinning
/// `(Instant::now(), SystemTime::now())` together; every later conversion is
/// just arithmetic on the offset between a given instant and that pin.
#[derive(Clone, Copy, Debug)]
pub struct EpochClock {
    pin_instant: Instant,
    pin_epoch_ms: u64,
}

impl EpochClock {
    pub fn now() -> Self {
        Self {
            pin_instant: Instant::now(),
            pin_epoch_ms: epoch_ms_now(),
        }
    }

    pub fn to_epoch_ms(&self, instant: Instant) -> u64 {
        if instant >= self.pin_instant {
            self.pin_epoch_ms
                .saturating_add((instant - self.pin_instant).as_millis() as u64)
        } else {
            self.pin_epoch_ms
                .saturating_sub((self.pin_instant - instant).as_millis() as u64)
        }
    }

    pub fn to_instant(&self, epoch_ms: u64) -> Instant {
        if epoch_ms >= self.pin_epoch_ms {
            self.pin_instant + Duration::from_millis(epoch_ms - self.pin_epoch_ms)
        } else {
            self.pin_instant - Duration::from_millis(self.pin_epoch_ms - epoch_ms)
        }
    }
}

fn epoch_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
