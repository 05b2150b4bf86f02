use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A monotonic estimate of the registry's clock offset from local wall
/// time (§3 "In-broker state"), resynced at start and then every 30s from
/// the periodic timer (§4.4.6). Mitigates, without eliminating, the skew
/// `findOrCreate`'s TTL check is exposed to (§9 open question).
pub struct ClockSync {
    offset_ms: i64,
    last_sync: Option<Instant>,
    resync_interval: Duration,
}

impl ClockSync {
    pub fn new(resync_interval: Duration) -> Self {
        Self {
            offset_ms: 0,
            last_sync: None,
            resync_interval,
        }
    }

    /// Whether a resync is due: never synced yet, or `resync_interval` has
    /// elapsed since the last one.
    pub fn due(&self) -> bool {
        match self.last_sync {
            None => true,
            Some(last) => last.elapsed() >= self.resync_interval,
        }
    }

    /// Records a fresh `(seconds, microseconds)` reading from the
    /// registry's `time` operation (§6).
    pub fn record(&mut self, registry_time: (i64, i64)) {
        let registry_ms = registry_time.0 * 1000 + registry_time.1 / 1000;
        let local_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        self.offset_ms = registry_ms - local_ms;
        self.last_sync = Some(Instant::now());
    }

    /// The current local time as the registry would see it, in
    /// milliseconds — used for `findOrCreate`'s `now` argument and `wz`
    /// creation-time scores.
    pub fn registry_now_ms(&self) -> i64 {
        let local_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        local_ms + self.offset_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_before_first_sync() {
        let clock = ClockSync::new(Duration::from_secs(30));
        assert!(clock.due());
    }

    #[test]
    fn not_due_immediately_after_a_sync() {
        let mut clock = ClockSync::new(Duration::from_secs(30));
        clock.record((1_700_000_000, 0));
        assert!(!clock.due());
    }

    #[test]
    fn offset_shifts_registry_now() {
        let mut clock = ClockSync::new(Duration::from_secs(30));
        let local_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64;
        // Registry clock is one hour ahead.
        clock.record(((local_ms + 3_600_000) / 1000, ((local_ms + 3_600_000) % 1000) * 1000));
        let now = clock.registry_now_ms();
        assert!((now - local_ms - 3_600_000).abs() < 50, "expected ~1h ahead, got {now} vs {local_ms}");
    }
}
