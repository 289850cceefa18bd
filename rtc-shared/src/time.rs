use std::ops::Add;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::units::{TimeDelta, Timestamp};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET_SECS: u64 = 0x83AA7E80;

/// Anchors a monotonic [`Instant`] to the wall clock so that sans-IO
/// components can be driven with `Instant` while reasoning in NTP or
/// [`Timestamp`] time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemInstant {
    instant: Instant,
    duration_since_unix_epoch: Duration,
}

impl SystemInstant {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            duration_since_unix_epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_secs(0)),
        }
    }

    /// Anchors `instant` at `duration_since_unix_epoch`; used to make runs
    /// reproducible.
    pub fn new(instant: Instant, duration_since_unix_epoch: Duration) -> Self {
        Self {
            instant,
            duration_since_unix_epoch,
        }
    }

    pub fn instant(&self, duration_since_unix_epoch: Duration) -> Instant {
        self.instant + duration_since_unix_epoch - self.duration_since_unix_epoch
    }

    pub fn duration_since_unix_epoch(&self) -> Duration {
        self.duration_since_unix_epoch
    }

    pub fn unix(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.instant)
            .add(self.duration_since_unix_epoch)
    }

    pub fn ntp(&self, now: Instant) -> u64 {
        SystemInstant::unix2ntp(self.unix(now))
    }

    /// `now` as a [`Timestamp`] counted from the Unix epoch.
    pub fn timestamp(&self, now: Instant) -> Timestamp {
        Timestamp::from_micros(self.unix(now).as_micros() as i64)
    }

    pub fn unix2ntp(duration_since_unix_epoch: Duration) -> u64 {
        let u = duration_since_unix_epoch.as_nanos() as u64;

        let mut s = u / 1_000_000_000;
        s += NTP_UNIX_OFFSET_SECS;
        let mut f = u % 1_000_000_000;
        f <<= 32;
        f /= 1_000_000_000;
        s <<= 32;

        s | f
    }

    pub fn ntp2unix(ntp: u64) -> Duration {
        let s = (ntp >> 32).saturating_sub(NTP_UNIX_OFFSET_SECS);
        let mut f = ntp & 0xFFFFFFFF;
        f *= 1_000_000_000;
        f >>= 32;

        Duration::new(s, f as u32)
    }
}

/// Converts a [`Timestamp`] counted from the Unix epoch into 64-bit NTP time.
/// Times before the epoch map to the epoch.
pub fn timestamp_to_ntp(t: Timestamp) -> u64 {
    let micros = if t.is_finite() { t.us().max(0) } else { 0 };
    SystemInstant::unix2ntp(Duration::from_micros(micros as u64))
}

/// Middle 32 bits of a 64-bit NTP time, i.e. 16.16 fixed point seconds.
pub fn compact_ntp(ntp: u64) -> u32 {
    (ntp >> 16) as u32
}

/// Converts a 16.16 fixed point interval to a [`TimeDelta`], rounding to the
/// nearest microsecond.
pub fn compact_ntp_interval_to_time_delta(interval: u32) -> TimeDelta {
    TimeDelta::from_micros(((u64::from(interval) * 1_000_000 + (1 << 15)) >> 16) as i64)
}

/// Signed distance from `from` to `to` in compact NTP time, tolerating
/// wrap-around of the 32-bit counter.
pub fn compact_ntp_diff(from: u32, to: u32) -> TimeDelta {
    let diff = to.wrapping_sub(from);
    if diff < 0x8000_0000 {
        compact_ntp_interval_to_time_delta(diff)
    } else {
        -compact_ntp_interval_to_time_delta(from.wrapping_sub(to))
    }
}
