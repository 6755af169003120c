use super::timebase::Timebase;
use std::time::Instant;

/// Process-wide monotonic clock. Nanoseconds since an arbitrary origin;
/// never steps backwards, unrelated to wall time.
#[derive(Debug, Clone, Copy)]
pub struct MediaClock {
    origin: Instant,
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    #[must_use]
    pub fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Pairs the wall-clock instant of the first packet of a session with its
/// media timestamp, for end-to-end latency accounting.
#[derive(Debug, Clone, Copy)]
pub struct PacketAnchor {
    pub wall_ns: u64,
    pub media_pts: i64,
    pub timebase: Timebase,
}

impl PacketAnchor {
    #[must_use]
    pub const fn new(wall_ns: u64, media_pts: i64, timebase: Timebase) -> Self {
        Self {
            wall_ns,
            media_pts,
            timebase,
        }
    }

    /// Media-plane latency of a packet observed `wall_ns` now: how far wall
    /// time has run ahead of media time since the anchor.
    #[must_use]
    pub fn latency_ns(&self, wall_ns: u64, media_pts: i64) -> i64 {
        let wall_delta = wall_ns.saturating_sub(self.wall_ns) as i64;
        let media_delta = self
            .timebase
            .rescale(media_pts - self.media_pts, Timebase::new(1, 1_000_000_000));
        wall_delta - media_delta
    }
}

/// Extends wrapping wire timestamps (32-bit RTP, 33-bit MPEG-TS PCR) to a
/// monotonically increasing 64-bit value.
///
/// A jump of more than half the counter range in the expected direction is
/// treated as a rollover; a backward jump of the same size un-rolls (late
/// packet from before the wrap).
#[derive(Debug)]
pub struct TimestampExtender {
    bits: u32,
    last_extended: Option<i64>,
}

impl TimestampExtender {
    /// 32-bit RTP timestamps.
    #[must_use]
    pub const fn rtp() -> Self {
        Self::new(32)
    }

    /// 33-bit PCR / PES timestamps.
    #[must_use]
    pub const fn mpeg() -> Self {
        Self::new(33)
    }

    #[must_use]
    pub const fn new(bits: u32) -> Self {
        Self {
            bits,
            last_extended: None,
        }
    }

    pub fn extend(&mut self, raw: u64) -> i64 {
        let modulus: i64 = 1i64 << self.bits;
        let half = modulus / 2;
        let raw = (raw as i64) & (modulus - 1);

        let extended = match self.last_extended {
            None => raw,
            Some(last) => {
                let base = last & !(modulus - 1);
                let mut candidate = base | raw;
                let delta = candidate - last;
                if delta > half {
                    candidate -= modulus;
                } else if delta < -half {
                    candidate += modulus;
                }
                candidate
            }
        };

        // Late pre-wrap packets must not drag the epoch backwards.
        if self.last_extended.map_or(true, |last| extended > last) {
            self.last_extended = Some(extended);
        }
        extended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = MediaClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_rtp_wrap_extends() {
        let mut ext = TimestampExtender::rtp();
        let near_wrap = u64::from(u32::MAX) - 1_000;
        assert_eq!(ext.extend(near_wrap), near_wrap as i64);
        // Crossing the 32-bit boundary continues upward.
        let wrapped = 2_000u64;
        let extended = ext.extend(wrapped);
        assert_eq!(extended, i64::from(u32::MAX) + 1 + 2_000);
    }

    #[test]
    fn test_rtp_late_packet_before_wrap() {
        let mut ext = TimestampExtender::rtp();
        let near_wrap = u64::from(u32::MAX) - 1_000;
        ext.extend(near_wrap);
        ext.extend(2_000); // post-wrap
        // A straggler from before the wrap resolves below, not 2^32 ahead.
        let late = ext.extend(u64::from(u32::MAX) - 500);
        assert_eq!(late, i64::from(u32::MAX) - 500);
    }

    #[test]
    fn test_pcr_33bit_wrap() {
        let mut ext = TimestampExtender::mpeg();
        let modulus = 1u64 << 33;
        ext.extend(modulus - 90_000);
        let extended = ext.extend(90_000);
        assert_eq!(extended, (modulus + 90_000) as i64);
    }

    #[test]
    fn test_deltas_crossing_half_range() {
        // Synthetic sweep with deltas crossing 2^31.
        let mut ext = TimestampExtender::rtp();
        let step = 1u64 << 30;
        let mut raw = 0u64;
        let mut last = ext.extend(raw);
        for _ in 0..16 {
            raw = (raw + step) & u64::from(u32::MAX);
            let now = ext.extend(raw);
            assert!(now > last, "extension went backwards: {now} <= {last}");
            assert_eq!((now - last) as u64, step);
            last = now;
        }
    }

    #[test]
    fn test_anchor_latency() {
        let anchor = PacketAnchor::new(0, 0, Timebase::MILLIS);
        // 1s of wall time, 900ms of media time: 100ms behind.
        let lat = anchor.latency_ns(1_000_000_000, 900);
        assert_eq!(lat, 100_000_000);
    }
}
