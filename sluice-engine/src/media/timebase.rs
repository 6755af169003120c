use serde::{Deserialize, Serialize};
use std::fmt;

/// Rational timebase: timestamps count in units of `num/den` seconds.
///
/// Every ingest protocol carries its own clock (RTMP 1/1000, RTP
/// 1/clockrate, MPEG-TS 1/90000); packets keep their timebase explicit so
/// downstream muxers can rescale without guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timebase {
    pub num: u32,
    pub den: u32,
}

impl Timebase {
    pub const MILLIS: Self = Self::new(1, 1_000);
    pub const MPEG: Self = Self::new(1, 90_000);

    #[must_use]
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Timebase of one RTP clock: 1/clockrate.
    #[must_use]
    pub const fn rtp(clock_rate: u32) -> Self {
        Self::new(1, clock_rate)
    }

    /// Rescale `value` from this timebase into `to`, rounding to nearest
    /// with 128-bit intermediates so no representable input overflows.
    #[must_use]
    pub fn rescale(self, value: i64, to: Self) -> i64 {
        if self == to {
            return value;
        }
        let num = i128::from(value) * i128::from(self.num) * i128::from(to.den);
        let den = i128::from(self.den) * i128::from(to.num);
        let rounded = if num >= 0 {
            (num + den / 2) / den
        } else {
            (num - den / 2) / den
        };
        rounded as i64
    }
}

impl fmt::Display for Timebase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_rescale() {
        let tb = Timebase::MPEG;
        assert_eq!(tb.rescale(123_456_789, tb), 123_456_789);
    }

    #[test]
    fn test_millis_to_mpeg() {
        assert_eq!(Timebase::MILLIS.rescale(1_000, Timebase::MPEG), 90_000);
        assert_eq!(Timebase::MILLIS.rescale(33, Timebase::MPEG), 2_970);
    }

    #[test]
    fn test_round_trip_within_one_unit() {
        let from = Timebase::rtp(48_000);
        let to = Timebase::MPEG;
        for v in [0i64, 1, 47, 480, 12_345, 987_654_321] {
            let there = from.rescale(v, to);
            let back = to.rescale(there, from);
            assert!((back - v).abs() <= 1, "v={v} there={there} back={back}");
        }
    }

    #[test]
    fn test_negative_values_round_symmetrically() {
        let from = Timebase::MILLIS;
        let to = Timebase::MPEG;
        assert_eq!(from.rescale(-1_000, to), -90_000);
        assert_eq!(from.rescale(-33, to), -2_970);
    }

    #[test]
    fn test_monotonic_inputs_stay_monotonic() {
        let from = Timebase::rtp(90_000);
        let to = Timebase::rtp(48_000);
        let mut last = i64::MIN;
        for v in (0..10_000).step_by(7) {
            let r = from.rescale(v, to);
            assert!(r >= last);
            last = r;
        }
    }
}
