//! Strongly typed time, size and rate units.
//!
//! Every unit wraps a signed 64-bit integer and reserves `i64::MAX` and
//! `i64::MIN` for plus and minus infinity. Arithmetic saturates at the
//! infinities instead of overflowing, so deadlines such as
//! `Timestamp::minus_infinity() + TimeDelta::from_seconds(5)` stay well
//! defined.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

const PLUS_INF: i64 = i64::MAX;
const MINUS_INF: i64 = i64::MIN;

#[inline]
fn is_inf(v: i64) -> bool {
    v == PLUS_INF || v == MINUS_INF
}

/// Adds two raw unit values, propagating infinities.
#[inline]
fn add_raw(a: i64, b: i64) -> i64 {
    if is_inf(a) {
        a
    } else if is_inf(b) {
        b
    } else {
        a.saturating_add(b).clamp(MINUS_INF + 1, PLUS_INF - 1)
    }
}

#[inline]
fn neg_raw(v: i64) -> i64 {
    match v {
        PLUS_INF => MINUS_INF,
        MINUS_INF => PLUS_INF,
        v => -v,
    }
}

#[inline]
fn sub_raw(a: i64, b: i64) -> i64 {
    add_raw(a, neg_raw(b))
}

#[inline]
fn scale_raw(v: i64, factor: f64) -> i64 {
    if is_inf(v) {
        if factor < 0.0 { neg_raw(v) } else { v }
    } else {
        let scaled = (v as f64 * factor).round();
        if scaled >= PLUS_INF as f64 {
            PLUS_INF - 1
        } else if scaled <= MINUS_INF as f64 {
            MINUS_INF + 1
        } else {
            scaled as i64
        }
    }
}

macro_rules! unit_common {
    ($name:ident) => {
        impl $name {
            pub const fn zero() -> Self {
                Self(0)
            }

            pub const fn plus_infinity() -> Self {
                Self(PLUS_INF)
            }

            pub const fn minus_infinity() -> Self {
                Self(MINUS_INF)
            }

            pub fn is_zero(&self) -> bool {
                self.0 == 0
            }

            pub fn is_finite(&self) -> bool {
                !is_inf(self.0)
            }

            pub fn is_infinite(&self) -> bool {
                is_inf(self.0)
            }

            pub fn is_plus_infinity(&self) -> bool {
                self.0 == PLUS_INF
            }

            pub fn is_minus_infinity(&self) -> bool {
                self.0 == MINUS_INF
            }
        }
    };
}

/// A signed span of time with microsecond resolution.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeDelta(i64);

unit_common!(TimeDelta);

impl TimeDelta {
    pub const fn from_seconds(seconds: i64) -> Self {
        Self(seconds * 1_000_000)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000)
    }

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn from_seconds_f64(seconds: f64) -> Self {
        if seconds.is_infinite() {
            if seconds > 0.0 {
                Self::plus_infinity()
            } else {
                Self::minus_infinity()
            }
        } else {
            Self(scale_raw(1_000_000, seconds))
        }
    }

    pub fn us(&self) -> i64 {
        self.0
    }

    /// Milliseconds, rounded towards zero.
    pub fn ms(&self) -> i64 {
        if self.is_infinite() {
            self.0
        } else {
            self.0 / 1_000
        }
    }

    pub fn seconds_f64(&self) -> f64 {
        match self.0 {
            PLUS_INF => f64::INFINITY,
            MINUS_INF => f64::NEG_INFINITY,
            v => v as f64 / 1_000_000.0,
        }
    }

    pub fn abs(&self) -> Self {
        if self.0 < 0 { -*self } else { *self }
    }
}

impl Add for TimeDelta {
    type Output = TimeDelta;

    fn add(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta(add_raw(self.0, rhs.0))
    }
}

impl Sub for TimeDelta {
    type Output = TimeDelta;

    fn sub(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta(sub_raw(self.0, rhs.0))
    }
}

impl AddAssign for TimeDelta {
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl SubAssign for TimeDelta {
    fn sub_assign(&mut self, rhs: TimeDelta) {
        *self = *self - rhs;
    }
}

impl Neg for TimeDelta {
    type Output = TimeDelta;

    fn neg(self) -> TimeDelta {
        TimeDelta(neg_raw(self.0))
    }
}

impl Mul<f64> for TimeDelta {
    type Output = TimeDelta;

    fn mul(self, rhs: f64) -> TimeDelta {
        TimeDelta(scale_raw(self.0, rhs))
    }
}

impl Mul<i64> for TimeDelta {
    type Output = TimeDelta;

    fn mul(self, rhs: i64) -> TimeDelta {
        TimeDelta(scale_raw(self.0, rhs as f64))
    }
}

impl Div<i64> for TimeDelta {
    type Output = TimeDelta;

    fn div(self, rhs: i64) -> TimeDelta {
        if self.is_infinite() || rhs == 0 {
            self
        } else {
            TimeDelta(self.0 / rhs)
        }
    }
}

impl fmt::Display for TimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            PLUS_INF => write!(f, "+inf ms"),
            MINUS_INF => write!(f, "-inf ms"),
            v if v % 1_000 == 0 => write!(f, "{} ms", v / 1_000),
            v => write!(f, "{v} us"),
        }
    }
}

/// A point in time with microsecond resolution.
///
/// The epoch is chosen by the caller. Interceptors use the Unix epoch, see
/// [`crate::time::SystemInstant::timestamp`].
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

unit_common!(Timestamp);

impl Timestamp {
    pub const fn from_seconds(seconds: i64) -> Self {
        Self(seconds * 1_000_000)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000)
    }

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn us(&self) -> i64 {
        self.0
    }

    pub fn ms(&self) -> i64 {
        if self.is_infinite() {
            self.0
        } else {
            self.0 / 1_000
        }
    }
}

impl Add<TimeDelta> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: TimeDelta) -> Timestamp {
        Timestamp(add_raw(self.0, rhs.0))
    }
}

impl Sub<TimeDelta> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: TimeDelta) -> Timestamp {
        Timestamp(sub_raw(self.0, rhs.0))
    }
}

impl Sub for Timestamp {
    type Output = TimeDelta;

    fn sub(self, rhs: Timestamp) -> TimeDelta {
        TimeDelta(sub_raw(self.0, rhs.0))
    }
}

impl AddAssign<TimeDelta> for Timestamp {
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl SubAssign<TimeDelta> for Timestamp {
    fn sub_assign(&mut self, rhs: TimeDelta) {
        *self = *self - rhs;
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            PLUS_INF => write!(f, "+inf ms"),
            MINUS_INF => write!(f, "-inf ms"),
            v => write!(f, "{} ms", v / 1_000),
        }
    }
}

/// An amount of data in bytes.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataSize(i64);

unit_common!(DataSize);

impl DataSize {
    pub const fn from_bytes(bytes: i64) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> i64 {
        self.0
    }
}

impl Add for DataSize {
    type Output = DataSize;

    fn add(self, rhs: DataSize) -> DataSize {
        DataSize(add_raw(self.0, rhs.0))
    }
}

impl Sub for DataSize {
    type Output = DataSize;

    fn sub(self, rhs: DataSize) -> DataSize {
        DataSize(sub_raw(self.0, rhs.0))
    }
}

impl AddAssign for DataSize {
    fn add_assign(&mut self, rhs: DataSize) {
        *self = *self + rhs;
    }
}

impl SubAssign for DataSize {
    fn sub_assign(&mut self, rhs: DataSize) {
        *self = *self - rhs;
    }
}

impl Div<DataRate> for DataSize {
    type Output = TimeDelta;

    /// Time needed to transfer `self` at `rhs`.
    fn div(self, rhs: DataRate) -> TimeDelta {
        if self.is_infinite() || rhs.0 <= 0 {
            if self.0 < 0 {
                return TimeDelta::minus_infinity();
            }
            return TimeDelta::plus_infinity();
        }
        if rhs.is_infinite() {
            return TimeDelta::zero();
        }
        let micros = i128::from(self.0) * 8_000_000 / i128::from(rhs.0);
        TimeDelta(clamp_i128(micros))
    }
}

impl Div<TimeDelta> for DataSize {
    type Output = DataRate;

    /// Rate at which `self` is transferred during `rhs`.
    fn div(self, rhs: TimeDelta) -> DataRate {
        if self.is_infinite() || rhs.0 <= 0 {
            return DataRate::plus_infinity();
        }
        if rhs.is_infinite() {
            return DataRate::zero();
        }
        let bps = i128::from(self.0) * 8_000_000 / i128::from(rhs.0);
        DataRate(clamp_i128(bps))
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            PLUS_INF => write!(f, "+inf bytes"),
            MINUS_INF => write!(f, "-inf bytes"),
            v => write!(f, "{v} bytes"),
        }
    }
}

/// A data rate in bits per second.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataRate(i64);

unit_common!(DataRate);

impl DataRate {
    pub const fn from_bps(bps: i64) -> Self {
        Self(bps)
    }

    pub const fn from_kbps(kbps: i64) -> Self {
        Self(kbps * 1_000)
    }

    pub fn bps(&self) -> i64 {
        self.0
    }

    pub fn kbps(&self) -> i64 {
        if self.is_infinite() {
            self.0
        } else {
            self.0 / 1_000
        }
    }

    pub fn bps_f64(&self) -> f64 {
        match self.0 {
            PLUS_INF => f64::INFINITY,
            MINUS_INF => f64::NEG_INFINITY,
            v => v as f64,
        }
    }
}

impl Add for DataRate {
    type Output = DataRate;

    fn add(self, rhs: DataRate) -> DataRate {
        DataRate(add_raw(self.0, rhs.0))
    }
}

impl Sub for DataRate {
    type Output = DataRate;

    fn sub(self, rhs: DataRate) -> DataRate {
        DataRate(sub_raw(self.0, rhs.0))
    }
}

impl Mul<f64> for DataRate {
    type Output = DataRate;

    fn mul(self, rhs: f64) -> DataRate {
        DataRate(scale_raw(self.0, rhs))
    }
}

impl Mul<DataRate> for f64 {
    type Output = DataRate;

    fn mul(self, rhs: DataRate) -> DataRate {
        rhs * self
    }
}

impl Mul<i64> for DataRate {
    type Output = DataRate;

    fn mul(self, rhs: i64) -> DataRate {
        DataRate(scale_raw(self.0, rhs as f64))
    }
}

impl Mul<DataRate> for i64 {
    type Output = DataRate;

    fn mul(self, rhs: DataRate) -> DataRate {
        rhs * self
    }
}

impl Mul<TimeDelta> for DataRate {
    type Output = DataSize;

    fn mul(self, rhs: TimeDelta) -> DataSize {
        rhs * self
    }
}

impl Mul<DataRate> for TimeDelta {
    type Output = DataSize;

    /// Data transferred at `rhs` during `self`, rounded to the nearest byte.
    fn mul(self, rhs: DataRate) -> DataSize {
        if self.is_infinite() || rhs.is_infinite() {
            if (self.0 < 0) != (rhs.0 < 0) {
                return DataSize::minus_infinity();
            }
            return DataSize::plus_infinity();
        }
        let microbits = i128::from(self.0) * i128::from(rhs.0);
        DataSize(clamp_i128((microbits + 4_000_000).div_euclid(8_000_000)))
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            PLUS_INF => write!(f, "+inf bps"),
            MINUS_INF => write!(f, "-inf bps"),
            v if v % 1_000 == 0 => write!(f, "{} kbps", v / 1_000),
            v => write!(f, "{v} bps"),
        }
    }
}

fn clamp_i128(v: i128) -> i64 {
    v.clamp(i128::from(MINUS_INF + 1), i128::from(PLUS_INF - 1)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infinity_saturates() {
        let t = Timestamp::minus_infinity() + TimeDelta::from_seconds(5);
        assert!(t.is_minus_infinity());

        let d = Timestamp::from_millis(10) - Timestamp::minus_infinity();
        assert!(d.is_plus_infinity());
        assert!(d > TimeDelta::from_seconds(1));

        let t = Timestamp::from_millis(10) + TimeDelta::plus_infinity();
        assert!(t.is_plus_infinity());

        assert!((DataRate::plus_infinity() * 0.5).is_plus_infinity());
    }

    #[test]
    fn test_rate_arithmetic() {
        assert_eq!(DataRate::from_bps(300) * 3.0, DataRate::from_bps(900));
        assert_eq!(2.0 * DataRate::from_kbps(1), DataRate::from_bps(2000));
        assert_eq!(DataRate::from_bps(300) * 2, DataRate::from_bps(600));
        assert_eq!(DataRate::from_bps(1000) * 0.85, DataRate::from_bps(850));
    }

    #[test]
    fn test_size_rate_time() {
        // 500 kbps for 10 ms moves 625 bytes.
        let size = TimeDelta::from_millis(10) * DataRate::from_kbps(500);
        assert_eq!(size, DataSize::from_bytes(625));

        let time = DataSize::from_bytes(625) / DataRate::from_kbps(500);
        assert_eq!(time, TimeDelta::from_millis(10));

        let rate = DataSize::from_bytes(625) / TimeDelta::from_millis(10);
        assert_eq!(rate, DataRate::from_kbps(500));

        assert!((DataSize::from_bytes(1) / DataRate::zero()).is_plus_infinity());
    }

    #[test]
    fn test_ordering_and_clamp() {
        let min = TimeDelta::from_millis(25);
        let max = TimeDelta::from_millis(500);
        assert_eq!(TimeDelta::from_millis(1).clamp(min, max), min);
        assert_eq!(TimeDelta::from_seconds(3).clamp(min, max), max);
        assert!(DataRate::plus_infinity() > DataRate::from_kbps(5000));
        assert!(Timestamp::minus_infinity() < Timestamp::zero());
    }

    #[test]
    fn test_display() {
        assert_eq!(TimeDelta::from_millis(25).to_string(), "25 ms");
        assert_eq!(DataRate::from_kbps(300).to_string(), "300 kbps");
        assert_eq!(DataRate::plus_infinity().to_string(), "+inf bps");
    }
}
