//! Scaled-integer price/volume arithmetic.
//!
//! All arithmetic feeding detector thresholds, ratios, means and z-scores
//! runs on `FixedPoint`, a signed 128-bit mantissa at scale 8. Floating
//! point is admitted only at boundaries: input parsing (via `rust_decimal`),
//! output rendering, and the normal-CDF calls in the statistics layer.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use std::str::FromStr;

/// Decimal places carried by the fixed-point representation.
pub const SCALE: u32 = 8;

/// 10^SCALE.
const UNIT: i128 = 100_000_000;

/// Fixed-point number: mantissa at scale 8 (`1.0` == `100_000_000`).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FixedPoint(i128);

impl FixedPoint {
    pub const ZERO: FixedPoint = FixedPoint(0);
    pub const ONE: FixedPoint = FixedPoint(UNIT);

    /// Construct from a raw scale-8 mantissa.
    pub const fn from_raw(raw: i128) -> Self {
        FixedPoint(raw)
    }

    pub const fn raw(self) -> i128 {
        self.0
    }

    pub const fn from_int(v: i64) -> Self {
        FixedPoint(v as i128 * UNIT)
    }

    /// Boundary conversion. Rounds to the nearest representable value.
    pub fn from_f64(v: f64) -> Self {
        FixedPoint((v * UNIT as f64).round() as i128)
    }

    /// Boundary conversion for rendering and CDF calls only.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / UNIT as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn abs(self) -> Self {
        FixedPoint(self.0.abs())
    }

    pub fn min(self, other: Self) -> Self {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }

    pub fn max(self, other: Self) -> Self {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }

    /// Clamp into `[lo, hi]`.
    pub fn clamp(self, lo: Self, hi: Self) -> Self {
        self.max(lo).min(hi)
    }

    /// Multiply by an unscaled integer.
    pub fn mul_int(self, n: i64) -> Self {
        FixedPoint(self.0 * n as i128)
    }

    /// Division that yields zero on a zero divisor instead of panicking.
    pub fn safe_div(self, divisor: Self) -> Self {
        if divisor.0 == 0 {
            FixedPoint::ZERO
        } else {
            FixedPoint(self.0 * UNIT / divisor.0)
        }
    }

    /// `self / (self + other)`, zero when both are zero.
    pub fn ratio_of_total(self, other: Self) -> Self {
        self.safe_div(self + other)
    }

    /// Parse an exchange decimal string, e.g. `"16800.50"`.
    pub fn parse(s: &str) -> Result<Self, FixedPointParseError> {
        let d = Decimal::from_str(s.trim()).map_err(|e| FixedPointParseError {
            input: s.to_string(),
            reason: e.to_string(),
        })?;
        Self::try_from_decimal(d).ok_or_else(|| FixedPointParseError {
            input: s.to_string(),
            reason: "out of fixed-point range".to_string(),
        })
    }

    fn try_from_decimal(d: Decimal) -> Option<Self> {
        let mantissa = d.mantissa();
        let scale = d.scale();
        let raw = if scale <= SCALE {
            mantissa.checked_mul(10i128.checked_pow(SCALE - scale)?)?
        } else {
            // Truncate extra precision toward zero.
            mantissa / 10i128.pow(scale - SCALE)
        };
        Some(FixedPoint(raw))
    }

    /// Render as a normalized decimal string.
    pub fn to_decimal(self) -> Decimal {
        Decimal::from_i128_with_scale(self.0, SCALE).normalize()
    }

    /// Integer square root of the mantissa interpreted as a squared
    /// quantity, i.e. `sqrt` in value space.
    pub fn sqrt(self) -> Self {
        if self.0 <= 0 {
            return FixedPoint::ZERO;
        }
        // sqrt(raw / UNIT) * UNIT == sqrt(raw * UNIT)
        FixedPoint(isqrt((self.0 as u128) * (UNIT as u128)) as i128)
    }
}

/// Newton's method integer square root.
fn isqrt(v: u128) -> u128 {
    if v < 2 {
        return v;
    }
    let shift = (128 - v.leading_zeros()).div_ceil(2);
    let mut x = 1u128 << shift;
    loop {
        let y = (x + v / x) >> 1;
        if y >= x {
            return x;
        }
        x = y;
    }
}

#[derive(Debug, Clone)]
pub struct FixedPointParseError {
    pub input: String,
    pub reason: String,
}

impl fmt::Display for FixedPointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid decimal {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for FixedPointParseError {}

impl fmt::Debug for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl Add for FixedPoint {
    type Output = FixedPoint;
    fn add(self, rhs: Self) -> Self {
        FixedPoint(self.0 + rhs.0)
    }
}

impl Sub for FixedPoint {
    type Output = FixedPoint;
    fn sub(self, rhs: Self) -> Self {
        FixedPoint(self.0 - rhs.0)
    }
}

impl Neg for FixedPoint {
    type Output = FixedPoint;
    fn neg(self) -> Self {
        FixedPoint(-self.0)
    }
}

impl AddAssign for FixedPoint {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for FixedPoint {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

/// Scaled multiplication: `(a * b) / UNIT`.
impl Mul for FixedPoint {
    type Output = FixedPoint;
    fn mul(self, rhs: Self) -> Self {
        FixedPoint(self.0 * rhs.0 / UNIT)
    }
}

/// Safe scaled division: zero divisor yields zero.
impl Div for FixedPoint {
    type Output = FixedPoint;
    fn div(self, rhs: Self) -> Self {
        self.safe_div(rhs)
    }
}

impl Sum for FixedPoint {
    fn sum<I: Iterator<Item = FixedPoint>>(iter: I) -> Self {
        iter.fold(FixedPoint::ZERO, |acc, v| acc + v)
    }
}

impl Serialize for FixedPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_decimal().to_string())
    }
}

impl<'de> Deserialize<'de> for FixedPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FixedPoint::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Running mean/variance accumulator over fixed-point samples.
///
/// Sum and sum-of-squares accumulators; never an iterative reduce.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatAccumulator {
    n: u64,
    sum: i128,
    sum_sq: i128,
}

impl StatAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, v: FixedPoint) {
        self.n += 1;
        self.sum += v.0;
        self.sum_sq += v.0 * v.0;
    }

    /// Remove a previously pushed sample (rolling-window eviction).
    pub fn remove(&mut self, v: FixedPoint) {
        debug_assert!(self.n > 0);
        self.n = self.n.saturating_sub(1);
        self.sum -= v.0;
        self.sum_sq -= v.0 * v.0;
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn sum(&self) -> FixedPoint {
        FixedPoint(self.sum)
    }

    pub fn mean(&self) -> FixedPoint {
        if self.n == 0 {
            FixedPoint::ZERO
        } else {
            FixedPoint(self.sum / self.n as i128)
        }
    }

    /// Population variance, `E[x^2] - E[x]^2`.
    pub fn variance(&self) -> FixedPoint {
        if self.n == 0 {
            return FixedPoint::ZERO;
        }
        let n = self.n as i128;
        let mean_raw = self.sum / n;
        let var_raw_sq = self.sum_sq / n - mean_raw * mean_raw;
        if var_raw_sq <= 0 {
            return FixedPoint::ZERO;
        }
        // var_raw_sq carries raw^2 units; rescale back to one UNIT.
        FixedPoint(var_raw_sq / UNIT)
    }

    pub fn std_dev(&self) -> FixedPoint {
        let var_raw_sq = {
            if self.n == 0 {
                return FixedPoint::ZERO;
            }
            let n = self.n as i128;
            let mean_raw = self.sum / n;
            self.sum_sq / n - mean_raw * mean_raw
        };
        if var_raw_sq <= 0 {
            return FixedPoint::ZERO;
        }
        FixedPoint(isqrt(var_raw_sq as u128) as i128)
    }
}

/// Median of a sample set. Sorts a scratch copy.
pub fn median(values: &[FixedPoint]) -> FixedPoint {
    if values.is_empty() {
        return FixedPoint::ZERO;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        FixedPoint((sorted[mid - 1].0 + sorted[mid].0) / 2)
    } else {
        sorted[mid]
    }
}

/// Lossy helper for config boundaries where a `Decimal` is already at hand.
pub fn decimal_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}
