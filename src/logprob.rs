//! Log-space probability arithmetic.
//!
//! Modeled on the inside/outside recursion's use of `log_domain::LogDomain`
//! in `PTA::rec_probability`/`PTA::probability`:
//! values there are stored as natural logs of probabilities, `+` performs
//! log-sum-exp ("OR": either run reaches this state) and `*` adds logs
//! ("AND": independent sub-results combine multiplicatively). The DP here
//! needs the same two operators, but every quantity is already expressed as
//! a log (an edge survival term like `(nu+1)*(-ell)` is never exponentiated
//! back to linear space along the way), so this crate keeps its own small
//! newtype instead of depending on an external crate whose constructor
//! expects a linear-space probability.
//!
//! Zero probability is represented by [`LogProb::MIN`], a large negative
//! sentinel rather than `f64::NEG_INFINITY`, so that downstream arithmetic
//! (subtraction against the total log-likelihood in the posterior step)
//! never produces `NaN` from `-inf - -inf`.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Mul, Sub};

/// Sentinel standing in for log(0). Large enough that it dominates any
/// log-sum-exp, small enough that subtracting two sentinels is finite.
pub const MIN_LLH: f64 = -1e10;

#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct LogProb(f64);

impl LogProb {
    pub const MIN: LogProb = LogProb(MIN_LLH);
    pub const ZERO: LogProb = LogProb(0.0); // log(1), the multiplicative identity

    /// Wraps a value already in log-space.
    pub fn from_log(x: f64) -> Self {
        LogProb(x)
    }

    /// Takes the log of a linear-space probability, substituting
    /// [`LogProb::MIN`] for non-positive input instead of producing `-inf`.
    pub fn from_linear(p: f64) -> Self {
        if p > 0.0 {
            LogProb(p.ln())
        } else {
            LogProb::MIN
        }
    }

    pub fn log_value(self) -> f64 {
        self.0
    }

    pub fn exp(self) -> f64 {
        self.0.exp()
    }

    pub fn is_min(self) -> bool {
        self.0 <= MIN_LLH
    }

    /// log-sum-exp over a slice, with the max-subtraction trick for
    /// numerical stability. Empty input is treated as log(0).
    pub fn log_sum_exp(xs: &[LogProb]) -> LogProb {
        let m = xs.iter().fold(MIN_LLH, |acc, x| acc.max(x.0));
        if m <= MIN_LLH {
            return LogProb::MIN;
        }
        let s: f64 = xs.iter().map(|x| (x.0 - m).exp()).sum();
        LogProb(m + s.ln())
    }
}

impl fmt::Display for LogProb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `a + b` is the probability that either underlying event occurred:
/// log-sum-exp of the two logs.
impl Add for LogProb {
    type Output = LogProb;
    fn add(self, rhs: LogProb) -> LogProb {
        LogProb::log_sum_exp(&[self, rhs])
    }
}

/// `a * b` is the probability of both events: sum of the two logs.
impl Mul for LogProb {
    type Output = LogProb;
    fn mul(self, rhs: LogProb) -> LogProb {
        if self.is_min() || rhs.is_min() {
            LogProb::MIN
        } else {
            LogProb(self.0 + rhs.0)
        }
    }
}

/// `a - b` in log-space is division in linear space; used to normalize a
/// joint log-probability by the total evidence log-likelihood.
impl Sub for LogProb {
    type Output = LogProb;
    fn sub(self, rhs: LogProb) -> LogProb {
        LogProb(self.0 - rhs.0)
    }
}

impl Sum for LogProb {
    fn sum<I: Iterator<Item = LogProb>>(iter: I) -> Self {
        let xs: Vec<LogProb> = iter.collect();
        LogProb::log_sum_exp(&xs)
    }
}

/// Free-function form matching the DP formulas' `log_sum_exp({...})` call
/// sites almost verbatim.
pub fn log_sum_exp(xs: &[LogProb]) -> LogProb {
    LogProb::log_sum_exp(xs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_sum_exp_matches_linear_sum() {
        let a = LogProb::from_linear(0.2);
        let b = LogProb::from_linear(0.5);
        let combined = log_sum_exp(&[a, b]);
        assert!((combined.exp() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn mul_is_log_addition() {
        let a = LogProb::from_linear(0.5);
        let b = LogProb::from_linear(0.25);
        let product = a * b;
        assert!((product.exp() - 0.125).abs() < 1e-9);
    }

    #[test]
    fn min_absorbs_in_product() {
        let a = LogProb::MIN;
        let b = LogProb::from_linear(0.3);
        assert_eq!((a * b).log_value(), MIN_LLH);
    }

    #[test]
    fn empty_log_sum_exp_is_min() {
        assert_eq!(log_sum_exp(&[]).log_value(), MIN_LLH);
    }
}
