//! Fiat amounts as integer minor units (kopecks for RUB), per spec.md's data
//! model: "fiat amount (integer minor units)". Never a float: payout,
//! advertisement quantity and receipt amounts are compared for exact
//! equality (I2, I3, P3) and floats would make that comparison unsound.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_minor_units(minor: i64) -> Self {
        Self(minor)
    }

    pub fn minor_units(&self) -> i64 {
        self.0
    }

    /// Absolute difference in minor units, used by the amount-mismatch guard
    /// (spec.md §4.7: "differ by more than 1 fiat unit").
    pub fn abs_diff(&self, other: Money) -> i64 {
        (self.0 - other.0).abs()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, (self.0 % 100).abs())
    }
}
