use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::FeedError;

/// Money amount represented as **integer cents**.
///
/// Feed amounts are always positive; the [`Classification`] of a transaction
/// carries the direction.
///
/// # Examples
///
/// ```rust
/// use feed_engine::Money;
///
/// let amount = Money::new(12_34);
/// assert_eq!(amount.cents(), 1234);
/// assert_eq!(amount.to_string(), "12.34€");
/// ```
///
/// Parsing from user input (accepts `.` or `,` as decimal separator; rejects >
/// 2 decimals):
///
/// ```rust
/// use feed_engine::Money;
///
/// assert_eq!("10".parse::<Money>().unwrap().cents(), 1000);
/// assert_eq!("10,5".parse::<Money>().unwrap().cents(), 1050);
/// assert!("12.345".parse::<Money>().is_err());
/// ```
///
/// [`Classification`]: crate::Classification
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    /// Creates a new amount from integer cents.
    #[must_use]
    pub const fn new(cents: i64) -> Self {
        Self(cents)
    }

    /// Returns the raw value in cents.
    #[must_use]
    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Returns `true` if the amount is positive.
    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Checked addition (returns `None` on overflow).
    #[must_use]
    pub fn checked_add(self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let euros = abs / 100;
        let cents = abs % 100;
        write!(f, "{sign}{euros}.{cents:02}€")
    }
}

impl From<i64> for Money {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Money> for i64 {
    fn from(value: Money) -> Self {
        value.0
    }
}

impl FromStr for Money {
    type Err = FeedError;

    /// Parses a decimal string into cents.
    ///
    /// Accepts `.` or `,` as decimal separator and an optional leading `+`.
    /// Negative amounts are rejected: direction lives in the classification.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let empty = || FeedError::Validation("empty amount".to_string());
        let invalid = || FeedError::Validation("invalid amount".to_string());
        let overflow = || FeedError::Validation("amount too large".to_string());

        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(empty());
        }
        if trimmed.starts_with('-') {
            return Err(FeedError::Validation(
                "amount must be positive".to_string(),
            ));
        }

        let rest = trimmed.strip_prefix('+').unwrap_or(trimmed).trim();
        if rest.is_empty() {
            return Err(empty());
        }

        let rest = rest.replace(',', ".");
        let mut parts = rest.split('.');
        let euros_str = parts.next().ok_or_else(invalid)?;
        let cents_str = parts.next();

        if parts.next().is_some() {
            return Err(invalid());
        }

        if euros_str.is_empty() || !euros_str.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let euros: i64 = euros_str.parse().map_err(|_| invalid())?;

        let cents: i64 = match cents_str {
            None | Some("") => 0,
            Some(frac) => {
                if !frac.chars().all(|c| c.is_ascii_digit()) {
                    return Err(invalid());
                }
                match frac.len() {
                    1 => frac.parse::<i64>().map_err(|_| invalid())? * 10,
                    2 => frac.parse::<i64>().map_err(|_| invalid())?,
                    _ => return Err(FeedError::Validation("too many decimals".to_string())),
                }
            }
        };

        euros
            .checked_mul(100)
            .and_then(|v| v.checked_add(cents))
            .map(Money)
            .ok_or_else(overflow)
    }
}
