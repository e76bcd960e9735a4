//! ISO-8601 duration parsing for session durations.
//!
//! Supported forms are `PnW` and `PnDTnHnMnS` with any subset of the
//! components, e.g. `PT15M`, `PT1H30M`, `P1D`, `PT0.5S`. Years and months
//! have no fixed length and are rejected. Only the seconds component may
//! carry a fraction.

use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`parse_iso8601`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DurationParseError {
    /// The input is empty.
    #[error("duration is empty")]
    Empty,

    /// The input does not start with `P`.
    #[error("duration must start with 'P': {0:?}")]
    MissingDesignator(String),

    /// The input uses years or months.
    #[error("duration unit '{unit}' has no fixed length and is not supported: {input:?}")]
    UnsupportedUnit {
        /// The rejected unit designator.
        unit: char,
        /// The full input.
        input: String,
    },

    /// The input is not a valid ISO-8601 duration.
    #[error("malformed duration {0:?}")]
    Malformed(String),

    /// The duration does not fit in a [`Duration`].
    #[error("duration {0:?} is too large")]
    Overflow(String),
}

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;
const SECS_PER_WEEK: u64 = 7 * SECS_PER_DAY;

/// Parses an ISO-8601 duration such as `PT15M`.
///
/// # Errors
///
/// Returns a [`DurationParseError`] describing why `input` was rejected.
///
/// # Examples
///
/// ```
/// use spiffe_aws_assume_role::duration::parse_iso8601;
/// use std::time::Duration;
///
/// assert_eq!(parse_iso8601("PT1H30M").unwrap(), Duration::from_secs(5400));
/// assert!(parse_iso8601("P1M").is_err());
/// ```
pub fn parse_iso8601(input: &str) -> Result<Duration, DurationParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Empty);
    }
    let upper = trimmed.to_ascii_uppercase();
    let malformed = || DurationParseError::Malformed(input.to_owned());

    let body = upper
        .strip_prefix('P')
        .ok_or_else(|| DurationParseError::MissingDesignator(input.to_owned()))?;

    let (date, time) = match body.split_once('T') {
        Some((_, "")) => return Err(malformed()),
        Some((date, time)) => (date, Some(time)),
        None => (body, None),
    };
    if date.is_empty() && time.is_none() {
        return Err(malformed());
    }

    let mut total = Duration::ZERO;
    let mut add = |d: Duration| -> Result<(), DurationParseError> {
        total = total
            .checked_add(d)
            .ok_or_else(|| DurationParseError::Overflow(input.to_owned()))?;
        Ok(())
    };

    let date_units = components(date).ok_or_else(malformed)?;
    if date_units.iter().any(|(_, unit)| *unit == 'W') && date_units.len() > 1 {
        return Err(malformed());
    }
    let mut rank = 0;
    for (value, unit) in date_units {
        let (next_rank, unit_secs) = match unit {
            'W' => (1, SECS_PER_WEEK),
            'D' => (2, SECS_PER_DAY),
            'Y' | 'M' => {
                return Err(DurationParseError::UnsupportedUnit {
                    unit,
                    input: input.to_owned(),
                })
            }
            _ => return Err(malformed()),
        };
        if next_rank <= rank || value.contains(['.', ',']) {
            return Err(malformed());
        }
        rank = next_rank;
        add(whole_units(value, unit_secs).ok_or_else(|| DurationParseError::Overflow(input.to_owned()))?)?;
    }

    if let Some(time) = time {
        let time_units = components(time).ok_or_else(malformed)?;
        let last = time_units.len().saturating_sub(1);
        let mut rank = 0;
        for (i, (value, unit)) in time_units.into_iter().enumerate() {
            let next_rank = match unit {
                'H' => 1,
                'M' => 2,
                'S' => 3,
                _ => return Err(malformed()),
            };
            if next_rank <= rank {
                return Err(malformed());
            }
            rank = next_rank;
            let fractional = value.contains(['.', ',']);
            if fractional && (unit != 'S' || i != last) {
                return Err(malformed());
            }
            let d = match unit {
                'H' => whole_units(value, SECS_PER_HOUR),
                'M' => whole_units(value, SECS_PER_MINUTE),
                _ => seconds(value).map_err(|()| malformed())?,
            }
            .ok_or_else(|| DurationParseError::Overflow(input.to_owned()))?;
            add(d)?;
        }
    }

    Ok(total)
}

/// Splits `part` into `(number, unit)` pairs. Returns `None` on stray characters.
fn components(part: &str) -> Option<Vec<(&str, char)>> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in part.char_indices() {
        if c.is_ascii_digit() || c == '.' || c == ',' {
            continue;
        }
        if !c.is_ascii_alphabetic() || i == start {
            return None;
        }
        out.push((&part[start..i], c));
        start = i + c.len_utf8();
    }
    (start == part.len()).then_some(out)
}

fn whole_units(value: &str, unit_secs: u64) -> Option<Duration> {
    let n: u64 = value.parse().ok()?;
    n.checked_mul(unit_secs).map(Duration::from_secs)
}

/// Parses `12`, `12.5` or `12,5` seconds. `Err` means malformed, `Ok(None)` overflow.
fn seconds(value: &str) -> Result<Option<Duration>, ()> {
    let (whole, frac) = match value.split_once(['.', ',']) {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };
    if whole.is_empty() || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(());
    }
    let Ok(secs) = whole.parse::<u64>() else {
        return if whole.chars().all(|c| c.is_ascii_digit()) {
            Ok(None)
        } else {
            Err(())
        };
    };

    let mut nanos = 0u32;
    for (i, d) in frac.chars().take(9).enumerate() {
        let digit = d.to_digit(10).ok_or(())?;
        nanos += digit * 10u32.pow(8 - i as u32);
    }
    Ok(Some(Duration::new(secs, nanos)))
}
