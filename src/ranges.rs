//! Grandfathering ranges: date or version intervals for which an item is
//! treated as purchased without a real transaction.
//!
//! Accepted forms (all inclusive):
//! - a single date: `12/31/2020`
//! - a date range: `1/1/2020-12/31/2020`
//! - a single version: `3.0.1`
//! - a version range: `1.0-3.0.1`
//!
//! A `/` anywhere in the string means dates; otherwise the string is parsed
//! as versions. A single literal is the degenerate interval `[v, v]`.

use chrono::NaiveDate;
use semver::Version;

use crate::error::{Result, StoreError};

/// Parse a version leniently: `"1"` and `"1.0"` are padded to three
/// components, so `"1.0"` compares as `1.0.0`.
pub fn parse_version(s: &str) -> Result<Version> {
    let s = s.trim();
    if s.is_empty() {
        return Err(StoreError::InvalidRange("empty version".into()));
    }

    let mut parts = [0u64; 3];
    let split: Vec<&str> = s.split('.').collect();
    if split.len() > 3 {
        return Err(StoreError::InvalidRange(format!(
            "version has too many components: {s:?}"
        )));
    }

    for (i, part) in split.iter().enumerate() {
        parts[i] = part
            .parse()
            .map_err(|_| StoreError::InvalidRange(format!("bad version component in {s:?}")))?;
    }

    Ok(Version::new(parts[0], parts[1], parts[2]))
}

/// A closed interval during which an item counts as purchased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrandfatherRange {
    /// Civil date interval, evaluated against the wall clock.
    /// Bounds are unix timestamps: start of the first day through the last
    /// second of the last day, UTC.
    Dates { start: i64, end: i64 },
    /// App version interval, evaluated against the first-install app version.
    Versions { min: Version, max: Version },
}

const DATE_FORMAT: &str = "%m/%d/%Y";

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|_| StoreError::InvalidRange(format!("bad date {s:?}, expected M/D/YYYY")))
}

fn day_start(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

fn day_end(date: NaiveDate) -> i64 {
    date.and_hms_opt(23, 59, 59)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

impl GrandfatherRange {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(StoreError::InvalidRange("empty range".into()));
        }

        let (lo, hi) = match s.split_once('-') {
            Some((lo, hi)) => (lo, hi),
            None => (s, s),
        };

        if s.contains('/') {
            let start = parse_date(lo)?;
            let end = parse_date(hi)?;
            if end < start {
                return Err(StoreError::InvalidRange(format!("end before start in {s:?}")));
            }
            Ok(Self::Dates {
                start: day_start(start),
                end: day_end(end),
            })
        } else {
            let min = parse_version(lo)?;
            let max = parse_version(hi)?;
            if max < min {
                return Err(StoreError::InvalidRange(format!("end before start in {s:?}")));
            }
            Ok(Self::Versions { min, max })
        }
    }

    /// Whether this range covers the given moment / first-install version.
    ///
    /// Date ranges ignore the version; version ranges ignore the clock and
    /// return false when the install version is unknown.
    pub fn covers(&self, now: i64, install_version: Option<&Version>) -> bool {
        match self {
            Self::Dates { start, end } => *start <= now && now <= *end,
            Self::Versions { min, max } => match install_version {
                Some(v) => min <= v && v <= max,
                None => false,
            },
        }
    }
}
