//! Calendar engine: 5-field schedule expressions evaluated in a named zone.
//!
//! Expressions have the classic shape `minute hour day-of-month month
//! day-of-week` and support wildcards (`*`), steps (`*/n`, `a-b/n`, `a/n`),
//! ranges (`a-b`), lists (`a,b,c`) and month/weekday name aliases.
//!
//! `next_after` computes in the zone's local time and converts back to the
//! absolute timeline, so daylight-saving transitions behave predictably: a
//! local time that does not exist (spring forward) is skipped to the next
//! valid match, and a local time that occurs twice (fall back) resolves to
//! its first occurrence.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{ChronodError, Result};

/// How far ahead `next_after` searches before declaring the expression
/// unsatisfiable (e.g. `0 0 30 2 *`).
const SEARCH_HORIZON_DAYS: i64 = 366 * 4;

const MONTH_NAMES: [(&str, u8); 12] = [
    ("jan", 1), ("feb", 2), ("mar", 3), ("apr", 4), ("may", 5), ("jun", 6),
    ("jul", 7), ("aug", 8), ("sep", 9), ("oct", 10), ("nov", 11), ("dec", 12),
];

const DOW_NAMES: [(&str, u8); 7] = [
    ("sun", 0), ("mon", 1), ("tue", 2), ("wed", 3), ("thu", 4), ("fri", 5), ("sat", 6),
];

// ═══════════════════════════════════════════════════════════════════════════════
// Field
// ═══════════════════════════════════════════════════════════════════════════════

/// One parsed field of a calendar expression: the set of matching values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    allowed: BTreeSet<u8>,
    wildcard: bool,
}

impl CronField {
    pub fn contains(&self, value: u8) -> bool {
        self.allowed.contains(&value)
    }

    /// True when the field was written as a bare `*` (no restriction).
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    fn parse(
        spec: &str,
        min: u8,
        max: u8,
        names: &[(&str, u8)],
        sunday_alias: bool,
    ) -> std::result::Result<Self, String> {
        if spec.is_empty() {
            return Err("field is empty".to_string());
        }

        let mut allowed = BTreeSet::new();
        for term in spec.split(',') {
            let (base, step) = match term.split_once('/') {
                Some((base, step_str)) => {
                    let step: u8 = step_str
                        .parse()
                        .map_err(|_| format!("step '{}' is not a number", step_str))?;
                    if step == 0 {
                        return Err("step must be at least 1".to_string());
                    }
                    (base, step)
                }
                None => (term, 1),
            };

            let (lo, hi) = if base == "*" {
                (min, max)
            } else if let Some((a, b)) = base.split_once('-') {
                let lo = Self::resolve(a, names, sunday_alias)?;
                let hi = Self::resolve(b, names, sunday_alias)?;
                if lo > hi {
                    return Err(format!("range {}-{} runs backwards", lo, hi));
                }
                (lo, hi)
            } else {
                let value = Self::resolve(base, names, sunday_alias)?;
                // `a/n` starts at a and runs to the field maximum.
                if term.contains('/') {
                    (value, max)
                } else {
                    (value, value)
                }
            };

            if lo < min || hi > max {
                return Err(format!(
                    "value out of range (allowed {}-{}, got {}-{})",
                    min, max, lo, hi
                ));
            }

            let mut v = lo;
            while v <= hi {
                allowed.insert(v);
                match v.checked_add(step) {
                    Some(next) => v = next,
                    None => break,
                }
            }
        }

        Ok(Self {
            allowed,
            wildcard: spec == "*",
        })
    }

    fn resolve(
        token: &str,
        names: &[(&str, u8)],
        sunday_alias: bool,
    ) -> std::result::Result<u8, String> {
        if let Ok(num) = token.parse::<u8>() {
            // Both 0 and 7 mean Sunday in the day-of-week field.
            if sunday_alias && num == 7 {
                return Ok(0);
            }
            return Ok(num);
        }
        let lower = token.to_ascii_lowercase();
        names
            .iter()
            .find(|(name, _)| *name == lower)
            .map(|(_, v)| *v)
            .ok_or_else(|| format!("'{}' is not a number or known name", token))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Expression
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed 5-field calendar expression.
///
/// Day-of-month and day-of-week combine with classic cron semantics: when
/// both fields are restricted, a day matching *either* fires; when only one
/// is restricted, it alone decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
    source: String,
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl CronExpr {
    /// Parse an expression, reporting the offending field on failure.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ChronodError::invalid_schedule(format!(
                "calendar expression '{}' has {} fields, expected 5 (minute hour day-of-month month day-of-week)",
                expr,
                fields.len()
            )));
        }

        let field =
            |idx: usize, name: &str, min: u8, max: u8, names: &[(&str, u8)], sunday: bool| {
                CronField::parse(fields[idx], min, max, names, sunday).map_err(|reason| {
                    ChronodError::invalid_schedule(format!(
                        "calendar expression '{}': {} field: {}",
                        expr, name, reason
                    ))
                })
            };

        Ok(Self {
            minute: field(0, "minute", 0, 59, &[], false)?,
            hour: field(1, "hour", 0, 23, &[], false)?,
            day_of_month: field(2, "day-of-month", 1, 31, &[], false)?,
            month: field(3, "month", 1, 12, &MONTH_NAMES, false)?,
            day_of_week: field(4, "day-of-week", 0, 6, &DOW_NAMES, true)?,
            source: expr.to_string(),
        })
    }

    /// Check an expression without keeping the parse.
    pub fn validate(expr: &str) -> Result<()> {
        Self::parse(expr).map(|_| ())
    }

    /// Earliest instant strictly after `after` whose wall-clock fields in
    /// `tz` match this expression. `None` when no match exists inside the
    /// search horizon.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let start = after.with_timezone(&tz).naive_local();
        let horizon = start + Duration::days(SEARCH_HORIZON_DAYS);

        // Truncate to the minute and step forward once: "strictly after".
        let mut local = start.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);

        while local <= horizon {
            if !self.month.contains(local.month() as u8) {
                local = bump_month(local)?;
                continue;
            }
            if !self.day_matches(&local) {
                local = (local.date() + Duration::days(1)).and_time(NaiveTime::MIN);
                continue;
            }
            if !self.hour.contains(local.hour() as u8) {
                local = local.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minute.contains(local.minute() as u8) {
                local += Duration::minutes(1);
                continue;
            }

            match tz.from_local_datetime(&local) {
                LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                // Fall back: the wall clock repeats; take the first pass.
                LocalResult::Ambiguous(first, _second) => return Some(first.with_timezone(&Utc)),
                // Spring forward: this wall-clock minute never happens.
                LocalResult::None => {
                    local += Duration::minutes(1);
                    continue;
                }
            }
        }

        None
    }

    fn day_matches(&self, local: &NaiveDateTime) -> bool {
        let dom_ok = self.day_of_month.contains(local.day() as u8);
        let dow_ok = self
            .day_of_week
            .contains(local.weekday().num_days_from_sunday() as u8);

        match (self.day_of_month.is_wildcard(), self.day_of_week.is_wildcard()) {
            (true, true) => true,
            (false, true) => dom_ok,
            (true, false) => dow_ok,
            // Both restricted: union, per classic cron.
            (false, false) => dom_ok || dow_ok,
        }
    }
}

fn bump_month(local: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = (local.year(), local.month());
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1).map(|d| d.and_time(NaiveTime::MIN))
}

/// Resolve an IANA zone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>().map_err(|_| {
        ChronodError::invalid_schedule(format!("'{}' is not a known IANA time zone", name))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
