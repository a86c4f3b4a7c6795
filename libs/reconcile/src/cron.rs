//! Cron expression parsing and fire-time iteration.
//!
//! Supports the standard five-field syntax
//! (`minute hour day-of-month month day-of-week`), the `@yearly`..`@hourly`
//! descriptors, `@every <duration>`, and an optional `CRON_TZ=`/`TZ=` zone
//! prefix (UTC or a fixed `±HH:MM` offset).

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use thiserror::Error;

/// How far ahead [`CronExpr::next_after`] searches before giving up.
const SEARCH_HORIZON_YEARS: i32 = 5;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Errors produced while parsing a cron expression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronParseError {
    #[error("empty schedule expression")]
    Empty,

    #[error("expected 5 fields, found {found}")]
    FieldCount { found: usize },

    #[error("invalid value '{value}' in {field} field")]
    InvalidValue { field: CronField, value: String },

    #[error("{field} value {value} out of range {min}-{max}")]
    OutOfRange {
        field: CronField,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("invalid range '{value}' in {field} field")]
    InvalidRange { field: CronField, value: String },

    #[error("invalid step '{value}' in {field} field")]
    InvalidStep { field: CronField, value: String },

    #[error("unknown descriptor '{0}'")]
    UnknownDescriptor(String),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("unsupported time zone '{0}'; use UTC or a fixed offset like +02:00")]
    InvalidTimeZone(String),
}

/// One of the five positional cron fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl CronField {
    const ALL: [CronField; 5] = [
        CronField::Minute,
        CronField::Hour,
        CronField::DayOfMonth,
        CronField::Month,
        CronField::DayOfWeek,
    ];

    /// Inclusive bounds accepted while parsing. Day-of-week accepts 7 as an
    /// alias for Sunday.
    fn bounds(&self) -> (u32, u32) {
        match self {
            CronField::Minute => (0, 59),
            CronField::Hour => (0, 23),
            CronField::DayOfMonth => (1, 31),
            CronField::Month => (1, 12),
            CronField::DayOfWeek => (0, 7),
        }
    }

    fn names(&self) -> &'static [&'static str] {
        match self {
            CronField::Month => &MONTH_NAMES,
            CronField::DayOfWeek => &WEEKDAY_NAMES,
            _ => &[],
        }
    }

    /// Offset added to a name's index to get its numeric value.
    fn name_base(&self) -> u32 {
        match self {
            CronField::Month => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CronField::Minute => "minute",
            CronField::Hour => "hour",
            CronField::DayOfMonth => "day-of-month",
            CronField::Month => "month",
            CronField::DayOfWeek => "day-of-week",
        };
        f.write_str(s)
    }
}

/// A parsed field: a bitset of allowed values plus whether it was `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    star: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CronFields {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
}

impl CronFields {
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday());

        // Classic cron: when both day fields are restricted, either may match.
        if self.day_of_month.star || self.day_of_week.star {
            dom && dow
        } else {
            dom || dow
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Spec {
    Fields(CronFields),
    Every(Duration),
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    zone: FixedOffset,
    spec: Spec,
}

impl CronExpr {
    /// Parses an expression.
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let source = expr.trim();
        if source.is_empty() {
            return Err(CronParseError::Empty);
        }

        let (zone, body) = split_zone(source)?;
        let body = body.trim();
        if body.is_empty() {
            return Err(CronParseError::Empty);
        }

        let spec = if let Some(descriptor) = body.strip_prefix('@') {
            parse_descriptor(descriptor)?
        } else {
            Spec::Fields(parse_fields(body)?)
        };

        Ok(Self {
            source: source.to_string(),
            zone,
            spec,
        })
    }

    /// The zone the fields are evaluated in.
    pub fn zone(&self) -> FixedOffset {
        self.zone
    }

    /// The earliest fire time strictly after `t`.
    ///
    /// Returns `None` if the expression cannot fire within the search
    /// horizon (for example `0 0 30 2 *`).
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.spec {
            Spec::Every(every) => {
                let whole_seconds = t.with_nanosecond(0)?;
                Some(whole_seconds + *every)
            }
            Spec::Fields(fields) => self.next_matching(fields, t),
        }
    }

    fn next_matching(&self, fields: &CronFields, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = t.with_timezone(&self.zone).naive_local();
        let mut cur: NaiveDateTime =
            local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = cur.year() + SEARCH_HORIZON_YEARS;

        while cur.year() <= horizon {
            if !fields.month.contains(cur.month()) {
                cur = first_of_next_month(cur)?;
                continue;
            }
            if !fields.day_matches(cur.date()) {
                cur = cur.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !fields.hour.contains(cur.hour()) {
                cur = cur.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !fields.minute.contains(cur.minute()) {
                cur += Duration::minutes(1);
                continue;
            }

            return self
                .zone
                .from_local_datetime(&cur)
                .single()
                .map(|fire| fire.with_timezone(&Utc));
        }

        None
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn first_of_next_month(cur: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if cur.month() == 12 {
        (cur.year() + 1, 1)
    } else {
        (cur.year(), cur.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn split_zone(source: &str) -> Result<(FixedOffset, &str), CronParseError> {
    let utc = FixedOffset::east_opt(0).ok_or_else(|| CronParseError::InvalidTimeZone("UTC".into()))?;

    let rest = match source
        .strip_prefix("CRON_TZ=")
        .or_else(|| source.strip_prefix("TZ="))
    {
        Some(rest) => rest,
        None => return Ok((utc, source)),
    };

    let (zone, body) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    Ok((parse_zone(zone)?, body))
}

fn parse_zone(zone: &str) -> Result<FixedOffset, CronParseError> {
    let invalid = || CronParseError::InvalidTimeZone(zone.to_string());

    if matches!(zone, "UTC" | "Z" | "Etc/UTC" | "GMT") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, digits) = match zone.as_bytes().first() {
        Some(&b'+') => (1, &zone[1..]),
        Some(&b'-') => (-1, &zone[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

fn parse_descriptor(descriptor: &str) -> Result<Spec, CronParseError> {
    let standard = match descriptor {
        "yearly" | "annually" => "0 0 1 1 *",
        "monthly" => "0 0 1 * *",
        "weekly" => "0 0 * * 0",
        "daily" | "midnight" => "0 0 * * *",
        "hourly" => "0 * * * *",
        other => {
            return match other.strip_prefix("every") {
                Some(rest) if rest.starts_with(char::is_whitespace) => {
                    Ok(Spec::Every(parse_duration(rest.trim())?))
                }
                _ => Err(CronParseError::UnknownDescriptor(format!("@{other}"))),
            }
        }
    };
    Ok(Spec::Fields(parse_fields(standard)?))
}

/// Parses durations such as `90s`, `5m` or `1h30m`. At least one second.
fn parse_duration(raw: &str) -> Result<Duration, CronParseError> {
    let invalid = || CronParseError::InvalidDuration(raw.to_string());

    let mut total: i64 = 0;
    let mut digits = String::new();
    for c in raw.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid()),
        };
        let value: i64 = digits.parse().map_err(|_| invalid())?;
        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
        digits.clear();
    }

    if !digits.is_empty() || total < 1 {
        return Err(invalid());
    }
    Ok(Duration::seconds(total))
}

fn parse_fields(body: &str) -> Result<CronFields, CronParseError> {
    let parts: Vec<&str> = body.split_whitespace().collect();
    if parts.len() != CronField::ALL.len() {
        return Err(CronParseError::FieldCount { found: parts.len() });
    }

    let mut sets = [FieldSet {
        bits: 0,
        star: false,
    }; 5];
    for (slot, (field, raw)) in sets.iter_mut().zip(CronField::ALL.iter().zip(parts)) {
        *slot = parse_field(*field, raw)?;
    }

    // Fold day-of-week 7 into Sunday.
    let dow = &mut sets[4];
    if dow.contains(7) {
        dow.bits = (dow.bits & !(1 << 7)) | 1;
    }

    Ok(CronFields {
        minute: sets[0],
        hour: sets[1],
        day_of_month: sets[2],
        month: sets[3],
        day_of_week: sets[4],
    })
}

fn parse_field(field: CronField, raw: &str) -> Result<FieldSet, CronParseError> {
    let mut set = FieldSet {
        bits: 0,
        star: false,
    };
    for part in raw.split(',') {
        let (bits, star) = parse_part(field, part)?;
        set.bits |= bits;
        set.star |= star;
    }
    Ok(set)
}

fn parse_part(field: CronField, part: &str) -> Result<(u64, bool), CronParseError> {
    let (min, max) = field.bounds();
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step.parse().map_err(|_| CronParseError::InvalidStep {
                field,
                value: part.to_string(),
            })?;
            if step == 0 {
                return Err(CronParseError::InvalidStep {
                    field,
                    value: part.to_string(),
                });
            }
            (range, Some(step))
        }
        None => (part, None),
    };

    let wildcard = range == "*"
        || (range == "?" && matches!(field, CronField::DayOfMonth | CronField::DayOfWeek));

    let (start, end) = if wildcard {
        let max = if field == CronField::DayOfWeek { 6 } else { max };
        (min, max)
    } else if let Some((lo, hi)) = range.split_once('-') {
        let start = parse_value(field, lo)?;
        let end = parse_value(field, hi)?;
        if start > end {
            return Err(CronParseError::InvalidRange {
                field,
                value: part.to_string(),
            });
        }
        (start, end)
    } else {
        let start = parse_value(field, range)?;
        // `a/n` means every n starting at a.
        let end = if step.is_some() { max } else { start };
        (start, end)
    };

    let step = step.unwrap_or(1);
    let mut bits = 0u64;
    let mut v = start;
    while v <= end {
        bits |= 1 << v;
        v += step;
    }

    Ok((bits, wildcard && step == 1))
}

fn parse_value(field: CronField, raw: &str) -> Result<u32, CronParseError> {
    let (min, max) = field.bounds();

    let upper = raw.to_ascii_uppercase();
    if let Some(idx) = field.names().iter().position(|n| *n == upper) {
        return Ok(idx as u32 + field.name_base());
    }

    let value: u32 = raw.parse().map_err(|_| CronParseError::InvalidValue {
        field,
        value: raw.to_string(),
    })?;
    if value < min || value > max {
        return Err(CronParseError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value)
}
