//! Six-field cron expressions with seconds precision.
//!
//! Syntax per field: `*`, `*/step`, `a`, `a-b`, `a-b/step`, and comma lists.
//! Fields: `SEC MIN HOUR DOM MON DOW` with ranges 0-59, 0-59, 0-23, 1-31,
//! 1-12, 0-6 (7 accepted as Sunday). When both day-of-month and day-of-week
//! are restricted, a day matches if either field does.
//!
//! No cron crate dependency — the dialect is small enough to own.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use scriptbeat_core::{Error, Result};

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    sec: Field,
    min: Field,
    hour: Field,
    dom: Field,
    month: Field,
    dow: Field,
}

/// One cron field: the sorted set of matching values, remembering whether it
/// was written as an unrestricted `*` (day matching depends on that).
#[derive(Debug, Clone)]
struct Field {
    values: Vec<u32>,
    any: bool,
}

impl Field {
    fn contains(&self, v: u32) -> bool {
        self.values.binary_search(&v).is_ok()
    }

    /// Smallest matching value >= `v`, if any remains in this cycle.
    fn next_at_or_after(&self, v: u32) -> Option<u32> {
        self.values.iter().copied().find(|&x| x >= v)
    }
}

impl Schedule {
    /// Parse a six-field expression; anything else is `InvalidSchedule`.
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 6 {
            return Err(invalid(
                expr,
                format!("expected 6 fields (SEC MIN HOUR DOM MON DOW), got {}", parts.len()),
            ));
        }

        let sec = parse_field(parts[0], 0, 59).map_err(|r| invalid(expr, r))?;
        let min = parse_field(parts[1], 0, 59).map_err(|r| invalid(expr, r))?;
        let hour = parse_field(parts[2], 0, 23).map_err(|r| invalid(expr, r))?;
        let dom = parse_field(parts[3], 1, 31).map_err(|r| invalid(expr, r))?;
        let month = parse_field(parts[4], 1, 12).map_err(|r| invalid(expr, r))?;
        let mut dow = parse_field(parts[5], 0, 7).map_err(|r| invalid(expr, r))?;
        // 7 is an alias for Sunday.
        if dow.values.contains(&7) {
            dow.values.retain(|&v| v != 7);
            if !dow.values.contains(&0) {
                dow.values.insert(0, 0);
            }
        }

        Ok(Self {
            sec,
            min,
            hour,
            dom,
            month,
            dow,
        })
    }

    /// Next firing strictly after `after`. `None` only when no match exists
    /// within the multi-year search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = (after + Duration::seconds(1)).with_nanosecond(0)?;
        let horizon = after + Duration::days(4 * 366);

        while t <= horizon {
            if !self.month.contains(t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_next_day(t)?;
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            match self.min.next_at_or_after(t.minute()) {
                Some(m) if m == t.minute() => {}
                Some(m) => {
                    t = t.with_minute(m)?.with_second(0)?;
                }
                None => {
                    t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                    continue;
                }
            }
            match self.sec.next_at_or_after(t.second()) {
                Some(s) if s == t.second() => return Some(t),
                Some(s) => return t.with_second(s),
                None => {
                    t = t.with_second(0)? + Duration::minutes(1);
                }
            }
        }

        None
    }

    /// Standard cron day rule: both fields unrestricted matches everything;
    /// both restricted matches when either does.
    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom_ok = self.dom.contains(t.day());
        let dow_ok = self.dow.contains(t.weekday().num_days_from_sunday());
        match (self.dom.any, self.dow.any) {
            (true, true) => true,
            (true, false) => dow_ok,
            (false, true) => dom_ok,
            (false, false) => dom_ok || dow_ok,
        }
    }
}

fn invalid(expr: &str, reason: impl Into<String>) -> Error {
    Error::InvalidSchedule {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

/// Parse one field into its sorted value set.
fn parse_field(field: &str, min: u32, max: u32) -> std::result::Result<Field, String> {
    if field == "*" {
        return Ok(Field {
            values: (min..=max).collect(),
            any: true,
        });
    }

    let mut values: Vec<u32> = Vec::new();
    for item in field.split(',') {
        values.extend(parse_item(item, min, max)?);
    }
    values.sort_unstable();
    values.dedup();
    if values.is_empty() {
        return Err(format!("field '{field}' matches nothing"));
    }
    Ok(Field { values, any: false })
}

/// One comma-separated item: `*`/`*/step`, `a`, `a-b`, optionally `/step`.
fn parse_item(item: &str, min: u32, max: u32) -> std::result::Result<Vec<u32>, String> {
    let (range, step) = match item.split_once('/') {
        Some((r, s)) => {
            let step: u32 = s
                .parse()
                .map_err(|_| format!("bad step '{s}' in '{item}'"))?;
            if step == 0 {
                return Err(format!("step cannot be 0 in '{item}'"));
            }
            (r, step)
        }
        None => (item, 1),
    };

    let (lo, hi) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        let lo: u32 = a.parse().map_err(|_| format!("bad value '{a}' in '{item}'"))?;
        let hi: u32 = b.parse().map_err(|_| format!("bad value '{b}' in '{item}'"))?;
        if lo > hi {
            return Err(format!("inverted range '{range}'"));
        }
        (lo, hi)
    } else {
        let v: u32 = range
            .parse()
            .map_err(|_| format!("bad value '{range}' in '{item}'"))?;
        // A bare value with a step means "from v to max".
        if item.contains('/') { (v, max) } else { (v, v) }
    };

    if lo < min || hi > max {
        return Err(format!("'{item}' out of range {min}-{max}"));
    }

    Ok((lo..=hi).step_by(step as usize).collect())
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    (t.date_naive() + Duration::days(1))
        .and_hms_opt(0, 0, 0)
        .map(|n| n.and_utc())
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}
