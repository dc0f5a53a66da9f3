//! Timezone-aware 5-field cron evaluator (min hour dom month dow).

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};

/// A parsed cron expression. Each field is a 64-bit membership mask, so
/// matching a candidate minute is a handful of bit tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: u64,
    hour: u64,
    dom: u64,
    month: u64,
    dow: u64,
}

impl CronExpr {
    /// Parse a 5-field expression. Supports `*`, `*/step`, lists, ranges,
    /// and `N-M/step`.
    pub fn parse(expr: &str) -> Option<CronExpr> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return None;
        }
        Some(CronExpr {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            dom: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            dow: parse_field(fields[4], 0, 6)?,
        })
    }

    fn matches_naive(&self, dt: &NaiveDateTime) -> bool {
        bit(self.minute, dt.minute())
            && bit(self.hour, dt.hour())
            && bit(self.dom, dt.day())
            && bit(self.month, dt.month())
            && bit(self.dow, dt.weekday().num_days_from_sunday())
    }

    /// Next occurrence strictly after `after`, evaluated in `tz`, as UTC.
    ///
    /// DST handling: local times inside a spring-forward gap are skipped;
    /// a fall-back fold resolves to the earliest (pre-transition) instant.
    pub fn next_after(&self, after: DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&tz).naive_local();
        let advance = 60 - i64::from(local_after.second());
        let mut candidate = local_after + chrono::Duration::seconds(advance);
        candidate = candidate.with_second(0).unwrap_or(candidate);

        // One year of minutes bounds the scan for any satisfiable field set.
        let max_checks = 366 * 24 * 60;
        for _ in 0..max_checks {
            if self.matches_naive(&candidate) {
                match tz.from_local_datetime(&candidate) {
                    chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earliest, _) => {
                        return Some(earliest.with_timezone(&Utc))
                    }
                    chrono::LocalResult::None => {}
                }
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}

/// Parse a timezone name, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn parse_field(field: &str, min: u32, max: u32) -> Option<u64> {
    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => (r, s.parse::<u32>().ok().filter(|&n| n > 0)?),
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = a.parse::<u32>().ok()?;
            let hi = b.parse::<u32>().ok()?;
            if lo > hi {
                return None;
            }
            (lo, hi)
        } else {
            let v = range.parse::<u32>().ok()?;
            (v, v)
        };
        if lo < min || hi > max {
            return None;
        }
        let mut v = lo;
        while v <= hi {
            mask |= 1u64 << v;
            v += step;
        }
    }
    if mask == 0 {
        None
    } else {
        Some(mask)
    }
}
