//! Period geometry
//!
//! Pure calendar arithmetic for the recording windows readings live in:
//! - period boundaries for Day/Week/Month/Quarter/HalfYear/Year
//! - sub-interval numbering within a period
//!
//! Interval numbering uses the end-of-interval convention: interval `n`
//! ends at `period_start + (n + 1) * interval_seconds`. The convention is
//! deliberately asymmetric for end timestamps: a reading that *ends*
//! exactly on an interval boundary belongs to the interval it closes, so
//! "ends at 00:06:00" on a 6-second grid is interval 0, not interval 1.
//! Merge and compare logic downstream depends on this exactly.

use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Calendar shape of a recording window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Day,
    Week,
    Month,
    Quarter,
    HalfYear,
    Year,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Day => "day",
            PeriodType::Week => "week",
            PeriodType::Month => "month",
            PeriodType::Quarter => "quarter",
            PeriodType::HalfYear => "half_year",
            PeriodType::Year => "year",
        }
    }
}

/// Start of the period containing `timestamp`.
///
/// `offset_seconds` shifts the calendar grid: a site whose days roll over
/// at local midnight rather than UTC midnight registers its UTC offset
/// here. With `is_end_time`, a timestamp lying exactly on a period
/// boundary is taken to close the *preceding* period.
pub fn period_start(
    period_type: PeriodType,
    offset_seconds: i32,
    timestamp: DateTime<Utc>,
    is_end_time: bool,
) -> DateTime<Utc> {
    let probe = if is_end_time {
        timestamp - Duration::seconds(1)
    } else {
        timestamp
    };
    let local = probe + Duration::seconds(offset_seconds as i64);
    let date = local.date_naive();

    let boundary = match period_type {
        PeriodType::Day => date,
        PeriodType::Week => {
            date - Days::new(date.weekday().num_days_from_monday() as u64)
        }
        PeriodType::Month => first_of_month(date.year(), date.month()),
        PeriodType::Quarter => {
            let month = (date.month0() / 3) * 3 + 1;
            first_of_month(date.year(), month)
        }
        PeriodType::HalfYear => {
            let month = if date.month() >= 7 { 7 } else { 1 };
            first_of_month(date.year(), month)
        }
        PeriodType::Year => first_of_month(date.year(), 1),
    };

    let midnight = boundary
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc();
    midnight - Duration::seconds(offset_seconds as i64)
}

/// End of the period that starts at `start` (calendar-aware).
pub fn period_end(
    period_type: PeriodType,
    offset_seconds: i32,
    start: DateTime<Utc>,
) -> DateTime<Utc> {
    let local = start + Duration::seconds(offset_seconds as i64);
    let date = local.date_naive();
    let end_date = match period_type {
        PeriodType::Day => date + Days::new(1),
        PeriodType::Week => date + Days::new(7),
        PeriodType::Month => date + Months::new(1),
        PeriodType::Quarter => date + Months::new(3),
        PeriodType::HalfYear => date + Months::new(6),
        PeriodType::Year => date + Months::new(12),
    };
    let midnight = end_date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc();
    midnight - Duration::seconds(offset_seconds as i64)
}

/// Sub-interval number of `timestamp` within a period.
///
/// Returns `(interval_no, on_boundary)`. `on_boundary` is true when the
/// timestamp falls exactly on the interval grid. An end-aligned boundary
/// timestamp numbers into the preceding interval (see module docs).
pub fn interval_no(
    interval_seconds: u32,
    period_start: DateTime<Utc>,
    timestamp: DateTime<Utc>,
    is_end_time: bool,
) -> (u32, bool) {
    let elapsed = (timestamp - period_start).num_seconds().max(0);
    let step = interval_seconds as i64;
    let aligned = elapsed % step == 0;
    if is_end_time && aligned && elapsed > 0 {
        ((elapsed / step - 1) as u32, true)
    } else {
        ((elapsed / step) as u32, aligned)
    }
}

/// Time at which sub-interval `interval_no` ends (end-of-interval
/// convention: interval `n` ends at `start + (n + 1) * interval`).
pub fn interval_end_time(
    period_start: DateTime<Utc>,
    interval_no: u32,
    interval_seconds: u32,
) -> DateTime<Utc> {
    period_start + Duration::seconds((interval_no as i64 + 1) * interval_seconds as i64)
}

/// Time at which sub-interval `interval_no` starts.
pub fn interval_start_time(
    period_start: DateTime<Utc>,
    interval_no: u32,
    interval_seconds: u32,
) -> DateTime<Utc> {
    period_start + Duration::seconds(interval_no as i64 * interval_seconds as i64)
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).expect("first of month is a valid date")
}

/// One calendar-aligned recording window. Immutable once constructed;
/// containers replace periods, they never mutate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    period_type: PeriodType,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval_seconds: u32,
    offset_seconds: i32,
}

impl Period {
    /// Period of `period_type` containing `timestamp`.
    pub fn containing(
        period_type: PeriodType,
        interval_seconds: u32,
        offset_seconds: i32,
        timestamp: DateTime<Utc>,
        is_end_time: bool,
    ) -> Period {
        let start = period_start(period_type, offset_seconds, timestamp, is_end_time);
        let end = period_end(period_type, offset_seconds, start);
        Period {
            period_type,
            start,
            end,
            interval_seconds,
            offset_seconds,
        }
    }

    pub fn period_type(&self) -> PeriodType {
        self.period_type
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn interval_seconds(&self) -> u32 {
        self.interval_seconds
    }

    pub fn offset_seconds(&self) -> i32 {
        self.offset_seconds
    }

    /// Whether `timestamp` lies within `[start, end)` (or `(start, end]`
    /// when treated as an end time).
    pub fn contains(&self, timestamp: DateTime<Utc>, is_end_time: bool) -> bool {
        if is_end_time {
            timestamp > self.start && timestamp <= self.end
        } else {
            timestamp >= self.start && timestamp < self.end
        }
    }

    /// Sub-interval number of `timestamp` within this period.
    pub fn interval_of(&self, timestamp: DateTime<Utc>, is_end_time: bool) -> (u32, bool) {
        interval_no(self.interval_seconds, self.start, timestamp, is_end_time)
    }

    /// End time of sub-interval `n`.
    pub fn interval_end(&self, n: u32) -> DateTime<Utc> {
        interval_end_time(self.start, n, self.interval_seconds)
    }

    /// Start time of sub-interval `n`.
    pub fn interval_start(&self, n: u32) -> DateTime<Utc> {
        interval_start_time(self.start, n, self.interval_seconds)
    }
}
