//! Calendar dates, times of day, and timestamps.
//!
//! The bit layouts here are part of the on-disk format and must not change:
//!
//! * [`Date`]: 32 bits; the low 5 bits hold the day of the month, the next 21
//!   bits hold `(year + 4712) * 12 + month - 1`.
//! * [`Daytime`]: 64-bit count of microseconds since midnight.
//! * [`Timestamp`]: 64 bits; the low 37 bits hold a daytime, the next 26 bits
//!   hold a date.
//!
//! Nil is the all-zero pattern for dates and timestamps (day 0 is never a
//! valid encoding) and the minimum 64-bit integer for daytimes.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Timelike, Utc};

use crate::{Error, Result};

/// Smallest representable year (4713 BC).
pub const YEAR_MIN: i32 = -4712;

const YEAR_OFFSET: i32 = -YEAR_MIN;

const DAY_WIDTH: u32 = 5;
const MONTH_WIDTH: u32 = 21;

/// Largest representable year.
pub const YEAR_MAX: i32 = YEAR_MIN + (1 << MONTH_WIDTH) / 12 - 1;

const TS_TIME_WIDTH: u32 = 37;
const TS_DATE_WIDTH: u32 = DAY_WIDTH + MONTH_WIDTH;

/// Microseconds in a day.
pub const DAY_USEC: i64 = 24 * 60 * 60 * 1_000_000;

const HOUR_USEC: i64 = 60 * 60 * 1_000_000;

/// Days per month in a leap year.
const LEAPDAYS: [i32; 13] = [0, 31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
/// Cumulative days in a non-leap year.
const CUMDAYS: [i32; 13] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334, 365];

/// Count-days epoch offset; a multiple of 400 at or before `YEAR_MIN` so the
/// leap-year rule can be applied to shifted years directly.
const CNT_OFF: i32 = (YEAR_OFFSET + 399) / 400 * 400;

/// Weekday correction anchored on 2019-04-21 being a Sunday.
const DOW_OFF: i32 = 5;

fn is_leap_year(y: i32) -> bool {
    y % 4 == 0 && (y % 100 != 0 || y % 400 == 0)
}

fn month_days(y: i32, m: i32) -> i32 {
    LEAPDAYS[m as usize] - ((m == 2 && !is_leap_year(y)) as i32)
}

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// A calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date(i32);

/// A time of day with microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Daytime(i64);

/// A date and time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Date {
    /// The nil date.
    pub const NIL: Date = Date(0);

    /// Creates a date, or nil when the combination is not a valid calendar
    /// day within the supported year range.
    pub fn new(year: i32, month: i32, day: i32) -> Date {
        if month > 0
            && month <= 12
            && day > 0
            && year >= YEAR_MIN
            && year <= YEAR_MAX
            && day <= month_days(year, month)
        {
            Date::encode(year, month, day)
        } else {
            Date::NIL
        }
    }

    fn encode(year: i32, month: i32, day: i32) -> Date {
        Date((((year + YEAR_OFFSET) * 12 + month - 1) << DAY_WIDTH) | day)
    }

    /// Reconstructs a date from its raw 32-bit encoding.
    pub fn from_raw(raw: i32) -> Date {
        Date(raw)
    }

    /// The raw 32-bit encoding.
    pub fn raw(self) -> i32 {
        self.0
    }

    /// True for the nil date.
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    fn extract_day(self) -> i32 {
        self.0 & ((1 << DAY_WIDTH) - 1)
    }

    fn extract_month(self) -> i32 {
        (self.0 >> DAY_WIDTH) % 12 + 1
    }

    fn extract_year(self) -> i32 {
        (self.0 >> DAY_WIDTH) / 12 - YEAR_OFFSET
    }

    /// The year, or `None` for nil.
    pub fn year(self) -> Option<i32> {
        if self.is_nil() {
            None
        } else {
            Some(self.extract_year())
        }
    }

    /// The month (1..=12), or `None` for nil.
    pub fn month(self) -> Option<i32> {
        if self.is_nil() {
            None
        } else {
            Some(self.extract_month())
        }
    }

    /// The day of the month, or `None` for nil.
    pub fn day(self) -> Option<i32> {
        if self.is_nil() {
            None
        } else {
            Some(self.extract_day())
        }
    }

    /// The century, counting 1-based away from zero in both directions.
    pub fn century(self) -> Option<i32> {
        let yr = self.year()?;
        Some(if yr > 0 {
            (yr - 1) / 100 + 1
        } else {
            -((-yr - 1) / 100 + 1)
        })
    }

    /// The decade (year divided by ten).
    pub fn decade(self) -> Option<i32> {
        Some(self.year()? / 10)
    }

    /// The quarter (1..=4).
    pub fn quarter(self) -> Option<i32> {
        Some((self.month()? - 1) / 3 + 1)
    }

    /// Adds a number of days, normalizing across month and year boundaries.
    /// Returns nil on overflow past the supported year range.
    pub fn add_days(self, days: i32) -> Date {
        if self.is_nil() {
            return Date::NIL;
        }
        if days.abs() >= 1 << (DAY_WIDTH + MONTH_WIDTH) {
            return Date::NIL;
        }
        let mut y = self.extract_year();
        let mut m = self.extract_month();
        let mut d = self.extract_day() + days;
        while d <= 0 {
            m -= 1;
            if m == 0 {
                m = 12;
                y -= 1;
                if y < YEAR_MIN {
                    return Date::NIL;
                }
            }
            d += month_days(y, m);
        }
        while d > month_days(y, m) {
            d -= month_days(y, m);
            m += 1;
            if m > 12 {
                m = 1;
                y += 1;
                if y > YEAR_MAX {
                    return Date::NIL;
                }
            }
        }
        Date::encode(y, m, d)
    }

    /// Adds a number of months. A day past the end of the target month spills
    /// into the following month. Returns nil on overflow.
    pub fn add_months(self, months: i32) -> Date {
        if self.is_nil() {
            return Date::NIL;
        }
        if months.abs() >= 1 << MONTH_WIDTH {
            return Date::NIL;
        }
        let mut y = self.extract_year();
        let mut m = self.extract_month() + months;
        let mut d = self.extract_day();
        if m <= 0 {
            y -= (12 - m) / 12;
            if y < YEAR_MIN {
                return Date::NIL;
            }
            m = 12 - (-m % 12);
        } else if m > 12 {
            y += (m - 1) / 12;
            if y > YEAR_MAX {
                return Date::NIL;
            }
            m = (m - 1) % 12 + 1;
        }
        if d > month_days(y, m) {
            // clamp to the last day of the target month
            d = month_days(y, m);
        }
        Date::encode(y, m, d)
    }

    /// Days (leap days included) since a fixed point before `YEAR_MIN`.
    fn count_days(self) -> i32 {
        debug_assert!(!self.is_nil());
        let y = self.extract_year();
        let m = self.extract_month();
        let y1 = y + CNT_OFF - 1;
        self.extract_day()
            + (y + CNT_OFF) * 365
            + y1 / 4
            - y1 / 100
            + y1 / 400
            + CUMDAYS[(m - 1) as usize]
            + ((m > 2 && is_leap_year(y)) as i32)
    }

    /// The difference in days between two dates, or `None` when either is
    /// nil.
    pub fn diff(self, other: Date) -> Option<i32> {
        if self.is_nil() || other.is_nil() {
            None
        } else {
            Some(self.count_days() - other.count_days())
        }
    }

    /// Day of the week; Monday = 1 through Sunday = 7.
    pub fn day_of_week(self) -> Option<i32> {
        if self.is_nil() {
            None
        } else {
            Some((self.count_days() + DOW_OFF) % 7 + 1)
        }
    }

    /// ISO week number: week 1 is the week (Monday to Sunday) containing
    /// January 4.
    pub fn week_of_year(self) -> Option<i32> {
        if self.is_nil() {
            return None;
        }
        let y = self.extract_year();
        let m = self.extract_month();
        let d = self.extract_day();
        let mut cnt1 = Date::new(y, 1, 4).count_days();
        let mut wd1 = (cnt1 + DOW_OFF) % 7 + 1;
        let mut cnt2 = self.count_days();
        let wd2 = (cnt2 + DOW_OFF) % 7 + 1;
        if wd2 > wd1 && m == 1 && d < 4 {
            // last week of the previous year
            cnt1 = Date::new(y - 1, 1, 4).count_days();
            wd1 = (cnt1 + DOW_OFF) % 7 + 1;
        } else if m == 12 && wd2 + 31 - d < 4 {
            return Some(1);
        }
        if wd2 < wd1 {
            cnt2 += 6;
        }
        Some((cnt2 - cnt1) / 7 + 1)
    }

    /// US week number: week 1 is the week (Sunday to Saturday) containing
    /// January 1.
    pub fn us_week_of_year(self) -> Option<i32> {
        if self.is_nil() {
            return None;
        }
        let doy = self.day_of_year()?;
        let jan1days = Date::new(self.extract_year(), 1, 1).count_days();
        let jan1dow = (jan1days + DOW_OFF + 1) % 7; // Sunday=0 .. Saturday=6
        Some((doy + jan1dow - 1) / 7 + 1)
    }

    /// Ordinal day within the year (1..=366).
    pub fn day_of_year(self) -> Option<i32> {
        if self.is_nil() {
            return None;
        }
        let m = self.extract_month();
        Some(
            self.extract_day()
                + CUMDAYS[(m - 1) as usize]
                + ((m > 2 && is_leap_year(self.extract_year())) as i32),
        )
    }
}

impl Daytime {
    /// The nil daytime.
    pub const NIL: Daytime = Daytime(i64::MIN);

    /// Creates a daytime, or nil for out-of-range components. Second 60 is
    /// accepted and folded into the next minute's range by the caller's
    /// convention for leap seconds.
    pub fn new(hour: i32, min: i32, sec: i32, usec: i32) -> Daytime {
        if (0..24).contains(&hour)
            && (0..60).contains(&min)
            && (0..=60).contains(&sec)
            && (0..1_000_000).contains(&usec)
        {
            Daytime(
                ((i64::from(hour) * 60 + i64::from(min)) * 60 + i64::from(sec)) * 1_000_000
                    + i64::from(usec),
            )
        } else {
            Daytime::NIL
        }
    }

    /// Reconstructs a daytime from its raw encoding.
    pub fn from_raw(raw: i64) -> Daytime {
        Daytime(raw)
    }

    /// The raw microseconds-since-midnight encoding.
    pub fn raw(self) -> i64 {
        self.0
    }

    /// True for the nil daytime.
    pub fn is_nil(self) -> bool {
        self.0 == i64::MIN
    }

    /// The hour (0..=23).
    pub fn hour(self) -> Option<i32> {
        if self.is_nil() {
            None
        } else {
            Some((self.0 / HOUR_USEC) as i32)
        }
    }

    /// The minute (0..=59).
    pub fn minute(self) -> Option<i32> {
        if self.is_nil() {
            None
        } else {
            Some(((self.0 / 60_000_000) % 60) as i32)
        }
    }

    /// The second (0..=60).
    pub fn second(self) -> Option<i32> {
        if self.is_nil() {
            None
        } else {
            Some(((self.0 / 1_000_000) % 60) as i32)
        }
    }

    /// The microsecond fraction (0..=999_999).
    pub fn usec(self) -> Option<i32> {
        if self.is_nil() {
            None
        } else {
            Some((self.0 % 1_000_000) as i32)
        }
    }

    /// The difference in microseconds.
    pub fn diff(self, other: Daytime) -> Option<i64> {
        if self.is_nil() || other.is_nil() {
            None
        } else {
            Some(self.0 - other.0)
        }
    }

    /// Adds microseconds; nil when the result leaves the day.
    pub fn add_usec(self, usec: i64) -> Daytime {
        if self.is_nil() {
            return Daytime::NIL;
        }
        if usec.abs() >= DAY_USEC {
            return Daytime::NIL;
        }
        let t = self.0 + usec;
        if !(0..DAY_USEC).contains(&t) {
            return Daytime::NIL;
        }
        Daytime(t)
    }

    /// Adds microseconds modulo a day, wrapping around midnight.
    pub fn add_usec_modulo(self, usec: i64) -> Daytime {
        if self.is_nil() {
            return Daytime::NIL;
        }
        let mut t = self.0 + usec % DAY_USEC;
        if t < 0 {
            t += DAY_USEC;
        } else if t >= DAY_USEC {
            t -= DAY_USEC;
        }
        Daytime(t)
    }
}

impl Timestamp {
    /// The nil timestamp.
    pub const NIL: Timestamp = Timestamp(0);

    /// Midnight at the start of 1970-01-01 UTC.
    pub const UNIX_EPOCH: Timestamp =
        Timestamp((((1970 + YEAR_OFFSET as i64) * 12) << DAY_WIDTH | 1) << TS_TIME_WIDTH);

    /// Combines a date and a daytime; nil when either is nil.
    pub fn new(d: Date, t: Daytime) -> Timestamp {
        if d.is_nil() || t.is_nil() {
            Timestamp::NIL
        } else {
            Timestamp::encode(d, t)
        }
    }

    fn encode(d: Date, t: Daytime) -> Timestamp {
        Timestamp(((d.0 as i64) << TS_TIME_WIDTH) | t.0)
    }

    /// Reconstructs a timestamp from its raw encoding.
    pub fn from_raw(raw: i64) -> Timestamp {
        Timestamp(raw)
    }

    /// The raw 64-bit encoding.
    pub fn raw(self) -> i64 {
        self.0
    }

    /// True for the nil timestamp.
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    fn ts_time(self) -> Daytime {
        Daytime(self.0 & ((1 << TS_TIME_WIDTH) - 1))
    }

    fn ts_date(self) -> Date {
        Date(((self.0 as u64 >> TS_TIME_WIDTH) & ((1 << TS_DATE_WIDTH) - 1)) as i32)
    }

    /// The date component.
    pub fn date(self) -> Date {
        if self.is_nil() {
            Date::NIL
        } else {
            self.ts_date()
        }
    }

    /// The daytime component.
    pub fn daytime(self) -> Daytime {
        if self.is_nil() {
            Daytime::NIL
        } else {
            self.ts_time()
        }
    }

    /// Converts seconds since the unix epoch.
    pub fn from_unix_seconds(secs: i64) -> Timestamp {
        Timestamp::UNIX_EPOCH.add_usec(secs.saturating_mul(1_000_000))
    }

    /// Converts microseconds since the unix epoch.
    pub fn from_unix_usec(usec: i64) -> Timestamp {
        Timestamp::UNIX_EPOCH.add_usec(usec)
    }

    /// Midnight at the start of the given date.
    pub fn from_date(d: Date) -> Timestamp {
        if d.is_nil() {
            Timestamp::NIL
        } else {
            Timestamp::encode(d, Daytime(0))
        }
    }

    /// The current time in UTC.
    pub fn now() -> Timestamp {
        let now = Utc::now();
        let d = Date::new(now.year(), now.month() as i32, now.day() as i32);
        let t = Daytime::new(
            now.hour() as i32,
            now.minute() as i32,
            now.second().min(59) as i32,
            (now.nanosecond() / 1000).min(999_999) as i32,
        );
        Timestamp::new(d, t)
    }

    /// Adds microseconds, carrying into the date; nil on overflow.
    pub fn add_usec(self, usec: i64) -> Timestamp {
        if self.is_nil() {
            return Timestamp::NIL;
        }
        let mut tm = self.ts_time().0;
        let mut dt = self.ts_date();
        tm += usec;
        if tm < 0 {
            let add = (DAY_USEC - 1 - tm) / DAY_USEC;
            tm += add * DAY_USEC;
            dt = dt.add_days(-(add as i32));
        } else if tm >= DAY_USEC {
            dt = dt.add_days((tm / DAY_USEC) as i32);
            tm %= DAY_USEC;
        }
        if dt.is_nil() {
            return Timestamp::NIL;
        }
        Timestamp::encode(dt, Daytime(tm))
    }

    /// Adds months to the date component.
    pub fn add_months(self, months: i32) -> Timestamp {
        if self.is_nil() {
            return Timestamp::NIL;
        }
        let dt = self.ts_date().add_months(months);
        if dt.is_nil() {
            return Timestamp::NIL;
        }
        Timestamp::encode(dt, self.ts_time())
    }

    /// The difference in microseconds, or `None` when either side is nil.
    pub fn diff(self, other: Timestamp) -> Option<i64> {
        if self.is_nil() || other.is_nil() {
            return None;
        }
        let days = self.ts_date().diff(other.ts_date())?;
        Some(self.ts_time().0 - other.ts_time().0 + DAY_USEC * i64::from(days))
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("nil")
        } else {
            write!(
                f,
                "{}-{:02}-{:02}",
                self.extract_year(),
                self.extract_month(),
                self.extract_day()
            )
        }
    }
}

impl fmt::Display for Daytime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("nil")
        } else {
            write!(
                f,
                "{:02}:{:02}:{:02}.{:06}",
                self.hour().unwrap(),
                self.minute().unwrap(),
                self.second().unwrap(),
                self.usec().unwrap()
            )
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("nil")
        } else {
            write!(f, "{} {}", self.ts_date(), Daytime(self.ts_time().0))
        }
    }
}

/// Matches a case-insensitive prefix of `pat` in `s`, requiring at least
/// `min` matching characters. Returns the number of bytes matched.
fn fleximatch(s: &str, pat: &str, min: usize) -> usize {
    let s = s.as_bytes();
    let mut hit = 0;
    for p in pat.bytes() {
        match s.get(hit) {
            Some(&c) if c.to_ascii_lowercase() == p => hit += 1,
            _ => break,
        }
    }
    if hit >= min {
        hit
    } else {
        0
    }
}

fn parse_month_name(s: &str) -> Option<(i32, usize)> {
    for (i, name) in MONTHS.iter().enumerate() {
        let hit = fleximatch(s, name, 3);
        if hit > 0 {
            return Some((i as i32 + 1, hit));
        }
    }
    None
}

fn take_digits(s: &str, max: usize) -> (i64, usize) {
    let mut v = 0i64;
    let mut n = 0;
    for c in s.bytes().take(max) {
        if !c.is_ascii_digit() {
            break;
        }
        v = v * 10 + i64::from(c - b'0');
        n += 1;
    }
    (v, n)
}

/// Parses a date from the front of `s`, returning the date and the number of
/// bytes consumed. Accepted forms: `YYYY-MM-DD` (also `/` and `\`
/// separators), `DD month YYYY`, `DD-Mon-YYYY`, and the year-last
/// `Month DD, YYYY`. A leading number followed by a month *name* is read as
/// the day; followed by digits it is read as the year.
pub fn parse_date(s: &str) -> Result<(Date, usize)> {
    let bytes = s.as_bytes();
    let mut pos = 0usize;
    let syntax = || Error::Conversion(format!("syntax error in date: {:?}", s));

    let mut neg = bytes.first() == Some(&b'-');
    if neg {
        pos += 1;
    }
    let year: i64;
    let month: i32;
    let day: i32;
    if bytes.get(pos).map_or(false, u8::is_ascii_digit) {
        let (n1, len) = take_digits(&s[pos..], 10);
        pos += len;
        let mut sep = *bytes.get(pos).ok_or_else(syntax)?;
        if sep.is_ascii_alphabetic() {
            // month name follows the number directly: "15jan2024"
            sep = 0;
        } else {
            pos += 1;
            if sep == b' ' {
                while bytes.get(pos) == Some(&b' ') {
                    pos += 1;
                }
            } else if sep != b'-' && sep != b'/' && sep != b'\\' {
                return Err(syntax());
            }
        }
        if bytes.get(pos).map_or(false, u8::is_ascii_digit) {
            // YYYY-MM-DD
            year = n1;
            let (m, n) = take_digits(&s[pos..], 2);
            month = m as i32;
            pos += n;
            if sep != 0 {
                if bytes.get(pos) != Some(&sep) {
                    return Err(syntax());
                }
                pos += 1;
                if sep == b' ' {
                    while bytes.get(pos) == Some(&b' ') {
                        pos += 1;
                    }
                }
            }
            if !bytes.get(pos).map_or(false, u8::is_ascii_digit) {
                return Err(syntax());
            }
            let (d, n) = take_digits(&s[pos..], 2);
            day = d as i32;
            pos += n;
        } else if let Some((m, hit)) = parse_month_name(&s[pos..]) {
            // DD month YYYY / DD-Mon-YYYY
            if neg {
                return Err(syntax());
            }
            day = n1 as i32;
            month = m;
            pos += hit;
            if sep != 0 {
                if bytes.get(pos) != Some(&sep) {
                    return Err(syntax());
                }
                pos += 1;
                if sep == b' ' {
                    while bytes.get(pos) == Some(&b' ') {
                        pos += 1;
                    }
                }
            }
            if bytes.get(pos) == Some(&b'-') {
                neg = true;
                pos += 1;
            }
            let (y, n) = take_digits(&s[pos..], 10);
            if n == 0 {
                return Err(syntax());
            }
            year = y;
            pos += n;
        } else {
            return Err(syntax());
        }
    } else if let Some((m, hit)) = parse_month_name(&s[pos..]) {
        // year-last form: "April 21, 2019"
        if neg {
            return Err(syntax());
        }
        month = m;
        pos += hit;
        while bytes.get(pos) == Some(&b' ') {
            pos += 1;
        }
        if !bytes.get(pos).map_or(false, u8::is_ascii_digit) {
            return Err(syntax());
        }
        let (d, n) = take_digits(&s[pos..], 2);
        day = d as i32;
        pos += n;
        if bytes.get(pos) == Some(&b',') || bytes.get(pos) == Some(&b' ') {
            pos += 1;
        }
        while bytes.get(pos) == Some(&b' ') {
            pos += 1;
        }
        if bytes.get(pos) == Some(&b'-') {
            neg = true;
            pos += 1;
        }
        let (y, n) = take_digits(&s[pos..], 10);
        if n == 0 {
            return Err(syntax());
        }
        year = y;
        pos += n;
    } else {
        return Err(syntax());
    }
    let year = if neg { -year } else { year };
    if year < i64::from(YEAR_MIN) || year > i64::from(YEAR_MAX) {
        return Err(Error::Conversion(format!(
            "year out of range in date: {:?}",
            s
        )));
    }
    let date = Date::new(year as i32, month, day);
    if date.is_nil() {
        return Err(Error::Conversion(format!("invalid calendar day: {:?}", s)));
    }
    Ok((date, pos))
}

/// Parses a daytime `HH:MM[:SS[.FFFFFF]]` from the front of `s`.
pub fn parse_daytime(s: &str) -> Result<(Daytime, usize)> {
    let bytes = s.as_bytes();
    let syntax = || Error::Conversion(format!("syntax error in time: {:?}", s));
    let (hour, n1) = take_digits(s, 2);
    if n1 == 0 || bytes.get(n1) != Some(&b':') {
        return Err(syntax());
    }
    let mut pos = n1 + 1;
    let (min, n2) = take_digits(&s[pos..], 2);
    if n2 == 0 {
        return Err(syntax());
    }
    pos += n2;
    let mut sec = 0i64;
    let mut usec = 0i64;
    if bytes.get(pos) == Some(&b':') {
        let (sv, n3) = take_digits(&s[pos + 1..], 2);
        if n3 == 0 {
            return Err(syntax());
        }
        sec = sv;
        pos += 1 + n3;
        if bytes.get(pos) == Some(&b'.') && bytes.get(pos + 1).map_or(false, u8::is_ascii_digit) {
            let (f, nf) = take_digits(&s[pos + 1..], 6);
            usec = f;
            for _ in nf..6 {
                usec *= 10;
            }
            pos += 1 + nf;
            // swallow sub-microsecond digits
            while bytes.get(pos).map_or(false, u8::is_ascii_digit) {
                pos += 1;
            }
        }
    }
    let t = Daytime::new(hour as i32, min as i32, sec as i32, usec as i32);
    if t.is_nil() {
        return Err(syntax());
    }
    Ok((t, pos))
}

/// Parses a timestamp: a date, a space or `T`, and a daytime; a bare date
/// parses as midnight.
pub fn parse_timestamp(s: &str) -> Result<(Timestamp, usize)> {
    let (d, n) = parse_date(s)?;
    let bytes = s.as_bytes();
    match bytes.get(n) {
        Some(&b' ') | Some(&b'T') | Some(&b'@') => {
            let (t, m) = parse_daytime(&s[n + 1..])?;
            Ok((Timestamp::new(d, t), n + 1 + m))
        }
        _ => Ok((Timestamp::from_date(d), n)),
    }
}

impl FromStr for Date {
    type Err = Error;

    fn from_str(s: &str) -> Result<Date> {
        if s == "nil" {
            return Ok(Date::NIL);
        }
        let (d, n) = parse_date(s)?;
        if n != s.len() {
            return Err(Error::Conversion(format!("trailing input in date: {:?}", s)));
        }
        Ok(d)
    }
}

impl FromStr for Daytime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Daytime> {
        if s == "nil" {
            return Ok(Daytime::NIL);
        }
        let (t, n) = parse_daytime(s)?;
        if n != s.len() {
            return Err(Error::Conversion(format!("trailing input in time: {:?}", s)));
        }
        Ok(t)
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Timestamp> {
        if s == "nil" {
            return Ok(Timestamp::NIL);
        }
        let (t, n) = parse_timestamp(s)?;
        if n != s.len() {
            return Err(Error::Conversion(format!(
                "trailing input in timestamp: {:?}",
                s
            )));
        }
        Ok(t)
    }
}
