//! Instrument time handling.
//!
//! MODIS packets carry their time as a day count since 1958-01-01, milliseconds of day,
//! and microseconds of millisecond. Conversion to and from calendar dates goes through
//! Julian day numbers. No leap second correction is performed anywhere.
use std::fmt::Display;

#[cfg(feature = "timecode")]
use hifitime::{Duration, Epoch};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Julian day of the instrument day count epoch, 1958-01-01.
pub const MODIS_EPOCH_JD: f64 = 2_436_205.0;
/// First Julian day of the Gregorian calendar, 1582-10-15.
const GREGORIAN_JD: i64 = 2_299_161;
/// `day + 31 * (month + 12 * year)` for 1582-10-15
const GREGORIAN_YMD: i64 = 15 + 31 * (10 + 12 * 1582);
/// Number of seconds between 1900 and 1958
#[cfg(feature = "timecode")]
const HIFIEPOCH_DELTA_SECS: u64 = 1_830_297_600;

pub const MILLIS_PER_DAY: u32 = 86_400_000;

/// Instrument packet time.
///
/// Ordering is lexicographic on (day, millis, micros).
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// Days since 1958-01-01.
    pub day: u16,
    /// Milliseconds of day.
    pub millis: u32,
    /// Microseconds of millisecond.
    pub micros: u16,
}

impl Timestamp {
    #[must_use]
    pub fn new(day: u16, millis: u32, micros: u16) -> Self {
        Timestamp {
            day,
            millis,
            micros,
        }
    }

    /// Milliseconds from `earlier` to `self`, accounting for day rollover. Microseconds
    /// are not considered.
    #[must_use]
    pub fn millis_since(&self, earlier: &Timestamp) -> i64 {
        (i64::from(self.day) - i64::from(earlier.day)) * i64::from(MILLIS_PER_DAY)
            + (i64::from(self.millis) - i64::from(earlier.millis))
    }

    /// Calendar date and time of this timestamp.
    #[must_use]
    pub fn to_datetime(&self) -> DateTime {
        let (year, month, day, _, _) = caldat(f64::from(self.day) + MODIS_EPOCH_JD);
        let ms = self.millis;
        DateTime {
            year,
            month,
            day,
            hour: ms / 3_600_000,
            minute: ms % 3_600_000 / 60_000,
            second: ms % 60_000 / 1000,
            millis: ms % 1000,
            micros: u32::from(self.micros),
        }
    }

    /// This timestamp as a [hifitime::Epoch] on the TAI time scale, i.e., treating
    /// instrument time as uniform with no leap seconds applied.
    #[cfg(feature = "timecode")]
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        let dur = Duration::compose(
            0,
            u64::from(self.day),
            0,
            0,
            // Add in delta to get to hifi epoch
            HIFIEPOCH_DELTA_SECS,
            u64::from(self.millis),
            u64::from(self.micros),
            0,
        );
        Epoch::from_tai_duration(dur)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.to_datetime().fmt(f)
    }
}

/// Civil date and time.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DateTime {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub millis: u32,
    pub micros: u32,
}

impl DateTime {
    /// Construct a whole-second date time, validating each field.
    ///
    /// # Errors
    /// [Error::InvalidDate] if the year is before 1958 or any field is out of range.
    pub fn new(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
    ) -> Result<Self> {
        if year < 1958
            || !(1..=12).contains(&month)
            || !(1..=31).contains(&day)
            || hour > 23
            || minute > 59
            || second > 59
        {
            return Err(Error::InvalidDate(format!(
                "{year:04}/{month:02}/{day:02},{hour:02}:{minute:02}:{second:02}"
            )));
        }
        Ok(DateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
            millis: 0,
            micros: 0,
        })
    }

    /// Convert to an instrument [Timestamp].
    ///
    /// # Errors
    /// [Error::InvalidDate] if the date is beyond the range of the 16-bit day count.
    pub fn timestamp(&self) -> Result<Timestamp> {
        let jul = julday(self.year, self.month, self.day, 0, 0);
        let days = (jul - MODIS_EPOCH_JD).floor() as i64;
        let day = u16::try_from(days)
            .map_err(|_| Error::InvalidDate(format!("{self} is outside the day count range")))?;
        let millis = self.hour * 3_600_000 + self.minute * 60_000 + self.second * 1000 + self.millis;
        let micros = u16::try_from(self.micros)
            .map_err(|_| Error::InvalidDate(format!("{} microseconds", self.micros)))?;
        Ok(Timestamp::new(day, millis, micros))
    }
}

impl Display for DateTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}/{:02}/{:02} {:02}:{:02}:{:02}.{:03}{:03}",
            self.year, self.month, self.day, self.hour, self.minute, self.second, self.millis, self.micros
        )
    }
}

/// Convert a calendar date and time of day to a Julian day.
///
/// Dates from 1582-10-15 on are Gregorian, earlier dates Julian. Year 0 does not exist,
/// -1 is 1 BC. A small offset of about 0.1s is added so truncating the result back to
/// minutes does not fall short due to floating point error.
#[must_use]
pub fn julday(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> f64 {
    let (year, month, day) = (i64::from(year), i64::from(month), i64::from(day));
    let mut jy = year;
    if jy < 0 {
        jy += 1;
    }
    let jm;
    if month > 2 {
        jm = month + 1;
    } else {
        jy -= 1;
        jm = month + 13;
    }
    let mut jul = (365.25 * jy as f64).floor() as i64 + (30.6001 * jm as f64).floor() as i64 + day
        + 1_720_995;
    if day + 31 * (month + 12 * year) >= GREGORIAN_YMD {
        let ja = (0.01 * jy as f64) as i64;
        jul += 2 - ja + (0.25 * ja as f64) as i64;
    }
    jul as f64 + f64::from(hour) / 24.0 + f64::from(minute) / 1440.0 + 0.000_001
}

/// Convert a Julian day to `(year, month, day, hour, minute)`.
///
/// The fractional day is resolved to minutes only. Inverse of [julday].
#[must_use]
pub fn caldat(jul: f64) -> (i32, u32, u32, u32, u32) {
    let ljul = jul.floor() as i64;
    let mut frac = jul - ljul as f64;
    let hour = (frac * 24.0).floor() as u32;
    frac -= f64::from(hour) / 24.0;
    let minute = (frac * 1440.0).floor() as u32;

    let ja = if ljul >= GREGORIAN_JD {
        let jalpha = (((ljul - 1_867_216) as f64 - 0.25) / 36524.25) as i64;
        ljul + 1 + jalpha - (0.25 * jalpha as f64) as i64
    } else {
        ljul
    };
    let jb = ja + 1524;
    let jc = (6680.0 + ((jb - 2_439_870) as f64 - 122.1) / 365.25) as i64;
    let jd = (365 * jc) as f64 + 0.25 * jc as f64;
    let jd = jd as i64;
    let je = ((jb - jd) as f64 / 30.6001) as i64;
    let day = jb - jd - (30.6001 * je as f64) as i64;
    let mut month = je - 1;
    if month > 12 {
        month -= 12;
    }
    let mut year = jc - 4715;
    if month > 2 {
        year -= 1;
    }
    if year <= 0 {
        year -= 1;
    }
    (year as i32, month as u32, day as u32, hour, minute)
}

/// Closed-open time window, `[start, end)`.
///
/// Window bounds have millisecond resolution; a [Timestamp] is inside the window when
/// its (day, millis) is at or after `start` and before `end`.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    start: Option<Timestamp>,
    end: Option<Timestamp>,
}

impl TimeWindow {
    /// Create a window. `None` leaves that end unbounded.
    ///
    /// # Errors
    /// [Error::InvalidWindow] if `end` is not after `start`.
    pub fn new(start: Option<Timestamp>, end: Option<Timestamp>) -> Result<Self> {
        let start = start.map(|t| Timestamp::new(t.day, t.millis, 0));
        let end = end.map(|t| Timestamp::new(t.day, t.millis, 0));
        if let (Some(start), Some(end)) = (start, end) {
            if end <= start {
                return Err(Error::InvalidWindow(format!(
                    "end {end} is not after start {start}"
                )));
            }
        }
        Ok(TimeWindow { start, end })
    }

    /// Window covering all time.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn start(&self) -> Option<Timestamp> {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Option<Timestamp> {
        self.end
    }

    #[must_use]
    pub fn contains(&self, ts: &Timestamp) -> bool {
        let key = (ts.day, ts.millis);
        if let Some(start) = self.start {
            if key < (start.day, start.millis) {
                return false;
            }
        }
        if let Some(end) = self.end {
            if key >= (end.day, end.millis) {
                return false;
            }
        }
        true
    }
}
