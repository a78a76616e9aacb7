use serde::{Deserialize, Serialize};
use time::Date;

use crate::KernelError;

/// Julian day number of 1 Muharram 1 AH in the civil tabular calendar
/// (16 July 622 CE, Julian).
const HIJRI_EPOCH_JDN: i32 = 1_948_440;

/// Days in a common lunar year; leap years have one more.
pub const HIJRI_COMMON_YEAR_DAYS: i64 = 354;

/// A date in the tabular (arithmetical, civil) Islamic calendar.
///
/// The tabular calendar is a deterministic 30-year cycle approximation of the
/// observational lunar calendar: months alternate 30/29 days, and eleven years
/// per cycle append a leap day to the final month. It is bijective with the
/// Julian day number line, so conversions round-trip exactly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HijriDate {
    pub year: i32,
    pub month: u8,
    pub day: u8,
}

impl HijriDate {
    /// Construct a validated tabular Hijri date.
    ///
    /// # Errors
    /// Returns [`KernelError::Calendar`] when the month or day is out of range
    /// for the given year.
    pub fn new(year: i32, month: u8, day: u8) -> Result<Self, KernelError> {
        if year < 1 {
            return Err(KernelError::Calendar(format!(
                "hijri year MUST be >= 1, got {year}"
            )));
        }
        if !(1..=12).contains(&month) {
            return Err(KernelError::Calendar(format!(
                "hijri month MUST be 1..=12, got {month}"
            )));
        }
        let length = month_length(year, month);
        if day < 1 || day > length {
            return Err(KernelError::Calendar(format!(
                "hijri day MUST be 1..={length} for month {month} of year {year}, got {day}"
            )));
        }
        Ok(Self { year, month, day })
    }

    /// Convert to the proleptic Gregorian calendar.
    ///
    /// # Errors
    /// Returns [`KernelError::Calendar`] when the resulting Julian day falls
    /// outside the range supported by [`time::Date`].
    pub fn to_gregorian(self) -> Result<Date, KernelError> {
        Date::from_julian_day(self.to_julian_day()).map_err(|err| {
            KernelError::Calendar(format!("hijri date {self:?} is outside the supported range: {err}"))
        })
    }

    /// Convert a Gregorian date into the tabular Hijri calendar.
    ///
    /// # Errors
    /// Returns [`KernelError::Calendar`] for dates before the Hijri epoch.
    pub fn from_gregorian(date: Date) -> Result<Self, KernelError> {
        let jdn = date.to_julian_day();
        if jdn < HIJRI_EPOCH_JDN {
            return Err(KernelError::Calendar(format!(
                "date {date} precedes the Hijri epoch"
            )));
        }

        let days = i64::from(jdn - HIJRI_EPOCH_JDN);
        let year = i32::try_from((30 * days + 10_646) / 10_631).map_err(|_| {
            KernelError::Calendar(format!("date {date} maps outside the supported Hijri range"))
        })?;

        let mut remaining = jdn - jdn_of_year_start(year);
        let mut month = 1_u8;
        while month < 12 {
            let length = i32::from(month_length(year, month));
            if remaining < length {
                break;
            }
            remaining -= length;
            month += 1;
        }

        let day = u8::try_from(remaining + 1).map_err(|_| {
            KernelError::Calendar(format!("day-of-month overflow converting {date}"))
        })?;
        Self::new(year, month, day)
    }

    /// The same date one Hijri year later, with the day clamped when the
    /// anniversary month is one day shorter.
    #[must_use]
    pub fn next_year(self) -> Self {
        let year = self.year + 1;
        let day = self.day.min(month_length(year, self.month));
        Self { year, month: self.month, day }
    }

    fn to_julian_day(self) -> i32 {
        jdn_of_year_start(self.year)
            + i32::from(days_before_month(self.month))
            + i32::from(self.day)
            - 1
    }
}

/// Whether a tabular year carries the leap day (11 per 30-year cycle).
#[must_use]
pub fn is_leap_year(year: i32) -> bool {
    (11 * i64::from(year) + 14).rem_euclid(30) < 11
}

fn month_length(year: i32, month: u8) -> u8 {
    if month % 2 == 1 {
        30
    } else if month == 12 && is_leap_year(year) {
        30
    } else {
        29
    }
}

fn days_before_month(month: u8) -> u16 {
    29 * (u16::from(month) - 1) + u16::from(month) / 2
}

fn jdn_of_year_start(year: i32) -> i32 {
    let year = i64::from(year);
    let days = (year - 1) * 354 + (11 * year + 3).div_euclid(30);
    i32::try_from(i64::from(HIJRI_EPOCH_JDN) + days).unwrap_or(i32::MAX)
}
