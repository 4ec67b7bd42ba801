//! Per-day active windows and the "is the alarm active right now" check

use crate::errors::{MonitorError, Result};
use chrono::{DateTime, Datelike, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Day of the week, numbered Sunday=1 through Saturday=7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Day {
    Sunday = 1,
    Monday = 2,
    Tuesday = 3,
    Wednesday = 4,
    Thursday = 5,
    Friday = 6,
    Saturday = 7,
}

impl Day {
    pub const ALL: [Day; 7] = [
        Day::Sunday,
        Day::Monday,
        Day::Tuesday,
        Day::Wednesday,
        Day::Thursday,
        Day::Friday,
        Day::Saturday,
    ];

    /// Day for a 1-based index (1 = Sunday).
    pub fn from_index(index: u8) -> Option<Day> {
        Day::ALL.get(usize::from(index).checked_sub(1)?).copied()
    }

    pub fn index(self) -> u8 {
        self as u8
    }
}

impl From<chrono::Weekday> for Day {
    fn from(weekday: chrono::Weekday) -> Self {
        match weekday {
            chrono::Weekday::Sun => Day::Sunday,
            chrono::Weekday::Mon => Day::Monday,
            chrono::Weekday::Tue => Day::Tuesday,
            chrono::Weekday::Wed => Day::Wednesday,
            chrono::Weekday::Thu => Day::Thursday,
            chrono::Weekday::Fri => Day::Friday,
            chrono::Weekday::Sat => Day::Saturday,
        }
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Day::Sunday => "Sunday",
            Day::Monday => "Monday",
            Day::Tuesday => "Tuesday",
            Day::Wednesday => "Wednesday",
            Day::Thursday => "Thursday",
            Day::Friday => "Friday",
            Day::Saturday => "Saturday",
        };
        f.write_str(name)
    }
}

impl FromStr for Day {
    type Err = MonitorError;

    /// Accepts a name or 3-letter prefix in any case, or an index 1..7.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(index) = s.parse::<u8>() {
            return Day::from_index(index)
                .ok_or_else(|| MonitorError::InvalidConfig(format!("day index out of range: {}", index)));
        }

        let lower = s.to_ascii_lowercase();
        Day::ALL
            .into_iter()
            .find(|day| {
                let name = day.to_string().to_ascii_lowercase();
                lower.len() >= 3 && name.starts_with(&lower)
            })
            .ok_or_else(|| MonitorError::InvalidConfig(format!("unknown day: {}", s)))
    }
}

/// Same-day window `[start, end)`. Overnight windows are not supported; a
/// window whose end is not after its start is never active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u8,
    pub start_min: u8,
    pub end_hour: u8,
    pub end_min: u8,
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            start_hour: 8,
            start_min: 0,
            end_hour: 18,
            end_min: 0,
        }
    }
}

impl TimeWindow {
    pub fn new(start_hour: u8, start_min: u8, end_hour: u8, end_min: u8) -> Self {
        Self {
            start_hour,
            start_min,
            end_hour,
            end_min,
        }
    }

    pub fn start_minutes(&self) -> u16 {
        u16::from(self.start_hour) * 60 + u16::from(self.start_min)
    }

    pub fn end_minutes(&self) -> u16 {
        u16::from(self.end_hour) * 60 + u16::from(self.end_min)
    }

    /// Start must be a real time of day; end may additionally be 24:00.
    pub fn is_valid(&self) -> bool {
        self.start_hour < 24
            && self.start_min < 60
            && self.end_min < 60
            && self.end_minutes() <= MINUTES_PER_DAY
            && self.end_minutes() > self.start_minutes()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(MonitorError::InvalidScheduleWindow(self.to_string()))
        }
    }

    pub fn contains(&self, minute_of_day: u16) -> bool {
        self.is_valid()
            && minute_of_day >= self.start_minutes()
            && minute_of_day < self.end_minutes()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start_hour, self.start_min, self.end_hour, self.end_min
        )
    }
}

impl FromStr for TimeWindow {
    type Err = MonitorError;

    /// Parses `HH:MM-HH:MM`. The result is validated.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || MonitorError::InvalidScheduleWindow(s.to_string());

        let parse_time = |part: &str| -> Result<(u8, u8)> {
            let (hour, minute) = part.trim().split_once(':').ok_or_else(invalid)?;
            Ok((
                hour.parse().map_err(|_| invalid())?,
                minute.parse().map_err(|_| invalid())?,
            ))
        };

        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let (start_hour, start_min) = parse_time(start)?;
        let (end_hour, end_min) = parse_time(end)?;

        let window = TimeWindow::new(start_hour, start_min, end_hour, end_min);
        window.validate()?;
        Ok(window)
    }
}

pub type ActiveWindows = BTreeMap<Day, TimeWindow>;

/// Wall-clock position within a week, in the zone the schedule is read in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    pub day: Day,
    pub hour: u8,
    pub minute: u8,
}

impl LocalTime {
    pub fn new(day: Day, hour: u8, minute: u8) -> Self {
        Self { day, hour, minute }
    }

    pub fn from_datetime<Tz: TimeZone>(at: &DateTime<Tz>) -> Self {
        Self {
            day: Day::from(at.weekday()),
            hour: at.hour() as u8,
            minute: at.minute() as u8,
        }
    }

    pub fn minute_of_day(&self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }
}

/// True iff `now` falls inside the window configured for its day.
pub fn is_active_now(windows: &ActiveWindows, now: LocalTime) -> bool {
    windows
        .get(&now.day)
        .is_some_and(|window| window.contains(now.minute_of_day()))
}
