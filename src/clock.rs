use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Clock backed by the host's local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Coarse label for the current part of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayPart {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl DayPart {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            0..=11 => DayPart::Morning,
            12..=16 => DayPart::Afternoon,
            17..=19 => DayPart::Evening,
            _ => DayPart::Night,
        }
    }
}

impl std::fmt::Display for DayPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DayPart::Morning => write!(f, "morning"),
            DayPart::Afternoon => write!(f, "afternoon"),
            DayPart::Evening => write!(f, "evening"),
            DayPart::Night => write!(f, "night"),
        }
    }
}

/// Wall-clock breakdown pushed as `timeUpdate` and used by the time intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeInfo {
    pub time: String,
    pub date: String,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub time_of_day: DayPart,
}

impl TimeInfo {
    pub fn at(moment: NaiveDateTime) -> Self {
        Self {
            time: format_clock_time(moment),
            date: format_calendar_date(moment),
            hour: moment.hour(),
            minute: moment.minute(),
            second: moment.second(),
            time_of_day: DayPart::from_hour(moment.hour()),
        }
    }

    pub fn now(clock: &dyn Clock) -> Self {
        Self::at(clock.now())
    }

    /// Spoken form used as the assistant reply.
    pub fn sentence(&self) -> String {
        format!(
            "It's {} on {}. Good {}!",
            self.time, self.date, self.time_of_day
        )
    }
}

/// `2:05:00 PM`
pub fn format_clock_time(moment: NaiveDateTime) -> String {
    moment.format("%-I:%M:%S %p").to_string()
}

/// `10/14/2026`
pub fn format_calendar_date(moment: NaiveDateTime) -> String {
    moment.format("%-m/%-d/%Y").to_string()
}
