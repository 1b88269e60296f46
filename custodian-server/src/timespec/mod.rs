//! Recurrence grammar for job schedules: parsing to a normalized [`Spec`],
//! canonical rendering, and next-occurrence calculation. All times are UTC.

mod lexer;
mod next;
mod parser;

pub use next::next_run;
pub use parser::parse;

use chrono::Weekday;
use std::fmt;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid schedule near '{token}': expected {expected}")]
pub struct ScheduleSyntaxError {
    pub token: String,
    pub expected: String,
}

impl ScheduleSyntaxError {
    pub(crate) fn new(token: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expected: expected.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    hour: u32,
    minute: u32,
}

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay { hour: 0, minute: 0 };

    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spec {
    Hourly { minute: u32 },
    Daily { at: TimeOfDay },
    Weekly { weekday: Weekday, at: TimeOfDay },
    /// A fixed day of the month. Months without that day are skipped.
    Monthly { day: u32, at: TimeOfDay },
    /// The nth (1-5) occurrence of a weekday in the month.
    MonthlyNth { nth: u32, weekday: Weekday, at: TimeOfDay },
}

pub(crate) fn weekday_name(w: Weekday) -> &'static str {
    match w {
        Weekday::Sun => "sunday",
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
    }
}

pub(crate) fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Spec::Hourly { minute } => write!(f, "hourly at {minute} after"),
            Spec::Daily { at } => write!(f, "daily at {at}"),
            Spec::Weekly { weekday, at } => write!(f, "{}s at {at}", weekday_name(*weekday)),
            Spec::Monthly { day, at } => write!(f, "monthly at {at} on {}", ordinal(*day)),
            Spec::MonthlyNth { nth, weekday, at } => {
                write!(f, "{} {} at {at}", ordinal(*nth), weekday_name(*weekday))
            }
        }
    }
}

impl std::str::FromStr for Spec {
    type Err = ScheduleSyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_rendering() {
        let cases = [
            ("daily 4pm", "daily at 16:00"),
            ("thursdays at 11:35pm", "thursdays at 23:35"),
            ("3rd Tuesday at 2:05", "3rd tuesday at 2:05"),
            ("monthly 2:05am on 14th", "monthly at 2:05 on 14th"),
            ("hourly at quarter til", "hourly at 45 after"),
            ("weekly on monday at 23:00", "mondays at 23:00"),
            ("monthly on 1 at 00:00", "monthly at 0:00 on 1st"),
            ("monthly on 22 at 6:00", "monthly at 6:00 on 22nd"),
        ];
        for (input, rendered) in cases {
            let spec = parse(input).unwrap();
            assert_eq!(spec.to_string(), rendered, "rendering {input}");
            assert_eq!(parse(rendered).unwrap(), spec, "reparsing {rendered}");
        }
    }

    #[test]
    fn test_ordinal_suffixes() {
        assert_eq!(ordinal(1), "1st");
        assert_eq!(ordinal(11), "11th");
        assert_eq!(ordinal(12), "12th");
        assert_eq!(ordinal(23), "23rd");
        assert_eq!(ordinal(31), "31st");
    }
}
