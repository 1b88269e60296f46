use super::{Spec, TimeOfDay};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};

/// Months searched before a spec is declared unsatisfiable.
const MONTH_HORIZON: u32 = 12 * 8;

fn at(date: NaiveDate, time: TimeOfDay) -> DateTime<Utc> {
    let t = NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(NaiveTime::MIN);
    Utc.from_utc_datetime(&date.and_time(t))
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn nth_weekday_of(year: i32, month: u32, nth: u32, weekday: Weekday) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    let day = 1 + offset + 7 * nth.checked_sub(1)?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// First occurrence of `spec` strictly after `after`.
///
/// Monthly schedules skip months that lack the requested day (or nth
/// weekday) instead of clamping. A spec no calendar date can satisfy yields
/// [`DateTime::<Utc>::MAX_UTC`], i.e. never due. So does running off the
/// end of the calendar.
pub fn next_run(spec: &Spec, after: DateTime<Utc>) -> DateTime<Utc> {
    let today = after.date_naive();
    match *spec {
        Spec::Hourly { minute } => {
            let minute = minute.min(59);
            let top = Utc.from_utc_datetime(
                &today.and_time(NaiveTime::from_hms_opt(after.hour(), minute, 0).unwrap_or(NaiveTime::MIN)),
            );
            if top > after {
                top
            } else {
                top.checked_add_signed(Duration::hours(1)).unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
        }
        Spec::Daily { at: time } => {
            let candidate = at(today, time);
            if candidate > after {
                candidate
            } else {
                today.succ_opt().map_or(DateTime::<Utc>::MAX_UTC, |tomorrow| at(tomorrow, time))
            }
        }
        Spec::Weekly { weekday, at: time } => {
            let mut date = today;
            // A match always exists within eight days.
            for _ in 0..8 {
                if date.weekday() == weekday && at(date, time) > after {
                    return at(date, time);
                }
                match date.succ_opt() {
                    Some(next) => date = next,
                    None => break,
                }
            }
            DateTime::<Utc>::MAX_UTC
        }
        Spec::Monthly { day, at: time } => {
            let (mut year, mut month) = (today.year(), today.month());
            for _ in 0..MONTH_HORIZON {
                if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                    if at(date, time) > after {
                        return at(date, time);
                    }
                }
                (year, month) = next_month(year, month);
            }
            DateTime::<Utc>::MAX_UTC
        }
        Spec::MonthlyNth { nth, weekday, at: time } => {
            let (mut year, mut month) = (today.year(), today.month());
            for _ in 0..MONTH_HORIZON {
                if let Some(date) = nth_weekday_of(year, month, nth, weekday) {
                    if at(date, time) > after {
                        return at(date, time);
                    }
                }
                (year, month) = next_month(year, month);
            }
            DateTime::<Utc>::MAX_UTC
        }
    }
}
