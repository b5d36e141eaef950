// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use chrono_tz::Tz;
use fluxion_surplus_types::{DayOfWeek, ScheduleWindow};

/// Whether a device may run at `local_now`
///
/// Devices without a schedule, with scheduling disabled, or with an
/// incomplete window are always in schedule. An empty day set means every day.
pub fn is_in_schedule(window: Option<&ScheduleWindow>, local_now: NaiveDateTime) -> bool {
    let Some(window) = window.filter(|w| w.enabled) else {
        return true;
    };
    let (Some(start), Some(end)) = (window.start, window.end) else {
        return true;
    };

    let today = DayOfWeek::from(local_now.weekday());
    if !window.days.is_empty() && !window.days.contains(&today) {
        return false;
    }

    let time = local_now.time();
    if end < start {
        // Overnight window
        time >= start || time <= end
    } else {
        start <= time && time <= end
    }
}

/// Wall-clock time in the configured timezone
pub fn local_time(now: DateTime<Utc>, timezone: Tz) -> NaiveDateTime {
    now.with_timezone(&timezone).naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone};

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        // 2025-06-02 is a Monday
        NaiveDate::from_ymd_opt(2025, 6, day)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .unwrap()
    }

    fn window(start: &str, end: &str, days: Vec<DayOfWeek>) -> ScheduleWindow {
        ScheduleWindow {
            enabled: true,
            start: NaiveTime::parse_from_str(start, "%H:%M").ok(),
            end: NaiveTime::parse_from_str(end, "%H:%M").ok(),
            days,
        }
    }

    #[test]
    fn test_no_or_disabled_schedule_is_always_active() {
        assert!(is_in_schedule(None, at(2, 3, 0)));

        let mut disabled = window("10:00", "12:00", vec![]);
        disabled.enabled = false;
        assert!(is_in_schedule(Some(&disabled), at(2, 3, 0)));

        let incomplete = ScheduleWindow {
            enabled: true,
            start: NaiveTime::from_hms_opt(10, 0, 0),
            end: None,
            days: vec![DayOfWeek::Sunday],
        };
        assert!(is_in_schedule(Some(&incomplete), at(2, 3, 0)));
    }

    #[test]
    fn test_daytime_window_bounds_are_inclusive() {
        let w = window("10:00", "16:00", vec![]);
        assert!(is_in_schedule(Some(&w), at(2, 10, 0)));
        assert!(is_in_schedule(Some(&w), at(2, 16, 0)));
        assert!(!is_in_schedule(Some(&w), at(2, 9, 59)));
        assert!(!is_in_schedule(Some(&w), at(2, 16, 1)));
    }

    #[test]
    fn test_overnight_window() {
        let w = window("22:00", "06:00", vec![]);
        assert!(is_in_schedule(Some(&w), at(2, 23, 30)));
        assert!(is_in_schedule(Some(&w), at(2, 5, 59)));
        assert!(!is_in_schedule(Some(&w), at(2, 12, 0)));
    }

    #[test]
    fn test_weekday_set() {
        let w = window("00:00", "23:59", vec![DayOfWeek::Monday, DayOfWeek::Wednesday]);
        assert!(is_in_schedule(Some(&w), at(2, 12, 0)));
        assert!(!is_in_schedule(Some(&w), at(3, 12, 0)));
        assert!(is_in_schedule(Some(&w), at(4, 12, 0)));
    }

    #[test]
    fn test_local_time_applies_timezone() {
        let utc = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        let local = local_time(utc, chrono_tz::Europe::Prague);
        assert_eq!(local, at(2, 12, 0));
    }
}
