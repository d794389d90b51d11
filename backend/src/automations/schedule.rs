// Due-now predicate for schedule triggers

use autoflow_shared::{ScheduleKind, ScheduleTrigger};
use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc};

/// Decides whether a schedule trigger is due at a tick.
pub trait ScheduleOracle: Send + Sync {
    fn is_due(
        &self,
        schedule: &ScheduleTrigger,
        last_fired: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool;
}

/// Fires on the configured UTC minute, at most once per UTC day.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecurrenceOracle;

impl ScheduleOracle for RecurrenceOracle {
    fn is_due(
        &self,
        schedule: &ScheduleTrigger,
        last_fired: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(at) = parse_time(&schedule.time) else {
            return false;
        };

        if now.hour() != at.hour() || now.minute() != at.minute() {
            return false;
        }

        if schedule.schedule_type == ScheduleKind::Weekly {
            let weekday = now.weekday().number_from_monday() as u8;
            if !schedule.days.contains(&weekday) {
                return false;
            }
        }

        match last_fired {
            Some(last) => last.date_naive() != now.date_naive(),
            None => true,
        }
    }
}

/// Parse `HH:MM` (24h).
pub fn parse_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}
