//! Alarm schedules and occurrence math.

use bitflags::bitflags;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Weekday};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

bitflags! {
    /// Set of weekdays a repeating alarm fires on.
    ///
    /// Serialized as an array of lowercase day names.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WeekdaySet: u8 {
        const MONDAY = 1 << 0;
        const TUESDAY = 1 << 1;
        const WEDNESDAY = 1 << 2;
        const THURSDAY = 1 << 3;
        const FRIDAY = 1 << 4;
        const SATURDAY = 1 << 5;
        const SUNDAY = 1 << 6;
    }
}

impl WeekdaySet {
    pub const WEEKDAYS: WeekdaySet = WeekdaySet::MONDAY
        .union(WeekdaySet::TUESDAY)
        .union(WeekdaySet::WEDNESDAY)
        .union(WeekdaySet::THURSDAY)
        .union(WeekdaySet::FRIDAY);

    fn flag_for(day: Weekday) -> WeekdaySet {
        match day {
            Weekday::Mon => WeekdaySet::MONDAY,
            Weekday::Tue => WeekdaySet::TUESDAY,
            Weekday::Wed => WeekdaySet::WEDNESDAY,
            Weekday::Thu => WeekdaySet::THURSDAY,
            Weekday::Fri => WeekdaySet::FRIDAY,
            Weekday::Sat => WeekdaySet::SATURDAY,
            Weekday::Sun => WeekdaySet::SUNDAY,
        }
    }

    pub fn contains_day(&self, day: Weekday) -> bool {
        self.contains(Self::flag_for(day))
    }

    /// Selected days in Monday-first order.
    pub fn days(&self) -> impl Iterator<Item = Weekday> + '_ {
        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .filter(|day| self.contains_day(*day))
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        iter.into_iter()
            .fold(WeekdaySet::empty(), |set, day| set | Self::flag_for(day))
    }
}

fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

fn day_from_name(name: &str) -> Option<Weekday> {
    match name {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

impl Serialize for WeekdaySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(None)?;
        for day in self.days() {
            seq.serialize_element(day_name(day))?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for WeekdaySet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DaysVisitor;

        impl<'de> Visitor<'de> for DaysVisitor {
            type Value = WeekdaySet;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an array of weekday names")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<WeekdaySet, A::Error> {
                let mut set = WeekdaySet::empty();
                while let Some(name) = seq.next_element::<String>()? {
                    let day = day_from_name(&name)
                        .ok_or_else(|| de::Error::custom(format!("unknown weekday: {name}")))?;
                    set |= WeekdaySet::flag_for(day);
                }
                Ok(set)
            }
        }

        deserializer.deserialize_seq(DaysVisitor)
    }
}

/// When an alarm fires. Exactly one variant is active at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Fires once at the next occurrence of the alarm time.
    OneTime,

    /// Fires on a specific calendar date.
    SpecificDate { date: NaiveDate },

    /// Fires weekly on the selected days.
    RepeatingDays {
        #[schema(value_type = Vec<String>)]
        days: WeekdaySet,
    },
}

impl Schedule {
    /// Resolve the next occurrence of `alarm_time` under this schedule.
    ///
    /// One-time alarms resolve to today if the time is still ahead,
    /// otherwise tomorrow. Specific-date alarms resolve to that date even
    /// when it has passed; futurity is checked by callers that care.
    /// Repeating alarms resolve to the next selected weekday, today
    /// included when the time is still ahead. `None` only when the local
    /// instant does not exist (a DST gap on the target date).
    pub fn next_occurrence<Tz: TimeZone>(
        &self,
        alarm_time: NaiveTime,
        now: DateTime<Tz>,
    ) -> Option<DateTime<Tz>> {
        let tz = now.timezone();
        let today = now.date_naive();

        let at = |date: NaiveDate| {
            date.and_time(alarm_time)
                .and_local_timezone(tz.clone())
                .earliest()
        };

        match self {
            Schedule::OneTime => {
                let candidate = at(today)?;
                if candidate > now {
                    Some(candidate)
                } else {
                    at(today.succ_opt()?)
                }
            }

            Schedule::SpecificDate { date } => at(*date),

            Schedule::RepeatingDays { days } => {
                if days.is_empty() {
                    return None;
                }
                for offset in 0..=7 {
                    let date = today.checked_add_days(chrono::Days::new(offset))?;
                    if !days.contains_day(date.weekday()) {
                        continue;
                    }
                    if let Some(candidate) = at(date) {
                        if candidate > now {
                            return Some(candidate);
                        }
                    }
                }
                None
            }
        }
    }
}
