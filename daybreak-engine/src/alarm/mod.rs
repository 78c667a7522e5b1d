//! The alarm data model.
//!
//! An [`Alarm`] is a user-configured wake event. The smart fields describe
//! the commute the external calculation service models; they are meaningful
//! (and validated) only when `smart_enabled` is set. The canonical collection
//! of alarms is owned by the [`crate::store::AlarmStore`]; everything else
//! operates on copies and writes back through it.

mod adjustment;
mod schedule;

pub use adjustment::{AdjustmentBreakdown, AlarmAdjustment, NOISE_FLOOR_MINUTES};
pub use schedule::{Schedule, WeekdaySet};

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Placeholder value for an address state that was never selected.
pub const STATE_UNSET: &str = "unset";

/// How stale an adjustment's implied nominal time may be, relative to the
/// alarm's current next occurrence, before it is treated as absent.
const ADJUSTMENT_FRESHNESS_SLOP: Duration = Duration::seconds(60);

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("alarm name must not be empty")]
    EmptyName,

    #[error("volume must be between 0.0 and 1.0")]
    VolumeOutOfRange,

    #[error("repeating schedule must select at least one weekday")]
    EmptyRepeatDays,

    /// A smart alarm's address is structurally incomplete.
    #[error("{which} address is invalid: {reason}")]
    InvalidAddress {
        which: &'static str,
        reason: &'static str,
    },
}

/// Means of travel sent to the calculation service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TravelMethod {
    #[default]
    Driving,
    Transit,
    Walking,
    Cycling,
}

/// Built-in alarm sounds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlarmSound {
    #[default]
    Radar,
    Sunrise,
    Chimes,
    Beacon,
}

/// A postal address plus the geocoordinates derived from it.
///
/// The `valid` flag is set by the external geocoding collaborator once the
/// address has resolved to coordinates; structural validity is checked here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub valid: bool,
}

impl Address {
    /// An empty address with the placeholder state, as a fresh form starts.
    pub fn unset() -> Self {
        Self {
            street: String::new(),
            city: String::new(),
            state: STATE_UNSET.to_string(),
            zip: String::new(),
            latitude: None,
            longitude: None,
            valid: false,
        }
    }

    /// Non-empty street, city and zip, and a state that was actually chosen.
    pub fn is_structurally_valid(&self) -> bool {
        !self.street.trim().is_empty()
            && !self.city.trim().is_empty()
            && !self.zip.trim().is_empty()
            && !self.state.trim().is_empty()
            && self.state != STATE_UNSET
    }
}

/// Device location reported by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// Commute context for a smart alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SmartConfig {
    /// Target arrival time-of-day at the destination.
    pub arrival_time: NaiveTime,
    pub start_address: Address,
    pub destination_address: Address,
    /// Morning preparation interval, in minutes.
    pub preparation_minutes: u32,
    pub adjust_for_weather: bool,
    pub adjust_for_traffic: bool,
    pub adjust_for_transit: bool,
    pub travel_method: TravelMethod,
}

impl Default for SmartConfig {
    fn default() -> Self {
        Self {
            arrival_time: NaiveTime::from_hms_opt(9, 0, 0).expect("valid time"),
            start_address: Address::unset(),
            destination_address: Address::unset(),
            preparation_minutes: 45,
            adjust_for_weather: true,
            adjust_for_traffic: true,
            adjust_for_transit: false,
            travel_method: TravelMethod::Driving,
        }
    }
}

/// A user-configured wake event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Alarm {
    /// Stable identity, immutable for the record's lifetime.
    pub id: Uuid,
    pub name: String,
    pub schedule: Schedule,
    /// Nominal wake time-of-day in the engine's local zone.
    pub alarm_time: NaiveTime,
    pub enabled: bool,
    pub sound: AlarmSound,
    /// Playback volume, 0.0 to 1.0.
    pub volume: f32,
    pub vibration: bool,
    pub smart_enabled: bool,
    pub smart: SmartConfig,
    /// Most recent non-trivial adjustment, if any.
    pub current_adjustment: Option<AlarmAdjustment>,
}

impl Alarm {
    pub fn new(name: impl Into<String>, alarm_time: NaiveTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            schedule: Schedule::OneTime,
            alarm_time,
            enabled: true,
            sound: AlarmSound::default(),
            volume: 0.8,
            vibration: true,
            smart_enabled: false,
            smart: SmartConfig::default(),
            current_adjustment: None,
        }
    }

    /// Validate the record before it is accepted by the coordinator.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(ValidationError::VolumeOutOfRange);
        }
        if let Schedule::RepeatingDays { days } = &self.schedule {
            if days.is_empty() {
                return Err(ValidationError::EmptyRepeatDays);
            }
        }
        if self.smart_enabled {
            if !self.smart.start_address.is_structurally_valid() {
                return Err(ValidationError::InvalidAddress {
                    which: "starting",
                    reason: "street, city, zip and state are required",
                });
            }
            if !self.smart.destination_address.is_structurally_valid() {
                return Err(ValidationError::InvalidAddress {
                    which: "destination",
                    reason: "street, city, zip and state are required",
                });
            }
        }
        Ok(())
    }

    /// The next concrete future instant this alarm's schedule resolves to.
    ///
    /// Returns `None` when the schedule has no future occurrence (a
    /// specific-date alarm whose date has passed).
    pub fn next_occurrence<Tz: TimeZone>(&self, now: DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.next_occurrence(self.alarm_time, now)
    }

    /// The arrival instant paired with the given occurrence: the smart
    /// arrival time-of-day on the occurrence's date, rolled forward a day
    /// when it would land before the occurrence (overnight commutes).
    pub fn next_arrival<Tz: TimeZone>(&self, occurrence: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = occurrence.timezone();
        let mut date = occurrence.date_naive();
        let arrival = loop {
            let candidate = date.and_time(self.smart.arrival_time);
            if let Some(instant) = candidate.and_local_timezone(tz.clone()).earliest() {
                if instant >= *occurrence {
                    break instant;
                }
            }
            date = date.succ_opt()?;
        };
        Some(arrival)
    }

    /// The adjustment, but only if it was computed against the alarm's
    /// current next occurrence. A stale adjustment is semantically invalid
    /// and treated as absent.
    pub fn fresh_adjustment(&self, occurrence: DateTime<Utc>) -> Option<&AlarmAdjustment> {
        self.current_adjustment
            .as_ref()
            .filter(|adj| adj.is_fresh_for(occurrence))
    }

    /// "HH:MM" rendering of the nominal time.
    pub fn display_time(&self) -> String {
        self.alarm_time.format("%H:%M").to_string()
    }
}

impl AlarmAdjustment {
    /// Whether this adjustment was computed for the given occurrence.
    ///
    /// The nominal time the adjustment was computed against is reconstructed
    /// from the adjusted wake time plus the adjustment delta.
    pub fn is_fresh_for(&self, occurrence: DateTime<Utc>) -> bool {
        let implied_nominal = self.adjusted_wake_time + Duration::minutes(self.adjustment_minutes);
        (implied_nominal - occurrence).abs() <= ADJUSTMENT_FRESHNESS_SLOP
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn valid_address() -> Address {
        Address {
            street: "100 Main St".into(),
            city: "Springfield".into(),
            state: "IL".into(),
            zip: "62701".into(),
            latitude: Some(39.8),
            longitude: Some(-89.6),
            valid: true,
        }
    }

    fn smart_alarm() -> Alarm {
        let mut alarm = Alarm::new("Work", NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        alarm.smart_enabled = true;
        alarm.smart.start_address = valid_address();
        alarm.smart.destination_address = valid_address();
        alarm.smart.arrival_time = NaiveTime::from_hms_opt(8, 30, 0).unwrap();
        alarm
    }

    #[test]
    fn empty_name_rejected() {
        let alarm = Alarm::new("  ", NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        assert_eq!(alarm.validate(), Err(ValidationError::EmptyName));
    }

    #[test]
    fn volume_out_of_range_rejected() {
        let mut alarm = Alarm::new("Work", NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        alarm.volume = 1.5;
        assert_eq!(alarm.validate(), Err(ValidationError::VolumeOutOfRange));
    }

    #[test]
    fn smart_alarm_requires_valid_addresses() {
        let mut alarm = smart_alarm();
        alarm.smart.destination_address.state = STATE_UNSET.into();
        assert!(matches!(
            alarm.validate(),
            Err(ValidationError::InvalidAddress {
                which: "destination",
                ..
            })
        ));
    }

    #[test]
    fn plain_alarm_ignores_addresses() {
        let mut alarm = Alarm::new("Nap", NaiveTime::from_hms_opt(14, 0, 0).unwrap());
        alarm.smart.start_address = Address::unset();
        assert!(alarm.validate().is_ok());
    }

    #[test]
    fn empty_repeat_days_rejected() {
        let mut alarm = Alarm::new("Work", NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        alarm.schedule = Schedule::RepeatingDays {
            days: WeekdaySet::empty(),
        };
        assert_eq!(alarm.validate(), Err(ValidationError::EmptyRepeatDays));
    }

    #[test]
    fn arrival_same_day() {
        let alarm = smart_alarm();
        let occurrence = Utc
            .with_ymd_and_hms(2026, 3, 2, 7, 0, 0)
            .unwrap();
        let arrival = alarm.next_arrival(&occurrence).unwrap();
        assert_eq!(arrival, Utc.with_ymd_and_hms(2026, 3, 2, 8, 30, 0).unwrap());
    }

    #[test]
    fn arrival_rolls_to_next_day_for_overnight_commute() {
        let mut alarm = smart_alarm();
        // Wake at 22:00, arrive at 06:00 the next morning.
        alarm.alarm_time = NaiveTime::from_hms_opt(22, 0, 0).unwrap();
        alarm.smart.arrival_time = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        let occurrence = Utc.with_ymd_and_hms(2026, 3, 2, 22, 0, 0).unwrap();
        let arrival = alarm.next_arrival(&occurrence).unwrap();
        assert_eq!(arrival, Utc.with_ymd_and_hms(2026, 3, 3, 6, 0, 0).unwrap());
    }

    #[test]
    fn fresh_adjustment_filters_stale() {
        let mut alarm = smart_alarm();
        let occurrence = Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).unwrap();
        alarm.current_adjustment = Some(AlarmAdjustment {
            adjusted_wake_time: occurrence - Duration::minutes(18),
            adjustment_minutes: 18,
            reason: "weather".into(),
            calculated_at: Utc::now(),
            confidence: 0.9,
            breakdown: AdjustmentBreakdown::default(),
        });

        assert!(alarm.fresh_adjustment(occurrence).is_some());

        // An occurrence a day later supersedes the computed one.
        let later = occurrence + Duration::days(1);
        assert!(alarm.fresh_adjustment(later).is_none());
    }

    #[test]
    fn display_time_is_zero_padded() {
        let alarm = Alarm::new("Early", NaiveTime::from_hms_opt(6, 5, 0).unwrap());
        assert_eq!(alarm.display_time(), "06:05");
    }

    #[test]
    fn specific_date_resolves_to_that_date_even_if_past() {
        // A past specific date still resolves; futurity is the caller's
        // check (the calculation client rejects it with a timing error).
        let mut alarm = smart_alarm();
        alarm.schedule = Schedule::SpecificDate {
            date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        };
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        assert_eq!(
            alarm.next_occurrence(now),
            Some(Utc.with_ymd_and_hms(2020, 1, 1, 7, 0, 0).unwrap())
        );
    }
}
