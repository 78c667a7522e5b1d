//! Notification scheduling.
//!
//! The OS delivery layer is an external collaborator; the engine's side of
//! the contract is a registry of pending requests keyed by alarm id (and by
//! `{id}-{weekday}` for repeating schedules). [`NotificationScheduler`] is
//! the seam the coordinator talks through; [`LocalNotificationScheduler`]
//! is the in-process implementation the API exposes for inspection.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, Utc, Weekday};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::alarm::{Alarm, AlarmAdjustment, AlarmSound, Schedule, WeekdaySet};
use crate::tracing::prelude::*;

/// User actions registered on every alarm notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    Snooze,
    /// Destructive: dismisses the alarm outright.
    Dismiss,
}

/// A scheduled local notification awaiting delivery.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PendingNotification {
    /// `{alarm_id}` or `{alarm_id}-{weekday}` for repeating schedules.
    pub key: String,
    pub alarm_id: Uuid,
    pub fire_at: DateTime<Utc>,
    pub title: String,
    pub sound: AlarmSound,
    pub volume: f32,
    pub vibration: bool,
    pub actions: Vec<NotificationAction>,
}

#[async_trait]
pub trait NotificationScheduler: Send + Sync {
    /// Schedule the alarm at its nominal occurrence(s).
    async fn schedule_alarm(&self, alarm: &Alarm);

    /// Schedule the alarm at its adjusted wake time.
    async fn schedule_adjusted_alarm(&self, alarm: &Alarm, adjustment: &AlarmAdjustment);

    /// Drop every pending request for this alarm.
    async fn cancel_alarm(&self, alarm_id: Uuid);
}

/// In-process notification registry.
///
/// Scheduling replaces keys, so duplicate scheduling is idempotent.
/// Disabled alarms and past instants no-op with a log; the alarm must
/// never silently lose its wake-up, so callers schedule the nominal
/// notification before any smart-layer work.
#[derive(Default)]
pub struct LocalNotificationScheduler {
    pending: Mutex<BTreeMap<String, PendingNotification>>,
}

impl LocalNotificationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of pending requests, ordered by key.
    pub fn pending(&self) -> Vec<PendingNotification> {
        self.pending.lock().values().cloned().collect()
    }

    fn insert(&self, alarm: &Alarm, key: String, fire_at: DateTime<Utc>) {
        if fire_at <= Utc::now() {
            debug!(key = %key, fire_at = %fire_at, "Notification instant already passed, skipping");
            return;
        }
        let request = PendingNotification {
            key: key.clone(),
            alarm_id: alarm.id,
            fire_at,
            title: alarm.name.clone(),
            sound: alarm.sound,
            volume: alarm.volume,
            vibration: alarm.vibration,
            actions: vec![NotificationAction::Snooze, NotificationAction::Dismiss],
        };
        self.pending.lock().insert(key, request);
    }

    /// Next local occurrence of `alarm` on `day` only.
    fn weekday_occurrence(alarm: &Alarm, day: Weekday) -> Option<DateTime<Utc>> {
        let single = Schedule::RepeatingDays {
            days: [day].into_iter().collect::<WeekdaySet>(),
        };
        single
            .next_occurrence(alarm.alarm_time, Local::now())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn weekday_key(alarm_id: Uuid, day: Weekday) -> String {
        let name = match day {
            Weekday::Mon => "monday",
            Weekday::Tue => "tuesday",
            Weekday::Wed => "wednesday",
            Weekday::Thu => "thursday",
            Weekday::Fri => "friday",
            Weekday::Sat => "saturday",
            Weekday::Sun => "sunday",
        };
        format!("{alarm_id}-{name}")
    }
}

#[async_trait]
impl NotificationScheduler for LocalNotificationScheduler {
    async fn schedule_alarm(&self, alarm: &Alarm) {
        if !alarm.enabled {
            debug!(alarm_id = %alarm.id, "Alarm disabled, not scheduling");
            return;
        }
        match &alarm.schedule {
            Schedule::OneTime | Schedule::SpecificDate { .. } => {
                let Some(occurrence) = alarm
                    .next_occurrence(Local::now())
                    .map(|dt| dt.with_timezone(&Utc))
                else {
                    debug!(alarm_id = %alarm.id, "No occurrence to schedule");
                    return;
                };
                self.insert(alarm, alarm.id.to_string(), occurrence);
            }
            Schedule::RepeatingDays { days } => {
                for day in days.days() {
                    if let Some(occurrence) = Self::weekday_occurrence(alarm, day) {
                        self.insert(alarm, Self::weekday_key(alarm.id, day), occurrence);
                    }
                }
            }
        }
    }

    async fn schedule_adjusted_alarm(&self, alarm: &Alarm, adjustment: &AlarmAdjustment) {
        if !alarm.enabled {
            debug!(alarm_id = %alarm.id, "Alarm disabled, not scheduling adjusted");
            return;
        }
        match &alarm.schedule {
            Schedule::OneTime | Schedule::SpecificDate { .. } => {
                self.insert(alarm, alarm.id.to_string(), adjustment.adjusted_wake_time);
            }
            Schedule::RepeatingDays { days } => {
                // The adjustment applies to the next occurrence only; the
                // remaining days keep their nominal times.
                let adjusted_day = adjustment
                    .adjusted_wake_time
                    .with_timezone(&Local)
                    .weekday();
                for day in days.days() {
                    if day == adjusted_day {
                        self.insert(
                            alarm,
                            Self::weekday_key(alarm.id, day),
                            adjustment.adjusted_wake_time,
                        );
                    } else if let Some(occurrence) = Self::weekday_occurrence(alarm, day) {
                        self.insert(alarm, Self::weekday_key(alarm.id, day), occurrence);
                    }
                }
            }
        }
    }

    async fn cancel_alarm(&self, alarm_id: Uuid) {
        let prefix = format!("{alarm_id}-");
        let id_key = alarm_id.to_string();
        self.pending
            .lock()
            .retain(|key, _| *key != id_key && !key.starts_with(&prefix));
    }
}
