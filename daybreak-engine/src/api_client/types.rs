//! API data transfer objects.
//!
//! These types define the API contract shared between the server and
//! clients. Alarm records themselves cross the API as [`crate::alarm::Alarm`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::alarm::AlarmAdjustment;

/// Full engine state snapshot.
#[derive(Clone, Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct EngineState {
    pub uptime_secs: u64,
    pub alarm_count: usize,
    pub smart_alarm_count: usize,
    /// The soonest enabled alarm, adjusted time honored when fresh.
    pub next_alarm: Option<NextAlarm>,
    pub pending_notifications: usize,
}

/// The next alarm due to fire.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct NextAlarm {
    pub alarm_id: Uuid,
    pub name: String,
    pub fire_at: DateTime<Utc>,
}

/// Result of an explicit recalculation request.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct RecalculationResponse {
    /// `adjusted`, `no_adjustment`, `skipped`, `failed` or `cancelled`.
    pub outcome: String,
    /// Skip reason or failure message, when there is one.
    pub detail: Option<String>,
    pub adjustment: Option<AlarmAdjustment>,
}

/// Response to a collection-wide delete.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct DeleteAllResponse {
    pub deleted: usize,
}
