//! Computed wake-time adjustments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Deltas smaller than this are noise and are never attached to an alarm.
pub const NOISE_FLOOR_MINUTES: i64 = 2;

/// A computed deviation from an alarm's nominal wake time.
///
/// Created by the calculation client's response mapping, attached by the
/// coordinator, and superseded wholesale by the next successful calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AlarmAdjustment {
    /// The recommended wake instant.
    pub adjusted_wake_time: DateTime<Utc>,
    /// Signed delta in minutes; positive = wake earlier than nominal,
    /// negative = may sleep later.
    pub adjustment_minutes: i64,
    /// Human-readable explanation from the calculation service.
    pub reason: String,
    pub calculated_at: DateTime<Utc>,
    /// Service confidence in the recommendation, 0.0 to 1.0.
    pub confidence: f64,
    pub breakdown: AdjustmentBreakdown,
}

/// Minute buckets the adjustment is composed of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AdjustmentBreakdown {
    pub preparation: u32,
    pub base_commute: u32,
    pub weather_delay: u32,
    pub traffic_delay: u32,
    pub snooze_buffer: u32,
}

impl AlarmAdjustment {
    /// Whether the delta clears the noise floor. Sub-threshold adjustments
    /// are discarded rather than attached.
    pub fn is_significant(&self) -> bool {
        self.adjustment_minutes.abs() >= NOISE_FLOOR_MINUTES
    }

    /// Whether the user gets to sleep in (service recommends waking later
    /// than nominal).
    pub fn is_sleep_in(&self) -> bool {
        self.adjustment_minutes < 0
    }
}
