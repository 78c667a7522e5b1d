//! Wire types for the calculation service.
//!
//! These define the HTTP contract only; the engine's own model types live
//! in [`crate::alarm`]. Timestamps cross the wire as strings because the
//! service emits more than one ISO-8601 variant (see
//! [`super::timestamp::parse_timestamp`]).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alarm::{Address, Alarm, Coordinate, TravelMethod};
use crate::profile::UserProfile;

/// Request body for the calculation POST.
#[derive(Debug, Clone, Serialize)]
pub struct CalculationRequest {
    pub user_profile: UserProfile,
    pub alarm_settings: AlarmSettings,
    /// Target arrival instant, ISO-8601.
    pub arrival_time: String,
    /// Device location if the UI reported one; `null` otherwise.
    pub current_location: Option<Coordinate>,
    pub force_recalculation: bool,
}

/// The alarm context flattened for the service.
#[derive(Debug, Clone, Serialize)]
pub struct AlarmSettings {
    pub alarm_id: Uuid,
    pub name: String,
    /// The nominal wake instant (next occurrence), ISO-8601.
    pub wake_time: String,
    pub preparation_minutes: u32,
    /// Omitted (`null`) when structurally invalid, never sent as empty
    /// strings.
    pub start_address: Option<WireAddress>,
    pub destination_address: Option<WireAddress>,
    pub travel_method: TravelMethod,
    pub adjust_for_weather: bool,
    pub adjust_for_traffic: bool,
    pub adjust_for_transit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireAddress {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl WireAddress {
    /// Convert for the wire; structurally invalid addresses become `None`.
    pub fn from_address(address: &Address) -> Option<Self> {
        if !address.is_structurally_valid() {
            return None;
        }
        Some(Self {
            street: address.street.clone(),
            city: address.city.clone(),
            state: address.state.clone(),
            zip: address.zip.clone(),
            latitude: address.latitude,
            longitude: address.longitude,
        })
    }
}

impl AlarmSettings {
    pub fn from_alarm(alarm: &Alarm, wake_time: String) -> Self {
        Self {
            alarm_id: alarm.id,
            name: alarm.name.clone(),
            wake_time,
            preparation_minutes: alarm.smart.preparation_minutes,
            start_address: WireAddress::from_address(&alarm.smart.start_address),
            destination_address: WireAddress::from_address(&alarm.smart.destination_address),
            travel_method: alarm.smart.travel_method,
            adjust_for_weather: alarm.smart.adjust_for_weather,
            adjust_for_traffic: alarm.smart.adjust_for_traffic,
            adjust_for_transit: alarm.smart.adjust_for_transit,
        }
    }
}

/// Successful response body.
#[derive(Debug, Clone, Deserialize)]
pub struct WireResponse {
    pub wake_time: String,
    #[serde(default)]
    pub arrival_time: Option<String>,
    #[serde(default)]
    pub total_preparation_minutes: i64,
    #[serde(default)]
    pub breakdown: WireBreakdown,
    #[serde(default)]
    pub explanation: Vec<WireExplanation>,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub recommendations: Vec<WireRecommendation>,
    #[serde(default)]
    pub route_info: Option<serde_json::Value>,
    #[serde(default)]
    pub weather_info: Option<serde_json::Value>,
    #[serde(default)]
    pub traffic_info: Option<serde_json::Value>,
    #[serde(default)]
    pub calculated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct WireBreakdown {
    #[serde(default)]
    pub preparation_time: i64,
    #[serde(default)]
    pub base_commute: i64,
    #[serde(default)]
    pub commute_buffer: i64,
    #[serde(default)]
    pub snooze_buffer: i64,
    #[serde(default)]
    pub weather_delays: i64,
    #[serde(default)]
    pub traffic_delays: i64,
    #[serde(default)]
    pub transit_delays: i64,
    #[serde(default)]
    pub accuracy_adjustment: i64,
    #[serde(default)]
    pub time_available_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireExplanation {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub reason: String,
    #[serde(default)]
    pub minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireRecommendation {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
}

/// Error body a non-2xx response may carry.
#[derive(Debug, Deserialize)]
pub struct WireError {
    pub error: String,
}
