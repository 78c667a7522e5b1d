//! HTTP client for the calculation service.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};

use super::types::{AlarmSettings, CalculationRequest, WireError, WireResponse};
use super::{CalcError, CalculationOutcome, CalculationService, parse_timestamp};
use crate::alarm::{
    AdjustmentBreakdown, Alarm, AlarmAdjustment, Coordinate, NOISE_FLOOR_MINUTES,
};
use crate::profile::UserProfile;
use crate::tracing::prelude::*;

/// Commutes longer than this are accepted but suspicious.
const MAX_REASONABLE_GAP_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct CalcConfig {
    /// Full URL of the calculation endpoint.
    pub endpoint: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for CalcConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8787/calculate".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Client for the external wake-time calculation service.
pub struct CalculationClient {
    endpoint: reqwest::Url,
    http: reqwest::Client,
}

impl CalculationClient {
    pub fn new(config: CalcConfig) -> Result<Self, CalcError> {
        let endpoint = reqwest::Url::parse(&config.endpoint)
            .map_err(|e| CalcError::InvalidUrl(format!("{}: {e}", config.endpoint)))?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CalcError::NetworkError(e.to_string()))?;
        Ok(Self { endpoint, http })
    }

    /// Validate the timing relationships before any I/O happens.
    fn check_preconditions(
        occurrence: Option<DateTime<Utc>>,
        arrival: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CalcError> {
        let occurrence = occurrence.ok_or_else(|| {
            CalcError::InvalidTimeRelationship("alarm has no future occurrence".to_string())
        })?;
        if occurrence <= now {
            return Err(CalcError::InvalidTimeRelationship(format!(
                "wake time {occurrence} has already passed"
            )));
        }
        if arrival < occurrence {
            return Err(CalcError::InvalidTimeRelationship(format!(
                "arrival {arrival} precedes wake time {occurrence}"
            )));
        }
        let gap = arrival - occurrence;
        if gap > chrono::Duration::hours(MAX_REASONABLE_GAP_HOURS) {
            warn!(
                gap_hours = gap.num_hours(),
                "Wake-to-arrival gap exceeds a day, proceeding anyway"
            );
        }
        Ok(occurrence)
    }

    /// Map a decoded response to an adjustment for the given occurrence.
    ///
    /// Deltas under the noise floor map to `Ok(None)`: the calculation
    /// succeeded, no adjustment is warranted.
    fn map_response(
        occurrence: DateTime<Utc>,
        response: &WireResponse,
    ) -> Result<Option<AlarmAdjustment>, CalcError> {
        let wake_time = parse_timestamp(&response.wake_time).ok_or_else(|| {
            CalcError::DecodingError(format!("unparseable wake_time: {}", response.wake_time))
        })?;

        // The freshness stamp is not worth discarding a good result over.
        let calculated_at = match &response.calculated_at {
            Some(text) => parse_timestamp(text).unwrap_or_else(|| {
                warn!(calculated_at = %text, "Unparseable calculated_at, using now");
                Utc::now()
            }),
            None => Utc::now(),
        };

        // Positive = wake earlier than nominal. The next occurrence is the
        // authoritative nominal reference, never the raw template time.
        let adjustment_minutes =
            ((occurrence - wake_time).num_seconds() as f64 / 60.0).round() as i64;

        if adjustment_minutes.abs() < NOISE_FLOOR_MINUTES {
            debug!(
                adjustment_minutes,
                "Adjustment below noise floor, discarding"
            );
            return Ok(None);
        }

        let reason = if response.explanation.is_empty() {
            if adjustment_minutes < 0 {
                format!("Conditions allow {} extra minutes", -adjustment_minutes)
            } else {
                format!("Wake {adjustment_minutes} minutes earlier for your commute")
            }
        } else {
            response
                .explanation
                .iter()
                .map(|e| e.reason.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        };

        let clamp = |minutes: i64| minutes.max(0) as u32;
        let breakdown = AdjustmentBreakdown {
            preparation: clamp(response.breakdown.preparation_time),
            base_commute: clamp(response.breakdown.base_commute),
            weather_delay: clamp(response.breakdown.weather_delays),
            traffic_delay: clamp(response.breakdown.traffic_delays),
            snooze_buffer: clamp(response.breakdown.snooze_buffer),
        };

        Ok(Some(AlarmAdjustment {
            adjusted_wake_time: wake_time,
            adjustment_minutes,
            reason,
            calculated_at,
            confidence: response.confidence_score.clamp(0.0, 1.0),
            breakdown,
        }))
    }
}

#[async_trait]
impl CalculationService for CalculationClient {
    async fn calculate(
        &self,
        alarm: &Alarm,
        profile: &UserProfile,
        arrival: DateTime<Utc>,
        location: Option<Coordinate>,
        force_recalculation: bool,
    ) -> Result<CalculationOutcome, CalcError> {
        let occurrence = alarm
            .next_occurrence(Local::now())
            .map(|dt| dt.with_timezone(&Utc));
        let occurrence = Self::check_preconditions(occurrence, arrival, Utc::now())?;

        let request = CalculationRequest {
            user_profile: profile.clone(),
            alarm_settings: AlarmSettings::from_alarm(alarm, occurrence.to_rfc3339()),
            arrival_time: arrival.to_rfc3339(),
            current_location: location,
            force_recalculation,
        };

        debug!(
            alarm_id = %alarm.id,
            wake_time = %occurrence,
            arrival_time = %arrival,
            force = force_recalculation,
            "Requesting wake-time calculation"
        );

        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    CalcError::NetworkError(e.to_string())
                } else {
                    CalcError::InvalidResponse(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let Ok(text) = response.text().await else {
                return Err(CalcError::HttpError(code));
            };
            if let Ok(body) = serde_json::from_str::<WireError>(&text) {
                return Err(CalcError::ServerError(body.error));
            }
            return Err(CalcError::HttpError(code));
        }

        let text = response
            .text()
            .await
            .map_err(|e| CalcError::InvalidResponse(e.to_string()))?;
        let wire: WireResponse =
            serde_json::from_str(&text).map_err(|e| CalcError::DecodingError(e.to_string()))?;

        let adjustment = Self::map_response(occurrence, &wire)?;
        Ok(CalculationOutcome {
            occurrence,
            adjustment,
        })
    }
}
