//! Smart alarm calculation client.
//!
//! Talks to the external wake-time calculation service: builds the request
//! payload from alarm + profile + location context, POSTs it, parses and
//! validates the response, and maps it to an [`AlarmAdjustment`]. One
//! logical call per invocation; retry policy belongs to the caller. This
//! module never touches the alarm store.

mod client;
mod timestamp;
mod types;

pub use client::{CalcConfig, CalculationClient};
pub use timestamp::parse_timestamp;
pub use types::{
    AlarmSettings, CalculationRequest, WireBreakdown, WireExplanation, WireRecommendation,
    WireResponse,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::alarm::{Alarm, AlarmAdjustment, Coordinate};
use crate::profile::UserProfile;

/// Errors surfaced to callers. None are retried internally.
#[derive(Debug, thiserror::Error)]
pub enum CalcError {
    #[error("invalid calculation service URL: {0}")]
    InvalidUrl(String),

    /// Transport produced something that is not an HTTP response.
    #[error("invalid response from calculation service: {0}")]
    InvalidResponse(String),

    /// The alarm's occurrence has passed, or arrival precedes wake time.
    #[error("invalid time relationship: {0}")]
    InvalidTimeRelationship(String),

    /// Non-2xx with a parseable JSON error body.
    #[error("calculation service error: {0}")]
    ServerError(String),

    /// Non-2xx without a parseable body.
    #[error("calculation service returned HTTP {0}")]
    HttpError(u16),

    #[error("failed to decode calculation response: {0}")]
    DecodingError(String),

    #[error("network error: {0}")]
    NetworkError(String),
}

/// Result of a successful calculation.
#[derive(Debug, Clone)]
pub struct CalculationOutcome {
    /// The occurrence instant the result was computed for. Write-backs
    /// compare this against the alarm's current occurrence to discard
    /// results that raced an edit.
    pub occurrence: DateTime<Utc>,
    /// `None` means the calculation succeeded but the delta was under the
    /// noise floor: no adjustment is warranted.
    pub adjustment: Option<AlarmAdjustment>,
}

/// The seam the coordinator talks through, so tests can substitute a
/// counting or gated implementation for the HTTP client.
#[async_trait]
pub trait CalculationService: Send + Sync {
    async fn calculate(
        &self,
        alarm: &Alarm,
        profile: &UserProfile,
        arrival: DateTime<Utc>,
        location: Option<Coordinate>,
        force_recalculation: bool,
    ) -> Result<CalculationOutcome, CalcError>;
}
