//! User profile context sent with every calculation request.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// What the calculation service knows about the user's mornings.
///
/// Owned by the composition root (configured via environment), not by the
/// alarm store; the same profile travels with every request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserProfile {
    /// Default preparation interval, in minutes.
    pub preparation_minutes: u32,
    /// How many times the user typically snoozes.
    pub typical_snooze_count: u32,
    /// Whether arriving late is unacceptable (tightens the buffer).
    pub strict_arrival: bool,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            preparation_minutes: 45,
            typical_snooze_count: 1,
            strict_arrival: false,
        }
    }
}
