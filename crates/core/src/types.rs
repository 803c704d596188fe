use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Opaque identifier of a user registered with the identity service.
///
/// Construction rejects empty and whitespace-only values, so every `UserId`
/// in the system is safe to send to the remote validation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidUserId> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(InvalidUserId);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UserId {
    type Error = InvalidUserId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

/// Returned when a user id is empty or blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("user id must not be empty")]
pub struct InvalidUserId;

/// Recognised activity categories. Unknown wire values map to [`ActivityKind::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Running,
    Walking,
    Cycling,
    Swimming,
    WeightTraining,
    Yoga,
    Hiit,
    Cardio,
    Stretching,
    Other,
}

impl ActivityKind {
    /// Interprets a raw activity type, ignoring case and separators.
    pub fn from_type(value: &str) -> Self {
        let normalized: String = value
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "run" | "running" | "jog" | "jogging" => Self::Running,
            "walk" | "walking" | "hike" | "hiking" => Self::Walking,
            "cycle" | "cycling" | "bike" | "biking" => Self::Cycling,
            "swim" | "swimming" => Self::Swimming,
            "weighttraining" | "weights" | "strength" => Self::WeightTraining,
            "yoga" => Self::Yoga,
            "hiit" => Self::Hiit,
            "cardio" => Self::Cardio,
            "stretch" | "stretching" => Self::Stretching,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Walking => "WALKING",
            Self::Cycling => "CYCLING",
            Self::Swimming => "SWIMMING",
            Self::WeightTraining => "WEIGHT_TRAINING",
            Self::Yoga => "YOGA",
            Self::Hiit => "HIIT",
            Self::Cardio => "CARDIO",
            Self::Stretching => "STRETCHING",
            Self::Other => "OTHER",
        }
    }
}

/// Measurements attached to an activity. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories_burned: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional: BTreeMap<String, Value>,
}

/// A user activity as carried on the activity channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(default)]
    pub metrics: ActivityMetrics,
    pub timestamp: DateTime<Utc>,
}

impl Activity {
    /// Decodes a channel payload, rejecting records that can never be processed.
    pub fn decode(payload: &str) -> Result<Self, ActivityDecodeError> {
        let activity: Activity = serde_json::from_str(payload)?;
        if activity.id.trim().is_empty() {
            return Err(ActivityDecodeError::MissingField("id"));
        }
        if activity.activity_type.trim().is_empty() {
            return Err(ActivityDecodeError::MissingField("type"));
        }
        Ok(activity)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> ActivityKind {
        ActivityKind::from_type(&self.activity_type)
    }
}

/// Errors raised when a channel payload is not a usable activity.
#[derive(Debug, Error)]
pub enum ActivityDecodeError {
    #[error("failed to parse activity payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("activity field '{0}' must not be empty")]
    MissingField(&'static str),
}

/// Recommendation generated for a single activity. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: String,
    pub activity_id: String,
    pub user_id: UserId,
    pub activity_type: String,
    pub content: String,
    pub improvements: Vec<String>,
    pub suggestions: Vec<String>,
    pub safety: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl Recommendation {
    /// Identifier derived from the activity so regenerated copies collide on purpose.
    pub fn id_for_activity(activity_id: &str) -> String {
        format!("rec-{activity_id}")
    }
}
