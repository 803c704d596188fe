use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Activity, ActivityKind, Recommendation};

/// Produces a recommendation from a single activity.
///
/// Implementations must be deterministic for a given activity and must not
/// fail for a well-formed one; errors are reserved for backends such as remote
/// models that can be unavailable.
#[async_trait]
pub trait RecommendationGenerator: Send + Sync {
    async fn generate(&self, activity: &Activity) -> Result<Recommendation, GeneratorError>;
}

/// Failure raised by a generator backend.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// The backend could not be reached; the activity should be redelivered.
    #[error("generator temporarily unavailable: {0}")]
    Transient(String),
    /// The activity cannot be turned into a recommendation by this backend.
    #[error("generator rejected activity: {0}")]
    Fatal(String),
}

impl GeneratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// Calories per minute above which a session counts as high intensity.
const HIGH_INTENSITY_KCAL_PER_MIN: f64 = 10.0;
const LONG_SESSION_MINUTES: u32 = 60;
const SHORT_SESSION_MINUTES: u32 = 20;

/// Rule engine keyed on the activity kind and its duration/calorie metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedGenerator;

impl RuleBasedGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous core of [`RecommendationGenerator::generate`].
    pub fn build(&self, activity: &Activity) -> Recommendation {
        let kind = activity.kind();
        let duration = activity.metrics.duration_minutes;
        let calories = activity.metrics.calories_burned;
        let intensity = match (duration, calories) {
            (Some(minutes), Some(kcal)) if minutes > 0 => Some(f64::from(kcal) / f64::from(minutes)),
            _ => None,
        };

        let content = summary(kind, &activity.activity_type, duration, calories, intensity);

        let mut improvements = Vec::new();
        match duration {
            Some(minutes) if minutes < SHORT_SESSION_MINUTES => improvements.push(format!(
                "Extend the session towards {SHORT_SESSION_MINUTES}+ minutes to build aerobic base."
            )),
            Some(minutes) if minutes > LONG_SESSION_MINUTES => improvements.push(
                "Split long sessions with a short recovery block to keep form consistent."
                    .to_string(),
            ),
            Some(_) => {}
            None => improvements
                .push("Record the session duration so progress can be tracked.".to_string()),
        }
        match intensity {
            Some(rate) if rate >= HIGH_INTENSITY_KCAL_PER_MIN => improvements.push(
                "Balance this high-intensity effort with an easy session in the next 48 hours."
                    .to_string(),
            ),
            Some(_) => improvements.push(
                "Add a few short intervals at higher effort to raise training stimulus."
                    .to_string(),
            ),
            None => {}
        }

        let suggestions = kind_suggestions(kind)
            .iter()
            .map(|s| (*s).to_string())
            .collect();

        let mut safety: Vec<String> = kind_safety(kind)
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        safety.push("Stay hydrated before, during, and after exercise.".to_string());

        Recommendation {
            id: Recommendation::id_for_activity(&activity.id),
            activity_id: activity.id.clone(),
            user_id: activity.user_id.clone(),
            activity_type: activity.activity_type.clone(),
            content,
            improvements,
            suggestions,
            safety,
            generated_at: activity.timestamp,
        }
    }
}

#[async_trait]
impl RecommendationGenerator for RuleBasedGenerator {
    async fn generate(&self, activity: &Activity) -> Result<Recommendation, GeneratorError> {
        Ok(self.build(activity))
    }
}

fn summary(
    kind: ActivityKind,
    raw_type: &str,
    duration: Option<u32>,
    calories: Option<u32>,
    intensity: Option<f64>,
) -> String {
    let label = match kind {
        ActivityKind::Other => raw_type.trim().to_lowercase(),
        other => other.as_str().to_lowercase().replace('_', " "),
    };
    let mut text = match (duration, calories) {
        (Some(minutes), Some(kcal)) => {
            format!("Completed a {minutes}-minute {label} session burning {kcal} kcal.")
        }
        (Some(minutes), None) => format!("Completed a {minutes}-minute {label} session."),
        (None, Some(kcal)) => format!("Completed a {label} session burning {kcal} kcal."),
        (None, None) => format!("Completed a {label} session."),
    };
    if let Some(rate) = intensity {
        let level = if rate >= HIGH_INTENSITY_KCAL_PER_MIN {
            "high"
        } else if rate >= HIGH_INTENSITY_KCAL_PER_MIN / 2.0 {
            "moderate"
        } else {
            "light"
        };
        text.push_str(&format!(" Estimated intensity was {level} ({rate:.1} kcal/min)."));
    }
    text
}

fn kind_suggestions(kind: ActivityKind) -> &'static [&'static str] {
    match kind {
        ActivityKind::Running => &[
            "Alternate easy runs with one tempo run per week.",
            "Add a weekly long run at conversational pace.",
        ],
        ActivityKind::Walking => &[
            "Include hills or stairs to raise the training effect.",
            "Try brisk intervals of two minutes every ten minutes.",
        ],
        ActivityKind::Cycling => &[
            "Work on cadence drills between 85 and 95 rpm.",
            "Schedule one longer endurance ride per week.",
        ],
        ActivityKind::Swimming => &[
            "Dedicate part of each session to technique drills.",
            "Mix pull-buoy sets with kick sets for balance.",
        ],
        ActivityKind::WeightTraining => &[
            "Progress load gradually, around 5% per week on main lifts.",
            "Pair pushing and pulling movements within a session.",
        ],
        ActivityKind::Yoga | ActivityKind::Stretching => &[
            "Hold key stretches for at least 30 seconds.",
            "Combine mobility work with breathing practice.",
        ],
        ActivityKind::Hiit | ActivityKind::Cardio => &[
            "Keep work-to-rest ratios consistent to track progress.",
            "Limit high-intensity sessions to two or three per week.",
        ],
        ActivityKind::Other => &[
            "Keep a consistent weekly schedule for this activity.",
            "Combine it with one strength session per week.",
        ],
    }
}

fn kind_safety(kind: ActivityKind) -> &'static [&'static str] {
    match kind {
        ActivityKind::Running | ActivityKind::Walking => {
            &["Wear supportive footwear and replace worn-out shoes."]
        }
        ActivityKind::Cycling => &["Always wear a helmet and use lights in low visibility."],
        ActivityKind::Swimming => &["Swim in supervised areas and never alone in open water."],
        ActivityKind::WeightTraining => &["Use a spotter or safety bars for heavy lifts."],
        ActivityKind::Yoga | ActivityKind::Stretching => {
            &["Never force a stretch into pain."]
        }
        ActivityKind::Hiit | ActivityKind::Cardio => {
            &["Warm up for at least five minutes before intervals."]
        }
        ActivityKind::Other => &["Warm up before starting and cool down afterwards."],
    }
}
