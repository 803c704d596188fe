//! Domain types shared by the ingress, the activity listener and storage.
pub mod generator;
pub mod types;

pub use generator::{GeneratorError, RecommendationGenerator, RuleBasedGenerator};
pub use types::{
    Activity, ActivityDecodeError, ActivityKind, ActivityMetrics, InvalidUserId, Recommendation,
    UserId,
};
