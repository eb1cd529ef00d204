use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recurring lesson distilled from council history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidanceItem {
    pub key: String,
    pub occurrences: usize,
    pub rounds: Vec<String>,
    pub advice: String,
}

/// Output of the reflection learner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guidance {
    pub generated_at: DateTime<Utc>,
    pub rounds_seen: usize,
    pub dos: Vec<GuidanceItem>,
    pub donts: Vec<GuidanceItem>,
    /// Rounds missing a verify or a challenge message.
    pub incomplete_rounds: Vec<String>,
}
