//! Turns council bus history into recurring do / don't guidance.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::council_bus::CouncilBus;
use super::detectors::DetectorRegistry;
use crate::domain::errors::{BusError, StorageError};
use crate::domain::models::{BusMessage, Guidance, GuidanceItem, Intent, ReflectionConfig};
use crate::infrastructure::storage::{JsonDocument, StateLayout};

#[derive(Debug, Default)]
struct Tally {
    occurrences: usize,
    rounds: BTreeSet<String>,
}

impl Tally {
    fn hit(&mut self, round: &str) {
        self.occurrences += 1;
        self.rounds.insert(round.to_string());
    }
}

#[derive(Debug, Default)]
struct RoundSignals {
    verified: bool,
    challenged: bool,
}

#[derive(Debug, Clone)]
pub struct ReflectionLearner {
    bus: CouncilBus,
    registry: DetectorRegistry,
    config: ReflectionConfig,
    output: JsonDocument<Guidance>,
}

impl ReflectionLearner {
    pub fn new(layout: &StateLayout, bus: CouncilBus, config: ReflectionConfig) -> Self {
        Self {
            bus,
            registry: DetectorRegistry::standard(),
            config,
            output: JsonDocument::new(layout.reflection()),
        }
    }

    pub fn with_registry(mut self, registry: DetectorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Last written guidance, if any.
    pub fn last(&self) -> Result<Option<Guidance>, StorageError> {
        self.output.load()
    }

    /// Replay the bus, derive guidance and write `reflection.json`.
    pub fn reflect(&self) -> Result<Guidance, BusError> {
        let history = self.bus.history()?;
        let guidance = self.learn(&history);
        self.output.save(&guidance)?;
        info!(
            rounds = guidance.rounds_seen,
            dos = guidance.dos.len(),
            donts = guidance.donts.len(),
            incomplete = guidance.incomplete_rounds.len(),
            "reflection written"
        );
        Ok(guidance)
    }

    fn learn(&self, history: &[BusMessage]) -> Guidance {
        let mut findings: BTreeMap<String, Tally> = BTreeMap::new();
        let mut verified: BTreeMap<String, Tally> = BTreeMap::new();
        let mut rounds: BTreeMap<String, RoundSignals> = BTreeMap::new();

        for message in history {
            if !matches!(message.intent, Intent::Verify | Intent::Challenge) {
                continue;
            }
            let Some(round) = round_of(message) else {
                debug!(id = %message.id, "verdict message without a round, ignoring");
                continue;
            };
            let names = finding_names(message);
            let signals = rounds.entry(round.clone()).or_default();

            match message.intent {
                Intent::Challenge => {
                    signals.challenged = true;
                    for name in names {
                        findings.entry(name).or_default().hit(&round);
                    }
                }
                Intent::Verify => {
                    signals.verified = true;
                    if names.is_empty() {
                        verified.entry(message.to.clone()).or_default().hit(&round);
                    }
                }
                _ => {}
            }
        }

        let mut donts: Vec<GuidanceItem> = findings
            .into_iter()
            .filter(|(_, tally)| tally.occurrences >= self.config.min_occurrences)
            .map(|(name, tally)| {
                let advice = self
                    .registry
                    .advice_for(&name)
                    .map_or_else(|| format!("Avoid output that triggers {name}."), str::to_string);
                item(name, tally, advice)
            })
            .collect();
        donts.sort_by(|a, b| b.occurrences.cmp(&a.occurrences).then_with(|| a.key.cmp(&b.key)));

        let mut dos: Vec<GuidanceItem> = verified
            .into_iter()
            .map(|(agent, tally)| {
                let advice = format!(
                    "Follow the approach {agent} used: it passed every detector in {} round(s).",
                    tally.rounds.len()
                );
                item(format!("verified:{agent}"), tally, advice)
            })
            .collect();
        dos.sort_by(|a, b| b.occurrences.cmp(&a.occurrences).then_with(|| a.key.cmp(&b.key)));

        let incomplete_rounds = rounds
            .iter()
            .filter(|(_, s)| !(s.verified && s.challenged))
            .map(|(round, _)| round.clone())
            .collect();

        Guidance {
            generated_at: Utc::now(),
            rounds_seen: rounds.len(),
            dos,
            donts,
            incomplete_rounds,
        }
    }
}

fn item(key: String, tally: Tally, advice: String) -> GuidanceItem {
    GuidanceItem {
        key,
        occurrences: tally.occurrences,
        rounds: tally.rounds.into_iter().collect(),
        advice,
    }
}

fn round_of(message: &BusMessage) -> Option<String> {
    message
        .payload
        .get("round_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| message.trace_id.clone())
}

/// Finding names carried by a verdict message, deduplicated.
fn finding_names(message: &BusMessage) -> BTreeSet<String> {
    message
        .payload
        .get("findings")
        .and_then(|v| v.as_array())
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::council_bus::Outgoing;
    use serde_json::json;
    use tempfile::TempDir;

    fn learner() -> (TempDir, ReflectionLearner) {
        let dir = TempDir::new().unwrap();
        let layout = StateLayout::new(dir.path());
        let bus = CouncilBus::new(&layout, 3600);
        (dir, ReflectionLearner::new(&layout, bus, ReflectionConfig::default()))
    }

    fn post(learner: &ReflectionLearner, intent: Intent, agent: &str, round: &str, findings: &[&str]) {
        learner
            .bus
            .send(Outgoing::new(
                "supervisor",
                agent,
                intent,
                json!({"round_id": round, "findings": findings}),
            ))
            .unwrap();
    }

    #[test]
    fn test_recurring_finding_becomes_dont() {
        let (_dir, learner) = learner();
        post(&learner, Intent::Challenge, "beta", "r1", &["refusal", "too_short"]);
        post(&learner, Intent::Verify, "alpha", "r1", &[]);
        post(&learner, Intent::Challenge, "beta", "r2", &["refusal"]);
        post(&learner, Intent::Verify, "alpha", "r2", &[]);

        let guidance = learner.reflect().unwrap();
        assert_eq!(guidance.rounds_seen, 2);
        assert_eq!(guidance.donts.len(), 1);
        let dont = &guidance.donts[0];
        assert_eq!(dont.key, "refusal");
        assert_eq!(dont.occurrences, 2);
        assert_eq!(dont.rounds, vec!["r1", "r2"]);
        assert_eq!(
            Some(dont.advice.as_str()),
            DetectorRegistry::standard().advice_for("refusal")
        );

        assert_eq!(guidance.dos.len(), 1);
        assert_eq!(guidance.dos[0].key, "verified:alpha");
        assert!(guidance.incomplete_rounds.is_empty());
        assert_eq!(learner.last().unwrap(), Some(guidance));
    }

    #[test]
    fn test_incomplete_rounds() {
        let (_dir, learner) = learner();
        post(&learner, Intent::Challenge, "beta", "r1", &["refusal"]);
        post(&learner, Intent::Verify, "alpha", "r2", &[]);
        post(&learner, Intent::Challenge, "alpha", "r2", &[]);

        let guidance = learner.reflect().unwrap();
        assert_eq!(guidance.incomplete_rounds, vec!["r1"]);
        assert!(guidance.donts.is_empty());
    }

    #[test]
    fn test_empty_history() {
        let (_dir, learner) = learner();
        let guidance = learner.reflect().unwrap();
        assert_eq!(guidance.rounds_seen, 0);
        assert!(guidance.dos.is_empty() && guidance.donts.is_empty());
    }
}
