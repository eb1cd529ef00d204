//! Council round lifecycle: bus, scoring, patch application and reflection.

mod common;

use chrono::Utc;
use common::{TestEnv, CLEAN_OUTPUT};
use conclave::domain::errors::BusError;
use conclave::domain::models::{
    BlockOutcome, Intent, MessageStatus, ProposalStatus, VerdictStatus, VoteDecision, BROADCAST,
};
use conclave::services::{CouncilBus, CouncilSupervisor, Outgoing, PatchApplier, ReflectionLearner};
use serde_json::json;
use std::process::Command;

fn supervisor(env: &TestEnv) -> CouncilSupervisor {
    CouncilSupervisor::new(env.layout(), env.config.council.clone(), env.repo())
}

fn bus(env: &TestEnv) -> CouncilBus {
    CouncilBus::new(&env.layout(), env.config.council.message_ttl_secs)
}

#[test]
fn proposal_resolves_at_quorum_and_rejects_late_votes() {
    let env = TestEnv::new();
    let bus = bus(&env);

    let proposal = bus.propose("adopt schema v3", "alpha", 2).unwrap();
    assert_eq!(proposal.status, ProposalStatus::Proposed);

    let after_one = bus.vote(&proposal.id, "alpha", VoteDecision::Approve).unwrap();
    assert_eq!(after_one.status, ProposalStatus::Voting);

    // Changing a vote replaces it rather than adding a second one.
    bus.vote(&proposal.id, "beta", VoteDecision::Reject).unwrap();
    let resolved = bus.vote(&proposal.id, "beta", VoteDecision::Approve).unwrap();
    assert_eq!(resolved.status, ProposalStatus::ResolvedApproved);

    let late = bus.vote(&proposal.id, "gamma", VoteDecision::Reject);
    assert!(matches!(late, Err(BusError::ProposalResolved(_))));
}

#[test]
fn claim_and_ack_follow_message_lifecycle() {
    let env = TestEnv::new();
    let bus = bus(&env);
    let msg = bus
        .send(Outgoing::new("alpha", BROADCAST, Intent::Verify, json!({"note": "check"})))
        .unwrap();

    assert_eq!(bus.recv("beta", Utc::now()).unwrap().len(), 1);
    bus.claim(&msg.id, "beta").unwrap();
    assert_eq!(bus.status(&msg.id).unwrap(), MessageStatus::Claimed);
    assert!(matches!(bus.claim(&msg.id, "gamma"), Err(BusError::NotClaimable { .. })));

    bus.ack(&msg.id, "beta").unwrap();
    assert_eq!(bus.status(&msg.id).unwrap(), MessageStatus::Acked);
    assert!(bus.recv("beta", Utc::now()).unwrap().is_empty());
    assert!(matches!(bus.ack(&msg.id, "beta"), Err(BusError::AlreadyAcked(_))));
}

#[test]
fn all_ok_round_still_gets_a_challenge() {
    let env = TestEnv::new();
    env.write_output("r1", "alpha", CLEAN_OUTPUT);
    env.write_output("r1", "beta", CLEAN_OUTPUT);

    let report = supervisor(&env).score_round("r1").unwrap();
    assert!(report.verdicts.iter().all(|v| v.status == VerdictStatus::Ok));
    assert_eq!(report.forced_challenge.as_deref(), Some("alpha"));

    let challenges: Vec<_> = bus(&env)
        .history()
        .unwrap()
        .into_iter()
        .filter(|m| m.intent == Intent::Challenge)
        .collect();
    assert_eq!(challenges.len(), 1);
    assert_eq!(challenges[0].payload["forced"], true);
}

#[test]
fn reflection_turns_repeated_findings_into_donts() {
    let env = TestEnv::new();
    for round in ["r1", "r2"] {
        env.write_output(round, "alpha", CLEAN_OUTPUT);
        env.write_output(round, "beta", "I can't help with that.");
        supervisor(&env).score_round(round).unwrap();
    }

    let guidance = ReflectionLearner::new(&env.layout(), bus(&env), env.config.reflection.clone())
        .reflect()
        .unwrap();
    assert_eq!(guidance.rounds_seen, 2);
    let keys: Vec<&str> = guidance.donts.iter().map(|d| d.key.as_str()).collect();
    assert!(keys.contains(&"refusal"), "{keys:?}");
    assert!(keys.contains(&"too_short"), "{keys:?}");
    assert!(guidance.dos.iter().any(|d| d.key == "verified:alpha"));
    assert!(guidance.incomplete_rounds.is_empty());
    assert!(env.layout().reflection().exists());
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

const WINNING_OUTPUT: &str = "I reviewed the module layout and propose three independent changes. \
The first touches a build script, the second renames the exported function, and the third adds \
a short notes page for operators. Each block can be applied on its own, and none of them \
changes behaviour that other agents depend on in this round.\n\
```diff\n\
--- a/build.rs\n\
+++ b/build.rs\n\
@@ -1 +1 @@\n\
-fn main() {}\n\
+fn main() { println!(\"cargo:rerun-if-changed=build.rs\"); }\n\
```\n\
```diff\n\
--- a/src/lib.rs\n\
+++ b/src/lib.rs\n\
@@ -1 +1 @@\n\
-pub fn old() {}\n\
+pub fn new() {}\n\
```\n\
```diff\n\
--- /dev/null\n\
+++ b/docs/notes.md\n\
@@ -0,0 +1,9 @@\n\
+# Notes\n\
+Apply one block at a time.\n\
```\n";

#[tokio::test]
async fn winner_blocks_apply_independently_and_rerun_is_noop() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let env = TestEnv::new();
    let repo = env.repo();
    assert!(Command::new("git").arg("init").arg("-q").current_dir(repo).status().unwrap().success());
    std::fs::create_dir_all(repo.join("src")).unwrap();
    std::fs::write(repo.join("src/lib.rs"), "pub fn old() {}\n").unwrap();
    std::fs::write(repo.join("build.rs"), "fn main() {}\n").unwrap();

    env.write_output("r1", "alpha", WINNING_OUTPUT);
    let report = supervisor(&env).score_round("r1").unwrap();
    assert_eq!(report.winner.as_deref(), Some("alpha"));

    let applier = PatchApplier::new(env.layout(), env.config.patch.clone(), repo);
    let result = applier.apply_round("r1", false).await.unwrap();
    assert!(!result.skipped);

    let outcomes: Vec<&BlockOutcome> = result.receipt.blocks.iter().map(|b| &b.outcome).collect();
    assert!(matches!(outcomes[0], BlockOutcome::Rejected { .. }));
    assert_eq!(outcomes[1], &BlockOutcome::Applied);
    assert_eq!(outcomes[2], &BlockOutcome::Salvaged);

    assert_eq!(std::fs::read_to_string(repo.join("src/lib.rs")).unwrap(), "pub fn new() {}\n");
    assert_eq!(std::fs::read_to_string(repo.join("build.rs")).unwrap(), "fn main() {}\n");
    assert_eq!(
        std::fs::read_to_string(repo.join("docs/notes.md")).unwrap(),
        "# Notes\nApply one block at a time.\n"
    );

    let again = applier.apply_round("r1", false).await.unwrap();
    assert!(again.skipped);
    assert_eq!(again.receipt, result.receipt);
}

#[tokio::test]
async fn failed_verification_rolls_block_back() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let mut env = TestEnv::new();
    env.config.patch.verify_command = vec!["false".to_string()];
    let repo = env.repo().to_path_buf();
    assert!(Command::new("git").arg("init").arg("-q").current_dir(&repo).status().unwrap().success());
    std::fs::create_dir_all(repo.join("src")).unwrap();
    std::fs::write(repo.join("src/lib.rs"), "pub fn old() {}\n").unwrap();

    env.write_output("r2", "alpha", WINNING_OUTPUT);
    supervisor(&env).score_round("r2").unwrap();

    let applier = PatchApplier::new(env.layout(), env.config.patch.clone(), &repo);
    let result = applier.apply_round("r2", true).await.unwrap();
    assert!(matches!(result.receipt.blocks[1].outcome, BlockOutcome::RolledBack { .. }));
    assert_eq!(result.receipt.applied_count(), 0);
    assert_eq!(std::fs::read_to_string(repo.join("src/lib.rs")).unwrap(), "pub fn old() {}\n");
    assert!(!repo.join("docs/notes.md").exists());
}

const RELOCATING_OUTPUT: &str = "I reviewed the repository layout and propose moving the pipeline \
definition next to the other automation so it is picked up without extra configuration, and \
keeping a copy of the library entry point beside the deployment tooling. Neither change alters \
runtime behaviour, and each block can be applied or skipped on its own in this round.\n\
```diff\n\
diff --git a/src/ci.yml b/src/ci.yml\n\
similarity index 100%\n\
rename from src/ci.yml\n\
rename to .github/workflows/ci.yml\n\
```\n\
```diff\n\
diff --git a/src/lib.rs b/src/lib.rs\n\
similarity index 100%\n\
copy from src/lib.rs\n\
copy to scripts/lib.rs\n\
```\n";

fn init_repo(repo: &std::path::Path) {
    assert!(Command::new("git").arg("init").arg("-q").current_dir(repo).status().unwrap().success());
    std::fs::create_dir_all(repo.join("src")).unwrap();
    std::fs::write(repo.join("src/lib.rs"), "pub fn old() {}\n").unwrap();
}

#[tokio::test]
async fn rename_and_copy_targets_go_through_path_gates() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let env = TestEnv::new();
    let repo = env.repo();
    init_repo(repo);
    std::fs::write(repo.join("src/ci.yml"), "name: ci\n").unwrap();

    env.write_output("r3", "alpha", RELOCATING_OUTPUT);
    let report = supervisor(&env).score_round("r3").unwrap();
    assert_eq!(report.winner.as_deref(), Some("alpha"));

    let applier = PatchApplier::new(env.layout(), env.config.patch.clone(), repo);
    let result = applier.apply_round("r3", false).await.unwrap();

    let blocks = &result.receipt.blocks;
    assert_eq!(blocks.len(), 2);
    assert!(matches!(blocks[0].outcome, BlockOutcome::Rejected { .. }));
    assert!(blocks[0].paths.contains(&".github/workflows/ci.yml".to_string()));
    assert!(matches!(blocks[1].outcome, BlockOutcome::Rejected { .. }));
    assert!(blocks[1].paths.contains(&"scripts/lib.rs".to_string()));

    assert!(!repo.join(".github/workflows/ci.yml").exists());
    assert!(repo.join("src/ci.yml").exists());
    assert!(!repo.join("scripts/lib.rs").exists());
}

#[tokio::test]
async fn failed_reverse_apply_is_recorded_and_stops_the_round() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let mut env = TestEnv::new();
    env.config.patch.verify_command = ["sh", "-c", "echo extra >> src/lib.rs; false"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let repo = env.repo().to_path_buf();
    init_repo(&repo);

    env.write_output("r4", "alpha", WINNING_OUTPUT);
    supervisor(&env).score_round("r4").unwrap();

    let applier = PatchApplier::new(env.layout(), env.config.patch.clone(), &repo);
    let result = applier.apply_round("r4", true).await.unwrap();

    // The documentation block after the failed rollback is never attempted.
    assert_eq!(result.receipt.blocks.len(), 2);
    assert!(matches!(result.receipt.blocks[1].outcome, BlockOutcome::RollbackFailed { .. }));
    assert!(result.receipt.rollback_failed());
    assert_eq!(result.receipt.applied_count(), 0);
    assert_eq!(
        std::fs::read_to_string(repo.join("src/lib.rs")).unwrap(),
        "pub fn new() {}\nextra\n"
    );
    assert!(!repo.join("docs/notes.md").exists());

    let again = applier.apply_round("r4", true).await.unwrap();
    assert!(again.skipped);
}
