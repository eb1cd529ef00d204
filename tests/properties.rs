//! Property tests for lease exclusivity and budget accounting.

use chrono::{Duration, Utc};
use conclave::domain::models::{GovernanceConfig, Job, LeaseOutcome};
use conclave::infrastructure::storage::StateLayout;
use conclave::services::{Governance, LeaseManager};
use proptest::prelude::*;
use tempfile::TempDir;

const OWNERS: [&str; 3] = ["a", "b", "c"];

#[derive(Debug, Clone)]
enum LeaseOp {
    Acquire(usize),
    Release(usize),
    Advance(i64),
}

fn lease_op() -> impl Strategy<Value = LeaseOp> {
    prop_oneof![
        (0..OWNERS.len()).prop_map(LeaseOp::Acquire),
        (0..OWNERS.len()).prop_map(LeaseOp::Release),
        (1i64..20).prop_map(LeaseOp::Advance),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn at_most_one_owner_holds_a_live_lease(ops in prop::collection::vec(lease_op(), 1..40)) {
        let dir = TempDir::new().unwrap();
        let leases = LeaseManager::new(dir.path().join("leases.json"), 10);
        let mut now = Utc::now();
        let mut holder: Option<(usize, chrono::DateTime<Utc>)> = None;

        for op in ops {
            match op {
                LeaseOp::Acquire(who) => {
                    let live = holder.filter(|(_, expires)| *expires > now);
                    let outcome = leases.acquire("job", OWNERS[who], now).unwrap();
                    match live {
                        Some((current, _)) if current != who => {
                            let held_by = match outcome {
                                LeaseOutcome::Held { owner, .. } => Some(owner),
                                LeaseOutcome::Acquired(_) => None,
                            };
                            prop_assert_eq!(held_by.as_deref(), Some(OWNERS[current]));
                        }
                        _ => {
                            prop_assert!(outcome.is_acquired());
                            holder = Some((who, now + Duration::seconds(10)));
                        }
                    }
                }
                LeaseOp::Release(who) => {
                    let released = leases.release("job", OWNERS[who]).unwrap();
                    let owned = holder.is_some_and(|(owner, _)| owner == who);
                    prop_assert_eq!(released, owned);
                    if owned {
                        holder = None;
                    }
                }
                LeaseOp::Advance(secs) => now += Duration::seconds(secs),
            }

            let stored = leases.get("job").unwrap();
            prop_assert_eq!(stored.map(|l| l.owner), holder.map(|(owner, _)| OWNERS[owner].to_string()));
        }
    }

    #[test]
    fn spend_never_decreases_and_limit_is_enforced(amounts in prop::collection::vec(0.0f64..3.0, 1..12)) {
        let dir = TempDir::new().unwrap();
        let config = GovernanceConfig {
            global_daily_limit_usd: 10.0,
            agent_daily_limit_usd: 10.0,
            ..GovernanceConfig::default()
        };
        let governance = Governance::new(StateLayout::new(dir.path()), config);
        let mut last = 0.0;

        for (i, amount) in amounts.into_iter().enumerate() {
            let job = Job::new(format!("job-{i}"), "echo", "ops").with_spend(amount);
            let before = governance.budgets("ops").unwrap().global.spent_today_usd;
            match governance.check_budget(&job, "trace") {
                Ok(()) => {
                    prop_assert!(before + amount <= 10.0 + 1e-9);
                    governance.record_spend(&job, "trace").unwrap();
                }
                Err(_) => prop_assert!(before + amount > 10.0 - 1e-9),
            }
            let spent = governance.budgets("ops").unwrap().global.spent_today_usd;
            prop_assert!(spent >= last);
            prop_assert!(spent <= 10.0 + 1e-9);
            last = spent;
        }
    }
}
