//! Commands run through the CLI entry point against a temporary state dir.

mod common;

use clap::Parser;
use common::TestEnv;
use conclave::cli::output::{EXIT_DENIED, EXIT_OK};
use conclave::cli::{run, AppContext, Cli};
use conclave::domain::models::Job;
use conclave::infrastructure::storage::JobQueue;

async fn invoke(env: &TestEnv, args: &[&str]) -> conclave::cli::CommandOutput {
    let mut argv = vec!["conclave"];
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(argv).unwrap();
    run(cli, &AppContext::new(env.config.clone())).await.unwrap()
}

#[tokio::test]
async fn dispatch_reports_processed_jobs() {
    let env = TestEnv::new();
    JobQueue::new(env.layout())
        .submit(&Job::new("cli-1", "echo", "ops"))
        .unwrap();

    let out = invoke(&env, &["dispatch"]).await;
    assert_eq!(out.exit_code(), EXIT_OK);
    let json = out.to_json();
    assert_eq!(json["ok"], true);
    assert_eq!(json["processed"], 1);

    let listed = invoke(&env, &["job", "list", "--location", "processed"]).await.to_json();
    assert_eq!(listed["files"][0], "cli-1.json");
}

#[tokio::test]
async fn halt_stops_dispatch_until_resumed() {
    let env = TestEnv::new();
    JobQueue::new(env.layout())
        .submit(&Job::new("cli-2", "echo", "ops"))
        .unwrap();

    assert!(invoke(&env, &["governance", "halt", "--reason", "maintenance"]).await.ok);
    let halted = invoke(&env, &["dispatch"]).await;
    assert_eq!(halted.exit_code(), EXIT_DENIED);
    assert_eq!(halted.to_json()["halted"], true);

    assert!(invoke(&env, &["governance", "resume"]).await.ok);
    let resumed = invoke(&env, &["dispatch"]).await.to_json();
    assert_eq!(resumed["processed"], 1);
}

#[tokio::test]
async fn bus_conflicts_are_denied_not_errors() {
    let env = TestEnv::new();
    let sent = invoke(&env, &["bus", "send", "--from", "alpha", "--intent", "verify"]).await;
    let id = sent.to_json()["message"]["id"].as_str().unwrap().to_string();

    assert!(invoke(&env, &["bus", "claim", &id, "--agent", "beta"]).await.ok);
    let second = invoke(&env, &["bus", "claim", &id, "--agent", "gamma"]).await;
    assert_eq!(second.exit_code(), EXIT_DENIED);
    assert!(second.to_json()["error"].as_str().unwrap().contains("claimed"));
}

#[tokio::test]
async fn scoring_an_empty_round_is_denied() {
    let env = TestEnv::new();
    let out = invoke(&env, &["council", "score", "nothing-here"]).await;
    assert_eq!(out.exit_code(), EXIT_DENIED);
}
