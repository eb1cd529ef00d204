use clap::Parser;
use conclave::cli::types::{
    BusCommands, CouncilCommands, JobCommands, QueueLocation, RouteCommands, RouteMode,
};
use conclave::cli::{Cli, Commands};

#[test]
fn test_parse_dispatch_defaults() {
    let cli = Cli::try_parse_from(vec!["conclave", "dispatch"]).unwrap();
    match cli.command {
        Commands::Dispatch { cycles, owner } => {
            assert_eq!(cycles, 1);
            assert!(owner.is_none());
        }
        _ => panic!("Wrong top-level command"),
    }
    assert!(cli.config.is_none());
    assert!(cli.state_dir.is_none());
}

#[test]
fn test_parse_dispatch_with_global_flags() {
    let cli = Cli::try_parse_from(vec![
        "conclave",
        "dispatch",
        "-n",
        "3",
        "--owner",
        "host-a",
        "--state-dir",
        "/tmp/state",
    ])
    .unwrap();
    match cli.command {
        Commands::Dispatch { cycles, owner } => {
            assert_eq!(cycles, 3);
            assert_eq!(owner.as_deref(), Some("host-a"));
        }
        _ => panic!("Wrong top-level command"),
    }
    assert_eq!(cli.state_dir.unwrap().to_str(), Some("/tmp/state"));
}

#[test]
fn test_parse_job_list_location() {
    let cli = Cli::try_parse_from(vec!["conclave", "job", "list", "--location", "failed"]).unwrap();
    match cli.command {
        Commands::Job(JobCommands::List { location }) => {
            assert!(matches!(location, QueueLocation::Failed));
        }
        _ => panic!("Wrong job command"),
    }
}

#[test]
fn test_parse_council_apply_verify() {
    let cli = Cli::try_parse_from(vec!["conclave", "council", "apply", "round-7", "--verify"]).unwrap();
    match cli.command {
        Commands::Council(CouncilCommands::Apply { round_id, verify }) => {
            assert_eq!(round_id, "round-7");
            assert!(verify);
        }
        _ => panic!("Wrong council command"),
    }
}

#[test]
fn test_parse_bus_send_defaults_to_broadcast() {
    let cli = Cli::try_parse_from(vec![
        "conclave", "bus", "send", "--from", "alpha", "--intent", "verify",
    ])
    .unwrap();
    match cli.command {
        Commands::Bus(BusCommands::Send {
            from,
            to,
            intent,
            payload,
            ttl,
        }) => {
            assert_eq!(from, "alpha");
            assert_eq!(to, "*");
            assert_eq!(intent, "verify");
            assert_eq!(payload, "{}");
            assert!(ttl.is_none());
        }
        _ => panic!("Wrong bus command"),
    }
}

#[test]
fn test_parse_bus_vote() {
    let cli = Cli::try_parse_from(vec![
        "conclave", "bus", "vote", "p-1", "--agent", "beta", "approve",
    ])
    .unwrap();
    match cli.command {
        Commands::Bus(BusCommands::Vote {
            proposal_id,
            agent,
            decision,
        }) => {
            assert_eq!(proposal_id, "p-1");
            assert_eq!(agent, "beta");
            assert_eq!(decision, "approve");
        }
        _ => panic!("Wrong bus command"),
    }
}

#[test]
fn test_parse_route_send() {
    let cli = Cli::try_parse_from(vec![
        "conclave",
        "route",
        "send",
        "peer-b",
        "--payload",
        r#"{"job":"x"}"#,
        "--task-id",
        "t-1",
        "--priority",
        "5",
        "--mode",
        "remote",
    ])
    .unwrap();
    match cli.command {
        Commands::Route(RouteCommands::Send {
            receiver,
            payload,
            task_id,
            priority,
            mode,
        }) => {
            assert_eq!(receiver, "peer-b");
            assert_eq!(payload, r#"{"job":"x"}"#);
            assert_eq!(task_id.as_deref(), Some("t-1"));
            assert_eq!(priority, 5);
            assert!(matches!(mode, RouteMode::Remote));
        }
        _ => panic!("Wrong route command"),
    }
}

#[test]
fn test_invalid_queue_location_fails() {
    assert!(Cli::try_parse_from(vec!["conclave", "job", "list", "--location", "archive"]).is_err());
}

#[test]
fn test_missing_required_args_fail() {
    assert!(Cli::try_parse_from(vec!["conclave", "bus", "send", "--intent", "verify"]).is_err());
    assert!(Cli::try_parse_from(vec!["conclave", "council", "score"]).is_err());
    assert!(Cli::try_parse_from(vec!["conclave", "route", "send"]).is_err());
}
