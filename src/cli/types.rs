//! CLI type definitions
//!
//! This module contains clap command structures that define the CLI interface.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "conclave")]
#[command(about = "Conclave - governed job dispatcher and agent council", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to .conclave/config.yaml)
    #[arg(short, long, global = true, env = "CONCLAVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the state directory
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run dispatch cycles over the inbox
    Dispatch {
        /// Number of cycles to run
        #[arg(short = 'n', long, default_value = "1")]
        cycles: u32,

        /// Lease owner name (defaults to hostname and pid)
        #[arg(long)]
        owner: Option<String>,
    },

    /// Job queue commands
    #[command(subcommand)]
    Job(JobCommands),

    /// Council round commands
    #[command(subcommand)]
    Council(CouncilCommands),

    /// Council message bus commands
    #[command(subcommand)]
    Bus(BusCommands),

    /// Remote task routing commands
    #[command(subcommand)]
    Route(RouteCommands),

    /// Circuit breaker commands
    #[command(subcommand)]
    Breaker(BreakerCommands),

    /// Budgets, approvals and the kill switch
    #[command(subcommand)]
    Governance(GovernanceCommands),
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Copy a job document into the inbox
    Submit {
        /// Path to the job JSON document
        file: PathBuf,
    },

    /// List job ids in a queue directory
    List {
        #[arg(short, long, value_enum, default_value = "inbox")]
        location: QueueLocation,
    },

    /// Show the ledger history of a job
    History {
        job_id: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum QueueLocation {
    Inbox,
    Processed,
    Failed,
}

#[derive(Subcommand)]
pub enum CouncilCommands {
    /// Score a round's agent outputs and post verdicts
    Score {
        round_id: String,
    },

    /// Apply the winning output's diffs to the repository
    Apply {
        round_id: String,

        /// Run the configured health check after each block
        #[arg(long)]
        verify: bool,
    },

    /// Derive do / don't guidance from bus history
    Reflect,
}

#[derive(Subcommand)]
pub enum BusCommands {
    /// Post a message
    Send {
        #[arg(long)]
        from: String,

        /// Recipient agent or "*" for broadcast
        #[arg(long, default_value = "*")]
        to: String,

        /// verify, challenge, proposal or vote
        #[arg(long)]
        intent: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Time to live in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Open messages addressed to an agent
    Recv {
        agent: String,
    },

    /// Claim an open message
    Claim {
        message_id: String,
        #[arg(long)]
        agent: String,
    },

    /// Acknowledge a message
    Ack {
        message_id: String,
        #[arg(long)]
        agent: String,
    },

    /// Open a proposal
    Propose {
        title: String,
        #[arg(long)]
        proposer: String,
        #[arg(long)]
        quorum: Option<usize>,
    },

    /// Vote on a proposal
    Vote {
        proposal_id: String,
        #[arg(long)]
        agent: String,
        /// approve or reject
        decision: String,
    },

    /// Full message history
    History,
}

#[derive(Subcommand)]
pub enum RouteCommands {
    /// Deliver a task to a peer
    Send {
        /// Configured peer name
        receiver: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        #[arg(long)]
        task_id: Option<String>,

        #[arg(long, default_value = "0")]
        priority: i32,

        #[arg(long, value_enum, default_value = "local")]
        mode: RouteMode,
    },

    /// Redeliver everything left in the outbox
    Flush,

    /// Move a dead letter back to the outbox
    Requeue {
        task_id: String,
    },

    /// List dead letters
    Dlq,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RouteMode {
    Local,
    Remote,
}

#[derive(Subcommand)]
pub enum BreakerCommands {
    /// Show breaker state and the current failure ratio
    Status,

    /// Force the breaker closed
    Reset,
}

#[derive(Subcommand)]
pub enum GovernanceCommands {
    /// Show global and per-agent budgets
    Budget {
        agent: String,
    },

    /// Register an approval token
    Approve {
        token: String,
        #[arg(long)]
        note: Option<String>,
    },

    /// Engage the kill switch
    Halt {
        #[arg(long, default_value = "operator request")]
        reason: String,
    },

    /// Release the kill switch
    Resume,
}
