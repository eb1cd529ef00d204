use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::job::RiskTier;

/// Upper bound for configured durations (100 years).
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Configured seconds as a `chrono::Duration`, capped at
/// [`MAX_DURATION_SECS`] so adding it to a timestamp cannot overflow.
pub fn duration_from_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs.min(MAX_DURATION_SECS)).unwrap_or(0))
}

/// Main configuration structure for Conclave
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Dispatch cycle tuning
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Budget, fairness and approval gates
    #[serde(default)]
    pub governance: GovernanceConfig,

    /// Circuit breaker thresholds
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Handlers keyed by task_type
    #[serde(default)]
    pub handlers: BTreeMap<String, HandlerConfig>,

    /// Execution profiles keyed by target_profile
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,

    /// Council bus and supervisor
    #[serde(default)]
    pub council: CouncilConfig,

    /// Patch applier limits
    #[serde(default)]
    pub patch: PatchConfig,

    /// Remote task routing
    #[serde(default)]
    pub router: RouterConfig,

    /// Reflection learner
    #[serde(default)]
    pub reflection: ReflectionConfig,
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    /// Root of queues, ledgers, budgets and council state
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Working tree patches are applied to and citations resolved against
    #[serde(default = "default_repo_root")]
    pub repo_root: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".conclave/state")
}

fn default_repo_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            repo_root: default_repo_root(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stderr only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Rotation for file output: daily, hourly, never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

/// Dispatch cycle tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DispatcherConfig {
    /// Lease owner identity; derived from host and pid when unset
    pub owner: Option<String>,
    pub lease_ttl_secs: u64,
    /// Heartbeat renews every `lease_ttl_secs / heartbeat_divisor`
    pub heartbeat_divisor: u32,
    pub handler_timeout_secs: u64,
    pub max_jobs_per_cycle: usize,
    pub idempotency_ttl_secs: u64,
    /// Bytes of handler stdout/stderr kept in ledger details
    pub output_capture_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            owner: None,
            lease_ttl_secs: 90,
            heartbeat_divisor: 3,
            handler_timeout_secs: 600,
            max_jobs_per_cycle: 50,
            idempotency_ttl_secs: 86_400,
            output_capture_bytes: 4096,
        }
    }
}

impl DispatcherConfig {
    pub fn owner_id(&self) -> String {
        self.owner.clone().unwrap_or_else(|| {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
            format!("{}-{}", host, std::process::id())
        })
    }
}

/// Score penalty per risk tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RiskPenalties {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskPenalties {
    fn default() -> Self {
        Self {
            low: 0.0,
            medium: 10.0,
            high: 25.0,
            critical: 50.0,
        }
    }
}

impl RiskPenalties {
    pub fn for_tier(&self, tier: RiskTier) -> f64 {
        match tier {
            RiskTier::Low => self.low,
            RiskTier::Medium => self.medium,
            RiskTier::High => self.high,
            RiskTier::Critical => self.critical,
        }
    }
}

/// Budget, fairness and approval gates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GovernanceConfig {
    /// Limit written into a freshly created global budget file
    pub global_daily_limit_usd: f64,
    /// Limit written into a freshly created per-agent budget file
    pub agent_daily_limit_usd: f64,
    pub fairness_window: usize,
    pub fairness_cap: f64,
    pub fairness_min_samples: usize,
    /// Salt prepended to tokens before hashing
    pub approval_salt: String,
    pub risk_penalties: RiskPenalties,
    /// Score weight applied to estimated spend
    pub spend_weight: f64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            global_daily_limit_usd: 5.0,
            agent_daily_limit_usd: 5.0,
            fairness_window: 20,
            fairness_cap: 0.6,
            fairness_min_samples: 10,
            approval_salt: String::new(),
            risk_penalties: RiskPenalties::default(),
            spend_weight: 0.05,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Number of most recent terminal ledger entries considered
    pub window: usize,
    /// Terminal entries required before the ratio is trusted
    pub min_samples: usize,
    /// Failure ratio that opens the breaker
    pub threshold: f64,
    pub cooldown_secs: u64,
    /// Cycles allowed to probe in half-open; unbounded when unset
    pub half_open_max_probes: Option<u32>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 20,
            min_samples: 10,
            threshold: 0.5,
            cooldown_secs: 300,
            half_open_max_probes: None,
        }
    }
}

/// External process invoked for a task type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HandlerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Credentials and environment visible to a profile
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct ProfileConfig {
    /// Env var prefixes owned by this profile (e.g. `RESEARCH_`)
    pub credential_prefixes: Vec<String>,
    /// Extra variables injected into the handler environment
    pub env: BTreeMap<String, String>,
}

/// Council bus and supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CouncilConfig {
    pub message_ttl_secs: u64,
    /// Quorum for proposals opened by the supervisor
    pub quorum: usize,
    pub min_output_chars: usize,
    /// Files whose safety lines may not be deleted
    pub protected_files: Vec<String>,
    /// Phrases marking safety-critical lines
    pub safety_phrases: Vec<String>,
    pub ontology_key: String,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            message_ttl_secs: 86_400,
            quorum: 2,
            min_output_chars: 200,
            protected_files: vec![
                "src/services/governance.rs".to_string(),
                "src/services/circuit_breaker.rs".to_string(),
                "src/services/lease_manager.rs".to_string(),
                "**/guardrails/**".to_string(),
            ],
            safety_phrases: vec![
                "kill_switch".to_string(),
                "budget".to_string(),
                "approval".to_string(),
                "audit".to_string(),
                "lease".to_string(),
            ],
            ontology_key: "ONTOLOGY_ACK".to_string(),
        }
    }
}

/// Patch applier limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PatchConfig {
    pub max_block_bytes: usize,
    pub max_files: usize,
    pub blocklist: Vec<String>,
    /// Directory prefixes patches may touch
    pub allowed_dirs: Vec<String>,
    pub allow_any_path: bool,
    /// Require every touched path in a `DECLARED_FILES:` line
    pub require_declaration: bool,
    /// Health check run after apply when verification is requested
    pub verify_command: Vec<String>,
    pub git_binary: String,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            max_block_bytes: 64 * 1024,
            max_files: 10,
            blocklist: vec![
                ".env".to_string(),
                "*.key".to_string(),
                "*.pem".to_string(),
                "**/secrets/**".to_string(),
                ".github/workflows/".to_string(),
            ],
            allowed_dirs: vec![
                "src/".to_string(),
                "tests/".to_string(),
                "docs/".to_string(),
            ],
            allow_any_path: false,
            require_declaration: false,
            verify_command: Vec::new(),
            git_binary: "git".to_string(),
        }
    }
}

/// How to reach a peer dispatcher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerConfig {
    /// Another dispatcher sharing this filesystem
    Local { inbox_dir: PathBuf },
    /// A dispatcher behind an HTTP intake endpoint
    Http { url: String },
}

/// Remote task routing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RouterConfig {
    pub sender: String,
    pub peers: BTreeMap<String, PeerConfig>,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Randomization factor applied to each backoff interval
    pub jitter: f64,
    pub attempt_timeout_secs: u64,
    pub idempotency_ttl_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            sender: "conclave".to_string(),
            peers: BTreeMap::new(),
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            jitter: 0.3,
            attempt_timeout_secs: 10,
            idempotency_ttl_secs: 86_400,
        }
    }
}

/// Reflection learner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ReflectionConfig {
    /// Challenges naming a finding before it becomes guidance
    pub min_occurrences: usize,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self { min_occurrences: 2 }
    }
}
