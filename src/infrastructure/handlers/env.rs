//! Profile-scoped handler environments.

use std::collections::BTreeMap;
use std::path::Path;

use crate::domain::models::{Job, ProfileConfig};

/// Name segments that mark a variable as a credential.
const CREDENTIAL_MARKERS: &[&str] = &[
    "KEY",
    "APIKEY",
    "TOKEN",
    "SECRET",
    "PASSWORD",
    "PASSWD",
    "CREDENTIALS",
];

fn looks_like_credential(key: &str) -> bool {
    key.to_uppercase()
        .split('_')
        .any(|segment| CREDENTIAL_MARKERS.contains(&segment))
}

fn has_prefix(key: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| !p.is_empty() && key.starts_with(p.as_str()))
}

/// Build the environment a handler sees for `job`.
///
/// Credential-looking variables and variables owned by any configured
/// profile are dropped unless they belong to the job's own profile. The
/// profile's fixed `env` entries and the `CONCLAVE_*` job variables are
/// layered on top.
pub fn scoped_environment<I>(
    job: &Job,
    job_path: &Path,
    trace_id: &str,
    profiles: &BTreeMap<String, ProfileConfig>,
    inherited: I,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let own = profiles.get(&job.target_profile);
    let own_prefixes: &[String] = own.map(|p| p.credential_prefixes.as_slice()).unwrap_or(&[]);
    let foreign_prefixes: Vec<String> = profiles
        .iter()
        .filter(|(name, _)| *name != &job.target_profile)
        .flat_map(|(_, p)| p.credential_prefixes.iter().cloned())
        .collect();

    let mut env: BTreeMap<String, String> = inherited
        .into_iter()
        .filter(|(key, _)| {
            if has_prefix(key, own_prefixes) {
                return true;
            }
            !(looks_like_credential(key) || has_prefix(key, &foreign_prefixes))
        })
        .collect();

    if let Some(profile) = own {
        env.extend(profile.env.clone());
    }

    env.insert("CONCLAVE_JOB_ID".to_string(), job.id.clone());
    env.insert(
        "CONCLAVE_JOB_PATH".to_string(),
        job_path.display().to_string(),
    );
    env.insert("CONCLAVE_PROFILE".to_string(), job.target_profile.clone());
    env.insert("CONCLAVE_TASK_TYPE".to_string(), job.task_type.clone());
    env.insert("CONCLAVE_TRACE_ID".to_string(), trace_id.to_string());
    env
}

/// Values of credential variables that made it into `env`, for output scrubbing.
pub fn credential_values(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter()
        .filter(|(k, _)| looks_like_credential(k))
        .map(|(_, v)| v.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles() -> BTreeMap<String, ProfileConfig> {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "research".to_string(),
            ProfileConfig {
                credential_prefixes: vec!["RESEARCH_".to_string()],
                env: BTreeMap::from([("MODE".to_string(), "deep".to_string())]),
            },
        );
        profiles.insert(
            "trading".to_string(),
            ProfileConfig {
                credential_prefixes: vec!["BROKER_".to_string()],
                env: BTreeMap::new(),
            },
        );
        profiles
    }

    fn inherited() -> Vec<(String, String)> {
        [
            ("PATH", "/usr/bin"),
            ("HOME", "/home/agent"),
            ("OPENAI_API_KEY", "sk-global"),
            ("RESEARCH_API_TOKEN", "r-token"),
            ("BROKER_ACCOUNT", "acct-9"),
            ("MONKEY_BUSINESS", "fine"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_scopes_credentials_to_profile() {
        let job = Job::new("j1", "echo", "research");
        let env = scoped_environment(&job, Path::new("/q/j1.json"), "t-1", &profiles(), inherited());

        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(env.get("RESEARCH_API_TOKEN").map(String::as_str), Some("r-token"));
        assert_eq!(env.get("MODE").map(String::as_str), Some("deep"));
        assert_eq!(env.get("MONKEY_BUSINESS").map(String::as_str), Some("fine"));
        assert!(!env.contains_key("OPENAI_API_KEY"));
        assert!(!env.contains_key("BROKER_ACCOUNT"));
        assert_eq!(env.get("CONCLAVE_JOB_ID").map(String::as_str), Some("j1"));
        assert_eq!(env.get("CONCLAVE_TRACE_ID").map(String::as_str), Some("t-1"));
    }

    #[test]
    fn test_unknown_profile_gets_no_credentials() {
        let job = Job::new("j2", "echo", "nobody");
        let env = scoped_environment(&job, Path::new("/q/j2.json"), "t", &profiles(), inherited());

        assert!(!env.contains_key("RESEARCH_API_TOKEN"));
        assert!(!env.contains_key("BROKER_ACCOUNT"));
        assert!(env.contains_key("HOME"));
    }

    #[test]
    fn test_credential_values() {
        let env = BTreeMap::from([
            ("RESEARCH_API_TOKEN".to_string(), "r-token".to_string()),
            ("HOME".to_string(), "/home".to_string()),
        ]);
        assert_eq!(credential_values(&env), vec!["r-token".to_string()]);
    }
}
