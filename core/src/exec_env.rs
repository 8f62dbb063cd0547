use std::collections::HashMap;
use wildmatch::WildMatch;

/// Which of the parent's environment variables spawned commands start from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShellEnvironmentPolicyInherit {
    /// Everything the agent process sees.
    #[default]
    All,

    /// A minimal, deterministic set (HOME, PATH, shell identity, temp dirs).
    Core,

    /// Nothing; only `set` entries end up in the child environment.
    None,
}

/// Explicit configuration point for the environment handed to spawned
/// commands. Defaults inherit everything while stripping variables whose
/// names look credential-shaped.
#[derive(Debug, Clone, Default)]
pub struct ShellEnvironmentPolicy {
    pub inherit: ShellEnvironmentPolicyInherit,
    /// Skip the built-in `*KEY*` / `*SECRET*` / `*TOKEN*` excludes.
    pub ignore_default_excludes: bool,
    /// Case-insensitive glob patterns removed after inheritance.
    pub exclude: Vec<String>,
    /// Inserted (or overriding) entries, applied after excludes.
    pub set: HashMap<String, String>,
    /// When non-empty, only variables matching one of these patterns survive.
    pub include_only: Vec<String>,
}

const CORE_VARS: [&str; 9] = [
    "HOME", "LOGNAME", "PATH", "SHELL", "USER", "USERNAME", "TMPDIR", "TEMP", "TMP",
];

const DEFAULT_EXCLUDES: [&str; 3] = ["*KEY*", "*SECRET*", "*TOKEN*"];

pub fn create_env(policy: &ShellEnvironmentPolicy) -> HashMap<String, String> {
    populate_env(std::env::vars(), policy)
}

fn populate_env(
    vars: impl Iterator<Item = (String, String)>,
    policy: &ShellEnvironmentPolicy,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = match policy.inherit {
        ShellEnvironmentPolicyInherit::All => vars.collect(),
        ShellEnvironmentPolicyInherit::Core => vars
            .filter(|(name, _)| CORE_VARS.contains(&name.as_str()))
            .collect(),
        ShellEnvironmentPolicyInherit::None => HashMap::new(),
    };

    let matches_any = |name: &str, patterns: &[WildMatch]| {
        let upper = name.to_uppercase();
        patterns.iter().any(|pattern| pattern.matches(&upper))
    };

    if !policy.ignore_default_excludes {
        let default_excludes: Vec<WildMatch> =
            DEFAULT_EXCLUDES.iter().map(|p| WildMatch::new(p)).collect();
        env.retain(|name, _| !matches_any(name, &default_excludes));
    }

    if !policy.exclude.is_empty() {
        let excludes: Vec<WildMatch> = policy
            .exclude
            .iter()
            .map(|p| WildMatch::new(&p.to_uppercase()))
            .collect();
        env.retain(|name, _| !matches_any(name, &excludes));
    }

    env.extend(policy.set.clone());

    if !policy.include_only.is_empty() {
        let includes: Vec<WildMatch> = policy
            .include_only
            .iter()
            .map(|p| WildMatch::new(&p.to_uppercase()))
            .collect();
        env.retain(|name, _| matches_any(name, &includes));
    }

    env
}
