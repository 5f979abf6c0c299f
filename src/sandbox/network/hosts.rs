use glob::{MatchOptions, Pattern};

use crate::sandbox::policy::{NetworkMode, NetworkPolicy};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A host rule: an exact hostname/IP, or `*.suffix` for subdomains of `suffix`.
#[derive(Debug, Clone)]
pub struct HostPattern {
    raw: String,
    pattern: Pattern,
}

impl HostPattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let host = normalize_host(raw);

        if host.is_empty() {
            return Err("empty host pattern".to_string());
        }
        if host.contains("://") || host.contains('/') || host.chars().any(char::is_whitespace) {
            return Err(format!("'{}' must be a bare hostname", raw));
        }
        if host.contains(['[', ']', '?']) {
            return Err(format!("'{}' contains unsupported characters", raw));
        }
        if let Some(star) = host.find('*')
            && (star != 0 || !host.starts_with("*.") || host[2..].contains('*'))
        {
            return Err(format!(
                "'{}': wildcards are only supported as a leading '*.'",
                raw
            ));
        }

        let pattern = Pattern::new(&host).map_err(|e| format!("'{}': {}", raw, e))?;
        Ok(Self { raw: host, pattern })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, host: &str) -> bool {
        self.pattern
            .matches_with(&normalize_host(host), MATCH_OPTIONS)
    }
}

/// Lowercase, drop a trailing root dot and IPv6 brackets.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('.');
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.to_ascii_lowercase()
}

/// Result of evaluating the explicit host lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    Allow,
    Deny,
    /// Not covered by any list; the ask path decides (allow-list mode only).
    Undecided,
}

/// Compiled allow/deny lists for one generation.
#[derive(Debug, Clone)]
pub struct HostRules {
    mode: NetworkMode,
    allowed: Vec<HostPattern>,
    denied: Vec<HostPattern>,
}

impl HostRules {
    pub fn new(mode: NetworkMode, allowed: &[String], denied: &[String]) -> Self {
        let compile = |list: &[String]| -> Vec<HostPattern> {
            list.iter()
                .filter_map(|raw| HostPattern::parse(raw).ok())
                .collect()
        };
        Self {
            mode,
            allowed: compile(allowed),
            denied: compile(denied),
        }
    }

    pub fn from_policy(policy: &NetworkPolicy) -> Self {
        Self::new(policy.mode, &policy.allowed_hosts, &policy.denied_hosts)
    }

    /// Denied hosts always lose, in every mode.
    pub fn evaluate(&self, host: &str) -> RuleOutcome {
        if self.denied.iter().any(|p| p.matches(host)) {
            return RuleOutcome::Deny;
        }
        match self.mode {
            NetworkMode::Disabled | NetworkMode::DenyList => RuleOutcome::Allow,
            NetworkMode::AllowList => {
                if self.allowed.iter().any(|p| p.matches(host)) {
                    RuleOutcome::Allow
                } else {
                    RuleOutcome::Undecided
                }
            }
        }
    }
}
