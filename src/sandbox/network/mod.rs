//! Network restriction enforcer.
//!
//! Wrapped commands reach the network only through a local HTTP(S) proxy.
//! Each connection is evaluated against the active generation's host rules;
//! hosts no list covers are handed to the ask-callback (allow-list mode).
//!
//! The per-generation state (rules, ask handle, decision cache, cancellation
//! token) is one immutable [`NetworkState`] swapped atomically on every
//! generation change, so a connection never sees half of an update.

mod ask;
mod decisions;
mod hosts;
pub mod proxy;

pub use ask::{AskCallback, AskHandle, ChannelAskCallback, HostRequest, PendingDecision};
pub use decisions::{DecisionSource, HostDecision, HostDecisionCache, Verdict};
pub use hosts::{HostPattern, HostRules, RuleOutcome, normalize_host};
pub use proxy::ProxyHandle;

#[cfg(test)]
pub use ask::MockAskCallback;

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::policy::{DEFAULT_ASK_TIMEOUT_MS, NetworkMode, NetworkPolicy};
use super::violations::{ViolationEntry, ViolationKind, ViolationStore};

/// Everything the proxy needs for one generation.
#[derive(Debug)]
pub struct NetworkState {
    pub generation: u64,
    rules: HostRules,
    ask: Option<AskHandle>,
    ask_timeout: Duration,
    decisions: HostDecisionCache,
    cancel: CancellationToken,
}

impl NetworkState {
    pub fn new(generation: u64, policy: &NetworkPolicy, cancel: CancellationToken) -> Self {
        Self {
            generation,
            rules: HostRules::from_policy(policy),
            ask: policy.ask_callback.clone(),
            ask_timeout: policy.ask_timeout,
            decisions: HostDecisionCache::new(),
            cancel,
        }
    }

    /// State used while no generation is active: deny everything undecided,
    /// never ask.
    pub fn inert() -> Self {
        let cancel = CancellationToken::new();
        cancel.cancel();
        Self {
            generation: 0,
            rules: HostRules::new(NetworkMode::AllowList, &[], &[]),
            ask: None,
            ask_timeout: Duration::from_millis(DEFAULT_ASK_TIMEOUT_MS),
            decisions: HostDecisionCache::new(),
            cancel,
        }
    }

    pub fn decisions(&self) -> &HostDecisionCache {
        &self.decisions
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A task a proxy token is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task_id: String,
    pub command: Option<String>,
}

/// Owns the live network snapshot and the proxy attribution tokens.
#[derive(Debug)]
pub struct NetworkEnforcer {
    state: ArcSwap<NetworkState>,
    tokens: Mutex<HashMap<String, TaskContext>>,
    violations: Arc<ViolationStore>,
}

impl NetworkEnforcer {
    pub fn new(violations: Arc<ViolationStore>) -> Self {
        Self {
            state: ArcSwap::from_pointee(NetworkState::inert()),
            tokens: Mutex::new(HashMap::new()),
            violations,
        }
    }

    /// Replace the live snapshot. The previous generation's pending asks are
    /// cancelled (they resolve as deny) and its decision cache is dropped.
    pub fn install(&self, state: NetworkState) {
        let generation = state.generation;
        let previous = self.state.swap(Arc::new(state));
        previous.cancel.cancel();
        if generation > 0 {
            info!(generation, "network policy installed");
        }
    }

    pub fn state(&self) -> Arc<NetworkState> {
        self.state.load_full()
    }

    pub fn violations(&self) -> &Arc<ViolationStore> {
        &self.violations
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<String, TaskContext>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a proxy credential that attributes traffic to `task_id`.
    pub fn register_task(&self, task_id: &str, command: Option<&str>) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.tokens().insert(
            token.clone(),
            TaskContext {
                task_id: task_id.to_string(),
                command: command.map(str::to_string),
            },
        );
        token
    }

    pub fn forget_token(&self, token: &str) {
        self.tokens().remove(token);
    }

    pub fn clear_tasks(&self) {
        self.tokens().clear();
    }

    pub fn lookup_token(&self, token: &str) -> Option<TaskContext> {
        self.tokens().get(token).cloned()
    }

    /// Decide one connection. Denials are recorded as network violations.
    pub async fn decide(&self, host: &str, port: u16, task: Option<&TaskContext>) -> Verdict {
        let state = self.state();
        let host = normalize_host(host);

        let verdict = match state.decisions.get(&host) {
            Some(decision) => decision.verdict,
            None => match state.rules.evaluate(&host) {
                RuleOutcome::Allow => {
                    state.decisions.remember(&host, Verdict::Allow);
                    Verdict::Allow
                }
                RuleOutcome::Deny => {
                    state.decisions.remember(&host, Verdict::Deny);
                    Verdict::Deny
                }
                RuleOutcome::Undecided => match &state.ask {
                    Some(ask) => {
                        let request = HostRequest {
                            host: host.clone(),
                            port,
                        };
                        state
                            .decisions
                            .resolve(request, ask, state.ask_timeout, &state.cancel)
                            .await
                    }
                    None => Verdict::Deny,
                },
            },
        };

        if verdict == Verdict::Deny {
            self.violations.record(ViolationEntry::new(
                ViolationKind::Network,
                host,
                task.map(|t| t.task_id.as_str()),
                task.and_then(|t| t.command.as_deref()),
            ));
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(mode: NetworkMode, allowed: &[&str], denied: &[&str]) -> NetworkPolicy {
        NetworkPolicy {
            mode,
            allowed_hosts: allowed.iter().map(|s| s.to_string()).collect(),
            denied_hosts: denied.iter().map(|s| s.to_string()).collect(),
            ask_timeout: Duration::from_secs(1),
            ask_callback: None,
        }
    }

    fn enforcer(policy: &NetworkPolicy) -> NetworkEnforcer {
        let enforcer = NetworkEnforcer::new(Arc::new(ViolationStore::default()));
        enforcer.install(NetworkState::new(1, policy, CancellationToken::new()));
        enforcer
    }

    #[tokio::test]
    async fn test_unlisted_host_denied_with_one_violation() {
        let enforcer = enforcer(&policy(NetworkMode::AllowList, &["example.com"], &[]));
        let token = enforcer.register_task("task-a", Some("curl https://other.com"));
        let task = enforcer.lookup_token(&token);

        assert_eq!(enforcer.decide("example.com", 443, task.as_ref()).await, Verdict::Allow);
        assert_eq!(enforcer.decide("other.com", 443, task.as_ref()).await, Verdict::Deny);

        let violations = enforcer.violations().list(None);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::Network);
        assert_eq!(violations[0].resource, "other.com");
        assert_eq!(violations[0].task_id.as_deref(), Some("task-a"));
    }

    #[tokio::test]
    async fn test_deny_list_mode() {
        let enforcer = enforcer(&policy(NetworkMode::DenyList, &[], &["*.evil.test"]));
        assert_eq!(enforcer.decide("crates.io", 443, None).await, Verdict::Allow);
        assert_eq!(enforcer.decide("c2.evil.test", 443, None).await, Verdict::Deny);
    }

    #[tokio::test]
    async fn test_ask_callback_decides_undecided_host_once() {
        let mut mock = MockAskCallback::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        mock.expect_ask().returning(move |req| {
            counter.fetch_add(1, Ordering::SeqCst);
            req.host == "pypi.org"
        });

        let mut policy = policy(NetworkMode::AllowList, &[], &[]);
        policy.ask_callback = Some(AskHandle::new(mock));
        let enforcer = enforcer(&policy);

        assert_eq!(enforcer.decide("pypi.org", 443, None).await, Verdict::Allow);
        assert_eq!(enforcer.decide("PyPI.org", 443, None).await, Verdict::Allow);
        assert_eq!(enforcer.decide("npmjs.org", 443, None).await, Verdict::Deny);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_install_resets_decisions() {
        let enforcer = enforcer(&policy(NetworkMode::AllowList, &[], &[]));
        assert_eq!(enforcer.decide("example.com", 80, None).await, Verdict::Deny);

        let old = enforcer.state();
        enforcer.install(NetworkState::new(
            2,
            &policy(NetworkMode::AllowList, &["example.com"], &[]),
            CancellationToken::new(),
        ));

        assert!(old.cancel_token().is_cancelled());
        assert_eq!(enforcer.state().generation, 2);
        assert_eq!(enforcer.decide("example.com", 80, None).await, Verdict::Allow);
    }

    #[test]
    fn test_tokens_are_unique_and_forgettable() {
        let enforcer = NetworkEnforcer::new(Arc::new(ViolationStore::default()));
        let a = enforcer.register_task("a", None);
        let b = enforcer.register_task("a", None);
        assert_ne!(a, b);

        enforcer.forget_token(&a);
        assert!(enforcer.lookup_token(&a).is_none());
        assert_eq!(enforcer.lookup_token(&b).unwrap().task_id, "a");

        enforcer.clear_tasks();
        assert!(enforcer.lookup_token(&b).is_none());
    }
}
