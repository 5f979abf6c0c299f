//! Per-generation host decision cache with ask-callback coalescing.
//!
//! Concurrent requests for the same undecided host share one in-flight
//! callback invocation. The shared wait is bounded by the generation's ask
//! timeout and aborted (as a deny) when the generation's token is cancelled.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ask::{AskHandle, HostRequest};

/// Final outcome for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
}

/// Where a cached decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Rule,
    Ask,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostDecision {
    pub verdict: Verdict,
    pub decided_at: DateTime<Utc>,
    pub source: DecisionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AskOutcome {
    Allowed,
    Denied,
    TimedOut,
    Cancelled,
}

impl AskOutcome {
    fn verdict(self) -> Verdict {
        match self {
            AskOutcome::Allowed => Verdict::Allow,
            _ => Verdict::Deny,
        }
    }

    fn cached(self) -> Option<HostDecision> {
        let source = match self {
            AskOutcome::Allowed | AskOutcome::Denied => DecisionSource::Ask,
            AskOutcome::TimedOut => DecisionSource::Timeout,
            AskOutcome::Cancelled => return None,
        };
        Some(HostDecision {
            verdict: self.verdict(),
            decided_at: Utc::now(),
            source,
        })
    }
}

type PendingAsk = Shared<BoxFuture<'static, AskOutcome>>;

enum Slot {
    Decided(HostDecision),
    Pending(PendingAsk),
}

#[derive(Default)]
pub struct HostDecisionCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl fmt::Debug for HostDecisionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDecisionCache")
            .field("hosts", &self.lock().len())
            .finish()
    }
}

impl HostDecisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, host: &str) -> Option<HostDecision> {
        match self.lock().get(host) {
            Some(Slot::Decided(decision)) => Some(decision.clone()),
            _ => None,
        }
    }

    /// Record a rule-derived decision unless the host is already known.
    pub fn remember(&self, host: &str, verdict: Verdict) {
        self.lock()
            .entry(host.to_string())
            .or_insert_with(|| {
                Slot::Decided(HostDecision {
                    verdict,
                    decided_at: Utc::now(),
                    source: DecisionSource::Rule,
                })
            });
    }

    /// All settled decisions, sorted by host.
    pub fn decided(&self) -> Vec<(String, HostDecision)> {
        let mut out: Vec<(String, HostDecision)> = self
            .lock()
            .iter()
            .filter_map(|(host, slot)| match slot {
                Slot::Decided(d) => Some((host.clone(), d.clone())),
                Slot::Pending(_) => None,
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Decide an undecided host through the ask-callback.
    ///
    /// The first caller for a host starts the callback; later callers join
    /// the same wait. Always resolves: timeout and cancellation both deny.
    pub async fn resolve(
        &self,
        request: HostRequest,
        ask: &AskHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Verdict {
        let host = request.host.clone();

        let pending = {
            let mut slots = self.lock();
            match slots.get(&host) {
                Some(Slot::Decided(decision)) => return decision.verdict,
                Some(Slot::Pending(pending)) => pending.clone(),
                None => {
                    debug!(host = %host, "asking for network decision");
                    let pending = ask_once(ask.clone(), request, timeout, cancel.clone())
                        .boxed()
                        .shared();
                    slots.insert(host.clone(), Slot::Pending(pending.clone()));
                    pending
                }
            }
        };

        let outcome = pending.await;

        {
            let mut slots = self.lock();
            if matches!(slots.get(&host), Some(Slot::Pending(_))) {
                match outcome.cached() {
                    Some(decision) => {
                        slots.insert(host.clone(), Slot::Decided(decision));
                    }
                    None => {
                        slots.remove(&host);
                    }
                }
            }
        }

        outcome.verdict()
    }
}

async fn ask_once(
    ask: AskHandle,
    request: HostRequest,
    timeout: Duration,
    cancel: CancellationToken,
) -> AskOutcome {
    tokio::select! {
        _ = cancel.cancelled() => AskOutcome::Cancelled,
        answer = tokio::time::timeout(timeout, ask.ask(request)) => match answer {
            Ok(true) => AskOutcome::Allowed,
            Ok(false) => AskOutcome::Denied,
            Err(_) => AskOutcome::TimedOut,
        },
    }
}
