// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault injection policy + runtime controller for collaborator backends

use crate::error::{FsError, FsResult};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::watch;

/// Backend operations that can be faulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    Resolve,
    Fetch,
    Read,
    List,
    Put,
    Publish,
    NameResolve,
}

/// What happens when a rule fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultAction {
    /// Fail the call with a backend I/O error.
    Fail,
    /// Block the call until the policy is replaced.
    Stall,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaultRule {
    pub op: FaultOp,
    #[serde(default = "default_action")]
    pub action: FaultAction,
    /// Number of leading invocations to let through first.
    #[serde(default)]
    pub start_after: u64,
    #[serde(default)]
    pub max_faults: Option<u64>,
}

fn default_action() -> FaultAction {
    FaultAction::Fail
}

impl FaultRule {
    pub fn fail(op: FaultOp) -> Self {
        Self {
            op,
            action: FaultAction::Fail,
            start_after: 0,
            max_faults: None,
        }
    }

    pub fn stall(op: FaultOp) -> Self {
        Self {
            action: FaultAction::Stall,
            ..Self::fail(op)
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn single(rule: FaultRule) -> Self {
        Self {
            enabled: true,
            rules: vec![rule],
        }
    }
}

#[derive(Clone, Debug, Default)]
struct RuleCounters {
    hits: u64,
    invocations: u64,
}

#[derive(Clone, Debug, Default)]
struct FaultState {
    policy: FaultPolicy,
    counters: Vec<RuleCounters>,
}

/// Runtime controller that tracks policy + hit counts.
pub struct FaultInjector {
    state: Mutex<FaultState>,
    generation: watch::Sender<u64>,
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultInjector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FaultState::default()),
            generation: watch::Sender::new(0),
        }
    }

    pub fn snapshot(&self) -> FaultPolicy {
        self.state.lock().unwrap().policy.clone()
    }

    /// Installs a policy and wakes every call stalled under the old one.
    pub fn set_policy(&self, policy: FaultPolicy) {
        {
            let mut guard = self.state.lock().unwrap();
            guard.counters = vec![RuleCounters::default(); policy.rules.len()];
            guard.policy = policy;
        }
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    pub fn clear(&self) {
        self.set_policy(FaultPolicy::default());
    }

    /// Records an invocation of `op` and returns the action of the first rule
    /// that fires.
    pub fn should_fault(&self, op: FaultOp) -> Option<FaultAction> {
        let mut guard = self.state.lock().unwrap();
        if !guard.policy.enabled {
            return None;
        }
        let rules_len = guard.policy.rules.len();
        if guard.counters.len() < rules_len {
            guard.counters.resize(rules_len, RuleCounters::default());
        }
        for idx in 0..rules_len {
            let rule = guard.policy.rules[idx].clone();
            if rule.op != op {
                continue;
            }
            let counters = &mut guard.counters[idx];
            counters.invocations = counters.invocations.saturating_add(1);
            if counters.invocations <= rule.start_after {
                continue;
            }
            if let Some(max) = rule.max_faults {
                if counters.hits >= max {
                    continue;
                }
            }
            counters.hits = counters.hits.saturating_add(1);
            return Some(rule.action);
        }
        None
    }

    /// Checkpoint called by backends before performing `op`.
    pub async fn gate(&self, op: FaultOp) -> FsResult<()> {
        loop {
            let mut changes = self.generation.subscribe();
            match self.should_fault(op) {
                None => return Ok(()),
                Some(FaultAction::Fail) => {
                    return Err(FsError::io(format!("injected {op:?} failure")));
                }
                Some(FaultAction::Stall) => {
                    tracing::debug!(?op, "stalling backend call");
                    if changes.changed().await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn parses_fault_policy_json() {
        let json = br#"{
            "enabled": true,
            "rules": [
                { "op": "read", "action": "stall" },
                { "op": "put", "max_faults": 2 }
            ]
        }"#;
        let policy = FaultPolicy::from_json_bytes(json).expect("policy");
        assert!(policy.enabled);
        assert_eq!(policy.rules[0].action, FaultAction::Stall);
        assert_eq!(policy.rules[1].action, FaultAction::Fail);
        assert_eq!(policy.rules[1].max_faults, Some(2));
    }

    #[test]
    fn injector_respects_start_and_max_hits() {
        let injector = FaultInjector::new();
        injector.set_policy(FaultPolicy::single(FaultRule {
            start_after: 1,
            max_faults: Some(2),
            ..FaultRule::fail(FaultOp::Fetch)
        }));

        assert!(injector.should_fault(FaultOp::Fetch).is_none());
        assert!(injector.should_fault(FaultOp::Read).is_none());
        assert_eq!(injector.should_fault(FaultOp::Fetch), Some(FaultAction::Fail));
        assert_eq!(injector.should_fault(FaultOp::Fetch), Some(FaultAction::Fail));
        assert!(injector.should_fault(FaultOp::Fetch).is_none());
    }

    #[tokio::test]
    async fn stalled_gate_resumes_when_policy_clears() {
        let injector = Arc::new(FaultInjector::new());
        injector.set_policy(FaultPolicy::single(FaultRule::stall(FaultOp::Read)));

        let waiter = {
            let injector = injector.clone();
            tokio::spawn(async move { injector.gate(FaultOp::Read).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        injector.clear();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("gate resumed")
            .expect("join");
        assert!(result.is_ok());
    }
}
