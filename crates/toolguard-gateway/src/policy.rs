//! Per-upstream security policy: what to do when a scan finds a threat.
//!
//! The policy layer is split into three pieces:
//!
//! - [`Policy`]: a plain configuration struct (cloneable, deserializable)
//!   holding the action, severity threshold and rate limit.
//! - [`PolicyStore`]: the lookup capability backing per-upstream overrides.
//!   Config loading provides one; tests can provide their own.
//! - [`PolicyResolver`]: resolves the effective policy for an upstream
//!   (override, else default) and turns scan outcomes into a [`Verdict`].

use crate::scanner::ScanOutcome;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Canonical ordinal severity scale used for threshold comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Severity::None),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Action taken when a scan reports a threat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnThreat {
    /// Record the threat and let the message through.
    Log,
    #[default]
    Block,
}

impl std::str::FromStr for OnThreat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "log" => Ok(OnThreat::Log),
            "block" => Ok(OnThreat::Block),
            other => Err(format!("unknown on_threat action: {other}")),
        }
    }
}

/// Effective policy for one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub on_threat: OnThreat,
    #[serde(default = "default_threshold")]
    pub severity_threshold: Severity,
    /// Requests per minute per client; `0` = unlimited.
    #[serde(default)]
    pub rate_limit_per_minute: u32,
}

fn default_threshold() -> Severity {
    Severity::High
}

/// Default policy: block threats of severity high or above, no rate limit.
impl Default for Policy {
    fn default() -> Self {
        Self {
            on_threat: OnThreat::Block,
            severity_threshold: default_threshold(),
            rate_limit_per_minute: 0,
        }
    }
}

/// Lookup of per-upstream policy overrides.
pub trait PolicyStore: Send + Sync {
    /// The override configured for `upstream`, if any.
    fn get(&self, upstream: &str) -> Option<Policy>;
}

impl PolicyStore for HashMap<String, Policy> {
    fn get(&self, upstream: &str) -> Option<Policy> {
        HashMap::get(self, upstream).copied()
    }
}

/// Outcome of applying a policy to a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block { severity: Severity, reason: String },
}

/// Per-message policy decision. Computed per scan, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub on_threat: OnThreat,
    pub severity_threshold: Severity,
    pub should_block: bool,
}

/// Whether `outcome` must be blocked under `policy`.
///
/// False when the scan found nothing or the policy only logs; otherwise
/// true iff the severity reaches the threshold.
pub fn should_block(outcome: &ScanOutcome, policy: &Policy) -> bool {
    if !outcome.has_threat {
        return false;
    }
    match policy.on_threat {
        OnThreat::Log => false,
        OnThreat::Block => outcome.severity >= policy.severity_threshold,
    }
}

/// Resolves the effective policy for an upstream.
#[derive(Clone)]
pub struct PolicyResolver {
    default: Policy,
    store: Arc<dyn PolicyStore>,
}

impl PolicyResolver {
    pub fn new(default: Policy, store: Arc<dyn PolicyStore>) -> Self {
        Self { default, store }
    }

    /// Resolver with no per-upstream overrides.
    pub fn with_default(default: Policy) -> Self {
        Self::new(default, Arc::new(HashMap::<String, Policy>::new()))
    }

    pub fn default_policy(&self) -> Policy {
        self.default
    }

    /// Upstream-specific policy if configured, else the default.
    pub fn resolve(&self, upstream: &str) -> Policy {
        self.store.get(upstream).unwrap_or(self.default)
    }

    pub fn decide(&self, outcome: &ScanOutcome, policy: &Policy) -> PolicyDecision {
        PolicyDecision {
            on_threat: policy.on_threat,
            severity_threshold: policy.severity_threshold,
            should_block: should_block(outcome, policy),
        }
    }

    pub fn verdict(&self, outcome: &ScanOutcome, policy: &Policy) -> Verdict {
        if self.decide(outcome, policy).should_block {
            Verdict::Block {
                severity: outcome.severity,
                reason: outcome
                    .reason
                    .clone()
                    .unwrap_or_else(|| "threat detected".to_string()),
            }
        } else {
            Verdict::Allow
        }
    }
}

impl fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyResolver")
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}
