//! toolguard: a security-inspecting JSON-RPC gateway for stdio tool servers.
//!
//! The gateway sits between an agent (on stdin/stdout) and one or more
//! tool-provider processes. Every request is size-checked, rate-limited and
//! scanned before it is forwarded, and every response is scanned before it
//! is returned.

pub mod config;
pub mod error;
pub mod gateway;
pub mod policy;
pub mod rate_limit;
pub mod scanner;
pub mod stats;
pub mod upstream;

pub use config::{CliOverrides, ConfigError, GatewayConfig, UpstreamSpec};
pub use error::{GatewayError, GatewayResult};
pub use gateway::Gateway;
pub use policy::{OnThreat, Policy, PolicyResolver, PolicyStore, Severity, Verdict};
pub use rate_limit::RateLimiter;
pub use scanner::{PatternScanner, ScanError, ScanOutcome, ScanRule, Scanner};
pub use stats::{GatewayStats, StatsSnapshot, Terminal};
pub use upstream::{Upstream, UpstreamConnection, UpstreamError, UpstreamPool, UpstreamState};
