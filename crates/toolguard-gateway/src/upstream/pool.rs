//! Ordered set of upstreams plus the routing rule.
//!
//! A `tools/call` whose tool name is `"<upstream>.<tool>"` for a known
//! upstream goes to that upstream with the prefix stripped. Everything else
//! goes to the first configured upstream.

use super::connection::{ConnectionSettings, UpstreamConnection};
use super::{Upstream, UpstreamResult};
use crate::config::UpstreamSpec;
use serde_json::Value;
use std::sync::Arc;
use toolguard_core::Message;
use tracing::{error, info};

/// Where a client message should go, and the message to send there.
pub struct Route {
    pub upstream: Arc<dyn Upstream>,
    pub message: Message,
}

#[derive(Default)]
pub struct UpstreamPool {
    upstreams: Vec<Arc<dyn Upstream>>,
}

impl UpstreamPool {
    pub fn new(upstreams: Vec<Arc<dyn Upstream>>) -> Self {
        Self { upstreams }
    }

    /// One process-backed connection per spec, in order.
    pub fn from_specs(specs: &[UpstreamSpec], settings: ConnectionSettings) -> Self {
        Self::new(
            specs
                .iter()
                .map(|spec| Arc::new(UpstreamConnection::new(spec.clone(), settings)) as Arc<dyn Upstream>)
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Upstream>> {
        self.upstreams.iter().find(|u| u.name() == name)
    }

    /// Number of upstreams currently running.
    pub fn connected(&self) -> usize {
        self.upstreams.iter().filter(|u| u.is_running()).count()
    }

    /// Start every upstream in order. The first failure aborts startup.
    pub async fn start_all(&self) -> UpstreamResult<()> {
        for upstream in &self.upstreams {
            if let Err(e) = upstream.start().await {
                error!(upstream = %upstream.name(), error = %e, "failed to start upstream");
                return Err(e);
            }
            info!(upstream = %upstream.name(), "upstream started");
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        for upstream in &self.upstreams {
            upstream.stop().await;
        }
    }

    /// Pick the upstream for `message`. `None` when no upstream exists.
    pub fn route(&self, message: &Message) -> Option<Route> {
        if message.method() == "tools/call" {
            if let Some((prefix, tool)) = message.tool_name().and_then(|n| n.split_once('.')) {
                if !tool.is_empty() {
                    if let Some(upstream) = self.get(prefix) {
                        let mut rewritten = message.clone();
                        if let Some(Value::Object(params)) = rewritten.params.as_mut() {
                            params.insert("name".to_string(), Value::String(tool.to_string()));
                        }
                        return Some(Route {
                            upstream: upstream.clone(),
                            message: rewritten,
                        });
                    }
                }
            }
        }
        self.upstreams.first().map(|upstream| Route {
            upstream: upstream.clone(),
            message: message.clone(),
        })
    }
}
