//! Transport diagnostics probe.
//!
//! Decides which transport to the durable store is currently viable:
//! DNS resolution, optional service-discovery lookup, then short round
//! trips on the binary and text transports. The whole probe runs under a
//! hard time budget; every step is capped by what is left of it, and a
//! step that times out counts as a failed step rather than an error.
//!
//! Decisions are cached with a TTL behind a read/write lock. Refreshes are
//! serialized by an async mutex so concurrent runs trigger one probe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{ProbeSettings, StoreSettings};
use crate::store::{SharedStore, TransportMode};

/// host/port pair to resolve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `host:port`
    pub fn parse_host_port(value: &str) -> Option<Self> {
        let (host, port) = value.trim().rsplit_once(':')?;
        let port = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.trim_matches(|c| c == '[' || c == ']').to_string(),
            port,
        })
    }

    /// Host and effective port of an http(s) URL
    pub fn from_url(value: &str) -> Option<Self> {
        let url = reqwest::Url::parse(value).ok()?;
        Some(Self {
            host: url.host_str()?.to_string(),
            port: url.port_or_known_default()?,
        })
    }
}

/// What the probe looks at
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub binary: Option<Endpoint>,
    /// Must resolve before the binary transport is tried
    pub discovery_host: Option<String>,
    pub text: Option<Endpoint>,
}

impl ProbeTarget {
    pub fn from_settings(store: &StoreSettings) -> Self {
        Self {
            binary: store
                .binary_endpoint
                .as_deref()
                .and_then(Endpoint::parse_host_port),
            discovery_host: store.discovery_host.clone(),
            text: store.text_endpoint.as_deref().and_then(Endpoint::from_url),
        }
    }
}

/// Individual connectivity checks, separated so they can be stubbed
#[async_trait]
pub trait ConnectivityChecks: Send + Sync {
    /// Resolve `host:port` to at least one address
    async fn resolve(&self, host: &str, port: u16) -> Result<(), String>;

    /// One round trip on the given transport
    async fn round_trip(&self, mode: TransportMode) -> Result<(), String>;
}

/// Checks against the real network
pub struct LiveChecks {
    binary: Option<SharedStore>,
    text: Option<SharedStore>,
}

impl LiveChecks {
    pub fn new(binary: Option<SharedStore>, text: Option<SharedStore>) -> Self {
        Self { binary, text }
    }
}

#[async_trait]
impl ConnectivityChecks for LiveChecks {
    async fn resolve(&self, host: &str, port: u16) -> Result<(), String> {
        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| e.to_string())?;
        match addrs.next() {
            Some(_) => Ok(()),
            None => Err(format!("{} resolved to no addresses", host)),
        }
    }

    async fn round_trip(&self, mode: TransportMode) -> Result<(), String> {
        let client = match mode {
            TransportMode::Binary => self.binary.as_ref(),
            TransportMode::Text => self.text.as_ref(),
            TransportMode::Degraded => None,
        };
        match client {
            Some(client) => client.ping().await.map_err(|e| e.to_string()),
            None => Err(format!("no {} client configured", mode)),
        }
    }
}

/// Probe steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeCheck {
    BinaryDns,
    TextDns,
    Discovery,
    BinaryRoundTrip,
    TextRoundTrip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Passed { latency_ms: u64 },
    Failed { reason: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeStep {
    pub check: ProbeCheck,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// Structured explanation of a decision
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub steps: Vec<ProbeStep>,
    pub reason: String,
    pub elapsed_ms: u64,
}

impl ProbeReport {
    fn push(&mut self, check: ProbeCheck, outcome: StepOutcome) {
        self.steps.push(ProbeStep { check, outcome });
    }

    pub fn outcome(&self, check: ProbeCheck) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|s| s.check == check)
            .map(|s| &s.outcome)
    }
}

/// Outcome of a probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportDecision {
    pub mode: TransportMode,
    pub measured_latency: Option<Duration>,
    pub decided_at: DateTime<Utc>,
    pub ttl: Duration,
    pub report: ProbeReport,
}

struct CachedDecision {
    decision: TransportDecision,
    expires_at: Instant,
    consecutive_failures: u32,
    invalidated: bool,
}

/// Cached transport selection shared by every run
pub struct TransportProbe {
    target: ProbeTarget,
    settings: ProbeSettings,
    checks: Arc<dyn ConnectivityChecks>,
    cache: RwLock<Option<CachedDecision>>,
    refresh: Mutex<()>,
}

impl TransportProbe {
    pub fn new(
        target: ProbeTarget,
        settings: ProbeSettings,
        checks: Arc<dyn ConnectivityChecks>,
    ) -> Self {
        Self {
            target,
            settings,
            checks,
            cache: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    pub fn target(&self) -> &ProbeTarget {
        &self.target
    }

    /// Current decision, probing only when the cached one is stale
    pub async fn decide_transport(&self) -> TransportDecision {
        if let Some(decision) = self.fresh_decision() {
            return decision;
        }

        let _guard = self.refresh.lock().await;
        // Another task may have refreshed while we waited
        if let Some(decision) = self.fresh_decision() {
            return decision;
        }

        let decision = self.probe_now().await;
        let ttl = decision.ttl;
        *self.cache.write() = Some(CachedDecision {
            decision: decision.clone(),
            expires_at: Instant::now() + ttl,
            consecutive_failures: 0,
            invalidated: false,
        });
        decision
    }

    /// Cached decision regardless of freshness
    pub fn cached(&self) -> Option<TransportDecision> {
        self.cache.read().as_ref().map(|c| c.decision.clone())
    }

    /// Count a failed call on `mode`; enough in a row trigger a re-probe
    pub fn record_failure(&self, mode: TransportMode) {
        let mut guard = self.cache.write();
        let Some(cached) = guard.as_mut() else {
            return;
        };
        if cached.decision.mode != mode {
            return;
        }

        cached.consecutive_failures += 1;
        if cached.consecutive_failures >= self.settings.failure_threshold && !cached.invalidated {
            warn!(
                transport = %mode,
                failures = cached.consecutive_failures,
                "transport failing repeatedly, scheduling re-probe"
            );
            cached.invalidated = true;
        }
    }

    pub fn record_success(&self, mode: TransportMode) {
        if let Some(cached) = self.cache.write().as_mut() {
            if cached.decision.mode == mode {
                cached.consecutive_failures = 0;
            }
        }
    }

    fn fresh_decision(&self) -> Option<TransportDecision> {
        let guard = self.cache.read();
        let cached = guard.as_ref()?;
        if cached.invalidated || Instant::now() >= cached.expires_at {
            return None;
        }
        Some(cached.decision.clone())
    }

    /// Run every check now, bypassing the cache
    pub async fn probe_now(&self) -> TransportDecision {
        let started = Instant::now();
        let deadline = started + self.settings.budget();
        let mut report = ProbeReport::default();

        let (mode, latency) = self.run_checks(deadline, &mut report).await;
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        let ttl = match mode {
            TransportMode::Degraded => self.settings.degraded_ttl(),
            _ => self.settings.ttl(),
        };

        info!(
            transport = %mode,
            latency_ms = latency.map(|l| l.as_millis() as u64),
            elapsed_ms = report.elapsed_ms,
            reason = %report.reason,
            steps = ?report.steps,
            "transport decision"
        );

        TransportDecision {
            mode,
            measured_latency: latency,
            decided_at: Utc::now(),
            ttl,
            report,
        }
    }

    async fn run_checks(
        &self,
        deadline: Instant,
        report: &mut ProbeReport,
    ) -> (TransportMode, Option<Duration>) {
        if self.target.binary.is_none() && self.target.text.is_none() {
            report.reason = "no store endpoints configured".to_string();
            return (TransportMode::Degraded, None);
        }

        let dns_timeout = self.settings.dns_timeout();

        let mut binary_viable = match &self.target.binary {
            Some(endpoint) => {
                let outcome = self
                    .bounded(deadline, dns_timeout, self.checks.resolve(&endpoint.host, endpoint.port))
                    .await;
                let ok = matches!(outcome, StepOutcome::Passed { .. });
                report.push(ProbeCheck::BinaryDns, outcome);
                ok
            }
            None => false,
        };

        let text_viable = match &self.target.text {
            Some(endpoint) => {
                let outcome = self
                    .bounded(deadline, dns_timeout, self.checks.resolve(&endpoint.host, endpoint.port))
                    .await;
                let ok = matches!(outcome, StepOutcome::Passed { .. });
                report.push(ProbeCheck::TextDns, outcome);
                ok
            }
            None => false,
        };

        if binary_viable {
            if let (Some(discovery), Some(binary)) = (&self.target.discovery_host, &self.target.binary) {
                let outcome = self
                    .bounded(deadline, dns_timeout, self.checks.resolve(discovery, binary.port))
                    .await;
                binary_viable = matches!(outcome, StepOutcome::Passed { .. });
                report.push(ProbeCheck::Discovery, outcome);
            }
        }

        let round_trip_timeout = self.settings.round_trip_timeout();

        if binary_viable {
            let outcome = self
                .bounded(
                    deadline,
                    round_trip_timeout,
                    self.checks.round_trip(TransportMode::Binary),
                )
                .await;
            let outcome = over_threshold(outcome, self.settings.binary_threshold());
            let latency = passed_latency(&outcome);
            report.push(ProbeCheck::BinaryRoundTrip, outcome);

            if let Some(latency) = latency {
                if self.target.text.is_some() {
                    report.push(
                        ProbeCheck::TextRoundTrip,
                        StepOutcome::Skipped {
                            reason: "binary transport selected".to_string(),
                        },
                    );
                }
                report.reason = format!(
                    "binary round trip {}ms under {}ms threshold",
                    latency.as_millis(),
                    self.settings.binary_threshold_ms
                );
                return (TransportMode::Binary, Some(latency));
            }
        } else if self.target.binary.is_some() {
            report.push(
                ProbeCheck::BinaryRoundTrip,
                StepOutcome::Skipped {
                    reason: "binary endpoint did not resolve".to_string(),
                },
            );
        }

        if text_viable {
            let outcome = self
                .bounded(
                    deadline,
                    round_trip_timeout,
                    self.checks.round_trip(TransportMode::Text),
                )
                .await;
            let outcome = over_threshold(outcome, self.settings.text_threshold());
            let latency = passed_latency(&outcome);
            report.push(ProbeCheck::TextRoundTrip, outcome);

            if let Some(latency) = latency {
                report.reason = format!(
                    "text round trip {}ms under {}ms threshold",
                    latency.as_millis(),
                    self.settings.text_threshold_ms
                );
                return (TransportMode::Text, Some(latency));
            }
        } else if self.target.text.is_some() {
            report.push(
                ProbeCheck::TextRoundTrip,
                StepOutcome::Skipped {
                    reason: "text endpoint did not resolve".to_string(),
                },
            );
        }

        report.reason = "no transport passed its round trip; using in-memory state".to_string();
        (TransportMode::Degraded, None)
    }

    /// Run one check under `min(step_timeout, time left in budget)`
    async fn bounded<F>(&self, deadline: Instant, step_timeout: Duration, check: F) -> StepOutcome
    where
        F: std::future::Future<Output = Result<(), String>>,
    {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return StepOutcome::Skipped {
                reason: "probe budget exhausted".to_string(),
            };
        }

        let limit = step_timeout.min(remaining);
        let started = Instant::now();
        match timeout(limit, check).await {
            Ok(Ok(())) => StepOutcome::Passed {
                latency_ms: started.elapsed().as_millis() as u64,
            },
            Ok(Err(reason)) => {
                debug!(%reason, "probe step failed");
                StepOutcome::Failed { reason }
            }
            Err(_) => StepOutcome::Failed {
                reason: format!("timed out after {}ms", limit.as_millis()),
            },
        }
    }
}

fn over_threshold(outcome: StepOutcome, threshold: Duration) -> StepOutcome {
    match outcome {
        StepOutcome::Passed { latency_ms } if latency_ms >= threshold.as_millis() as u64 => {
            StepOutcome::Failed {
                reason: format!(
                    "round trip {}ms not under {}ms threshold",
                    latency_ms,
                    threshold.as_millis()
                ),
            }
        }
        other => other,
    }
}

fn passed_latency(outcome: &StepOutcome) -> Option<Duration> {
    match outcome {
        StepOutcome::Passed { latency_ms } => Some(Duration::from_millis(*latency_ms)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            Endpoint::parse_host_port("store.internal:7400"),
            Some(Endpoint {
                host: "store.internal".to_string(),
                port: 7400
            })
        );
        assert_eq!(
            Endpoint::parse_host_port("[::1]:7400").map(|e| e.host),
            Some("::1".to_string())
        );
        assert!(Endpoint::parse_host_port("no-port").is_none());
        assert!(Endpoint::parse_host_port(":7400").is_none());

        assert_eq!(
            Endpoint::from_url("https://store.internal/api"),
            Some(Endpoint {
                host: "store.internal".to_string(),
                port: 443
            })
        );
    }

    #[test]
    fn test_target_from_settings() {
        let store = StoreSettings {
            binary_endpoint: Some("10.0.0.5:7400".to_string()),
            text_endpoint: Some("http://10.0.0.5:8080".to_string()),
            ..Default::default()
        };

        let target = ProbeTarget::from_settings(&store);
        assert_eq!(target.binary.unwrap().port, 7400);
        assert_eq!(target.text.unwrap().port, 8080);
        assert!(target.discovery_host.is_none());
    }

    #[test]
    fn test_threshold_turns_slow_pass_into_failure() {
        let slow = over_threshold(
            StepOutcome::Passed { latency_ms: 300 },
            Duration::from_millis(250),
        );
        assert!(matches!(slow, StepOutcome::Failed { .. }));

        let fast = over_threshold(
            StepOutcome::Passed { latency_ms: 20 },
            Duration::from_millis(250),
        );
        assert_eq!(passed_latency(&fast), Some(Duration::from_millis(20)));
    }
}
