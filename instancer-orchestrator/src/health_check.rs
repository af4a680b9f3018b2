// ============================================================================
// HEALTH CHECK: probe + backoff until SERVING or deadline
// ============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{Duration, Instant};

/// Serving status an instance reports once it can take traffic.
pub const SERVING: &str = "SERVING";

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok(())` when the instance reports SERVING, otherwise a short reason.
    async fn check(&self, hostname: &str) -> Result<(), String>;
}

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
}

/// `GET http://{hostname}:{port}/healthz`, expecting `{"status": "SERVING"}`.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    port: u16,
}

impl HttpHealthProbe {
    pub fn new(port: u16) -> anyhow::Result<Self> {
        // Short timeouts: a hung probe must not eat the creation deadline.
        let client = reqwest::Client::builder()
            .connect_timeout(StdDuration::from_secs(2))
            .timeout(StdDuration::from_secs(3))
            .build()?;
        Ok(Self { client, port })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, hostname: &str) -> Result<(), String> {
        let url = format!("http://{}:{}/healthz", hostname, self.port);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("request_error: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("status={}", resp.status()));
        }
        let body: HealthResponse = resp
            .json()
            .await
            .map_err(|e| format!("json_error: {e}"))?;
        if body.status == SERVING {
            Ok(())
        } else {
            Err(format!("serving_status={}", body.status))
        }
    }
}

/// Exponential backoff: doubles on every step, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    /// Delay to wait now; the following one is doubled.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

/// Probes `hostname` with backoff until it reports SERVING (`true`) or
/// `deadline` passes (`false`).
pub async fn wait_until_serving(
    probe: &dyn HealthProbe,
    hostname: &str,
    mut backoff: Backoff,
    deadline: Instant,
) -> bool {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = tokio::time::timeout_at(deadline, probe.check(hostname)).await;
        match outcome {
            Ok(Ok(())) => {
                tracing::debug!(hostname, attempt, "health check passed");
                return true;
            }
            Ok(Err(reason)) => {
                tracing::debug!(hostname, attempt, reason = %reason, "health check not serving yet");
            }
            Err(_) => return false,
        }

        let wake = Instant::now() + backoff.next_delay();
        if wake >= deadline {
            tokio::time::sleep_until(deadline).await;
            return false;
        }
        tokio::time::sleep_until(wake).await;
    }
}

/// Probe with a per-host script, for tests and dev runs.
/// A host reports SERVING once it has been probed more than `failures_before_serving` times.
#[derive(Default)]
pub struct ScriptedProbe {
    failures_before_serving: Mutex<HashMap<String, usize>>,
    default_failures: Mutex<Option<usize>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl ScriptedProbe {
    /// Every host is SERVING on the first probe.
    pub fn always_serving() -> Self {
        let probe = Self::default();
        probe.set_default(Some(0));
        probe
    }

    /// No host ever reports SERVING.
    pub fn never_serving() -> Self {
        Self::default()
    }

    /// `None` means hosts without an explicit script never become SERVING.
    pub fn set_default(&self, failures: Option<usize>) {
        *self.default_failures.lock().unwrap_or_else(|p| p.into_inner()) = failures;
    }

    pub fn script(&self, hostname: &str, failures_before_serving: usize) {
        self.failures_before_serving
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(hostname.to_string(), failures_before_serving);
    }

    pub fn calls(&self, hostname: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(hostname)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, hostname: &str) -> Result<(), String> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let seen = {
            let mut calls = self.calls.lock().unwrap_or_else(|p| p.into_inner());
            let n = calls.entry(hostname.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let scripted = self
            .failures_before_serving
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(hostname)
            .copied();
        let failures = scripted.or(*self.default_failures.lock().unwrap_or_else(|p| p.into_inner()));
        match failures {
            Some(f) if seen > f => Ok(()),
            _ => Err("serving_status=NOT_SERVING".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[tokio::test]
    async fn succeeds_after_scripted_failures() {
        let probe = ScriptedProbe::never_serving();
        probe.script("h", 3);
        let deadline = Instant::now() + Duration::from_secs(5);
        let backoff = Backoff::new(Duration::from_millis(5), Duration::from_millis(50));
        assert!(wait_until_serving(&probe, "h", backoff, deadline).await);
        assert_eq!(probe.calls("h"), 4);
    }

    #[tokio::test]
    async fn gives_up_at_deadline() {
        let probe = ScriptedProbe::never_serving();
        let deadline = Instant::now() + Duration::from_millis(150);
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(30));
        assert!(!wait_until_serving(&probe, "h", backoff, deadline).await);
        assert!(probe.calls("h") >= 2);
        assert!(Instant::now() >= deadline);
    }
}
