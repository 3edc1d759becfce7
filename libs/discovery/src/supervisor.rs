//! Reconnect supervision for the registrar and resolver loops.
//!
//! [`ReconnectSupervisor::retry`] keeps calling an async operation until it succeeds or
//! the owning component is closed. Between failures it sleeps with exponential backoff:
//!
//! ```text
//! delay(n) = clamp(initial_backoff * 2^(n-1), min_interval, max_backoff)
//! ```
//!
//! Independently of the backoff, two attempts made through the same supervisor are
//! never closer than `min_interval`, even across separate `retry` calls. A watch that
//! dies right after every successful reconnect therefore cannot spin.
//!
//! Cancellation is observed both while an attempt is in flight and while sleeping.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::ReconnectPolicy;
use crate::error::DiscoveryError;

fn duration_to_u64_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Shared retry/backoff discipline, owned by exactly one background loop.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    component: &'static str,
    last_attempt: Option<Instant>,
}

impl ReconnectSupervisor {
    #[must_use]
    pub fn new(component: &'static str, policy: ReconnectPolicy, cancel: CancellationToken) -> Self {
        Self {
            policy,
            cancel,
            component,
            last_attempt: None,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let backoff = self
            .policy
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(exp));
        backoff
            .min(self.policy.max_backoff)
            .max(self.policy.min_interval)
    }

    /// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
    pub async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Wait until at least `min_interval` has passed since the previous attempt.
    async fn respect_floor(&mut self) -> bool {
        if let Some(last) = self.last_attempt {
            let next = last + self.policy.min_interval;
            let now = Instant::now();
            if next > now && !self.sleep(next - now).await {
                return false;
            }
        }
        self.last_attempt = Some(Instant::now());
        true
    }

    /// Run `op` until it succeeds. Returns `None` if the supervisor was cancelled first.
    pub async fn retry<T, F, Fut>(&mut self, op_name: &'static str, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DiscoveryError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            if !self.respect_floor().await {
                return None;
            }
            attempt = attempt.saturating_add(1);

            let span = tracing::debug_span!(
                "reconnect",
                component = self.component,
                op = op_name,
                attempt
            );

            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                res = op().instrument(span) => res,
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            component = self.component,
                            op = op_name,
                            attempt,
                            "reconnected after retries"
                        );
                    }
                    return Some(value);
                }
                Err(e) => {
                    let backoff = self.backoff_for(attempt);
                    tracing::warn!(
                        component = self.component,
                        op = op_name,
                        attempt,
                        error = %e,
                        backoff_ms = duration_to_u64_ms(backoff),
                        "reconnect attempt failed"
                    );
                    if !self.sleep(backoff).await {
                        return None;
                    }
                }
            }
        }
    }
}
