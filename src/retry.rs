use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use rand::RngExt;

use crate::error::{FailureEnvelope, FailureKind, TransportErrorKind};

/// Everything the retry engine knows about one failed attempt.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    /// Zero-based attempt that just failed.
    pub attempt: usize,
    pub max_attempts: usize,
    pub method: Method,
    pub uri: String,
    pub kind: FailureKind,
    pub status: Option<StatusCode>,
    pub transport_error_kind: Option<TransportErrorKind>,
}

impl RetryDecision {
    pub(crate) fn for_failure(
        attempt: usize,
        max_attempts: usize,
        method: &Method,
        uri: &str,
        failure: &FailureEnvelope,
    ) -> Self {
        Self {
            attempt,
            max_attempts,
            method: method.clone(),
            uri: uri.to_owned(),
            kind: failure.kind,
            status: failure.status,
            transport_error_kind: failure.transport_error_kind,
        }
    }
}

pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

impl<F> RetryClassifier for F
where
    F: Fn(&RetryDecision) -> bool + Send + Sync,
{
    fn should_retry(&self, decision: &RetryDecision) -> bool {
        self(decision)
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
    retryable_status_codes: BTreeSet<u16>,
    retry_application_failures: bool,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_backoff", &self.base_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field(
                "retry_application_failures",
                &self.retry_application_failures,
            )
            .field("retry_classifier", &self.retry_classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self::standard().max_attempts(1)
    }

    /// Three attempts, `1s * 2^n` backoff without jitter.
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_secs(30),
            jitter_ratio: 0.0,
            retryable_status_codes: default_retryable_status_codes(),
            retry_application_failures: true,
            retry_classifier: None,
        }
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    /// Whether interceptor-raised failures without a status code are
    /// retried. Enabled by default.
    pub fn retry_application_failures(mut self, retry: bool) -> Self {
        self.retry_application_failures = retry;
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub fn configured_max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn configured_base_backoff(&self) -> Duration {
        self.base_backoff
    }

    pub(crate) fn configured_max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub(crate) fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    /// Classification only; the attempt budget is checked by
    /// [`RetryPolicy::should_retry`].
    pub(crate) fn is_retryable(&self, decision: &RetryDecision) -> bool {
        if let Some(retry_classifier) = &self.retry_classifier {
            return retry_classifier.should_retry(decision);
        }
        match decision.kind {
            FailureKind::Timeout | FailureKind::Network => true,
            FailureKind::HttpStatus => decision
                .status
                .is_some_and(|status| self.is_retryable_status(status)),
            FailureKind::Application => match decision.status {
                Some(status) => self.is_retryable_status(status),
                None => self.retry_application_failures,
            },
            FailureKind::Config | FailureKind::Cancelled => false,
        }
    }

    pub(crate) fn should_retry(&self, decision: &RetryDecision) -> bool {
        if matches!(decision.kind, FailureKind::Config | FailureKind::Cancelled) {
            return false;
        }
        decision.attempt + 1 < decision.max_attempts && self.is_retryable(decision)
    }

    /// Delay between attempt `attempt` and `attempt + 1`: `base * 2^attempt`,
    /// capped at the configured maximum.
    pub(crate) fn backoff_for_retry(&self, attempt: usize) -> Duration {
        let capped_exponent = attempt.min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base_backoff.as_millis();
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let mut rng = rand::rng();
        let sampled_ms = rng.random_range(low..=high).min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [408_u16, 429, 500, 502, 503, 504].into_iter().collect()
}
