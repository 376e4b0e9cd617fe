//! Error types for the cluster and pooler controllers

use std::time::Duration;

use thiserror::Error;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ValidationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Resource version conflict: {0}")]
    Conflict(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Referenced cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl Error {
    /// Check if this error indicates a resource was not found
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(e) => matches!(e, kube::Error::Api(api_err) if api_err.code == 404),
            _ => false,
        }
    }

    /// Check if a create failed because the object is already there
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists(_) => true,
            Error::KubeError(e) => matches!(
                e,
                kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason == "AlreadyExists"
            ),
            _ => false,
        }
    }

    /// Check if an update lost an optimistic concurrency race
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::KubeError(e) => matches!(
                e,
                kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason != "AlreadyExists"
            ),
            _ => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            // Kubernetes API errors are often retryable
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                // Network and other errors are retryable
                _ => true,
            },
            Error::AlreadyExists(_) | Error::Conflict(_) | Error::NotFound(_) => true,
            // The cluster may be created later
            Error::ClusterNotFound(_) => true,
            Error::ValidationError(_) => false,
            Error::MissingObjectKey(_) => false,
        }
    }

    /// Short label used for metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::MissingObjectKey(_) => "missing_object_key",
            Error::AlreadyExists(_) => "already_exists",
            Error::Conflict(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::ClusterNotFound(_) => "cluster_not_found",
            Error::ValidationError(_) => "validation",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Qualitative retry signal returned by a reconciliation pass
///
/// The caller turns it into a concrete delay using [`crate::config::OperatorConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Not converged yet; evaluate again shortly
    Now,
    /// Waiting on something external (failed job, missing secret)
    AfterBackoff,
    /// Converged; rely on watch events
    Never,
}

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Non-retryable errors wait for manual intervention
            self.max_delay
        }
    }
}
