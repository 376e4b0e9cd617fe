use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use kube::Client;
use kube::runtime::controller::Action;

use crate::config::OperatorConfig;
use crate::controller::error::{Error, Requeue};
use crate::controller::store::{KubeStore, ObjectKey, ObjectStore};
use crate::health::HealthState;

/// Consecutive backoff attempts per object
///
/// An object's count grows each time a pass fails or waits on something
/// external, and is cleared by the first pass that does neither.
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: Mutex<BTreeMap<(&'static str, ObjectKey), u32>>,
}

impl RetryTracker {
    /// Attempt number for this retry, starting at 0
    pub fn next_attempt(&self, kind: &'static str, key: &ObjectKey) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = attempts.entry((kind, key.clone())).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        attempt
    }

    pub fn reset(&self, kind: &'static str, key: &ObjectKey) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, key.clone()));
    }
}

/// Shared context for the controllers
///
/// The object store is injected rather than reached through a global client,
/// so reconciliation passes can run against an in-memory store.
#[derive(Clone)]
pub struct Context {
    /// Platform object store
    pub store: Arc<dyn ObjectStore>,
    /// Operator configuration
    pub config: OperatorConfig,
    /// Health state and metrics
    pub health_state: Arc<HealthState>,
    pub retries: Arc<RetryTracker>,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig, health_state: Arc<HealthState>) -> Self {
        Self::with_store(Arc::new(KubeStore::new(client)), config, health_state)
    }

    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        config: OperatorConfig,
        health_state: Arc<HealthState>,
    ) -> Self {
        Self {
            store,
            config,
            health_state,
            retries: Arc::new(RetryTracker::default()),
        }
    }

    /// Turn a qualitative requeue signal into a controller action
    pub fn action_for(&self, kind: &'static str, key: &ObjectKey, requeue: Requeue) -> Action {
        match requeue {
            Requeue::Now => {
                self.retries.reset(kind, key);
                Action::requeue(self.config.converging_requeue)
            }
            Requeue::AfterBackoff => {
                let attempt = self.retries.next_attempt(kind, key);
                Action::requeue(self.config.backoff.delay_for_attempt(attempt))
            }
            Requeue::Never => {
                self.retries.reset(kind, key);
                Action::await_change()
            }
        }
    }

    /// Delay before retrying a failed pass; grows with consecutive failures
    pub fn error_delay(
        &self,
        kind: &'static str,
        key: Option<&ObjectKey>,
        error: &Error,
    ) -> std::time::Duration {
        let attempt = key.map_or(0, |key| self.retries.next_attempt(kind, key));
        self.config.backoff.delay_for_error(error, attempt)
    }
}
