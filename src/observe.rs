//! Structured progress reporting for long-running operations.
//!
//! Components never print; they emit [`OperationEvent`]s to an injected
//! [`OperationObserver`] and return typed errors.  [`TracingObserver`] renders
//! events through `tracing`.

use std::time::Duration;

use crate::builder::StepKind;
use crate::error::ArmError;
use crate::lro::PollClass;

#[derive(Debug, Clone)]
pub enum OperationEvent {
    /// The provider accepted the request and handed out a poll location.
    Submitted { operation: String, location: String },
    /// A 202 arrived without any header to poll; treated as completed.
    Untracked { operation: String },
    Polled {
        operation: String,
        attempt: u32,
        state: Option<String>,
        class: PollClass,
    },
    PollFailed {
        operation: String,
        attempt: u32,
        error: ArmError,
    },
    Succeeded {
        operation: String,
        polls: u32,
        elapsed: Duration,
    },
    Failed { operation: String, error: ArmError },
    StepStarted { step: StepKind, name: String },
    StepFinished { step: StepKind, resource_id: String },
    /// The public IP request hit a quota code and is retried with another SKU.
    SkuFallback { name: String, code: String },
}

pub trait OperationObserver: Send + Sync {
    fn emit(&self, event: &OperationEvent);
}

/// Default observer: logs every event to stderr via `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl OperationObserver for TracingObserver {
    fn emit(&self, event: &OperationEvent) {
        match event {
            OperationEvent::Submitted {
                operation,
                location,
            } => tracing::info!(%operation, %location, "operation accepted; polling"),
            OperationEvent::Untracked { operation } => tracing::warn!(
                %operation,
                "202 Accepted without Azure-AsyncOperation or Location header; \
                 progress cannot be tracked"
            ),
            OperationEvent::Polled {
                operation,
                attempt,
                state,
                class,
            } => tracing::debug!(%operation, attempt, ?state, ?class, "poll"),
            OperationEvent::PollFailed {
                operation,
                attempt,
                error,
            } => tracing::warn!(%operation, attempt, %error, "poll attempt failed; will retry"),
            OperationEvent::Succeeded {
                operation,
                polls,
                elapsed,
            } => tracing::info!(
                %operation,
                polls,
                elapsed_ms = elapsed.as_millis() as u64,
                "operation succeeded"
            ),
            OperationEvent::Failed { operation, error } => {
                tracing::error!(%operation, kind = error.kind(), %error, "operation failed")
            }
            OperationEvent::StepStarted { step, name } => {
                tracing::info!(%step, %name, "creating")
            }
            OperationEvent::StepFinished { step, resource_id } => {
                tracing::info!(%step, %resource_id, "done")
            }
            OperationEvent::SkuFallback { name, code } => tracing::warn!(
                %name,
                %code,
                "public IP quota reached; retrying with Standard SKU"
            ),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Keeps every emitted event for later assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<OperationEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<OperationEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn poll_failures(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, OperationEvent::PollFailed { .. }))
                .count()
        }
    }

    impl OperationObserver for RecordingObserver {
        fn emit(&self, event: &OperationEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
