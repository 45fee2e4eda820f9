//! Long-running-operation driver.
//!
//! `Submitted -> Polling -> {Succeeded | Failed | TimedOut}`.  A `Completed`
//! outcome short-circuits to `Succeeded`; an `Accepted` one is polled until a
//! terminal label shows up or the wall-clock timeout passes.  Failed poll
//! attempts are reported and retried; only the timeout ends the loop early.

use std::sync::Arc;
use std::time::Duration;

use azure_core::credentials::Secret;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{diagnostic_body, ArmError, ArmResult};
use crate::executor::{Executor, OperationOutcome, PollLocation, PollSource};
use crate::observe::{OperationEvent, OperationObserver};

/// Where a status label may live in a poll body, highest priority first.
pub const STATUS_RULES: &[&str] = &["/status", "/properties/status", "/properties/provisioningState"];

/// First string found under any of `rules`, in order.
pub fn extract_label(body: &Value, rules: &[&str]) -> Option<String> {
    rules
        .iter()
        .find_map(|ptr| body.pointer(ptr).and_then(Value::as_str))
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollClass {
    Succeeded,
    Failed,
    Pending,
}

/// Case-insensitive label -> class table.  Unlisted labels are `Pending`.
#[derive(Debug, Clone)]
pub struct TerminalTable {
    entries: Vec<(String, PollClass)>,
}

impl Default for TerminalTable {
    fn default() -> Self {
        Self {
            entries: vec![
                ("succeeded".into(), PollClass::Succeeded),
                ("failed".into(), PollClass::Failed),
            ],
        }
    }
}

impl TerminalTable {
    /// ARM deployments also settle in `Canceled`.
    pub fn deployment() -> Self {
        Self::default().with("canceled", PollClass::Failed)
    }

    pub fn with(mut self, label: &str, class: PollClass) -> Self {
        self.entries.push((label.to_ascii_lowercase(), class));
        self
    }

    pub fn classify(&self, label: Option<&str>) -> PollClass {
        label
            .and_then(|l| {
                self.entries
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(l))
                    .map(|(_, c)| *c)
            })
            .unwrap_or(PollClass::Pending)
    }
}

/// One observation of a poll location.
#[derive(Debug, Clone)]
pub struct PollState {
    pub http_status: u16,
    pub label: Option<String>,
    pub body: Value,
}

impl PollState {
    pub fn from_body(http_status: u16, body: Value) -> Self {
        Self {
            http_status,
            label: extract_label(&body, STATUS_RULES),
            body,
        }
    }

    pub fn classify(&self, table: &TerminalTable, source: PollSource) -> PollClass {
        if self.http_status == 202 && self.label.is_none() {
            return PollClass::Pending;
        }
        // A `Location` endpoint that stops answering 202 is done even when the
        // final body carries no status field.
        if source == PollSource::Location && self.label.is_none() {
            return PollClass::Succeeded;
        }
        table.classify(self.label.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSettings {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Terminal success of a driven operation.
#[derive(Debug, Clone)]
pub struct LroCompletion {
    /// Body of the synchronous response or of the final poll.
    pub body: Option<Value>,
    pub polls: u32,
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct LroDriver {
    executor: Executor,
    observer: Arc<dyn OperationObserver>,
    table: TerminalTable,
}

impl LroDriver {
    pub fn new(executor: Executor, observer: Arc<dyn OperationObserver>) -> Self {
        Self {
            executor,
            observer,
            table: TerminalTable::default(),
        }
    }

    pub fn with_table(mut self, table: TerminalTable) -> Self {
        self.table = table;
        self
    }

    /// Drive an executor outcome to a terminal state.
    pub async fn drive(
        &self,
        operation: &str,
        outcome: OperationOutcome,
        token: &Secret,
        settings: PollSettings,
    ) -> ArmResult<LroCompletion> {
        match outcome {
            OperationOutcome::Completed(body) => {
                if body.is_none() {
                    // 202 without poll headers lands here too; nothing to track.
                    tracing::debug!(%operation, "completed synchronously without a body");
                }
                Ok(LroCompletion {
                    body,
                    polls: 0,
                    elapsed: Duration::ZERO,
                })
            }
            OperationOutcome::Failed { status, body } => {
                let error = ArmError::Request { status, body };
                self.observer.emit(&OperationEvent::Failed {
                    operation: operation.to_string(),
                    error: error.clone(),
                });
                Err(error)
            }
            OperationOutcome::Accepted(location) => {
                self.observer.emit(&OperationEvent::Submitted {
                    operation: operation.to_string(),
                    location: location.url.clone(),
                });
                self.poll_until_terminal(operation, &location, token, settings)
                    .await
            }
        }
    }

    /// Poll `location` until it reports a terminal state or `settings.timeout`
    /// passes.  No attempt cap besides the clock.
    pub async fn poll_until_terminal(
        &self,
        operation: &str,
        location: &PollLocation,
        token: &Secret,
        settings: PollSettings,
    ) -> ArmResult<LroCompletion> {
        let started = Instant::now();
        let deadline = started + settings.timeout;
        let mut polls: u32 = 0;
        let mut last_state: Option<String> = None;

        loop {
            if Instant::now() >= deadline {
                return Err(self.timed_out(operation, started, polls, last_state));
            }

            polls += 1;
            // A hung poll must not carry the loop past the deadline.
            let attempt =
                match tokio::time::timeout_at(deadline, self.poll_once(&location.url, token)).await {
                    Ok(attempt) => attempt,
                    Err(_) => return Err(self.timed_out(operation, started, polls, last_state)),
                };
            match attempt {
                Ok(state) => {
                    let class = state.classify(&self.table, location.source);
                    self.observer.emit(&OperationEvent::Polled {
                        operation: operation.to_string(),
                        attempt: polls,
                        state: state.label.clone(),
                        class,
                    });
                    match class {
                        PollClass::Succeeded => {
                            let elapsed = started.elapsed();
                            self.observer.emit(&OperationEvent::Succeeded {
                                operation: operation.to_string(),
                                polls,
                                elapsed,
                            });
                            return Ok(LroCompletion {
                                body: Some(state.body).filter(|b| !b.is_null()),
                                polls,
                                elapsed,
                            });
                        }
                        PollClass::Failed => {
                            let error = ArmError::OperationFailed { body: state.body };
                            self.observer.emit(&OperationEvent::Failed {
                                operation: operation.to_string(),
                                error: error.clone(),
                            });
                            return Err(error);
                        }
                        PollClass::Pending => last_state = state.label,
                    }
                }
                Err(error) => self.observer.emit(&OperationEvent::PollFailed {
                    operation: operation.to_string(),
                    attempt: polls,
                    error,
                }),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(settings.interval.min(remaining)).await;
        }
    }

    fn timed_out(
        &self,
        operation: &str,
        started: Instant,
        polls: u32,
        last_state: Option<String>,
    ) -> ArmError {
        let error = ArmError::OperationTimedOut {
            elapsed: started.elapsed(),
            polls,
            last_state,
        };
        self.observer.emit(&OperationEvent::Failed {
            operation: operation.to_string(),
            error: error.clone(),
        });
        error
    }

    /// One GET of the poll location.  Any failure is a `PollTransient`.
    async fn poll_once(&self, url: &str, token: &Secret) -> ArmResult<PollState> {
        let resp = self
            .executor
            .fetch(url, token)
            .await
            .map_err(|e| ArmError::PollTransient(e.to_string()))?;

        if !(200..300).contains(&resp.status) {
            return Err(ArmError::PollTransient(format!(
                "HTTP {}: {}",
                resp.status,
                diagnostic_body(&resp.body)
            )));
        }

        let body = if resp.body.is_empty() {
            Value::Null
        } else {
            resp.json().ok_or_else(|| {
                ArmError::PollTransient(format!("undecodable status body: {}", resp.text()))
            })?
        };

        Ok(PollState::from_body(resp.status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{response, ScriptedTransport};
    use crate::http::{HttpRequest, HttpResponse, HttpTransport, TransportError};
    use crate::observe::testing::RecordingObserver;
    use reqwest::Method;
    use serde_json::json;

    fn token() -> Secret {
        Secret::from("tok".to_string())
    }

    fn async_op(url: &str) -> OperationOutcome {
        OperationOutcome::Accepted(PollLocation {
            url: url.into(),
            source: PollSource::AsyncOperation,
        })
    }

    fn driver(transport: Arc<ScriptedTransport>, observer: Arc<RecordingObserver>) -> LroDriver {
        LroDriver::new(Executor::new(transport), observer)
    }

    fn settings(interval: u64, timeout: u64) -> PollSettings {
        PollSettings::new(Duration::from_secs(interval), Duration::from_secs(timeout))
    }

    #[test]
    fn label_extraction_follows_rule_priority() {
        let body = json!({
            "status": "InProgress",
            "properties": {"status": "Failed", "provisioningState": "Succeeded"}
        });
        assert_eq!(extract_label(&body, STATUS_RULES).as_deref(), Some("InProgress"));

        let body = json!({"properties": {"status": "Deleting", "provisioningState": "Succeeded"}});
        assert_eq!(extract_label(&body, STATUS_RULES).as_deref(), Some("Deleting"));

        let body = json!({"properties": {"provisioningState": "Succeeded"}});
        assert_eq!(extract_label(&body, STATUS_RULES).as_deref(), Some("Succeeded"));

        assert_eq!(extract_label(&json!({"name": "x"}), STATUS_RULES), None);
    }

    #[test]
    fn terminal_table_is_case_insensitive_and_defaults_to_pending() {
        let t = TerminalTable::default();
        assert_eq!(t.classify(Some("Succeeded")), PollClass::Succeeded);
        assert_eq!(t.classify(Some("SUCCEEDED")), PollClass::Succeeded);
        assert_eq!(t.classify(Some("failed")), PollClass::Failed);
        assert_eq!(t.classify(Some("Canceled")), PollClass::Pending);
        assert_eq!(t.classify(Some("Running")), PollClass::Pending);
        assert_eq!(t.classify(None), PollClass::Pending);

        assert_eq!(
            TerminalTable::deployment().classify(Some("Canceled")),
            PollClass::Failed
        );
    }

    #[test]
    fn location_polls_finish_on_non_202_without_label() {
        let t = TerminalTable::default();
        let done = PollState::from_body(200, Value::Null);
        assert_eq!(done.classify(&t, PollSource::Location), PollClass::Succeeded);
        assert_eq!(done.classify(&t, PollSource::AsyncOperation), PollClass::Pending);

        let waiting = PollState::from_body(202, Value::Null);
        assert_eq!(waiting.classify(&t, PollSource::Location), PollClass::Pending);
    }

    #[tokio::test]
    async fn completed_outcome_short_circuits_without_polling() {
        let transport = Arc::new(ScriptedTransport::default());
        let lro = driver(transport.clone(), Arc::default());
        let done = lro
            .drive("op", OperationOutcome::Completed(Some(json!({"id": "x"}))), &token(), settings(5, 300))
            .await
            .unwrap();
        assert_eq!(done.polls, 0);
        assert_eq!(done.body, Some(json!({"id": "x"})));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn failed_outcome_is_a_request_error() {
        let lro = driver(Arc::default(), Arc::default());
        let err = lro
            .drive(
                "op",
                OperationOutcome::Failed { status: 400, body: json!({"error": {"code": "InvalidParameter"}}) },
                &token(),
                settings(5, 300),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ArmError::Request { status: 400, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_state_succeeded_terminates_on_that_poll() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            response(200, json!({"properties": {"provisioningState": "Updating"}})),
            response(200, json!({"properties": {"provisioningState": "Succeeded"}})),
            response(200, json!({"properties": {"provisioningState": "Updating"}})),
        ]));
        let lro = driver(transport.clone(), Arc::default());

        let done = lro
            .drive("op", async_op("https://poll"), &token(), settings(5, 300))
            .await
            .unwrap();

        assert_eq!(done.polls, 2);
        assert_eq!(transport.count(&Method::GET), 2);
        assert_eq!(done.elapsed, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_label_returns_full_diagnostic_body() {
        let failure = json!({
            "status": "Failed",
            "error": {"code": "OSProvisioningTimedOut", "message": "guest agent never reported"}
        });
        let transport = Arc::new(ScriptedTransport::new(vec![
            response(200, json!({"status": "InProgress"})),
            response(200, failure.clone()),
        ]));
        let lro = driver(transport, Arc::default());

        match lro
            .drive("op", async_op("https://poll"), &token(), settings(5, 300))
            .await
            .unwrap_err()
        {
            ArmError::OperationFailed { body } => assert_eq!(body, failure),
            other => panic!("expected OperationFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_terminal_times_out_after_ceil_timeout_over_interval_polls() {
        let transport = Arc::new(
            ScriptedTransport::default().with_fallback(response(200, json!({"status": "InProgress"}))),
        );
        let lro = driver(transport.clone(), Arc::default());

        let err = lro
            .drive("op", async_op("https://poll"), &token(), settings(5, 300))
            .await
            .unwrap_err();

        let gets = transport.count(&Method::GET) as i64;
        assert!((59..=61).contains(&gets), "issued {gets} GETs");
        match err {
            ArmError::OperationTimedOut { polls, last_state, .. } => {
                assert_eq!(polls as i64, gets);
                assert_eq!(last_state.as_deref(), Some("InProgress"));
            }
            other => panic!("expected OperationTimedOut, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn uneven_timeout_rounds_poll_count_up() {
        let transport = Arc::new(
            ScriptedTransport::default().with_fallback(response(200, json!({"status": "Running"}))),
        );
        let lro = driver(transport.clone(), Arc::default());

        let err = lro
            .drive("op", async_op("https://poll"), &token(), settings(4, 10))
            .await
            .unwrap_err();

        assert!(matches!(err, ArmError::OperationTimedOut { .. }));
        // ceil(10 / 4) == 3
        let gets = transport.count(&Method::GET);
        assert!((2..=4).contains(&gets), "issued {gets} GETs");
    }

    #[tokio::test(start_paused = true)]
    async fn interval_longer_than_timeout_stops_at_the_deadline() {
        let transport = Arc::new(
            ScriptedTransport::default().with_fallback(response(200, json!({"status": "InProgress"}))),
        );
        let lro = driver(transport.clone(), Arc::default());

        let err = lro
            .drive("op", async_op("https://poll"), &token(), settings(60, 10))
            .await
            .unwrap_err();

        match err {
            ArmError::OperationTimedOut { elapsed, polls, .. } => {
                assert_eq!(elapsed, Duration::from_secs(10));
                assert_eq!(polls, 1);
            }
            other => panic!("expected OperationTimedOut, got {other:?}"),
        }
        assert_eq!(transport.count(&Method::GET), 1);
    }

    struct HangingTransport;

    #[async_trait::async_trait]
    impl HttpTransport for HangingTransport {
        async fn send(&self, _req: HttpRequest) -> Result<HttpResponse, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_poll_is_cut_off_at_the_deadline() {
        let observer = Arc::new(RecordingObserver::default());
        let lro = LroDriver::new(Executor::new(Arc::new(HangingTransport)), observer.clone());

        let err = lro
            .drive("op", async_op("https://poll"), &token(), settings(5, 30))
            .await
            .unwrap_err();

        match err {
            ArmError::OperationTimedOut { elapsed, polls, last_state } => {
                assert_eq!(elapsed, Duration::from_secs(30));
                assert_eq!(polls, 1);
                assert_eq!(last_state, None);
            }
            other => panic!("expected OperationTimedOut, got {other:?}"),
        }
        assert!(observer
            .events()
            .iter()
            .any(|e| matches!(e, OperationEvent::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_poll_failures_are_retried() {
        let transport = Arc::new(ScriptedTransport::with_results(vec![
            Err(TransportError::Timeout),
            Ok(response(503, json!({"error": {"code": "ServiceUnavailable"}}))),
            Ok(response(200, Value::Null)),
            Ok(response(200, json!({"status": "Succeeded"}))),
        ]));
        let observer = Arc::new(RecordingObserver::default());
        let lro = driver(transport.clone(), observer.clone());

        let done = lro
            .drive("op", async_op("https://poll"), &token(), settings(5, 300))
            .await
            .unwrap();

        assert_eq!(done.polls, 4);
        assert_eq!(observer.poll_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_still_bounded_by_timeout() {
        let transport = Arc::new(ScriptedTransport::default());
        let observer = Arc::new(RecordingObserver::default());
        let lro = driver(transport.clone(), observer.clone());

        let err = lro
            .drive("op", async_op("https://poll"), &token(), settings(5, 30))
            .await
            .unwrap_err();

        assert!(matches!(err, ArmError::OperationTimedOut { last_state: None, .. }));
        assert_eq!(observer.poll_failures(), transport.requests().len());
    }

    #[tokio::test(start_paused = true)]
    async fn location_source_completes_when_202_stops() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            response(202, Value::Null),
            response(202, Value::Null),
            response(204, Value::Null),
        ]));
        let lro = driver(transport, Arc::default());
        let outcome = OperationOutcome::Accepted(PollLocation {
            url: "https://loc".into(),
            source: PollSource::Location,
        });

        let done = lro.drive("op", outcome, &token(), settings(5, 300)).await.unwrap();
        assert_eq!(done.polls, 3);
        assert_eq!(done.body, None);
    }
}
