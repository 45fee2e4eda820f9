use std::sync::Arc;

use azure_core::credentials::Secret;
use reqwest::Method;
use serde_json::Value;

use crate::error::{diagnostic_body, ArmError, ArmResult};
use crate::http::{HttpRequest, HttpResponse, HttpTransport, RequestBody, TransportError};
use crate::observe::{OperationEvent, OperationObserver, TracingObserver};

pub const ASYNC_OPERATION_HEADER: &str = "azure-asyncoperation";
pub const LOCATION_HEADER: &str = "location";

/// One ARM call.  Immutable once built.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub method: Method,
    pub url: String,
    pub api_version: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl OperationRequest {
    pub fn new(method: Method, url: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            api_version: api_version.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self::new(Method::GET, url, api_version)
    }

    pub fn put(url: impl Into<String>, api_version: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, url, api_version).with_body(body)
    }

    pub fn delete(url: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url, api_version)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// URL with `api-version` and any extra query pairs appended.
    pub fn full_url(&self) -> String {
        let mut url = self.url.clone();
        let mut sep = if url.contains('?') { '&' } else { '?' };
        let pairs =
            std::iter::once(("api-version", self.api_version.as_str())).chain(
                self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            );
        for (k, v) in pairs {
            url.push(sep);
            url.push_str(k);
            url.push('=');
            url.push_str(v);
            sep = '&';
        }
        url
    }
}

/// Which header the poll location came from.  `Location` endpoints signal
/// completion by status code alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSource {
    AsyncOperation,
    Location,
    /// The resource itself is re-read until its provisioning state settles.
    Resource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollLocation {
    pub url: String,
    pub source: PollSource,
}

/// Normalised result of one mutating or reading call.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Completed(Option<Value>),
    Accepted(PollLocation),
    Failed { status: u16, body: Value },
}

/// Map a raw response onto an [`OperationOutcome`].
pub fn classify(resp: &HttpResponse) -> OperationOutcome {
    match resp.status {
        202 => {
            let location = resp
                .header(ASYNC_OPERATION_HEADER)
                .map(|url| PollLocation {
                    url: url.to_string(),
                    source: PollSource::AsyncOperation,
                })
                .or_else(|| {
                    resp.header(LOCATION_HEADER).map(|url| PollLocation {
                        url: url.to_string(),
                        source: PollSource::Location,
                    })
                });
            match location {
                Some(loc) => OperationOutcome::Accepted(loc),
                None => OperationOutcome::Completed(None),
            }
        }
        200..=299 => OperationOutcome::Completed(resp.json()),
        status => OperationOutcome::Failed {
            status,
            body: diagnostic_body(&resp.body),
        },
    }
}

/// Issues signed ARM requests.  Never retries.
#[derive(Clone)]
pub struct Executor {
    transport: Arc<dyn HttpTransport>,
    observer: Arc<dyn OperationObserver>,
}

impl Executor {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn OperationObserver>) -> Self {
        self.observer = observer;
        self
    }

    fn signed(method: Method, url: impl Into<String>, token: &Secret) -> HttpRequest {
        HttpRequest::new(method, url)
            .header("Authorization", format!("Bearer {}", token.secret()))
            .header("Content-Type", "application/json")
    }

    pub async fn execute(
        &self,
        request: &OperationRequest,
        token: &Secret,
    ) -> ArmResult<OperationOutcome> {
        let url = request.full_url();
        tracing::debug!(method = %request.method, %url, "ARM request");

        let mut req = Self::signed(request.method.clone(), url, token);
        if let Some(body) = &request.body {
            req = req.body(RequestBody::Json(body.clone()));
        }

        let resp = self.transport.send(req).await.map_err(|e| ArmError::Request {
            status: 0,
            body: Value::String(e.to_string()),
        })?;

        let outcome = classify(&resp);
        match &outcome {
            OperationOutcome::Completed(None) if resp.status == 202 => {
                self.observer.emit(&OperationEvent::Untracked {
                    operation: format!("{} {}", request.method, request.url),
                });
            }
            OperationOutcome::Failed { status, .. } => {
                tracing::debug!(method = %request.method, status, "ARM request rejected");
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// GET an absolute URL (poll locations, `nextLink` pages) as-is.
    pub async fn fetch(&self, url: &str, token: &Secret) -> Result<HttpResponse, TransportError> {
        self.transport
            .send(Self::signed(Method::GET, url, token))
            .await
    }

    /// GET an absolute URL and require a 2xx JSON body.  An empty body is
    /// `Null`; anything else that is not JSON is an error carrying the text.
    pub async fn get_json(&self, url: &str, token: &Secret) -> ArmResult<Value> {
        let resp = self.fetch(url, token).await.map_err(|e| ArmError::Request {
            status: 0,
            body: Value::String(e.to_string()),
        })?;
        if !(200..300).contains(&resp.status) {
            return Err(ArmError::Request {
                status: resp.status,
                body: diagnostic_body(&resp.body),
            });
        }
        if resp.body.is_empty() {
            return Ok(Value::Null);
        }
        resp.json().ok_or_else(|| ArmError::Request {
            status: resp.status,
            body: Value::String(resp.text()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{response, with_header, ScriptedTransport};
    use crate::observe::testing::RecordingObserver;
    use serde_json::json;

    fn token() -> Secret {
        Secret::from("tok".to_string())
    }

    #[test]
    fn full_url_appends_api_version_and_query() {
        let req = OperationRequest::delete("https://arm/vm", "2025-04-01")
            .with_query("forceDeletion", "true");
        assert_eq!(
            req.full_url(),
            "https://arm/vm?api-version=2025-04-01&forceDeletion=true"
        );

        let req = OperationRequest::get("https://arm/vms?$top=5", "2024-11-01");
        assert_eq!(req.full_url(), "https://arm/vms?$top=5&api-version=2024-11-01");
    }

    #[test]
    fn ok_and_no_content_are_completed() {
        assert_eq!(
            classify(&response(200, json!({"id": "x"}))),
            OperationOutcome::Completed(Some(json!({"id": "x"})))
        );
        assert_eq!(
            classify(&response(204, Value::Null)),
            OperationOutcome::Completed(None)
        );
        assert!(matches!(
            classify(&response(201, json!({"id": "x"}))),
            OperationOutcome::Completed(Some(_))
        ));
    }

    #[test]
    fn async_operation_header_wins_over_location() {
        let resp = with_header(
            with_header(response(202, Value::Null), "Location", "https://loc"),
            "Azure-AsyncOperation",
            "https://async",
        );
        assert_eq!(
            classify(&resp),
            OperationOutcome::Accepted(PollLocation {
                url: "https://async".into(),
                source: PollSource::AsyncOperation,
            })
        );
    }

    #[test]
    fn location_header_used_when_alone() {
        let resp = with_header(response(202, Value::Null), "Location", "https://loc");
        assert_eq!(
            classify(&resp),
            OperationOutcome::Accepted(PollLocation {
                url: "https://loc".into(),
                source: PollSource::Location,
            })
        );
    }

    #[test]
    fn accepted_without_headers_degrades_to_completed() {
        assert_eq!(
            classify(&response(202, Value::Null)),
            OperationOutcome::Completed(None)
        );
    }

    #[test]
    fn other_statuses_fail_with_body() {
        let json_err = response(409, json!({"error": {"code": "Conflict"}}));
        assert_eq!(
            classify(&json_err),
            OperationOutcome::Failed {
                status: 409,
                body: json!({"error": {"code": "Conflict"}}),
            }
        );

        let mut text_err = response(502, Value::Null);
        text_err.body = b"upstream exploded".to_vec();
        assert_eq!(
            classify(&text_err),
            OperationOutcome::Failed {
                status: 502,
                body: Value::String("upstream exploded".into()),
            }
        );
    }

    #[tokio::test]
    async fn execute_signs_request_and_sends_json() {
        let transport = Arc::new(ScriptedTransport::new(vec![response(200, json!({}))]));
        let exec = Executor::new(transport.clone());
        let req = OperationRequest::put("https://arm/nic", "2021-02-01", json!({"location": "eastasia"}));

        exec.execute(&req, &token()).await.unwrap();

        let reqs = transport.requests();
        let sent = &reqs[0];
        assert_eq!(sent.method, Method::PUT);
        assert_eq!(sent.url, "https://arm/nic?api-version=2021-02-01");
        assert!(sent
            .headers
            .contains(&("Authorization".into(), "Bearer tok".into())));
        assert!(sent
            .headers
            .contains(&("Content-Type".into(), "application/json".into())));
        assert_eq!(sent.body, RequestBody::Json(json!({"location": "eastasia"})));
    }

    #[tokio::test]
    async fn headerless_accept_is_reported_as_untracked() {
        let transport = Arc::new(ScriptedTransport::new(vec![response(202, Value::Null)]));
        let observer = Arc::new(RecordingObserver::default());
        let exec = Executor::new(transport).with_observer(observer.clone());

        let outcome = exec
            .execute(&OperationRequest::delete("https://arm/vm", "v"), &token())
            .await
            .unwrap();

        assert_eq!(outcome, OperationOutcome::Completed(None));
        assert!(matches!(
            observer.events().as_slice(),
            [OperationEvent::Untracked { operation }] if operation == "DELETE https://arm/vm"
        ));
    }

    #[tokio::test]
    async fn get_json_rejects_non_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            response(200, json!({"value": []})),
            response(404, json!({"error": {"code": "NotFound"}})),
        ]));
        let exec = Executor::new(transport);

        assert_eq!(
            exec.get_json("https://arm/a", &token()).await.unwrap(),
            json!({"value": []})
        );
        let err = exec.get_json("https://arm/b", &token()).await.unwrap_err();
        assert!(matches!(err, ArmError::Request { status: 404, .. }));
        assert_eq!(err.provider_code(), Some("NotFound"));
    }

    #[tokio::test]
    async fn get_json_rejects_non_json_success_body() {
        let mut page = response(200, Value::Null);
        page.body = b"<html>gateway maintenance</html>".to_vec();
        let transport = Arc::new(ScriptedTransport::new(vec![page, response(204, Value::Null)]));
        let exec = Executor::new(transport);

        match exec.get_json("https://arm/a", &token()).await.unwrap_err() {
            ArmError::Request { status, body } => {
                assert_eq!(status, 200);
                assert_eq!(body, json!("<html>gateway maintenance</html>"));
            }
            other => panic!("expected Request, got {other:?}"),
        }
        assert_eq!(exec.get_json("https://arm/b", &token()).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn transport_failure_on_initiating_call_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::with_results(vec![Err(
            TransportError::Network("refused".into()),
        )]));
        let exec = Executor::new(transport.clone());
        let err = exec
            .execute(&OperationRequest::delete("https://arm/vm", "v"), &token())
            .await
            .unwrap_err();
        assert!(matches!(err, ArmError::Request { status: 0, .. }));
        assert_eq!(transport.requests().len(), 1);
    }
}
