use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::error::{ArmError, ArmResult};

/// Per-request timeout applied by [`ReqwestTransport`].
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }
}

/// Raw upstream response.  Header names are stored lower-cased.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Body parsed as JSON; `None` when empty or not JSON.
    pub fn json(&self) -> Option<Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("timeout")]
    Timeout,
    #[error("connect/dns/tls error: {0}")]
    Network(String),
    #[error("http error: {0}")]
    Other(String),
}

/// The outbound HTTP capability used by every component.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, req: HttpRequest) -> Result<HttpResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> ArmResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("azure-vm-mcp-server/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ArmError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, req: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut rb = self.client.request(req.method, &req.url);
        for (k, v) in &req.headers {
            rb = rb.header(k.as_str(), v.as_str());
        }
        rb = match req.body {
            RequestBody::Empty => rb,
            RequestBody::Json(v) => rb.json(&v),
            RequestBody::Form(pairs) => rb.form(&pairs),
        };

        let resp = rb.send().await.map_err(map_reqwest_error)?;
        let status = resp.status().as_u16();

        let mut headers = BTreeMap::new();
        for (k, v) in resp.headers().iter() {
            if let Ok(s) = v.to_str() {
                headers.insert(k.as_str().to_ascii_lowercase(), s.to_string());
            }
        }

        let body = resp.bytes().await.map_err(map_reqwest_error)?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        return TransportError::Timeout;
    }
    if e.is_connect() || e.is_request() {
        return TransportError::Network(e.to_string());
    }
    TransportError::Other(e.to_string())
}

#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    pub fn response(status: u16, body: Value) -> HttpResponse {
        let body = if body.is_null() {
            Vec::new()
        } else {
            body.to_string().into_bytes()
        };
        HttpResponse {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn with_header(mut resp: HttpResponse, name: &str, value: &str) -> HttpResponse {
        resp.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        resp
    }

    /// Replays queued responses in order and records every request.  Once
    /// the queue is drained the fallback (if any) is returned forever.
    #[derive(Default)]
    pub struct ScriptedTransport {
        queue: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        fallback: Option<HttpResponse>,
        pub requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub fn new(responses: Vec<HttpResponse>) -> Self {
            Self {
                queue: Mutex::new(responses.into_iter().map(Ok).collect()),
                ..Default::default()
            }
        }

        pub fn with_results(results: Vec<Result<HttpResponse, TransportError>>) -> Self {
            Self {
                queue: Mutex::new(results.into_iter().collect()),
                ..Default::default()
            }
        }

        pub fn with_fallback(mut self, resp: HttpResponse) -> Self {
            self.fallback = Some(resp);
            self
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn count(&self, method: &Method) -> usize {
            self.requests()
                .iter()
                .filter(|r| &r.method == method)
                .count()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, req: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.requests.lock().unwrap().push(req);
            if let Some(next) = self.queue.lock().unwrap().pop_front() {
                return next;
            }
            self.fallback
                .clone()
                .ok_or_else(|| TransportError::Other("no scripted response left".into()))
        }
    }
}
