//! HTTP interaction layer.
//!
//! Everything above this module talks to the service under test through the
//! [`Transport`] trait: one request in, one [`Response`] (status, body, latency) out.
//! [`ReqwestTransport`] is the production implementation; tests plug in scripted stubs.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
        }
    }
}

/// A single outgoing request.
#[derive(Clone, Debug, TypedBuilder)]
pub struct Request {
    pub method: Method,
    #[builder(setter(into))]
    pub url: String,
    #[builder(default)]
    pub headers: Vec<(String, String)>,
    #[builder(default, setter(strip_option, into))]
    pub body: Option<String>,
    #[builder(default = Duration::from_secs(60))]
    pub timeout: Duration,
}

impl Request {
    /// POST with an empty JSON body, the shape every issuance endpoint expects.
    pub fn post(url: impl Into<String>, timeout: Duration) -> Self {
        Request::builder()
            .method(Method::Post)
            .url(url)
            .headers(vec![json_content_type()])
            .timeout(timeout)
            .build()
    }

    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Request::builder()
            .method(Method::Get)
            .url(url)
            .timeout(timeout)
            .build()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

fn json_content_type() -> (String, String) {
    ("Content-Type".to_string(), "application/json".to_string())
}

/// What came back from the service.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: String,
    pub latency: Duration,
}

impl Response {
    /// Parses the body, unwrapping the `{ "data": ... }` envelope the coupon endpoints use.
    ///
    /// Admin endpoints answer with bare objects; those are returned as-is.
    pub fn payload(&self) -> Option<Value> {
        let value: Value = serde_json::from_str(&self.body).ok()?;
        match value {
            Value::Object(mut map) if map.contains_key("data") => map.remove("data"),
            other => Some(other),
        }
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload()?).ok()
    }

    /// The `requestId` handed back by the asynchronous issuance endpoints.
    pub fn request_id(&self) -> Option<String> {
        request_id_in(&self.payload()?)
    }
}

/// Reads `requestId` out of an already unwrapped payload.
pub fn request_id_in(payload: &Value) -> Option<String> {
    match payload.get("requestId")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Sends one request and reports the outcome.
///
/// Implementations must be cheap to share: a single transport instance is used by every
/// virtual user of every scenario.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: Request) -> Result<Response, TransportError>;
}

/// [`Transport`] backed by a pooled [`reqwest::Client`].
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        }
        .timeout(request.timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let start = Instant::now();
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                TransportError::Timeout(request.timeout)
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        };

        let response = builder.send().await.map_err(map_err)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_err)?;

        Ok(Response {
            status,
            body,
            latency: start.elapsed(),
        })
    }
}

/// URL construction for the coupon service's endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    base_url: String,
}

impl Endpoints {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Joins an absolute path such as `/admin/kafka/health` onto the base URL.
    pub fn path(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    pub fn issue_sync(&self, user_id: u64, code: &str) -> String {
        format!("{}/coupons/issue-sync/{user_id}?code={code}", self.base_url)
    }

    pub fn issue_optimistic(&self, user_id: u64, code: &str) -> String {
        format!("{}/coupons/issue-optimistic/{user_id}?code={code}", self.base_url)
    }

    pub fn issue_event(&self, user_id: u64, code: &str) -> String {
        format!("{}/coupons/issue/{user_id}?code={code}", self.base_url)
    }

    pub fn event_result(&self, user_id: u64, code: &str, request_id: &str) -> String {
        format!(
            "{}/coupons/result/{user_id}?code={code}&requestId={request_id}",
            self.base_url
        )
    }

    pub fn issue_async(&self, user_id: u64, code: &str) -> String {
        format!("{}/coupons/issue-async/{user_id}?code={code}", self.base_url)
    }

    pub fn issue_status(&self, user_id: u64, code: &str) -> String {
        format!("{}/coupons/issue-status/{user_id}?code={code}", self.base_url)
    }

    pub fn coupon_policies(&self) -> String {
        format!("{}/admin/coupon-policies", self.base_url)
    }

    pub fn coupon_status(&self, code: &str) -> String {
        format!("{}/admin/coupons/{code}/status", self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> Response {
        Response {
            status: 200,
            body: body.to_string(),
            latency: Duration::ZERO,
        }
    }

    #[test]
    fn payload_unwraps_data_envelope() {
        let r = response(r#"{"data":{"requestId":"R-1"},"code":"OK"}"#);
        assert_eq!(r.request_id().as_deref(), Some("R-1"));
    }

    #[test]
    fn payload_accepts_bare_objects() {
        let r = response(r#"{"issuedCount":42}"#);
        assert_eq!(r.payload().unwrap()["issuedCount"], 42);
    }

    #[test]
    fn missing_or_empty_request_id_is_none() {
        assert_eq!(response(r#"{"data":{}}"#).request_id(), None);
        assert_eq!(response(r#"{"data":{"requestId":""}}"#).request_id(), None);
        assert_eq!(response("not json").request_id(), None);
    }

    #[test]
    fn endpoints_strip_trailing_slashes() {
        let e = Endpoints::new("http://localhost:8080//");
        assert_eq!(
            e.issue_sync(7, "C1"),
            "http://localhost:8080/coupons/issue-sync/7?code=C1"
        );
        assert_eq!(
            e.event_result(7, "C1", "R"),
            "http://localhost:8080/coupons/result/7?code=C1&requestId=R"
        );
        assert_eq!(
            e.path("admin/kafka/health"),
            "http://localhost:8080/admin/kafka/health"
        );
    }
}
