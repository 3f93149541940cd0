use std::{
    error::Error as StdError,
    fmt,
    future::Future,
    io,
    pin::Pin,
    time::{Duration, Instant},
};

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use reqwest::{Client as ReqwestClient, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, trace};

pub type RunnerBytes = Bytes;
pub type TransportFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
pub type RunnerResult<T> = Result<T, RunnerError>;

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunnerErrorKind {
    /// Rejected before any I/O: bad URL, bad header, unserializable payload.
    InvalidRequest,
    /// Connect failure, timeout, reset. No status code is available.
    Network,
    /// A response arrived but was not valid HTTP.
    Protocol,
    Cancelled,
    Internal,
}

impl RunnerErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "InvalidRequest",
            Self::Network => "NetworkError",
            Self::Protocol => "ProtocolError",
            Self::Cancelled => "Cancelled",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for RunnerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error)]
#[error("{kind}: {message}")]
pub struct RunnerError {
    pub kind: RunnerErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl RunnerError {
    pub fn new(kind: RunnerErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RunnerErrorKind::InvalidRequest, None, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RunnerErrorKind::Network, None, message)
    }

    pub fn protocol(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::new(RunnerErrorKind::Protocol, status, message)
    }

    pub fn cancelled() -> Self {
        Self::new(RunnerErrorKind::Cancelled, None, "request cancelled before completion")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RunnerErrorKind::Internal, None, message)
    }

    pub fn kind(&self) -> RunnerErrorKind {
        self.kind
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub(crate) fn from_serialize(err: sonic_rs::Error) -> Self {
        Self::invalid_request(format!("payload is not serializable json: {err}"))
    }

    pub(crate) fn from_parse(err: sonic_rs::Error) -> Self {
        Self::invalid_request(format!("text is not a valid payload json object: {err}"))
    }

    /// Classifies a reqwest failure. Anything that bottoms out in an I/O
    /// error, or a connection closed before a full response arrived, is a
    /// network failure; otherwise the peer spoke bad HTTP.
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let message = err.to_string();
        let kind = if err.is_builder() {
            RunnerErrorKind::InvalidRequest
        } else if err.is_connect() || err.is_timeout() || is_dropped_connection(&err) {
            RunnerErrorKind::Network
        } else {
            RunnerErrorKind::Protocol
        };
        Self::new(kind, status, message)
    }
}

fn is_dropped_connection(err: &(dyn StdError + 'static)) -> bool {
    let mut source = err.source();
    while let Some(inner) = source {
        if inner.is::<io::Error>() {
            return true;
        }
        if inner
            .downcast_ref::<hyper::Error>()
            .is_some_and(hyper::Error::is_incomplete_message)
        {
            return true;
        }
        source = inner.source();
    }
    false
}

/// Validated outbound POST handed to a [`PostTransport`].
#[derive(Clone, Debug)]
pub struct PostRequest {
    pub url: Url,
    pub headers: Vec<(String, RunnerBytes)>,
    pub body: RunnerBytes,
    pub timeout: Option<Duration>,
}

impl PostRequest {
    pub fn new(url: Url, body: impl Into<RunnerBytes>) -> Self {
        Self {
            url,
            headers: Vec::new(),
            body: body.into(),
            timeout: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<RunnerBytes>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_ref())
    }
}

/// Parses and checks a target URL. Only absolute http(s) URLs with a host
/// are accepted.
pub fn parse_target_url(url: &str) -> RunnerResult<Url> {
    let parsed = Url::parse(url)
        .map_err(|err| RunnerError::invalid_request(format!("malformed url {url:?}: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RunnerError::invalid_request(format!(
            "unsupported url scheme {:?} in {url:?}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(RunnerError::invalid_request(format!("url {url:?} has no host")));
    }
    Ok(parsed)
}

/// Checks that every header is well formed and that a content type is set.
pub fn validate_headers(headers: &[(String, RunnerBytes)]) -> RunnerResult<()> {
    for (key, value) in headers {
        HeaderName::from_bytes(key.as_bytes())
            .map_err(|err| RunnerError::invalid_request(format!("invalid header name {key:?}: {err}")))?;
        HeaderValue::from_bytes(value)
            .map_err(|err| RunnerError::invalid_request(format!("invalid value for header {key:?}: {err}")))?;
    }
    let has_content_type = headers
        .iter()
        .any(|(key, _)| key.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
    if !has_content_type {
        return Err(RunnerError::invalid_request("missing Content-Type header"));
    }
    Ok(())
}

/// Default header set for a JSON body.
pub fn json_headers() -> Vec<(String, RunnerBytes)> {
    vec![(
        CONTENT_TYPE.as_str().to_string(),
        Bytes::from_static(JSON_CONTENT_TYPE.as_bytes()),
    )]
}

/// Outcome of one completed POST. Immutable once built.
#[derive(Clone, Debug)]
pub struct ResponseResult {
    pub status: u16,
    pub headers: Vec<(String, RunnerBytes)>,
    pub body: RunnerBytes,
    pub elapsed: Duration,
}

impl ResponseResult {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as text. Invalid UTF-8 sequences are replaced.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_ref())
    }

    pub fn json<T: DeserializeOwned>(&self) -> RunnerResult<T> {
        sonic_rs::from_slice(&self.body).map_err(|err| {
            RunnerError::protocol(format!("response body is not the expected json: {err}"), Some(self.status))
        })
    }
}

pub trait PostTransport: Send + Sync {
    fn execute(&self, request: PostRequest) -> TransportFuture<RunnerResult<ResponseResult>>;
}

pub type SharedPostTransport = dyn PostTransport + Send + Sync;

#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: ReqwestClient,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: ReqwestClient::new(),
        }
    }

    pub fn with_client(client: ReqwestClient) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PostTransport for ReqwestTransport {
    fn execute(&self, request: PostRequest) -> TransportFuture<RunnerResult<ResponseResult>> {
        let client = self.client.clone();
        Box::pin(async move {
            let start = Instant::now();
            let mut req = client.post(request.url.clone());

            for (key, value) in request.headers {
                let value = HeaderValue::from_bytes(value.as_ref())
                    .map_err(|err| RunnerError::invalid_request(err.to_string()))?;
                req = req.header(key, value);
            }

            req = req.body(request.body);

            if let Some(timeout) = request.timeout {
                req = req.timeout(timeout);
            }

            trace!(url = %request.url, "sending post");
            let resp = req.send().await.map_err(RunnerError::from_reqwest)?;

            let status = resp.status().as_u16();
            let headers = resp
                .headers()
                .iter()
                .map(|(name, value)| (name.to_string(), Bytes::copy_from_slice(value.as_ref())))
                .collect();
            let body = resp.bytes().await.map_err(|err| {
                let mut error = RunnerError::from_reqwest(err);
                error.status = Some(status);
                error
            })?;
            let elapsed = start.elapsed();
            debug!(status, bytes = body.len(), ?elapsed, "post completed");

            Ok(ResponseResult {
                status,
                headers,
                body,
                elapsed,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_and_garbage_urls_are_invalid() {
        for url in ["not a url", "/post", "", "ftp://test.local/post", "http://"] {
            let err = parse_target_url(url).expect_err("url should be rejected");
            assert_eq!(err.kind(), RunnerErrorKind::InvalidRequest, "url {url:?}");
        }
    }

    #[test]
    fn absolute_http_urls_are_accepted() {
        let url = parse_target_url("http://test.local/post").expect("url should parse");
        assert_eq!(url.host_str(), Some("test.local"));
        assert_eq!(url.path(), "/post");
        assert!(parse_target_url("https://httpbin.org/post").is_ok());
    }

    #[test]
    fn content_type_is_required_case_insensitively() {
        assert!(validate_headers(&json_headers()).is_ok());
        assert!(validate_headers(&[("content-type".into(), Bytes::from_static(b"application/json"))]).is_ok());

        let err = validate_headers(&[("accept".into(), Bytes::from_static(b"*/*"))])
            .expect_err("missing content type should fail");
        assert_eq!(err.kind(), RunnerErrorKind::InvalidRequest);
    }

    #[test]
    fn malformed_header_is_invalid() {
        let mut headers = json_headers();
        headers.push(("bad header".into(), Bytes::from_static(b"x")));
        let err = validate_headers(&headers).expect_err("bad header name should fail");
        assert_eq!(err.kind(), RunnerErrorKind::InvalidRequest);

        let mut headers = json_headers();
        headers.push(("x-trace".into(), Bytes::from_static(b"line\nbreak")));
        assert!(validate_headers(&headers).is_err());
    }

    #[test]
    fn error_display_names_the_kind() {
        let err = RunnerError::network("connection refused");
        assert_eq!(err.to_string(), "NetworkError: connection refused");
        assert_eq!(RunnerError::cancelled().kind(), RunnerErrorKind::Cancelled);
    }

    #[test]
    fn response_json_failure_is_protocol_error() {
        let response = ResponseResult {
            status: 200,
            headers: Vec::new(),
            body: Bytes::from_static(b"not-json"),
            elapsed: Duration::ZERO,
        };
        let err = response
            .json::<Vec<u32>>()
            .expect_err("non-json body should fail to parse");
        assert_eq!(err.kind(), RunnerErrorKind::Protocol);
        assert_eq!(err.status(), Some(200));
    }
}
