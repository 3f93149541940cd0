use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use bytes::Bytes;
use serde::Serialize;
use sonic_rs::to_vec;
use tracing::trace;

use super::adapter::{
    PostRequest, PostTransport, ResponseResult, RunnerBytes, RunnerError, RunnerErrorKind,
    RunnerResult, TransportFuture,
};

/// Request state mirrored by the mock transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockTransportState {
    Idle,
    Busy,
    Error,
}

/// What the mock does with the next request it sees.
#[derive(Clone, Debug, Default)]
pub enum MockBehavior {
    /// Answer from the response queues, or the fallback when they are empty.
    #[default]
    Pass,
    Delay(Duration),
    /// Answer 200 with the request body.
    Echo,
    ConnectRefused {
        reason: String,
    },
    ConnectionReset {
        reason: String,
    },
    Timeout {
        reason: String,
    },
    Malformed {
        reason: String,
    },
}

impl MockBehavior {
    pub fn pass() -> Self {
        Self::Pass
    }

    pub fn delay(ms: u64) -> Self {
        Self::Delay(Duration::from_millis(ms))
    }

    pub fn echo() -> Self {
        Self::Echo
    }

    pub fn connect_refused(reason: impl Into<String>) -> Self {
        Self::ConnectRefused {
            reason: reason.into(),
        }
    }

    pub fn connection_reset(reason: impl Into<String>) -> Self {
        Self::ConnectionReset {
            reason: reason.into(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockBehaviorPlan {
    request: VecDeque<MockBehavior>,
}

impl MockBehaviorPlan {
    pub fn push(&mut self, behavior: MockBehavior) -> &mut Self {
        self.request.push_back(behavior);
        self
    }

    pub fn pop(&mut self) -> MockBehavior {
        self.request.pop_front().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.request.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request.is_empty()
    }
}

impl FromIterator<MockBehavior> for MockBehaviorPlan {
    fn from_iter<I: IntoIterator<Item = MockBehavior>>(iter: I) -> Self {
        Self {
            request: iter.into_iter().collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, RunnerBytes)>,
    pub body: RunnerBytes,
}

impl MockResponse {
    pub fn new(status: u16, body: impl Into<RunnerBytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<RunnerBytes>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status, body.into())
    }

    pub fn json<T: Serialize>(status: u16, payload: &T) -> RunnerResult<Self> {
        let body = to_vec(payload).map_err(|err| RunnerError::internal(err.to_string()))?;
        Ok(Self::new(status, body).with_header("content-type", "application/json"))
    }
}

#[derive(Clone, Debug)]
pub struct MockTransportSnapshot {
    pub state: MockTransportState,
    pub request_count: usize,
    pub connection_attempts: usize,
    pub last_url: Option<String>,
    pub last_status: Option<u16>,
    pub behavior_remaining: usize,
    pub response_queue_len: usize,
    pub route_queue_len: usize,
    pub inbound_count: usize,
    pub outbound_count: usize,
    pub elapsed_total: Duration,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct MockTransportInner {
    state: MockTransportState,
    request_count: usize,
    connection_attempts: usize,
    last_url: Option<String>,
    last_status: Option<u16>,
    behavior_plan: MockBehaviorPlan,
    echo_by_default: bool,
    default_response_queue: VecDeque<MockResponse>,
    route_response_queues: HashMap<String, VecDeque<MockResponse>>,
    outbound_log: Vec<PostRequest>,
    inbound_log: Vec<ResponseResult>,
    last_error: Option<String>,
    elapsed_total: Duration,
}

impl MockTransportInner {
    fn snapshot(&self) -> MockTransportSnapshot {
        MockTransportSnapshot {
            state: self.state,
            request_count: self.request_count,
            connection_attempts: self.connection_attempts,
            last_url: self.last_url.clone(),
            last_status: self.last_status,
            behavior_remaining: self.behavior_plan.len(),
            response_queue_len: self.default_response_queue.len(),
            route_queue_len: self.route_response_queues.values().map(VecDeque::len).sum(),
            inbound_count: self.inbound_log.len(),
            outbound_count: self.outbound_log.len(),
            elapsed_total: self.elapsed_total,
            last_error: self.last_error.clone(),
        }
    }
}

impl Default for MockTransportInner {
    fn default() -> Self {
        Self {
            state: MockTransportState::Idle,
            request_count: 0,
            connection_attempts: 0,
            last_url: None,
            last_status: None,
            behavior_plan: MockBehaviorPlan::default(),
            echo_by_default: false,
            default_response_queue: VecDeque::new(),
            route_response_queues: HashMap::new(),
            outbound_log: Vec::new(),
            inbound_log: Vec::new(),
            last_error: None,
            elapsed_total: Duration::ZERO,
        }
    }
}

/// In-memory [`PostTransport`] with scripted behavior and full request logs.
///
/// Clones share state, so a test can keep one handle for inspection while the
/// runner owns another.
#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that answers every unscripted request with 200 and the request body.
    pub fn echo() -> Self {
        Self::new().echoing()
    }

    /// Answers unscripted requests by echoing instead of the empty fallback.
    pub fn echoing(self) -> Self {
        self.lock("enabling echo").echo_by_default = true;
        self
    }

    pub fn with_behavior_plan(behavior_plan: MockBehaviorPlan) -> Self {
        let transport = Self::new();
        transport.lock("installing behavior plan").behavior_plan = behavior_plan;
        transport
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self::with_behavior_plan(MockBehaviorPlan::from_iter([behavior]))
    }

    fn lock(&self, context: &str) -> MutexGuard<'_, MockTransportInner> {
        self.inner
            .lock()
            .unwrap_or_else(|_| panic!("mock transport mutex poisoned while {context}"))
    }

    pub fn snapshot(&self) -> MockTransportSnapshot {
        self.lock("taking snapshot").snapshot()
    }

    pub fn push_behavior(&self, behavior: MockBehavior) {
        self.lock("queueing behavior").behavior_plan.push(behavior);
    }

    pub fn queue_response(&self, response: MockResponse) {
        self.lock("queueing response")
            .default_response_queue
            .push_back(response);
    }

    pub fn queue_response_for(&self, url: impl Into<String>, response: MockResponse) {
        self.lock("queueing response by url")
            .route_response_queues
            .entry(url.into())
            .or_default()
            .push_back(response);
    }

    pub fn connection_attempts(&self) -> usize {
        self.lock("reading connection attempts").connection_attempts
    }

    pub fn outbound_count(&self) -> usize {
        self.lock("reading outbound count").outbound_log.len()
    }

    pub fn inbound_count(&self) -> usize {
        self.lock("reading inbound count").inbound_log.len()
    }

    pub fn outbound_requests(&self) -> Vec<PostRequest> {
        self.lock("reading outbound log").outbound_log.clone()
    }

    pub fn clear_logs(&self) {
        let mut inner = self.lock("clearing logs");
        inner.outbound_log.clear();
        inner.inbound_log.clear();
    }

    fn begin(&self, request: &PostRequest) -> MockBehavior {
        let mut inner = self.lock("starting request");
        let behavior = inner.behavior_plan.pop();
        inner.request_count += 1;
        inner.connection_attempts += 1;
        inner.last_url = Some(request.url.to_string());
        inner.state = MockTransportState::Busy;
        inner.last_error = None;
        inner.outbound_log.push(request.clone());
        behavior
    }

    fn next_response(&self, request: &PostRequest, echo: bool) -> ResponseResult {
        if echo {
            return echo_response(request);
        }

        let mut inner = self.lock("selecting response");
        let routed = inner
            .route_response_queues
            .get_mut(request.url.as_str())
            .and_then(VecDeque::pop_front);
        let queued = routed.or_else(|| inner.default_response_queue.pop_front());

        match queued {
            Some(response) => ResponseResult {
                status: response.status,
                headers: response.headers,
                body: response.body,
                elapsed: Duration::ZERO,
            },
            None if inner.echo_by_default => echo_response(request),
            None => ResponseResult {
                status: 200,
                headers: Vec::new(),
                body: Bytes::new(),
                elapsed: Duration::ZERO,
            },
        }
    }

    fn finish(&self, mut response: ResponseResult, start: Instant) -> ResponseResult {
        response.elapsed = start.elapsed();
        let mut inner = self.lock("recording response");
        inner.last_status = Some(response.status);
        inner.state = MockTransportState::Idle;
        inner.elapsed_total += response.elapsed;
        inner.inbound_log.push(response.clone());
        response
    }

    fn fail(&self, kind: RunnerErrorKind, message: String) -> RunnerError {
        let mut inner = self.lock("recording error");
        inner.state = MockTransportState::Error;
        inner.last_error = Some(message.clone());
        inner.last_status = None;
        RunnerError::new(kind, None, message)
    }
}

fn echo_response(request: &PostRequest) -> ResponseResult {
    let mut headers = Vec::new();
    if let Some(content_type) = request.header("content-type") {
        headers.push(("content-type".to_string(), Bytes::copy_from_slice(content_type)));
    }
    ResponseResult {
        status: 200,
        headers,
        body: request.body.clone(),
        elapsed: Duration::ZERO,
    }
}

impl PostTransport for MockTransport {
    fn execute(&self, request: PostRequest) -> TransportFuture<RunnerResult<ResponseResult>> {
        let transport = self.clone();
        Box::pin(async move {
            let start = Instant::now();
            let behavior = transport.begin(&request);
            trace!(url = %request.url, ?behavior, "mock transport handling post");
            let echo = matches!(behavior, MockBehavior::Echo);

            match behavior {
                MockBehavior::Delay(duration) => match request.timeout {
                    Some(timeout) if timeout < duration => {
                        tokio::time::sleep(timeout).await;
                        return Err(transport.fail(
                            RunnerErrorKind::Network,
                            format!("operation timed out after {timeout:?}"),
                        ));
                    }
                    _ => tokio::time::sleep(duration).await,
                },
                MockBehavior::ConnectRefused { reason } => {
                    return Err(transport.fail(
                        RunnerErrorKind::Network,
                        format!("connection refused: {reason}"),
                    ));
                }
                MockBehavior::ConnectionReset { reason } => {
                    return Err(transport.fail(
                        RunnerErrorKind::Network,
                        format!("connection reset: {reason}"),
                    ));
                }
                MockBehavior::Timeout { reason } => {
                    return Err(transport.fail(
                        RunnerErrorKind::Network,
                        format!("operation timed out: {reason}"),
                    ));
                }
                MockBehavior::Malformed { reason } => {
                    return Err(transport.fail(
                        RunnerErrorKind::Protocol,
                        format!("invalid http response: {reason}"),
                    ));
                }
                MockBehavior::Pass | MockBehavior::Echo => {}
            }

            let response = transport.next_response(&request, echo);
            Ok(transport.finish(response, start))
        })
    }
}
