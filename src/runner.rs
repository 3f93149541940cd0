use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use reqwest::Url;
use reqwest::header::USER_AGENT;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{Instrument, debug, info_span, warn};

use crate::adapter::{
    PostRequest, PostTransport, ReqwestTransport, ResponseResult, RunnerBytes, RunnerError,
    RunnerResult, SharedPostTransport, json_headers, parse_target_url, validate_headers,
};
use crate::config::RunnerConfig;
use crate::payload::RequestPayload;

/// Posts JSON payloads through an injected transport.
///
/// Each submission runs as its own task on the ambient tokio runtime and is
/// redeemed through the returned [`PendingRequest`].
#[derive(Clone)]
pub struct RequestRunner {
    transport: Arc<SharedPostTransport>,
    config: RunnerConfig,
}

impl RequestRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_transport(config, ReqwestTransport::new())
    }

    pub fn with_transport<T>(config: RunnerConfig, transport: T) -> Self
    where
        T: PostTransport + 'static,
    {
        Self {
            transport: Arc::new(transport),
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Validates and submits one POST without waiting for it.
    ///
    /// Fails with `InvalidRequest` before the transport is touched when the
    /// URL is not an absolute http(s) URL, a header is malformed, or no
    /// `Content-Type` is given.
    pub fn submit_payload(
        &self,
        payload: &RequestPayload,
        url: &str,
        mut headers: Vec<(String, RunnerBytes)>,
    ) -> RunnerResult<PendingRequest> {
        let url = parse_target_url(url)?;
        if let Some(agent) = &self.config.user_agent {
            let has_agent = headers
                .iter()
                .any(|(key, _)| key.eq_ignore_ascii_case(USER_AGENT.as_str()));
            if !has_agent {
                headers.push((USER_AGENT.as_str().to_string(), Bytes::from(agent.clone())));
            }
        }
        validate_headers(&headers)?;
        let body = Bytes::from(payload.to_json_vec()?);

        let runtime = Handle::try_current()
            .map_err(|err| RunnerError::internal(format!("no async runtime available: {err}")))?;

        let request = PostRequest {
            url: url.clone(),
            headers,
            body,
            timeout: self.config.timeout,
        };
        let span = info_span!("post", url = %url);
        debug!(parent: &span, bytes = request.body.len(), "submitting payload");

        let future = self.transport.execute(request);
        let task = runtime.spawn(
            async move {
                let result = future.await;
                match &result {
                    Ok(response) => {
                        debug!(status = response.status, elapsed = ?response.elapsed, "response received")
                    }
                    Err(err) => warn!(kind = %err.kind, error = %err.message, "post failed"),
                }
                result
            }
            .instrument(span),
        );

        Ok(PendingRequest { task, url })
    }

    /// Submits to the configured URL with the default JSON headers.
    pub fn post_json(&self, payload: &RequestPayload) -> RunnerResult<PendingRequest> {
        self.submit_payload(payload, &self.config.url, json_headers())
    }

    /// Submits to the configured URL and waits for the outcome.
    pub async fn run(&self, payload: &RequestPayload) -> RunnerResult<ResponseResult> {
        self.post_json(payload)?.wait().await
    }
}

/// Handle to one in-flight POST.
///
/// Dropping the handle detaches the request; it still runs to completion.
#[derive(Debug)]
pub struct PendingRequest {
    task: JoinHandle<RunnerResult<ResponseResult>>,
    url: Url,
}

impl PendingRequest {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Aborts the request. Waiting afterwards yields `Cancelled` unless the
    /// request had already completed.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub async fn wait(self) -> RunnerResult<ResponseResult> {
        self.await
    }
}

impl Future for PendingRequest {
    type Output = RunnerResult<ResponseResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(RunnerError::cancelled()),
            Err(err) => Err(RunnerError::internal(format!("request task failed: {err}"))),
        })
    }
}
