//! Submit-then-join JSON POST helper over reqwest, with an in-memory mock
//! transport for fully deterministic tests.

pub mod adapter;
pub mod config;
pub mod mock;
pub mod payload;
pub mod runner;

pub use adapter::{
    JSON_CONTENT_TYPE, PostRequest, PostTransport, ReqwestTransport, ResponseResult, RunnerBytes,
    RunnerError, RunnerErrorKind, RunnerResult, TransportFuture, json_headers, parse_target_url,
    validate_headers,
};
pub use config::RunnerConfig;
pub use mock::{
    MockBehavior, MockBehaviorPlan, MockResponse, MockTransport, MockTransportSnapshot,
    MockTransportState,
};
pub use payload::{PayloadValue, RequestPayload};
pub use runner::{PendingRequest, RequestRunner};
