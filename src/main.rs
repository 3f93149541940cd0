use std::io::{self, Write};
use std::process::ExitCode;

use json_post_runner::{RequestPayload, RequestRunner, ResponseResult, RunnerConfig, RunnerResult};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let config = RunnerConfig::from_env();
    info!(url = %config.url, timeout = ?config.timeout, "posting greeting");

    let payload = RequestPayload::new()
        .with("msg", "Hello")
        .with("user", "Sebastian")
        .with("id", 123);

    let runner = RequestRunner::new(config);
    let outcome = runner.run(&payload).await;
    report(outcome, &mut io::stdout().lock(), &mut io::stderr().lock())
}

/// Prints `Status: <code>` and the raw body to `out`, or the error to `err`.
fn report(
    outcome: RunnerResult<ResponseResult>,
    out: &mut impl Write,
    err: &mut impl Write,
) -> ExitCode {
    match outcome {
        Ok(response) => {
            let printed = writeln!(out, "Status: {}", response.status())
                .and_then(|()| out.write_all(response.body()))
                .and_then(|()| writeln!(out))
                .and_then(|()| out.flush());
            match printed {
                Ok(()) => ExitCode::SUCCESS,
                Err(write_err) => {
                    let _ = writeln!(err, "failed to write response: {write_err}");
                    ExitCode::FAILURE
                }
            }
        }
        Err(failure) => {
            let _ = writeln!(err, "request failed: {failure}");
            ExitCode::FAILURE
        }
    }
}
