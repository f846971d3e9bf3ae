//! Test case bookkeeping and per-test machine acquisition.
//!
//! [`testcase`] wraps a test body so its begin, end, duration and outcome
//! reach the log. The `with_*` helpers hand a test body the machine it
//! needs, acquiring it (and the lab host in front of it) only when the
//! caller did not pass one in.
//!
//! ```rust,no_run
//! use labrig::{Context, LocalShell, testcase, with_lab};
//!
//! # async fn example(ctx: Context) -> Result<(), labrig::Error> {
//! testcase("lab_uname", with_lab(&ctx, None, |lab| async move {
//!     let mut guard = lab.lock().await;
//!     let out = guard.try_downcast_mut::<LocalShell>()?.exec("uname").await?;
//!     assert_eq!(out.trim(), "Linux");
//!     Ok(())
//! }))
//! .await
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::context::Context;
use crate::error::Result;
use crate::machine::SharedMachine;
use crate::role::{BOARD_LINUX, BOARD_UBOOT, LAB_HOST, Role};

/// How a finished test case went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestcaseSummary {
    pub name: String,
    pub duration: Duration,
    pub passed: bool,
}

/// A running test case.
///
/// Logs its begin when created and its end on [`end`](Self::end). One that
/// is dropped without `end` (its body panicked or was cancelled) is logged
/// as failed.
#[derive(Debug)]
pub struct Testcase {
    name: String,
    started: Instant,
    ended: bool,
}

impl Testcase {
    pub fn begin(name: impl Into<String>) -> Self {
        let name = name.into();
        info!("testcase {} started", name);
        Self {
            name,
            started: Instant::now(),
            ended: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn end(mut self, passed: bool) -> TestcaseSummary {
        self.ended = true;
        self.finish(passed)
    }

    fn finish(&self, passed: bool) -> TestcaseSummary {
        let duration = self.started.elapsed();
        info!(
            "testcase {} {} after {:.3}s",
            self.name,
            if passed { "passed" } else { "failed" },
            duration.as_secs_f64()
        );
        TestcaseSummary {
            name: self.name.clone(),
            duration,
            passed,
        }
    }
}

impl Drop for Testcase {
    fn drop(&mut self) {
        if !self.ended {
            self.finish(false);
        }
    }
}

/// Run `body` as the test case `name`, returning its result unchanged.
pub async fn testcase<T, E, F>(name: &str, body: F) -> std::result::Result<T, E>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: fmt::Display,
{
    let case = Testcase::begin(name);
    let result = body.await;
    if let Err(e) = &result {
        warn!("testcase {}: {}", name, e);
    }
    case.end(result.is_ok());
    result
}

/// Run `body` with the lab host: `lab` if given, otherwise one requested
/// from `ctx` and released afterwards.
pub async fn with_lab<T, F, Fut>(ctx: &Context, lab: Option<SharedMachine>, body: F) -> Result<T>
where
    F: FnOnce(SharedMachine) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_machine(ctx, lab, &[], LAB_HOST, body).await
}

/// Run `body` with the board's bootloader shell, acquiring the lab host
/// and `BOARD_UBOOT` when `uboot` is `None`.
pub async fn with_uboot<T, F, Fut>(
    ctx: &Context,
    uboot: Option<SharedMachine>,
    body: F,
) -> Result<T>
where
    F: FnOnce(SharedMachine) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_machine(ctx, uboot, &[LAB_HOST], BOARD_UBOOT, body).await
}

/// Run `body` with the board's Linux shell, acquiring the lab host and
/// `BOARD_LINUX` when `linux` is `None`.
pub async fn with_linux<T, F, Fut>(
    ctx: &Context,
    linux: Option<SharedMachine>,
    body: F,
) -> Result<T>
where
    F: FnOnce(SharedMachine) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_machine(ctx, linux, &[LAB_HOST], BOARD_LINUX, body).await
}

async fn with_machine<T, F, Fut>(
    ctx: &Context,
    given: Option<SharedMachine>,
    first: &[Role],
    target: Role,
    body: F,
) -> Result<T>
where
    F: FnOnce(SharedMachine) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if let Some(machine) = given {
        return body(machine).await;
    }

    let mut cx = ctx.handle();
    let result = match cx.request_chain(first, target).await {
        Ok(machine) => body(machine).await,
        Err(e) => Err(e),
    };
    let closed = cx.close().await;

    match (result, closed) {
        (Ok(value), closed) => closed.map(|()| value),
        (Err(e), Err(close_err)) => {
            warn!("releasing machines after failure: {}", close_err);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
    }
}
