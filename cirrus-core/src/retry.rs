//! Retry harness
//!
//! Re-invokes an API call while the service's classifier says the failure is
//! temporary, within the operation deadline. Absent and dependency-conflict
//! verdicts during a delete are handed back to the caller as outcomes rather
//! than errors.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::classify::ServiceRules;
use crate::context::OperationContext;
use crate::error::{ApiError, Dependent, ErrorKind, ProviderError, ProviderResult, Verdict};
use crate::timeouts::Operation;
use crate::waiter::{Observation, StateChangeConf};

/// Result of a call that ran to completion under the harness
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Done(T),
    /// 404 (or an absent code) during Delete
    Absent,
    /// 409 naming dependents during Delete
    Conflict(Vec<Dependent>),
}

impl<T> RetryOutcome<T> {
    pub fn into_done(self) -> Option<T> {
        match self {
            RetryOutcome::Done(v) => Some(v),
            _ => None,
        }
    }
}

/// Retry settings for one call site
#[derive(Debug, Clone)]
pub struct RetryConf<'a> {
    rules: &'a ServiceRules,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl<'a> RetryConf<'a> {
    pub fn new(rules: &'a ServiceRules) -> Self {
        Self {
            rules,
            poll_interval: Duration::ZERO,
            timeout: None,
        }
    }

    /// Lower bound for the sleep between attempts
    pub fn with_poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    /// Narrow the budget below the operation deadline
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }

    fn deadline(&self, ctx: &OperationContext) -> Instant {
        match self.timeout {
            Some(t) => (Instant::now() + t).min(ctx.deadline()),
            None => ctx.deadline(),
        }
    }

    /// Run `op` until it succeeds, fails terminally or the budget runs out
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &OperationContext,
        mut op: F,
    ) -> ProviderResult<RetryOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let deadline = self.deadline(ctx);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match ctx.run(op()).await? {
                Ok(v) => return Ok(RetryOutcome::Done(v)),
                Err(e) => e,
            };
            if let Some(outcome) = self.handle_failure(ctx, err, deadline, attempt).await? {
                return Ok(outcome);
            }
        }
    }

    /// Like [`run`](Self::run), but first waits for `stable` to observe the
    /// resource in a settled status before every attempt
    pub async fn run_when_stable<T, S, F, Fut, R, RFut>(
        &self,
        ctx: &OperationContext,
        stable: &StateChangeConf,
        mut refresh: R,
        mut op: F,
    ) -> ProviderResult<RetryOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
        R: FnMut() -> RFut,
        RFut: Future<Output = ProviderResult<Observation<S>>>,
    {
        let deadline = self.deadline(ctx);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            stable.wait(ctx, &mut refresh).await?;
            let err = match ctx.run(op()).await? {
                Ok(v) => return Ok(RetryOutcome::Done(v)),
                Err(e) => e,
            };
            if let Some(outcome) = self.handle_failure(ctx, err, deadline, attempt).await? {
                return Ok(outcome);
            }
        }
    }

    /// Classify a failed attempt. `Ok(None)` means "try again".
    async fn handle_failure<T>(
        &self,
        ctx: &OperationContext,
        err: ApiError,
        deadline: Instant,
        attempt: u32,
    ) -> ProviderResult<Option<RetryOutcome<T>>> {
        let verdict = self.rules.classify(&err);
        match verdict {
            Verdict::Absent if ctx.operation() == Operation::Delete => {
                tracing::debug!(service = %self.rules.service, "already gone");
                Ok(Some(RetryOutcome::Absent))
            }
            Verdict::DependencyConflict(deps) if ctx.operation() == Operation::Delete => {
                Ok(Some(RetryOutcome::Conflict(deps)))
            }
            Verdict::Retry(after) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(ProviderError::from_verdict(&verdict, err).with_kind(ErrorKind::Timeout));
                }
                let wait = after.max(self.poll_interval);
                tracing::warn!(
                    service = %self.rules.service,
                    attempt,
                    code = ?err.error_code(),
                    retry_in = ?wait,
                    "temporary failure, retrying"
                );
                ctx.sleep(wait.min(left)).await?;
                if Instant::now() >= deadline {
                    return Err(ProviderError::from_verdict(&verdict, err).with_kind(ErrorKind::Timeout));
                }
                Ok(None)
            }
            other => Err(ProviderError::from_verdict(&other, err)),
        }
    }

    /// Run `op` and require a value; absent and conflict outcomes become errors
    pub async fn call<T, F, Fut>(&self, ctx: &OperationContext, op: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        match self.run(ctx, op).await? {
            RetryOutcome::Done(v) => Ok(v),
            RetryOutcome::Absent => Err(ProviderError::absent("resource not found")),
            RetryOutcome::Conflict(deps) => Err(ProviderError::new(format!(
                "resource is still referenced by {} dependent(s)",
                deps.len()
            ))
            .with_kind(ErrorKind::Conflict)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelSignal;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(op: Operation, budget: Duration) -> OperationContext {
        OperationContext::new(op, budget, CancelSignal::never())
    }

    fn scripted(
        results: Vec<Result<&'static str, ApiError>>,
    ) -> (impl FnMut() -> std::future::Ready<Result<&'static str, ApiError>>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut script: VecDeque<_> = results.into();
        let op = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(script.pop_front().unwrap_or(Ok("done")))
        };
        (op, calls)
    }

    fn busy() -> ApiError {
        ApiError::http(400, r#"{"error_code":"DCS.4026","error_msg":"busy"}"#)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_busy_codes_until_success() {
        let rules = ServiceRules::new("dcs")
            .with_busy_codes(&["DCS.4026"])
            .with_busy_retry_after(Duration::from_secs(5));
        let (op, calls) = scripted(vec![Err(busy()), Err(busy()), Ok("resized")]);
        let start = Instant::now();
        let out = RetryConf::new(&rules)
            .call(&ctx(Operation::Update, Duration::from_secs(600)), op)
            .await
            .unwrap();
        assert_eq!(out, "resized");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_at_least_a_minute() {
        let rules = ServiceRules::new("elb");
        let (op, _) = scripted(vec![Err(ApiError::http(429, ""))]);
        let start = Instant::now();
        RetryConf::new(&rules)
            .call(&ctx(Operation::Create, Duration::from_secs(600)), op)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_interval_is_a_floor() {
        let rules = ServiceRules::new("dcs")
            .with_busy_codes(&["DCS.4026"])
            .with_busy_retry_after(Duration::from_secs(5));
        let (op, _) = scripted(vec![Err(busy())]);
        let start = Instant::now();
        RetryConf::new(&rules)
            .with_poll_interval(Duration::from_secs(20))
            .call(&ctx(Operation::Update, Duration::from_secs(600)), op)
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_surfaces_timeout() {
        let rules = ServiceRules::new("dcs")
            .with_busy_codes(&["DCS.4026"])
            .with_busy_retry_after(Duration::from_secs(5));
        let results = (0..100).map(|_| Err(busy())).collect();
        let (op, calls) = scripted(results);
        let err = RetryConf::new(&rules)
            .call(&ctx(Operation::Update, Duration::from_secs(30)), op)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.code.as_deref(), Some("DCS.4026"));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_return_immediately() {
        let rules = ServiceRules::new("dcs");
        let (op, calls) = scripted(vec![Err(ApiError::http(
            400,
            r#"{"error_code":"DCS.4001","error_msg":"bad"}"#,
        ))]);
        let err = RetryConf::new(&rules)
            .call(&ctx(Operation::Create, Duration::from_secs(600)), op)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_during_delete_is_an_outcome() {
        let rules = ServiceRules::new("elb");
        let (op, _) = scripted(vec![Err(ApiError::http(404, ""))]);
        let out = RetryConf::new(&rules)
            .run(&ctx(Operation::Delete, Duration::from_secs(60)), op)
            .await
            .unwrap();
        assert_eq!(out, RetryOutcome::Absent);

        let (op, _) = scripted(vec![Err(ApiError::http(404, ""))]);
        let err = RetryConf::new(&rules)
            .run(&ctx(Operation::Update, Duration::from_secs(60)), op)
            .await
            .unwrap_err();
        assert!(err.is_absent());
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_during_delete_names_dependents() {
        let rules = ServiceRules::new("elb");
        let (op, _) = scripted(vec![Err(ApiError::http(409, r#"{"listener_ids":["L"]}"#))]);
        let out = RetryConf::new(&rules)
            .run(&ctx(Operation::Delete, Duration::from_secs(60)), op)
            .await
            .unwrap();
        assert_eq!(out, RetryOutcome::Conflict(vec![Dependent::new("listener", "L")]));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_stable_before_calling() {
        let rules = ServiceRules::new("elb");
        let mut statuses: VecDeque<&str> = VecDeque::from(["PENDING_UPDATE", "ACTIVE"]);
        let refresh = move || {
            let status = statuses.pop_front().unwrap_or("ACTIVE");
            std::future::ready(Ok(Observation::found((), status)))
        };
        let (op, calls) = scripted(vec![Ok("patched")]);
        let stable = StateChangeConf::new("loadbalancer lb-1", &["PENDING_UPDATE"], &["ACTIVE"])
            .with_poll_interval(Duration::from_secs(3));
        let start = Instant::now();
        let out = RetryConf::new(&rules)
            .run_when_stable(&ctx(Operation::Update, Duration::from_secs(60)), &stable, refresh, op)
            .await
            .unwrap();
        assert_eq!(out, RetryOutcome::Done("patched"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }
}
