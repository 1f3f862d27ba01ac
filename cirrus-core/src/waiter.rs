//! State-change waiter
//!
//! Polls a refresh closure until the observed status leaves the pending set
//! and settles in the target set. The waiter knows nothing about resources:
//! the closure decides how a status is obtained (direct GET, parent lookup,
//! list and filter).

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::context::OperationContext;
use crate::error::{ErrorKind, ProviderError, ProviderResult};

/// Status that makes an absent resource count as success
pub const DELETED: &str = "DELETED";

/// Upper bound for the exponential poll backoff
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Statuses that always terminate a wait as a failure
pub const DEFAULT_FAILURE_STATUSES: &[&str] = &[
    "ERROR",
    "failed",
    "FAILED",
    "CREATE_FAILED",
    "RELEASE_RESOURCE_FAILED",
];

/// One result of a refresh call
#[derive(Debug, Clone, PartialEq)]
pub enum Observation<T> {
    Found { payload: T, status: String },
    Absent,
}

impl<T> Observation<T> {
    pub fn found(payload: T, status: impl Into<String>) -> Self {
        Observation::Found {
            payload,
            status: status.into(),
        }
    }
}

/// Configuration of one wait
#[derive(Debug, Clone)]
pub struct StateChangeConf {
    /// What is being waited on, for messages ("instance 3f2a...")
    pub subject: String,
    pub pending: Vec<String>,
    pub target: Vec<String>,
    /// Defaults to the time left in the operation context
    pub timeout: Option<Duration>,
    pub delay: Duration,
    /// Fixed interval between polls; exponential backoff when unset
    pub poll_interval: Option<Duration>,
    pub min_interval: Duration,
    pub continuous_target_occurrence: u32,
    pub failure_statuses: Vec<String>,
    /// 404s tolerated while the target does not include DELETED
    pub not_found_checks: u32,
}

impl StateChangeConf {
    pub fn new(subject: impl Into<String>, pending: &[&str], target: &[&str]) -> Self {
        Self {
            subject: subject.into(),
            pending: pending.iter().map(|s| s.to_string()).collect(),
            target: target.iter().map(|s| s.to_string()).collect(),
            timeout: None,
            delay: Duration::ZERO,
            poll_interval: None,
            min_interval: Duration::from_secs(1),
            continuous_target_occurrence: 1,
            failure_statuses: DEFAULT_FAILURE_STATUSES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            not_found_checks: 0,
        }
    }

    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }

    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = d;
        self
    }

    pub fn with_poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = Some(d);
        self
    }

    pub fn with_min_interval(mut self, d: Duration) -> Self {
        self.min_interval = d;
        self
    }

    pub fn with_continuous_target(mut self, n: u32) -> Self {
        self.continuous_target_occurrence = n.max(1);
        self
    }

    pub fn with_failure_statuses(mut self, statuses: &[&str]) -> Self {
        self.failure_statuses
            .extend(statuses.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_not_found_checks(mut self, n: u32) -> Self {
        self.not_found_checks = n;
        self
    }

    fn accepts_absent(&self) -> bool {
        self.target.iter().any(|t| t == DELETED)
    }

    /// Poll `refresh` until the target is reached.
    ///
    /// Returns the last payload, or `None` when success was an absent
    /// resource with `DELETED` in the target set.
    pub async fn wait<T, F, Fut>(
        &self,
        ctx: &OperationContext,
        mut refresh: F,
    ) -> Result<Option<T>, WaitError<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<Observation<T>>>,
    {
        let deadline = match self.timeout {
            Some(t) => (Instant::now() + t).min(ctx.deadline()),
            None => ctx.deadline(),
        };

        if !self.delay.is_zero() {
            self.pause(ctx, self.delay, deadline).await?;
        }

        let mut matches = 0u32;
        let mut not_found = 0u32;
        let mut backoff = self.min_interval.max(Duration::from_millis(100));
        let mut last_status: Option<String> = None;
        let mut last_payload: Option<T> = None;

        loop {
            let mut hold_off = Duration::ZERO;

            if Instant::now() >= deadline {
                return Err(self.error(
                    WaitErrorKind::Timeout {
                        last_status: last_status.clone(),
                    },
                    last_payload,
                ));
            }

            let observed = ctx
                .run(refresh())
                .await
                .map_err(|e| self.error(WaitErrorKind::Refresh(e), None))?;

            match observed {
                Ok(Observation::Absent) => {
                    if self.accepts_absent() {
                        tracing::debug!(subject = %self.subject, "resource is gone");
                        return Ok(None);
                    }
                    not_found += 1;
                    if not_found > self.not_found_checks {
                        return Err(self.error(WaitErrorKind::NotFound, last_payload));
                    }
                    tracing::debug!(subject = %self.subject, not_found, "not found yet, tolerating");
                }
                Err(e) if e.is_absent() => {
                    if self.accepts_absent() {
                        return Ok(None);
                    }
                    not_found += 1;
                    if not_found > self.not_found_checks {
                        return Err(self.error(WaitErrorKind::NotFound, last_payload));
                    }
                }
                Err(e) if e.kind == ErrorKind::Retryable => {
                    hold_off = e.retry_after.unwrap_or_default();
                    tracing::warn!(
                        subject = %self.subject,
                        error = %e,
                        retry_after_secs = hold_off.as_secs(),
                        "transient refresh error"
                    );
                }
                Err(e) => return Err(self.error(WaitErrorKind::Refresh(e), last_payload)),
                Ok(Observation::Found { payload, status }) => {
                    not_found = 0;
                    tracing::debug!(subject = %self.subject, status = %status, "refreshed");

                    if self.target.contains(&status) {
                        matches += 1;
                        if matches >= self.continuous_target_occurrence {
                            return Ok(Some(payload));
                        }
                    } else if self.pending.contains(&status) {
                        matches = 0;
                    } else if self.failure_statuses.contains(&status) {
                        return Err(self.error(WaitErrorKind::FailureStatus(status), Some(payload)));
                    } else {
                        return Err(self.error(
                            WaitErrorKind::UnexpectedStatus(status),
                            Some(payload),
                        ));
                    }
                    last_status = Some(status);
                    last_payload = Some(payload);
                }
            }

            let interval = match self.poll_interval {
                Some(fixed) => fixed,
                None => {
                    let current = backoff;
                    backoff = (backoff * 2).min(MAX_POLL_INTERVAL);
                    current
                }
            }
            .max(hold_off);
            if let Err(e) = self.pause(ctx, interval, deadline).await {
                return Err(WaitError {
                    payload: last_payload,
                    ..e
                });
            }
        }
    }

    /// Sleep for `d` but never past `deadline`
    async fn pause<T>(
        &self,
        ctx: &OperationContext,
        d: Duration,
        deadline: Instant,
    ) -> Result<(), WaitError<T>> {
        let left = deadline.saturating_duration_since(Instant::now());
        ctx.sleep(d.min(left))
            .await
            .map_err(|e| self.error(WaitErrorKind::Refresh(e), None))
    }

    fn error<T>(&self, kind: WaitErrorKind, payload: Option<T>) -> WaitError<T> {
        WaitError {
            kind,
            subject: self.subject.clone(),
            target: self.target.clone(),
            payload,
        }
    }
}

#[derive(Debug)]
pub enum WaitErrorKind {
    Timeout { last_status: Option<String> },
    FailureStatus(String),
    UnexpectedStatus(String),
    NotFound,
    /// Refresh failed, or the wait was canceled
    Refresh(ProviderError),
}

/// Failed wait, with the last payload seen
#[derive(Debug)]
pub struct WaitError<T> {
    pub kind: WaitErrorKind,
    pub subject: String,
    pub target: Vec<String>,
    pub payload: Option<T>,
}

impl<T> WaitError<T> {
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, WaitErrorKind::Timeout { .. })
    }
}

impl<T> fmt::Display for WaitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = self.target.join(", ");
        match &self.kind {
            WaitErrorKind::Timeout { last_status } => {
                write!(f, "timeout while waiting for {} to become {}", self.subject, target)?;
                if let Some(s) = last_status {
                    write!(f, " (last state: {})", s)?;
                }
                Ok(())
            }
            WaitErrorKind::FailureStatus(s) => {
                write!(f, "{} entered failure state {}", self.subject, s)
            }
            WaitErrorKind::UnexpectedStatus(s) => write!(
                f,
                "unexpected state '{}' for {}, wanted target '{}'",
                s, self.subject, target
            ),
            WaitErrorKind::NotFound => write!(f, "{} not found while waiting", self.subject),
            WaitErrorKind::Refresh(e) => write!(f, "error waiting for {}: {}", self.subject, e),
        }
    }
}

impl<T> From<WaitError<T>> for ProviderError {
    fn from(err: WaitError<T>) -> Self {
        let message = err.to_string();
        match err.kind {
            WaitErrorKind::Refresh(inner) => inner,
            WaitErrorKind::Timeout { last_status } => {
                let e = ProviderError::timeout(message);
                match last_status {
                    Some(s) => e.with_code(s),
                    None => e,
                }
            }
            WaitErrorKind::FailureStatus(s) | WaitErrorKind::UnexpectedStatus(s) => {
                ProviderError::new(message).with_code(s)
            }
            WaitErrorKind::NotFound => ProviderError::absent(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CancelHandle, CancelSignal};
    use crate::timeouts::Operation;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(budget: Duration) -> OperationContext {
        OperationContext::new(Operation::Create, budget, CancelSignal::never())
    }

    fn scripted(
        statuses: &[&'static str],
    ) -> impl FnMut() -> std::future::Ready<ProviderResult<Observation<&'static str>>> {
        let mut script: VecDeque<&'static str> = statuses.iter().copied().collect();
        move || {
            let obs = match script.pop_front() {
                Some("404") | None => Observation::Absent,
                Some(status) => Observation::found(status, status),
            };
            std::future::ready(Ok(obs))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reaches_target_after_pending() {
        let conf = StateChangeConf::new("instance i-1", &["CREATING"], &["RUNNING"])
            .with_poll_interval(Duration::from_secs(5));
        let out = conf
            .wait(&ctx(Duration::from_secs(600)), scripted(&["CREATING", "CREATING", "RUNNING"]))
            .await
            .unwrap();
        assert_eq!(out, Some("RUNNING"));
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_target_resets_on_pending() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut inner = scripted(&["ACTIVE", "CREATING", "ACTIVE", "ACTIVE"]);
        let conf = StateChangeConf::new("lb", &["CREATING"], &["ACTIVE"])
            .with_continuous_target(2)
            .with_poll_interval(Duration::from_secs(1));
        conf.wait(&ctx(Duration::from_secs(60)), || {
            counter.fetch_add(1, Ordering::SeqCst);
            inner()
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_is_success_when_deleting() {
        let conf = StateChangeConf::new("cert", &["DELETING"], &[DELETED]);
        let out = conf
            .wait(&ctx(Duration::from_secs(60)), scripted(&["DELETING", "404"]))
            .await
            .unwrap();
        assert_eq!(out, None);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_is_failure_unless_tolerated() {
        let conf = StateChangeConf::new("job", &["CREATING"], &["CONFIGURATION"]);
        let err = conf
            .wait(&ctx(Duration::from_secs(60)), scripted(&["404"]))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, WaitErrorKind::NotFound));

        let tolerant = conf.clone().with_not_found_checks(2);
        let out = tolerant
            .wait(
                &ctx(Duration::from_secs(60)),
                scripted(&["404", "404", "CONFIGURATION"]),
            )
            .await
            .unwrap();
        assert_eq!(out, Some("CONFIGURATION"));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_status_carries_payload() {
        let conf = StateChangeConf::new("job", &["CREATING"], &["RUNNING"]);
        let err = conf
            .wait(&ctx(Duration::from_secs(60)), scripted(&["CREATING", "CREATE_FAILED"]))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, WaitErrorKind::FailureStatus(ref s) if s == "CREATE_FAILED"));
        assert_eq!(err.payload, Some("CREATE_FAILED"));
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_status_fails() {
        let conf = StateChangeConf::new("instance i-1", &["CREATING"], &["RUNNING"]);
        let err = conf
            .wait(&ctx(Duration::from_secs(60)), scripted(&["FROZEN"]))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, WaitErrorKind::UnexpectedStatus(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_naming_subject_and_target() {
        let conf = StateChangeConf::new("instance i-1", &["CREATING"], &["RUNNING"])
            .with_timeout(Duration::from_secs(30))
            .with_poll_interval(Duration::from_secs(5));
        let refresh = || std::future::ready(Ok(Observation::found((), "CREATING")));
        let start = Instant::now();
        let err = conf.wait(&ctx(Duration::from_secs(600)), refresh).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() <= Duration::from_secs(31));

        let surfaced: ProviderError = err.into();
        assert!(surfaced.is_timeout());
        assert_eq!(surfaced.code.as_deref(), Some("CREATING"));
        assert!(surfaced.message.contains("instance i-1"));
        assert!(surfaced.message.contains("RUNNING"));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped() {
        let conf = StateChangeConf::new("x", &["P"], &["T"]).with_timeout(Duration::from_secs(120));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let refresh = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(Observation::found((), "P")))
        };
        let _ = conf.wait(&ctx(Duration::from_secs(600)), refresh).await;
        // 1+2+4+8 = 15s, then every 10s until 120s
        let n = calls.load(Ordering::SeqCst);
        assert!((14..=16).contains(&n), "polled {} times", n);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_refresh_waits_out_the_retry_delay() {
        use crate::error::{ApiError, Verdict};

        let conf = StateChangeConf::new("instance i-1", &["CREATING"], &["RUNNING"])
            .with_poll_interval(Duration::from_secs(3));
        let polls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = polls.clone();
        let mut throttled = true;
        let refresh = move || {
            seen.lock().unwrap().push(Instant::now());
            let out = if std::mem::take(&mut throttled) {
                Err(ProviderError::from_verdict(
                    &Verdict::Retry(Duration::from_secs(60)),
                    ApiError::http(429, "{}"),
                ))
            } else {
                Ok(Observation::found((), "RUNNING"))
            };
            std::future::ready(out)
        };

        conf.wait(&ctx(Duration::from_secs(600)), refresh).await.unwrap();
        let polls = polls.lock().unwrap();
        assert_eq!(polls.len(), 2);
        assert!(polls[1] - polls[0] >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_refresh_without_delay_keeps_the_poll_interval() {
        let conf = StateChangeConf::new("instance i-1", &["CREATING"], &["RUNNING"])
            .with_poll_interval(Duration::from_secs(3));
        let mut busy = true;
        let refresh = move || {
            let out = if std::mem::take(&mut busy) {
                Err(ProviderError::new("DCS.4026").with_kind(ErrorKind::Retryable))
            } else {
                Ok(Observation::found((), "RUNNING"))
            };
            std::future::ready(out)
        };

        let start = Instant::now();
        conf.wait(&ctx(Duration::from_secs(600)), refresh).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_poll_returns_promptly() {
        let handle = CancelHandle::new();
        let ctx = OperationContext::new(Operation::Delete, Duration::from_secs(600), handle.signal());
        let conf = StateChangeConf::new("cert", &["DELETING"], &[DELETED])
            .with_poll_interval(Duration::from_secs(10));
        let refresh = || std::future::ready(Ok(Observation::found((), "DELETING")));

        let start = Instant::now();
        let canceler = async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            handle.cancel();
        };
        let (res, _) = tokio::join!(conf.wait(&ctx, refresh), canceler);
        let err: ProviderError = res.unwrap_err().into();
        assert!(err.is_canceled());
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
