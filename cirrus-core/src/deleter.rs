//! Dependency-aware delete
//!
//! When the cloud refuses a delete with a 409 that names the resources still
//! referencing the target, each dependent is patched to drop the reference
//! and the delete is issued once more. Detaching shares the delete's
//! deadline.

use std::future::Future;

use async_trait::async_trait;

use crate::classify::ServiceRules;
use crate::context::OperationContext;
use crate::error::{ApiError, Dependent, ErrorKind, ProviderError, ProviderResult};
use crate::retry::{RetryConf, RetryOutcome};

/// Removes a resource from the dependents that still reference it
#[async_trait]
pub trait DependencyResolver: Send + Sync {
    /// Fetch `dependent`, drop every reference to `resource_id` and patch it
    async fn detach(
        &self,
        ctx: &OperationContext,
        dependent: &Dependent,
        resource_id: &str,
    ) -> ProviderResult<()>;
}

/// Resolver for resources whose deletes never report dependents
pub struct NoDependents;

#[async_trait]
impl DependencyResolver for NoDependents {
    async fn detach(
        &self,
        _ctx: &OperationContext,
        dependent: &Dependent,
        _resource_id: &str,
    ) -> ProviderResult<()> {
        Err(ProviderError::new(format!(
            "cannot detach {} {}: unsupported dependent kind",
            dependent.kind, dependent.id
        ))
        .with_kind(ErrorKind::Conflict))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The delete call was accepted
    Deleted,
    /// The resource was already gone
    Absent,
}

/// Issue `delete` under the retry harness, resolving one round of
/// dependency conflicts through `resolver`
pub async fn delete_with_dependents<R, F, Fut>(
    ctx: &OperationContext,
    rules: &ServiceRules,
    resource_id: &str,
    resolver: &R,
    mut delete: F,
) -> ProviderResult<DeleteOutcome>
where
    R: DependencyResolver + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ApiError>>,
{
    let retry = RetryConf::new(rules);

    let dependents = match retry.run(ctx, &mut delete).await? {
        RetryOutcome::Done(()) => return Ok(DeleteOutcome::Deleted),
        RetryOutcome::Absent => return Ok(DeleteOutcome::Absent),
        RetryOutcome::Conflict(deps) => deps,
    };

    tracing::info!(
        resource_id,
        dependents = dependents.len(),
        "delete refused by dependents, detaching"
    );

    let mut failures = Vec::new();
    for dependent in &dependents {
        if let Err(e) = resolver.detach(ctx, dependent, resource_id).await {
            if e.is_canceled() || e.is_timeout() {
                return Err(e);
            }
            failures.push(format!("{} {}: {}", dependent.kind, dependent.id, e));
        }
    }
    if !failures.is_empty() {
        return Err(ProviderError::new(format!(
            "failed to detach {} from its dependents: {}",
            resource_id,
            failures.join("; ")
        ))
        .with_kind(ErrorKind::Conflict));
    }

    match retry.run(ctx, &mut delete).await? {
        RetryOutcome::Done(()) => Ok(DeleteOutcome::Deleted),
        RetryOutcome::Absent => Ok(DeleteOutcome::Absent),
        RetryOutcome::Conflict(remaining) => Err(ProviderError::new(format!(
            "{} is still referenced by: {}",
            resource_id,
            remaining
                .iter()
                .map(|d| format!("{} {}", d.kind, d.id))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .with_kind(ErrorKind::Conflict)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelSignal;
    use crate::timeouts::Operation;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Listeners {
        detached: Mutex<Vec<String>>,
        refuse: Option<&'static str>,
    }

    #[async_trait]
    impl DependencyResolver for Listeners {
        async fn detach(
            &self,
            _ctx: &OperationContext,
            dependent: &Dependent,
            resource_id: &str,
        ) -> ProviderResult<()> {
            if self.refuse == Some(dependent.id.as_str()) {
                return Err(ProviderError::validation("listener is locked"));
            }
            self.detached
                .lock()
                .unwrap()
                .push(format!("{}:{}", dependent.id, resource_id));
            Ok(())
        }
    }

    fn ctx() -> OperationContext {
        OperationContext::new(Operation::Delete, Duration::from_secs(600), CancelSignal::never())
    }

    fn scripted(
        results: Vec<Result<(), ApiError>>,
    ) -> (impl FnMut() -> std::future::Ready<Result<(), ApiError>>, std::sync::Arc<Mutex<usize>>) {
        let calls = std::sync::Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let mut script: VecDeque<_> = results.into();
        (
            move || {
                *counter.lock().unwrap() += 1;
                std::future::ready(script.pop_front().unwrap_or(Ok(())))
            },
            calls,
        )
    }

    #[tokio::test]
    async fn detaches_listeners_then_deletes_again() {
        let resolver = Listeners {
            detached: Mutex::new(Vec::new()),
            refuse: None,
        };
        let (delete, calls) = scripted(vec![Err(ApiError::http(409, r#"{"listener_ids":["L"]}"#)), Ok(())]);
        let out = delete_with_dependents(&ctx(), &ServiceRules::new("elb"), "C", &resolver, delete)
            .await
            .unwrap();
        assert_eq!(out, DeleteOutcome::Deleted);
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(*resolver.detached.lock().unwrap(), vec!["L:C".to_string()]);
    }

    #[tokio::test]
    async fn failed_detach_aggregates_and_skips_delete() {
        let resolver = Listeners {
            detached: Mutex::new(Vec::new()),
            refuse: Some("L2"),
        };
        let (delete, calls) = scripted(vec![Err(ApiError::http(409, r#"{"listener_ids":["L1","L2"]}"#))]);
        let err = delete_with_dependents(&ctx(), &ServiceRules::new("elb"), "C", &resolver, delete)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert!(err.message.contains("listener L2"));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn second_conflict_is_surfaced() {
        let resolver = Listeners {
            detached: Mutex::new(Vec::new()),
            refuse: None,
        };
        let body = r#"{"listener_ids":["L"]}"#;
        let (delete, _) = scripted(vec![Err(ApiError::http(409, body)), Err(ApiError::http(409, body))]);
        let err = delete_with_dependents(&ctx(), &ServiceRules::new("elb"), "C", &resolver, delete)
            .await
            .unwrap_err();
        assert!(err.message.contains("still referenced by: listener L"));
    }

    #[tokio::test]
    async fn already_gone_is_reported() {
        let (delete, _) = scripted(vec![Err(ApiError::http(404, ""))]);
        let out = delete_with_dependents(&ctx(), &ServiceRules::new("elb"), "C", &NoDependents, delete)
            .await
            .unwrap();
        assert_eq!(out, DeleteOutcome::Absent);
    }
}
