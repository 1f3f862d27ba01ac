//! Tag reconciliation
//!
//! Tags are pushed through two batch calls: delete the pairs that are no
//! longer wanted, then create the new ones. A changed value is a delete of
//! the old pair plus a create of the new pair.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::classify::ServiceRules;
use crate::context::OperationContext;
use crate::error::{ApiError, ProviderResult};
use crate::retry::RetryConf;

pub type Tags = BTreeMap<String, String>;

/// The two batch calls of a service's tag API
#[async_trait]
pub trait TagClient: Send + Sync {
    async fn batch_delete(&self, resource_id: &str, tags: &Tags) -> Result<(), ApiError>;
    async fn batch_create(&self, resource_id: &str, tags: &Tags) -> Result<(), ApiError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    pub to_delete: Tags,
    pub to_create: Tags,
}

impl TagDiff {
    pub fn compute(prior: &Tags, desired: &Tags) -> Self {
        let pairs_missing_from = |from: &Tags, other: &Tags| -> Tags {
            from.iter()
                .filter(|(k, v)| other.get(*k) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        Self {
            to_delete: pairs_missing_from(prior, desired),
            to_create: pairs_missing_from(desired, prior),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_create.is_empty()
    }
}

/// Push `desired` over `prior`: delete first, then create, both under the
/// retry harness. A failed create after a successful delete is surfaced.
pub async fn reconcile<C>(
    ctx: &OperationContext,
    rules: &ServiceRules,
    client: &C,
    resource_id: &str,
    prior: &Tags,
    desired: &Tags,
) -> ProviderResult<TagDiff>
where
    C: TagClient + ?Sized,
{
    let diff = TagDiff::compute(prior, desired);
    let retry = RetryConf::new(rules);

    if !diff.to_delete.is_empty() {
        tracing::debug!(resource_id, count = diff.to_delete.len(), "deleting tags");
        retry
            .call(ctx, || client.batch_delete(resource_id, &diff.to_delete))
            .await
            .map_err(|e| e.context(format!("error deleting tags of {}", resource_id)))?;
    }

    if !diff.to_create.is_empty() {
        tracing::debug!(resource_id, count = diff.to_create.len(), "creating tags");
        retry
            .call(ctx, || client.batch_create(resource_id, &diff.to_create))
            .await
            .map_err(|e| e.context(format!("error creating tags of {}", resource_id)))?;
    }

    Ok(diff)
}

/// `[{"key": .., "value": ..}]` request layout
pub fn to_api(tags: &Tags) -> serde_json::Value {
    serde_json::Value::Array(
        tags.iter()
            .map(|(k, v)| serde_json::json!({ "key": k, "value": v }))
            .collect(),
    )
}

/// Parse the `[{"key": .., "value": ..}]` response layout
pub fn from_api(list: &serde_json::Value) -> Tags {
    list.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let key = item.get("key")?.as_str()?;
                    let value = item.get("value").and_then(|v| v.as_str()).unwrap_or_default();
                    Some((key.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelSignal;
    use crate::timeouts::Operation;
    use std::sync::Mutex;
    use std::time::Duration;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(String, Tags)>>,
        busy_once: Mutex<bool>,
        fail_create: bool,
    }

    #[async_trait]
    impl TagClient for Recording {
        async fn batch_delete(&self, _id: &str, tags: &Tags) -> Result<(), ApiError> {
            self.calls.lock().unwrap().push(("delete".into(), tags.clone()));
            Ok(())
        }

        async fn batch_create(&self, _id: &str, tags: &Tags) -> Result<(), ApiError> {
            if self.fail_create {
                return Err(ApiError::http(400, r#"{"error_code":"TMS.0002","error_msg":"bad tag"}"#));
            }
            let mut busy = self.busy_once.lock().unwrap();
            if *busy {
                *busy = false;
                return Err(ApiError::http(429, ""));
            }
            self.calls.lock().unwrap().push(("create".into(), tags.clone()));
            Ok(())
        }
    }

    fn ctx() -> OperationContext {
        OperationContext::new(Operation::Update, Duration::from_secs(600), CancelSignal::never())
    }

    #[test]
    fn changed_value_is_delete_plus_create() {
        let diff = TagDiff::compute(
            &tags(&[("env", "dev"), ("team", "a")]),
            &tags(&[("env", "prod"), ("team", "a"), ("owner", "x")]),
        );
        assert_eq!(diff.to_delete, tags(&[("env", "dev")]));
        assert_eq!(diff.to_create, tags(&[("env", "prod"), ("owner", "x")]));
    }

    #[test]
    fn identical_tags_produce_empty_diff() {
        let t = tags(&[("env", "dev")]);
        assert!(TagDiff::compute(&t, &t).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deletes_before_creating_and_retries() {
        let client = Recording {
            busy_once: Mutex::new(true),
            ..Default::default()
        };
        reconcile(
            &ctx(),
            &ServiceRules::new("dcs"),
            &client,
            "i-1",
            &tags(&[("env", "dev")]),
            &tags(&[("env", "prod")]),
        )
        .await
        .unwrap();
        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "delete");
        assert_eq!(calls[1].0, "create");
    }

    #[tokio::test]
    async fn failed_create_after_delete_is_surfaced() {
        let client = Recording {
            fail_create: true,
            ..Default::default()
        };
        let err = reconcile(
            &ctx(),
            &ServiceRules::new("dcs"),
            &client,
            "i-1",
            &tags(&[("env", "dev")]),
            &tags(&[("env", "prod")]),
        )
        .await
        .unwrap_err();
        assert!(err.message.contains("creating tags"));
        assert_eq!(err.code.as_deref(), Some("TMS.0002"));
        assert_eq!(client.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn api_layout_round_trip() {
        let t = tags(&[("a", "1"), ("b", "")]);
        assert_eq!(from_api(&to_api(&t)), t);
    }
}
