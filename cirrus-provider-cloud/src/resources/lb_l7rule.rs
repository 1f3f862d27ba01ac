//! Forwarding rule of an L7 policy
//!
//! A rule change is only accepted while the whole chain above it (load
//! balancer, listener, policy) is `ACTIVE`. Each mutation waits down the
//! chain first and back up it afterwards.

use std::time::Duration;

use async_trait::async_trait;
use cirrus_core::context::OperationContext;
use cirrus_core::error::{ProviderError, ProviderResult};
use cirrus_core::importer::ImportFormat;
use cirrus_core::provider::{ResourceDefinition, ResourceHandler};
use cirrus_core::resource::ResourceData;
use cirrus_core::retry::{RetryConf, RetryOutcome};
use cirrus_core::schema::{FieldDescriptor, FieldType, ResourceSchema, normalize, types};
use cirrus_core::waiter::{DELETED, StateChangeConf};
use serde_json::json;

use super::lb::{self, PolicyChain};
use super::{compact, observe, region_field, set_str, str_at};
use crate::client::ServiceClient;
use crate::registry;
use crate::rules;

pub const RESOURCE_TYPE: &str = "lb_l7rule";

const UPDATABLE: &[&str] = &["compare_type", "value", "key", "invert"];

pub fn definition() -> ResourceDefinition {
    ResourceDefinition::new(schema(), L7Rule).with_importer(ImportFormat::new(&["l7policy_id", "id"]))
}

pub fn schema() -> ResourceSchema {
    let string = |name: &str| FieldDescriptor::new(name, FieldType::String);

    ResourceSchema::new(RESOURCE_TYPE)
        .with_description("Host or path matching rule of an L7 policy")
        .field(region_field())
        .field(string("l7policy_id").required().force_new())
        .field(
            FieldDescriptor::new("type", types::string_enum(&["HOST_NAME", "PATH"]))
                .required()
                .force_new()
                .normalize_with(normalize::uppercase),
        )
        .field(
            FieldDescriptor::new("compare_type", types::string_enum(&["EQUAL_TO", "REGEX", "STARTS_WITH"]))
                .required()
                .normalize_with(normalize::uppercase),
        )
        .field(string("value").required().validate_with(validate_rule_value))
        .field(string("key").optional())
        .field(FieldDescriptor::new("invert", FieldType::Bool).optional().with_default(false))
        .field(string("listener_id").computed())
        .field(string("provisioning_status").computed())
}

fn validate_rule_value(value: &cirrus_core::resource::Value) -> Result<(), String> {
    match value.as_str() {
        Some(s) if s.len() > 128 => Err(format!("must be at most 128 characters, got {}", s.len())),
        Some(s) if s.chars().any(char::is_whitespace) => Err("must not contain whitespace".to_string()),
        _ => Ok(()),
    }
}

fn rules_path(policy_id: &str) -> String {
    format!("elb/l7policies/{}/rules", policy_id)
}

fn rule_path(policy_id: &str, rule_id: &str) -> String {
    format!("elb/l7policies/{}/rules/{}", policy_id, rule_id)
}

struct RuleApi {
    client: std::sync::Arc<ServiceClient>,
    chain: PolicyChain,
}

impl RuleApi {
    async fn connect(ctx: &OperationContext, data: &ResourceData) -> ProviderResult<Self> {
        let client = registry::client(ctx, "elb", data.get_str("region")).await?;
        let policy_id = data.get_str("l7policy_id").unwrap_or_default();
        let chain = PolicyChain::resolve(ctx, &client, policy_id).await?;
        Ok(Self { client, chain })
    }

    /// Down the chain, `op` under retry, back up the chain
    async fn gated<F, Fut>(
        &self,
        ctx: &OperationContext,
        op: F,
    ) -> ProviderResult<RetryOutcome<serde_json::Value>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<serde_json::Value, cirrus_core::error::ApiError>>,
    {
        self.chain.wait_down(ctx, &self.client).await?;
        let outcome = RetryConf::new(rules::elb())
            .with_poll_interval(Duration::from_secs(3))
            .run(ctx, op)
            .await?;
        self.chain.wait_up(ctx, &self.client).await?;
        Ok(outcome)
    }
}

pub struct L7Rule;

#[async_trait]
impl ResourceHandler for L7Rule {
    async fn create(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let api = RuleApi::connect(ctx, data).await?;
        let path = rules_path(&api.chain.policy_id);
        let body = json!({"rule": compact(json!({
            "type": data.get_str("type"),
            "compare_type": data.get_str("compare_type"),
            "value": data.get_str("value"),
            "key": data.get_str("key"),
            "invert": data.get_bool("invert"),
        }))});

        let response = api
            .gated(ctx, || api.client.post(&path, body.clone()))
            .await?
            .into_done()
            .unwrap_or_default();
        let id = str_at(&response, "/rule/id");
        if id.is_empty() {
            return Err(ProviderError::new("create response carried no rule id"));
        }
        data.set_id(id);
        Ok(())
    }

    async fn read(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let client = registry::client(ctx, "elb", data.get_str("region")).await?;
        let policy_id = data.get_str("l7policy_id").unwrap_or_default().to_string();
        let path = rule_path(&policy_id, data.id_or_empty());
        let body = RetryConf::new(rules::elb())
            .call(ctx, || client.get(&path))
            .await?;

        for field in ["type", "compare_type", "value", "key", "provisioning_status"] {
            set_str(data, field, &body, &format!("/rule/{}", field));
        }
        if let Some(invert) = body.pointer("/rule/invert").and_then(|v| v.as_bool()) {
            data.set("invert", invert);
        }

        // listener_id is informational; the rule itself was found
        let policy_path = format!("elb/l7policies/{}", policy_id);
        match ctx.run(client.get(&policy_path)).await? {
            Ok(policy) => set_str(data, "listener_id", &policy, "/l7policy/listener_id"),
            Err(e) => tracing::warn!(policy = %policy_id, error = %e, "could not read listener_id of L7 policy"),
        }
        Ok(())
    }

    async fn update(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let mut rule = serde_json::Map::new();
        for field in UPDATABLE {
            if data.has_change(field) {
                rule.insert(field.to_string(), super::json_of(data, field));
            }
        }
        if rule.is_empty() {
            return Ok(());
        }
        // The API wants the compare type with every value change
        if !rule.contains_key("compare_type") {
            rule.insert("compare_type".to_string(), json!(data.get_str("compare_type")));
        }

        let api = RuleApi::connect(ctx, data).await?;
        let path = rule_path(&api.chain.policy_id, data.id_or_empty());
        let body = json!({ "rule": rule });
        api.gated(ctx, || api.client.put(&path, body.clone())).await?;
        Ok(())
    }

    async fn delete(&self, ctx: &OperationContext, data: &ResourceData) -> ProviderResult<()> {
        let api = RuleApi::connect(ctx, data).await?;
        let path = rule_path(&api.chain.policy_id, data.id_or_empty());

        if let RetryOutcome::Absent = api.gated(ctx, || api.client.delete(&path)).await? {
            return Ok(());
        }

        let (client, path) = (&api.client, path.as_str());
        StateChangeConf::new(format!("L7 rule {}", data.id_or_empty()), &[lb::ACTIVE, "PENDING_DELETE"], &[DELETED])
            .wait(ctx, || async move {
                let result = client.get(path).await;
                observe(rules::elb(), result, |body| match str_at(body, "/rule/provisioning_status") {
                    s if s.is_empty() => lb::ACTIVE.to_string(),
                    s => s,
                })
            })
            .await
            .map_err(ProviderError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::resource::Value;

    #[test]
    fn rule_values_are_bounded() {
        assert!(validate_rule_value(&Value::from("/api")).is_ok());
        assert!(validate_rule_value(&Value::from("a b")).is_err());
        assert!(validate_rule_value(&Value::from("x".repeat(129))).is_err());
    }

    #[test]
    fn rule_paths_nest_under_the_policy() {
        assert_eq!(rules_path("p1"), "elb/l7policies/p1/rules");
        assert_eq!(rule_path("p1", "r1"), "elb/l7policies/p1/rules/r1");
    }

    #[test]
    fn import_takes_policy_and_rule() {
        let def = definition();
        let parts = def.importer.unwrap().parse("p1/r1").unwrap();
        assert_eq!(
            parts,
            vec![
                ("l7policy_id".to_string(), "p1".to_string()),
                ("id".to_string(), "r1".to_string())
            ]
        );
    }
}
