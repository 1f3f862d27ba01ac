//! Enterprise router route-table association
//!
//! Associations have no GET-by-ID; they are found by listing the route
//! table's associations and filtering on the ID. Imported as
//! `<instance_id>/<route_table_id>/<id>`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cirrus_core::context::OperationContext;
use cirrus_core::error::{ProviderError, ProviderResult};
use cirrus_core::importer::ImportFormat;
use cirrus_core::provider::{ResourceDefinition, ResourceHandler};
use cirrus_core::resource::ResourceData;
use cirrus_core::retry::{RetryConf, RetryOutcome};
use cirrus_core::schema::{FieldDescriptor, FieldType, ResourceSchema};
use cirrus_core::timeouts::Timeouts;
use cirrus_core::waiter::{DELETED, Observation, StateChangeConf};
use serde_json::json;

use super::{observe, region_field, set_str, str_at};
use crate::client::ServiceClient;
use crate::registry;
use crate::rules;

pub const RESOURCE_TYPE: &str = "er_association";

pub fn definition() -> ResourceDefinition {
    ResourceDefinition::new(schema(), ErAssociation)
        .with_timeouts(
            Timeouts::default()
                .with_create(Duration::from_secs(5 * 60))
                .with_delete(Duration::from_secs(5 * 60)),
        )
        .with_importer(ImportFormat::new(&["instance_id", "route_table_id", "id"]))
}

pub fn schema() -> ResourceSchema {
    let string = |name: &str| FieldDescriptor::new(name, FieldType::String);

    ResourceSchema::new(RESOURCE_TYPE)
        .with_description("Association between an enterprise router attachment and a route table")
        .field(region_field())
        .field(string("instance_id").required().force_new())
        .field(string("route_table_id").required().force_new())
        .field(string("attachment_id").required().force_new())
        .field(string("attachment_type").computed())
        .field(string("resource_id").computed())
        .field(string("route_policy_id").computed())
        .field(string("status").computed())
        .field(string("created_at").computed())
        .field(string("updated_at").computed())
        .with_timeouts()
}

struct AssociationApi {
    client: Arc<ServiceClient>,
    base: String,
}

impl AssociationApi {
    async fn connect(ctx: &OperationContext, data: &ResourceData) -> ProviderResult<Self> {
        let client = registry::client(ctx, "er", data.get_str("region")).await?;
        let base = format!(
            "enterprise-router/{}/route-tables/{}",
            data.get_str("instance_id").unwrap_or_default(),
            data.get_str("route_table_id").unwrap_or_default()
        );
        Ok(Self { client, base })
    }

    /// List and pick `id`; `Absent` when the list no longer has it
    async fn find(&self, id: &str) -> ProviderResult<Observation<serde_json::Value>> {
        let result = self.client.get(&format!("{}/associations", self.base)).await;
        let list = match observe(rules::er(), result, |_| String::new())? {
            Observation::Found { payload, .. } => payload,
            Observation::Absent => return Ok(Observation::Absent),
        };
        Ok(match pick(&list, id) {
            Some(association) => {
                let state = str_at(&association, "/state");
                Observation::found(association, state)
            }
            None => Observation::Absent,
        })
    }

    async fn post(
        &self,
        ctx: &OperationContext,
        action: &str,
        attachment_id: &str,
    ) -> ProviderResult<RetryOutcome<serde_json::Value>> {
        let path = format!("{}/{}", self.base, action);
        let body = json!({"attachment_id": attachment_id});
        RetryConf::new(rules::er())
            .run(ctx, || self.client.post(&path, body.clone()))
            .await
    }
}

/// Association with `id` in a list response
pub fn pick(list: &serde_json::Value, id: &str) -> Option<serde_json::Value> {
    list.get("associations")
        .and_then(|a| a.as_array())?
        .iter()
        .find(|a| a.get("id").and_then(|v| v.as_str()) == Some(id))
        .cloned()
}

pub struct ErAssociation;

#[async_trait]
impl ResourceHandler for ErAssociation {
    async fn create(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let api = AssociationApi::connect(ctx, data).await?;
        let attachment_id = data.get_str("attachment_id").unwrap_or_default().to_string();
        let response = api
            .post(ctx, "associate", &attachment_id)
            .await?
            .into_done()
            .unwrap_or_default();
        let id = str_at(&response, "/association/id");
        if id.is_empty() {
            return Err(ProviderError::new("associate response carried no association id"));
        }
        data.set_id(&id);

        // The list lags the associate call by a few seconds
        StateChangeConf::new(format!("route table association {}", id), &["pending"], &["available"])
            .with_delay(Duration::from_secs(2))
            .with_not_found_checks(3)
            .wait(ctx, || api.find(&id))
            .await?;
        Ok(())
    }

    async fn read(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let api = AssociationApi::connect(ctx, data).await?;
        let id = data.id_or_empty().to_string();
        let association = match ctx.run(api.find(&id)).await?? {
            Observation::Found { payload, .. } => payload,
            Observation::Absent => {
                return Err(ProviderError::absent(format!("route table association {} not found", id)));
            }
        };

        for (attr, member) in [
            ("route_table_id", "/route_table_id"),
            ("attachment_id", "/attachment_id"),
            ("attachment_type", "/resource_type"),
            ("resource_id", "/resource_id"),
            ("route_policy_id", "/route_policy/export_policy_id"),
            ("status", "/state"),
            ("created_at", "/created_at"),
            ("updated_at", "/updated_at"),
        ] {
            set_str(data, attr, &association, member);
        }
        Ok(())
    }

    async fn update(
        &self,
        _ctx: &OperationContext,
        _data: &mut ResourceData,
    ) -> ProviderResult<()> {
        // Every input is force-new
        Ok(())
    }

    async fn delete(&self, ctx: &OperationContext, data: &ResourceData) -> ProviderResult<()> {
        let api = AssociationApi::connect(ctx, data).await?;
        let id = data.id_or_empty();
        let attachment_id = data.get_str("attachment_id").unwrap_or_default();

        if let RetryOutcome::Absent = api.post(ctx, "disassociate", attachment_id).await? {
            return Ok(());
        }

        StateChangeConf::new(
            format!("route table association {}", id),
            &["available", "deleting"],
            &[DELETED],
        )
        .with_delay(Duration::from_secs(2))
        .wait(ctx, || api.find(id))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_by_id() {
        let list = json!({"associations": [
            {"id": "a1", "state": "available"},
            {"id": "a2", "state": "pending"},
        ]});
        assert_eq!(pick(&list, "a2").unwrap()["state"], "pending");
        assert!(pick(&list, "a3").is_none());
        assert!(pick(&json!({}), "a1").is_none());
    }

    #[test]
    fn import_has_three_parts() {
        let importer = definition().importer.unwrap();
        assert_eq!(importer.template(), "<instance_id>/<route_table_id>/<id>");
        assert!(importer.parse("i-abc/rt-def").is_err());
    }
}
