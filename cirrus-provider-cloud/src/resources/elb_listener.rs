//! Load balancer listener
//!
//! Every mutation waits for the parent load balancer to be `ACTIVE` first and
//! again afterwards. `transparent_client_ip_enable` only exists on the v3
//! API; see [`v3_client`].

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use cirrus_core::context::OperationContext;
use cirrus_core::decompose::{GroupUpdater, UpdatePlan};
use cirrus_core::error::{ApiError, ProviderError, ProviderResult};
use cirrus_core::importer::ImportFormat;
use cirrus_core::provider::{ResourceDefinition, ResourceHandler};
use cirrus_core::resource::{ResourceData, Value};
use cirrus_core::retry::{RetryConf, RetryOutcome};
use cirrus_core::schema::{FieldDescriptor, FieldType, ResourceSchema, types};
use cirrus_core::tags::{self, TagClient, Tags};
use cirrus_core::waiter::{DELETED, StateChangeConf};
use serde_json::json;

use super::lb;
use super::{compact, json_of, observe, region_field, set_str, str_at, strings_at};
use crate::client::ServiceClient;
use crate::registry::{self, ClientRegistry};
use crate::rules;

pub const RESOURCE_TYPE: &str = "elb_listener";

const BASIC_FIELDS: &[&str] = &[
    "name",
    "description",
    "connection_limit",
    "http2_enable",
    "default_pool_id",
    "default_tls_container_ref",
    "sni_container_refs",
];

pub fn definition() -> ResourceDefinition {
    ResourceDefinition::new(schema(), ElbListener).with_importer(ImportFormat::id_only())
}

pub fn schema() -> ResourceSchema {
    let string = |name: &str| FieldDescriptor::new(name, FieldType::String);

    ResourceSchema::new(RESOURCE_TYPE)
        .with_description("Listener of a shared load balancer")
        .field(region_field())
        .field(string("loadbalancer_id").required().force_new())
        .field(
            FieldDescriptor::new(
                "protocol",
                types::string_enum(&["TCP", "UDP", "HTTP", "TERMINATED_HTTPS"]),
            )
            .required()
            .force_new(),
        )
        .field(FieldDescriptor::new("protocol_port", types::port()).required().force_new())
        .field(string("name").optional_computed())
        .field(string("description").optional())
        .field(FieldDescriptor::new("connection_limit", FieldType::Int).optional_computed())
        .field(FieldDescriptor::new("http2_enable", FieldType::Bool).optional_computed())
        .field(string("default_pool_id").optional_computed())
        .field(string("default_tls_container_ref").optional())
        .field(FieldDescriptor::new("sni_container_refs", FieldType::set_of(FieldType::String)).optional())
        .field(
            FieldDescriptor::new("transparent_client_ip_enable", FieldType::Bool)
                .optional_computed()
                .with_description("Pass the client address through to the backend"),
        )
        .with_tags()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    Basic,
    TransparentIp,
    Tags,
}

static UPDATE_PLAN: LazyLock<UpdatePlan<Group>> = LazyLock::new(|| {
    UpdatePlan::new()
        .group(Group::Basic, BASIC_FIELDS)
        .group(Group::TransparentIp, &["transparent_client_ip_enable"])
        .quiet_group(Group::Tags, &["tags"])
});

/// Client for the v3 listener API.
///
/// The v2 listener does not carry `transparent_client_ip_enable`; the v3 API
/// does, on the same listener ID. The v3 endpoint is derived from the v2 one
/// by rewriting its version segment, so an `elb` endpoint override that does
/// not follow the `/v2/{project_id}` layout breaks this field only.
pub fn v3_client(
    ctx: &OperationContext,
    v2: &ServiceClient,
    region: Option<&str>,
) -> ProviderResult<ServiceClient> {
    let registry = ctx.meta::<ClientRegistry>()?;
    registry.derive_v3(v2, region)
}

struct ListenerApi {
    client: Arc<ServiceClient>,
    loadbalancer_id: String,
}

impl ListenerApi {
    async fn connect(ctx: &OperationContext, data: &ResourceData) -> ProviderResult<Self> {
        let client = registry::client(ctx, "elb", data.get_str("region")).await?;
        Ok(Self {
            client,
            loadbalancer_id: data.get_str("loadbalancer_id").unwrap_or_default().to_string(),
        })
    }

    fn lb_stable(&self) -> StateChangeConf {
        lb::stable_conf(format!("load balancer {}", self.loadbalancer_id))
    }

    /// Run `op` once the load balancer is `ACTIVE`, then wait for it to
    /// settle again
    async fn gated<F, Fut>(
        &self,
        ctx: &OperationContext,
        op: F,
    ) -> ProviderResult<RetryOutcome<serde_json::Value>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<serde_json::Value, ApiError>>,
    {
        let outcome = RetryConf::new(rules::elb())
            .run_when_stable(
                ctx,
                &self.lb_stable(),
                || lb::refresh_loadbalancer(&self.client, &self.loadbalancer_id),
                op,
            )
            .await?;
        lb::wait_loadbalancer(ctx, &self.client, &self.loadbalancer_id).await?;
        Ok(outcome)
    }

    async fn set_transparent_ip(
        &self,
        ctx: &OperationContext,
        data: &ResourceData,
    ) -> ProviderResult<()> {
        let v3 = v3_client(ctx, &self.client, data.get_str("region"))?;
        let path = format!("elb/listeners/{}", data.id_or_empty());
        let body = json!({"listener": {"transparent_client_ip_enable": data.get_bool("transparent_client_ip_enable")}});
        self.gated(ctx, || v3.put(&path, body.clone())).await?;
        Ok(())
    }
}

#[async_trait]
impl TagClient for ListenerApi {
    async fn batch_delete(&self, resource_id: &str, tags: &Tags) -> Result<(), ApiError> {
        self.client
            .post(
                &format!("listeners/{}/tags/action", resource_id),
                json!({"action": "delete", "tags": tags::to_api(tags)}),
            )
            .await
            .map(|_| ())
    }

    async fn batch_create(&self, resource_id: &str, tags: &Tags) -> Result<(), ApiError> {
        self.client
            .post(
                &format!("listeners/{}/tags/action", resource_id),
                json!({"action": "create", "tags": tags::to_api(tags)}),
            )
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl GroupUpdater<Group> for ListenerApi {
    async fn apply(
        &self,
        ctx: &OperationContext,
        group: Group,
        data: &ResourceData,
    ) -> ProviderResult<()> {
        let id = data.id_or_empty();
        match group {
            Group::Basic => {
                let mut listener = serde_json::Map::new();
                for field in BASIC_FIELDS {
                    if data.has_change(field) {
                        listener.insert(field.to_string(), json_of(data, field));
                    }
                }
                let body = json!({ "listener": listener });
                let path = format!("elb/listeners/{}", id);
                self.gated(ctx, || self.client.put(&path, body.clone())).await?;
                Ok(())
            }
            Group::TransparentIp => self.set_transparent_ip(ctx, data).await,
            Group::Tags => {
                tags::reconcile(
                    ctx,
                    rules::elb(),
                    self,
                    id,
                    &data.prior_string_map("tags"),
                    &data.get_string_map("tags"),
                )
                .await?;
                Ok(())
            }
        }
    }
}

fn create_body(data: &ResourceData) -> serde_json::Value {
    let mut listener = compact(json!({
        "loadbalancer_id": data.get_str("loadbalancer_id"),
        "protocol": data.get_str("protocol"),
        "protocol_port": data.get_int("protocol_port"),
        "name": data.get_str("name"),
        "description": data.get_str("description"),
        "connection_limit": data.get_int("connection_limit"),
        "default_pool_id": data.get_str("default_pool_id"),
        "default_tls_container_ref": data.get_str("default_tls_container_ref"),
    }));
    if let Some(http2) = data.get("http2_enable").and_then(Value::as_bool) {
        listener["http2_enable"] = json!(http2);
    }
    let sni = data.get_strings("sni_container_refs");
    if !sni.is_empty() {
        listener["sni_container_refs"] = json!(sni);
    }
    let tags = data.get_string_map("tags");
    if !tags.is_empty() {
        listener["tags"] = tags::to_api(&tags);
    }
    json!({ "listener": listener })
}

pub struct ElbListener;

#[async_trait]
impl ResourceHandler for ElbListener {
    async fn create(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let api = ListenerApi::connect(ctx, data).await?;
        let body = create_body(data);
        let response = api
            .gated(ctx, || api.client.post("elb/listeners", body.clone()))
            .await?
            .into_done()
            .unwrap_or_default();

        let id = str_at(&response, "/listener/id");
        if id.is_empty() {
            return Err(ProviderError::new("create response carried no listener id"));
        }
        data.set_id(&id);
        tracing::info!(listener = %id, loadbalancer = %api.loadbalancer_id, "listener created");

        if data.get_bool("transparent_client_ip_enable") {
            api.set_transparent_ip(ctx, data).await?;
        }
        Ok(())
    }

    async fn read(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let api = ListenerApi::connect(ctx, data).await?;
        let id = data.id_or_empty().to_string();
        let path = format!("elb/listeners/{}", id);
        let body = RetryConf::new(rules::elb())
            .call(ctx, || api.client.get(&path))
            .await?;

        for field in ["name", "description", "protocol", "default_pool_id", "default_tls_container_ref"] {
            set_str(data, field, &body, &format!("/listener/{}", field));
        }
        if let Some(lb_id) = lb::loadbalancer_of(&body) {
            data.set("loadbalancer_id", lb_id);
        }
        if let Some(port) = body.pointer("/listener/protocol_port").and_then(|v| v.as_i64()) {
            data.set("protocol_port", port);
        }
        if let Some(limit) = body.pointer("/listener/connection_limit").and_then(|v| v.as_i64()) {
            data.set("connection_limit", limit);
        }
        if let Some(http2) = body.pointer("/listener/http2_enable").and_then(|v| v.as_bool()) {
            data.set("http2_enable", http2);
        }
        let sni = strings_at(&body, "/listener/sni_container_refs");
        data.set(
            "sni_container_refs",
            if sni.is_empty() {
                Value::Null
            } else {
                Value::set(sni.into_iter().map(Value::from))
            },
        );
        let tags = tags::from_api(&body["listener"]["tags"]);
        data.set("tags", if tags.is_empty() { Value::Null } else { Value::string_map(tags) });

        let v3 = v3_client(ctx, &api.client, data.get_str("region"))?;
        match ctx.run(v3.get(&path)).await? {
            Ok(v3_body) => {
                if let Some(enabled) = v3_body
                    .pointer("/listener/transparent_client_ip_enable")
                    .and_then(|v| v.as_bool())
                {
                    data.set("transparent_client_ip_enable", enabled);
                }
            }
            // The v3 view is best effort; the listener itself was found
            Err(e) => tracing::warn!(listener = %id, error = %e, "could not read transparent_client_ip_enable"),
        }
        Ok(())
    }

    async fn update(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let api = ListenerApi::connect(ctx, data).await?;
        UPDATE_PLAN.run(ctx, data, &api).await?;
        Ok(())
    }

    async fn delete(&self, ctx: &OperationContext, data: &ResourceData) -> ProviderResult<()> {
        let api = ListenerApi::connect(ctx, data).await?;
        let id = data.id_or_empty();
        let path = format!("elb/listeners/{}", id);

        if let RetryOutcome::Absent = api.gated(ctx, || api.client.delete(&path)).await? {
            return Ok(());
        }

        let (client, path) = (&api.client, path.as_str());
        StateChangeConf::new(format!("listener {}", id), &[lb::ACTIVE, "PENDING_DELETE"], &[DELETED])
            .wait(ctx, || async move {
                let result = client.get(path).await;
                observe(rules::elb(), result, |_| lb::ACTIVE.to_string())
            })
            .await
            .map_err(ProviderError::from)?;
        Ok(())
    }
}
