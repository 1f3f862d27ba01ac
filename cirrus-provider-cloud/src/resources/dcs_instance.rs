//! Distributed cache instance
//!
//! Creation is asynchronous (`CREATING` -> `RUNNING`), and every mutation has
//! its own endpoint. Updates run as ordered groups: basic metadata, password,
//! resize, tags, whitelist, parameters, SSL. The password change precedes the
//! resize because a resize restarts the instance; SSL goes last for the same
//! reason.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use cirrus_core::context::OperationContext;
use cirrus_core::decompose::{GroupUpdater, UpdatePlan};
use cirrus_core::deleter::{self, DeleteOutcome, NoDependents};
use cirrus_core::error::{ApiError, ProviderError, ProviderResult, Verdict};
use cirrus_core::importer::ImportFormat;
use cirrus_core::provider::{ResourceDefinition, ResourceHandler};
use cirrus_core::resource::{ResourceData, Value};
use cirrus_core::retry::RetryConf;
use cirrus_core::schema::{FieldDescriptor, FieldType, ResourceSchema, types};
use cirrus_core::tags::{self, TagClient, Tags};
use cirrus_core::timeouts::Timeouts;
use cirrus_core::waiter::{DELETED, Observation, StateChangeConf};
use regex::Regex;
use serde_json::json;

use super::{compact, json_of, observe, region_field, set_str, str_at, strings_at};
use crate::client::ServiceClient;
use crate::registry::{self, ClientRegistry};
use crate::rules;

pub const RESOURCE_TYPE: &str = "dcs_instance";

const STABLE: &[&str] = &["RUNNING", "ACTIVE"];
const CREATE_PENDING: &[&str] = &["CREATING"];
const UPDATE_PENDING: &[&str] = &["EXTENDING", "RESTARTING", "UPGRADING", "CREATING"];
const DELETE_PENDING: &[&str] = &[
    "RUNNING",
    "ACTIVE",
    "DELETING",
    "ERROR",
    "RESTARTING",
    "EXTENDING",
    "FROZEN",
];

/// Placeholder the API echoes for an instance without a security group
const UNSET_SECURITY_GROUP: &str = "securityGroupId";

pub fn definition() -> ResourceDefinition {
    ResourceDefinition::new(schema(), DcsInstance)
        .with_timeouts(
            Timeouts::default()
                .with_create(Duration::from_secs(120 * 60))
                .with_update(Duration::from_secs(120 * 60))
                .with_delete(Duration::from_secs(15 * 60)),
        )
        .with_importer(ImportFormat::id_only())
}

pub fn schema() -> ResourceSchema {
    let string = |name: &str| FieldDescriptor::new(name, FieldType::String);
    let strings = |name: &str| FieldDescriptor::new(name, FieldType::list_of(FieldType::String));

    ResourceSchema::new(RESOURCE_TYPE)
        .with_description("Distributed cache instance")
        .field(region_field())
        .field(string("name").required())
        .field(
            FieldDescriptor::new("engine", types::string_enum(&["Redis", "Memcached"]))
                .required()
                .force_new(),
        )
        .field(string("engine_version").required().force_new())
        .field(string("flavor").required().with_description("Flavor spec code"))
        .field(FieldDescriptor::new("capacity", FieldType::Float).required().with_description("Cache size in GB"))
        .field(string("vpc_id").required().force_new())
        .field(string("subnet_id").required().force_new())
        .field(string("security_group_id").optional())
        .field(strings("availability_zones").required().force_new())
        .field(
            strings("reserved_ips")
                .optional()
                .with_description("Replica IPs kept when shrinking a cluster's replica count"),
        )
        .field(string("password").optional().sensitive())
        .field(string("description").optional())
        .field(string("maintain_begin").optional_computed())
        .field(string("maintain_end").optional_computed())
        .field(FieldDescriptor::new("port", types::port()).optional_computed().force_new())
        .field(FieldDescriptor::new("enable_whitelist", FieldType::Bool).optional_computed())
        .field(
            FieldDescriptor::new(
                "whitelists",
                FieldType::set_of(FieldType::Block(vec![
                    string("group_name").required(),
                    strings("ip_address").required(),
                ])),
            )
            .optional(),
        )
        .field(
            FieldDescriptor::new("parameters", FieldType::map_of(FieldType::String))
                .optional()
                .with_description("Configuration parameters to override"),
        )
        .field(FieldDescriptor::new("ssl_enable", FieldType::Bool).optional_computed())
        .field(string("status").computed())
        .field(string("ip").computed())
        .field(string("domain_name").computed())
        .with_tags()
        .with_timeouts()
}

/// Update groups in API-imposed order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    Basic,
    Password,
    Resize,
    Tags,
    Whitelist,
    Parameters,
    Ssl,
}

static UPDATE_PLAN: LazyLock<UpdatePlan<Group>> = LazyLock::new(|| {
    UpdatePlan::new()
        .group(
            Group::Basic,
            &["name", "description", "maintain_begin", "maintain_end", "security_group_id"],
        )
        .group(Group::Password, &["password"])
        .group(Group::Resize, &["flavor", "capacity"])
        .quiet_group(Group::Tags, &["tags"])
        .group(Group::Whitelist, &["enable_whitelist", "whitelists"])
        .group(Group::Parameters, &["parameters"])
        .group(Group::Ssl, &["ssl_enable"])
});

/// Resize hint sent along with a flavor change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    InstanceType,
    CreateReplication,
    DeleteReplication,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::InstanceType => "instanceType",
            ChangeType::CreateReplication => "createReplication",
            ChangeType::DeleteReplication => "deleteReplication",
        }
    }
}

/// Topology encoded in a flavor spec code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlavorShape {
    pub replicas: u32,
    pub cluster: bool,
}

static REPLICA_TOKEN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?:^|[._-])r(\d+)(?:$|[._-])").ok());

impl FlavorShape {
    /// `redis.ha.xu1.large.r2.4` has two replicas; `-ha` and `-single` codes
    /// imply two and one
    pub fn of(flavor: &str) -> Self {
        let lower = flavor.to_ascii_lowercase();
        let tokens: Vec<&str> = lower.split(['.', '-', '_']).collect();
        let explicit = REPLICA_TOKEN
            .as_ref()
            .and_then(|re| re.captures(&lower))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok());
        let replicas = explicit.unwrap_or_else(|| {
            if tokens.iter().any(|t| matches!(*t, "ha" | "master" | "standby")) {
                2
            } else {
                1
            }
        });
        Self {
            replicas,
            cluster: tokens.contains(&"cluster"),
        }
    }
}

/// Hint for resizing from `old` to `new`. `None` when only the capacity moves.
pub fn change_type(old: &str, new: &str) -> Option<ChangeType> {
    if old == new {
        return None;
    }
    let (before, after) = (FlavorShape::of(old), FlavorShape::of(new));
    Some(match after.replicas.cmp(&before.replicas) {
        std::cmp::Ordering::Greater => ChangeType::CreateReplication,
        std::cmp::Ordering::Less => ChangeType::DeleteReplication,
        std::cmp::Ordering::Equal => ChangeType::InstanceType,
    })
}

pub struct DcsInstance;

/// API calls of one instance, shared by the handler and the group updater
struct InstanceApi {
    client: Arc<ServiceClient>,
}

impl InstanceApi {
    async fn connect(ctx: &OperationContext, data: &ResourceData) -> ProviderResult<Self> {
        let client = registry::client(ctx, "dcs", data.get_str("region")).await?;
        Ok(Self { client })
    }

    fn retry(&self) -> RetryConf<'static> {
        RetryConf::new(rules::dcs())
    }

    async fn refresh(&self, id: &str) -> ProviderResult<Observation<serde_json::Value>> {
        let result = self.client.get(&format!("instances/{}", id)).await;
        observe(rules::dcs(), result, |body| str_at(body, "/status"))
    }

    async fn wait_stable(
        &self,
        ctx: &OperationContext,
        id: &str,
        pending: &[&str],
        continuous: u32,
    ) -> ProviderResult<()> {
        StateChangeConf::new(format!("cache instance {}", id), pending, STABLE)
            .with_delay(Duration::from_secs(5))
            .with_min_interval(Duration::from_secs(3))
            .with_continuous_target(continuous)
            .wait(ctx, || self.refresh(id))
            .await?;
        Ok(())
    }

    /// Sub-resource GET; a 404 means "nothing configured"
    async fn optional_get(
        &self,
        ctx: &OperationContext,
        path: &str,
    ) -> ProviderResult<Option<serde_json::Value>> {
        match ctx.run(self.client.get(path)).await? {
            Ok(body) => Ok(Some(body)),
            Err(e) => match rules::dcs().classify(&e) {
                Verdict::Absent => Ok(None),
                verdict => Err(ProviderError::from_verdict(&verdict, e)),
            },
        }
    }

    async fn put(
        &self,
        ctx: &OperationContext,
        path: &str,
        body: serde_json::Value,
    ) -> ProviderResult<()> {
        self.retry()
            .call(ctx, || self.client.put(path, body.clone()))
            .await?;
        Ok(())
    }

    async fn wait_whitelist(
        &self,
        ctx: &OperationContext,
        id: &str,
        enabled: bool,
    ) -> ProviderResult<()> {
        let (want, other) = if enabled { ("true", "false") } else { ("false", "true") };
        let path = format!("instances/{}/whitelist", id);
        let path = path.as_str();
        StateChangeConf::new(format!("whitelist of cache instance {}", id), &[other], &[want])
            .with_min_interval(Duration::from_secs(2))
            .wait(ctx, || async move {
                let result = self.client.get(path).await;
                observe(rules::dcs(), result, |body| {
                    body.get("enable_whitelist")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                        .to_string()
                })
            })
            .await?;
        Ok(())
    }

    fn resize_body(&self, data: &ResourceData) -> ProviderResult<serde_json::Value> {
        let old_flavor = data.prior("flavor").and_then(Value::as_str).unwrap_or_default();
        let new_flavor = data.get_str("flavor").unwrap_or_default();
        let mut body = json!({
            "spec_code": new_flavor,
            "new_capacity": data.get_float("capacity"),
        });

        let change = change_type(old_flavor, new_flavor);
        if let Some(change) = change {
            body["change_type"] = json!(change.as_str());
        }
        if change == Some(ChangeType::DeleteReplication) && FlavorShape::of(new_flavor).cluster {
            let reserved = data.get_strings("reserved_ips");
            let zones = data.get_strings("availability_zones");
            if reserved.is_empty() || zones.is_empty() {
                return Err(ProviderError::validation(
                    "reserved_ips and availability_zones are required to remove replicas from a cluster instance",
                ));
            }
            body["reserved_ip"] = json!(reserved);
            body["available_zones"] = json!(zones);
        }
        Ok(body)
    }
}

#[async_trait]
impl TagClient for InstanceApi {
    async fn batch_delete(&self, resource_id: &str, tags: &Tags) -> Result<(), ApiError> {
        self.client
            .post(
                &format!("instances/{}/tags/action", resource_id),
                json!({"action": "delete", "tags": tags::to_api(tags)}),
            )
            .await
            .map(|_| ())
    }

    async fn batch_create(&self, resource_id: &str, tags: &Tags) -> Result<(), ApiError> {
        self.client
            .post(
                &format!("instances/{}/tags/action", resource_id),
                json!({"action": "create", "tags": tags::to_api(tags)}),
            )
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl GroupUpdater<Group> for InstanceApi {
    async fn apply(
        &self,
        ctx: &OperationContext,
        group: Group,
        data: &ResourceData,
    ) -> ProviderResult<()> {
        let id = data.id_or_empty();
        match group {
            Group::Basic => {
                let mut body = serde_json::Map::new();
                for field in ["name", "description", "maintain_begin", "maintain_end", "security_group_id"] {
                    if data.has_change(field) {
                        let value = match json_of(data, field) {
                            serde_json::Value::Null => json!(""),
                            v => v,
                        };
                        body.insert(field.to_string(), value);
                    }
                }
                self.put(ctx, &format!("instances/{}", id), body.into()).await
            }
            Group::Password => {
                let old = data.prior("password").and_then(Value::as_str).unwrap_or_default();
                let body = json!({
                    "old_password": old,
                    "new_password": data.get_str("password").unwrap_or_default(),
                });
                self.put(ctx, &format!("instances/{}/password", id), body).await
            }
            Group::Resize => {
                let body = self.resize_body(data)?;
                let path = format!("instances/{}/resize", id);
                tracing::info!(instance = id, change_type = ?body.get("change_type"), "resizing cache instance");
                self.retry()
                    .call(ctx, || self.client.post(&path, body.clone()))
                    .await?;
                Ok(())
            }
            Group::Tags => {
                tags::reconcile(
                    ctx,
                    rules::dcs(),
                    self,
                    id,
                    &data.prior_string_map("tags"),
                    &data.get_string_map("tags"),
                )
                .await?;
                Ok(())
            }
            Group::Whitelist => {
                let enabled = data.get_bool("enable_whitelist");
                let groups = if enabled { whitelist_groups(data) } else { Vec::new() };
                let body = json!({"enable_whitelist": enabled, "whitelist": groups});
                self.put(ctx, &format!("instances/{}/whitelist", id), body).await
            }
            Group::Parameters => {
                let prior = data.prior_string_map("parameters");
                let changed: Vec<serde_json::Value> = data
                    .get_string_map("parameters")
                    .into_iter()
                    .filter(|(k, v)| prior.get(k) != Some(v))
                    .map(|(k, v)| json!({"param_name": k, "param_value": v}))
                    .collect();
                if changed.is_empty() {
                    return Ok(());
                }
                self.put(ctx, &format!("instances/{}/configs", id), json!({"redis_config": changed}))
                    .await
            }
            Group::Ssl => {
                let body = json!({"enabled": data.get_bool("ssl_enable")});
                self.put(ctx, &format!("instances/{}/ssl", id), body).await
            }
        }
    }

    async fn settle(
        &self,
        ctx: &OperationContext,
        group: Group,
        data: &ResourceData,
    ) -> ProviderResult<()> {
        let id = data.id_or_empty();
        match group {
            Group::Whitelist => self.wait_whitelist(ctx, id, data.get_bool("enable_whitelist")).await,
            Group::Tags => Ok(()),
            _ => self.wait_stable(ctx, id, UPDATE_PENDING, 1).await,
        }
    }
}

fn whitelist_groups(data: &ResourceData) -> Vec<serde_json::Value> {
    data.get("whitelists")
        .and_then(Value::as_items)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_entries)
        .map(|group| {
            json!({
                "group_name": group.get("group_name").map(Value::to_json),
                "ip_list": group.get("ip_address").map(Value::to_json),
            })
        })
        .collect()
}

fn create_body(data: &ResourceData) -> serde_json::Value {
    let security_group = data.get_str("security_group_id").unwrap_or_default();
    let mut body = compact(json!({
        "name": data.get_str("name"),
        "engine": data.get_str("engine"),
        "engine_version": data.get_str("engine_version"),
        "spec_code": data.get_str("flavor"),
        "capacity": data.get_float("capacity"),
        "vpc_id": data.get_str("vpc_id"),
        "subnet_id": data.get_str("subnet_id"),
        "security_group_id": security_group,
        "available_zones": json_of(data, "availability_zones"),
        "password": data.get_str("password"),
        "description": data.get_str("description"),
        "maintain_begin": data.get_str("maintain_begin"),
        "maintain_end": data.get_str("maintain_end"),
        "port": data.get_int("port"),
    }));
    let tags = data.get_string_map("tags");
    if !tags.is_empty() {
        body["tags"] = tags::to_api(&tags);
    }
    body
}

#[async_trait]
impl ResourceHandler for DcsInstance {
    async fn create(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let api = InstanceApi::connect(ctx, data).await?;
        let body = create_body(data);
        let response = api
            .retry()
            .call(ctx, || api.client.post("instances", body.clone()))
            .await?;

        let id = match str_at(&response, "/instance_id") {
            id if !id.is_empty() => id,
            _ => str_at(&response, "/instances/0/instance_id"),
        };
        if id.is_empty() {
            return Err(ProviderError::new("create response carried no instance_id"));
        }
        data.set_id(&id);
        tracing::info!(instance = %id, "cache instance requested");

        api.wait_stable(ctx, &id, CREATE_PENDING, 2).await?;

        // Settings the create call cannot carry
        if data.get_bool("enable_whitelist") {
            api.apply(ctx, Group::Whitelist, data).await?;
            api.settle(ctx, Group::Whitelist, data).await?;
        }
        if !data.get_string_map("parameters").is_empty() {
            api.apply(ctx, Group::Parameters, data).await?;
            api.settle(ctx, Group::Parameters, data).await?;
        }
        if data.get_bool("ssl_enable") {
            api.apply(ctx, Group::Ssl, data).await?;
            api.settle(ctx, Group::Ssl, data).await?;
        }
        Ok(())
    }

    async fn read(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let api = InstanceApi::connect(ctx, data).await?;
        let path = format!("instances/{}", data.id_or_empty());
        let id = data.id_or_empty().to_string();
        let body = api.retry().call(ctx, || api.client.get(&path)).await?;

        for (attr, member) in [
            ("name", "/name"),
            ("engine", "/engine"),
            ("engine_version", "/engine_version"),
            ("flavor", "/spec_code"),
            ("vpc_id", "/vpc_id"),
            ("subnet_id", "/subnet_id"),
            ("description", "/description"),
            ("maintain_begin", "/maintain_begin"),
            ("maintain_end", "/maintain_end"),
            ("status", "/status"),
            ("ip", "/ip"),
            ("domain_name", "/domain_name"),
        ] {
            set_str(data, attr, &body, member);
        }
        if let Some(capacity) = body.get("capacity").and_then(|v| v.as_f64()) {
            data.set("capacity", capacity);
        }
        if let Some(port) = body.get("port").and_then(|v| v.as_i64()) {
            data.set("port", port);
        }
        let security_group = match str_at(&body, "/security_group_id") {
            sg if sg == UNSET_SECURITY_GROUP => String::new(),
            sg => sg,
        };
        if security_group.is_empty() {
            data.set("security_group_id", Value::Null);
        } else {
            data.set("security_group_id", security_group);
        }
        let zones = strings_at(&body, "/available_zones");
        if !zones.is_empty() {
            data.set("availability_zones", Value::strings(zones));
        }
        if data.get_str("region").is_none() {
            let registry = ctx.meta::<ClientRegistry>()?;
            data.set("region", registry.region());
        }

        let tags = api
            .optional_get(ctx, &format!("instances/{}/tags", id))
            .await?
            .map(|b| tags::from_api(&b["tags"]))
            .unwrap_or_default();
        data.set("tags", if tags.is_empty() { Value::Null } else { Value::string_map(tags) });

        if let Some(whitelist) = api
            .optional_get(ctx, &format!("instances/{}/whitelist", id))
            .await?
        {
            let enabled = whitelist
                .get("enable_whitelist")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            data.set("enable_whitelist", enabled);
            if enabled {
                data.set("whitelists", whitelists_from_api(&whitelist["whitelist"]));
            } else {
                data.set("whitelists", Value::Null);
            }
        }

        if let Some(ssl) = api.optional_get(ctx, &format!("instances/{}/ssl", id)).await? {
            data.set("ssl_enable", ssl.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false));
        }

        let mut wanted = data.get_string_map("parameters");
        wanted.extend(data.prior_string_map("parameters"));
        let configs = if wanted.is_empty() {
            None
        } else {
            api.optional_get(ctx, &format!("instances/{}/configs", id)).await?
        };
        if let Some(configs) = configs {
            let observed: Tags = configs["redis_config"]
                .as_array()
                .map(|items| items.as_slice())
                .unwrap_or_default()
                .iter()
                .filter_map(|item| {
                    let name = item.get("param_name")?.as_str()?;
                    let value = item.get("param_value")?.as_str()?;
                    wanted
                        .contains_key(name)
                        .then(|| (name.to_string(), value.to_string()))
                })
                .collect();
            data.set("parameters", Value::string_map(observed));
        }
        Ok(())
    }

    async fn update(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let api = InstanceApi::connect(ctx, data).await?;
        let ran = UPDATE_PLAN.run(ctx, data, &api).await?;
        tracing::debug!(instance = data.id_or_empty(), groups = ?ran, "cache instance updated");
        Ok(())
    }

    async fn delete(&self, ctx: &OperationContext, data: &ResourceData) -> ProviderResult<()> {
        let api = InstanceApi::connect(ctx, data).await?;
        let id = data.id_or_empty();
        let path = format!("instances/{}", id);
        let (client, path) = (&api.client, path.as_str());

        let outcome = deleter::delete_with_dependents(ctx, rules::dcs(), id, &NoDependents, || async move {
            client.delete(path).await.map(|_| ())
        })
        .await?;
        if outcome == DeleteOutcome::Absent {
            return Ok(());
        }

        StateChangeConf::new(format!("cache instance {}", id), DELETE_PENDING, &[DELETED])
            .with_delay(Duration::from_secs(3))
            .with_min_interval(Duration::from_secs(3))
            .wait(ctx, || api.refresh(id))
            .await
            .map_err(|e| ProviderError::from(e).context("error waiting for cache instance to be deleted"))?;
        Ok(())
    }
}

fn whitelists_from_api(list: &serde_json::Value) -> Value {
    let groups = list
        .as_array()
        .map(|items| items.as_slice())
        .unwrap_or_default()
        .iter()
        .map(|group| {
            Value::Block(
                [
                    ("group_name".to_string(), Value::from(str_at(group, "/group_name"))),
                    ("ip_address".to_string(), Value::strings(strings_at(group, "/ip_list"))),
                ]
                .into_iter()
                .collect(),
            )
        });
    Value::set(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::resource::{Attributes, ResourceId};

    fn data(prior: &[(&str, Value)], desired: &[(&str, Value)]) -> ResourceData {
        let collect = |pairs: &[(&str, Value)]| -> Attributes {
            pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
        };
        ResourceData::new(ResourceId::new(RESOURCE_TYPE, "cache"), Arc::new(schema()))
            .with_prior(collect(prior))
            .with_attributes(collect(desired))
            .with_identifier("i-1")
    }

    #[test]
    fn flavor_shapes() {
        assert_eq!(FlavorShape::of("redis.single.xu1.large.1"), FlavorShape { replicas: 1, cluster: false });
        assert_eq!(FlavorShape::of("redis.ha.xu1.large.r2.4"), FlavorShape { replicas: 2, cluster: false });
        assert_eq!(FlavorShape::of("redis.ha.xu1.large.r3.4"), FlavorShape { replicas: 3, cluster: false });
        assert_eq!(FlavorShape::of("redis.ha.xu1.large.4"), FlavorShape { replicas: 2, cluster: false });
        assert_eq!(
            FlavorShape::of("redis.cluster.xu1.large.shard.r1.8"),
            FlavorShape { replicas: 1, cluster: true }
        );
    }

    #[test]
    fn change_type_follows_replica_count() {
        assert_eq!(change_type("redis.ha.xu1.large.r2.4", "redis.ha.xu1.large.r2.4"), None);
        assert_eq!(
            change_type("redis.ha.xu1.large.r2.4", "redis.ha.xu1.large.r3.4"),
            Some(ChangeType::CreateReplication)
        );
        assert_eq!(
            change_type("redis.ha.xu1.large.r3.4", "redis.ha.xu1.large.r2.4"),
            Some(ChangeType::DeleteReplication)
        );
        assert_eq!(
            change_type("redis.ha.xu1.large.r2.4", "redis.ha.xu1.large.r2.8"),
            Some(ChangeType::InstanceType)
        );
        assert_eq!(ChangeType::CreateReplication.as_str(), "createReplication");
    }

    fn api() -> InstanceApi {
        use crate::auth::TokenAuth;
        use crate::transport::MockTransport;
        InstanceApi {
            client: Arc::new(ServiceClient::new(
                "dcs",
                "https://dcs.example.com/v2/p",
                "p",
                Arc::new(MockTransport::new()),
                Arc::new(TokenAuth::new("t")),
            )),
        }
    }

    #[test]
    fn capacity_only_resize_has_no_change_type() {
        let d = data(
            &[("flavor", "redis.ha.xu1.large.r2.4".into()), ("capacity", 4.0.into())],
            &[("flavor", "redis.ha.xu1.large.r2.4".into()), ("capacity", 8.0.into())],
        );
        let body = api().resize_body(&d).unwrap();
        assert_eq!(body["new_capacity"], 8.0);
        assert!(body.get("change_type").is_none());
    }

    #[test]
    fn shrinking_cluster_replicas_needs_reserved_ips() {
        let prior = [("flavor", Value::from("redis.cluster.xu1.large.shard.r3.8"))];
        let desired = [
            ("flavor", Value::from("redis.cluster.xu1.large.shard.r2.8")),
            ("capacity", 8.0.into()),
        ];
        let err = api().resize_body(&data(&prior, &desired)).unwrap_err();
        assert_eq!(err.kind, cirrus_core::error::ErrorKind::Validation);

        let mut desired = desired.to_vec();
        desired.push(("reserved_ips", Value::strings(["10.0.0.9"])));
        desired.push(("availability_zones", Value::strings(["az1"])));
        let body = api().resize_body(&data(&prior, &desired)).unwrap();
        assert_eq!(body["change_type"], "deleteReplication");
        assert_eq!(body["reserved_ip"], serde_json::json!(["10.0.0.9"]));
        assert_eq!(body["available_zones"], serde_json::json!(["az1"]));
    }

    #[test]
    fn update_groups_run_in_api_order() {
        let keys: Vec<Group> = UPDATE_PLAN.groups().iter().map(|g| g.key).collect();
        assert_eq!(
            keys,
            vec![
                Group::Basic,
                Group::Password,
                Group::Resize,
                Group::Tags,
                Group::Whitelist,
                Group::Parameters,
                Group::Ssl
            ]
        );
        assert!(!UPDATE_PLAN.groups()[3].settle);
    }

    #[test]
    fn whitelist_round_trips_through_api_layout() {
        let api_list = serde_json::json!([{"group_name": "g1", "ip_list": ["10.0.0.0/24"]}]);
        let value = whitelists_from_api(&api_list);
        let d = data(&[], &[("whitelists", value)]);
        assert_eq!(
            serde_json::Value::Array(whitelist_groups(&d)),
            serde_json::json!([{"group_name": "g1", "ip_list": ["10.0.0.0/24"]}])
        );
    }
}
