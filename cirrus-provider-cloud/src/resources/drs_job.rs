//! Data replication (migration) job
//!
//! Creating a job is a pipeline: create, wait for `CONFIGURATION`, test both
//! connections, re-send the endpoint credentials, precheck, start, then wait
//! for the transfer to begin. The job ID is stored after the first step so a
//! failed pipeline can still be destroyed.
//!
//! Every call goes through the batch API, which answers 200 with a per-job
//! result; a result carrying an `error_code` is turned back into an
//! [`ApiError`] so the service table classifies it like any other failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cirrus_core::context::OperationContext;
use cirrus_core::error::{ApiError, ErrorKind, ProviderError, ProviderResult};
use cirrus_core::importer::ImportFormat;
use cirrus_core::provider::{ResourceDefinition, ResourceHandler};
use cirrus_core::resource::{ResourceData, Value};
use cirrus_core::retry::{RetryConf, RetryOutcome};
use cirrus_core::schema::{FieldDescriptor, FieldType, ResourceSchema, types};
use cirrus_core::timeouts::Timeouts;
use cirrus_core::waiter::{DELETED, Observation, StateChangeConf};
use serde_json::json;

use super::{observe, region_field, set_str, str_at};
use crate::client::ServiceClient;
use crate::registry;
use crate::rules;

pub const RESOURCE_TYPE: &str = "drs_job";

pub const CONFIGURATION: &str = "CONFIGURATION";
pub const RELEASE_RESOURCE_COMPLETE: &str = "RELEASE_RESOURCE_COMPLETE";

const STARTING: &[&str] = &["STARTJOBING", "WAITING_FOR_START"];
const STARTED: &[&str] = &[
    "FULL_TRANSFER_STARTED",
    "FULL_TRANSFER_COMPLETE",
    "INCRE_TRANSFER_STARTED",
];

/// Statuses a job can be deleted from without terminating it first
pub const FINISHED: &[&str] = &[
    "CREATE_FAILED",
    "CONFIGURATION",
    "START_JOB_FAILED",
    "FULL_TRANSFER_COMPLETE",
    "FULL_TRANSFER_FAILED",
    "INCRE_TRANSFER_FAILED",
    "RELEASE_RESOURCE_COMPLETE",
];

/// Statuses seen while a forced termination releases the job's resources
const TERMINATING: &[&str] = &[
    "CREATING",
    "CONFIGURATION",
    "STARTJOBING",
    "WAITING_FOR_START",
    "FULL_TRANSFER_STARTED",
    "FULL_TRANSFER_COMPLETE",
    "FULL_TRANSFER_FAILED",
    "INCRE_TRANSFER_STARTED",
    "INCRE_TRANSFER_FAILED",
    "START_JOB_FAILED",
    "PAUSING",
    "RELEASE_RESOURCE_STARTED",
];

pub fn definition() -> ResourceDefinition {
    ResourceDefinition::new(schema(), DrsJob)
        .with_timeouts(
            Timeouts::default()
                .with_create(Duration::from_secs(30 * 60))
                .with_delete(Duration::from_secs(30 * 60)),
        )
        .with_importer(ImportFormat::id_only())
}

fn endpoint_block() -> FieldType {
    let string = |name: &str| FieldDescriptor::new(name, FieldType::String);
    FieldType::list_of(FieldType::Block(vec![
        string("engine_type").required(),
        string("ip").required(),
        FieldDescriptor::new("port", types::port()).required(),
        string("user").required(),
        string("password").required().sensitive(),
        string("instance_id").optional(),
        string("subnet_id").optional(),
    ]))
}

pub fn schema() -> ResourceSchema {
    let string = |name: &str| FieldDescriptor::new(name, FieldType::String);

    ResourceSchema::new(RESOURCE_TYPE)
        .with_description("Database migration job")
        .field(region_field())
        .field(string("name").required())
        .field(
            FieldDescriptor::new("type", types::string_enum(&["migration", "sync", "cloudDataGuard"]))
                .required()
                .force_new(),
        )
        .field(
            FieldDescriptor::new("engine_type", types::string_enum(&["mysql", "mongodb", "gaussdbv5"]))
                .required()
                .force_new(),
        )
        .field(
            FieldDescriptor::new("direction", types::string_enum(&["up", "down", "non-dbs"]))
                .required()
                .force_new(),
        )
        .field(
            FieldDescriptor::new("net_type", types::string_enum(&["vpn", "vpc", "eip"]))
                .optional()
                .force_new()
                .with_default("eip"),
        )
        .field(
            FieldDescriptor::new(
                "migration_type",
                types::string_enum(&["FULL_TRANS", "INCR_TRANS", "FULL_INCR_TRANS"]),
            )
            .optional()
            .force_new()
            .with_default("FULL_INCR_TRANS"),
        )
        .field(FieldDescriptor::new("source_db", endpoint_block()).required().force_new())
        .field(FieldDescriptor::new("destination_db", endpoint_block()).required().force_new())
        .field(string("description").optional())
        .field(
            FieldDescriptor::new("force_destroy", FieldType::Bool)
                .optional()
                .with_default(false)
                .with_description("Terminate a running job on destroy instead of refusing"),
        )
        .field(string("status").computed())
        .field(string("created_at").computed())
}

/// First per-job result of a batch response, with in-band errors surfaced
pub fn first_result(body: serde_json::Value) -> Result<serde_json::Value, ApiError> {
    let result = body
        .get("results")
        .and_then(|r| r.as_array())
        .and_then(|r| r.first())
        .cloned()
        .ok_or_else(|| ApiError::Decode("batch response carried no results".to_string()))?;
    if result.get("error_code").and_then(|c| c.as_str()).is_some_and(|c| !c.is_empty()) {
        return Err(ApiError::http(400, result.to_string()));
    }
    Ok(result)
}

/// Desired endpoint block as the API's endpoint object
fn endpoint(data: &ResourceData, block: &str) -> serde_json::Value {
    let entries = data
        .get(block)
        .and_then(Value::as_items)
        .and_then(|items| items.first())
        .and_then(Value::as_entries);
    let Some(entries) = entries else {
        return serde_json::Value::Null;
    };
    let field = |name: &str| entries.get(name).map(Value::to_json).unwrap_or_default();
    super::compact(json!({
        "db_type": field("engine_type"),
        "ip": field("ip"),
        "db_port": field("port"),
        "db_user": field("user"),
        "db_password": field("password"),
        "inst_id": field("instance_id"),
        "subnet_id": field("subnet_id"),
    }))
}

struct JobApi {
    client: Arc<ServiceClient>,
}

impl JobApi {
    async fn connect(ctx: &OperationContext, data: &ResourceData) -> ProviderResult<Self> {
        let client = registry::client(ctx, "drs", data.get_str("region")).await?;
        Ok(Self { client })
    }

    /// Batch call for one job, under the retry harness
    async fn call(
        &self,
        ctx: &OperationContext,
        path: &str,
        body: serde_json::Value,
    ) -> ProviderResult<serde_json::Value> {
        let client = &self.client;
        let body = &body;
        RetryConf::new(rules::drs())
            .call(ctx, || async move { first_result(client.post(path, body.clone()).await?) })
            .await
    }

    async fn status(&self, id: &str) -> ProviderResult<Observation<serde_json::Value>> {
        let result = self
            .client
            .post("jobs/batch-status", json!({"jobs": [id]}))
            .await
            .and_then(first_result);
        observe(rules::drs(), result, |r| str_at(r, "/status"))
    }

    /// Single status lookup under the retry harness; `None` once the job is gone
    async fn current_status(
        &self,
        ctx: &OperationContext,
        id: &str,
    ) -> ProviderResult<Option<String>> {
        let client = &self.client;
        let result = RetryConf::new(rules::drs())
            .call(ctx, || async move {
                first_result(client.post("jobs/batch-status", json!({"jobs": [id]})).await?)
            })
            .await;
        match result {
            Ok(result) => Ok(Some(str_at(&result, "/status"))),
            Err(e) if e.is_absent() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn wait_status(
        &self,
        ctx: &OperationContext,
        id: &str,
        pending: &[&str],
        target: &[&str],
    ) -> ProviderResult<()> {
        StateChangeConf::new(format!("migration job {}", id), pending, target)
            .with_delay(Duration::from_secs(5))
            .with_min_interval(Duration::from_secs(3))
            .wait(ctx, || self.status(id))
            .await?;
        Ok(())
    }

    async fn test_connections(
        &self,
        ctx: &OperationContext,
        id: &str,
        data: &ResourceData,
    ) -> ProviderResult<()> {
        let net_type = data.get_str("net_type").unwrap_or("eip");
        for (block, end_point_type) in [("source_db", "so"), ("destination_db", "ta")] {
            let mut connection = endpoint(data, block);
            connection["job_id"] = json!(id);
            connection["net_type"] = json!(net_type);
            connection["end_point_type"] = json!(end_point_type);
            let result = self
                .call(ctx, "jobs/batch-connection", json!({"jobs": [connection]}))
                .await?;
            if !result.get("success").and_then(|s| s.as_bool()).unwrap_or(false) {
                return Err(ProviderError::validation(format!(
                    "{} connection test failed: {}",
                    block,
                    str_at(&result, "/error_msg")
                )));
            }
        }
        Ok(())
    }

    async fn resend_endpoints(
        &self,
        ctx: &OperationContext,
        id: &str,
        data: &ResourceData,
    ) -> ProviderResult<()> {
        let job = json!({
            "job_id": id,
            "source_endpoint": endpoint(data, "source_db"),
            "target_endpoint": endpoint(data, "destination_db"),
        });
        self.client_put(ctx, "jobs/batch-modification", json!({"jobs": [job]}))
            .await
    }

    async fn client_put(
        &self,
        ctx: &OperationContext,
        path: &str,
        body: serde_json::Value,
    ) -> ProviderResult<()> {
        let client = &self.client;
        let body = &body;
        RetryConf::new(rules::drs())
            .call(ctx, || async move { first_result(client.put(path, body.clone()).await?) })
            .await?;
        Ok(())
    }

    async fn precheck(&self, ctx: &OperationContext, id: &str) -> ProviderResult<()> {
        self.call(
            ctx,
            "jobs/batch-precheck",
            json!({"jobs": [{"job_id": id, "precheck_mode": "forStartJob"}]}),
        )
        .await?;

        let client = &self.client;
        let result = StateChangeConf::new(format!("precheck of migration job {}", id), &["pending"], &["complete"])
            .with_min_interval(Duration::from_secs(3))
            .wait(ctx, || async move {
                let result = client
                    .post("jobs/batch-precheck-result", json!({"jobs": [id]}))
                    .await
                    .and_then(first_result);
                observe(rules::drs(), result, |r| match str_at(r, "/process").as_str() {
                    "100%" => "complete".to_string(),
                    _ => "pending".to_string(),
                })
            })
            .await?
            .unwrap_or_default();

        let passed = str_at(&result, "/total_passed_rate");
        if passed != "100%" {
            return Err(ProviderError::validation(format!(
                "precheck of migration job {} did not pass (passed: {})",
                id,
                if passed.is_empty() { "unknown" } else { passed.as_str() }
            )));
        }
        Ok(())
    }

    async fn delete_as(
        &self,
        ctx: &OperationContext,
        id: &str,
        delete_type: &str,
    ) -> ProviderResult<RetryOutcome<()>> {
        let client = &self.client;
        let body = json!({"jobs": [{"job_id": id, "delete_type": delete_type}]});
        let body = &body;
        RetryConf::new(rules::drs())
            .run(ctx, || async move {
                first_result(client.delete_with("jobs/batch-jobs", body.clone()).await?).map(|_| ())
            })
            .await
    }
}

fn create_body(data: &ResourceData) -> serde_json::Value {
    let job = super::compact(json!({
        "name": data.get_str("name"),
        "db_use_type": data.get_str("type"),
        "engine_type": data.get_str("engine_type"),
        "job_direction": data.get_str("direction"),
        "net_type": data.get_str("net_type"),
        "task_type": data.get_str("migration_type"),
        "node_type": "high",
        "description": data.get_str("description"),
        "source_endpoint": endpoint(data, "source_db"),
        "target_endpoint": endpoint(data, "destination_db"),
    }));
    json!({"jobs": [job]})
}

pub struct DrsJob;

#[async_trait]
impl ResourceHandler for DrsJob {
    async fn create(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let api = JobApi::connect(ctx, data).await?;
        let created = api.call(ctx, "jobs", create_body(data)).await?;
        let id = str_at(&created, "/id");
        if id.is_empty() {
            return Err(ProviderError::new("create response carried no job id"));
        }
        data.set_id(&id);
        tracing::info!(job = %id, "migration job created");

        let job = id.as_str();
        let step = |what: &'static str| move |e: ProviderError| e.context(format!("migration job {}: {}", job, what));

        api.wait_status(ctx, &id, &["CREATING"], &[CONFIGURATION])
            .await
            .map_err(step("waiting for configuration"))?;
        api.test_connections(ctx, &id, data)
            .await
            .map_err(step("testing connections"))?;
        api.resend_endpoints(ctx, &id, data)
            .await
            .map_err(step("updating endpoints"))?;
        api.precheck(ctx, &id).await.map_err(step("precheck"))?;
        api.call(ctx, "jobs/batch-starting", json!({"jobs": [{"job_id": id}]}))
            .await
            .map_err(step("starting"))?;
        api.wait_status(ctx, &id, STARTING, STARTED)
            .await
            .map_err(step("waiting for the transfer to start"))?;
        Ok(())
    }

    async fn read(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        let api = JobApi::connect(ctx, data).await?;
        let id = data.id_or_empty().to_string();
        let job = api.call(ctx, "jobs/batch-detail", json!({"jobs": [id]})).await?;

        for (attr, member) in [
            ("name", "/name"),
            ("status", "/status"),
            ("engine_type", "/engine_type"),
            ("direction", "/job_direction"),
            ("net_type", "/net_type"),
            ("migration_type", "/task_type"),
            ("description", "/description"),
            ("created_at", "/create_time"),
        ] {
            set_str(data, attr, &job, member);
        }
        if let Some(db_use_type) = job.get("db_use_type").and_then(|v| v.as_str()) {
            data.set("type", db_use_type);
        }
        for (block, member) in [("source_db", "source_endpoint"), ("destination_db", "target_endpoint")] {
            if let Some(observed) = job.get(member).filter(|v| v.is_object()) {
                let merged = merge_endpoint(data.get(block), observed);
                data.set(block, merged);
            }
        }
        Ok(())
    }

    async fn update(&self, ctx: &OperationContext, data: &mut ResourceData) -> ProviderResult<()> {
        if !data.has_changes(&["name", "description"]) {
            // force_destroy only changes what delete does
            return Ok(());
        }
        let api = JobApi::connect(ctx, data).await?;
        let job = json!({
            "job_id": data.id_or_empty(),
            "name": data.get_str("name"),
            "description": data.get_str("description").unwrap_or_default(),
        });
        api.client_put(ctx, "jobs/batch-modification", json!({"jobs": [job]}))
            .await
    }

    async fn delete(&self, ctx: &OperationContext, data: &ResourceData) -> ProviderResult<()> {
        let api = JobApi::connect(ctx, data).await?;
        let id = data.id_or_empty();

        let Some(status) = api.current_status(ctx, id).await? else {
            return Ok(());
        };

        if !FINISHED.contains(&status.as_str()) {
            if !data.get_bool("force_destroy") {
                return Err(ProviderError::new(format!(
                    "cannot delete running job {} (status {}); set force_destroy to terminate it",
                    id, status
                ))
                .with_kind(ErrorKind::Validation)
                .with_code(status));
            }
            tracing::info!(job = id, %status, "terminating migration job");
            if let RetryOutcome::Absent = api.delete_as(ctx, id, "force_terminate").await? {
                return Ok(());
            }
            api.wait_status(ctx, id, TERMINATING, &[RELEASE_RESOURCE_COMPLETE])
                .await
                .map_err(|e| e.context("waiting for the job to release its resources"))?;
        }

        if let RetryOutcome::Absent = api.delete_as(ctx, id, "delete").await? {
            return Ok(());
        }
        let mut pending = FINISHED.to_vec();
        pending.push("DELETING");
        StateChangeConf::new(format!("migration job {}", id), &pending, &[DELETED])
            .with_min_interval(Duration::from_secs(3))
            .wait(ctx, || api.status(id))
            .await?;
        Ok(())
    }
}

/// Observed endpoint over the desired block; the password is never returned
fn merge_endpoint(desired: Option<&Value>, observed: &serde_json::Value) -> Value {
    let mut entries = desired
        .and_then(Value::as_items)
        .and_then(|items| items.first())
        .and_then(Value::as_entries)
        .cloned()
        .unwrap_or_default();
    for (attr, member) in [("engine_type", "db_type"), ("ip", "ip"), ("user", "db_user"), ("instance_id", "inst_id")] {
        if let Some(s) = observed.get(member).and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
            entries.insert(attr.to_string(), Value::from(s));
        }
    }
    let port = observed.get("db_port").and_then(|p| match p {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    });
    if let Some(port) = port {
        entries.insert("port".to_string(), Value::Int(port));
    }
    Value::List(vec![Value::Block(entries)])
}
