//! Plugin server
//!
//! Reads request frames line by line, runs each on its own task and writes
//! responses as they complete. `Stop` cancels every in-flight operation.
//! EOF is a normal shutdown; a frame that cannot be parsed is a protocol
//! violation and ends the session with an error.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::context::{CancelHandle, CancelSignal};
use crate::differ::Diff;
use crate::engine::Engine;
use crate::error::ProviderResult;
use crate::protocol::{
    ApplyParams, Call, Diagnostic, Frame, ImportParams, PlanParams, ProtocolError, ReadParams,
    Response, WireState,
};
use crate::resource::ResourceId;
use crate::schema::ResourceSchema;

/// Serve the protocol until EOF or a protocol violation
pub async fn serve<R, W>(engine: Arc<Engine>, reader: R, writer: W) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Response>();
    let writer_task = tokio::spawn(write_responses(writer, rx));

    let mut cancel = CancelHandle::new();
    let mut in_flight = JoinSet::new();
    let mut lines = reader.lines();

    let result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(ProtocolError::Io(e)),
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame = match Frame::parse(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "protocol violation");
                break Err(e);
            }
        };

        let call = match Call::decode(&frame.method, frame.params) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(id = frame.id, error = %e, "rejecting request");
                let _ = tx.send(Response::err(frame.id, Diagnostic::from(&e)));
                continue;
            }
        };

        if let Call::Stop = call {
            tracing::info!("stop requested, canceling in-flight operations");
            std::mem::replace(&mut cancel, CancelHandle::new()).cancel();
            let _ = tx.send(Response::ok(frame.id, serde_json::json!({ "stopped": true })));
            continue;
        }

        let engine = engine.clone();
        let signal = cancel.signal();
        let tx = tx.clone();
        in_flight.spawn(async move {
            let response = handle(&engine, frame.id, call, signal).await;
            let _ = tx.send(response);
        });

        // Reap finished tasks so the set does not grow without bound
        while in_flight.try_join_next().is_some() {}
    };

    if result.is_err() {
        cancel.cancel();
    }
    while in_flight.join_next().await.is_some() {}
    drop(tx);

    match writer_task.await {
        Ok(Ok(())) => result,
        Ok(Err(e)) => result.and(Err(e)),
        Err(e) => result.and(Err(ProtocolError::Malformed(format!("writer task failed: {}", e)))),
    }
}

async fn write_responses<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Response>,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_vec(&response).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Run one request against the engine
pub async fn handle(engine: &Engine, id: u64, call: Call, cancel: CancelSignal) -> Response {
    let result = match call {
        Call::GetSchema => Ok(engine.schema()),
        Call::ValidateConfig(p) => engine
            .validate_config(&p.config)
            .map(|()| serde_json::json!({ "diagnostics": [] })),
        Call::Configure(p) => engine.configure(&p.config).await.map(|()| serde_json::json!({})),
        Call::ValidateResourceConfig(p) => engine.definition(&p.type_name).and_then(|def| {
            let config = def.schema.decode(&p.config);
            let diagnostics = engine.validate_resource(&p.type_name, &config)?;
            Ok(serde_json::json!({ "diagnostics": diagnostics }))
        }),
        Call::PlanResourceChange(p) => plan(engine, p),
        Call::ApplyResourceChange(p) => return apply(engine, id, p, cancel).await,
        Call::ReadResource(p) => read(engine, p, cancel).await,
        Call::ImportResourceState(p) => import(engine, p, cancel).await,
        Call::Stop => Ok(serde_json::json!({ "stopped": true })),
    };

    match result {
        Ok(value) => Response::ok(id, value),
        Err(e) => {
            tracing::warn!(id, error = %e, "request failed");
            Response::err(id, Diagnostic::from(&e))
        }
    }
}

fn schema_of<'a>(engine: &'a Engine, type_name: &str) -> ProviderResult<&'a ResourceSchema> {
    Ok(&engine.definition(type_name)?.schema)
}

fn plan(engine: &Engine, p: PlanParams) -> ProviderResult<serde_json::Value> {
    let schema = schema_of(engine, &p.type_name)?;
    let prior = p
        .prior_state
        .map(|s| s.into_state(ResourceId::new(&p.type_name, ""), schema).attributes);
    let proposed = p.proposed.as_ref().map(|json| schema.decode(json));
    let result = engine.plan(&p.type_name, prior.as_ref(), proposed.as_ref())?;

    let (action, changed, requires_replace) = match &result.diff {
        Diff::Create => ("create", Vec::new(), Vec::new()),
        Diff::Delete => ("delete", Vec::new(), Vec::new()),
        Diff::NoChange => ("noop", Vec::new(), Vec::new()),
        Diff::Update {
            changed,
            requires_replace,
        } if !requires_replace.is_empty() => ("replace", changed.clone(), requires_replace.clone()),
        Diff::Update { changed, .. } => ("update", changed.clone(), Vec::new()),
    };

    Ok(serde_json::json!({
        "action": action,
        "planned_state": result.planned_state.as_ref().map(ResourceSchema::encode),
        "changed": changed,
        "requires_replace": requires_replace,
    }))
}

async fn apply(engine: &Engine, id: u64, p: ApplyParams, cancel: CancelSignal) -> Response {
    let address = ResourceId::new(&p.type_name, &p.name);
    let schema = match schema_of(engine, &p.type_name) {
        Ok(schema) => schema,
        Err(e) => return Response::err(id, Diagnostic::from(&e.for_resource(address))),
    };
    let prior = p.prior_state.map(|s| s.into_state(address.clone(), schema));
    let planned = p.planned_state.as_ref().map(|json| schema.decode(json));

    let outcome = engine.apply(&address, prior.as_ref(), planned.as_ref(), cancel).await;
    let new_state = outcome.state.as_ref().map(WireState::from_state);
    let response = Response::ok(id, serde_json::json!({ "new_state": new_state }));
    match outcome.error {
        Some(e) => {
            tracing::warn!(id, error = %e, "apply failed");
            response.with_error(Diagnostic::from(&e))
        }
        None => response,
    }
}

async fn read(
    engine: &Engine,
    p: ReadParams,
    cancel: CancelSignal,
) -> ProviderResult<serde_json::Value> {
    let address = ResourceId::new(&p.type_name, &p.name);
    let schema = schema_of(engine, &p.type_name)?;
    let prior = p.state.into_state(address.clone(), schema);
    let state = engine.read(&address, &prior, cancel).await?;
    Ok(serde_json::json!({ "new_state": state.as_ref().map(WireState::from_state) }))
}

async fn import(
    engine: &Engine,
    p: ImportParams,
    cancel: CancelSignal,
) -> ProviderResult<serde_json::Value> {
    let address = ResourceId::new(&p.type_name, &p.name);
    let state = engine.import(&address, &p.id, cancel).await?;
    Ok(serde_json::json!({ "imported": WireState::from_state(&state) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OperationContext;
    use crate::provider::{Meta, Provider, ResourceDefinition, ResourceHandler};
    use crate::resource::ResourceData;
    use crate::schema::{FieldDescriptor, FieldType};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    struct Thing;

    #[async_trait]
    impl ResourceHandler for Thing {
        async fn create(
            &self,
            ctx: &OperationContext,
            data: &mut ResourceData,
        ) -> ProviderResult<()> {
            data.set_id("t-1");
            if data.get_str("name") == Some("slow") {
                ctx.sleep(Duration::from_secs(3600)).await?;
            }
            Ok(())
        }

        async fn read(
            &self,
            _ctx: &OperationContext,
            _data: &mut ResourceData,
        ) -> ProviderResult<()> {
            Ok(())
        }

        async fn update(
            &self,
            _ctx: &OperationContext,
            _data: &mut ResourceData,
        ) -> ProviderResult<()> {
            Ok(())
        }

        async fn delete(
            &self,
            _ctx: &OperationContext,
            _data: &ResourceData,
        ) -> ProviderResult<()> {
            Ok(())
        }
    }

    struct Things;

    #[async_trait]
    impl Provider for Things {
        fn name(&self) -> &'static str {
            "things"
        }

        fn config_schema(&self) -> ResourceSchema {
            ResourceSchema::new("provider")
        }

        fn resources(&self) -> Vec<ResourceDefinition> {
            let schema = ResourceSchema::new("thing")
                .field(FieldDescriptor::new("name", FieldType::String).required());
            vec![ResourceDefinition::new(schema, Thing)]
        }

        fn validate_config(&self, _config: &serde_json::Value) -> ProviderResult<()> {
            Ok(())
        }

        async fn configure(&self, _config: &serde_json::Value) -> ProviderResult<Meta> {
            Ok(Arc::new(()))
        }
    }

    async fn run(input: &str) -> (Result<(), ProtocolError>, Vec<serde_json::Value>) {
        let engine = Arc::new(Engine::new(Arc::new(Things)));
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let result = serve(engine, input.as_bytes(), server).await;
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        let responses = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        (result, responses)
    }

    #[tokio::test]
    async fn eof_is_a_clean_shutdown() {
        let (result, responses) = run("").await;
        assert!(result.is_ok());
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn malformed_frame_is_a_protocol_violation() {
        let (result, _) = run("{\"id\":1,\"method\":\"GetSchema\"}\nnot json\n").await;
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[tokio::test]
    async fn unknown_method_gets_an_error_response() {
        let (result, responses) = run("{\"id\":4,\"method\":\"Explode\"}\n").await;
        assert!(result.is_ok());
        assert_eq!(responses[0]["id"], 4);
        assert!(responses[0]["error"]["message"].as_str().unwrap().contains("Explode"));
    }

    #[tokio::test]
    async fn create_through_apply() {
        let input = concat!(
            r#"{"id":1,"method":"Configure","params":{"config":{}}}"#,
            "\n",
            r#"{"id":2,"method":"ApplyResourceChange","params":{"type_name":"thing","name":"a","planned_state":{"name":"fast"}}}"#,
            "\n",
        );
        let (result, responses) = run(input).await;
        assert!(result.is_ok());
        let apply = responses.iter().find(|r| r["id"] == 2).unwrap();
        assert_eq!(apply["result"]["new_state"]["identifier"], "t-1");
        assert!(apply.get("error").is_none());
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_operations() {
        let input = concat!(
            r#"{"id":1,"method":"ApplyResourceChange","params":{"type_name":"thing","name":"a","planned_state":{"name":"slow"}}}"#,
            "\n",
            r#"{"id":2,"method":"Stop"}"#,
            "\n",
        );
        let (result, responses) = run(input).await;
        assert!(result.is_ok());
        let stop = responses.iter().find(|r| r["id"] == 2).unwrap();
        assert_eq!(stop["result"]["stopped"], true);
        let apply = responses.iter().find(|r| r["id"] == 1).unwrap();
        assert_eq!(apply["error"]["kind"], "canceled");
        assert_eq!(apply["result"]["new_state"]["identifier"], "t-1");
    }
}
