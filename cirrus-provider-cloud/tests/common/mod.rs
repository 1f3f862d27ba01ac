//! Shared setup for the end-to-end tests: an engine whose provider talks to a
//! scripted transport.

#![allow(dead_code)]

use std::sync::Arc;

use cirrus_core::context::CancelSignal;
use cirrus_core::engine::Engine;
use cirrus_core::resource::{Attributes, ResourceId, State, Value};
use cirrus_provider_cloud::{CloudProvider, MockTransport};
use serde_json::json;

pub async fn engine(mock: &Arc<MockTransport>) -> Engine {
    engine_with(
        mock,
        json!({
            "auth_token": "t",
            "region": "cn-north-4",
            "project_id": "p",
            "cloud": "example.com",
        }),
    )
    .await
}

pub async fn engine_with(mock: &Arc<MockTransport>, config: serde_json::Value) -> Engine {
    let engine = Engine::new(Arc::new(CloudProvider::with_transport(mock.clone())));
    engine.configure(&config).await.unwrap();
    engine
}

pub fn attrs(pairs: &[(&str, Value)]) -> Attributes {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

pub fn existing(resource_type: &str, identifier: &str, attributes: Attributes) -> State {
    State::existing(ResourceId::new(resource_type, "test"), attributes).with_identifier(identifier)
}

pub fn never() -> CancelSignal {
    CancelSignal::never()
}

/// Requests seen so far as "METHOD path", the path relative to the project
pub fn calls(mock: &MockTransport) -> Vec<String> {
    mock.requests()
        .iter()
        .map(|r| {
            let url = r.url.split_once('?').map(|(path, _)| path).unwrap_or(&r.url);
            let path = url.split_once("/p/").map(|(_, path)| path).unwrap_or(url);
            format!("{} {}", r.method, path)
        })
        .collect()
}

/// Every mutating request (anything but GET)
pub fn mutations(mock: &MockTransport) -> Vec<String> {
    calls(mock).into_iter().filter(|c| !c.starts_with("GET ")).collect()
}

/// Assert `expected` occurs in `calls` as a subsequence
pub fn assert_in_order(calls: &[String], expected: &[&str]) {
    let mut rest = calls.iter();
    for step in expected {
        assert!(
            rest.any(|c| c == step),
            "expected {:?} in order within {:#?}",
            step,
            calls
        );
    }
}
