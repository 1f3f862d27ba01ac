//! Load balancer stability gates
//!
//! The load balancer serializes changes to everything below it: a listener,
//! policy or rule change is refused while the load balancer is
//! `PENDING_UPDATE`. Sub-resource handlers wait on the chain before and after
//! each mutation.

use std::time::Duration;

use cirrus_core::context::OperationContext;
use cirrus_core::error::{ProviderError, ProviderResult};
use cirrus_core::waiter::{Observation, StateChangeConf};

use super::{api_error, observe, str_at};
use crate::client::ServiceClient;
use crate::rules;

pub const ACTIVE: &str = "ACTIVE";
pub const PENDING: &[&str] = &["PENDING_CREATE", "PENDING_UPDATE"];

/// Poll settings shared by every level of the chain
pub fn stable_conf(subject: impl Into<String>) -> StateChangeConf {
    StateChangeConf::new(subject, PENDING, &[ACTIVE])
        .with_min_interval(Duration::from_secs(2))
        .with_poll_interval(Duration::from_secs(3))
}

/// `provisioning_status` of `body[member]`, `ACTIVE` when the API omits it
fn provisioning_status(body: &serde_json::Value, member: &str) -> String {
    match str_at(body, &format!("/{}/provisioning_status", member)) {
        s if s.is_empty() => ACTIVE.to_string(),
        s => s,
    }
}

pub async fn refresh_loadbalancer(
    client: &ServiceClient,
    lb_id: &str,
) -> ProviderResult<Observation<serde_json::Value>> {
    let result = client
        .get(&format!("elb/loadbalancers/{}/statuses", lb_id))
        .await;
    observe(rules::elb(), result, |body| {
        match str_at(body, "/statuses/loadbalancer/provisioning_status") {
            s if s.is_empty() => provisioning_status(body, "loadbalancer"),
            s => s,
        }
    })
}

pub async fn refresh_listener(
    client: &ServiceClient,
    listener_id: &str,
) -> ProviderResult<Observation<serde_json::Value>> {
    let result = client.get(&format!("elb/listeners/{}", listener_id)).await;
    observe(rules::elb(), result, |body| provisioning_status(body, "listener"))
}

pub async fn refresh_policy(
    client: &ServiceClient,
    policy_id: &str,
) -> ProviderResult<Observation<serde_json::Value>> {
    let result = client.get(&format!("elb/l7policies/{}", policy_id)).await;
    observe(rules::elb(), result, |body| provisioning_status(body, "l7policy"))
}

pub async fn wait_loadbalancer(
    ctx: &OperationContext,
    client: &ServiceClient,
    lb_id: &str,
) -> ProviderResult<()> {
    stable_conf(format!("load balancer {}", lb_id))
        .wait(ctx, || refresh_loadbalancer(client, lb_id))
        .await?;
    Ok(())
}

/// Load balancer a listener belongs to
pub fn loadbalancer_of(listener: &serde_json::Value) -> Option<String> {
    listener
        .pointer("/listener/loadbalancers/0/id")
        .or_else(|| listener.pointer("/listener/loadbalancer_id"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Load balancer, listener and policy above an L7 rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyChain {
    pub loadbalancer_id: String,
    pub listener_id: String,
    pub policy_id: String,
}

impl PolicyChain {
    /// Walk up from the policy to its load balancer
    pub async fn resolve(
        ctx: &OperationContext,
        client: &ServiceClient,
        policy_id: &str,
    ) -> ProviderResult<Self> {
        let policy = ctx
            .run(client.get(&format!("elb/l7policies/{}", policy_id)))
            .await?
            .map_err(|e| api_error(rules::elb(), e).context(format!("looking up L7 policy {}", policy_id)))?;
        let listener_id = str_at(&policy, "/l7policy/listener_id");
        if listener_id.is_empty() {
            return Err(ProviderError::new(format!("L7 policy {} names no listener", policy_id)));
        }

        let listener = ctx
            .run(client.get(&format!("elb/listeners/{}", listener_id)))
            .await?
            .map_err(|e| api_error(rules::elb(), e).context(format!("looking up listener {}", listener_id)))?;
        let loadbalancer_id = loadbalancer_of(&listener)
            .ok_or_else(|| ProviderError::new(format!("listener {} is not attached to a load balancer", listener_id)))?;

        Ok(Self {
            loadbalancer_id,
            listener_id,
            policy_id: policy_id.to_string(),
        })
    }

    /// Load balancer, then listener, then policy
    pub async fn wait_down(
        &self,
        ctx: &OperationContext,
        client: &ServiceClient,
    ) -> ProviderResult<()> {
        wait_loadbalancer(ctx, client, &self.loadbalancer_id).await?;
        self.wait_listener(ctx, client).await?;
        self.wait_policy(ctx, client).await
    }

    /// Policy, then listener, then load balancer
    pub async fn wait_up(
        &self,
        ctx: &OperationContext,
        client: &ServiceClient,
    ) -> ProviderResult<()> {
        self.wait_policy(ctx, client).await?;
        self.wait_listener(ctx, client).await?;
        wait_loadbalancer(ctx, client, &self.loadbalancer_id).await
    }

    async fn wait_listener(
        &self,
        ctx: &OperationContext,
        client: &ServiceClient,
    ) -> ProviderResult<()> {
        stable_conf(format!("listener {}", self.listener_id))
            .wait(ctx, || refresh_listener(client, &self.listener_id))
            .await?;
        Ok(())
    }

    async fn wait_policy(
        &self,
        ctx: &OperationContext,
        client: &ServiceClient,
    ) -> ProviderResult<()> {
        stable_conf(format!("L7 policy {}", self.policy_id))
            .wait(ctx, || refresh_policy(client, &self.policy_id))
            .await?;
        Ok(())
    }
}
