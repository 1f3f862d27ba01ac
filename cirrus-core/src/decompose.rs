//! Update decomposition
//!
//! A resource declares an ordered list of update groups, each naming the
//! fields it owns. At update time every group with a changed field runs its
//! updater, then waits for the resource to settle before the next group.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::context::OperationContext;
use crate::error::ProviderResult;
use crate::resource::ResourceData;

/// Per-resource implementation of the update groups
#[async_trait]
pub trait GroupUpdater<K>: Send + Sync
where
    K: Copy + Debug + Send + Sync + 'static,
{
    /// Issue the API call(s) for one group
    async fn apply(
        &self,
        ctx: &OperationContext,
        group: K,
        data: &ResourceData,
    ) -> ProviderResult<()>;

    /// Wait until the resource is stable again after `group` ran
    async fn settle(
        &self,
        _ctx: &OperationContext,
        _group: K,
        _data: &ResourceData,
    ) -> ProviderResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UpdateGroup<K> {
    pub key: K,
    pub fields: Vec<&'static str>,
    /// Whether to wait for a stable status after this group
    pub settle: bool,
}

/// Ordered update groups of one resource type
#[derive(Debug, Clone)]
pub struct UpdatePlan<K> {
    groups: Vec<UpdateGroup<K>>,
}

impl<K> Default for UpdatePlan<K> {
    fn default() -> Self {
        Self { groups: Vec::new() }
    }
}

impl<K> UpdatePlan<K>
where
    K: Copy + Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Group followed by a settle wait
    pub fn group(mut self, key: K, fields: &[&'static str]) -> Self {
        self.groups.push(UpdateGroup {
            key,
            fields: fields.to_vec(),
            settle: true,
        });
        self
    }

    /// Group that leaves the resource status untouched (tags, metadata)
    pub fn quiet_group(mut self, key: K, fields: &[&'static str]) -> Self {
        self.groups.push(UpdateGroup {
            key,
            fields: fields.to_vec(),
            settle: false,
        });
        self
    }

    pub fn groups(&self) -> &[UpdateGroup<K>] {
        &self.groups
    }

    /// Groups with at least one changed field, in declared order
    pub fn changed<'a>(
        &'a self,
        data: &'a ResourceData,
    ) -> impl Iterator<Item = &'a UpdateGroup<K>> + 'a {
        self.groups
            .iter()
            .filter(move |g| data.has_changes(&g.fields))
    }

    /// Run every changed group in order; returns the keys that ran.
    /// A failing group aborts the rest.
    pub async fn run<U>(
        &self,
        ctx: &OperationContext,
        data: &ResourceData,
        updater: &U,
    ) -> ProviderResult<Vec<K>>
    where
        U: GroupUpdater<K> + ?Sized,
    {
        let mut ran = Vec::new();
        for group in self.changed(data) {
            tracing::info!(resource = %data.address(), group = ?group.key, "applying update group");
            updater
                .apply(ctx, group.key, data)
                .await
                .map_err(|e| e.context(format!("updating {:?}", group.key)))?;
            if group.settle {
                updater
                    .settle(ctx, group.key, data)
                    .await
                    .map_err(|e| e.context(format!("waiting after {:?} update", group.key)))?;
            }
            ran.push(group.key);
        }
        Ok(ran)
    }
}
