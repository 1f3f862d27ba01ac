//! Client registry
//!
//! The service locator produced by `Configure`. Clients are keyed by
//! `(service, region, project)`, built on first use and immutable afterwards.
//! Concurrent first uses of the same key share one construction, so the
//! project lookup against IAM happens at most once per key.

use std::sync::Arc;

use cirrus_core::context::OperationContext;
use cirrus_core::error::{ApiError, ErrorKind, ProviderError, ProviderResult};
use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::auth::Authenticator;
use crate::catalog::Catalog;
use crate::client::ServiceClient;
use crate::config::ProviderConfig;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub service: String,
    pub region: String,
    /// Project name; `None` is the region's default project
    pub project: Option<String>,
}

type Slot<T> = Arc<OnceCell<T>>;

pub struct ClientRegistry {
    config: ProviderConfig,
    region: String,
    catalog: Catalog,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn Authenticator>,
    clients: DashMap<ClientKey, Slot<Arc<ServiceClient>>>,
    /// (region, project name) -> project ID
    projects: DashMap<(String, Option<String>), Slot<String>>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("region", &self.region)
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl ClientRegistry {
    pub fn new(
        config: ProviderConfig,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn Authenticator>,
    ) -> ProviderResult<Self> {
        let region = config
            .region()
            .map_err(|e| ProviderError::validation(e.to_string()))?
            .to_string();
        let catalog = Catalog::new(config.cloud(), config.endpoints.clone());
        Ok(Self {
            config,
            region,
            catalog,
            transport,
            auth,
            clients: DashMap::new(),
            projects: DashMap::new(),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Client for `service` in `region` (the provider's region when `None`)
    pub async fn client_for(
        &self,
        service: &str,
        region: Option<&str>,
    ) -> ProviderResult<Arc<ServiceClient>> {
        let region = region.filter(|r| !r.is_empty()).unwrap_or(&self.region);
        self.client(ClientKey {
            service: service.to_string(),
            region: region.to_string(),
            project: None,
        })
        .await
    }

    /// Client for `service` scoped to a named project
    pub async fn client_for_project(
        &self,
        service: &str,
        project_name: &str,
    ) -> ProviderResult<Arc<ServiceClient>> {
        // Project names conventionally start with their region ("cn-north-4_dev")
        let region = project_name
            .split_once('_')
            .map(|(region, _)| region)
            .unwrap_or(project_name);
        self.client(ClientKey {
            service: service.to_string(),
            region: region.to_string(),
            project: Some(project_name.to_string()),
        })
        .await
    }

    async fn client(&self, key: ClientKey) -> ProviderResult<Arc<ServiceClient>> {
        let slot = self.clients.entry(key.clone()).or_default().clone();
        let client = slot
            .get_or_try_init(|| async {
                let project_id = if self.catalog.entry(&key.service)?.project_scoped {
                    self.project_id(&key.region, key.project.as_deref()).await?
                } else {
                    String::new()
                };
                let endpoint = self.catalog.endpoint(&key.service, &key.region, &project_id)?;
                tracing::debug!(service = %key.service, region = %key.region, %endpoint, "building service client");
                Ok::<_, ProviderError>(Arc::new(ServiceClient::new(
                    key.service.clone(),
                    endpoint,
                    project_id,
                    self.transport.clone(),
                    self.auth.clone(),
                )))
            })
            .await?;
        Ok(client.clone())
    }

    /// v3 twin of a v2 client; see [`Catalog::derived_v3`]
    pub fn derive_v3(
        &self,
        v2: &ServiceClient,
        region: Option<&str>,
    ) -> ProviderResult<ServiceClient> {
        let region = region.filter(|r| !r.is_empty()).unwrap_or(&self.region);
        let endpoint = self.catalog.derived_v3(v2.service(), region, v2.project_id())?;
        Ok(v2.with_endpoint(format!("{}v3", v2.service()), endpoint))
    }

    async fn project_id(&self, region: &str, project: Option<&str>) -> ProviderResult<String> {
        let slot = self
            .projects
            .entry((region.to_string(), project.map(str::to_string)))
            .or_default()
            .clone();
        let id = slot
            .get_or_try_init(|| self.resolve_project(region, project))
            .await?;
        Ok(id.clone())
    }

    async fn resolve_project(&self, region: &str, project: Option<&str>) -> ProviderResult<String> {
        if project.is_none() && region == self.region {
            if let Some(id) = self.config.project_id.as_ref().filter(|id| !id.is_empty()) {
                return Ok(id.clone());
            }
        }

        let name = project
            .or(self.config.project_name.as_deref().filter(|_| region == self.region))
            .unwrap_or(region);
        if let Some(id) = self.config.projects.get(name) {
            return Ok(id.clone());
        }

        tracing::debug!(project = name, "looking up project ID");
        let iam = ServiceClient::new(
            "iam",
            self.catalog.endpoint("iam", region, "")?,
            "",
            self.transport.clone(),
            self.auth.clone(),
        );
        // A failed lookup must never read as an absent resource
        let body = iam
            .get(&format!("projects?name={}", urlencoding::encode(name)))
            .await
            .map_err(|e: ApiError| {
                ProviderError::from(e)
                    .with_kind(ErrorKind::Validation)
                    .context(format!("looking up project '{}'", name))
            })?;
        body.get("projects")
            .and_then(|p| p.as_array())
            .and_then(|p| p.first())
            .and_then(|p| p.get("id"))
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::new(format!("project '{}' not found", name)).with_kind(ErrorKind::Validation)
            })
    }
}

/// Client for `service`, reusing the one already resolved by this operation
pub async fn client(
    ctx: &OperationContext,
    service: &str,
    region: Option<&str>,
) -> ProviderResult<Arc<ServiceClient>> {
    let slot_key = match region.filter(|r| !r.is_empty()) {
        Some(region) => format!("{}@{}", service, region),
        None => service.to_string(),
    };
    if let Some(client) = ctx.client::<ServiceClient>(&slot_key) {
        return Ok(client);
    }
    let registry = ctx.meta::<ClientRegistry>()?;
    let client = ctx.run(registry.client_for(service, region)).await??;
    Ok(ctx.store_client(&slot_key, client))
}
