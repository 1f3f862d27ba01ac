//! Operation context
//!
//! Threads cancellation, the operation deadline, the provider's service
//! locator and a per-operation client cache through every handler call.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{ProviderError, ProviderResult};
use crate::resource::ResourceId;
use crate::timeouts::Operation;

type Shared = Arc<dyn Any + Send + Sync>;

/// Owner side of a cancellation signal (held by the server)
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: Some(self.tx.subscribe()),
        }
    }
}

/// Receiver side of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_canceled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancellation is requested
    pub async fn canceled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Owner dropped without canceling
                return std::future::pending().await;
            }
        }
    }
}

/// Context for a single resource operation
pub struct OperationContext {
    operation: Operation,
    address: Option<ResourceId>,
    cancel: CancelSignal,
    budget: Duration,
    deadline: Instant,
    meta: Option<Shared>,
    clients: Mutex<HashMap<String, Shared>>,
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("operation", &self.operation)
            .field("address", &self.address)
            .field("budget", &self.budget)
            .field("canceled", &self.cancel.is_canceled())
            .finish()
    }
}

impl OperationContext {
    pub fn new(operation: Operation, budget: Duration, cancel: CancelSignal) -> Self {
        Self {
            operation,
            address: None,
            cancel,
            budget,
            deadline: Instant::now() + budget,
            meta: None,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the provider's service locator (the configured client registry)
    pub fn with_meta(mut self, meta: Shared) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_address(mut self, address: ResourceId) -> Self {
        self.address = Some(address);
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn address(&self) -> Option<&ResourceId> {
        self.address.as_ref()
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Typed access to the service locator
    pub fn meta<T: Any + Send + Sync>(&self) -> ProviderResult<Arc<T>> {
        let meta = self
            .meta
            .clone()
            .ok_or_else(|| ProviderError::new("provider is not configured"))?;
        meta.downcast::<T>()
            .map_err(|_| ProviderError::new("provider metadata has an unexpected type"))
    }

    /// Client cached for `key` during this operation
    pub fn client<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients
            .get(key)
            .cloned()
            .and_then(|c| c.downcast::<T>().ok())
    }

    /// Cache a client for `key`. The first stored handle wins and is returned.
    pub fn store_client<T: Any + Send + Sync>(&self, key: &str, client: Arc<T>) -> Arc<T> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let stored = clients
            .entry(key.to_string())
            .or_insert_with(|| client.clone() as Shared)
            .clone();
        stored.downcast::<T>().unwrap_or(client)
    }

    /// Sleep for `d`, returning early with `Canceled` if cancellation fires
    pub async fn sleep(&self, d: Duration) -> ProviderResult<()> {
        if self.cancel.is_canceled() {
            return Err(ProviderError::canceled());
        }
        tokio::select! {
            _ = tokio::time::sleep(d) => Ok(()),
            _ = self.cancel.canceled() => Err(ProviderError::canceled()),
        }
    }

    /// Await `fut` unless cancellation fires first
    pub async fn run<F: Future>(&self, fut: F) -> ProviderResult<F::Output> {
        if self.cancel.is_canceled() {
            return Err(ProviderError::canceled());
        }
        tokio::select! {
            out = fut => Ok(out),
            _ = self.cancel.canceled() => Err(ProviderError::canceled()),
        }
    }
}
