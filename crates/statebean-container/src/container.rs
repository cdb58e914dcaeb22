use parking_lot::Mutex;
use serde_json::Value;
use statebean_cluster::{ReplicaSource, StateReplicator};
use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::{Handle, MethodSignature, Request, RequestId, Response, SessionId};
use statebean_metrics::{CacheStats, ContainerMetricsCollector, MetricsCollector, MetricsSnapshot};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bean::{BeanDescriptor, BeanFactory, Lifecycle};
use crate::cache::StatefulCache;
use crate::config::ContainerConfig;
use crate::dispatcher::{Dispatcher, InvocationResponse};
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::store::PassivationStore;

/// Builder for a [`Container`] with optional collaborators.
pub struct ContainerBuilder {
    config: ContainerConfig,
    descriptor: BeanDescriptor,
    factory: Arc<dyn BeanFactory>,
    lifecycle: Lifecycle,
    node: String,
    extra_interceptors: Vec<Arc<dyn Interceptor>>,
    store: Option<Arc<dyn PassivationStore>>,
    replicator: Option<Arc<dyn StateReplicator>>,
    replicas: Option<Arc<dyn ReplicaSource>>,
}

impl ContainerBuilder {
    pub fn lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Node name reported by `_info`.
    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    /// Appends an interceptor after the configured ones.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.extra_interceptors.push(interceptor);
        self
    }

    pub fn store(mut self, store: Arc<dyn PassivationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Pushes session state to peers and adopts replicas on local misses.
    pub fn replication(
        mut self,
        replicator: Arc<dyn StateReplicator>,
        replicas: Arc<dyn ReplicaSource>,
    ) -> Self {
        self.replicator = Some(replicator);
        self.replicas = Some(replicas);
        self
    }

    pub async fn start(self) -> Result<Arc<Container>> {
        self.config.validate()?;
        self.descriptor.validate()?;
        if self.descriptor.name() != self.config.name {
            return Err(BeanError::Deployment(format!(
                "bean '{}' deployed under container name '{}'",
                self.descriptor.name(),
                self.config.name
            )));
        }

        let mut interceptors = InterceptorChain::from_kinds(&self.config.interceptors);
        for interceptor in self.extra_interceptors {
            interceptors.push(interceptor);
        }
        if interceptors.is_empty() {
            return Err(BeanError::Deployment(format!(
                "container '{}' has no interceptors",
                self.config.name
            )));
        }

        let name = self.config.name.clone();
        let mut cache = StatefulCache::builder(name.clone(), self.config.cache.clone(), self.factory)
            .lifecycle(self.lifecycle)
            .concurrency(self.config.concurrency);
        if let Some(store) = self.store {
            cache = cache.store(store);
        }
        if let Some(replicator) = self.replicator {
            cache = cache.replicator(replicator);
        }
        if let Some(replicas) = self.replicas {
            cache = cache.replica_source(replicas);
        }
        let cache = cache.build()?;

        let metrics = Arc::new(
            ContainerMetricsCollector::new(name.clone())
                .with_node(self.node.clone())
                .with_cache(cache.clone()),
        );
        let family = self
            .config
            .cluster
            .enabled
            .then(|| self.config.cluster.family_key(&name));

        let dispatcher = match Dispatcher::new(
            self.descriptor,
            cache.clone(),
            interceptors,
            metrics.clone(),
            family,
        ) {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                if let Err(secondary) = cache.stop().await {
                    warn!("Failed to stop cache of '{}' after failed start: {}", name, secondary);
                }
                return Err(e);
            }
        };

        let scans = self.config.cache.max_age_ms.is_some()
            || self.config.cache.removal_timeout_ms.is_some();
        let scanner = scans.then(|| cache.spawn_scanner());

        info!(
            "Container '{}' started ({:?} cache, max {} resident, clustered: {})",
            name, self.config.cache.kind, self.config.cache.max_size, self.config.cluster.enabled
        );
        Ok(Arc::new(Container {
            name,
            config: self.config,
            node: self.node,
            cache,
            dispatcher,
            metrics,
            scanner: Mutex::new(scanner),
        }))
    }
}

/// A deployed bean: its cache, dispatcher and metrics.
pub struct Container {
    name: String,
    config: ContainerConfig,
    node: String,
    cache: Arc<StatefulCache>,
    dispatcher: Dispatcher,
    metrics: Arc<ContainerMetricsCollector>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl Container {
    pub fn builder(
        config: ContainerConfig,
        descriptor: BeanDescriptor,
        factory: Arc<dyn BeanFactory>,
    ) -> ContainerBuilder {
        ContainerBuilder {
            config,
            descriptor,
            factory,
            lifecycle: Lifecycle::default(),
            node: "local".to_string(),
            extra_interceptors: Vec::new(),
            store: None,
            replicator: None,
            replicas: None,
        }
    }

    /// Deploys a container with default collaborators.
    pub async fn start(
        config: ContainerConfig,
        descriptor: BeanDescriptor,
        factory: Arc<dyn BeanFactory>,
        lifecycle: Lifecycle,
    ) -> Result<Arc<Container>> {
        Self::builder(config, descriptor, factory)
            .lifecycle(lifecycle)
            .start()
            .await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<StatefulCache> {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn is_clustered(&self) -> bool {
        self.config.cluster.enabled
    }

    /// Family key proxies use to find this container's replicants.
    pub fn family(&self) -> Option<String> {
        self.is_clustered()
            .then(|| self.config.cluster.family_key(&self.name))
    }

    pub fn handle(&self, id: SessionId) -> Handle {
        self.dispatcher.handle(id)
    }

    /// Creates a session and returns its handle.
    pub fn create_session(&self, init: Value) -> Result<Handle> {
        let guard = self.cache.create(init)?;
        Ok(self.handle(guard.id()))
    }

    /// Dispatches a wire request addressed to this container.
    pub async fn invoke(&self, request: &Request) -> Response {
        if request.container != self.name {
            let error = BeanError::Deployment(format!(
                "request for '{}' reached container '{}'",
                request.container, self.name
            ));
            return Response::error(request.id, &error);
        }
        self.dispatcher
            .dispatch(request.method, request.session_id, request.args.clone())
            .await
            .into_response(request.id)
    }

    /// Dispatches by signature, for same-process callers.
    pub async fn invoke_local(
        &self,
        method: &MethodSignature,
        session_id: Option<SessionId>,
        args: Value,
    ) -> InvocationResponse {
        self.dispatcher.dispatch(method.hash(), session_id, args).await
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics(&self) -> &Arc<ContainerMetricsCollector> {
        &self.metrics
    }

    /// Answers a built-in endpoint (`_metrics`, `_info`).
    pub fn handle_admin(&self, endpoint: &str, id: RequestId) -> Result<Response> {
        self.metrics.handle_metrics_request(endpoint, id)
    }

    pub fn is_running(&self) -> bool {
        self.cache.is_running()
    }

    /// Removes every session and stops the idle scanner.
    pub async fn stop(&self) -> Result<()> {
        if let Some(scanner) = self.scanner.lock().take() {
            scanner.abort();
        }
        let result = self.cache.stop().await;
        info!("Container '{}' stopped", self.name);
        result
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("clustered", &self.config.cluster.enabled)
            .finish()
    }
}
