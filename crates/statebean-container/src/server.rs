//! TCP front end for the containers of one node.

use serde_json::{json, Map, Value};
use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::transport::TcpServer;
use statebean_common::{AdminRequest, Envelope, Request, Response};
use statebean_metrics::{ServerInfo, INFO_ENDPOINT, METRICS_ENDPOINT};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::registry::ContainerRegistry;

/// Serves every container of a [`ContainerRegistry`] on one listener.
///
/// Invocations are routed by container name. Admin requests naming a
/// container hit that container's built-in endpoints; without a container
/// they describe the whole node.
pub struct ContainerServer {
    server: TcpServer,
    router: Arc<Router>,
}

impl ContainerServer {
    pub async fn bind(
        addr: &str,
        registry: Arc<ContainerRegistry>,
        node: impl Into<String>,
    ) -> Result<Self> {
        let server = TcpServer::new(addr).await?;
        Ok(Self {
            server,
            router: Arc::new(Router {
                registry,
                node: node.into(),
                started: Instant::now(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        info!(
            "Node '{}' serving {:?} on {}",
            self.router.node,
            self.router.registry.names(),
            self.local_addr()?
        );
        let router = self.router.clone();
        self.server
            .run_with_handler(move |envelope| {
                let router = router.clone();
                async move { router.route(envelope).await }
            })
            .await
    }
}

struct Router {
    registry: Arc<ContainerRegistry>,
    node: String,
    started: Instant,
}

impl Router {
    async fn route(&self, envelope: Envelope) -> Result<Response> {
        match envelope {
            Envelope::Invoke(request) => self.invoke(request).await,
            Envelope::Admin(request) => self.admin(request),
        }
    }

    async fn invoke(&self, request: Request) -> Result<Response> {
        let container = self.registry.get(&request.container).ok_or_else(|| {
            BeanError::Deployment(format!("container '{}' is not deployed", request.container))
        })?;
        debug!(
            "Request {} for {}.{} session={:?}",
            request.id, request.container, request.method, request.session_id
        );
        Ok(container.invoke(&request).await)
    }

    fn admin(&self, request: AdminRequest) -> Result<Response> {
        if let Some(name) = &request.container {
            let container = self.registry.get(name).ok_or_else(|| {
                BeanError::Deployment(format!("container '{}' is not deployed", name))
            })?;
            return container.handle_admin(&request.endpoint, request.id);
        }

        match request.endpoint.as_str() {
            INFO_ENDPOINT => {
                let info = ServerInfo::new(
                    self.node.clone(),
                    self.started.elapsed().as_millis() as u64,
                    self.registry.names(),
                );
                Ok(Response::success(request.id, json!(info)))
            }
            METRICS_ENDPOINT => {
                let mut snapshots = Map::new();
                for name in self.registry.names() {
                    if let Some(container) = self.registry.get(&name) {
                        snapshots.insert(name, json!(container.metrics_snapshot()));
                    }
                }
                Ok(Response::success(request.id, Value::Object(snapshots)))
            }
            other => Err(BeanError::InvalidRequest(format!(
                "'{}' is not a built-in endpoint",
                other
            ))),
        }
    }
}
