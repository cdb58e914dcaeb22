//! Deploying nodes in this process.
//!
//! [`LocalCluster`] starts one or more nodes from a [`DeploymentConfig`].
//! Every node gets its own registry, replica store and TCP listener; nodes
//! join one [`Partition`] and clustered containers replicate to every other
//! node.

use statebean_cluster::{FamilyRegistry, HostedFamily, Partition, ReplicaStore, ReplicationGroup};
use statebean_common::protocol::error::{BeanError, Result};
use statebean_container::{Container, ContainerRegistry, ContainerServer, DeploymentConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::demo;

/// One node running in this process.
pub struct LocalNode {
    name: String,
    locator: String,
    registry: Arc<ContainerRegistry>,
    replicas: Arc<ReplicaStore>,
    groups: Vec<Arc<ReplicationGroup>>,
    hosted: Vec<HostedFamily>,
    server: Option<JoinHandle<Result<()>>>,
}

impl LocalNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address clients connect to.
    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    pub fn replicas(&self) -> &Arc<ReplicaStore> {
        &self.replicas
    }

    pub fn container(&self, name: &str) -> Option<Arc<Container>> {
        self.registry.get(name)
    }

    fn stop_server(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

/// Nodes deployed from one config, sharing a partition.
pub struct LocalCluster {
    partition: Partition,
    families: Arc<FamilyRegistry>,
    nodes: Vec<LocalNode>,
}

impl LocalCluster {
    /// Starts `count` nodes.
    ///
    /// With more than one node, node `i` is named `<node>-<i>` and listens on
    /// the configured port plus `i` (port 0 stays 0).
    pub async fn start(config: &DeploymentConfig, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(BeanError::Deployment("at least one node is required".into()));
        }
        let bind: SocketAddr = config.bind.parse().map_err(|e| {
            BeanError::Deployment(format!("invalid bind address '{}': {}", config.bind, e))
        })?;
        let partition_name = config
            .containers
            .iter()
            .find(|c| c.cluster.enabled)
            .map(|c| c.cluster.partition.clone())
            .unwrap_or_else(|| "DefaultPartition".to_string());

        let mut cluster = Self {
            partition: Partition::new(partition_name),
            families: Arc::new(FamilyRegistry::new()),
            nodes: Vec::with_capacity(count),
        };
        cluster.partition.subscribe(cluster.families.clone());

        for i in 0..count {
            let name = if count == 1 {
                config.node.clone()
            } else {
                format!("{}-{}", config.node, i + 1)
            };
            let mut addr = bind;
            if addr.port() != 0 {
                addr.set_port(addr.port() + i as u16);
            }

            match Self::start_node(config, name, addr).await {
                Ok(node) => cluster.nodes.push(node),
                Err(e) => {
                    cluster.shutdown().await;
                    return Err(e);
                }
            }
        }

        // Every node replicates to every other node
        for node in &cluster.nodes {
            for peer in cluster.nodes.iter().filter(|p| p.name != node.name) {
                for group in &node.groups {
                    group.add_peer(peer.replicas.clone());
                }
            }
        }
        for node in &cluster.nodes {
            if !node.hosted.is_empty() {
                cluster.partition.join(&node.name, node.hosted.clone());
            }
        }

        Ok(cluster)
    }

    async fn start_node(config: &DeploymentConfig, name: String, addr: SocketAddr) -> Result<LocalNode> {
        let registry = Arc::new(ContainerRegistry::new());
        let replicas = Arc::new(ReplicaStore::new(name.clone()));
        let mut groups = Vec::new();
        let mut families = Vec::new();

        for container_config in &config.containers {
            let (descriptor, factory) = demo::bean(&container_config.name)?;
            let mut builder = Container::builder(container_config.clone(), descriptor, factory)
                .node(name.clone());
            if container_config.cluster.enabled {
                let group = Arc::new(ReplicationGroup::new(
                    name.clone(),
                    container_config.cluster.replication,
                ));
                builder = builder.replication(group.clone(), replicas.clone());
                groups.push(group);
                families.push(container_config.cluster.family_key(&container_config.name));
            }

            let started = match builder.start().await {
                Ok(container) => registry.register(container),
                Err(e) => Err(e),
            };
            if let Err(e) = started {
                registry.shutdown().await;
                return Err(e);
            }
        }

        let server = match ContainerServer::bind(&addr.to_string(), registry.clone(), name.clone()).await {
            Ok(server) => server,
            Err(e) => {
                registry.shutdown().await;
                return Err(e);
            }
        };
        let locator = server.local_addr()?.to_string();
        info!("Node {} started on {} with {:?}", name, locator, registry.names());

        Ok(LocalNode {
            hosted: families
                .into_iter()
                .map(|family| HostedFamily::new(family, locator.clone()))
                .collect(),
            name,
            locator,
            registry,
            replicas,
            groups,
            server: Some(tokio::spawn(server.run())),
        })
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Family views of this process, kept current by the partition.
    pub fn families(&self) -> &Arc<FamilyRegistry> {
        &self.families
    }

    pub fn nodes(&self) -> &[LocalNode] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&LocalNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Stops a node's listener without telling the partition, as a crashed
    /// node would. Its containers keep their state and connections accepted
    /// earlier stay open.
    pub fn crash(&mut self, name: &str) -> bool {
        match self.nodes.iter_mut().find(|n| n.name == name) {
            Some(node) => {
                warn!("Stopping listener of node {}", name);
                node.stop_server();
                true
            }
            None => false,
        }
    }

    /// Takes a node out of the partition and stops it.
    pub async fn leave(&mut self, name: &str) -> bool {
        let Some(idx) = self.nodes.iter().position(|n| n.name == name) else {
            return false;
        };
        let mut node = self.nodes.remove(idx);
        self.partition.leave(&node.name);
        // Unlink both ways first: stopping the node removes its sessions,
        // which must not evict the replicas the survivors now own
        for peer in &self.nodes {
            for group in &peer.groups {
                group.remove_peer(&node.name);
            }
            for group in &node.groups {
                group.remove_peer(&peer.name);
            }
        }
        node.stop_server();
        node.registry.shutdown().await;
        true
    }

    pub async fn shutdown(mut self) {
        for mut node in self.nodes.drain(..) {
            node.stop_server();
            node.registry.shutdown().await;
            info!("Node {} stopped", node.name);
        }
    }
}
