// Proxy and factory tests
//
// Remote and clustered proxies run against real container servers bound to
// loopback ports.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use statebean_client::{
    BeanClient, ClusteredProxyFactory, ConnectionPool, LocalProxyFactory, PoolConfig,
    RemoteProxyFactory, SessionHandle,
};
use statebean_cluster::{ClusterConfig, FamilyRegistry, LoadBalancePolicyKind, Replicant};
use statebean_common::transport::TcpTransport;
use statebean_common::{BeanError, MethodSignature, NotFoundReason, Result};
use statebean_container::{
    Bean, BeanDescriptor, Container, ContainerConfig, ContainerRegistry, ContainerServer,
    Lifecycle, SerdeBeanFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct Counter {
    count: i64,
}

impl Bean for Counter {
    fn invoke(&mut self, method: &MethodSignature, args: Value) -> Result<Value> {
        match method.name.as_str() {
            "add" => {
                self.count += args.as_i64().unwrap_or(1);
                Ok(json!(self.count))
            }
            "get" => Ok(json!(self.count)),
            _ => Err(BeanError::application("counter refused")),
        }
    }

    fn state(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn add() -> MethodSignature {
    MethodSignature::new("add", &["i64"])
}

fn get() -> MethodSignature {
    MethodSignature::new("get", &[])
}

fn clustered(policy: LoadBalancePolicyKind) -> ClusterConfig {
    ClusterConfig {
        enabled: true,
        policy,
        ..ClusterConfig::default()
    }
}

async fn counter(config: ContainerConfig) -> Arc<Container> {
    let name = config.name.clone();
    let descriptor = BeanDescriptor::new(name)
        .with_method("add", &["i64"])
        .with_method("get", &[])
        .with_method("fail", &[]);
    let factory = Arc::new(SerdeBeanFactory::new(|init: Value| {
        // Lets a test outlast the client's transport timeout
        if let Some(ms) = init.get("delay_ms").and_then(Value::as_u64) {
            std::thread::sleep(Duration::from_millis(ms));
        }
        Ok(Counter {
            count: init.as_i64().unwrap_or(0),
        })
    }));
    Container::start(config, descriptor, factory, Lifecycle::new())
        .await
        .unwrap()
}

async fn serve(container: Arc<Container>, node: &str) -> (String, JoinHandle<Result<()>>) {
    let registry = Arc::new(ContainerRegistry::new());
    registry.register(container).unwrap();
    let server = ContainerServer::bind("127.0.0.1:0", registry, node)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    (addr, tokio::spawn(server.run()))
}

async fn dead_locator() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

// ============================================================================
// Local proxies
// ============================================================================

#[tokio::test]
async fn test_local_proxy_round_trip() {
    let container = counter(ContainerConfig::new("counter")).await;
    let factory = LocalProxyFactory::new(container.clone());

    let proxy = factory.create_proxy(json!(10)).unwrap();
    assert_eq!(proxy.invoke(&add(), json!(5)).await.unwrap(), json!(15));
    let id = proxy.session_id().unwrap();
    assert_eq!(proxy.handle().unwrap().session_id, id);

    // A second proxy for the same id sees the same state
    let other = factory.create_proxy_for(id);
    assert_eq!(other.invoke(&get(), Value::Null).await.unwrap(), json!(15));

    proxy.remove().await.unwrap();
    assert!(matches!(
        other.invoke(&get(), Value::Null).await,
        Err(BeanError::ContextNotFound { reason: NotFoundReason::Removed, .. })
    ));
}

#[tokio::test]
async fn test_unbound_local_proxy_adopts_created_session() {
    let container = counter(ContainerConfig::new("counter")).await;
    let proxy = statebean_client::LocalProxy::new(container.clone(), None);
    assert!(proxy.session_id().is_none());

    proxy.invoke(&add(), json!(2)).await.unwrap();
    let id = proxy.session_id().unwrap();
    assert!(container.cache().contains(id));
    assert_eq!(proxy.invoke(&add(), json!(2)).await.unwrap(), json!(4));
    assert_eq!(proxy.session_id(), Some(id));
}

#[tokio::test]
async fn test_local_factory_requires_deployed_container() {
    let registry = ContainerRegistry::new();
    assert!(matches!(
        LocalProxyFactory::from_registry(&registry, "counter"),
        Err(BeanError::Deployment(_))
    ));
}

// ============================================================================
// Remote proxies
// ============================================================================

#[tokio::test]
async fn test_remote_proxy_over_loopback() {
    let container = counter(ContainerConfig::new("counter")).await;
    let (addr, task) = serve(container.clone(), "node1").await;
    let factory = RemoteProxyFactory::new(BeanClient::new(), addr.clone(), "counter");

    let proxy = factory.create_proxy(json!(1)).await.unwrap();
    assert_eq!(proxy.invoke(&add(), json!(2)).await.unwrap(), json!(3));
    assert_eq!(container.stats().current_size, 1);

    let metadata = factory.metadata().await.unwrap();
    assert_eq!(metadata["container"], json!("counter"));
    assert_eq!(factory.home_handle().await.unwrap().container, "counter");

    // Errors keep their variant across the wire
    assert!(matches!(
        proxy.invoke(&MethodSignature::new("fail", &[]), Value::Null).await,
        Err(BeanError::Application(_))
    ));

    factory.remove(&proxy.handle().unwrap()).await.unwrap();
    assert!(matches!(
        proxy.invoke(&get(), Value::Null).await,
        Err(BeanError::ContextNotFound { .. })
    ));

    task.abort();
}

#[tokio::test]
async fn test_remote_factory_surfaces_unreachable_locator() {
    let factory = RemoteProxyFactory::new(BeanClient::new(), dead_locator().await, "counter");
    let err = factory.create_proxy(Value::Null).await.unwrap_err();
    assert!(err.is_connection_failure());
}

// ============================================================================
// Clustered proxies
// ============================================================================

#[tokio::test]
async fn test_clustered_proxy_fails_over_unreachable_replicant() {
    let config = ContainerConfig::new("counter").with_cluster(clustered(LoadBalancePolicyKind::FirstAvailable));
    let (live, task) = serve(counter(config.clone()).await, "node2").await;
    let dead = dead_locator().await;

    let families = FamilyRegistry::new();
    let factory =
        ClusteredProxyFactory::new(BeanClient::new(), &families, "counter", &config.cluster).unwrap();
    assert_eq!(factory.load_balance_policy(), LoadBalancePolicyKind::FirstAvailable);
    families.replicants_changed(
        "counter",
        vec![Replicant::new("node1", dead), Replicant::new("node2", live)],
        1,
    );

    let proxy = factory.create_proxy(json!(0)).await.unwrap();
    assert_eq!(proxy.invoke(&add(), json!(7)).await.unwrap(), json!(7));
    let handle = proxy.handle().unwrap();
    assert!(handle.clustered);
    assert_eq!(handle.family.as_deref(), Some("counter"));

    task.abort();
}

#[tokio::test]
async fn test_clustered_proxy_without_targets() {
    let config = clustered(LoadBalancePolicyKind::RoundRobin);
    let families = FamilyRegistry::new();
    let factory = ClusteredProxyFactory::new(BeanClient::new(), &families, "counter", &config).unwrap();

    // Empty view
    assert!(matches!(
        factory.create_proxy(Value::Null).await,
        Err(BeanError::NoReplicants(_))
    ));

    // Every replicant tried once, then given up
    families.replicants_changed(
        "counter",
        vec![
            Replicant::new("node1", dead_locator().await),
            Replicant::new("node2", dead_locator().await),
        ],
        1,
    );
    assert!(matches!(
        factory.create_proxy(Value::Null).await,
        Err(BeanError::NoReplicants(_))
    ));
}

#[tokio::test]
async fn test_application_errors_are_not_failed_over() {
    let config = ContainerConfig::new("counter").with_cluster(clustered(LoadBalancePolicyKind::FirstAvailable));
    let first = counter(config.clone()).await;
    let second = counter(config.clone()).await;
    let (a, task_a) = serve(first.clone(), "node1").await;
    let (b, task_b) = serve(second.clone(), "node2").await;

    let families = FamilyRegistry::new();
    let factory =
        ClusteredProxyFactory::new(BeanClient::new(), &families, "counter", &config.cluster).unwrap();
    families.replicants_changed(
        "counter",
        vec![Replicant::new("node1", a), Replicant::new("node2", b)],
        1,
    );

    // Sticky on node1; the failure comes back from there
    let proxy = factory.create_proxy(Value::Null).await.unwrap();
    assert!(first.cache().contains(proxy.session_id().unwrap()));
    assert!(matches!(
        proxy.invoke(&MethodSignature::new("fail", &[]), Value::Null).await,
        Err(BeanError::Application(_))
    ));
    assert_eq!(first.metrics_snapshot().failed_requests, 1);
    assert_eq!(second.metrics_snapshot().total_requests, 0);

    task_a.abort();
    task_b.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_call_outliving_transport_timeout_is_not_repeated() {
    let config = ContainerConfig::new("counter").with_cluster(clustered(LoadBalancePolicyKind::FirstAvailable));
    let first = counter(config.clone()).await;
    let second = counter(config.clone()).await;
    let (a, task_a) = serve(first.clone(), "node1").await;
    let (b, task_b) = serve(second.clone(), "node2").await;

    let pool = ConnectionPool::with_transport(
        TcpTransport::with_timeout(Duration::from_millis(100)),
        PoolConfig::default(),
    );
    let families = FamilyRegistry::new();
    let factory = ClusteredProxyFactory::new(
        BeanClient::with_pool(Arc::new(pool)),
        &families,
        "counter",
        &config.cluster,
    )
    .unwrap();
    families.replicants_changed(
        "counter",
        vec![Replicant::new("node1", a), Replicant::new("node2", b)],
        1,
    );

    // The request reached node1, so its outcome is unknown rather than failed
    let err = factory
        .create_proxy(json!({ "delay_ms": 400 }))
        .await
        .unwrap_err();
    assert!(matches!(err, BeanError::Timeout(100)), "unexpected error: {:?}", err);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(first.stats().create_count, 1);
    assert_eq!(second.stats().create_count, 0);
    assert_eq!(second.metrics_snapshot().total_requests, 0);

    task_a.abort();
    task_b.abort();
}

#[tokio::test]
async fn test_departed_replicant_connections_are_closed() {
    let config = ContainerConfig::new("counter").with_cluster(clustered(LoadBalancePolicyKind::FirstAvailable));
    let (addr, task) = serve(counter(config.clone()).await, "node1").await;

    let client = BeanClient::new();
    let families = FamilyRegistry::new();
    let factory =
        ClusteredProxyFactory::new(client.clone(), &families, "counter", &config.cluster).unwrap();
    families.replicants_changed("counter", vec![Replicant::new("node1", addr.clone())], 1);

    factory.create_proxy(Value::Null).await.unwrap();
    assert_eq!(client.pool().idle_count(&addr), 1);

    families.replicants_changed("counter", Vec::new(), 2);
    assert_eq!(client.pool().idle_count(&addr), 0);

    task.abort();
}

#[test]
fn test_clustered_factory_requires_clustering() {
    let families = FamilyRegistry::new();
    assert!(matches!(
        ClusteredProxyFactory::new(BeanClient::new(), &families, "counter", &ClusterConfig::default()),
        Err(BeanError::Deployment(_))
    ));
    assert!(families.is_empty());
}
