use serde_json::Value;
use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::{AdminRequest, Envelope, Request, Response};
use std::sync::Arc;
use tracing::trace;

use crate::pool::{ConnectionPool, PoolConfig};

/// Network client for container servers.
///
/// Sends envelopes to any locator over pooled connections. Cloning is cheap
/// and clones share the pool.
#[derive(Debug, Clone)]
pub struct BeanClient {
    pool: Arc<ConnectionPool>,
}

impl BeanClient {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Self::with_pool(Arc::new(ConnectionPool::new(config)))
    }

    pub fn with_pool(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Sends one envelope and waits for its response.
    ///
    /// Fails with `Unreachable` only when no connection could be opened. A
    /// connection that failed mid-call is closed rather than pooled; when the
    /// peer dropped it, idle connections to that locator are closed as well so
    /// the next call reconnects.
    pub async fn send(&self, locator: &str, envelope: &Envelope) -> Result<Response> {
        let mut conn = self.pool.acquire(locator).await?;
        trace!("Sending envelope {} to {}", envelope.id(), locator);

        let transport = self.pool.transport();
        let outcome = match conn.stream() {
            Ok(stream) => transport.send(stream, envelope).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            conn.mark_broken();
            if matches!(e, BeanError::Connection(_)) {
                drop(conn);
                self.pool.evict(locator);
            }
        }
        outcome
    }

    pub async fn invoke(&self, locator: &str, request: Request) -> Result<Response> {
        self.send(locator, &Envelope::Invoke(request)).await
    }

    /// Calls a built-in endpoint and returns its payload.
    pub async fn admin(&self, locator: &str, request: AdminRequest) -> Result<Value> {
        self.send(locator, &Envelope::Admin(request))
            .await?
            .into_result()
    }
}

impl Default for BeanClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use statebean_common::transport::TcpServer;

    async fn echo_server() -> (String, tokio::task::JoinHandle<Result<()>>) {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            server
                .run_with_handler(|envelope| async move {
                    match envelope {
                        Envelope::Invoke(request) => Ok(Response::success(request.id, request.args)),
                        Envelope::Admin(request) => Ok(Response::success(request.id, json!(request.endpoint))),
                    }
                })
                .await
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_calls_share_one_connection() {
        let (addr, task) = echo_server().await;
        let client = BeanClient::new();

        for n in 0..3 {
            let request = Request::new("echo", statebean_common::MethodHash(1), json!(n));
            let response = client.invoke(&addr, request).await.unwrap();
            assert_eq!(response.into_result().unwrap(), json!(n));
        }
        assert_eq!(client.pool().open_count(&addr), 1);
        assert_eq!(client.admin(&addr, AdminRequest::new("_info")).await.unwrap(), json!("_info"));

        task.abort();
    }

    #[tokio::test]
    async fn test_unreachable_locator_is_reported_as_unsent() {
        let client = BeanClient::new();
        let err = client
            .admin("127.0.0.1:1", AdminRequest::new("_info"))
            .await
            .unwrap_err();
        assert!(matches!(err, BeanError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_dropped_connection_is_not_unreachable() {
        // Accepts, reads the request, then hangs up without answering
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let _ = statebean_common::transport::TcpTransport::receive_message(&mut stream).await;
            }
        });

        let client = BeanClient::new();
        let err = client
            .admin(&addr, AdminRequest::new("_info"))
            .await
            .unwrap_err();
        assert!(matches!(err, BeanError::Connection(_)), "unexpected error: {:?}", err);
        assert!(!err.is_unreachable());
        assert_eq!(client.pool().open_count(&addr), 0);

        task.abort();
    }
}
