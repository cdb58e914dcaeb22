use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::protocol::error::{BeanError, Result};
use crate::protocol::{Envelope, Response};
use crate::transport::codec::JsonCodec;
use crate::transport::tcp::TcpTransport;

/// Async TCP server speaking the length-prefixed JSON protocol.
///
/// Each accepted connection gets its own task and may carry any number of
/// requests (keep-alive) until the peer closes it.
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    /// Creates a new TCP server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:7800")
    pub async fn new(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| BeanError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| BeanError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Runs the server with the given request handler.
    ///
    /// A handler error is turned into an error response for that request; it
    /// never closes the connection.
    pub async fn run_with_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Response>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            let (stream, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| BeanError::Connection(format!("Failed to accept connection: {}", e)))?;

            debug!("Connection established from {}", peer_addr);

            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler).await {
                    warn!("Connection from {} ended with error: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Handle a single TCP connection until the peer closes it.
async fn handle_connection<F, Fut>(mut stream: TcpStream, handler: Arc<F>) -> Result<()>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Response>> + Send + 'static,
{
    loop {
        let buf = match TcpTransport::receive_message(&mut stream).await {
            Ok(buf) => buf,
            // Peer closed the connection between requests
            Err(BeanError::Connection(_)) => {
                debug!("Connection closed by peer");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let envelope = match JsonCodec::decode_envelope(&buf) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Failed to decode request: {}", e);
                let error = BeanError::InvalidRequest(e.to_string());
                send_response(&mut stream, &Response::error(0, &error)).await?;
                continue;
            }
        };

        let request_id = envelope.id();
        let response = match handler(envelope).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Handler error for request {}: {}", request_id, e);
                Response::error(request_id, &e)
            }
        };

        send_response(&mut stream, &response).await?;
    }
}

async fn send_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let encoded = JsonCodec::encode_response(response)?;
    TcpTransport::send_message(stream, &encoded).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AdminRequest;
    use serde_json::json;

    #[tokio::test]
    async fn test_tcp_server_local_addr() {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        assert!(server.local_addr().is_ok());
    }

    #[tokio::test]
    async fn test_round_trip_over_loopback() {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            server
                .run_with_handler(|envelope| async move {
                    Ok(Response::success(envelope.id(), json!("pong")))
                })
                .await
        });

        let transport = TcpTransport::new();
        let mut stream = transport.connect(&addr).await.unwrap();
        // Two requests on one connection
        for _ in 0..2 {
            let envelope = Envelope::Admin(AdminRequest::new("_info"));
            let id = envelope.id();
            let response = transport.send(&mut stream, &envelope).await.unwrap();
            assert_eq!(response.id, id);
            assert_eq!(response.into_result().unwrap(), json!("pong"));
        }

        task.abort();
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            server
                .run_with_handler(|_| async move { Err(BeanError::Deployment("stopped".into())) })
                .await
        });

        let transport = TcpTransport::new();
        let mut stream = transport.connect(&addr).await.unwrap();
        let response = transport
            .send(&mut stream, &Envelope::Admin(AdminRequest::new("_info")))
            .await
            .unwrap();
        assert!(matches!(response.into_result(), Err(BeanError::Deployment(_))));

        task.abort();
    }
}
