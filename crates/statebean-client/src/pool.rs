use parking_lot::Mutex;
use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::transport::TcpTransport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Connection pool configuration.
///
/// # Default Configuration
///
/// - `max_connections`: 10 open connections per locator
/// - `max_idle`: 10 idle connections kept per locator
/// - `acquire_timeout_ms`: 30000 (30 seconds)
///
/// # Example
///
/// ```rust
/// use statebean_client::PoolConfig;
///
/// // Never keep a connection between calls
/// let config = PoolConfig {
///     max_idle: 0,
///     ..PoolConfig::default()
/// };
/// assert_eq!(config.max_connections, 10);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of open connections per locator, idle or in use
    pub max_connections: usize,
    /// Maximum number of idle connections kept per locator
    pub max_idle: usize,
    /// Maximum time to wait for a free slot in milliseconds
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_idle: 10,
            acquire_timeout_ms: 30000, // 30 seconds
        }
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    idle: HashMap<String, Vec<TcpStream>>,
    open: HashMap<String, usize>,
}

impl PoolInner {
    fn closed(&mut self, addr: &str) {
        if let Some(open) = self.open.get_mut(addr) {
            *open = open.saturating_sub(1);
        }
    }
}

/// Pool of TCP connections to invoker locators.
///
/// Connections are grouped by locator and reused LIFO. A checked-out
/// connection is a [`PooledConnection`]; dropping it hands the stream back
/// unless it was marked broken.
///
/// # Example
///
/// ```rust,no_run
/// use statebean_client::{ConnectionPool, PoolConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ConnectionPool::new(PoolConfig::default());
/// let conn = pool.acquire("127.0.0.1:7800").await?;
/// // Use conn.stream()...
/// drop(conn); // back to the pool
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConnectionPool {
    transport: TcpTransport,
    config: PoolConfig,
    inner: Arc<Mutex<PoolInner>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_transport(TcpTransport::new(), config)
    }

    pub fn with_transport(transport: TcpTransport, config: PoolConfig) -> Self {
        Self {
            transport,
            config,
            inner: Arc::new(Mutex::new(PoolInner::default())),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn transport(&self) -> &TcpTransport {
        &self.transport
    }

    /// Acquires a connection to `addr`, reusing an idle one when possible.
    ///
    /// When `max_connections` are already open the call waits for one to be
    /// returned and fails with `Timeout` after `acquire_timeout_ms`.
    pub async fn acquire(&self, addr: &str) -> Result<PooledConnection> {
        let deadline = Duration::from_millis(self.config.acquire_timeout_ms);
        let start = Instant::now();

        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(stream) = inner.idle.get_mut(addr).and_then(|idle| idle.pop()) {
                    return Ok(self.checked_out(addr, stream));
                }

                let open = inner.open.entry(addr.to_string()).or_insert(0);
                if *open < self.config.max_connections {
                    *open += 1;
                    break;
                }
            }

            if start.elapsed() >= deadline {
                return Err(BeanError::Timeout(self.config.acquire_timeout_ms));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The slot is reserved; connect without holding the lock
        match self.transport.connect(addr).await {
            Ok(stream) => {
                debug!("Opened pooled connection to {}", addr);
                Ok(self.checked_out(addr, stream))
            }
            Err(e) => {
                self.inner.lock().closed(addr);
                Err(e)
            }
        }
    }

    /// Closes every idle connection to `addr`.
    ///
    /// Connections currently checked out are closed when they come back.
    pub fn evict(&self, addr: &str) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.idle.remove(addr).map(|idle| idle.len()).unwrap_or(0);
        for _ in 0..dropped {
            inner.closed(addr);
        }
        if dropped > 0 {
            debug!("Evicted {} idle connection(s) to {}", dropped, addr);
        }
        dropped
    }

    pub fn idle_count(&self, addr: &str) -> usize {
        self.inner.lock().idle.get(addr).map(Vec::len).unwrap_or(0)
    }

    pub fn open_count(&self, addr: &str) -> usize {
        self.inner.lock().open.get(addr).copied().unwrap_or(0)
    }

    fn checked_out(&self, addr: &str, stream: TcpStream) -> PooledConnection {
        PooledConnection {
            stream: Some(stream),
            addr: addr.to_string(),
            broken: false,
            max_idle: self.config.max_idle,
            pool: self.inner.clone(),
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
#[derive(Debug)]
pub struct PooledConnection {
    stream: Option<TcpStream>,
    addr: String,
    broken: bool,
    max_idle: usize,
    pool: Arc<Mutex<PoolInner>>,
}

impl PooledConnection {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| BeanError::Connection(format!("connection to {} already closed", self.addr)))
    }

    /// Closes the connection instead of returning it on drop.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };

        let mut inner = self.pool.lock();
        let idle = inner.idle.entry(self.addr.clone()).or_default();
        if !self.broken && idle.len() < self.max_idle {
            idle.push(stream);
        } else {
            inner.closed(&self.addr);
        }
    }
}
