//! Client side of statebean.
//!
//! - [`SessionHandle`]: what callers hold; one session, one invocation path
//! - [`LocalProxy`], [`RemoteProxy`], [`ClusteredProxy`]: the three paths
//! - [`LocalProxyFactory`], [`RemoteProxyFactory`], [`ClusteredProxyFactory`]:
//!   create sessions and hand out proxies for them
//! - [`BeanClient`] / [`ConnectionPool`]: pooled TCP to container servers

pub mod client;
pub mod factory;
pub mod pool;
pub mod proxy;

pub use client::BeanClient;
pub use factory::{ClusteredProxyFactory, LocalProxyFactory, RemoteProxyFactory};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use proxy::{ClusteredProxy, LocalProxy, RemoteProxy, SessionHandle};
