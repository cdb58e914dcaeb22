//! Stateful session container.
//!
//! A [`Container`] hosts one bean type: it owns the [`StatefulCache`] of
//! that bean's sessions, resolves incoming method hashes through a
//! [`MethodTable`], runs the [`InterceptorChain`] and reports per-method
//! metrics. Containers of one node live in a [`ContainerRegistry`] and are
//! served over TCP by a [`ContainerServer`].
//!
//! # Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use serde_json::{json, Value};
//! use statebean_common::{MethodSignature, Result};
//! use statebean_container::{Bean, BeanDescriptor, Container, ContainerConfig, Lifecycle, SerdeBeanFactory};
//! use std::sync::Arc;
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct Cart {
//!     items: Vec<String>,
//! }
//!
//! impl Bean for Cart {
//!     fn invoke(&mut self, method: &MethodSignature, args: Value) -> Result<Value> {
//!         if method.name == "add" {
//!             self.items.push(args.as_str().unwrap_or_default().to_string());
//!         }
//!         Ok(json!(self.items.len()))
//!     }
//!
//!     fn state(&self) -> Result<Value> {
//!         Ok(serde_json::to_value(self)?)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let descriptor = BeanDescriptor::new("cart").with_method("add", &["String"]);
//! let factory = Arc::new(SerdeBeanFactory::new(|_| Ok(Cart::default())));
//! let container = Container::start(ContainerConfig::new("cart"), descriptor, factory, Lifecycle::new()).await?;
//!
//! let handle = container.create_session(Value::Null)?;
//! let add = MethodSignature::new("add", &["String"]);
//! let response = container.invoke_local(&add, Some(handle.session_id), json!("apple")).await;
//! assert_eq!(response.outcome?, json!(1));
//! # Ok(())
//! # }
//! ```

pub mod bean;
pub mod cache;
pub mod config;
pub mod container;
pub mod context;
pub mod dispatcher;
pub mod interceptor;
pub mod methods;
pub mod registry;
pub mod server;
pub mod store;

pub use bean::{
    Bean, BeanDescriptor, BeanFactory, Lifecycle, LifecycleCallback, LifecycleEvent,
    SerdeBeanFactory,
};
pub use cache::{CacheBuilder, ScanReport, StatefulCache};
pub use config::{
    CacheConfig, CacheKind, ConcurrencyPolicy, ContainerConfig, DeploymentConfig, InterceptorKind,
};
pub use container::{Container, ContainerBuilder};
pub use context::{BeanContext, ContextGuard, ContextInfo};
pub use dispatcher::{CallPhase, Dispatcher, InvocationResponse};
pub use interceptor::{
    Interceptor, InterceptorChain, Invocation, LoggingInterceptor, TransactionInterceptor,
    TxAttribute,
};
pub use methods::{HomeMethod, MethodInfo, MethodKind, MethodTable, ObjectMethod};
pub use registry::ContainerRegistry;
pub use server::ContainerServer;
pub use store::{FilePassivationStore, MemoryPassivationStore, PassivatedState, PassivationStore};
