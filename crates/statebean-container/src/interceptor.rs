//! Interceptors run around every business-method invocation.
//!
//! The chain wraps the call the same way on every path: `before_invoke`
//! hooks run in order, then the bean method, then `after_invoke` hooks in
//! reverse order. A `before_invoke` error aborts the call.

use serde_json::Value;
use statebean_common::protocol::error::Result;
use statebean_common::{MethodSignature, SessionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use crate::config::InterceptorKind;
use crate::context::ContextGuard;

/// One business call as seen by interceptors.
pub struct Invocation<'a> {
    pub container: &'a str,
    pub method: &'a MethodSignature,
    pub session_id: SessionId,
    pub args: Value,
    /// Free-form values interceptors attach to the call
    pub attributes: HashMap<String, Value>,
    context: &'a mut ContextGuard,
}

impl<'a> Invocation<'a> {
    pub fn new(
        container: &'a str,
        method: &'a MethodSignature,
        args: Value,
        context: &'a mut ContextGuard,
    ) -> Self {
        Self {
            container,
            method,
            session_id: context.id(),
            args,
            attributes: HashMap::new(),
            context,
        }
    }

    /// Calls the bean method with the (possibly rewritten) arguments.
    fn dispatch(&mut self) -> Result<Value> {
        let args = std::mem::take(&mut self.args);
        let result = self.context.instance_mut()?.invoke(self.method, args);
        // The bean may have changed state even if it then failed
        self.context.mark_dirty();
        result
    }
}

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn before_invoke(&self, _invocation: &mut Invocation<'_>) -> Result<()> {
        Ok(())
    }

    /// May replace the outcome.
    fn after_invoke(&self, _invocation: &mut Invocation<'_>, result: Result<Value>) -> Result<Value> {
        result
    }
}

/// Ordered interceptors of one container.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    /// Builds the built-in interceptors named in configuration.
    pub fn from_kinds(kinds: &[InterceptorKind]) -> Self {
        let interceptors = kinds
            .iter()
            .map(|kind| -> Arc<dyn Interceptor> {
                match kind {
                    InterceptorKind::Logging => Arc::new(LoggingInterceptor),
                    InterceptorKind::Transaction => Arc::new(TransactionInterceptor::new()),
                }
            })
            .collect();
        Self { interceptors }
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn invoke(&self, invocation: &mut Invocation<'_>) -> Result<Value> {
        for (entered, interceptor) in self.interceptors.iter().enumerate() {
            if let Err(e) = interceptor.before_invoke(invocation) {
                // Interceptors already entered still see the failure
                return self.unwind(&self.interceptors[..entered], invocation, Err(e));
            }
        }
        let result = invocation.dispatch();
        self.unwind(&self.interceptors, invocation, result)
    }

    fn unwind(
        &self,
        entered: &[Arc<dyn Interceptor>],
        invocation: &mut Invocation<'_>,
        mut result: Result<Value>,
    ) -> Result<Value> {
        for interceptor in entered.iter().rev() {
            result = interceptor.after_invoke(invocation, result);
        }
        result
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Traces each call with its outcome and duration.
pub struct LoggingInterceptor;

const STARTED_AT: &str = "logging.started_us";

impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn before_invoke(&self, invocation: &mut Invocation<'_>) -> Result<()> {
        trace!(
            "-> {}.{} session={}",
            invocation.container,
            invocation.method,
            invocation.session_id
        );
        invocation
            .attributes
            .insert(STARTED_AT.to_string(), Value::from(monotonic_us()));
        Ok(())
    }

    fn after_invoke(&self, invocation: &mut Invocation<'_>, result: Result<Value>) -> Result<Value> {
        let started = invocation
            .attributes
            .get(STARTED_AT)
            .and_then(Value::as_u64)
            .unwrap_or_default();
        let elapsed_us = monotonic_us().saturating_sub(started);
        match &result {
            Ok(_) => trace!(
                "<- {}.{} session={} ok in {}us",
                invocation.container,
                invocation.method,
                invocation.session_id,
                elapsed_us
            ),
            Err(e) => debug!(
                "<- {}.{} session={} failed in {}us: {}",
                invocation.container,
                invocation.method,
                invocation.session_id,
                elapsed_us,
                e
            ),
        }
        result
    }
}

fn monotonic_us() -> u64 {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Declared transaction behavior of a method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TxAttribute {
    #[default]
    Supports,
    Required,
}

impl TxAttribute {
    pub fn as_str(self) -> &'static str {
        match self {
            TxAttribute::Supports => "supports",
            TxAttribute::Required => "required",
        }
    }
}

/// Tags each call with its transaction attribute.
///
/// No transaction manager is attached: `Required` methods get a fresh
/// transaction id recorded under `tx.id`, nothing more.
#[derive(Debug, Default)]
pub struct TransactionInterceptor {
    attributes: HashMap<String, TxAttribute>,
    next_tx: AtomicU64,
}

pub const TX_ATTRIBUTE: &str = "tx";
pub const TX_ID: &str = "tx.id";

impl TransactionInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, method: &MethodSignature, attribute: TxAttribute) -> Self {
        self.attributes.insert(method.canonical(), attribute);
        self
    }

    pub fn attribute(&self, method: &MethodSignature) -> TxAttribute {
        self.attributes
            .get(&method.canonical())
            .copied()
            .unwrap_or_default()
    }
}

impl Interceptor for TransactionInterceptor {
    fn name(&self) -> &'static str {
        "transaction"
    }

    fn before_invoke(&self, invocation: &mut Invocation<'_>) -> Result<()> {
        let attribute = self.attribute(invocation.method);
        invocation
            .attributes
            .insert(TX_ATTRIBUTE.to_string(), Value::from(attribute.as_str()));
        if attribute == TxAttribute::Required {
            let tx = self.next_tx.fetch_add(1, Ordering::Relaxed) + 1;
            invocation.attributes.insert(TX_ID.to_string(), Value::from(tx));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bean::test_support::counter_factory;
    use crate::cache::StatefulCache;
    use crate::config::CacheConfig;
    use parking_lot::Mutex;
    use serde_json::json;
    use statebean_common::BeanError;

    /// Records hook order and optionally rejects calls.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        reject: bool,
    }

    impl Interceptor for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn before_invoke(&self, _invocation: &mut Invocation<'_>) -> Result<()> {
            self.log.lock().push(format!("before {}", self.name));
            if self.reject {
                return Err(BeanError::application("rejected"));
            }
            Ok(())
        }

        fn after_invoke(&self, _invocation: &mut Invocation<'_>, result: Result<Value>) -> Result<Value> {
            self.log.lock().push(format!("after {}", self.name));
            result
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>, reject: bool) -> Arc<dyn Interceptor> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            reject,
        })
    }

    #[test]
    fn test_hooks_wrap_the_call_in_order() {
        let cache = StatefulCache::builder("counter", CacheConfig::new(), counter_factory())
            .build()
            .unwrap();
        let mut guard = cache.create(json!(1)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new(vec![recorder("a", &log, false), recorder("b", &log, false)]);

        let add = MethodSignature::new("add", &["i64"]);
        let mut invocation = Invocation::new("counter", &add, json!(2), &mut guard);
        assert_eq!(chain.invoke(&mut invocation).unwrap(), json!(3));
        assert_eq!(*log.lock(), vec!["before a", "before b", "after b", "after a"]);
    }

    #[test]
    fn test_rejection_skips_the_bean() {
        let cache = StatefulCache::builder("counter", CacheConfig::new(), counter_factory())
            .build()
            .unwrap();
        let mut guard = cache.create(json!(1)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new(vec![recorder("a", &log, false), recorder("b", &log, true)]);

        let add = MethodSignature::new("add", &["i64"]);
        let mut invocation = Invocation::new("counter", &add, json!(2), &mut guard);
        assert!(chain.invoke(&mut invocation).is_err());
        assert_eq!(*log.lock(), vec!["before a", "before b", "after a"]);
        drop(invocation);

        let get = MethodSignature::new("get", &[]);
        let mut invocation = Invocation::new("counter", &get, Value::Null, &mut guard);
        assert_eq!(InterceptorChain::default().invoke(&mut invocation).unwrap(), json!(1));
    }

    #[test]
    fn test_transaction_attribute_recorded() {
        let cache = StatefulCache::builder("counter", CacheConfig::new(), counter_factory())
            .build()
            .unwrap();
        let mut guard = cache.create(json!(0)).unwrap();
        let add = MethodSignature::new("add", &["i64"]);
        let tx = TransactionInterceptor::new().with_attribute(&add, TxAttribute::Required);

        let mut invocation = Invocation::new("counter", &add, json!(1), &mut guard);
        tx.before_invoke(&mut invocation).unwrap();
        assert_eq!(invocation.attributes[TX_ATTRIBUTE], json!("required"));
        assert_eq!(invocation.attributes[TX_ID], json!(1));

        let get = MethodSignature::new("get", &[]);
        assert_eq!(tx.attribute(&get), TxAttribute::Supports);
    }

    #[test]
    fn test_chain_from_config() {
        let chain = InterceptorChain::from_kinds(&[InterceptorKind::Logging, InterceptorKind::Transaction]);
        assert_eq!(chain.names(), vec!["logging", "transaction"]);
    }
}
