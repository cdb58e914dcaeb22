//! Bean model: the user code a container hosts.

use serde::de::DeserializeOwned;
use serde_json::Value;
use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::MethodSignature;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A stateful bean instance.
///
/// Dispatch is table driven: the container resolves the incoming method hash
/// and hands the matching signature to [`Bean::invoke`].
pub trait Bean: Send {
    fn invoke(&mut self, method: &MethodSignature, args: Value) -> Result<Value>;

    /// Serializable conversational state, used for passivation and
    /// replication.
    fn state(&self) -> Result<Value>;
}

/// Builds bean instances, fresh or from saved state.
pub trait BeanFactory: Send + Sync {
    fn create(&self, init: Value) -> Result<Box<dyn Bean>>;

    fn restore(&self, state: Value) -> Result<Box<dyn Bean>>;
}

/// Factory for beans whose state is the bean value itself.
///
/// `restore` deserializes the bean from its saved state; `create` runs the
/// supplied constructor.
pub struct SerdeBeanFactory<T> {
    constructor: Arc<dyn Fn(Value) -> Result<T> + Send + Sync>,
    _bean: PhantomData<fn() -> T>,
}

impl<T> SerdeBeanFactory<T>
where
    T: Bean + DeserializeOwned + 'static,
{
    pub fn new<F>(constructor: F) -> Self
    where
        F: Fn(Value) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            constructor: Arc::new(constructor),
            _bean: PhantomData,
        }
    }
}

impl<T> BeanFactory for SerdeBeanFactory<T>
where
    T: Bean + DeserializeOwned + 'static,
{
    fn create(&self, init: Value) -> Result<Box<dyn Bean>> {
        Ok(Box::new((self.constructor)(init)?))
    }

    fn restore(&self, state: Value) -> Result<Box<dyn Bean>> {
        let bean: T = serde_json::from_value(state)?;
        Ok(Box::new(bean))
    }
}

/// Lifecycle transition a callback is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    PostConstruct,
    PreDestroy,
    PostActivate,
    PrePassivate,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleEvent::PostConstruct => "post-construct",
            LifecycleEvent::PreDestroy => "pre-destroy",
            LifecycleEvent::PostActivate => "post-activate",
            LifecycleEvent::PrePassivate => "pre-passivate",
        };
        f.write_str(name)
    }
}

pub type LifecycleCallback = Arc<dyn Fn(&mut dyn Bean) -> Result<()> + Send + Sync>;

/// Optional callbacks run by the cache at lifecycle transitions.
#[derive(Clone, Default)]
pub struct Lifecycle {
    post_construct: Option<LifecycleCallback>,
    pre_destroy: Option<LifecycleCallback>,
    post_activate: Option<LifecycleCallback>,
    pre_passivate: Option<LifecycleCallback>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, event: LifecycleEvent, callback: F) -> Self
    where
        F: Fn(&mut dyn Bean) -> Result<()> + Send + Sync + 'static,
    {
        let callback: LifecycleCallback = Arc::new(callback);
        match event {
            LifecycleEvent::PostConstruct => self.post_construct = Some(callback),
            LifecycleEvent::PreDestroy => self.pre_destroy = Some(callback),
            LifecycleEvent::PostActivate => self.post_activate = Some(callback),
            LifecycleEvent::PrePassivate => self.pre_passivate = Some(callback),
        }
        self
    }

    /// Runs the callback for `event`, if one is set.
    pub fn run(&self, event: LifecycleEvent, bean: &mut dyn Bean) -> Result<()> {
        let callback = match event {
            LifecycleEvent::PostConstruct => &self.post_construct,
            LifecycleEvent::PreDestroy => &self.pre_destroy,
            LifecycleEvent::PostActivate => &self.post_activate,
            LifecycleEvent::PrePassivate => &self.pre_passivate,
        };
        match callback {
            Some(callback) => callback(bean),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("post_construct", &self.post_construct.is_some())
            .field("pre_destroy", &self.pre_destroy.is_some())
            .field("post_activate", &self.post_activate.is_some())
            .field("pre_passivate", &self.pre_passivate.is_some())
            .finish()
    }
}

/// Interface of a bean: its business methods and home create methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeanDescriptor {
    name: String,
    business: Vec<MethodSignature>,
    create: Vec<MethodSignature>,
}

impl BeanDescriptor {
    /// Parameter type name of the default home create method.
    pub const CREATE_PARAM: &'static str = "json";

    /// A descriptor with the default `create(json)` home method and no
    /// business methods.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            business: Vec::new(),
            create: vec![Self::default_create()],
        }
    }

    pub fn default_create() -> MethodSignature {
        MethodSignature::new("create", &[Self::CREATE_PARAM])
    }

    pub fn with_method(mut self, name: &str, params: &[&str]) -> Self {
        self.business.push(MethodSignature::new(name, params));
        self
    }

    /// Replaces the home create methods; an empty list disables creation
    /// through the home interface.
    pub fn with_create_methods(mut self, create: Vec<MethodSignature>) -> Self {
        self.create = create;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn business_methods(&self) -> &[MethodSignature] {
        &self.business
    }

    pub fn create_methods(&self) -> &[MethodSignature] {
        &self.create
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BeanError::Deployment("bean name is empty".to_string()));
        }
        if let Some(bad) = self.create.iter().find(|sig| sig.name != "create") {
            return Err(BeanError::Deployment(format!(
                "home create method must be named 'create', got '{}'",
                bad
            )));
        }
        Ok(())
    }
}
