//! Beans the `serve` command knows how to deploy.
//!
//! Containers are matched to beans by name: a container called `cart` runs
//! [`ShoppingCart`], one called `counter` runs [`Counter`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use statebean_cluster::ClusterConfig;
use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::MethodSignature;
use statebean_container::{Bean, BeanDescriptor, BeanFactory, ContainerConfig, DeploymentConfig, SerdeBeanFactory};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const CART: &str = "cart";
pub const COUNTER: &str = "counter";

/// Names of every bean in the catalog.
pub const BEANS: [&str; 2] = [CART, COUNTER];

/// A shopping cart keyed by item name.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoppingCart {
    pub owner: Option<String>,
    pub items: BTreeMap<String, u32>,
}

impl ShoppingCart {
    fn item(args: &Value) -> Result<String> {
        args.as_str()
            .map(str::to_string)
            .ok_or_else(|| BeanError::application("expected an item name"))
    }
}

impl Bean for ShoppingCart {
    fn invoke(&mut self, method: &MethodSignature, args: Value) -> Result<Value> {
        match method.name.as_str() {
            "addItem" => {
                let count = self.items.entry(Self::item(&args)?).or_insert(0);
                *count += 1;
                Ok(json!(*count))
            }
            "removeItem" => {
                let item = Self::item(&args)?;
                match self.items.get_mut(&item) {
                    Some(count) if *count > 1 => {
                        *count -= 1;
                        Ok(json!(*count))
                    }
                    Some(_) => {
                        self.items.remove(&item);
                        Ok(json!(0))
                    }
                    None => Err(BeanError::application(format!("'{}' is not in the cart", item))),
                }
            }
            "getItems" => Ok(json!(self.items)),
            "checkout" => {
                let total: u32 = self.items.values().sum();
                self.items.clear();
                Ok(json!({ "owner": self.owner, "items": total }))
            }
            other => Err(BeanError::application(format!("cart has no method '{}'", other))),
        }
    }

    fn state(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// A single running total.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub count: i64,
}

impl Bean for Counter {
    fn invoke(&mut self, method: &MethodSignature, args: Value) -> Result<Value> {
        match method.name.as_str() {
            "add" => {
                self.count += args.as_i64().unwrap_or(1);
                Ok(json!(self.count))
            }
            "get" => Ok(json!(self.count)),
            "reset" => {
                self.count = 0;
                Ok(json!(0))
            }
            other => Err(BeanError::application(format!("counter has no method '{}'", other))),
        }
    }

    fn state(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Descriptor and factory for the bean deployed as `container`.
pub fn bean(container: &str) -> Result<(BeanDescriptor, Arc<dyn BeanFactory>)> {
    match container {
        CART => {
            let descriptor = BeanDescriptor::new(CART)
                .with_method("addItem", &["String"])
                .with_method("removeItem", &["String"])
                .with_method("getItems", &[])
                .with_method("checkout", &[]);
            let factory = SerdeBeanFactory::new(|init: Value| {
                Ok(ShoppingCart {
                    owner: init.as_str().map(str::to_string),
                    items: BTreeMap::new(),
                })
            });
            Ok((descriptor, Arc::new(factory)))
        }
        COUNTER => {
            let descriptor = BeanDescriptor::new(COUNTER)
                .with_method("add", &["i64"])
                .with_method("get", &[])
                .with_method("reset", &[]);
            let factory = SerdeBeanFactory::new(|init: Value| {
                Ok(Counter {
                    count: init.as_i64().unwrap_or(0),
                })
            });
            Ok((descriptor, Arc::new(factory)))
        }
        other => Err(BeanError::Deployment(format!(
            "no bean named '{}' (known: {})",
            other,
            BEANS.join(", ")
        ))),
    }
}

/// Deployment used when `serve` gets no config file: both beans, the cart
/// clustered.
pub fn default_deployment() -> DeploymentConfig {
    let cluster = ClusterConfig {
        enabled: true,
        ..ClusterConfig::default()
    };
    DeploymentConfig {
        containers: vec![
            ContainerConfig::new(CART).with_cluster(cluster),
            ContainerConfig::new(COUNTER),
        ],
        ..DeploymentConfig::default()
    }
}
