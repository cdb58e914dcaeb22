//! Method table: hash to method resolution.
//!
//! Besides the bean's business methods, every container answers a fixed set
//! of home methods (no session needed) and object methods (operating on the
//! session itself rather than the bean).

use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::{MethodHash, MethodSignature};
use std::collections::HashMap;

use crate::bean::BeanDescriptor;

/// Parameter type name used for handle arguments.
pub const HANDLE_PARAM: &str = "Handle";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomeMethod {
    Create,
    Remove,
    GetMetaData,
    GetHomeHandle,
}

impl HomeMethod {
    /// Fixed home methods; create signatures come from the descriptor.
    pub const FIXED: [HomeMethod; 3] = [
        HomeMethod::Remove,
        HomeMethod::GetMetaData,
        HomeMethod::GetHomeHandle,
    ];

    /// Signature of a fixed home method; `None` for `Create`.
    pub fn signature(self) -> Option<MethodSignature> {
        match self {
            HomeMethod::Create => None,
            HomeMethod::Remove => Some(MethodSignature::new("remove", &[HANDLE_PARAM])),
            HomeMethod::GetMetaData => Some(MethodSignature::new("getMetaData", &[])),
            HomeMethod::GetHomeHandle => Some(MethodSignature::new("getHomeHandle", &[])),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectMethod {
    Remove,
    GetHandle,
    GetHome,
    GetPrimaryKey,
    IsIdentical,
}

impl ObjectMethod {
    pub const ALL: [ObjectMethod; 5] = [
        ObjectMethod::Remove,
        ObjectMethod::GetHandle,
        ObjectMethod::GetHome,
        ObjectMethod::GetPrimaryKey,
        ObjectMethod::IsIdentical,
    ];

    pub fn signature(self) -> MethodSignature {
        match self {
            ObjectMethod::Remove => MethodSignature::new("remove", &[]),
            ObjectMethod::GetHandle => MethodSignature::new("getHandle", &[]),
            ObjectMethod::GetHome => MethodSignature::new("getHome", &[]),
            ObjectMethod::GetPrimaryKey => MethodSignature::new("getPrimaryKey", &[]),
            ObjectMethod::IsIdentical => MethodSignature::new("isIdentical", &[HANDLE_PARAM]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Home(HomeMethod),
    Object(ObjectMethod),
    Business,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub signature: MethodSignature,
    pub kind: MethodKind,
}

/// Per-container method lookup, built once at deployment.
#[derive(Debug, Clone)]
pub struct MethodTable {
    container: String,
    methods: HashMap<MethodHash, MethodInfo>,
}

impl MethodTable {
    /// Builds the table, failing with `Deployment` when two signatures
    /// collide (the same signature declared twice included).
    pub fn build(descriptor: &BeanDescriptor) -> Result<Self> {
        let mut table = Self {
            container: descriptor.name().to_string(),
            methods: HashMap::new(),
        };

        for signature in descriptor.create_methods() {
            table.insert(signature.clone(), MethodKind::Home(HomeMethod::Create))?;
        }
        for home in HomeMethod::FIXED {
            if let Some(signature) = home.signature() {
                table.insert(signature, MethodKind::Home(home))?;
            }
        }
        for object in ObjectMethod::ALL {
            table.insert(object.signature(), MethodKind::Object(object))?;
        }
        for signature in descriptor.business_methods() {
            table.insert(signature.clone(), MethodKind::Business)?;
        }
        Ok(table)
    }

    fn insert(&mut self, signature: MethodSignature, kind: MethodKind) -> Result<()> {
        let hash = signature.hash();
        if let Some(existing) = self.methods.get(&hash) {
            return Err(BeanError::Deployment(format!(
                "method {} of '{}' collides with {} (hash {})",
                signature, self.container, existing.signature, hash
            )));
        }
        self.methods.insert(hash, MethodInfo { signature, kind });
        Ok(())
    }

    pub fn resolve(&self, hash: MethodHash) -> Result<&MethodInfo> {
        self.methods.get(&hash).ok_or_else(|| BeanError::UnknownMethod {
            container: self.container.clone(),
            hash,
        })
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Signatures of one kind, sorted by canonical form.
    pub fn signatures(&self, filter: impl Fn(&MethodKind) -> bool) -> Vec<&MethodSignature> {
        let mut signatures: Vec<&MethodSignature> = self
            .methods
            .values()
            .filter(|info| filter(&info.kind))
            .map(|info| &info.signature)
            .collect();
        signatures.sort_by_key(|sig| sig.canonical());
        signatures
    }
}
