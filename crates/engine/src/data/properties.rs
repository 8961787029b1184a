//! Content-addressed store of serialized workflow variables.
//!
//! Values are keyed by the SHA-256 of their serialized bytes, so identical
//! values are stored once no matter how many branches reference them.
//! `PropertyStore::filter` is the reachability GC: it recomputes the root
//! set from the running branches and drops everything else.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::data::branches::Branch;
use crate::ids::PropertyName;

/// Hash of a serialized property value (hex-rendered SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyHash(String);

impl PropertyHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PropertyHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One serialized workflow variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyValue(serde_json::Value);

impl PropertyValue {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Content address of this value.
    ///
    /// serde_json object keys are sorted, so serialization is canonical.
    pub fn hash(&self) -> PropertyHash {
        let bytes = serde_json::to_vec(&self.0).expect("json value always serializes");
        let digest = Sha256::digest(&bytes);
        PropertyHash(format!("{:x}", digest))
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// A point-in-time mapping from property name to value hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(pub HashMap<PropertyName, PropertyHash>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hashes(&self) -> impl Iterator<Item = &PropertyHash> {
        self.0.values()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Content-addressed store of property values for one workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyStore {
    properties: HashMap<PropertyHash, PropertyValue>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning its hash. Identical values dedupe.
    pub fn insert(&mut self, value: PropertyValue) -> PropertyHash {
        let hash = value.hash();
        self.properties.entry(hash.clone()).or_insert(value);
        hash
    }

    pub fn get(&self, hash: &PropertyHash) -> Option<&PropertyValue> {
        self.properties.get(hash)
    }

    pub fn contains(&self, hash: &PropertyHash) -> bool {
        self.properties.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Reachability GC.
    ///
    /// Roots are, for every running branch: the start snapshot, the current
    /// mapping, and each step's post-completion snapshot. Only values
    /// reachable from a root survive.
    pub fn filter(&self, branches: &[Branch]) -> PropertyStore {
        let mut live: std::collections::HashSet<&PropertyHash> = std::collections::HashSet::new();

        for branch in branches {
            live.extend(branch.properties_at_start.hashes());
            live.extend(branch.current_properties.hashes());
            for step in &branch.steps {
                if let Some(props) = &step.properties_after_completion {
                    live.extend(props.hashes());
                }
            }
        }

        PropertyStore {
            properties: self
                .properties
                .iter()
                .filter(|(hash, _)| live.contains(hash))
                .map(|(hash, value)| (hash.clone(), value.clone()))
                .collect(),
        }
    }
}
