//! Lazy byte-sequence handles referenced by tasks.
//!
//! A [`Resource`] names where content comes from; a [`ResourceHolder`]
//! wraps one with memoized materialization and an optional list of task
//! keys that must execute before the content is usable (for example, a
//! bootstrap script embedding an address published by another task).
//!
//! In model documents a resource field is written as a plain string:
//! inline content, `file:<path>`, or `resource:<name>` for a loader-owned
//! named resource resolved in a post-pass.

use std::fmt;
use std::path::PathBuf;

use once_cell::sync::OnceCell;
use serde::de::{Deserializer, Error as _};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::store::ca::CaStore;
use crate::store::secrets::SecretStore;

/// Source of a resource's bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    /// Literal content.
    Inline(String),
    /// Contents of a file on disk.
    File(PathBuf),
    /// A one-off template rendered with the given values.
    Template { template: String, values: Value },
    /// An issued certificate, read from the PKI tree.
    Certificate { pki_dir: PathBuf, name: String },
    /// An opaque secret, read from the secret store.
    Secret { dir: PathBuf, name: String },
    /// A loader-owned named resource; must be resolved before use.
    Named(String),
}

impl Resource {
    fn materialize(&self) -> Result<Vec<u8>> {
        match self {
            Resource::Inline(s) => Ok(s.clone().into_bytes()),
            Resource::File(path) => Ok(std::fs::read(path)?),
            Resource::Template { template, values } => {
                let context = tera::Context::from_value(values.clone())
                    .map_err(|e| Error::Resource(format!("bad template values: {e}")))?;
                let rendered = tera::Tera::one_off(template, &context, false)?;
                Ok(rendered.into_bytes())
            }
            Resource::Certificate { pki_dir, name } => {
                let store = CaStore::open(pki_dir)?;
                match store.get(name)? {
                    Some(pair) => Ok(pair.certificate.into_bytes()),
                    None => Err(Error::Resource(format!("certificate {name:?} not issued"))),
                }
            }
            Resource::Secret { dir, name } => {
                let store = SecretStore::open(dir)?;
                match store.get(name)? {
                    Some(secret) => Ok(secret.into_bytes()),
                    None => Err(Error::Resource(format!("secret {name:?} not issued"))),
                }
            }
            Resource::Named(name) => Err(Error::Resource(format!(
                "named resource {name:?} was not resolved by the loader"
            ))),
        }
    }
}

/// A resource with memoized materialization and dependency declarations.
#[derive(Clone)]
pub struct ResourceHolder {
    source: Resource,
    cache: OnceCell<Vec<u8>>,
    dependencies: Vec<String>,
}

impl ResourceHolder {
    pub fn new(source: Resource) -> Self {
        ResourceHolder {
            source,
            cache: OnceCell::new(),
            dependencies: Vec::new(),
        }
    }

    /// Wrap literal content.
    pub fn inline(content: impl Into<String>) -> Self {
        ResourceHolder::new(Resource::Inline(content.into()))
    }

    /// Declare that `key` must execute before this resource materializes.
    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(key.into());
        self
    }

    /// Task keys this resource depends on.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// The underlying source.
    pub fn source(&self) -> &Resource {
        &self.source
    }

    /// The unresolved name, when this holder still points at a
    /// loader-owned named resource.
    pub fn named(&self) -> Option<&str> {
        match &self.source {
            Resource::Named(name) => Some(name),
            _ => None,
        }
    }

    /// Swap the source (loader post-pass resolution). Clears the cache.
    pub fn replace(&mut self, source: Resource) {
        self.source = source;
        self.cache = OnceCell::new();
    }

    /// Materialized bytes, computed once.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        let bytes = self.cache.get_or_try_init(|| self.source.materialize())?;
        Ok(bytes.as_slice())
    }

    /// Materialized content as UTF-8 text.
    pub fn as_string(&self) -> Result<&str> {
        std::str::from_utf8(self.as_bytes()?)
            .map_err(|_| Error::Resource("resource content is not UTF-8".to_string()))
    }
}

impl fmt::Debug for ResourceHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHolder")
            .field("source", &self.source)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

impl PartialEq for ResourceHolder {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// Serializes as the materialized text so the structural diff compares
/// content. Inline sources need no prior materialization; other sources
/// must have been materialized (the delta runner does this before
/// diffing), else they serialize as null.
impl Serialize for ResourceHolder {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if let Resource::Inline(s) = &self.source {
            return serializer.serialize_str(s);
        }
        match self.cache.get() {
            Some(bytes) => serializer.serialize_str(&String::from_utf8_lossy(bytes)),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for ResourceHolder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Some(name) = raw.strip_prefix("resource:") {
            if name.is_empty() {
                return Err(D::Error::custom("empty resource name"));
            }
            return Ok(ResourceHolder::new(Resource::Named(name.to_string())));
        }
        if let Some(path) = raw.strip_prefix("file:") {
            return Ok(ResourceHolder::new(Resource::File(PathBuf::from(path))));
        }
        Ok(ResourceHolder::inline(raw))
    }
}
