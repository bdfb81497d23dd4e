//! Cloud handle and the provider seam.
//!
//! The engine never talks to a cloud SDK directly. Tasks describe, create
//! and modify resources through the [`CloudApi`] trait; the concrete AWS
//! binding lives outside this crate. What the engine owns is everything on
//! top of the seam: the provider identity, the cluster tag set, tag-filter
//! construction, retried tag reconciliation for eventually-consistent
//! reads, and image-name resolution.
//!
//! Two in-crate implementations exist: [`mock::MockCloud`] (in-memory, used
//! by tests and selectable for offline experiments) and [`OfflineCloud`]
//! (plan-only; reads find nothing, writes fail).

pub mod mock;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::retry::{retry, RetryPolicy};

/// Identity of the cloud provider a run targets. Per-run immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudProvider {
    Aws,
    Gce,
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudProvider::Aws => write!(f, "aws"),
            CloudProvider::Gce => write!(f, "gce"),
        }
    }
}

impl FromStr for CloudProvider {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self, CloudError> {
        match s {
            "aws" => Ok(CloudProvider::Aws),
            "gce" => Ok(CloudProvider::Gce),
            other => Err(CloudError::Api {
                message: format!("unknown cloud provider {other:?}"),
            }),
        }
    }
}

/// A name/values pair constraining a describe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

/// Build a single-valued filter.
pub fn new_filter(name: &str, value: &str) -> Filter {
    Filter {
        name: name.to_string(),
        values: vec![value.to_string()],
    }
}

/// One resource as reported by the cloud: its id, its attribute document,
/// and its tags.
#[derive(Debug, Clone)]
pub struct CloudResource {
    pub id: String,
    pub attrs: Value,
    pub tags: BTreeMap<String, String>,
}

impl CloudResource {
    /// String attribute accessor.
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(Value::as_str)
    }

    /// Integer attribute accessor.
    pub fn attr_i64(&self, name: &str) -> Option<i64> {
        self.attrs.get(name).and_then(Value::as_i64)
    }

    /// Boolean attribute accessor.
    pub fn attr_bool(&self, name: &str) -> Option<bool> {
        self.attrs.get(name).and_then(Value::as_bool)
    }
}

/// Errors surfaced by a cloud binding.
#[derive(Error, Debug)]
pub enum CloudError {
    /// The entity exists but is not yet visible to the queried endpoint.
    /// Worth retrying with a short delay.
    #[error("eventual consistency: {message}")]
    EventualConsistency { message: String },

    /// Any other API failure. Fatal for the run.
    #[error("cloud API error: {message}")]
    Api { message: String },

    /// The active cloud binding does not implement this operation.
    #[error("cloud operation {operation:?} is not available in this build")]
    NotImplemented { operation: String },

    /// A transient error kept recurring past the retry budget.
    #[error("{what} still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        what: String,
        attempts: u32,
        #[source]
        source: Box<CloudError>,
    },
}

impl CloudError {
    pub fn api(message: impl Into<String>) -> Self {
        CloudError::Api {
            message: message.into(),
        }
    }

    /// True for the error class produced when an entity was just created
    /// and is not yet queryable.
    pub fn is_eventual_consistency(&self) -> bool {
        matches!(self, CloudError::EventualConsistency { .. })
    }
}

/// The provider seam. Attribute documents use the task types' own field
/// names; a real binding translates them to SDK calls.
pub trait CloudApi {
    /// List resources of `rtype` matching every filter.
    fn describe(&self, rtype: &str, filters: &[Filter]) -> Result<Vec<CloudResource>, CloudError>;

    /// Create a resource, returning it with its assigned id.
    fn create(&self, rtype: &str, attrs: Value) -> Result<CloudResource, CloudError>;

    /// Apply an attribute patch to an existing resource.
    fn modify(&self, rtype: &str, id: &str, attrs: Value) -> Result<(), CloudError>;

    /// Read the tags on a resource id. May fail with an
    /// eventual-consistency error shortly after creation.
    fn read_tags(&self, id: &str) -> Result<BTreeMap<String, String>, CloudError>;

    /// Add tags to a resource id.
    fn write_tags(&self, id: &str, tags: &BTreeMap<String, String>) -> Result<(), CloudError>;
}

/// Provider-tagged cloud handle for one run.
#[derive(Clone)]
pub struct Cloud {
    provider: CloudProvider,
    region: String,
    tags: BTreeMap<String, String>,
    api: Arc<dyn CloudApi>,
    tag_retry: RetryPolicy,
}

impl Cloud {
    pub fn new(
        provider: CloudProvider,
        region: &str,
        tags: BTreeMap<String, String>,
        api: Arc<dyn CloudApi>,
    ) -> Self {
        Cloud {
            provider,
            region: region.to_string(),
            tags,
            api,
            tag_retry: RetryPolicy::tags(),
        }
    }

    /// Override the tag retry policy (tests use a short delay).
    pub fn with_tag_retry(mut self, policy: RetryPolicy) -> Self {
        self.tag_retry = policy;
        self
    }

    pub fn provider(&self) -> CloudProvider {
        self.provider
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// The per-run base tags (cluster identity).
    pub fn base_tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Tags to stamp on a named resource: Name + base tags + extras.
    pub fn build_tags(
        &self,
        name: Option<&str>,
        extra: Option<&BTreeMap<String, String>>,
    ) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        if let Some(name) = name {
            tags.insert("Name".to_string(), name.to_string());
        }
        for (k, v) in &self.tags {
            tags.insert(k.clone(), v.clone());
        }
        if let Some(extra) = extra {
            for (k, v) in extra {
                tags.insert(k.clone(), v.clone());
            }
        }
        tags
    }

    /// Tag filters selecting resources stamped by [`Cloud::build_tags`].
    pub fn build_filters(&self, name: Option<&str>) -> Vec<Filter> {
        let mut merged = self.tags.clone();
        if let Some(name) = name {
            merged.insert("Name".to_string(), name.to_string());
        }
        merged
            .into_iter()
            .map(|(k, v)| new_filter(&format!("tag:{k}"), &v))
            .collect()
    }

    pub fn describe(
        &self,
        rtype: &str,
        filters: &[Filter],
    ) -> Result<Vec<CloudResource>, CloudError> {
        self.api.describe(rtype, filters)
    }

    /// Describe expecting zero or one result; more than one is an error.
    pub fn find_one(
        &self,
        rtype: &str,
        filters: &[Filter],
    ) -> Result<Option<CloudResource>, CloudError> {
        let mut found = self.api.describe(rtype, filters)?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(Some(found.remove(0))),
            n => Err(CloudError::api(format!(
                "found {n} {rtype} resources matching filters, expected one"
            ))),
        }
    }

    pub fn create(&self, rtype: &str, attrs: Value) -> Result<CloudResource, CloudError> {
        self.api.create(rtype, attrs)
    }

    pub fn modify(&self, rtype: &str, id: &str, attrs: Value) -> Result<(), CloudError> {
        self.api.modify(rtype, id, attrs)
    }

    /// Fetch tags for a resource, retrying eventual-consistency errors.
    pub fn get_tags(&self, id: &str) -> Result<BTreeMap<String, String>, CloudError> {
        retry(
            self.tag_retry,
            "tag read",
            CloudError::is_eventual_consistency,
            || self.api.read_tags(id),
        )
    }

    /// Add tags to a resource, retrying eventual-consistency errors.
    pub fn create_tags(
        &self,
        id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), CloudError> {
        if tags.is_empty() {
            return Ok(());
        }
        retry(
            self.tag_retry,
            "tag write",
            CloudError::is_eventual_consistency,
            || self.api.write_tags(id, tags),
        )
    }

    /// Resolve an image reference to the image resource.
    ///
    /// `name` may be `ami-...` (an id), `owner/name`, or a bare name owned
    /// by the calling account.
    pub fn resolve_image(&self, name: &str) -> Result<CloudResource, CloudError> {
        debug!(name, "resolving image reference");
        let filters = if name.starts_with("ami-") {
            vec![new_filter("image-id", name)]
        } else {
            match name.split_once('/') {
                Some((owner, image)) => {
                    vec![new_filter("owner", owner), new_filter("name", image)]
                }
                None => vec![new_filter("owner", "self"), new_filter("name", name)],
            }
        };

        match self.find_one("image", &filters)? {
            Some(image) => Ok(image),
            None => Err(CloudError::api(format!("could not find image {name:?}"))),
        }
    }
}

impl fmt::Debug for Cloud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cloud")
            .field("provider", &self.provider)
            .field("region", &self.region)
            .field("tags", &self.tags)
            .finish()
    }
}

/// Plan-only cloud binding: nothing exists, nothing can be mutated.
///
/// Backs the CLI's Terraform and dry-run targets when no real cloud client
/// is linked; mutation attempts fail with a clear message.
pub struct OfflineCloud;

impl CloudApi for OfflineCloud {
    fn describe(&self, _rtype: &str, _filters: &[Filter]) -> Result<Vec<CloudResource>, CloudError> {
        Ok(Vec::new())
    }

    fn create(&self, rtype: &str, _attrs: Value) -> Result<CloudResource, CloudError> {
        Err(CloudError::NotImplemented {
            operation: format!("create {rtype}"),
        })
    }

    fn modify(&self, rtype: &str, _id: &str, _attrs: Value) -> Result<(), CloudError> {
        Err(CloudError::NotImplemented {
            operation: format!("modify {rtype}"),
        })
    }

    fn read_tags(&self, _id: &str) -> Result<BTreeMap<String, String>, CloudError> {
        Ok(BTreeMap::new())
    }

    fn write_tags(&self, _id: &str, _tags: &BTreeMap<String, String>) -> Result<(), CloudError> {
        Err(CloudError::NotImplemented {
            operation: "write tags".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline(tags: &[(&str, &str)]) -> Cloud {
        let tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Cloud::new(CloudProvider::Aws, "us-east-1", tags, Arc::new(OfflineCloud))
    }

    #[test]
    fn provider_parses_known_names() {
        assert_eq!("aws".parse::<CloudProvider>().unwrap(), CloudProvider::Aws);
        assert_eq!("gce".parse::<CloudProvider>().unwrap(), CloudProvider::Gce);
        assert!("azure".parse::<CloudProvider>().is_err());
    }

    #[test]
    fn build_tags_merges_name_base_and_extras() {
        let cloud = offline(&[("KubernetesCluster", "k.example.com")]);
        let mut extra = BTreeMap::new();
        extra.insert("role".to_string(), "master".to_string());
        let tags = cloud.build_tags(Some("main"), Some(&extra));
        assert_eq!(tags.get("Name").unwrap(), "main");
        assert_eq!(tags.get("KubernetesCluster").unwrap(), "k.example.com");
        assert_eq!(tags.get("role").unwrap(), "master");
    }

    #[test]
    fn build_filters_are_tag_filters() {
        let cloud = offline(&[("KubernetesCluster", "k.example.com")]);
        let filters = cloud.build_filters(Some("main"));
        assert!(filters
            .iter()
            .any(|f| f.name == "tag:Name" && f.values == vec!["main".to_string()]));
        assert!(filters.iter().any(|f| f.name == "tag:KubernetesCluster"));
    }

    #[test]
    fn offline_cloud_finds_nothing_and_refuses_writes() {
        let cloud = offline(&[]);
        assert!(cloud.find_one("vpc", &[]).unwrap().is_none());
        assert!(cloud.create("vpc", serde_json::json!({})).is_err());
    }
}
