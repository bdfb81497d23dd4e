//! In-memory cloud binding.
//!
//! Implements the [`CloudApi`] seam over a single resource table, with the
//! instrumentation the engine's testable properties need: read/write call
//! counters, creation-order recording, and injectable leading tag-read
//! failures for the eventual-consistency path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::{Cloud, CloudApi, CloudError, CloudProvider, CloudResource, Filter};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
struct StoredResource {
    rtype: String,
    attrs: Value,
}

#[derive(Debug, Clone)]
struct MockImage {
    id: String,
    name: String,
    owner: String,
}

#[derive(Debug, Default)]
struct State {
    resources: BTreeMap<String, StoredResource>,
    tags: BTreeMap<String, BTreeMap<String, String>>,
    images: Vec<MockImage>,
    next_id: u64,

    reads: u32,
    writes: u32,
    tag_reads: u32,
    fail_tag_reads: u32,
    created: Vec<String>,
}

/// Shared-handle mock cloud. Clones observe the same state, so a test can
/// keep one handle for assertions while the engine drives another.
#[derive(Clone, Default)]
pub struct MockCloud {
    state: Arc<Mutex<State>>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a [`Cloud`] handle over this mock with the standard cluster
    /// tag set and a fast retry policy suitable for tests.
    pub fn cloud(&self, provider: CloudProvider, region: &str, cluster_name: &str) -> Cloud {
        let mut tags = BTreeMap::new();
        tags.insert("KubernetesCluster".to_string(), cluster_name.to_string());
        Cloud::new(provider, region, tags, Arc::new(self.clone())).with_tag_retry(RetryPolicy {
            max_attempts: 10,
            delay: std::time::Duration::from_millis(2),
        })
    }

    /// Register an image for `resolve_image` lookups.
    pub fn add_image(&self, id: &str, name: &str, owner: &str) {
        let mut state = self.state.lock().unwrap();
        state.images.push(MockImage {
            id: id.to_string(),
            name: name.to_string(),
            owner: owner.to_string(),
        });
    }

    /// Make the next `n` tag reads fail with an eventual-consistency error.
    pub fn fail_next_tag_reads(&self, n: u32) {
        self.state.lock().unwrap().fail_tag_reads = n;
    }

    /// Number of describe calls issued so far.
    pub fn reads(&self) -> u32 {
        self.state.lock().unwrap().reads
    }

    /// Number of create/modify/tag-write calls issued so far.
    pub fn writes(&self) -> u32 {
        self.state.lock().unwrap().writes
    }

    /// Number of raw tag-read attempts (including failed ones).
    pub fn tag_read_attempts(&self) -> u32 {
        self.state.lock().unwrap().tag_reads
    }

    /// Resource types in the order they were created.
    pub fn created_order(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    /// All live resources of a type.
    pub fn resources_of(&self, rtype: &str) -> Vec<CloudResource> {
        let state = self.state.lock().unwrap();
        state
            .resources
            .iter()
            .filter(|(_, r)| r.rtype == rtype)
            .map(|(id, r)| CloudResource {
                id: id.clone(),
                attrs: r.attrs.clone(),
                tags: state.tags.get(id).cloned().unwrap_or_default(),
            })
            .collect()
    }
}

fn attr_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn matches_filter(
    filter: &Filter,
    attrs: &Value,
    tags: &BTreeMap<String, String>,
) -> bool {
    if let Some(tag_key) = filter.name.strip_prefix("tag:") {
        return match tags.get(tag_key) {
            Some(v) => filter.values.iter().any(|fv| fv == v),
            None => false,
        };
    }
    match attrs.get(&filter.name).and_then(attr_as_string) {
        Some(v) => filter.values.iter().any(|fv| *fv == v),
        None => false,
    }
}

impl CloudApi for MockCloud {
    fn describe(&self, rtype: &str, filters: &[Filter]) -> Result<Vec<CloudResource>, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.reads += 1;

        if rtype == "image" {
            let found = state
                .images
                .iter()
                .filter(|img| {
                    filters.iter().all(|f| match f.name.as_str() {
                        "image-id" => f.values.iter().any(|v| *v == img.id),
                        "name" => f.values.iter().any(|v| *v == img.name),
                        "owner" => f.values.iter().any(|v| *v == img.owner),
                        _ => false,
                    })
                })
                .map(|img| CloudResource {
                    id: img.id.clone(),
                    attrs: serde_json::json!({"name": img.name, "owner": img.owner}),
                    tags: BTreeMap::new(),
                })
                .collect();
            return Ok(found);
        }

        let found = state
            .resources
            .iter()
            .filter(|(id, r)| {
                r.rtype == rtype && {
                    let tags = state.tags.get(*id).cloned().unwrap_or_default();
                    filters.iter().all(|f| {
                        if f.name == "resource-id" {
                            f.values.iter().any(|v| v == *id)
                        } else {
                            matches_filter(f, &r.attrs, &tags)
                        }
                    })
                }
            })
            .map(|(id, r)| CloudResource {
                id: id.clone(),
                attrs: r.attrs.clone(),
                tags: state.tags.get(id).cloned().unwrap_or_default(),
            })
            .collect();
        Ok(found)
    }

    fn create(&self, rtype: &str, attrs: Value) -> Result<CloudResource, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        state.next_id += 1;
        let id = format!("{}-{:08x}", rtype.replace('_', ""), state.next_id);

        // Provider-assigned attributes.
        let mut attrs = attrs;
        if let Value::Object(map) = &mut attrs {
            if rtype == "elastic_ip" && !map.contains_key("public_ip") {
                map.insert(
                    "public_ip".to_string(),
                    Value::String(format!("203.0.113.{}", state.next_id)),
                );
            }
            if rtype == "load_balancer" && !map.contains_key("dns_name") {
                map.insert(
                    "dns_name".to_string(),
                    Value::String(format!("{id}.elb.amazonaws.com")),
                );
            }
        }

        state.resources.insert(
            id.clone(),
            StoredResource {
                rtype: rtype.to_string(),
                attrs: attrs.clone(),
            },
        );
        state.created.push(rtype.to_string());
        Ok(CloudResource {
            id,
            attrs,
            tags: BTreeMap::new(),
        })
    }

    fn modify(&self, rtype: &str, id: &str, attrs: Value) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        let resource = state.resources.get_mut(id).ok_or_else(|| {
            CloudError::api(format!("no {rtype} resource with id {id:?}"))
        })?;
        if let (Value::Object(existing), Value::Object(patch)) = (&mut resource.attrs, attrs) {
            for (k, v) in patch {
                existing.insert(k, v);
            }
        }
        Ok(())
    }

    fn read_tags(&self, id: &str) -> Result<BTreeMap<String, String>, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.tag_reads += 1;
        if state.fail_tag_reads > 0 {
            state.fail_tag_reads -= 1;
            return Err(CloudError::EventualConsistency {
                message: format!("entity {id:?} not yet visible"),
            });
        }
        Ok(state.tags.get(id).cloned().unwrap_or_default())
    }

    fn write_tags(&self, id: &str, tags: &BTreeMap<String, String>) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        let entry = state.tags.entry(id.to_string()).or_default();
        for (k, v) in tags {
            entry.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::new_filter;

    #[test]
    fn create_then_describe_by_tag() {
        let mock = MockCloud::new();
        let created = mock
            .create("vpc", serde_json::json!({"cidr": "172.20.0.0/16"}))
            .unwrap();
        let mut tags = BTreeMap::new();
        tags.insert("Name".to_string(), "main".to_string());
        mock.write_tags(&created.id, &tags).unwrap();

        let found = mock
            .describe("vpc", &[new_filter("tag:Name", "main")])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].attr_str("cidr").unwrap(), "172.20.0.0/16");
    }

    #[test]
    fn attr_filters_match_stringified_values() {
        let mock = MockCloud::new();
        mock.create("subnet", serde_json::json!({"vpc_id": "vpc-1", "cidr": "a"}))
            .unwrap();
        mock.create("subnet", serde_json::json!({"vpc_id": "vpc-2", "cidr": "b"}))
            .unwrap();
        let found = mock
            .describe("subnet", &[new_filter("vpc_id", "vpc-2")])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].attr_str("cidr").unwrap(), "b");
    }

    #[test]
    fn injected_tag_failures_then_success() {
        let mock = MockCloud::new();
        mock.fail_next_tag_reads(2);
        assert!(mock.read_tags("vpc-1").is_err());
        assert!(mock.read_tags("vpc-1").is_err());
        assert!(mock.read_tags("vpc-1").is_ok());
        assert_eq!(mock.tag_read_attempts(), 3);
    }

    #[test]
    fn image_lookup_by_name_and_owner() {
        let mock = MockCloud::new();
        mock.add_image("ami-00000001", "k8s-1.2-base", "self");
        let found = mock
            .describe(
                "image",
                &[new_filter("owner", "self"), new_filter("name", "k8s-1.2-base")],
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "ami-00000001");
    }

    #[test]
    fn counters_track_reads_and_writes() {
        let mock = MockCloud::new();
        mock.create("vpc", serde_json::json!({})).unwrap();
        mock.describe("vpc", &[]).unwrap();
        assert_eq!(mock.writes(), 1);
        assert_eq!(mock.reads(), 1);
        assert_eq!(mock.created_order(), vec!["vpc".to_string()]);
    }
}
