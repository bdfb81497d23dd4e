//! Cloud resource task kinds.
//!
//! Each module implements one or more kinds against the provider seam:
//! discover the live resource, validate the requested transition, apply
//! through the API target or emit into the Terraform document. The
//! store-backed `keypair` kind is provider-neutral.

pub mod autoscaling_group;
pub mod dns;
pub mod ebs_volume;
pub mod elastic_ip;
pub mod iam;
pub mod internet_gateway;
pub mod keypair;
pub mod load_balancer;
pub mod route;
pub mod route_table;
pub mod security_group;
pub mod ssh_key;
pub mod subnet;
pub mod vpc;

use serde_json::Value;

use crate::cloud::CloudProvider;

/// The kinds registered for a provider. The loader rejects model documents
/// using anything else.
pub fn standard_kinds(provider: CloudProvider) -> Vec<&'static str> {
    match provider {
        CloudProvider::Aws => vec![
            "keypair",
            "ssh_key",
            "vpc",
            "subnet",
            "internet_gateway",
            "route_table",
            "route",
            "security_group",
            "ebs_volume",
            "elastic_ip",
            "iam_role",
            "iam_role_policy",
            "iam_instance_profile",
            "autoscaling_group",
            "load_balancer",
            "dns_zone",
            "dns_name",
        ],
        // Only the provider-neutral kinds until a GCE task family lands.
        CloudProvider::Gce => vec!["keypair"],
    }
}

/// Drop null entries from an attribute document so emitted bodies carry
/// only the fields that are set.
pub(crate) fn compact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, compact(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(compact).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compact_drops_null_fields() {
        let body = compact(json!({"a": 1, "b": null, "c": {"d": null, "e": 2}}));
        assert_eq!(body, json!({"a": 1, "c": {"e": 2}}));
    }

    #[test]
    fn aws_registry_contains_network_kinds() {
        let kinds = standard_kinds(CloudProvider::Aws);
        assert!(kinds.contains(&"vpc"));
        assert!(kinds.contains(&"dns_name"));
        assert!(!standard_kinds(CloudProvider::Gce).contains(&"vpc"));
    }

    #[test]
    fn every_registered_kind_is_known_to_the_engine() {
        for kind in standard_kinds(CloudProvider::Aws) {
            assert!(
                crate::task::Task::KINDS.contains(&kind),
                "{kind} is not a task kind"
            );
        }
    }
}
