//! Load balancer fronting the masters, with its listeners.
//!
//! The balancer publishes its DNS address for consumption by DNS record
//! tasks. Listeners and the subnet/security-group sets are part of the
//! desired state and compare as sets.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cloud::new_filter;
use crate::diff::Changes;
use crate::error::{Error, Result};
use crate::target::{ApiTarget, TerraformTarget, TfLiteral};
use crate::task::{adopt_id, RunEnv, TaskRef, TaskSpec};
use crate::tasks::compact;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Listener {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_port: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadBalancer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<Listener>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<TaskRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<TaskRef>,
    /// Assigned by the cloud; never set in a model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
}

fn listener_sets_equal(a: &[Listener], b: &[Listener]) -> bool {
    a.len() == b.len() && a.iter().all(|l| b.contains(l))
}

impl LoadBalancer {
    fn discover(&self, env: &RunEnv) -> Result<Option<crate::cloud::CloudResource>> {
        let Some(name) = &self.name else {
            return Ok(None);
        };
        env.cloud
            .find_one("load_balancer", &[new_filter("name", name)])
            .map_err(Into::into)
    }
}

impl TaskSpec for LoadBalancer {
    const KIND: &'static str = "load_balancer";

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = self.subnets.iter().map(|r| r.key("subnet")).collect();
        deps.extend(self.security_groups.iter().map(|r| r.key("security_group")));
        deps
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let Some(resource) = self.discover(env)? else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found matching load balancer");
        let reported: Vec<Listener> = resource
            .attrs
            .get("listeners")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let listeners = if listener_sets_equal(&reported, &self.listeners) {
            self.listeners.clone()
        } else {
            reported
        };

        let subnet_ids: Vec<String> = resource
            .attrs
            .get("subnet_ids")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let security_group_ids: Vec<String> = resource
            .attrs
            .get("security_group_ids")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let actual = LoadBalancer {
            name: resource.attr_str("name").map(str::to_string),
            id: Some(resource.id.clone()),
            listeners,
            subnets: env.tasks.actual_ref_list("subnet", &self.subnets, &subnet_ids),
            security_groups: env.tasks.actual_ref_list(
                "security_group",
                &self.security_groups,
                &security_group_ids,
            ),
            // Expected models never set dns_name, so mirror it to keep
            // the diff quiet while still exposing it to dependents.
            dns_name: self.dns_name.clone(),
        };
        adopt_id("load_balancer", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() {
            if e.name.is_none() {
                return Err(Error::required_field("load_balancer", "name"));
            }
            if e.listeners.is_empty() {
                return Err(Error::required_field("load_balancer", "listeners"));
            }
            if e.subnets.is_empty() {
                return Err(Error::required_field("load_balancer", "subnets"));
            }
        }
        if a.is_some() && changes.contains("name") {
            return Err(Error::cannot_change_field("load_balancer", "name"));
        }
        Ok(())
    }

    fn render_api(
        &mut self,
        t: &ApiTarget,
        a: Option<&Self>,
        changes: &Changes,
        env: &RunEnv,
    ) -> Result<()> {
        let subnet_ids: Vec<String> = self
            .subnets
            .iter()
            .map(|r| env.tasks.resolve_id("subnet", r))
            .collect::<Result<_>>()?;
        let security_group_ids: Vec<String> = self
            .security_groups
            .iter()
            .map(|r| env.tasks.resolve_id("security_group", r))
            .collect::<Result<_>>()?;
        let listeners = serde_json::to_value(&self.listeners)
            .map_err(|e| Error::other(format!("error serializing listeners: {e}")))?;

        if a.is_none() {
            info!(name = ?self.name, "creating load balancer");
            let created = t.cloud.create(
                "load_balancer",
                json!({
                    "name": self.name,
                    "listeners": listeners,
                    "subnet_ids": subnet_ids,
                    "security_group_ids": security_group_ids,
                }),
            )?;
            adopt_id("load_balancer", &mut self.id, &created.id)?;
            self.dns_name = created.attr_str("dns_name").map(str::to_string);
        } else {
            let id = self
                .id
                .clone()
                .ok_or_else(|| Error::other("load balancer id not known"))?;
            if changes.contains("listeners") {
                t.cloud
                    .modify("load_balancer", &id, json!({"listeners": listeners}))?;
            }
            if changes.contains("subnets") {
                t.cloud
                    .modify("load_balancer", &id, json!({"subnet_ids": subnet_ids}))?;
            }
            if changes.contains("security_groups") {
                t.cloud.modify(
                    "load_balancer",
                    &id,
                    json!({"security_group_ids": security_group_ids}),
                )?;
            }
            if self.dns_name.is_none() {
                self.dns_name = a.and_then(|a| a.dns_name.clone());
            }
        }

        let id = self
            .id
            .clone()
            .ok_or_else(|| Error::other("load balancer id not set after create"))?;
        t.add_tags(&id, &t.cloud.build_tags(self.name.as_deref(), None))
    }

    fn render_terraform(
        &mut self,
        t: &mut TerraformTarget,
        _a: Option<&Self>,
        _changes: &Changes,
        env: &RunEnv,
    ) -> Result<()> {
        let name = self
            .name
            .clone()
            .ok_or_else(|| Error::required_field("load_balancer", "name"))?;

        let listeners: Vec<Value> = self
            .listeners
            .iter()
            .map(|l| {
                compact(json!({
                    "lb_port": l.port,
                    "instance_port": l.instance_port,
                    "lb_protocol": l.protocol,
                    "instance_protocol": l.protocol,
                }))
            })
            .collect();
        let subnets = self
            .subnets
            .iter()
            .map(|r| env.tasks.terraform_link_for("subnet", r))
            .collect::<Result<Vec<_>>>()?;
        let security_groups = self
            .security_groups
            .iter()
            .map(|r| env.tasks.terraform_link_for("security_group", r))
            .collect::<Result<Vec<_>>>()?;

        t.render_resource(
            "aws_elb",
            &name,
            compact(json!({
                "name": self.name,
                "listener": listeners,
                "subnets": subnets,
                "security_groups": security_groups,
                "tags": env.cloud.build_tags(self.name.as_deref(), None),
            })),
        )
    }

    /// The balancer's DNS name is its published address.
    fn address(&self, env: &RunEnv) -> Result<Option<String>> {
        if let Some(dns_name) = &self.dns_name {
            return Ok(Some(dns_name.clone()));
        }
        Ok(self
            .discover(env)?
            .and_then(|r| r.attr_str("dns_name").map(str::to_string)))
    }

    fn terraform_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_elb", n, "id"))
    }

    fn terraform_address_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_elb", n, "dns_name"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_sets_compare_unordered() {
        let a = vec![
            Listener {
                port: Some(443),
                instance_port: Some(443),
                protocol: Some("TCP".to_string()),
            },
            Listener {
                port: Some(80),
                instance_port: Some(8080),
                protocol: Some("TCP".to_string()),
            },
        ];
        let mut b = a.clone();
        b.reverse();
        assert!(listener_sets_equal(&a, &b));
    }

    #[test]
    fn create_requires_listeners_and_subnets() {
        let e = LoadBalancer {
            name: Some("api-k-example-com".to_string()),
            ..Default::default()
        };
        let changes = crate::diff::build_changes(None, &e).unwrap();
        assert!(LoadBalancer::check_changes(None, &e, &changes).is_err());
    }

    #[test]
    fn address_link_targets_dns_name() {
        let lb = LoadBalancer {
            name: Some("api-k-example-com".to_string()),
            ..Default::default()
        };
        assert_eq!(
            lb.terraform_address_link().unwrap().as_str(),
            "${aws_elb.api-k-example-com.dns_name}"
        );
    }
}
