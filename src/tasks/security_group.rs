//! Security group with its ingress rules.
//!
//! Rules are part of the group's desired state and compare as a set. On
//! the wire a rule's source group is a resolved group id; discovery maps
//! the reported rules back onto the expected ones when they describe the
//! same set, so references never show spurious drift.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cloud::new_filter;
use crate::diff::Changes;
use crate::error::{Error, Result};
use crate::target::{ApiTarget, TerraformTarget, TfLiteral};
use crate::task::{adopt_id, RunEnv, TaskMap, TaskRef, TaskSpec};
use crate::tasks::compact;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_port: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_port: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    /// Another security group allowed as a source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_group: Option<TaskRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityGroup {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc: Option<TaskRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<IngressRule>,
}

/// A rule as the cloud reports it: source groups by id.
fn wire_rule(rule: &IngressRule, tasks: &TaskMap) -> Result<Value> {
    let source_group_id = match &rule.source_group {
        Some(r) => Some(tasks.resolve_id("security_group", r)?),
        None => None,
    };
    Ok(compact(json!({
        "protocol": rule.protocol,
        "from_port": rule.from_port,
        "to_port": rule.to_port,
        "cidr": rule.cidr,
        "source_group_id": source_group_id,
    })))
}

fn wire_rules(rules: &[IngressRule], tasks: &TaskMap) -> Result<Vec<Value>> {
    rules.iter().map(|r| wire_rule(r, tasks)).collect()
}

fn rule_sets_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().all(|rule| b.contains(rule))
}

impl TaskSpec for SecurityGroup {
    const KIND: &'static str = "security_group";

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
        let mut deps: Vec<String> = self.vpc.iter().map(|r| r.key("vpc")).collect();
        for rule in &self.ingress {
            if let Some(source) = &rule.source_group {
                deps.push(source.key("security_group"));
            }
        }
        deps
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let (Some(name), Some(vpc_ref)) = (&self.name, &self.vpc) else {
            return Ok(None);
        };
        let Ok(vpc_id) = env.tasks.resolve_id("vpc", vpc_ref) else {
            return Ok(None);
        };

        let found = env.cloud.find_one(
            "security_group",
            &[new_filter("name", name), new_filter("vpc_id", &vpc_id)],
        )?;
        let Some(resource) = found else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found matching security group");
        let reported: Vec<Value> = resource
            .attrs
            .get("ingress")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        // If the reported rules describe the expected set, adopt the
        // expected form so references compare clean.
        let ingress = match wire_rules(&self.ingress, env.tasks) {
            Ok(expected_wire) if rule_sets_equal(&expected_wire, &reported) => {
                self.ingress.clone()
            }
            _ => serde_json::from_value(Value::Array(reported))
                .unwrap_or_default(),
        };

        let actual = SecurityGroup {
            name: resource.attr_str("name").map(str::to_string),
            id: Some(resource.id.clone()),
            description: resource.attr_str("description").map(str::to_string),
            vpc: env
                .tasks
                .actual_ref("vpc", self.vpc.as_ref(), resource.attr_str("vpc_id")),
            ingress,
        };
        adopt_id("security_group", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() {
            if e.name.is_none() {
                return Err(Error::required_field("security_group", "name"));
            }
            if e.vpc.is_none() {
                return Err(Error::required_field("security_group", "vpc"));
            }
        }
        if a.is_some() {
            if changes.contains("name") {
                return Err(Error::cannot_change_field("security_group", "name"));
            }
            if changes.contains("vpc") {
                return Err(Error::cannot_change_field("security_group", "vpc"));
            }
            if changes.contains("description") {
                return Err(Error::cannot_change_field("security_group", "description"));
            }
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
        let rules = wire_rules(&self.ingress, env.tasks)?;

        if a.is_none() {
            let vpc_ref = self
                .vpc
                .as_ref()
                .ok_or_else(|| Error::required_field("security_group", "vpc"))?;
            let vpc_id = env.tasks.resolve_id("vpc", vpc_ref)?;

            info!(name = ?self.name, vpc = %vpc_id, "creating security group");
            let created = t.cloud.create(
                "security_group",
                json!({
                    "name": self.name,
                    "description": self.description,
                    "vpc_id": vpc_id,
                    "ingress": rules,
                }),
            )?;
            adopt_id("security_group", &mut self.id, &created.id)?;
        } else if changes.contains("ingress") {
            let id = self
                .id
                .clone()
                .ok_or_else(|| Error::other("security group id not known"))?;
            debug!(id = %id, "reconciling ingress rules");
            t.cloud
                .modify("security_group", &id, json!({"ingress": rules}))?;
        }

        let id = self
            .id
            .clone()
            .ok_or_else(|| Error::other("security group id not set after create"))?;
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
            .ok_or_else(|| Error::required_field("security_group", "name"))?;
        let vpc_ref = self
            .vpc
            .as_ref()
            .ok_or_else(|| Error::required_field("security_group", "vpc"))?;

        let mut ingress = Vec::new();
        for rule in &self.ingress {
            let security_groups = match &rule.source_group {
                Some(r) => Some(vec![env.tasks.terraform_link_for("security_group", r)?]),
                None => None,
            };
            ingress.push(compact(json!({
                "protocol": rule.protocol,
                "from_port": rule.from_port,
                "to_port": rule.to_port,
                "cidr_blocks": rule.cidr.as_ref().map(|c| vec![c.clone()]),
                "security_groups": security_groups,
            })));
        }

        t.render_resource(
            "aws_security_group",
            &name,
            compact(json!({
                "name": self.name,
                "description": self.description,
                "vpc_id": env.tasks.terraform_link_for("vpc", vpc_ref)?,
                "ingress": ingress,
                "tags": env.cloud.build_tags(self.name.as_deref(), None),
            })),
        )
    }

    fn terraform_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_security_group", n, "id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_include_rule_source_groups() {
        let group = SecurityGroup {
            name: Some("masters".to_string()),
            vpc: Some(TaskRef::new("main")),
            ingress: vec![IngressRule {
                protocol: Some("tcp".to_string()),
                from_port: Some(1),
                to_port: Some(65535),
                source_group: Some(TaskRef::new("nodes")),
                ..Default::default()
            }],
            ..Default::default()
        };
        let deps = group.dependencies();
        assert!(deps.contains(&"vpc/main".to_string()));
        assert!(deps.contains(&"security_group/nodes".to_string()));
    }

    #[test]
    fn description_is_immutable() {
        let a = SecurityGroup {
            name: Some("masters".to_string()),
            description: Some("masters".to_string()),
            vpc: Some(TaskRef::new("main")),
            ..Default::default()
        };
        let e = SecurityGroup {
            description: Some("kubernetes masters".to_string()),
            ..a.clone()
        };
        let changes = crate::diff::build_changes(Some(&a), &e).unwrap();
        assert!(SecurityGroup::check_changes(Some(&a), &e, &changes).is_err());
    }

    #[test]
    fn rule_sets_compare_unordered() {
        let a = json!([{"protocol": "tcp"}, {"protocol": "udp"}]);
        let b = json!([{"protocol": "udp"}, {"protocol": "tcp"}]);
        let (a, b): (Vec<Value>, Vec<Value>) = (
            serde_json::from_value(a).unwrap(),
            serde_json::from_value(b).unwrap(),
        );
        assert!(rule_sets_equal(&a, &b));
    }
}
