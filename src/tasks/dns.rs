//! DNS zone and alias record tasks.
//!
//! A record's target is any task that publishes an address (a load
//! balancer or an elastic IP); the address is read through the task map
//! at render time, after the target task has converged.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::cloud::new_filter;
use crate::diff::Changes;
use crate::error::{Error, Result};
use crate::target::{ApiTarget, TerraformTarget, TfLiteral};
use crate::task::{adopt_id, RunEnv, TaskRef, TaskSpec};
use crate::tasks::compact;

// ---------------------------------------------------------------------------
// Hosted zone
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DnsZone {
    /// The zone apex, e.g. `example.com`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl TaskSpec for DnsZone {
    const KIND: &'static str = "dns_zone";

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let Some(name) = &self.name else {
            return Ok(None);
        };
        let found = env.cloud.find_one("dns_zone", &[new_filter("name", name)])?;
        let Some(resource) = found else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found matching hosted zone");
        let actual = DnsZone {
            name: resource.attr_str("name").map(str::to_string),
            id: Some(resource.id.clone()),
        };
        adopt_id("dns_zone", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() && e.name.is_none() {
            return Err(Error::required_field("dns_zone", "name"));
        }
        if a.is_some() && changes.contains("name") {
            return Err(Error::cannot_change_field("dns_zone", "name"));
        }
        Ok(())
    }

    fn render_api(
        &mut self,
        t: &ApiTarget,
        a: Option<&Self>,
        _changes: &Changes,
        _env: &RunEnv,
    ) -> Result<()> {
        if a.is_none() {
            info!(name = ?self.name, "creating hosted zone");
            let created = t.cloud.create("dns_zone", json!({"name": self.name}))?;
            adopt_id("dns_zone", &mut self.id, &created.id)?;
        }
        Ok(())
    }

    fn render_terraform(
        &mut self,
        t: &mut TerraformTarget,
        _a: Option<&Self>,
        _changes: &Changes,
        _env: &RunEnv,
    ) -> Result<()> {
        let name = self
            .name
            .clone()
            .ok_or_else(|| Error::required_field("dns_zone", "name"))?;
        t.render_resource("aws_route53_zone", &name, compact(json!({"name": self.name})))
    }

    fn terraform_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_route53_zone", n, "zone_id"))
    }
}

// ---------------------------------------------------------------------------
// Alias record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DnsName {
    /// Fully-qualified record name, e.g. `api.k.example.com`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<TaskRef>,
    /// The address-publishing task this record points at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TaskRef>,
}

impl DnsName {
    fn target_key(&self) -> Option<String> {
        self.target.as_ref().map(|r| r.key("load_balancer"))
    }
}

impl TaskSpec for DnsName {
    const KIND: &'static str = "dns_name";

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
        let mut deps: Vec<String> = self.zone.iter().map(|r| r.key("dns_zone")).collect();
        deps.extend(self.target_key());
        deps
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let (Some(name), Some(zone_ref)) = (&self.name, &self.zone) else {
            return Ok(None);
        };
        // The zone may not exist yet on a fresh run.
        let Ok(zone_id) = env.tasks.resolve_id("dns_zone", zone_ref) else {
            return Ok(None);
        };

        let found = env.cloud.find_one(
            "dns_record",
            &[new_filter("name", name), new_filter("zone_id", &zone_id)],
        )?;
        let Some(resource) = found else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found matching dns record");
        // When the record already aliases the expected target's address,
        // adopt the expected reference so no spurious diff results.
        let target = match (&self.target, resource.attr_str("alias_target")) {
            (Some(expected), Some(actual_alias)) => {
                let expected_address = env
                    .tasks
                    .address_of(&expected.key("load_balancer"), env)?;
                if expected_address.as_deref() == Some(actual_alias) {
                    Some(expected.clone())
                } else {
                    Some(TaskRef::new(actual_alias))
                }
            }
            (_, actual_alias) => actual_alias.map(TaskRef::new),
        };

        let actual = DnsName {
            name: resource.attr_str("name").map(str::to_string),
            id: Some(resource.id.clone()),
            zone: env
                .tasks
                .actual_ref("dns_zone", self.zone.as_ref(), resource.attr_str("zone_id")),
            target,
        };
        adopt_id("dns_name", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() {
            if e.name.is_none() {
                return Err(Error::required_field("dns_name", "name"));
            }
            if e.zone.is_none() {
                return Err(Error::required_field("dns_name", "zone"));
            }
            if e.target.is_none() {
                return Err(Error::required_field("dns_name", "target"));
            }
        }
        if a.is_some() && changes.contains("zone") {
            return Err(Error::cannot_change_field("dns_name", "zone"));
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
        let target_key = self
            .target_key()
            .ok_or_else(|| Error::required_field("dns_name", "target"))?;
        let address = env
            .tasks
            .address_of(&target_key, env)?
            .ok_or_else(|| {
                Error::other(format!("task {target_key:?} has not published an address"))
            })?;

        if a.is_none() {
            let zone_ref = self
                .zone
                .as_ref()
                .ok_or_else(|| Error::required_field("dns_name", "zone"))?;
            let zone_id = env.tasks.resolve_id("dns_zone", zone_ref)?;

            info!(name = ?self.name, alias = %address, "creating dns record");
            let created = t.cloud.create(
                "dns_record",
                json!({
                    "name": self.name,
                    "zone_id": zone_id,
                    "record_type": "A",
                    "alias_target": address,
                }),
            )?;
            adopt_id("dns_name", &mut self.id, &created.id)?;
        } else if changes.contains("target") {
            let id = self
                .id
                .clone()
                .ok_or_else(|| Error::other("dns record id not known"))?;
            debug!(name = ?self.name, alias = %address, "re-pointing dns record");
            t.cloud
                .modify("dns_record", &id, json!({"alias_target": address}))?;
        }
        Ok(())
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
            .ok_or_else(|| Error::required_field("dns_name", "name"))?;
        let zone_ref = self
            .zone
            .as_ref()
            .ok_or_else(|| Error::required_field("dns_name", "zone"))?;
        let target_ref = self
            .target
            .as_ref()
            .ok_or_else(|| Error::required_field("dns_name", "target"))?;

        t.render_resource(
            "aws_route53_record",
            &name,
            compact(json!({
                "name": self.name,
                "zone_id": env.tasks.terraform_link_for("dns_zone", zone_ref)?,
                "type": "A",
                "alias": {
                    "name": env.tasks.terraform_address_link_for("load_balancer", target_ref)?,
                    "evaluate_target_health": false,
                },
            })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_depends_on_zone_and_target() {
        let record = DnsName {
            name: Some("api.k.example.com".to_string()),
            zone: Some(TaskRef::new("example.com")),
            target: Some(TaskRef::new("api-k-example-com")),
            ..Default::default()
        };
        let deps = record.dependencies();
        assert!(deps.contains(&"dns_zone/example.com".to_string()));
        assert!(deps.contains(&"load_balancer/api-k-example-com".to_string()));
    }

    #[test]
    fn qualified_target_overrides_default_kind() {
        let record = DnsName {
            name: Some("api.k.example.com".to_string()),
            zone: Some(TaskRef::new("example.com")),
            target: Some(TaskRef::new("elastic_ip/master")),
            ..Default::default()
        };
        assert!(record
            .dependencies()
            .contains(&"elastic_ip/master".to_string()));
    }

    #[test]
    fn create_requires_zone_and_target() {
        let e = DnsName {
            name: Some("api.k.example.com".to_string()),
            ..Default::default()
        };
        let changes = crate::diff::build_changes(None, &e).unwrap();
        assert!(DnsName::check_changes(None, &e, &changes).is_err());
    }
}
