//! The cluster VPC (or network) itself.
//!
//! A shared VPC (`shared: true`) is owned outside the model: it must
//! already exist, is never created or emitted, and only its settings are
//! verified.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::cloud::new_filter;
use crate::diff::Changes;
use crate::error::{Error, Result};
use crate::target::{ApiTarget, TerraformTarget, TfLiteral};
use crate::task::{adopt_id, RunEnv, TaskSpec};
use crate::tasks::compact;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Vpc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_dns_hostnames: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_dns_support: Option<bool>,

    /// Set when this is a shared VPC owned outside the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
}

impl Vpc {
    fn is_shared(&self) -> bool {
        self.shared.unwrap_or(false)
    }
}

impl TaskSpec for Vpc {
    const KIND: &'static str = "vpc";

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
        let found = if let Some(id) = &self.id {
            env.cloud.find_one("vpc", &[new_filter("resource-id", id)])?
        } else {
            env.cloud
                .find_one("vpc", &env.cloud.build_filters(self.name.as_deref()))?
        };
        let Some(resource) = found else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found matching vpc");
        let actual = Vpc {
            name: resource.tags.get("Name").cloned(),
            id: Some(resource.id.clone()),
            cidr: resource.attr_str("cidr").map(str::to_string),
            enable_dns_hostnames: resource.attr_bool("enable_dns_hostnames"),
            enable_dns_support: resource.attr_bool("enable_dns_support"),
            shared: self.shared,
        };
        adopt_id("vpc", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() && e.cidr.is_none() {
            return Err(Error::required_field("vpc", "cidr"));
        }
        if a.is_some() && changes.contains("cidr") {
            return Err(Error::cannot_change_field("vpc", "cidr"));
        }
        Ok(())
    }

    fn render_api(
        &mut self,
        t: &ApiTarget,
        a: Option<&Self>,
        changes: &Changes,
        _env: &RunEnv,
    ) -> Result<()> {
        if self.is_shared() {
            // Verify the shared VPC exists and already has the settings we need.
            if a.is_none() {
                return Err(Error::other(format!(
                    "shared vpc {:?} not found",
                    self.id.as_deref().unwrap_or("?")
                )));
            }
            if changes.contains("enable_dns_support") || changes.contains("enable_dns_hostnames") {
                return Err(Error::other(format!(
                    "shared vpc {:?} does not have the required DNS settings",
                    self.id.as_deref().unwrap_or("?")
                )));
            }
            return Ok(());
        }

        if a.is_none() {
            info!(cidr = ?self.cidr, "creating vpc");
            let created = t.cloud.create("vpc", json!({"cidr": self.cidr}))?;
            adopt_id("vpc", &mut self.id, &created.id)?;
        }

        let id = self
            .id
            .clone()
            .ok_or_else(|| Error::other("vpc id not set after create"))?;

        if changes.contains("enable_dns_support") {
            t.cloud.modify(
                "vpc",
                &id,
                json!({"enable_dns_support": self.enable_dns_support}),
            )?;
        }
        if changes.contains("enable_dns_hostnames") {
            t.cloud.modify(
                "vpc",
                &id,
                json!({"enable_dns_hostnames": self.enable_dns_hostnames}),
            )?;
        }

        t.add_tags(&id, &t.cloud.build_tags(self.name.as_deref(), None))
    }

    fn render_terraform(
        &mut self,
        t: &mut TerraformTarget,
        _a: Option<&Self>,
        _changes: &Changes,
        env: &RunEnv,
    ) -> Result<()> {
        if self.is_shared() {
            // Not owned by the emitted document.
            return Ok(());
        }
        let name = self
            .name
            .clone()
            .ok_or_else(|| Error::required_field("vpc", "name"))?;
        t.render_resource(
            "aws_vpc",
            &name,
            compact(json!({
                "cidr_block": self.cidr,
                "enable_dns_hostnames": self.enable_dns_hostnames,
                "enable_dns_support": self.enable_dns_support,
                "tags": env.cloud.build_tags(self.name.as_deref(), None),
            })),
        )
    }

    fn terraform_link(&self) -> Option<TfLiteral> {
        if self.is_shared() {
            return self.id.as_deref().map(TfLiteral::from_string);
        }
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_vpc", n, "id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected() -> Vpc {
        Vpc {
            name: Some("main".to_string()),
            cidr: Some("172.20.0.0/16".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn create_requires_cidr() {
        let e = Vpc {
            name: Some("main".to_string()),
            ..Default::default()
        };
        let changes = crate::diff::build_changes(None, &e).unwrap();
        assert!(matches!(
            Vpc::check_changes(None, &e, &changes),
            Err(Error::RequiredField { field: "cidr", .. })
        ));
    }

    #[test]
    fn cidr_is_immutable() {
        let a = Vpc {
            cidr: Some("10.0.0.0/16".to_string()),
            ..expected()
        };
        let e = expected();
        let changes = crate::diff::build_changes(Some(&a), &e).unwrap();
        assert!(matches!(
            Vpc::check_changes(Some(&a), &e, &changes),
            Err(Error::CannotChangeField { field: "cidr", .. })
        ));
    }

    #[test]
    fn shared_vpc_links_by_raw_id() {
        let vpc = Vpc {
            shared: Some(true),
            id: Some("vpc-12345678".to_string()),
            ..expected()
        };
        assert_eq!(vpc.terraform_link().unwrap().as_str(), "vpc-12345678");

        let owned = expected();
        assert_eq!(owned.terraform_link().unwrap().as_str(), "${aws_vpc.main.id}");
    }
}
