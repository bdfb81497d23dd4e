//! Persistent EBS volume (master state disks).
//!
//! Volumes publish a taggable resource id so siblings that cannot carry
//! their own tags (elastic IPs) can record state on them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::diff::Changes;
use crate::error::{Error, Result};
use crate::target::{ApiTarget, TerraformTarget, TfLiteral};
use crate::task::{adopt_id, RunEnv, TaskSpec};
use crate::tasks::compact;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EbsVolume {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_gb: Option<i64>,
    /// Extra tags beyond the standard name/cluster set.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl EbsVolume {
    fn discover(&self, env: &RunEnv) -> Result<Option<crate::cloud::CloudResource>> {
        env.cloud
            .find_one("ebs_volume", &env.cloud.build_filters(self.name.as_deref()))
            .map_err(Into::into)
    }
}

impl TaskSpec for EbsVolume {
    const KIND: &'static str = "ebs_volume";

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
        let Some(resource) = self.discover(env)? else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found existing volume");
        // Strip the standard stamped tags so only the model-owned extras
        // take part in the diff.
        let standard = env.cloud.build_tags(self.name.as_deref(), None);
        let tags: BTreeMap<String, String> = resource
            .tags
            .iter()
            .filter(|(k, _)| !standard.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let actual = EbsVolume {
            name: self.name.clone(),
            id: Some(resource.id.clone()),
            availability_zone: resource.attr_str("availability_zone").map(str::to_string),
            volume_type: resource.attr_str("volume_type").map(str::to_string),
            size_gb: resource.attr_i64("size_gb"),
            tags,
        };
        adopt_id("ebs_volume", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() {
            if e.name.is_none() {
                return Err(Error::required_field("ebs_volume", "name"));
            }
            if e.availability_zone.is_none() {
                return Err(Error::required_field("ebs_volume", "availability_zone"));
            }
            if e.size_gb.is_none() {
                return Err(Error::required_field("ebs_volume", "size_gb"));
            }
        }
        if a.is_some() {
            if changes.contains("availability_zone") {
                return Err(Error::cannot_change_field("ebs_volume", "availability_zone"));
            }
            if changes.contains("size_gb") {
                return Err(Error::cannot_change_field("ebs_volume", "size_gb"));
            }
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
            info!(name = ?self.name, size_gb = ?self.size_gb, "creating volume");
            let created = t.cloud.create(
                "ebs_volume",
                json!({
                    "availability_zone": self.availability_zone,
                    "volume_type": self.volume_type,
                    "size_gb": self.size_gb,
                }),
            )?;
            adopt_id("ebs_volume", &mut self.id, &created.id)?;
        }

        let id = self
            .id
            .clone()
            .ok_or_else(|| Error::other("volume id not set after create"))?;
        t.add_tags(
            &id,
            &t.cloud.build_tags(self.name.as_deref(), Some(&self.tags)),
        )
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
            .ok_or_else(|| Error::required_field("ebs_volume", "name"))?;
        t.render_resource(
            "aws_ebs_volume",
            &name,
            compact(json!({
                "availability_zone": self.availability_zone,
                "type": self.volume_type,
                "size": self.size_gb,
                "tags": env.cloud.build_tags(self.name.as_deref(), Some(&self.tags)),
            })),
        )
    }

    /// Volumes are the standard tag carrier for address-less siblings.
    fn resource_id(&self, env: &RunEnv) -> Result<Option<String>> {
        if let Some(id) = &self.id {
            return Ok(Some(id.clone()));
        }
        Ok(self.discover(env)?.map(|r| r.id))
    }

    fn terraform_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_ebs_volume", n, "id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_immutable() {
        let a = EbsVolume {
            name: Some("master-a".to_string()),
            availability_zone: Some("us-east-1a".to_string()),
            size_gb: Some(20),
            ..Default::default()
        };
        let e = EbsVolume {
            size_gb: Some(100),
            ..a.clone()
        };
        let changes = crate::diff::build_changes(Some(&a), &e).unwrap();
        assert!(matches!(
            EbsVolume::check_changes(Some(&a), &e, &changes),
            Err(Error::CannotChangeField { field: "size_gb", .. })
        ));
    }

    #[test]
    fn create_requires_zone_and_size() {
        let e = EbsVolume {
            name: Some("master-a".to_string()),
            ..Default::default()
        };
        let changes = crate::diff::build_changes(None, &e).unwrap();
        assert!(EbsVolume::check_changes(None, &e, &changes).is_err());
    }
}
