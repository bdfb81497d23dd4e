//! Elastic IP for the master.
//!
//! Elastic IPs cannot carry tags, so the allocation is recorded as a tag
//! on a sibling tag-bearing resource (the master's EBS volume). Discovery
//! reads that tag back to find the allocation; creation refuses to
//! allocate without a tag destination, since an untracked address would
//! leak.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::cloud::new_filter;
use crate::diff::Changes;
use crate::error::{Error, Result};
use crate::target::{ApiTarget, TerraformTarget, TfLiteral};
use crate::task::{adopt_id, RunEnv, TaskRef, TaskSpec};
use crate::tasks::compact;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ElasticIp {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    /// Tag key under which the allocation is recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_using_key: Option<String>,
    /// The tag-bearing task the allocation is recorded on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_on_resource: Option<TaskRef>,
}

impl ElasticIp {
    fn tag_on_resource_id(&self, env: &RunEnv) -> Result<Option<String>> {
        match &self.tag_on_resource {
            Some(r) => env.tasks.resource_id_of(&r.key("ebs_volume"), env),
            None => Ok(None),
        }
    }

    fn discover(&self, env: &RunEnv) -> Result<Option<(String, String)>> {
        let mut public_ip = self.public_ip.clone();
        let allocation_id = self.id.clone();

        // Recover the address from the tag on the sibling resource.
        if allocation_id.is_none() && public_ip.is_none() {
            let (Some(key), Some(resource_id)) =
                (&self.tag_using_key, self.tag_on_resource_id(env)?)
            else {
                return Ok(None);
            };
            let tags = env.cloud.get_tags(&resource_id)?;
            match tags.get(key) {
                Some(ip) => {
                    debug!(ip = %ip, "found public ip via tag");
                    public_ip = Some(ip.clone());
                }
                None => return Ok(None),
            }
        }

        let filters = if let Some(id) = &allocation_id {
            vec![new_filter("resource-id", id)]
        } else if let Some(ip) = &public_ip {
            vec![new_filter("public_ip", ip)]
        } else {
            return Ok(None);
        };

        let found = env.cloud.find_one("elastic_ip", &filters)?;
        Ok(found.map(|r| {
            let ip = r.attr_str("public_ip").unwrap_or_default().to_string();
            (r.id, ip)
        }))
    }
}

impl TaskSpec for ElasticIp {
    const KIND: &'static str = "elastic_ip";

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
        self.tag_on_resource
            .iter()
            .map(|r| r.key("ebs_volume"))
            .collect()
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let Some((id, public_ip)) = self.discover(env)? else {
            return Ok(None);
        };

        let actual = ElasticIp {
            name: self.name.clone(),
            id: Some(id.clone()),
            public_ip: Some(public_ip),
            // Bookkeeping fields the cloud cannot report; copied so they
            // do not come up as changes.
            tag_using_key: self.tag_using_key.clone(),
            tag_on_resource: self.tag_on_resource.clone(),
        };
        adopt_id("elastic_ip", &mut self.id, &id)?;
        Ok(Some(actual))
    }

    fn check_changes(_a: Option<&Self>, _e: &Self, _changes: &Changes) -> Result<()> {
        Ok(())
    }

    fn render_api(
        &mut self,
        t: &ApiTarget,
        a: Option<&Self>,
        _changes: &Changes,
        env: &RunEnv,
    ) -> Result<()> {
        let tag_on_resource_id = self.tag_on_resource_id(env)?;

        let public_ip = if a.is_none() {
            if self.tag_using_key.is_none() || tag_on_resource_id.is_none() {
                return Err(Error::other(
                    "cannot allocate an elastic ip without a tag destination (the address would leak)",
                ));
            }
            info!("allocating elastic ip");
            let created = t.cloud.create("elastic_ip", json!({"domain": "vpc"}))?;
            adopt_id("elastic_ip", &mut self.id, &created.id)?;
            let ip = created
                .attr_str("public_ip")
                .ok_or_else(|| Error::other("cloud did not assign a public ip"))?
                .to_string();
            self.public_ip = Some(ip.clone());
            ip
        } else {
            a.and_then(|a| a.public_ip.clone())
                .ok_or_else(|| Error::other("existing elastic ip has no public ip"))?
        };

        // Record the allocation on the sibling resource.
        if let (Some(key), Some(resource_id)) = (&self.tag_using_key, &tag_on_resource_id) {
            let mut tags = std::collections::BTreeMap::new();
            tags.insert(key.clone(), public_ip);
            t.add_tags(resource_id, &tags)?;
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
            .ok_or_else(|| Error::required_field("elastic_ip", "name"))?;
        t.render_resource("aws_eip", &name, compact(json!({"vpc": true})))
    }

    fn address(&self, env: &RunEnv) -> Result<Option<String>> {
        if let Some(ip) = &self.public_ip {
            return Ok(Some(ip.clone()));
        }
        Ok(self.discover(env)?.map(|(_, ip)| ip))
    }

    fn terraform_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_eip", n, "id"))
    }

    fn terraform_address_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_eip", n, "public_ip"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depends_on_the_tag_carrier() {
        let eip = ElasticIp {
            name: Some("master".to_string()),
            tag_using_key: Some("kubernetes.io/master-ip".to_string()),
            tag_on_resource: Some(TaskRef::new("master-us-east-1a")),
            ..Default::default()
        };
        assert_eq!(eip.dependencies(), vec!["ebs_volume/master-us-east-1a".to_string()]);
    }

    #[test]
    fn transitions_are_unrestricted() {
        let e = ElasticIp::default();
        let changes = crate::diff::build_changes(None, &e).unwrap();
        assert!(ElasticIp::check_changes(None, &e, &changes).is_ok());
    }
}
