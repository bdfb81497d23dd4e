//! Autoscaling group with its embedded launch configuration.
//!
//! Launch configurations cannot be updated in place, so the configuration
//! is owned by the group: changes to instance settings create a fresh
//! configuration (versioned by a UTC timestamp suffix) and swap the group
//! over to it.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cloud::new_filter;
use crate::diff::Changes;
use crate::error::{Error, Result};
use crate::resource::ResourceHolder;
use crate::target::{ApiTarget, TerraformTarget, TfLiteral};
use crate::task::{adopt_id, RunEnv, TaskRef, TaskSpec};
use crate::tasks::compact;

/// Launch-configuration fields that force a new configuration version.
const LAUNCH_FIELDS: &[&str] = &[
    "user_data",
    "image_id",
    "instance_type",
    "security_groups",
    "associate_public_ip",
    "ssh_key",
    "iam_instance_profile",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoscalingGroup {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<i64>,
    /// Subnets the group spans; compared as a set.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<TaskRef>,
    /// Extra tags beyond the standard name/cluster set.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    /// Image reference: an image id or a resolvable name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<TaskRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<TaskRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub associate_public_ip: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iam_instance_profile: Option<TaskRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<ResourceHolder>,

    /// The active launch configuration; internal bookkeeping.
    #[serde(skip)]
    pub(crate) launch_configuration_name: Option<String>,
}

fn version_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

impl AutoscalingGroup {
    fn resolved_subnet_ids(&self, env: &RunEnv) -> Result<Vec<String>> {
        self.subnets
            .iter()
            .map(|r| env.tasks.resolve_id("subnet", r))
            .collect()
    }

    /// The launch-configuration attribute document, with the image
    /// reference resolved to a concrete id.
    fn launch_configuration_attrs(&self, env: &RunEnv) -> Result<Value> {
        let image_name = self
            .image_id
            .as_ref()
            .ok_or_else(|| Error::required_field("autoscaling_group", "image_id"))?;
        let image = env.cloud.resolve_image(image_name)?;

        let security_group_ids: Vec<String> = self
            .security_groups
            .iter()
            .map(|r| env.tasks.resolve_id("security_group", r))
            .collect::<Result<_>>()?;

        let iam_instance_profile_id = match &self.iam_instance_profile {
            Some(r) => Some(env.tasks.resolve_id("iam_instance_profile", r)?),
            None => None,
        };

        let user_data = match &self.user_data {
            Some(holder) => Some(BASE64.encode(holder.as_bytes()?)),
            None => None,
        };

        Ok(compact(json!({
            "image_id": image.id,
            "instance_type": self.instance_type,
            "ssh_key_name": self.ssh_key.as_ref().map(TaskRef::name),
            "security_group_ids": security_group_ids,
            "associate_public_ip": self.associate_public_ip,
            "iam_instance_profile_id": iam_instance_profile_id,
            "user_data": user_data,
        })))
    }

    fn create_launch_configuration(&self, env: &RunEnv, t: &ApiTarget) -> Result<String> {
        let name = self
            .name
            .as_ref()
            .ok_or_else(|| Error::required_field("autoscaling_group", "name"))?;
        let lc_name = format!("{}-{}", name, version_stamp());
        info!(name = %lc_name, "creating launch configuration");

        let mut attrs = self.launch_configuration_attrs(env)?;
        if let Value::Object(map) = &mut attrs {
            map.insert("name".to_string(), Value::String(lc_name.clone()));
        }
        t.cloud.create("launch_configuration", attrs)?;
        Ok(lc_name)
    }
}

impl TaskSpec for AutoscalingGroup {
    const KIND: &'static str = "autoscaling_group";

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
        deps.extend(self.ssh_key.iter().map(|r| r.key("ssh_key")));
        deps.extend(
            self.iam_instance_profile
                .iter()
                .map(|r| r.key("iam_instance_profile")),
        );
        deps
    }

    fn resources(&self) -> Vec<&ResourceHolder> {
        self.user_data.iter().collect()
    }

    fn resources_mut(&mut self) -> Vec<&mut ResourceHolder> {
        self.user_data.iter_mut().collect()
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let Some(name) = &self.name else {
            return Ok(None);
        };
        let found = env
            .cloud
            .find_one("autoscaling_group", &[new_filter("name", name)])?;
        let Some(group) = found else {
            return Ok(None);
        };

        let lc_name = group
            .attr_str("launch_configuration")
            .ok_or_else(|| {
                Error::other(format!("autoscaling group {name:?} had no launch configuration"))
            })?
            .to_string();
        let lc = env
            .cloud
            .find_one("launch_configuration", &[new_filter("name", &lc_name)])?
            .ok_or_else(|| {
                Error::other(format!("unable to find launch configuration {lc_name:?}"))
            })?;

        debug!(id = %group.id, lc = %lc_name, "found existing autoscaling group");

        let subnet_ids: Vec<String> = group
            .attrs
            .get("subnet_ids")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let security_group_ids: Vec<String> = lc
            .attrs
            .get("security_group_ids")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let standard = env.cloud.build_tags(self.name.as_deref(), None);
        let tags: BTreeMap<String, String> = group
            .attrs
            .get("tags")
            .and_then(|v| serde_json::from_value::<BTreeMap<String, String>>(v.clone()).ok())
            .unwrap_or_default()
            .into_iter()
            .filter(|(k, _)| !standard.contains_key(k))
            .collect();

        // Avoid spurious image changes: the cloud reports an id where the
        // model may carry a name. When the name resolves to the reported
        // id, adopt the expected reference.
        let mut image_id = lc.attr_str("image_id").map(str::to_string);
        if let (Some(expected), Some(actual_image)) = (&self.image_id, &image_id) {
            if expected != actual_image {
                match env.cloud.resolve_image(expected) {
                    Ok(image) if image.id == *actual_image => {
                        debug!(from = %actual_image, to = %expected, "image matches expected name");
                        image_id = Some(expected.clone());
                    }
                    Ok(_) => {}
                    Err(err) => warn!(image = %expected, error = %err, "unable to resolve image"),
                }
            }
        }

        let user_data = match lc.attr_str("user_data") {
            Some(encoded) => {
                let decoded = BASE64
                    .decode(encoded)
                    .map_err(|e| Error::other(format!("error decoding user data: {e}")))?;
                Some(ResourceHolder::inline(String::from_utf8_lossy(&decoded)))
            }
            None => None,
        };

        let actual = AutoscalingGroup {
            name: group.attr_str("name").map(str::to_string),
            id: Some(group.id.clone()),
            min_size: group.attr_i64("min_size"),
            max_size: group.attr_i64("max_size"),
            subnets: env.tasks.actual_ref_list("subnet", &self.subnets, &subnet_ids),
            tags,
            image_id,
            instance_type: lc.attr_str("instance_type").map(str::to_string),
            ssh_key: env
                .tasks
                .actual_ref("ssh_key", self.ssh_key.as_ref(), lc.attr_str("ssh_key_name")),
            security_groups: env.tasks.actual_ref_list(
                "security_group",
                &self.security_groups,
                &security_group_ids,
            ),
            associate_public_ip: lc.attr_bool("associate_public_ip"),
            iam_instance_profile: env.tasks.actual_ref(
                "iam_instance_profile",
                self.iam_instance_profile.as_ref(),
                lc.attr_str("iam_instance_profile_id"),
            ),
            user_data,
            launch_configuration_name: Some(lc_name),
        };
        adopt_id("autoscaling_group", &mut self.id, &group.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, _changes: &Changes) -> Result<()> {
        if e.name.is_none() {
            return Err(Error::required_field("autoscaling_group", "name"));
        }
        if a.is_none() {
            if e.min_size.is_none() {
                return Err(Error::required_field("autoscaling_group", "min_size"));
            }
            if e.max_size.is_none() {
                return Err(Error::required_field("autoscaling_group", "max_size"));
            }
            if e.image_id.is_none() {
                return Err(Error::required_field("autoscaling_group", "image_id"));
            }
            if e.instance_type.is_none() {
                return Err(Error::required_field("autoscaling_group", "instance_type"));
            }
            if e.subnets.is_empty() {
                return Err(Error::required_field("autoscaling_group", "subnets"));
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
        let subnet_ids = self.resolved_subnet_ids(env)?;

        if a.is_none() {
            let lc_name = self.create_launch_configuration(env, t)?;

            info!(name = ?self.name, "creating autoscaling group");
            let created = t.cloud.create(
                "autoscaling_group",
                json!({
                    "name": self.name,
                    "min_size": self.min_size,
                    "max_size": self.max_size,
                    "subnet_ids": subnet_ids,
                    "launch_configuration": lc_name,
                    "tags": t.cloud.build_tags(self.name.as_deref(), Some(&self.tags)),
                }),
            )?;
            adopt_id("autoscaling_group", &mut self.id, &created.id)?;
            self.launch_configuration_name = Some(lc_name);
            return Ok(());
        }

        let id = self
            .id
            .clone()
            .ok_or_else(|| Error::other("autoscaling group id not known"))?;

        if LAUNCH_FIELDS.iter().any(|f| changes.contains(f)) {
            let lc_name = self.create_launch_configuration(env, t)?;
            debug!(name = ?self.name, lc = %lc_name, "switching to new launch configuration");
            t.cloud.modify(
                "autoscaling_group",
                &id,
                json!({"launch_configuration": lc_name}),
            )?;
            self.launch_configuration_name = Some(lc_name);
        }

        if changes.contains("min_size") || changes.contains("max_size") {
            t.cloud.modify(
                "autoscaling_group",
                &id,
                json!({"min_size": self.min_size, "max_size": self.max_size}),
            )?;
        }

        if changes.contains("subnets") {
            t.cloud
                .modify("autoscaling_group", &id, json!({"subnet_ids": subnet_ids}))?;
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
            .ok_or_else(|| Error::required_field("autoscaling_group", "name"))?;

        let key_name = match &self.ssh_key {
            Some(r) => Some(env.tasks.terraform_link_for("ssh_key", r)?),
            None => None,
        };
        let security_groups = self
            .security_groups
            .iter()
            .map(|r| env.tasks.terraform_link_for("security_group", r))
            .collect::<Result<Vec<_>>>()?;
        let iam_instance_profile = match &self.iam_instance_profile {
            Some(r) => Some(env.tasks.terraform_link_for("iam_instance_profile", r)?),
            None => None,
        };
        let user_data = match &self.user_data {
            Some(holder) => Some(holder.as_string()?.to_string()),
            None => None,
        };

        t.render_resource(
            "aws_launch_configuration",
            &name,
            compact(json!({
                "name_prefix": format!("{name}-"),
                "image_id": self.image_id,
                "instance_type": self.instance_type,
                "key_name": key_name,
                "security_groups": security_groups,
                "associate_public_ip_address": self.associate_public_ip,
                "iam_instance_profile": iam_instance_profile,
                "user_data": user_data,
            })),
        )?;

        let subnets = self
            .subnets
            .iter()
            .map(|r| env.tasks.terraform_link_for("subnet", r))
            .collect::<Result<Vec<_>>>()?;
        let tags: Vec<Value> = env
            .cloud
            .build_tags(self.name.as_deref(), Some(&self.tags))
            .into_iter()
            .map(|(k, v)| {
                json!({"key": k, "value": v, "propagate_at_launch": true})
            })
            .collect();

        t.render_resource(
            "aws_autoscaling_group",
            &name,
            compact(json!({
                "name": self.name,
                "min_size": self.min_size,
                "max_size": self.max_size,
                "vpc_zone_identifier": subnets,
                "launch_configuration": TfLiteral::property("aws_launch_configuration", &name, "id"),
                "tag": tags,
            })),
        )
    }
}
