//! IAM tasks: role, inline role policy, and instance profile.
//!
//! The cloud reformats policy documents, so discovery parses both sides
//! as JSON and adopts the expected text when they are structurally equal;
//! only a real semantic difference shows up as drift.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::cloud::new_filter;
use crate::diff::Changes;
use crate::error::{Error, Result};
use crate::resource::ResourceHolder;
use crate::target::{ApiTarget, TerraformTarget, TfLiteral};
use crate::task::{adopt_id, RunEnv, TaskRef, TaskSpec};
use crate::tasks::compact;

/// Adopt the expected policy text when the reported document is
/// JSON-equal to it; otherwise keep what the cloud reported.
fn canonicalize_policy(reported: &str, expected: Option<&ResourceHolder>) -> Result<String> {
    let Some(expected) = expected else {
        return Ok(reported.to_string());
    };
    let expected_text = expected.as_string()?;

    let reported_json: std::result::Result<serde_json::Value, _> = serde_json::from_str(reported);
    let expected_json: std::result::Result<serde_json::Value, _> = serde_json::from_str(expected_text);
    if let (Ok(reported_json), Ok(expected_json)) = (reported_json, expected_json) {
        if reported_json == expected_json {
            debug!("reported policy document is json-equal to expected");
            return Ok(expected_text.to_string());
        }
    }
    Ok(reported.to_string())
}

// ---------------------------------------------------------------------------
// IAM role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IamRole {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The assume-role (trust) policy document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_policy_document: Option<ResourceHolder>,
}

impl TaskSpec for IamRole {
    const KIND: &'static str = "iam_role";

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn resources(&self) -> Vec<&ResourceHolder> {
        self.role_policy_document.iter().collect()
    }

    fn resources_mut(&mut self) -> Vec<&mut ResourceHolder> {
        self.role_policy_document.iter_mut().collect()
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let Some(name) = &self.name else {
            return Ok(None);
        };
        let found = env.cloud.find_one("iam_role", &[new_filter("name", name)])?;
        let Some(resource) = found else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found matching iam role");
        let document = match resource.attr_str("assume_role_policy") {
            Some(reported) => Some(ResourceHolder::inline(canonicalize_policy(
                reported,
                self.role_policy_document.as_ref(),
            )?)),
            None => None,
        };

        let actual = IamRole {
            name: resource.attr_str("name").map(str::to_string),
            id: Some(resource.id.clone()),
            role_policy_document: document,
        };
        adopt_id("iam_role", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() && e.name.is_none() {
            return Err(Error::required_field("iam_role", "name"));
        }
        if a.is_some() && changes.contains("name") {
            return Err(Error::cannot_change_field("iam_role", "name"));
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
        let policy = self
            .role_policy_document
            .as_ref()
            .ok_or_else(|| Error::required_field("iam_role", "role_policy_document"))?
            .as_string()?
            .to_string();

        if a.is_none() {
            info!(name = ?self.name, "creating iam role");
            let created = t.cloud.create(
                "iam_role",
                json!({"name": self.name, "assume_role_policy": policy}),
            )?;
            adopt_id("iam_role", &mut self.id, &created.id)?;
        } else if changes.contains("role_policy_document") {
            let id = self
                .id
                .clone()
                .ok_or_else(|| Error::other("iam role id not known"))?;
            debug!(name = ?self.name, "updating assume-role policy");
            t.cloud
                .modify("iam_role", &id, json!({"assume_role_policy": policy}))?;
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
            .ok_or_else(|| Error::required_field("iam_role", "name"))?;
        let policy = self
            .role_policy_document
            .as_ref()
            .ok_or_else(|| Error::required_field("iam_role", "role_policy_document"))?
            .as_string()?
            .to_string();

        t.render_resource(
            "aws_iam_role",
            &name,
            compact(json!({"name": self.name, "assume_role_policy": policy})),
        )
    }

    fn terraform_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_iam_role", n, "name"))
    }
}

// ---------------------------------------------------------------------------
// Inline role policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IamRolePolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<TaskRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_document: Option<ResourceHolder>,
}

impl TaskSpec for IamRolePolicy {
    const KIND: &'static str = "iam_role_policy";

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
        self.role.iter().map(|r| r.key("iam_role")).collect()
    }

    fn resources(&self) -> Vec<&ResourceHolder> {
        self.policy_document.iter().collect()
    }

    fn resources_mut(&mut self) -> Vec<&mut ResourceHolder> {
        self.policy_document.iter_mut().collect()
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let Some(name) = &self.name else {
            return Ok(None);
        };
        let found = env
            .cloud
            .find_one("iam_role_policy", &[new_filter("name", name)])?;
        let Some(resource) = found else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found matching iam role policy");
        let document = match resource.attr_str("policy") {
            Some(reported) => Some(ResourceHolder::inline(canonicalize_policy(
                reported,
                self.policy_document.as_ref(),
            )?)),
            None => None,
        };

        let actual = IamRolePolicy {
            name: resource.attr_str("name").map(str::to_string),
            id: Some(resource.id.clone()),
            role: env
                .tasks
                .actual_ref("iam_role", self.role.as_ref(), resource.attr_str("role_id")),
            policy_document: document,
        };
        adopt_id("iam_role_policy", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() {
            if e.name.is_none() {
                return Err(Error::required_field("iam_role_policy", "name"));
            }
            if e.role.is_none() {
                return Err(Error::required_field("iam_role_policy", "role"));
            }
        }
        if a.is_some() {
            if changes.contains("name") {
                return Err(Error::cannot_change_field("iam_role_policy", "name"));
            }
            if changes.contains("role") {
                return Err(Error::cannot_change_field("iam_role_policy", "role"));
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
        let policy = self
            .policy_document
            .as_ref()
            .ok_or_else(|| Error::required_field("iam_role_policy", "policy_document"))?
            .as_string()?
            .to_string();

        if a.is_none() {
            let role_ref = self
                .role
                .as_ref()
                .ok_or_else(|| Error::required_field("iam_role_policy", "role"))?;
            let role_id = env.tasks.resolve_id("iam_role", role_ref)?;

            info!(name = ?self.name, "creating iam role policy");
            let created = t.cloud.create(
                "iam_role_policy",
                json!({"name": self.name, "role_id": role_id, "policy": policy}),
            )?;
            adopt_id("iam_role_policy", &mut self.id, &created.id)?;
        } else if changes.contains("policy_document") {
            let id = self
                .id
                .clone()
                .ok_or_else(|| Error::other("iam role policy id not known"))?;
            debug!(name = ?self.name, "updating role policy");
            t.cloud
                .modify("iam_role_policy", &id, json!({"policy": policy}))?;
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
            .ok_or_else(|| Error::required_field("iam_role_policy", "name"))?;
        let role_ref = self
            .role
            .as_ref()
            .ok_or_else(|| Error::required_field("iam_role_policy", "role"))?;
        let policy = self
            .policy_document
            .as_ref()
            .ok_or_else(|| Error::required_field("iam_role_policy", "policy_document"))?
            .as_string()?
            .to_string();

        t.render_resource(
            "aws_iam_role_policy",
            &name,
            compact(json!({
                "name": self.name,
                "role": env.tasks.terraform_link_for("iam_role", role_ref)?,
                "policy": policy,
            })),
        )
    }
}

// ---------------------------------------------------------------------------
// Instance profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IamInstanceProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The role attached to the profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<TaskRef>,
}

impl TaskSpec for IamInstanceProfile {
    const KIND: &'static str = "iam_instance_profile";

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
        self.role.iter().map(|r| r.key("iam_role")).collect()
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let Some(name) = &self.name else {
            return Ok(None);
        };
        let found = env
            .cloud
            .find_one("iam_instance_profile", &[new_filter("name", name)])?;
        let Some(resource) = found else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found matching instance profile");
        let actual = IamInstanceProfile {
            name: resource.attr_str("name").map(str::to_string),
            id: Some(resource.id.clone()),
            role: env
                .tasks
                .actual_ref("iam_role", self.role.as_ref(), resource.attr_str("role_id")),
        };
        adopt_id("iam_instance_profile", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() && e.name.is_none() {
            return Err(Error::required_field("iam_instance_profile", "name"));
        }
        if a.is_some() && changes.contains("name") {
            return Err(Error::cannot_change_field("iam_instance_profile", "name"));
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
        let role_id = match &self.role {
            Some(r) => Some(env.tasks.resolve_id("iam_role", r)?),
            None => None,
        };

        if a.is_none() {
            info!(name = ?self.name, "creating instance profile");
            let created = t.cloud.create(
                "iam_instance_profile",
                json!({"name": self.name, "role_id": role_id}),
            )?;
            adopt_id("iam_instance_profile", &mut self.id, &created.id)?;
        } else if changes.contains("role") {
            let id = self
                .id
                .clone()
                .ok_or_else(|| Error::other("instance profile id not known"))?;
            debug!(name = ?self.name, "re-attaching profile role");
            t.cloud
                .modify("iam_instance_profile", &id, json!({"role_id": role_id}))?;
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
            .ok_or_else(|| Error::required_field("iam_instance_profile", "name"))?;
        let roles = match &self.role {
            Some(r) => Some(vec![env.tasks.terraform_link_for("iam_role", r)?]),
            None => None,
        };
        t.render_resource(
            "aws_iam_instance_profile",
            &name,
            compact(json!({"name": self.name, "roles": roles})),
        )
    }

    fn terraform_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_iam_instance_profile", n, "id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_equal_policies_adopt_expected_text() {
        let expected = ResourceHolder::inline("{\"Version\": \"2012-10-17\"}");
        let reported = "{ \"Version\":\"2012-10-17\" }";
        let adopted = canonicalize_policy(reported, Some(&expected)).unwrap();
        assert_eq!(adopted, "{\"Version\": \"2012-10-17\"}");
    }

    #[test]
    fn semantically_different_policies_keep_reported_text() {
        let expected = ResourceHolder::inline("{\"Version\": \"2012-10-17\"}");
        let reported = "{\"Version\": \"2008-10-17\"}";
        let kept = canonicalize_policy(reported, Some(&expected)).unwrap();
        assert_eq!(kept, reported);
    }

    #[test]
    fn profile_depends_on_role() {
        let profile = IamInstanceProfile {
            name: Some("masters".to_string()),
            role: Some(TaskRef::new("masters")),
            ..Default::default()
        };
        assert_eq!(profile.dependencies(), vec!["iam_role/masters".to_string()]);
    }

    #[test]
    fn role_name_is_immutable() {
        let a = IamRole {
            name: Some("masters".to_string()),
            ..Default::default()
        };
        let e = IamRole {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        let changes = crate::diff::build_changes(Some(&a), &e).unwrap();
        assert!(IamRole::check_changes(Some(&a), &e, &changes).is_err());
    }
}
