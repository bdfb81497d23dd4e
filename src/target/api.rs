//! Live cloud API target.
//!
//! Carries the cloud handle and the helpers tasks share when applying
//! changes for real: tag reconciliation (read the current tags, add only
//! what is missing) and a bounded wait for resources that take time to
//! reach a desired state.

use std::collections::BTreeMap;
use std::thread;

use tracing::debug;

use crate::cloud::Cloud;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::task::TaskMap;

pub struct ApiTarget {
    pub cloud: Cloud,
}

impl ApiTarget {
    pub fn new(cloud: Cloud) -> Self {
        ApiTarget { cloud }
    }

    /// Nothing to flush; mutations already happened.
    pub fn finish(&mut self, _tasks: &TaskMap) -> Result<()> {
        Ok(())
    }

    /// Ensure `expected` tags are present on `id`, adding only the missing
    /// or differing ones. Reads retry through the eventual-consistency
    /// policy since the resource may have been created moments ago.
    pub fn add_tags(&self, id: &str, expected: &BTreeMap<String, String>) -> Result<()> {
        let actual = self.cloud.get_tags(id)?;

        let mut missing = BTreeMap::new();
        for (k, v) in expected {
            if actual.get(k) != Some(v) {
                missing.insert(k.clone(), v.clone());
            }
        }

        if !missing.is_empty() {
            debug!(id, ?missing, "adding tags");
            self.cloud.create_tags(id, &missing)?;
        }

        Ok(())
    }

    /// Poll until the resource's `attr` reaches `desired`, sleeping
    /// `policy.delay` between attempts; exceeding the bound is a timeout
    /// error.
    pub fn wait_for_state(
        &self,
        rtype: &str,
        id: &str,
        attr: &str,
        desired: &str,
        policy: RetryPolicy,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let found = self
                .cloud
                .describe(rtype, &[crate::cloud::new_filter("resource-id", id)])?;
            let state = found
                .first()
                .and_then(|r| r.attr_str(attr))
                .unwrap_or("?")
                .to_string();
            if state == desired {
                return Ok(());
            }
            if attempt >= policy.max_attempts {
                return Err(Error::other(format!(
                    "timeout waiting for {rtype} {id:?} to reach {desired:?}, state was {state:?}"
                )));
            }
            debug!(rtype, id, state = %state, desired, "waiting for state");
            thread::sleep(policy.delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloud;
    use crate::cloud::CloudProvider;
    use std::time::Duration;

    fn target(mock: &MockCloud) -> ApiTarget {
        ApiTarget::new(mock.cloud(CloudProvider::Aws, "us-east-1", "k.example.com"))
    }

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn add_tags_only_writes_missing_entries() {
        let mock = MockCloud::new();
        let t = target(&mock);
        let created = t.cloud.create("vpc", serde_json::json!({})).unwrap();

        t.add_tags(&created.id, &tags(&[("Name", "main")])).unwrap();
        let writes_after_first = mock.writes();

        // Second reconcile sees the tag already present and writes nothing.
        t.add_tags(&created.id, &tags(&[("Name", "main")])).unwrap();
        assert_eq!(mock.writes(), writes_after_first);
    }

    #[test]
    fn wait_for_state_returns_when_state_matches() {
        let mock = MockCloud::new();
        let t = target(&mock);
        let created = t
            .cloud
            .create("instance", serde_json::json!({"state": "running"}))
            .unwrap();
        t.wait_for_state(
            "instance",
            &created.id,
            "state",
            "running",
            RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(1),
            },
        )
        .unwrap();
    }

    #[test]
    fn wait_for_state_times_out_with_last_state() {
        let mock = MockCloud::new();
        let t = target(&mock);
        let created = t
            .cloud
            .create("instance", serde_json::json!({"state": "pending"}))
            .unwrap();
        let err = t
            .wait_for_state(
                "instance",
                &created.id,
                "state",
                "running",
                RetryPolicy {
                    max_attempts: 2,
                    delay: Duration::from_millis(1),
                },
            )
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
        assert!(err.to_string().contains("pending"));
    }
}
