//! The task contract, the task enum, and the compiled task map.
//!
//! A task is a typed declarative description of one cloud resource. Each
//! kind is a serde struct with every field optional; the [`TaskSpec`]
//! trait is the contract a kind satisfies (discover, validate the
//! transition, render per target, plus optional hooks). The [`Task`] enum
//! gives the engine a uniform handle; its dispatch boilerplate is
//! generated by the `task_kinds!` macro so adding a kind is one line here
//! plus the implementation module.
//!
//! Tasks reference each other by name through [`TaskRef`], never by
//! pointer. A bare name resolves within the referencing field's natural
//! kind; a `kind/name` form addresses any kind. References resolve
//! against the [`TaskMap`], which is also where identities discovered or
//! created during a run are published for dependents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cloud::{Cloud, CloudProvider};
use crate::diff::Changes;
use crate::error::{Error, Result};
use crate::resource::ResourceHolder;
use crate::store::ca::CaStore;
use crate::store::secrets::SecretStore;
use crate::target::{ApiTarget, TerraformTarget, TfLiteral};
use crate::tasks;

/// What a task sees while finding and rendering: the cloud handle, both
/// stores, and the (read-only) task map for reference resolution.
pub struct RunEnv<'a> {
    pub cloud: &'a Cloud,
    pub ca: &'a CaStore,
    pub secrets: &'a SecretStore,
    pub tasks: &'a TaskMap,
}

/// By-name reference to another task.
///
/// Serialized as a plain string: either a local name (resolved under the
/// field's natural kind) or `kind/name`. On the actual side of a diff a
/// ref may hold a raw cloud id reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRef(String);

impl TaskRef {
    pub fn new(name: impl Into<String>) -> Self {
        TaskRef(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// The task-map key this reference addresses, given the kind the
    /// referencing field defaults to.
    pub fn key(&self, default_kind: &str) -> String {
        if self.0.contains('/') {
            self.0.clone()
        } else {
            format!("{default_kind}/{}", self.0)
        }
    }
}

impl From<&str> for TaskRef {
    fn from(name: &str) -> Self {
        TaskRef::new(name)
    }
}

/// Contract every task kind implements.
pub trait TaskSpec: Sized {
    const KIND: &'static str;

    /// The provider this kind talks to; `None` for provider-neutral kinds
    /// (store-backed artifacts).
    const PROVIDER: Option<CloudProvider> = Some(CloudProvider::Aws);

    fn name(&self) -> Option<&str>;
    fn set_name(&mut self, name: &str);

    /// Cloud identity, once known.
    fn id(&self) -> Option<&str> {
        None
    }

    /// Task-map keys this task depends on (reference fields plus any
    /// edges field reflection would not see).
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Resource holders this task carries.
    fn resources(&self) -> Vec<&ResourceHolder> {
        Vec::new()
    }

    fn resources_mut(&mut self) -> Vec<&mut ResourceHolder> {
        Vec::new()
    }

    /// Query the cloud for the existing resource matching this task's
    /// identity. Returns `None` when absent. May adopt the resolved id
    /// onto `self`; must not mutate fields the diff observes.
    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>>;

    /// Validate the requested transition before any write.
    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()>;

    /// Apply through the live cloud API.
    fn render_api(
        &mut self,
        target: &ApiTarget,
        a: Option<&Self>,
        changes: &Changes,
        env: &RunEnv,
    ) -> Result<()>;

    /// Emit into the infrastructure-as-code document.
    fn render_terraform(
        &mut self,
        target: &mut TerraformTarget,
        a: Option<&Self>,
        changes: &Changes,
        env: &RunEnv,
    ) -> Result<()>;

    /// Publish a DNS-able address, for kinds that have one.
    fn address(&self, _env: &RunEnv) -> Result<Option<String>> {
        Ok(None)
    }

    /// Publish a tag-bearing resource id, for kinds that have one.
    fn resource_id(&self, _env: &RunEnv) -> Result<Option<String>> {
        Ok(None)
    }

    /// Symbolic reference to this task in an emitted document.
    fn terraform_link(&self) -> Option<TfLiteral> {
        None
    }

    /// Symbolic reference to this task's published address in an emitted
    /// document, for kinds that have one.
    fn terraform_address_link(&self) -> Option<TfLiteral> {
        None
    }
}

/// Adopt a discovered identity into `slot`. A divergent existing value is
/// an error: identity, once learned, is never overwritten.
pub fn adopt_id(kind: &'static str, slot: &mut Option<String>, found: &str) -> Result<()> {
    match slot {
        Some(existing) if existing != found => Err(Error::other(format!(
            "{kind}: discovered id {found:?} conflicts with already-known id {existing:?}"
        ))),
        _ => {
            *slot = Some(found.to_string());
            Ok(())
        }
    }
}

fn kind_mismatch(expected: &'static str, got: &str) -> Error {
    Error::other(format!(
        "internal: actual task has kind {got:?}, expected {expected:?}"
    ))
}

macro_rules! task_kinds {
    ( $( $variant:ident ( $kind:literal ) => $ty:ty ),+ $(,)? ) => {
        /// A typed declarative description of a single cloud resource.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Task {
            $( $variant($ty), )+
        }

        impl Task {
            /// Every kind name the engine knows.
            pub const KINDS: &'static [&'static str] = &[ $( $kind, )+ ];

            pub fn kind(&self) -> &'static str {
                match self { $( Task::$variant(_) => $kind, )+ }
            }

            pub fn provider(&self) -> Option<CloudProvider> {
                match self { $( Task::$variant(_) => <$ty as TaskSpec>::PROVIDER, )+ }
            }

            pub fn name(&self) -> Option<&str> {
                match self { $( Task::$variant(t) => t.name(), )+ }
            }

            pub fn set_name(&mut self, name: &str) {
                match self { $( Task::$variant(t) => t.set_name(name), )+ }
            }

            pub fn id(&self) -> Option<&str> {
                match self { $( Task::$variant(t) => t.id(), )+ }
            }

            pub fn dependencies(&self) -> Vec<String> {
                match self { $( Task::$variant(t) => t.dependencies(), )+ }
            }

            pub fn resources(&self) -> Vec<&ResourceHolder> {
                match self { $( Task::$variant(t) => t.resources(), )+ }
            }

            pub fn resources_mut(&mut self) -> Vec<&mut ResourceHolder> {
                match self { $( Task::$variant(t) => t.resources_mut(), )+ }
            }

            /// The task's serialized field tree.
            pub fn to_tree(&self) -> Result<Value> {
                match self { $( Task::$variant(t) => crate::diff::to_tree(t), )+ }
            }

            pub fn find(&mut self, env: &RunEnv) -> Result<Option<Task>> {
                match self {
                    $( Task::$variant(t) => Ok(t.find(env)?.map(Task::$variant)), )+
                }
            }

            pub fn build_changes(&self, actual: Option<&Task>) -> Result<Changes> {
                match self {
                    $( Task::$variant(e) => {
                        let a = match actual {
                            None => None,
                            Some(Task::$variant(a)) => Some(a),
                            Some(other) => return Err(kind_mismatch($kind, other.kind())),
                        };
                        crate::diff::build_changes(a, e)
                    } )+
                }
            }

            pub fn check_changes(&self, actual: Option<&Task>, changes: &Changes) -> Result<()> {
                match self {
                    $( Task::$variant(e) => {
                        let a = match actual {
                            None => None,
                            Some(Task::$variant(a)) => Some(a),
                            Some(other) => return Err(kind_mismatch($kind, other.kind())),
                        };
                        <$ty as TaskSpec>::check_changes(a, e, changes)
                    } )+
                }
            }

            pub fn render_api(
                &mut self,
                target: &ApiTarget,
                actual: Option<&Task>,
                changes: &Changes,
                env: &RunEnv,
            ) -> Result<()> {
                match self {
                    $( Task::$variant(e) => {
                        let a = match actual {
                            None => None,
                            Some(Task::$variant(a)) => Some(a),
                            Some(other) => return Err(kind_mismatch($kind, other.kind())),
                        };
                        e.render_api(target, a, changes, env)
                    } )+
                }
            }

            pub fn render_terraform(
                &mut self,
                target: &mut TerraformTarget,
                actual: Option<&Task>,
                changes: &Changes,
                env: &RunEnv,
            ) -> Result<()> {
                match self {
                    $( Task::$variant(e) => {
                        let a = match actual {
                            None => None,
                            Some(Task::$variant(a)) => Some(a),
                            Some(other) => return Err(kind_mismatch($kind, other.kind())),
                        };
                        e.render_terraform(target, a, changes, env)
                    } )+
                }
            }

            pub fn address(&self, env: &RunEnv) -> Result<Option<String>> {
                match self { $( Task::$variant(t) => t.address(env), )+ }
            }

            pub fn resource_id(&self, env: &RunEnv) -> Result<Option<String>> {
                match self { $( Task::$variant(t) => t.resource_id(env), )+ }
            }

            pub fn terraform_link(&self) -> Option<TfLiteral> {
                match self { $( Task::$variant(t) => t.terraform_link(), )+ }
            }

            pub fn terraform_address_link(&self) -> Option<TfLiteral> {
                match self { $( Task::$variant(t) => t.terraform_address_link(), )+ }
            }

            /// Parse a model document of the given kind. `Ok(None)` when
            /// the kind is not registered (the loader reports it with the
            /// offending file).
            pub fn from_document(kind: &str, value: serde_yaml::Value) -> Result<Option<Task>> {
                match kind {
                    $( $kind => Ok(Some(Task::$variant(serde_yaml::from_value(value)?))), )+
                    _ => Ok(None),
                }
            }
        }
    };
}

task_kinds! {
    Keypair("keypair") => tasks::keypair::Keypair,
    SshKey("ssh_key") => tasks::ssh_key::SshKey,
    Vpc("vpc") => tasks::vpc::Vpc,
    Subnet("subnet") => tasks::subnet::Subnet,
    InternetGateway("internet_gateway") => tasks::internet_gateway::InternetGateway,
    RouteTable("route_table") => tasks::route_table::RouteTable,
    Route("route") => tasks::route::Route,
    SecurityGroup("security_group") => tasks::security_group::SecurityGroup,
    EbsVolume("ebs_volume") => tasks::ebs_volume::EbsVolume,
    ElasticIp("elastic_ip") => tasks::elastic_ip::ElasticIp,
    IamRole("iam_role") => tasks::iam::IamRole,
    IamRolePolicy("iam_role_policy") => tasks::iam::IamRolePolicy,
    IamInstanceProfile("iam_instance_profile") => tasks::iam::IamInstanceProfile,
    AutoscalingGroup("autoscaling_group") => tasks::autoscaling_group::AutoscalingGroup,
    LoadBalancer("load_balancer") => tasks::load_balancer::LoadBalancer,
    DnsZone("dns_zone") => tasks::dns::DnsZone,
    DnsName("dns_name") => tasks::dns::DnsName,
}

/// The compiled model: tasks keyed `kind/name`, deterministic iteration.
#[derive(Debug, Default)]
pub struct TaskMap {
    tasks: BTreeMap<String, Task>,
}

impl TaskMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task; duplicate keys are a model error.
    pub fn insert(&mut self, key: &str, task: Task) -> Result<()> {
        if self.tasks.contains_key(key) {
            return Err(Error::DuplicateTask {
                key: key.to_string(),
            });
        }
        self.tasks.insert(key.to_string(), task);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Task> {
        self.tasks.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }

    /// Remove a task for execution; pair with [`TaskMap::put`].
    pub fn take(&mut self, key: &str) -> Option<Task> {
        self.tasks.remove(key)
    }

    /// Re-insert a task after execution (no duplicate check).
    pub fn put(&mut self, key: &str, task: Task) {
        self.tasks.insert(key.to_string(), task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Task)> {
        self.tasks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Task)> {
        self.tasks.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.tasks.keys()
    }

    /// Resolve a reference to the referenced task's published identity.
    pub fn resolve_id(&self, default_kind: &str, r: &TaskRef) -> Result<String> {
        let key = r.key(default_kind);
        let task = self
            .get(&key)
            .ok_or_else(|| Error::other(format!("reference to unknown task {key:?}")))?;
        task.id()
            .map(str::to_string)
            .ok_or_else(|| Error::other(format!("identity of task {key:?} is not yet known")))
    }

    /// Does `r` resolve to the raw cloud id `id`? Also true when the ref
    /// itself already holds the id (an actual-side ref).
    pub fn ref_matches_id(&self, default_kind: &str, r: &TaskRef, id: &str) -> bool {
        if r.name() == id {
            return true;
        }
        self.get(&r.key(default_kind))
            .and_then(Task::id)
            .map(|known| known == id)
            .unwrap_or(false)
    }

    /// The actual-side value for a single ref field: the expected ref when
    /// it resolves to the discovered id (so no spurious diff results),
    /// otherwise the raw id.
    pub fn actual_ref(
        &self,
        default_kind: &str,
        expected: Option<&TaskRef>,
        actual_id: Option<&str>,
    ) -> Option<TaskRef> {
        let id = actual_id?;
        if let Some(r) = expected {
            if self.ref_matches_id(default_kind, r, id) {
                return Some(r.clone());
            }
        }
        Some(TaskRef::new(id))
    }

    /// Unordered-list variant of [`TaskMap::actual_ref`], for ref sets
    /// that declare ordering-insensitive comparison (subnet sets,
    /// security group sets).
    pub fn actual_ref_list(
        &self,
        default_kind: &str,
        expected: &[TaskRef],
        actual_ids: &[String],
    ) -> Vec<TaskRef> {
        if expected.len() == actual_ids.len() {
            let all_match = actual_ids
                .iter()
                .all(|id| expected.iter().any(|r| self.ref_matches_id(default_kind, r, id)));
            if all_match {
                return expected.to_vec();
            }
        }
        actual_ids.iter().map(TaskRef::new).collect()
    }

    /// The Terraform literal for a referenced task.
    pub fn terraform_link_for(&self, default_kind: &str, r: &TaskRef) -> Result<TfLiteral> {
        let key = r.key(default_kind);
        let task = self
            .get(&key)
            .ok_or_else(|| Error::other(format!("reference to unknown task {key:?}")))?;
        task.terraform_link()
            .ok_or_else(|| Error::other(format!("task {key:?} has no terraform representation")))
    }

    /// The Terraform literal for a referenced task's address.
    pub fn terraform_address_link_for(&self, default_kind: &str, r: &TaskRef) -> Result<TfLiteral> {
        let key = r.key(default_kind);
        let task = self
            .get(&key)
            .ok_or_else(|| Error::other(format!("reference to unknown task {key:?}")))?;
        task.terraform_address_link()
            .ok_or_else(|| Error::other(format!("task {key:?} does not publish an address")))
    }

    /// Ask the task at `key` for its published address.
    pub fn address_of(&self, key: &str, env: &RunEnv) -> Result<Option<String>> {
        match self.get(key) {
            Some(task) => task.address(env),
            None => Err(Error::other(format!("reference to unknown task {key:?}"))),
        }
    }

    /// Ask the task at `key` for its taggable resource id.
    pub fn resource_id_of(&self, key: &str, env: &RunEnv) -> Result<Option<String>> {
        match self.get(key) {
            Some(task) => task.resource_id(env),
            None => Err(Error::other(format!("reference to unknown task {key:?}"))),
        }
    }
}
