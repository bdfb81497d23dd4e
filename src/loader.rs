//! Model loader: directory of templates in, compiled task map out.
//!
//! Every file under the model directory is a Tera template rendering to a
//! YAML document of task descriptions. Document keys are `kind/name`; a
//! bare key takes its kind from the file's stem, so a `vpc.yaml` can
//! simply declare `main:`. A path component starting with `_` names a tag
//! and the subtree only loads when that tag is set.
//!
//! Store access from templates is a two-pass protocol: the first pass
//! renders with recording functions and only collects which certificates
//! and secrets the model wants; everything recorded is then issued; the
//! second pass renders against a read-only snapshot. Template rendering
//! itself never issues anything.
//!
//! The function namespace templates see:
//!
//! - `ca_cert(name)`, `ca_private_key(name)` — issued PKI material
//! - `secret(name)` — opaque secrets
//! - `has_tag(tag)` — tag-set membership
//! - `subnet_cidr(zone)`, `well_known_service_ip(id)` — network math
//! - the `flags` filter — sorted `--k=v` rendering of an options map
//!
//! plus every cluster configuration field as a context variable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::flags::build_flags_value;
use crate::resource::ResourceHolder;
use crate::scheduler;
use crate::store::ca::CaStore;
use crate::store::secrets::SecretStore;
use crate::task::{Task, TaskMap};

/// The special name under which templates fetch the root certificate.
const ROOT_CA_NAME: &str = "ca";

pub struct Loader {
    config: ClusterConfig,
    tags: BTreeSet<String>,
    kinds: BTreeSet<String>,
    resources: BTreeMap<String, ResourceHolder>,
    template_values: BTreeMap<String, Value>,
}

fn required_str(args: &HashMap<String, Value>, name: &str, func: &str) -> tera::Result<String> {
    match args.get(name).and_then(Value::as_str) {
        Some(s) => Ok(s.to_string()),
        None => Err(tera::Error::msg(format!(
            "{func} requires a string {name:?} argument"
        ))),
    }
}

impl Loader {
    pub fn new(config: ClusterConfig) -> Self {
        Loader {
            config,
            tags: BTreeSet::new(),
            kinds: BTreeSet::new(),
            resources: BTreeMap::new(),
            template_values: BTreeMap::new(),
        }
    }

    /// Enable conditional model fragments guarded by these tags.
    pub fn add_tags(&mut self, tags: impl IntoIterator<Item = String>) {
        self.tags.extend(tags);
    }

    /// Register task kinds the model may declare.
    pub fn add_kinds(&mut self, kinds: &[&str]) {
        self.kinds.extend(kinds.iter().map(|k| k.to_string()));
    }

    /// Register a loader-owned named resource (`resource:<name>`).
    pub fn add_resource(&mut self, name: &str, holder: ResourceHolder) {
        self.resources.insert(name.to_string(), holder);
    }

    /// Merge an extra value into the template context.
    pub fn set_template_value(&mut self, name: &str, value: Value) {
        self.template_values.insert(name.to_string(), value);
    }

    /// Compile the model directory into a task map.
    pub fn build(&self, model_dir: &Path, ca: &CaStore, secrets: &SecretStore) -> Result<TaskMap> {
        let files = self.enumerate(model_dir)?;
        info!(files = files.len(), "loading model");

        // Pass one: record which artifacts the templates want.
        let wanted_certs = Arc::new(Mutex::new(BTreeSet::<String>::new()));
        let wanted_secrets = Arc::new(Mutex::new(BTreeSet::<String>::new()));
        {
            let mut tera = self.base_tera(&files)?;
            let certs = Arc::clone(&wanted_certs);
            tera.register_function(
                "ca_cert",
                move |args: &HashMap<String, Value>| -> tera::Result<Value> {
                    let name = required_str(args, "name", "ca_cert")?;
                    certs.lock().unwrap().insert(name);
                    Ok(Value::String(String::new()))
                },
            );
            let keys = Arc::clone(&wanted_certs);
            tera.register_function(
                "ca_private_key",
                move |args: &HashMap<String, Value>| -> tera::Result<Value> {
                    let name = required_str(args, "name", "ca_private_key")?;
                    keys.lock().unwrap().insert(name);
                    Ok(Value::String(String::new()))
                },
            );
            let secrets_wanted = Arc::clone(&wanted_secrets);
            tera.register_function(
                "secret",
                move |args: &HashMap<String, Value>| -> tera::Result<Value> {
                    let name = required_str(args, "name", "secret")?;
                    secrets_wanted.lock().unwrap().insert(name);
                    Ok(Value::String(String::new()))
                },
            );

            let context = self.template_context()?;
            for (name, _) in &files {
                tera.render(name, &context)?;
            }
        }

        // Issue everything recorded, then snapshot a read-only view.
        let wanted_certs = wanted_certs.lock().unwrap().clone();
        let wanted_secrets = wanted_secrets.lock().unwrap().clone();

        let mut cert_view: BTreeMap<String, String> = BTreeMap::new();
        let mut key_view: BTreeMap<String, String> = BTreeMap::new();
        for name in &wanted_certs {
            if name == ROOT_CA_NAME {
                cert_view.insert(name.clone(), ca.root_certificate()?);
                continue;
            }
            debug!(name = %name, "ensuring certificate is issued for the model");
            let pair = ca.issue(name, &[])?;
            cert_view.insert(name.clone(), pair.certificate);
            key_view.insert(name.clone(), pair.private_key);
        }
        let mut secret_view: BTreeMap<String, String> = BTreeMap::new();
        for name in &wanted_secrets {
            secret_view.insert(name.clone(), secrets.issue(name)?);
        }

        // Pass two: render for real against the snapshot.
        let mut tera = self.base_tera(&files)?;
        let cert_view = Arc::new(cert_view);
        let key_view = Arc::new(key_view);
        let secret_view = Arc::new(secret_view);
        {
            let view = Arc::clone(&cert_view);
            tera.register_function(
                "ca_cert",
                move |args: &HashMap<String, Value>| -> tera::Result<Value> {
                    let name = required_str(args, "name", "ca_cert")?;
                    match view.get(&name) {
                        Some(pem) => Ok(Value::String(pem.clone())),
                        None => Err(tera::Error::msg(format!("certificate {name:?} not issued"))),
                    }
                },
            );
            let view = Arc::clone(&key_view);
            tera.register_function(
                "ca_private_key",
                move |args: &HashMap<String, Value>| -> tera::Result<Value> {
                    let name = required_str(args, "name", "ca_private_key")?;
                    if name == ROOT_CA_NAME {
                        return Err(tera::Error::msg(
                            "the root private key is not available to templates",
                        ));
                    }
                    match view.get(&name) {
                        Some(pem) => Ok(Value::String(pem.clone())),
                        None => Err(tera::Error::msg(format!("private key {name:?} not issued"))),
                    }
                },
            );
            let view = Arc::clone(&secret_view);
            tera.register_function(
                "secret",
                move |args: &HashMap<String, Value>| -> tera::Result<Value> {
                    let name = required_str(args, "name", "secret")?;
                    match view.get(&name) {
                        Some(value) => Ok(Value::String(value.clone())),
                        None => Err(tera::Error::msg(format!("secret {name:?} not issued"))),
                    }
                },
            );
        }

        let context = self.template_context()?;
        let mut map = TaskMap::new();
        for (file, _) in &files {
            let rendered = tera.render(file, &context)?;
            self.parse_document(file, &rendered, &mut map)?;
        }

        self.resolve_named_resources(&mut map)?;

        // Referential integrity and cycle detection happen at load time,
        // before anything executes.
        scheduler::run_order(&map)?;

        Ok(map)
    }

    /// Model files, as `(relative path, content)`, with tag-guarded
    /// subtrees filtered out.
    fn enumerate(&self, model_dir: &Path) -> Result<Vec<(String, String)>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(model_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::other(format!("error walking model: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(model_dir)
                .map_err(|_| Error::other("model path outside model directory"))?;

            let guarded_off = rel.components().any(|c| {
                let name = c.as_os_str().to_string_lossy();
                name.starts_with('_') && !self.tags.contains(name.as_ref())
            });
            if guarded_off {
                debug!(path = %rel.display(), "skipping tag-guarded fragment");
                continue;
            }

            let content = std::fs::read_to_string(entry.path())?;
            files.push((rel.to_string_lossy().into_owned(), content));
        }
        Ok(files)
    }

    /// A Tera instance over the model files with the non-store functions
    /// registered.
    fn base_tera(&self, files: &[(String, String)]) -> Result<tera::Tera> {
        let mut tera = tera::Tera::default();
        tera.add_raw_templates(
            files
                .iter()
                .map(|(name, content)| (name.as_str(), content.as_str())),
        )?;

        let tags = self.tags.clone();
        tera.register_function(
            "has_tag",
            move |args: &HashMap<String, Value>| -> tera::Result<Value> {
                let tag = required_str(args, "tag", "has_tag")?;
                Ok(Value::Bool(tags.contains(&tag)))
            },
        );

        let config = self.config.clone();
        tera.register_function(
            "subnet_cidr",
            move |args: &HashMap<String, Value>| -> tera::Result<Value> {
                let zone = required_str(args, "zone", "subnet_cidr")?;
                config
                    .subnet_cidr(&zone)
                    .map(Value::String)
                    .map_err(|e| tera::Error::msg(e.to_string()))
            },
        );

        let config = self.config.clone();
        tera.register_function(
            "well_known_service_ip",
            move |args: &HashMap<String, Value>| -> tera::Result<Value> {
                let id = args.get("id").and_then(Value::as_u64).ok_or_else(|| {
                    tera::Error::msg("well_known_service_ip requires an integer \"id\" argument")
                })?;
                config
                    .well_known_service_ip(id as u32)
                    .map(|ip| Value::String(ip.to_string()))
                    .map_err(|e| tera::Error::msg(e.to_string()))
            },
        );

        tera.register_filter(
            "flags",
            |value: &Value, _args: &HashMap<String, Value>| -> tera::Result<Value> {
                build_flags_value(value)
                    .map(Value::String)
                    .map_err(|e| tera::Error::msg(e.to_string()))
            },
        );

        Ok(tera)
    }

    fn template_context(&self) -> Result<tera::Context> {
        let mut context = tera::Context::from_serialize(&self.config)?;
        context.insert("tags", &self.tags);
        for (name, value) in &self.template_values {
            context.insert(name, value);
        }
        Ok(context)
    }

    /// Parse one rendered document into the map.
    fn parse_document(&self, file: &str, rendered: &str, map: &mut TaskMap) -> Result<()> {
        let trimmed = rendered.trim();
        if trimmed.is_empty() {
            return Ok(());
        }

        let docs: BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str(trimmed).map_err(|e| {
                Error::other(format!("malformed model output from {file:?}: {e}"))
            })?;

        for (doc_key, value) in docs {
            let (kind, local) = match doc_key.split_once('/') {
                Some((kind, local)) => (kind.to_string(), local.to_string()),
                // A bare key takes its kind from the file stem.
                None => (file_stem(file), doc_key.clone()),
            };

            if !self.kinds.contains(&kind) {
                return Err(Error::UnknownTaskKind {
                    kind,
                    file: file.to_string(),
                });
            }

            let mut task = Task::from_document(&kind, value)
                .map_err(|e| Error::other(format!("error in model file {file:?}: {e}")))?
                .ok_or_else(|| Error::UnknownTaskKind {
                    kind: kind.clone(),
                    file: file.to_string(),
                })?;

            if task.name().is_none() {
                task.set_name(&local);
            }

            map.insert(&format!("{kind}/{local}"), task)?;
        }
        Ok(())
    }

    /// Swap `resource:<name>` placeholders for the loader-owned content.
    fn resolve_named_resources(&self, map: &mut TaskMap) -> Result<()> {
        for (key, task) in map.iter_mut() {
            for holder in task.resources_mut() {
                if let Some(name) = holder.named().map(str::to_string) {
                    let found = self.resources.get(&name).ok_or_else(|| {
                        Error::Resource(format!(
                            "named resource {name:?} is not defined (referenced by {key:?})"
                        ))
                    })?;
                    holder.replace(found.source().clone());
                }
            }
        }
        Ok(())
    }
}

fn file_stem(file: &str) -> String {
    Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        model: std::path::PathBuf,
        ca: CaStore,
        secrets: SecretStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model");
        fs::create_dir_all(&model).unwrap();
        let ca = CaStore::open(&dir.path().join("pki")).unwrap();
        let secrets = SecretStore::open(&dir.path().join("secrets")).unwrap();
        Fixture {
            _dir: dir,
            model,
            ca,
            secrets,
        }
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            cloud_provider: "aws".to_string(),
            cluster_name: "k.example.com".to_string(),
            kubernetes_version: "1.2.2".to_string(),
            network_cidr: "172.20.0.0/16".to_string(),
            service_cluster_ip_range: "100.64.0.0/13".to_string(),
            zones: vec!["us-east-1a".to_string()],
            ..Default::default()
        }
    }

    fn loader() -> Loader {
        let mut l = Loader::new(config());
        l.add_kinds(&crate::tasks::standard_kinds(
            crate::cloud::CloudProvider::Aws,
        ));
        l
    }

    #[test]
    fn builds_tasks_from_keyed_documents() {
        let f = fixture();
        fs::write(
            f.model.join("network.yaml"),
            "vpc/main:\n  cidr: \"{{ network_cidr }}\"\nsubnet/us-east-1a:\n  vpc: main\n  cidr: \"{{ subnet_cidr(zone='us-east-1a') }}\"\n  availability_zone: us-east-1a\n",
        )
        .unwrap();

        let map = loader().build(&f.model, &f.ca, &f.secrets).unwrap();
        assert_eq!(map.len(), 2);
        let vpc = map.get("vpc/main").unwrap();
        assert_eq!(vpc.name(), Some("main"));
        match map.get("subnet/us-east-1a").unwrap() {
            Task::Subnet(s) => assert_eq!(s.cidr.as_deref(), Some("172.20.0.0/19")),
            _ => unreachable!(),
        }
    }

    #[test]
    fn bare_keys_take_kind_from_file_stem() {
        let f = fixture();
        fs::write(f.model.join("vpc.yaml"), "main:\n  cidr: 172.20.0.0/16\n").unwrap();
        let map = loader().build(&f.model, &f.ca, &f.secrets).unwrap();
        assert!(map.get("vpc/main").is_some());
    }

    #[test]
    fn tag_guarded_directories_are_conditional() {
        let f = fixture();
        fs::create_dir_all(f.model.join("_aws")).unwrap();
        fs::create_dir_all(f.model.join("_gce")).unwrap();
        fs::write(
            f.model.join("_aws").join("network.yaml"),
            "vpc/main:\n  cidr: 172.20.0.0/16\n",
        )
        .unwrap();
        fs::write(
            f.model.join("_gce").join("network.yaml"),
            "vpc/gce:\n  cidr: 10.0.0.0/16\n",
        )
        .unwrap();

        let mut l = loader();
        l.add_tags(["_aws".to_string()]);
        let map = l.build(&f.model, &f.ca, &f.secrets).unwrap();
        assert!(map.get("vpc/main").is_some());
        assert!(map.get("vpc/gce").is_none());
    }

    #[test]
    fn has_tag_guards_inline_fragments() {
        let f = fixture();
        fs::write(
            f.model.join("network.yaml"),
            "vpc/main:\n  cidr: 172.20.0.0/16\n{% if has_tag(tag=\"_ha\") %}\nvpc/extra:\n  cidr: 10.0.0.0/16\n{% endif %}\n",
        )
        .unwrap();
        let map = loader().build(&f.model, &f.ca, &f.secrets).unwrap();
        assert!(map.get("vpc/extra").is_none());
    }

    #[test]
    fn unknown_kinds_are_fatal_with_the_file() {
        let f = fixture();
        fs::write(f.model.join("oops.yaml"), "quantum_router/x: {}\n").unwrap();
        match loader().build(&f.model, &f.ca, &f.secrets).unwrap_err() {
            Error::UnknownTaskKind { kind, file } => {
                assert_eq!(kind, "quantum_router");
                assert_eq!(file, "oops.yaml");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_keys_are_fatal() {
        let f = fixture();
        fs::write(f.model.join("a.yaml"), "vpc/main:\n  cidr: 172.20.0.0/16\n").unwrap();
        fs::write(f.model.join("b.yaml"), "vpc/main:\n  cidr: 10.0.0.0/16\n").unwrap();
        assert!(matches!(
            loader().build(&f.model, &f.ca, &f.secrets).unwrap_err(),
            Error::DuplicateTask { .. }
        ));
    }

    #[test]
    fn missing_reference_fails_at_load() {
        let f = fixture();
        fs::write(
            f.model.join("network.yaml"),
            "subnet/a:\n  vpc: ghost\n  cidr: 172.20.0.0/19\n",
        )
        .unwrap();
        assert!(matches!(
            loader().build(&f.model, &f.ca, &f.secrets).unwrap_err(),
            Error::UnknownReference { .. }
        ));
    }

    #[test]
    fn store_functions_issue_once_and_serve_stable_values() {
        let f = fixture();
        fs::write(
            f.model.join("asg.yaml"),
            "autoscaling_group/nodes:\n  min_size: 1\n  max_size: 1\n  image_id: ami-1\n  instance_type: t2.micro\n  subnets: []\n  user_data: |\n    token={{ secret(name='kubelet-token') }}\n    {{ ca_cert(name='kubelet') | trim | length }}\n",
        )
        .unwrap();

        // Subnets empty would fail check_changes at run time, not load time.
        let map = loader().build(&f.model, &f.ca, &f.secrets).unwrap();
        let token = f.secrets.get("kubelet-token").unwrap().unwrap();
        assert!(f.ca.get("kubelet").unwrap().is_some());

        match map.get("autoscaling_group/nodes").unwrap() {
            Task::AutoscalingGroup(g) => {
                let data = g.user_data.as_ref().unwrap().as_string().unwrap();
                assert!(data.contains(&format!("token={token}")));
            }
            _ => unreachable!(),
        }

        // A rebuild issues nothing new and renders the same token.
        let map2 = loader().build(&f.model, &f.ca, &f.secrets).unwrap();
        match map2.get("autoscaling_group/nodes").unwrap() {
            Task::AutoscalingGroup(g) => {
                let data = g.user_data.as_ref().unwrap().as_string().unwrap();
                assert!(data.contains(&format!("token={token}")));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn named_resources_resolve_in_a_post_pass() {
        let f = fixture();
        fs::write(
            f.model.join("keys.yaml"),
            "ssh_key/cluster-key:\n  public_key: \"resource:ssh-public-key\"\n",
        )
        .unwrap();

        let mut l = loader();
        l.add_resource(
            "ssh-public-key",
            ResourceHolder::inline("ssh-rsa AAAA... admin"),
        );
        let map = l.build(&f.model, &f.ca, &f.secrets).unwrap();
        match map.get("ssh_key/cluster-key").unwrap() {
            Task::SshKey(k) => {
                assert_eq!(
                    k.public_key.as_ref().unwrap().as_string().unwrap(),
                    "ssh-rsa AAAA... admin"
                );
            }
            _ => unreachable!(),
        }

        // Without the resource registered, the same model fails.
        assert!(loader().build(&f.model, &f.ca, &f.secrets).is_err());
    }

    #[test]
    fn flags_filter_is_available_to_templates() {
        let f = fixture();
        fs::write(
            f.model.join("asg.yaml"),
            "autoscaling_group/nodes:\n  min_size: 1\n  max_size: 1\n  image_id: ami-1\n  instance_type: t2.micro\n  user_data: \"kubelet {{ kubelet_options | flags }}\"\n",
        )
        .unwrap();

        let mut l = loader();
        l.set_template_value(
            "kubelet_options",
            serde_json::json!({"v": 2, "cluster-name": "k8s"}),
        );
        let map = l.build(&f.model, &f.ca, &f.secrets).unwrap();
        match map.get("autoscaling_group/nodes").unwrap() {
            Task::AutoscalingGroup(g) => {
                assert_eq!(
                    g.user_data.as_ref().unwrap().as_string().unwrap(),
                    "kubelet --cluster-name=k8s --v=2"
                );
            }
            _ => unreachable!(),
        }
    }
}
