//! Shared fixture for the end-to-end suites: a default single-zone AWS
//! model rendered into a temp directory, plus store and output helpers.

#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cloudup::cloud::mock::MockCloud;
use cloudup::cloud::CloudProvider;
use cloudup::{CaStore, ClusterConfig, Loader, ResourceHolder, SecretStore, TaskMap};

pub const CLUSTER_NAME: &str = "k.example.com";
pub const ZONE: &str = "us-east-1a";
pub const REGION: &str = "us-east-1";
pub const IMAGE_NAME: &str = "k8s-1.2-base";
pub const IMAGE_ID: &str = "ami-00000001";
pub const LB_NAME: &str = "api-k-example-com";

/// A writer tests can keep a handle on after moving it into a target.
#[derive(Clone, Default)]
pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub model: PathBuf,
    pub state: PathBuf,
}

impl Fixture {
    pub fn stores(&self) -> (CaStore, SecretStore) {
        (
            CaStore::open(&self.state.join("pki")).unwrap(),
            SecretStore::open(&self.state.join("secrets")).unwrap(),
        )
    }

    /// Compile the default model into a fresh task map.
    pub fn build_tasks(&self) -> TaskMap {
        self.build_tasks_with_config(default_config())
    }

    pub fn build_tasks_with_config(&self, mut config: ClusterConfig) -> TaskMap {
        config.apply_defaults().unwrap();
        config.validate().unwrap();

        let mut loader = Loader::new(config);
        loader.add_kinds(&cloudup::tasks::standard_kinds(CloudProvider::Aws));
        loader.add_tags(["_aws".to_string()]);
        loader.add_resource(
            "ssh-public-key",
            ResourceHolder::inline("ssh-rsa AAAAB3Nza... admin@example.com"),
        );

        let (ca, secrets) = self.stores();
        loader.build(&self.model, &ca, &secrets).unwrap()
    }
}

pub fn default_config() -> ClusterConfig {
    ClusterConfig {
        cloud_provider: "aws".to_string(),
        cluster_name: CLUSTER_NAME.to_string(),
        kubernetes_version: "1.2.2".to_string(),
        network_cidr: "172.20.0.0/16".to_string(),
        service_cluster_ip_range: "100.64.0.0/13".to_string(),
        zones: vec![ZONE.to_string()],
        ..Default::default()
    }
}

/// A mock cloud preloaded with the image the default model references.
pub fn mock_cloud() -> MockCloud {
    let mock = MockCloud::new();
    mock.add_image(IMAGE_ID, IMAGE_NAME, "self");
    mock
}

/// Write the default model: one zone, a master volume with an elastic IP
/// recorded on it, a node autoscaling group behind a load balancer, and
/// DNS for the API endpoint.
pub fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("model");
    let state = dir.path().join("state");
    fs::create_dir_all(&model).unwrap();

    write(
        &model,
        "keys.yaml",
        r#"keypair/master:
  alt_names:
    - "{{ master_public_name }}"
    - "{{ well_known_service_ip(id=1) }}"

ssh_key/cluster-key:
  public_key: "resource:ssh-public-key"
"#,
    );

    write(
        &model,
        "network.yaml",
        r#"vpc/main:
  cidr: "{{ network_cidr }}"
  enable_dns_support: true
  enable_dns_hostnames: true

{% for zone in zones %}
subnet/{{ zone }}:
  vpc: main
  cidr: "{{ subnet_cidr(zone=zone) }}"
  availability_zone: {{ zone }}
{% endfor %}

internet_gateway/main:
  vpc: main

route_table/main:
  vpc: main
  subnets:
{% for zone in zones %}
    - {{ zone }}
{% endfor %}

route/default:
  route_table: main
  cidr: 0.0.0.0/0
  internet_gateway: main
"#,
    );

    write(
        &model,
        "security.yaml",
        r#"security_group/nodes:
  vpc: main
  description: "Security group for nodes"
  ingress:
    - protocol: tcp
      from_port: 22
      to_port: 22
      cidr: 0.0.0.0/0

security_group/masters:
  vpc: main
  description: "Security group for masters"
  ingress:
    - protocol: tcp
      from_port: 443
      to_port: 443
      cidr: 0.0.0.0/0
    - protocol: "-1"
      from_port: 0
      to_port: 0
      source_group: nodes
"#,
    );

    write(
        &model,
        "iam.yaml",
        r#"iam_role/masters:
  role_policy_document: |
    {"Version": "2012-10-17", "Statement": [{"Effect": "Allow", "Principal": {"Service": "ec2.amazonaws.com"}, "Action": "sts:AssumeRole"}]}

iam_role_policy/masters:
  role: masters
  policy_document: |
    {"Version": "2012-10-17", "Statement": [{"Effect": "Allow", "Action": "ec2:*", "Resource": "*"}]}

iam_instance_profile/masters:
  role: masters
"#,
    );

    write(
        &model,
        "master.yaml",
        r#"{% for zone in zones %}
ebs_volume/master-{{ zone }}:
  availability_zone: {{ zone }}
  size_gb: 20
  volume_type: gp2
  tags:
    k8s.io/role/master: "1"
{% endfor %}

elastic_ip/master:
  tag_using_key: kubernetes.io/master-ip
  tag_on_resource: master-{{ zones | first }}
"#,
    );

    write(
        &model,
        "cluster.yaml",
        r#"autoscaling_group/nodes:
  min_size: 2
  max_size: 2
  subnets:
{% for zone in zones %}
    - {{ zone }}
{% endfor %}
  image_id: k8s-1.2-base
  instance_type: t2.medium
  ssh_key: cluster-key
  security_groups:
    - nodes
  associate_public_ip: true
  iam_instance_profile: masters
  user_data: |
    #!/bin/bash
    # kubelet bootstrap token: {{ secret(name='kubelet-token') }}
    echo starting

load_balancer/{{ lb_name }}:
  listeners:
    - port: 443
      instance_port: 443
      protocol: TCP
  subnets:
{% for zone in zones %}
    - {{ zone }}
{% endfor %}
  security_groups:
    - masters

dns_zone/{{ dns_zone }}: {}

dns_name/{{ master_public_name }}:
  zone: "{{ dns_zone }}"
  target: "{{ lb_name }}"
"#
        .replace("{{ lb_name }}", LB_NAME)
        .as_str(),
    );

    Fixture { dir, model, state }
}

fn write(model: &Path, name: &str, content: &str) {
    fs::write(model.join(name), content).unwrap();
}
