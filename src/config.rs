//! Cluster configuration document.
//!
//! A single declarative YAML document describing the cluster to build:
//! provider, zones, name, Kubernetes version, CIDR ranges, asset URLs and
//! model tags. Absent fields fall back to documented defaults after
//! parsing. The derived network helpers (per-zone subnet CIDRs, well-known
//! service IPs) live here because the model templates call them.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Where the node bootstrap binary is fetched from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeUpConfig {
    pub location: String,
    pub hash: String,
}

/// The cluster configuration. All fields are optional in the document;
/// [`ClusterConfig::apply_defaults`] fills the derivable ones and
/// [`ClusterConfig::validate`] rejects the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cloud provider to use: `aws` or `gce`.
    pub cloud_provider: String,

    /// The version of Kubernetes to install.
    pub kubernetes_version: String,

    /// Name for the cluster, e.g. `k.example.com`. Doubles as the value of
    /// the cluster identity tag on every cloud resource.
    pub cluster_name: String,

    /// The real CIDR allocated to the cluster network (not the overlay).
    pub network_cidr: String,

    /// CIDR from which well-known service IPs are drawn.
    pub service_cluster_ip_range: String,

    /// Zones the cluster spans. All zones must share one region.
    pub zones: Vec<String>,

    /// Region, inferred from the zones when empty.
    pub region: String,

    /// The DNS zone for cluster names; defaults to the apex of the master
    /// public name.
    pub dns_zone: String,

    /// Public name of the API endpoint; defaults to `api.<cluster_name>`.
    pub master_public_name: String,

    pub master_machine_type: String,
    pub master_image: String,
    pub master_volume_size: Option<i64>,

    pub node_machine_type: String,
    pub node_image: String,
    pub node_count: Option<i64>,

    /// Release bundles and other artifacts to fetch onto nodes.
    pub assets: Vec<String>,

    /// Model tags enabling conditional fragments.
    pub tags: Vec<String>,

    pub node_up: NodeUpConfig,
}

const DEFAULT_NODEUP_LOCATION: &str =
    "https://kubeupv2.s3.amazonaws.com/nodeup/nodeup.tar.gz";

impl ClusterConfig {
    /// Parse a configuration document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Fill derivable fields that the document left empty.
    pub fn apply_defaults(&mut self) -> Result<()> {
        if self.master_public_name.is_empty() && !self.cluster_name.is_empty() {
            self.master_public_name = format!("api.{}", self.cluster_name);
        }

        if self.dns_zone.is_empty() && !self.master_public_name.is_empty() {
            let labels: Vec<&str> = self.master_public_name.split('.').collect();
            if labels.len() >= 2 {
                self.dns_zone = labels[labels.len() - 2..].join(".");
            }
        }

        if self.assets.is_empty() {
            if self.kubernetes_version.is_empty() {
                return Err(Error::Config(
                    "must specify a kubernetes_version or provide a release asset".to_string(),
                ));
            }
            let asset = format!(
                "https://storage.googleapis.com/kubernetes-release/release/v{}/kubernetes-server-linux-amd64.tar.gz",
                self.kubernetes_version
            );
            info!(asset = %asset, "adding default kubernetes release asset");
            self.assets.push(asset);
        }

        if self.node_up.location.is_empty() {
            self.node_up.location = DEFAULT_NODEUP_LOCATION.to_string();
        }

        if self.region.is_empty() {
            self.region = self.infer_region()?;
        }

        Ok(())
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.cloud_provider.is_empty() {
            return Err(Error::Config("cloud_provider is required".to_string()));
        }
        if self.cluster_name.is_empty() {
            return Err(Error::Config("cluster_name is required".to_string()));
        }
        if self.zones.is_empty() {
            return Err(Error::Config("at least one zone is required".to_string()));
        }
        Ok(())
    }

    /// Derive the region from the zone list; clusters cannot span regions.
    fn infer_region(&self) -> Result<String> {
        let mut region: Option<String> = None;
        for zone in &self.zones {
            if zone.len() <= 2 {
                return Err(Error::Config(format!("invalid zone: {zone:?}")));
            }
            let zone_region = zone[..zone.len() - 1].to_string();
            match &region {
                Some(r) if *r != zone_region => {
                    return Err(Error::Config(
                        "clusters cannot span multiple regions".to_string(),
                    ));
                }
                _ => region = Some(zone_region),
            }
        }
        region.ok_or_else(|| Error::Config("at least one zone is required".to_string()))
    }

    /// The CIDR for the subnet in `zone`: the network CIDR split into up to
    /// eight subnets (prefix + 3 bits), shifted by the zone's index.
    pub fn subnet_cidr(&self, zone: &str) -> Result<String> {
        let index = self
            .zones
            .iter()
            .position(|z| z == zone)
            .ok_or_else(|| Error::Config(format!("zone not configured: {zone:?}")))?;

        let net: Ipv4Net = self
            .network_cidr
            .parse()
            .map_err(|_| Error::Config(format!("invalid network_cidr: {:?}", self.network_cidr)))?;

        let subnet_length = net.prefix_len() + 3;
        if subnet_length > 32 {
            return Err(Error::Config(format!(
                "network_cidr {:?} is too small to subdivide",
                self.network_cidr
            )));
        }

        let base = u32::from(net.network());
        let subnet_ip = base + ((index as u32) << (32 - subnet_length));
        Ok(format!("{}/{}", Ipv4Addr::from(subnet_ip), subnet_length))
    }

    /// The well-known service IP at offset `id` within the service range.
    pub fn well_known_service_ip(&self, id: u32) -> Result<Ipv4Addr> {
        let net: Ipv4Net = self.service_cluster_ip_range.parse().map_err(|_| {
            Error::Config(format!(
                "invalid service_cluster_ip_range: {:?}",
                self.service_cluster_ip_range
            ))
        })?;
        Ok(Ipv4Addr::from(u32::from(net.network()) + id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ClusterConfig {
        ClusterConfig {
            cloud_provider: "aws".to_string(),
            cluster_name: "k.example.com".to_string(),
            kubernetes_version: "1.2.2".to_string(),
            network_cidr: "172.20.0.0/16".to_string(),
            service_cluster_ip_range: "100.64.0.0/13".to_string(),
            zones: vec![
                "us-east-1a".to_string(),
                "us-east-1b".to_string(),
                "us-east-1c".to_string(),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn subnet_cidr_shifts_by_zone_index() {
        let config = base();
        assert_eq!(config.subnet_cidr("us-east-1a").unwrap(), "172.20.0.0/19");
        assert_eq!(config.subnet_cidr("us-east-1b").unwrap(), "172.20.32.0/19");
        assert_eq!(config.subnet_cidr("us-east-1c").unwrap(), "172.20.64.0/19");
    }

    #[test]
    fn subnet_cidr_rejects_unknown_zone() {
        assert!(base().subnet_cidr("eu-west-1a").is_err());
    }

    #[test]
    fn well_known_service_ip_offsets_network_base() {
        let config = base();
        assert_eq!(
            config.well_known_service_ip(1).unwrap(),
            "100.64.0.1".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            config.well_known_service_ip(10).unwrap(),
            "100.64.0.10".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn defaults_fill_master_name_dns_zone_and_assets() {
        let mut config = base();
        config.apply_defaults().unwrap();
        assert_eq!(config.master_public_name, "api.k.example.com");
        assert_eq!(config.dns_zone, "example.com");
        assert_eq!(config.region, "us-east-1");
        assert!(config.assets[0].contains("v1.2.2"));
        assert!(!config.node_up.location.is_empty());
    }

    #[test]
    fn missing_version_and_assets_is_an_error() {
        let mut config = base();
        config.kubernetes_version = String::new();
        assert!(config.apply_defaults().is_err());
    }

    #[test]
    fn zones_must_share_a_region() {
        let mut config = base();
        config.zones = vec!["us-east-1a".to_string(), "us-west-2a".to_string()];
        assert!(config.apply_defaults().is_err());
    }

    #[test]
    fn parses_yaml_document() {
        let config = ClusterConfig::from_yaml(
            "cloud_provider: aws\ncluster_name: k.example.com\nzones: [us-east-1a]\n",
        )
        .unwrap();
        assert_eq!(config.cloud_provider, "aws");
        config.validate().unwrap();
    }
}
