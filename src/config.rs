//! Stack input parameters
//!
//! [`StackConfig`] is the full parameter surface of the synthesizer. It
//! deserializes from a YAML file, carries defaults matching the shipped
//! deployment, and is validated eagerly before any resource is declared.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Smallest subnet the platform will carve, as a prefix length
const MAX_SUBNET_PREFIX: u8 = 28;

/// Input parameters for one synthesized stack
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackConfig {
    /// Project name, becomes the `ProjectName` template parameter default
    #[serde(default = "default_project_name")]
    pub project_name: String,
    /// Domain of the pre-existing hosted zone the record lands in
    #[serde(default)]
    pub domain: String,
    /// Record name prefixed to the domain, e.g. `pypi.srvc`
    #[serde(default = "default_record_name")]
    pub record_name: String,
    /// ECS cluster name
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// ECS service name
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// VPC address range in CIDR notation
    #[serde(default = "default_vpc_cidr")]
    pub vpc_cidr: String,
    /// Number of availability zones to span with a public/private subnet pair
    #[serde(default = "default_max_azs")]
    pub max_azs: u8,
    /// How outbound traffic from the private subnets reaches the internet
    #[serde(default = "default_nat")]
    pub nat: NatStrategy,
    /// Where the package directory lives
    #[serde(default = "default_storage")]
    pub storage: StorageStrategy,
    /// Container image for the package index server
    #[serde(default = "default_image")]
    pub image: String,
    /// CPU units reserved for the container
    #[serde(default = "default_container_cpu")]
    pub container_cpu: u32,
    /// Hard memory limit for the container, in MiB
    #[serde(default = "default_container_memory")]
    pub container_memory: u32,
    /// EC2 instance type for the cluster's container hosts
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    /// Command line passed to the server container
    #[serde(default = "default_server_command")]
    pub server_command: String,
    /// Path where the shared package directory is mounted, host and container
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
}

/// NAT path for the private subnets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum NatStrategy {
    /// A single self-managed NAT instance, the low-cost path
    #[serde(rename_all = "camelCase")]
    Instance {
        /// EC2 instance type for the NAT instance
        #[serde(default = "default_instance_type")]
        instance_type: String,
        /// Region to machine image table the instance boots from
        ami_map: BTreeMap<String, String>,
    },
    /// A managed NAT gateway with an elastic IP
    ManagedGateway,
}

/// Where the shared package file system comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum StorageStrategy {
    /// Attach a file system that already exists outside the stack
    #[serde(rename_all = "camelCase")]
    UseExisting {
        /// Id of the existing file system, e.g. `fs-02396aba539111de6`
        file_system_id: String,
    },
    /// Create a new file system owned by the stack
    #[serde(rename_all = "camelCase")]
    CreateNew {
        /// Encrypt the file system at rest
        #[serde(default)]
        encrypted: bool,
    },
}

impl StackConfig {
    /// Parse a YAML config and validate it
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::validation(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every parameter before construction starts
    pub fn validate(&self) -> Result<()> {
        if !valid_name(&self.project_name) {
            return Err(Error::validation(format!(
                "project name {:?} must be non-empty alphanumeric with - or _",
                self.project_name
            )));
        }
        if !valid_name(&self.cluster_name) {
            return Err(Error::validation(format!(
                "cluster name {:?} must be non-empty alphanumeric with - or _",
                self.cluster_name
            )));
        }
        if !valid_name(&self.service_name) {
            return Err(Error::validation(format!(
                "service name {:?} must be non-empty alphanumeric with - or _",
                self.service_name
            )));
        }
        if self.domain.is_empty() {
            return Err(Error::validation("domain is required"));
        }
        if !valid_dns_name(&self.domain) || !self.domain.contains('.') {
            return Err(Error::validation(format!(
                "domain {:?} must be a bare DNS name like example.com, without a trailing dot",
                self.domain
            )));
        }
        if !valid_dns_name(&self.record_name) {
            return Err(Error::validation(format!(
                "record name {:?} must be a DNS prefix like pypi.srvc",
                self.record_name
            )));
        }
        if !(2..=4).contains(&self.max_azs) {
            return Err(Error::validation(format!(
                "maxAzs must be between 2 and 4, got {}",
                self.max_azs
            )));
        }
        let (_, prefix) = parse_cidr(&self.vpc_cidr)?;
        let slices = u32::from(self.max_azs) * 2;
        let subnet_bits = slices.next_power_of_two().trailing_zeros() as u8;
        if prefix + subnet_bits > MAX_SUBNET_PREFIX {
            return Err(Error::validation(format!(
                "vpc CIDR /{prefix} is too small to carve {slices} subnets"
            )));
        }
        match &self.nat {
            NatStrategy::Instance {
                instance_type,
                ami_map,
            } => {
                if instance_type.is_empty() {
                    return Err(Error::validation("NAT instance type must not be empty"));
                }
                if ami_map.is_empty() {
                    return Err(Error::validation(
                        "NAT instance amiMap must name at least one region",
                    ));
                }
                for (region, ami) in ami_map {
                    if !ami.starts_with("ami-") || ami.len() <= 4 {
                        return Err(Error::validation(format!(
                            "NAT machine image {ami:?} for {region} is not an AMI id"
                        )));
                    }
                }
            }
            NatStrategy::ManagedGateway => {}
        }
        if let StorageStrategy::UseExisting { file_system_id } = &self.storage {
            if !file_system_id.starts_with("fs-") || file_system_id.len() <= 3 {
                return Err(Error::validation(format!(
                    "file system id {file_system_id:?} must look like fs-0123456789abcdef0"
                )));
            }
        }
        if self.image.is_empty() {
            return Err(Error::validation("container image must not be empty"));
        }
        if self.container_cpu == 0 {
            return Err(Error::validation("container CPU reservation must be positive"));
        }
        if self.container_memory == 0 {
            return Err(Error::validation("container memory limit must be positive"));
        }
        if self.instance_type.is_empty() {
            return Err(Error::validation("instance type must not be empty"));
        }
        if self.server_command.is_empty() {
            return Err(Error::validation("server command must not be empty"));
        }
        if !self.mount_path.starts_with('/') {
            return Err(Error::validation(format!(
                "mount path {:?} must be absolute",
                self.mount_path
            )));
        }
        Ok(())
    }

    /// Fully qualified record name including the trailing dot
    pub fn fqdn(&self) -> String {
        format!("{}.{}.", self.record_name, self.domain)
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            domain: String::new(),
            record_name: default_record_name(),
            cluster_name: default_cluster_name(),
            service_name: default_service_name(),
            vpc_cidr: default_vpc_cidr(),
            max_azs: default_max_azs(),
            nat: default_nat(),
            storage: default_storage(),
            image: default_image(),
            container_cpu: default_container_cpu(),
            container_memory: default_container_memory(),
            instance_type: default_instance_type(),
            server_command: default_server_command(),
            mount_path: default_mount_path(),
        }
    }
}

/// Parse `a.b.c.d/len` and check the address sits on its prefix boundary
pub(crate) fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (address, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::validation(format!("CIDR {cidr:?} is missing a prefix length")))?;
    let address: Ipv4Addr = address
        .parse()
        .map_err(|_| Error::validation(format!("CIDR {cidr:?} has an invalid address")))?;
    let prefix: u8 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| Error::validation(format!("CIDR {cidr:?} has an invalid prefix length")))?;
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    if u32::from(address) & !mask != 0 {
        return Err(Error::validation(format!(
            "CIDR {cidr:?} is not aligned to its /{prefix} boundary"
        )));
    }
    Ok((address, prefix))
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn valid_dns_name(name: &str) -> bool {
    !name.is_empty() && !name.ends_with('.') && name.split('.').all(valid_dns_label)
}

fn valid_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

fn default_project_name() -> String {
    "pypiserver".to_string()
}

fn default_record_name() -> String {
    "pypi.srvc".to_string()
}

fn default_cluster_name() -> String {
    "pypiserv_clus".to_string()
}

fn default_service_name() -> String {
    "pypiserv_serv".to_string()
}

fn default_vpc_cidr() -> String {
    "10.0.0.0/24".to_string()
}

fn default_max_azs() -> u8 {
    2
}

fn default_nat() -> NatStrategy {
    NatStrategy::Instance {
        instance_type: default_instance_type(),
        ami_map: BTreeMap::from([("us-west-2".to_string(), "ami-0a4bc8a5c1ed3b5a3".to_string())]),
    }
}

fn default_storage() -> StorageStrategy {
    StorageStrategy::CreateNew { encrypted: false }
}

fn default_image() -> String {
    "pypiserver/pypiserver:latest".to_string()
}

fn default_container_cpu() -> u32 {
    512
}

fn default_container_memory() -> u32 {
    512
}

fn default_instance_type() -> String {
    "t2.micro".to_string()
}

fn default_server_command() -> String {
    "-P . -a . -o /data/packages".to_string()
}

fn default_mount_path() -> String {
    "/data/packages".to_string()
}
