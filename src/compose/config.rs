//! Project definition types
//!
//! A lenient, typed view of a compose-style definition. Fields that accept
//! several shapes (list or map, string or list, number or string) are modeled
//! as untagged enums. Fields Berth recognizes but does not implement are kept
//! as raw JSON so their presence can be reported.

use crate::error::{BerthError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A scalar that may be written as a number, a boolean or a string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(n) => write!(f, "{}", n),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Str(s) => f.write_str(s),
        }
    }
}

impl Scalar {
    /// Numeric value, parsing strings
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Scalar::Int(n) => Ok(*n as f64),
            Scalar::Float(x) => Ok(*x),
            Scalar::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| BerthError::parse(format!("Invalid number: {}", s))),
            Scalar::Bool(_) => Err(BerthError::parse(format!("Invalid number: {}", self))),
        }
    }

    /// Integer value, truncating fractions
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Scalar::Int(n) => Ok(*n),
            _ => self.as_f64().map(|x| x.trunc() as i64),
        }
    }
}

/// `["KEY=VALUE", ...]` or `{KEY: VALUE}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListOrDict {
    List(Vec<String>),
    Dict(BTreeMap<String, Option<Scalar>>),
}

/// A single string or a list of strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrList::One(s) => vec![s.clone()],
            StringOrList::Many(v) => v.clone(),
        }
    }
}

/// Whole project definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectDef {
    /// Optional explicit project name
    pub name: Option<String>,
    /// Services
    #[serde(deserialize_with = "null_as_default")]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Networks
    #[serde(deserialize_with = "null_as_default")]
    pub networks: BTreeMap<String, NetworkConfig>,
    /// Volumes
    #[serde(deserialize_with = "null_as_default")]
    pub volumes: BTreeMap<String, VolumeConfig>,
    /// Secrets (not implemented)
    pub secrets: Option<Value>,
    /// Configs (not implemented)
    pub configs: Option<Value>,
}

impl ProjectDef {
    /// Deserialize from an (interpolated or raw) definition tree
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Maps whose entries may be written as `name:` with no body
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<BTreeMap<String, T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let map: Option<BTreeMap<String, Option<T>>> = Option::deserialize(deserializer)?;
    Ok(map
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.unwrap_or_default()))
        .collect())
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Image reference
    pub image: Option<String>,
    pub annotations: Option<ListOrDict>,
    pub blkio_config: Option<BlkioConfig>,
    pub cap_add: Option<Vec<String>>,
    pub cap_drop: Option<Vec<String>>,
    pub cgroup: Option<String>,
    pub cgroup_parent: Option<String>,
    /// Command to run
    pub command: Option<CommandConfig>,
    pub container_name: Option<String>,
    pub cpu_count: Option<Scalar>,
    pub cpu_percent: Option<Scalar>,
    pub cpu_shares: Option<Scalar>,
    pub cpu_quota: Option<Scalar>,
    pub cpu_period: Option<Scalar>,
    pub cpu_rt_period: Option<Scalar>,
    pub cpu_rt_runtime: Option<Scalar>,
    /// Fractional CPU count
    pub cpus: Option<Scalar>,
    pub cpuset: Option<String>,
    /// Deploy configuration; only replicas, resources and restart_policy apply
    pub deploy: Option<DeployConfig>,
    pub devices: Option<Vec<DeviceConfig>>,
    pub device_cgroup_rules: Option<Vec<String>>,
    pub dns: Option<StringOrList>,
    pub dns_opt: Option<Vec<String>>,
    pub dns_search: Option<StringOrList>,
    pub domainname: Option<String>,
    /// Entrypoint
    pub entrypoint: Option<CommandConfig>,
    /// Environment variables
    pub environment: Option<ListOrDict>,
    pub expose: Option<Vec<ExposeEntry>>,
    pub extra_hosts: Option<ListOrDict>,
    pub group_add: Option<Vec<Scalar>>,
    /// Healthcheck configuration
    pub healthcheck: Option<HealthcheckConfig>,
    pub hostname: Option<String>,
    pub init: Option<bool>,
    pub isolation: Option<String>,
    /// Labels
    pub labels: Option<ListOrDict>,
    pub mac_address: Option<String>,
    pub mem_limit: Option<Scalar>,
    pub mem_reservation: Option<Scalar>,
    pub mem_swappiness: Option<Scalar>,
    pub memswap_limit: Option<Scalar>,
    pub network_mode: Option<String>,
    /// Networks to connect to
    pub networks: Option<NetworksConfig>,
    pub oom_kill_disable: Option<bool>,
    pub oom_score_adj: Option<Scalar>,
    pub pid: Option<String>,
    pub pids_limit: Option<Scalar>,
    /// Target platform, passed to container create
    pub platform: Option<String>,
    /// Port mappings
    pub ports: Option<Vec<PortConfig>>,
    pub privileged: Option<bool>,
    pub read_only: Option<bool>,
    /// Restart policy (`no`, `always`, `unless-stopped`, `on-failure[:N]`)
    pub restart: Option<String>,
    pub runtime: Option<String>,
    pub security_opt: Option<Vec<String>>,
    pub shm_size: Option<Scalar>,
    pub stdin_open: Option<bool>,
    pub stop_grace_period: Option<Scalar>,
    pub stop_signal: Option<String>,
    pub storage_opt: Option<BTreeMap<String, Scalar>>,
    pub sysctls: Option<ListOrDict>,
    pub tmpfs: Option<StringOrList>,
    pub tty: Option<bool>,
    pub ulimits: Option<BTreeMap<String, UlimitConfig>>,
    pub user: Option<String>,
    pub userns_mode: Option<String>,
    pub uts: Option<String>,
    /// Volume mounts
    pub volumes: Option<Vec<VolumeMount>>,
    pub volumes_from: Option<Vec<String>>,
    pub working_dir: Option<String>,

    // Recognized but not implemented
    pub build: Option<Value>,
    pub configs: Option<Value>,
    pub credential_spec: Option<Value>,
    pub depends_on: Option<Value>,
    pub develop: Option<Value>,
    pub env_file: Option<Value>,
    pub extends: Option<Value>,
    pub external_links: Option<Value>,
    pub ipc: Option<Value>,
    pub links: Option<Value>,
    pub logging: Option<Value>,
    pub post_start: Option<Value>,
    pub pre_stop: Option<Value>,
    pub profiles: Option<Value>,
    pub scale: Option<Value>,
    pub secrets: Option<Value>,
}

impl ServiceConfig {
    /// Names of fields that are present but have no translation
    pub fn unsupported_fields(&self) -> Vec<&'static str> {
        [
            ("build", &self.build),
            ("configs", &self.configs),
            ("credential_spec", &self.credential_spec),
            ("depends_on", &self.depends_on),
            ("develop", &self.develop),
            ("env_file", &self.env_file),
            ("extends", &self.extends),
            ("external_links", &self.external_links),
            ("ipc", &self.ipc),
            ("links", &self.links),
            ("logging", &self.logging),
            ("post_start", &self.post_start),
            ("pre_stop", &self.pre_stop),
            ("profiles", &self.profiles),
            ("scale", &self.scale),
            ("secrets", &self.secrets),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_some())
        .map(|(name, _)| name)
        .collect()
    }
}

/// Command configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

/// Block IO configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlkioConfig {
    pub weight: Option<Scalar>,
    pub weight_device: Option<Vec<WeightDeviceConfig>>,
    pub device_read_bps: Option<Vec<ThrottleDeviceConfig>>,
    pub device_read_iops: Option<Vec<ThrottleDeviceConfig>>,
    pub device_write_bps: Option<Vec<ThrottleDeviceConfig>>,
    pub device_write_iops: Option<Vec<ThrottleDeviceConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightDeviceConfig {
    pub path: String,
    pub weight: Scalar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleDeviceConfig {
    pub path: String,
    pub rate: Scalar,
}

/// Device mapping: `"/dev/x[:/dev/y[:rwm]]"` or long form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceConfig {
    Short(String),
    Long {
        source: String,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        permissions: Option<String>,
    },
}

/// `expose` entry: a port number or `"start[-end][/proto]"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExposeEntry {
    Number(u32),
    Range(String),
}

/// Port configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Bare container port
    Number(u32),
    /// Short syntax: "8080:80"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u32,
    /// Published port or range on host
    #[serde(default)]
    pub published: Option<Scalar>,
    /// Host IP to bind to
    #[serde(default)]
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp/sctp)
    #[serde(default)]
    pub protocol: Option<String>,
    /// Mode (host/ingress)
    #[serde(default)]
    pub mode: Option<String>,
}

/// Volume mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// Short syntax: "source:target[:mode]"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeMountLong {
    /// Mount type (volume, bind, tmpfs, npipe)
    #[serde(rename = "type")]
    pub mount_type: String,
    /// Source path or volume reference
    pub source: Option<String>,
    /// Target path in container
    pub target: Option<String>,
    pub read_only: Option<bool>,
    pub consistency: Option<String>,
    pub bind: Option<BindOptions>,
    pub volume: Option<VolumeOptions>,
    pub tmpfs: Option<TmpfsOptions>,
}

/// Bind mount options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BindOptions {
    /// Propagation mode
    pub propagation: Option<String>,
    /// Create host path
    pub create_host_path: Option<bool>,
    /// SELinux relabeling
    pub selinux: Option<String>,
}

/// Volume options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeOptions {
    /// No copy data from container
    pub nocopy: Option<bool>,
}

/// Tmpfs options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TmpfsOptions {
    /// Size, as bytes or a byte expression
    pub size: Option<Scalar>,
    /// Mode
    pub mode: Option<i64>,
}

/// Networks configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    /// Array of network references
    Array(Vec<String>),
    /// Map of network reference to endpoint config
    Map(BTreeMap<String, Option<ServiceNetworkConfig>>),
}

impl NetworksConfig {
    /// References with their endpoint configuration, in definition order
    pub fn entries(&self) -> Vec<(String, ServiceNetworkConfig)> {
        match self {
            NetworksConfig::Array(names) => names
                .iter()
                .map(|n| (n.clone(), ServiceNetworkConfig::default()))
                .collect(),
            NetworksConfig::Map(map) => map
                .iter()
                .map(|(n, c)| (n.clone(), c.clone().unwrap_or_default()))
                .collect(),
        }
    }
}

/// Per-service network endpoint configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceNetworkConfig {
    pub aliases: Option<Vec<String>>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub link_local_ips: Option<Vec<String>>,
    pub mac_address: Option<String>,
    pub driver_opts: Option<ListOrDict>,
    pub priority: Option<Scalar>,
}

/// Deploy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Number of replicas
    pub replicas: Option<Scalar>,
    /// Resource limits and reservations
    pub resources: Option<ResourcesConfig>,
    /// Restart policy
    pub restart_policy: Option<RestartPolicyConfig>,
    /// Anything else (mode, placement, update_config, ...)
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// Resources configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub limits: Option<ResourceSpec>,
    pub reservations: Option<ResourceSpec>,
}

/// Resource specification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSpec {
    pub cpus: Option<Scalar>,
    pub memory: Option<Scalar>,
    pub pids: Option<Scalar>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// Restart policy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicyConfig {
    /// Condition (none, on-failure, any)
    pub condition: Option<String>,
    pub delay: Option<Scalar>,
    pub max_attempts: Option<Scalar>,
    pub window: Option<Scalar>,
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthcheckConfig {
    /// Test command; a string runs through the shell
    pub test: Option<CommandConfig>,
    pub interval: Option<Scalar>,
    pub timeout: Option<Scalar>,
    pub retries: Option<Scalar>,
    pub start_period: Option<Scalar>,
    pub start_interval: Option<Scalar>,
    /// Disable the image healthcheck
    pub disable: Option<bool>,
}

/// Ulimit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UlimitConfig {
    /// Same value for soft and hard
    Single(Scalar),
    /// Separate soft and hard limits
    SoftHard { soft: Scalar, hard: Scalar },
}

/// Network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Engine-visible name, defaults to `{project}_{reference}`
    pub name: Option<String>,
    pub driver: Option<String>,
    pub driver_opts: Option<ListOrDict>,
    pub ipam: Option<IpamConfig>,
    pub external: Option<ExternalConfig>,
    pub internal: Option<bool>,
    pub attachable: Option<bool>,
    pub enable_ipv6: Option<bool>,
    pub labels: Option<ListOrDict>,
}

/// IPAM configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpamConfig {
    pub driver: Option<String>,
    pub config: Option<Vec<IpamPoolConfig>>,
    pub options: Option<ListOrDict>,
}

/// IPAM pool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpamPoolConfig {
    pub subnet: Option<String>,
    pub ip_range: Option<String>,
    pub gateway: Option<String>,
    pub aux_addresses: Option<ListOrDict>,
}

/// Volume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Engine-visible name, defaults to `{project}_{reference}`
    pub name: Option<String>,
    pub driver: Option<String>,
    pub driver_opts: Option<ListOrDict>,
    pub external: Option<ExternalConfig>,
    pub labels: Option<ListOrDict>,
}

/// External resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalConfig {
    /// Boolean
    Bool(bool),
    /// Legacy form carrying the engine-visible name
    Named { name: Option<String> },
}

impl ExternalConfig {
    pub fn is_external(&self) -> bool {
        match self {
            ExternalConfig::Bool(b) => *b,
            ExternalConfig::Named { .. } => true,
        }
    }

    /// Name given by the legacy `external: {name: ...}` form
    pub fn name(&self) -> Option<&str> {
        match self {
            ExternalConfig::Named { name } => name.as_deref(),
            ExternalConfig::Bool(_) => None,
        }
    }
}

/// Engine-visible name of a network or volume
pub fn resource_name(project: &str, reference: &str, explicit: Option<&str>) -> String {
    match explicit {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("{}_{}", project, reference),
    }
}

impl NetworkConfig {
    pub fn is_external(&self) -> bool {
        self.external.as_ref().map(|e| e.is_external()).unwrap_or(false)
    }

    pub fn resolved_name(&self, project: &str, reference: &str) -> String {
        let explicit = self
            .name
            .as_deref()
            .or_else(|| self.external.as_ref().and_then(|e| e.name()));
        resource_name(project, reference, explicit)
    }
}

impl VolumeConfig {
    pub fn is_external(&self) -> bool {
        self.external.as_ref().map(|e| e.is_external()).unwrap_or(false)
    }

    pub fn resolved_name(&self, project: &str, reference: &str) -> String {
        let explicit = self
            .name
            .as_deref()
            .or_else(|| self.external.as_ref().and_then(|e| e.name()));
        resource_name(project, reference, explicit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lenient_shapes() {
        let value = json!({
            "services": {
                "web": {
                    "image": "nginx",
                    "command": "nginx -g 'daemon off;'",
                    "environment": {"A": 1, "B": null, "C": true},
                    "ports": [80, "8080:80", {"target": 443, "published": "8443"}],
                    "networks": {"front": null},
                    "build": "."
                }
            },
            "networks": {"front": null},
            "volumes": {"data": {"external": {"name": "shared"}}}
        });
        let def = ProjectDef::from_value(&value).unwrap();
        let web = &def.services["web"];
        assert!(matches!(web.command, Some(CommandConfig::Shell(_))));
        assert_eq!(web.ports.as_ref().unwrap().len(), 3);
        assert!(matches!(web.ports.as_ref().unwrap()[0], PortConfig::Number(80)));
        assert_eq!(web.unsupported_fields(), vec!["build"]);
        assert!(def.networks.contains_key("front"));
        assert!(def.volumes["data"].is_external());
        assert_eq!(def.volumes["data"].resolved_name("shop", "data"), "shared");
    }

    #[test]
    fn test_scalar_coercion() {
        assert_eq!(Scalar::Str("1.5".to_string()).as_f64().unwrap(), 1.5);
        assert_eq!(Scalar::Float(2.9).as_i64().unwrap(), 2);
        assert!(Scalar::Str("x".to_string()).as_i64().is_err());
        assert_eq!(Scalar::Float(0.5).to_string(), "0.5");
    }

    #[test]
    fn test_deploy_keeps_unknown_keys() {
        let deploy: DeployConfig =
            serde_json::from_value(json!({"replicas": 2, "mode": "replicated"})).unwrap();
        assert_eq!(deploy.replicas, Some(Scalar::Int(2)));
        assert!(deploy.other.contains_key("mode"));
    }

    #[test]
    fn test_default_resource_name() {
        let net = NetworkConfig::default();
        assert_eq!(net.resolved_name("shop", "default"), "shop_default");
        assert!(!net.is_external());
    }
}
