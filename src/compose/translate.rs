//! Definition to Engine payload translation
//!
//! Each service, network and volume definition is interpolated against an
//! [`Environment`] and mapped field by field onto the Engine create payloads.
//! Services additionally get a [`config_hash`] over their interpolated
//! definition, stored as a label and later compared against running
//! containers to detect drift.

use super::config::{
    CommandConfig, DeployConfig, DeviceConfig, HealthcheckConfig, ListOrDict, NetworkConfig,
    Scalar, ServiceConfig, ThrottleDeviceConfig, UlimitConfig, VolumeConfig, VolumeMount,
};
use super::hash::config_hash;
use super::labels;
use super::normalize::{normalize_dict, Environment, Interpolator};
use super::units::{parse_bytes, parse_command, parse_duration, parse_expose, parse_ports};
use crate::engine::from_engine_json;
use crate::error::{BerthError, Result};
use bollard::container::{Config, NetworkingConfig};
use bollard::models::{
    DeviceMapping, EndpointSettings, HealthConfig, HostConfig, Ipam, IpamConfig, Mount,
    MountTmpfsOptions, MountTypeEnum, MountVolumeOptions, ResourcesUlimits, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::network::CreateNetworkOptions;
use bollard::volume::CreateVolumeOptions;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Health check durations below this many nanoseconds are rounded up
const MIN_HEALTHCHECK_NANOS: i64 = 1_000_000;

/// A service ready to be created
#[derive(Debug, Clone, Serialize)]
pub struct TranslatedService {
    /// Service name within the project
    pub name: String,
    pub image: String,
    pub platform: Option<String>,
    pub replicas: u32,
    pub params: Config<String>,
    pub config_hash: String,
    /// Volume references used by the service, keyed by reference name
    pub referenced_volumes: BTreeMap<String, VolumeConfig>,
    /// Network references used by the service, keyed by reference name
    pub referenced_networks: BTreeMap<String, NetworkConfig>,
    pub diagnostics: Vec<String>,
}

/// A network ready to be created
#[derive(Debug, Clone, Serialize)]
pub struct TranslatedNetwork {
    pub reference: String,
    /// Engine-visible name
    pub name: String,
    pub external: bool,
    pub params: CreateNetworkOptions<String>,
    /// Interpolated definition
    pub config: NetworkConfig,
    pub diagnostics: Vec<String>,
}

/// A volume ready to be created
#[derive(Debug, Clone, Serialize)]
pub struct TranslatedVolume {
    pub reference: String,
    /// Engine-visible name
    pub name: String,
    pub external: bool,
    pub params: CreateVolumeOptions<String>,
    /// Interpolated definition
    pub config: VolumeConfig,
    pub diagnostics: Vec<String>,
}

fn note(diagnostics: &mut Vec<String>, message: String) {
    warn!("{}", message);
    diagnostics.push(message);
}

fn dict(map: BTreeMap<String, String>) -> HashMap<String, String> {
    map.into_iter().collect()
}

fn interpolate_definition(
    value: &Value,
    env: &dyn Environment,
) -> Result<(Value, Vec<String>)> {
    if value.is_null() {
        return Ok((Value::Object(Map::new()), Vec::new()));
    }
    let mut interpolator = Interpolator::new(env);
    let value = interpolator.traverse(value)?;
    Ok((value, interpolator.into_diagnostics()))
}

/// Translate a network definition
pub fn translate_network(
    reference: &str,
    project: &str,
    network: &Value,
    env: &dyn Environment,
) -> Result<TranslatedNetwork> {
    let (value, diagnostics) = interpolate_definition(network, env)?;
    debug!("network {}: {}", reference, value);
    let config: NetworkConfig = serde_json::from_value(value)
        .map_err(|e| BerthError::parse(format!("network {}: {}", reference, e)))?;
    let name = config.resolved_name(project, reference);

    let mut params = CreateNetworkOptions {
        name: name.clone(),
        driver: config.driver.clone().unwrap_or_default(),
        internal: config.internal.unwrap_or(false),
        attachable: config.attachable.unwrap_or(false),
        enable_ipv6: config.enable_ipv6.unwrap_or(false),
        options: config
            .driver_opts
            .as_ref()
            .map(|o| dict(normalize_dict(o, false)))
            .unwrap_or_default(),
        labels: config
            .labels
            .as_ref()
            .map(|l| dict(normalize_dict(l, false)))
            .unwrap_or_default(),
        ..Default::default()
    };
    if let Some(ipam) = &config.ipam {
        params.ipam = Ipam {
            driver: ipam.driver.clone(),
            options: ipam.options.as_ref().map(|o| dict(normalize_dict(o, false))),
            config: ipam.config.as_ref().map(|pools| {
                pools
                    .iter()
                    .map(|pool| IpamConfig {
                        subnet: pool.subnet.clone(),
                        gateway: pool.gateway.clone(),
                        ip_range: pool.ip_range.clone(),
                        auxiliary_addresses: pool
                            .aux_addresses
                            .as_ref()
                            .map(|a| dict(normalize_dict(a, false))),
                    })
                    .collect()
            }),
        };
    }

    Ok(TranslatedNetwork {
        reference: reference.to_string(),
        name,
        external: config.is_external(),
        params,
        config,
        diagnostics,
    })
}

/// Translate a volume definition
pub fn translate_volume(
    reference: &str,
    project: &str,
    volume: &Value,
    env: &dyn Environment,
) -> Result<TranslatedVolume> {
    let (value, diagnostics) = interpolate_definition(volume, env)?;
    debug!("volume {}: {}", reference, value);
    let config: VolumeConfig = serde_json::from_value(value)
        .map_err(|e| BerthError::parse(format!("volume {}: {}", reference, e)))?;
    let name = config.resolved_name(project, reference);
    let params = CreateVolumeOptions {
        name: name.clone(),
        driver: config.driver.clone().unwrap_or_default(),
        driver_opts: config
            .driver_opts
            .as_ref()
            .map(|o| dict(normalize_dict(o, false)))
            .unwrap_or_default(),
        labels: config
            .labels
            .as_ref()
            .map(|l| dict(normalize_dict(l, false)))
            .unwrap_or_default(),
        ..Default::default()
    };
    Ok(TranslatedVolume {
        reference: reference.to_string(),
        name,
        external: config.is_external(),
        params,
        config,
        diagnostics,
    })
}

/// Translate a service definition
///
/// `volumes` and `networks` are the project's (interpolated) volume and
/// network definitions; every reference the service makes must resolve
/// against them.
pub fn translate_service(
    name: &str,
    project: &str,
    service: &Value,
    volumes: &BTreeMap<String, VolumeConfig>,
    networks: &BTreeMap<String, NetworkConfig>,
    env: &dyn Environment,
) -> Result<TranslatedService> {
    let (value, diagnostics) = interpolate_definition(service, env)?;
    debug!("service {}: {}", name, value);
    let hash = config_hash(&value);
    let config: ServiceConfig = serde_json::from_value(value)
        .map_err(|e| BerthError::parse(format!("service {}: {}", name, e)))?;

    let mut translator = ServiceTranslator {
        name,
        project,
        volumes,
        networks,
        diagnostics,
        referenced_volumes: BTreeMap::new(),
        referenced_networks: BTreeMap::new(),
    };
    let params = translator.params(&config, &hash)?;
    let replicas = replicas(config.deploy.as_ref())?;

    Ok(TranslatedService {
        name: name.to_string(),
        image: params.image.clone().unwrap_or_default(),
        platform: config.platform.clone(),
        replicas,
        params,
        config_hash: hash,
        referenced_volumes: translator.referenced_volumes,
        referenced_networks: translator.referenced_networks,
        diagnostics: translator.diagnostics,
    })
}

fn replicas(deploy: Option<&DeployConfig>) -> Result<u32> {
    match deploy.and_then(|d| d.replicas.as_ref()) {
        None => Ok(1),
        Some(value) => {
            let n = value.as_i64()?;
            u32::try_from(n).map_err(|_| BerthError::parse(format!("Invalid replicas: {}", value)))
        }
    }
}

/// A duration in microseconds as a signed Engine value
fn duration_micros(value: &Scalar) -> Result<i64> {
    i64::try_from(parse_duration(value)?)
        .map_err(|_| BerthError::parse(format!("Duration out of range: {}", value)))
}

/// Health check durations are nanoseconds on the Engine side
fn duration_nanos(value: &Scalar) -> Result<i64> {
    let nanos = duration_micros(value)?
        .checked_mul(1000)
        .ok_or_else(|| BerthError::parse(format!("Duration out of range: {}", value)))?;
    Ok(if nanos > 0 && nanos < MIN_HEALTHCHECK_NANOS {
        MIN_HEALTHCHECK_NANOS
    } else {
        nanos
    })
}

fn nano_cpus(value: &Scalar) -> Result<i64> {
    value.as_f64().map(|cpus| (cpus * 1e9).round() as i64)
}

fn healthcheck(hc: &HealthcheckConfig) -> Result<HealthConfig> {
    if hc.disable == Some(true) {
        return Ok(HealthConfig {
            test: Some(vec!["NONE".to_string()]),
            ..Default::default()
        });
    }
    Ok(HealthConfig {
        test: hc.test.as_ref().map(|test| match test {
            CommandConfig::Exec(args) => args.clone(),
            CommandConfig::Shell(line) => vec!["CMD-SHELL".to_string(), line.clone()],
        }),
        interval: hc.interval.as_ref().map(duration_nanos).transpose()?,
        timeout: hc.timeout.as_ref().map(duration_nanos).transpose()?,
        retries: hc.retries.as_ref().map(|r| r.as_i64()).transpose()?,
        start_period: hc.start_period.as_ref().map(duration_nanos).transpose()?,
        start_interval: hc.start_interval.as_ref().map(duration_nanos).transpose()?,
    })
}

fn restart_policy(restart: &str) -> Result<RestartPolicy> {
    Ok(match restart.strip_prefix("on-failure") {
        Some(rest) => RestartPolicy {
            name: Some(RestartPolicyNameEnum::ON_FAILURE),
            maximum_retry_count: Some(
                rest.strip_prefix(':')
                    .and_then(|n| n.trim().parse().ok())
                    .unwrap_or(0),
            ),
        },
        None => RestartPolicy {
            name: Some(from_engine_json(json!(restart))?),
            maximum_retry_count: None,
        },
    })
}

fn device_mapping(device: &DeviceConfig) -> DeviceMapping {
    let (host, container, permissions) = match device {
        DeviceConfig::Short(expr) => {
            let mut fields = expr.split(':');
            let host = fields.next().unwrap_or_default().to_string();
            let container = fields
                .next()
                .filter(|s| !s.is_empty())
                .map(String::from)
                .unwrap_or_else(|| host.clone());
            let permissions = fields.next().filter(|s| !s.is_empty()).map(String::from);
            (host, container, permissions)
        }
        DeviceConfig::Long {
            source,
            target,
            permissions,
        } => (
            source.clone(),
            target.clone().unwrap_or_else(|| source.clone()),
            permissions.clone(),
        ),
    };
    DeviceMapping {
        path_on_host: Some(host),
        path_in_container: Some(container),
        cgroup_permissions: Some(permissions.unwrap_or_else(|| "rwm".to_string())),
    }
}

fn ulimit(name: &str, limit: &UlimitConfig) -> Result<ResourcesUlimits> {
    let (soft, hard) = match limit {
        UlimitConfig::Single(value) => {
            let n = value.as_i64()?;
            (n, n)
        }
        UlimitConfig::SoftHard { soft, hard } => (soft.as_i64()?, hard.as_i64()?),
    };
    Ok(ResourcesUlimits {
        name: Some(name.to_string()),
        soft: Some(soft),
        hard: Some(hard),
    })
}

fn throttle(devices: &[ThrottleDeviceConfig]) -> Result<Value> {
    let devices = devices
        .iter()
        .map(|d| Ok(json!({"Path": d.path, "Rate": parse_bytes(&d.rate)?})))
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::Array(devices))
}

/// Modes in which the container does not join project networks
fn skips_default_network(mode: Option<&str>) -> bool {
    match mode {
        Some(mode) => {
            mode == "host"
                || mode == "none"
                || mode.starts_with("container:")
                || mode.starts_with("service:")
        }
        None => false,
    }
}

struct ServiceTranslator<'a> {
    name: &'a str,
    project: &'a str,
    volumes: &'a BTreeMap<String, VolumeConfig>,
    networks: &'a BTreeMap<String, NetworkConfig>,
    diagnostics: Vec<String>,
    referenced_volumes: BTreeMap<String, VolumeConfig>,
    referenced_networks: BTreeMap<String, NetworkConfig>,
}

impl<'a> ServiceTranslator<'a> {
    fn unresolved(&self, kind: &'static str, reference: &str) -> BerthError {
        BerthError::UnresolvedReference {
            service: self.name.to_string(),
            kind,
            reference: reference.to_string(),
        }
    }

    fn params(&mut self, svc: &ServiceConfig, hash: &str) -> Result<Config<String>> {
        for field in svc.unsupported_fields() {
            note(
                &mut self.diagnostics,
                format!("Not implemented: {} (service {})", field, self.name),
            );
        }
        if svc.container_name.is_some() {
            note(
                &mut self.diagnostics,
                format!("Not implemented: container_name (service {})", self.name),
            );
        }

        let image = svc
            .image
            .clone()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| BerthError::InvalidDefinition {
                project: self.project.to_string(),
                reasons: vec![format!("service {} has no image", self.name)],
            })?;

        let mut user_labels = svc
            .labels
            .as_ref()
            .map(|l| normalize_dict(l, true))
            .unwrap_or_default();
        user_labels.insert(labels::CONFIG_HASH.to_string(), hash.to_string());
        if let Some(depends_on) = &svc.depends_on {
            let names: Vec<String> = match depends_on {
                Value::Array(items) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                Value::Object(map) => map.keys().cloned().collect(),
                _ => Vec::new(),
            };
            user_labels.insert(labels::DEPENDS_ON.to_string(), names.join(","));
        }

        let mut host = self.host_config(svc)?;
        self.deploy(svc, &mut host)?;
        self.mounts(svc, &mut host)?;
        let endpoints_config = self.endpoints(svc)?;

        Ok(Config {
            image: Some(image),
            cmd: svc.command.as_ref().map(parse_command),
            entrypoint: svc.entrypoint.as_ref().map(parse_command),
            env: svc.environment.as_ref().map(|env| match env {
                ListOrDict::List(items) => items.clone(),
                ListOrDict::Dict(map) => map
                    .iter()
                    .filter_map(|(k, v)| v.as_ref().map(|v| format!("{}={}", k, v)))
                    .collect(),
            }),
            exposed_ports: svc.expose.as_deref().map(parse_expose).transpose()?,
            hostname: svc.hostname.clone(),
            domainname: svc.domainname.clone(),
            user: svc.user.clone(),
            working_dir: svc.working_dir.clone(),
            mac_address: svc.mac_address.clone(),
            open_stdin: svc.stdin_open,
            tty: svc.tty,
            stop_signal: svc.stop_signal.clone(),
            stop_timeout: svc
                .stop_grace_period
                .as_ref()
                .map(|p| duration_micros(p).map(|us| us / 1_000_000))
                .transpose()?,
            healthcheck: svc.healthcheck.as_ref().map(healthcheck).transpose()?,
            labels: Some(dict(user_labels)),
            host_config: Some(host),
            networking_config: Some(NetworkingConfig { endpoints_config }),
            ..Default::default()
        })
    }

    /// Fields with Engine enum or nested device types, in Engine spelling
    fn host_config_base(&self, svc: &ServiceConfig) -> Result<HostConfig> {
        let mut base = Map::new();
        if let Some(annotations) = &svc.annotations {
            base.insert("Annotations".into(), json!(normalize_dict(annotations, false)));
        }
        if let Some(isolation) = &svc.isolation {
            base.insert("Isolation".into(), json!(isolation));
        }
        if let Some(blkio) = &svc.blkio_config {
            if let Some(weight) = &blkio.weight {
                base.insert("BlkioWeight".into(), json!(weight.as_i64()?));
            }
            if let Some(devices) = &blkio.weight_device {
                let devices = devices
                    .iter()
                    .map(|d| Ok(json!({"Path": d.path, "Weight": d.weight.as_i64()?})))
                    .collect::<Result<Vec<_>>>()?;
                base.insert("BlkioWeightDevice".into(), Value::Array(devices));
            }
            let throttles = [
                ("BlkioDeviceReadBps", &blkio.device_read_bps),
                ("BlkioDeviceReadIOps", &blkio.device_read_iops),
                ("BlkioDeviceWriteBps", &blkio.device_write_bps),
                ("BlkioDeviceWriteIOps", &blkio.device_write_iops),
            ];
            for (key, devices) in throttles {
                if let Some(devices) = devices {
                    base.insert(key.into(), throttle(devices)?);
                }
            }
        }
        from_engine_json(Value::Object(base))
    }

    fn host_config(&mut self, svc: &ServiceConfig) -> Result<HostConfig> {
        let mut host = self.host_config_base(svc)?;

        host.cap_add = svc.cap_add.clone();
        host.cap_drop = svc.cap_drop.clone();
        host.cgroup = svc.cgroup.clone();
        host.cgroup_parent = svc.cgroup_parent.clone();
        host.cpu_count = svc.cpu_count.as_ref().map(|v| v.as_i64()).transpose()?;
        host.cpu_percent = svc.cpu_percent.as_ref().map(|v| v.as_i64()).transpose()?;
        host.cpu_shares = svc.cpu_shares.as_ref().map(|v| v.as_i64()).transpose()?;
        host.cpu_quota = svc.cpu_quota.as_ref().map(|v| v.as_i64()).transpose()?;
        host.cpu_period = svc.cpu_period.as_ref().map(|v| v.as_i64()).transpose()?;
        host.cpu_realtime_period = svc.cpu_rt_period.as_ref().map(duration_micros).transpose()?;
        host.cpu_realtime_runtime = svc.cpu_rt_runtime.as_ref().map(duration_micros).transpose()?;
        host.nano_cpus = svc.cpus.as_ref().map(nano_cpus).transpose()?;
        host.cpuset_cpus = svc.cpuset.clone();
        host.devices = svc
            .devices
            .as_ref()
            .map(|devices| devices.iter().map(device_mapping).collect());
        host.device_cgroup_rules = svc.device_cgroup_rules.clone();
        host.dns = svc.dns.as_ref().map(|d| d.to_vec());
        host.dns_options = svc.dns_opt.clone();
        host.dns_search = svc.dns_search.as_ref().map(|d| d.to_vec());
        host.extra_hosts = svc.extra_hosts.as_ref().map(|hosts| match hosts {
            ListOrDict::List(items) => items.clone(),
            ListOrDict::Dict(map) => map
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}:{}",
                        k,
                        v.as_ref().map(|v| v.to_string()).unwrap_or_default()
                    )
                })
                .collect(),
        });
        host.group_add = svc
            .group_add
            .as_ref()
            .map(|groups| groups.iter().map(|g| g.to_string()).collect());
        host.init = svc.init;
        host.memory = svc.mem_limit.as_ref().map(parse_bytes).transpose()?;
        host.memory_reservation = svc.mem_reservation.as_ref().map(parse_bytes).transpose()?;
        host.memory_swappiness = svc
            .mem_swappiness
            .as_ref()
            .map(|v| v.as_i64())
            .transpose()?;
        host.memory_swap = svc.memswap_limit.as_ref().map(parse_bytes).transpose()?;
        host.network_mode = svc.network_mode.clone();
        host.oom_kill_disable = svc.oom_kill_disable;
        host.oom_score_adj = svc.oom_score_adj.as_ref().map(|v| v.as_i64()).transpose()?;
        host.pid_mode = svc.pid.clone();
        host.pids_limit = svc.pids_limit.as_ref().map(|v| v.as_i64()).transpose()?;
        host.port_bindings = svc.ports.as_deref().map(parse_ports).transpose()?;
        host.privileged = svc.privileged;
        host.readonly_rootfs = svc.read_only;
        host.restart_policy = svc.restart.as_deref().map(restart_policy).transpose()?;
        host.runtime = svc.runtime.clone();
        host.security_opt = svc.security_opt.clone();
        host.shm_size = svc.shm_size.as_ref().map(parse_bytes).transpose()?;
        host.sysctls = svc.sysctls.as_ref().map(|s| dict(normalize_dict(s, true)));
        host.storage_opt = svc.storage_opt.as_ref().map(|opts| {
            opts.iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect()
        });
        host.tmpfs = svc.tmpfs.as_ref().map(|tmpfs| {
            tmpfs
                .to_vec()
                .iter()
                .map(|expr| match expr.split_once(':') {
                    Some((path, options)) => (path.to_string(), options.to_string()),
                    None => (expr.clone(), String::new()),
                })
                .collect()
        });
        host.ulimits = svc
            .ulimits
            .as_ref()
            .map(|limits| {
                limits
                    .iter()
                    .map(|(name, limit)| ulimit(name, limit))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        host.userns_mode = svc.userns_mode.clone();
        host.uts_mode = svc.uts.clone();
        host.volumes_from = svc.volumes_from.clone();
        Ok(host)
    }

    /// `deploy` values apply only where the top-level field is absent
    fn deploy(&mut self, svc: &ServiceConfig, host: &mut HostConfig) -> Result<()> {
        let Some(deploy) = &svc.deploy else {
            return Ok(());
        };

        if let Some(resources) = &deploy.resources {
            if let Some(limits) = &resources.limits {
                if host.nano_cpus.is_none() {
                    host.nano_cpus = limits.cpus.as_ref().map(nano_cpus).transpose()?;
                }
                if host.memory.is_none() {
                    host.memory = limits.memory.as_ref().map(parse_bytes).transpose()?;
                }
                if host.pids_limit.is_none() {
                    host.pids_limit = limits.pids.as_ref().map(|v| v.as_i64()).transpose()?;
                }
                for key in limits.other.keys() {
                    note(
                        &mut self.diagnostics,
                        format!("Not implemented: deploy.resources.limits.{} (service {})", key, self.name),
                    );
                }
            }
            if let Some(reservations) = &resources.reservations {
                if host.memory_reservation.is_none() {
                    host.memory_reservation =
                        reservations.memory.as_ref().map(parse_bytes).transpose()?;
                }
                let mut ignored: Vec<&str> = reservations.other.keys().map(String::as_str).collect();
                if reservations.cpus.is_some() {
                    ignored.push("cpus");
                }
                if reservations.pids.is_some() {
                    ignored.push("pids");
                }
                for key in ignored {
                    note(
                        &mut self.diagnostics,
                        format!(
                            "Not implemented: deploy.resources.reservations.{} (service {})",
                            key, self.name
                        ),
                    );
                }
            }
        }

        if let Some(policy) = &deploy.restart_policy {
            if host.restart_policy.is_none() {
                host.restart_policy = Some(match policy.condition.as_deref() {
                    Some("none") => RestartPolicy {
                        name: Some(RestartPolicyNameEnum::NO),
                        maximum_retry_count: None,
                    },
                    Some("on-failure") => RestartPolicy {
                        name: Some(RestartPolicyNameEnum::ON_FAILURE),
                        maximum_retry_count: Some(
                            policy
                                .max_attempts
                                .as_ref()
                                .map(|m| m.as_i64())
                                .transpose()?
                                .unwrap_or(0),
                        ),
                    },
                    _ => RestartPolicy {
                        name: Some(RestartPolicyNameEnum::ALWAYS),
                        maximum_retry_count: None,
                    },
                });
            }
            if policy.delay.is_some() || policy.window.is_some() {
                note(
                    &mut self.diagnostics,
                    format!(
                        "Not implemented: deploy.restart_policy delay/window (service {})",
                        self.name
                    ),
                );
            }
        }

        for key in deploy.other.keys() {
            note(
                &mut self.diagnostics,
                format!("Not implemented: deploy.{} (service {})", key, self.name),
            );
        }
        Ok(())
    }

    fn resolve_volume(&mut self, reference: &str) -> Result<String> {
        let volumes = self.volumes;
        let volume = volumes
            .get(reference)
            .ok_or_else(|| self.unresolved("volume", reference))?;
        let name = volume.resolved_name(self.project, reference);
        self.referenced_volumes
            .insert(reference.to_string(), volume.clone());
        Ok(name)
    }

    fn mounts(&mut self, svc: &ServiceConfig, host: &mut HostConfig) -> Result<()> {
        let Some(volumes) = &svc.volumes else {
            return Ok(());
        };
        let mut mounts = Vec::new();
        for item in volumes {
            match item {
                VolumeMount::Short(expr) => {
                    if expr.starts_with('/') {
                        host.binds.get_or_insert_with(Vec::new).push(expr.clone());
                        continue;
                    }
                    let mut parts = expr.split(':');
                    let source = parts.next().unwrap_or_default();
                    let target = parts.next().filter(|t| !t.is_empty()).ok_or_else(|| {
                        BerthError::parse(format!(
                            "service {}: volume {} has no target",
                            self.name, expr
                        ))
                    })?;
                    let access = parts.next();
                    let name = self.resolve_volume(source)?;
                    mounts.push(Mount {
                        typ: Some(MountTypeEnum::VOLUME),
                        source: Some(name),
                        target: Some(target.to_string()),
                        read_only: Some(access == Some("ro")),
                        ..Default::default()
                    });
                }
                VolumeMount::Long(long) => {
                    let mut mount = Mount {
                        typ: Some(from_engine_json(json!(long.mount_type))?),
                        target: long.target.clone(),
                        read_only: long.read_only.filter(|r| *r),
                        consistency: long.consistency.clone(),
                        ..Default::default()
                    };
                    if long.mount_type == "volume" {
                        let source = long.source.as_deref().ok_or_else(|| {
                            BerthError::parse(format!(
                                "service {}: volume with no source specified",
                                self.name
                            ))
                        })?;
                        mount.source = Some(self.resolve_volume(source)?);
                    } else {
                        mount.source = long.source.clone();
                    }
                    if let Some(bind) = &long.bind {
                        mount.bind_options = Some(from_engine_json(json!({
                            "Propagation": bind.propagation,
                            "CreateMountpoint": bind.create_host_path.filter(|c| *c),
                        }))?);
                        if bind.selinux.is_some() {
                            note(
                                &mut self.diagnostics,
                                format!("Not implemented: volumes.bind.selinux (service {})", self.name),
                            );
                        }
                    }
                    if let Some(volume) = &long.volume {
                        mount.volume_options = Some(MountVolumeOptions {
                            no_copy: volume.nocopy.filter(|n| *n),
                            ..Default::default()
                        });
                    }
                    if let Some(tmpfs) = &long.tmpfs {
                        mount.tmpfs_options = Some(MountTmpfsOptions {
                            size_bytes: tmpfs.size.as_ref().map(parse_bytes).transpose()?,
                            mode: tmpfs.mode,
                            ..Default::default()
                        });
                    }
                    mounts.push(mount);
                }
            }
        }
        if !mounts.is_empty() {
            host.mounts = Some(mounts);
        }
        Ok(())
    }

    fn endpoints(&mut self, svc: &ServiceConfig) -> Result<HashMap<String, EndpointSettings>> {
        let known = self.networks;
        let mut endpoints = HashMap::new();
        if let Some(networks) = &svc.networks {
            for (reference, config) in networks.entries() {
                let network = known
                    .get(&reference)
                    .ok_or_else(|| self.unresolved("network", &reference))?;
                let network_name = network.resolved_name(self.project, &reference);
                self.referenced_networks
                    .insert(reference.clone(), network.clone());

                let mut endpoint = EndpointSettings {
                    aliases: config.aliases.clone(),
                    mac_address: config.mac_address.clone(),
                    driver_opts: config
                        .driver_opts
                        .as_ref()
                        .map(|o| dict(normalize_dict(o, false))),
                    ..Default::default()
                };
                if config.ipv4_address.is_some()
                    || config.ipv6_address.is_some()
                    || config.link_local_ips.is_some()
                {
                    endpoint.ipam_config = Some(from_engine_json(json!({
                        "IPv4Address": config.ipv4_address,
                        "IPv6Address": config.ipv6_address,
                        "LinkLocalIPs": config.link_local_ips,
                    }))?);
                }
                if config.priority.is_some() {
                    note(
                        &mut self.diagnostics,
                        format!("Not implemented: networks.priority (service {})", self.name),
                    );
                }
                endpoints.insert(network_name, endpoint);
            }
        }

        if endpoints.is_empty() && !skips_default_network(svc.network_mode.as_deref()) {
            let network = known.get("default").cloned().unwrap_or_default();
            endpoints.insert(
                network.resolved_name(self.project, "default"),
                EndpointSettings::default(),
            );
            self.referenced_networks.insert("default".to_string(), network);
        }
        if let Some(mode) = svc.network_mode.as_deref() {
            if mode.starts_with("service:") {
                note(
                    &mut self.diagnostics,
                    format!("Not implemented: network_mode {} (service {})", mode, self.name),
                );
            }
        }
        Ok(endpoints)
    }
}

/// Every service of a project with the networks and volumes they use
#[derive(Debug, Clone, Serialize)]
pub struct ProjectPlan {
    pub project: String,
    /// Ordered by service name
    pub services: Vec<TranslatedService>,
    /// Referenced networks, keyed by reference
    pub networks: BTreeMap<String, TranslatedNetwork>,
    /// Referenced volumes, keyed by reference
    pub volumes: BTreeMap<String, TranslatedVolume>,
}

impl ProjectPlan {
    /// Diagnostics of every translated part
    pub fn diagnostics(&self) -> Vec<String> {
        let networks = self.networks.values().flat_map(|n| n.diagnostics.iter());
        let volumes = self.volumes.values().flat_map(|v| v.diagnostics.iter());
        let services = self.services.iter().flat_map(|s| s.diagnostics.iter());
        networks.chain(volumes).chain(services).cloned().collect()
    }

    /// Distinct images, in first-use order
    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = Vec::new();
        for service in &self.services {
            if !images.contains(&service.image) {
                images.push(service.image.clone());
            }
        }
        images
    }
}

fn section<'v>(def: &'v Value, key: &str) -> impl Iterator<Item = (&'v String, &'v Value)> {
    def.get(key)
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|map| map.iter())
}

/// Translate a whole raw project definition
pub fn translate_project(project: &str, def: &Value, env: &dyn Environment) -> Result<ProjectPlan> {
    let mut networks = BTreeMap::new();
    for (reference, value) in section(def, "networks") {
        networks.insert(
            reference.clone(),
            translate_network(reference, project, value, env)?,
        );
    }
    let mut volumes = BTreeMap::new();
    for (reference, value) in section(def, "volumes") {
        volumes.insert(
            reference.clone(),
            translate_volume(reference, project, value, env)?,
        );
    }
    let known_networks: BTreeMap<String, NetworkConfig> = networks
        .iter()
        .map(|(k, n)| (k.clone(), n.config.clone()))
        .collect();
    let known_volumes: BTreeMap<String, VolumeConfig> = volumes
        .iter()
        .map(|(k, v)| (k.clone(), v.config.clone()))
        .collect();

    let mut plan = ProjectPlan {
        project: project.to_string(),
        services: Vec::new(),
        networks: BTreeMap::new(),
        volumes: BTreeMap::new(),
    };
    for (name, value) in section(def, "services") {
        let service =
            translate_service(name, project, value, &known_volumes, &known_networks, env)?;
        for reference in service.referenced_networks.keys() {
            if plan.networks.contains_key(reference) {
                continue;
            }
            let network = match networks.get(reference) {
                Some(network) => network.clone(),
                // the implicit default network
                None => translate_network(reference, project, &Value::Null, env)?,
            };
            plan.networks.insert(reference.clone(), network);
        }
        for reference in service.referenced_volumes.keys() {
            if let Some(volume) = volumes.get(reference) {
                plan.volumes
                    .entry(reference.clone())
                    .or_insert_with(|| volume.clone());
            }
        }
        plan.services.push(service);
    }
    Ok(plan)
}
