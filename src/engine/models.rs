//! Helpers over the `bollard` Engine models
//!
//! bollard types most fields as `Option`; the extension traits here give the
//! orchestrator the handful of derived values it reads off them.

use crate::error::{BerthError, Result};
use bollard::models::{ContainerInspectResponse, ContainerSummary, PortBinding};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

pub use bollard::models::PortMap;

/// `ExposedPorts` set: `"80/tcp" -> {}`
pub type ExposedPorts = HashMap<String, HashMap<(), ()>>;

/// One host binding of a container port
pub fn port_binding(host_ip: impl Into<String>, host_port: impl Into<String>) -> PortBinding {
    PortBinding {
        host_ip: Some(host_ip.into()),
        host_port: Some(host_port.into()),
    }
}

/// Decode an Engine API JSON fragment into its bollard model or enum
///
/// Engine enums such as mount types and restart policies are spelled the way
/// definitions spell them, so a definition value decodes directly.
pub fn from_engine_json<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    let shown = value.to_string();
    serde_json::from_value(value)
        .map_err(|e| BerthError::parse(format!("Invalid engine value {}: {}", shown, e)))
}

/// Engine spelling of a string-valued model field or enum (`"running"`)
pub fn engine_name<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .filter(|s| !s.is_empty())
}

fn is_active_state(state: Option<&str>) -> bool {
    matches!(state, Some("running" | "restarting"))
}

/// Accessors for items of `GET /containers/json`
pub trait SummaryExt {
    /// First name without the leading slash, else the id
    fn display_name(&self) -> &str;
    /// Running or restarting containers must be stopped before removal
    fn is_active(&self) -> bool;
    fn label(&self, key: &str) -> Option<&str>;
    fn id_str(&self) -> &str;
}

impl SummaryExt for ContainerSummary {
    fn display_name(&self) -> &str {
        self.names
            .as_ref()
            .and_then(|names| names.first())
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or_else(|| self.id_str())
    }

    fn is_active(&self) -> bool {
        is_active_state(engine_name(&self.state).as_deref())
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels.as_ref()?.get(key).map(String::as_str)
    }

    fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }
}

/// Accessors for `GET /containers/{id}/json`
pub trait InspectExt {
    fn label(&self, key: &str) -> Option<&str>;
    fn is_active(&self) -> bool;
    fn health_status(&self) -> Option<String>;
    /// Network aliases keyed by network name
    fn network_aliases(&self) -> BTreeMap<String, Vec<String>>;
    fn id_str(&self) -> &str;
}

impl InspectExt for ContainerInspectResponse {
    fn label(&self, key: &str) -> Option<&str> {
        self.config
            .as_ref()?
            .labels
            .as_ref()?
            .get(key)
            .map(String::as_str)
    }

    fn is_active(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.running == Some(true) || s.restarting == Some(true))
    }

    fn health_status(&self) -> Option<String> {
        let health = self.state.as_ref()?.health.as_ref()?;
        engine_name(&health.status)
    }

    fn network_aliases(&self) -> BTreeMap<String, Vec<String>> {
        self.network_settings
            .as_ref()
            .and_then(|settings| settings.networks.as_ref())
            .map(|networks| {
                networks
                    .iter()
                    .map(|(name, endpoint)| {
                        (name.clone(), endpoint.aliases.clone().unwrap_or_default())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }
}
