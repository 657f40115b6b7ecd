//! Labels written onto managed resources
//!
//! Keys are shared with other tools managing the same engine and must not
//! change.

use crate::engine::LabelFilter;

pub const PREFIX: &str = "com.docker-console.";

pub const PROJECT: &str = "com.docker-console.project";
pub const SERVICE: &str = "com.docker-console.service";
pub const NETWORK: &str = "com.docker-console.network";
pub const VOLUME: &str = "com.docker-console.volume";
pub const CONTAINER_NUMBER: &str = "com.docker-console.container-number";
pub const CONFIG_HASH: &str = "com.docker-console.config-hash";
pub const DEPENDS_ON: &str = "com.docker-console.depends_on";
pub const IMAGE: &str = "com.docker-console.image";
pub const VERSION: &str = "com.docker-console.version";

/// Value of the version label
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// `{project}-{service}-{index}`
pub fn container_name(project: &str, service: &str, index: u32) -> String {
    format!("{}-{}-{}", project, service, index)
}

/// Everything belonging to a project
pub fn project_filter(project: &str) -> LabelFilter {
    LabelFilter::new().eq(PROJECT, project)
}

/// Containers of one service of a project
pub fn service_filter(project: &str, service: &str) -> LabelFilter {
    project_filter(project).eq(SERVICE, service)
}
