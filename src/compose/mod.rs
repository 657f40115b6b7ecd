//! Compose-style project definitions
//!
//! Parsing and translating definitions into Engine payloads, and applying
//! them to an engine.

pub mod config;
pub mod hash;
pub mod labels;
pub mod manager;
pub mod normalize;
pub mod orchestrator;
pub mod project;
pub mod translate;
pub mod units;

pub use config::{NetworkConfig, ProjectDef, ServiceConfig, VolumeConfig};
pub use hash::config_hash;
pub use manager::{ManagerHandle, ProjectAction, ProjectManager};
pub use normalize::{interpolate, normalize_dict, traverse_interpolate, Environment, ProcessEnv};
pub use orchestrator::{ContainerStatus, Orchestrator, ProjectReport};
pub use project::{DefinitionStore, ProjectDefinition, ProjectStore};
pub use translate::{
    translate_network, translate_project, translate_service, translate_volume, ProjectPlan,
    TranslatedNetwork, TranslatedService, TranslatedVolume,
};
