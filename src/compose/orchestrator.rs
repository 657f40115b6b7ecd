//! Project reconciliation
//!
//! `project_up` brings the engine in line with a definition: images are
//! pulled, networks and volumes created, and each replica container created,
//! replaced or left alone depending on its config hash label. `project_down`
//! removes a project's containers and networks and keeps its volumes.
//!
//! Changes are applied in place as they go; a failure part way through
//! leaves whatever was already applied.

use super::labels;
use super::normalize::Environment;
use super::project::{DefinitionStore, ProjectDefinition};
use super::translate::{translate_project, ProjectPlan, TranslatedNetwork, TranslatedVolume};
use crate::engine::{engine_name, DockerEngine, InspectExt, SummaryExt};
use crate::error::{BerthError, Result};
use crate::image::{PullHandle, PullTicket};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a `project_up` or `project_down` changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectReport {
    pub project: String,
    pub created: Vec<String>,
    pub replaced: Vec<String>,
    pub unchanged: Vec<String>,
    pub removed: Vec<String>,
    pub networks_created: Vec<String>,
    pub networks_removed: Vec<String>,
    pub volumes_created: Vec<String>,
}

/// One container of a project as the engine reports it
#[derive(Debug, Clone, Serialize)]
pub struct ContainerStatus {
    pub name: String,
    pub id: String,
    pub service: Option<String>,
    pub replica: Option<u32>,
    pub image: String,
    pub state: String,
    pub status: String,
    pub health: Option<String>,
    /// Network aliases, keyed by network name
    pub aliases: BTreeMap<String, Vec<String>>,
    pub config_hash: Option<String>,
}

/// Applies project definitions to a Docker engine
pub struct Orchestrator<E: DockerEngine, S: DefinitionStore> {
    engine: Arc<E>,
    store: Arc<S>,
    pulls: PullHandle,
    env: Arc<dyn Environment>,
}

impl<E: DockerEngine, S: DefinitionStore> Orchestrator<E, S> {
    pub fn new(engine: Arc<E>, store: Arc<S>, pulls: PullHandle, env: Arc<dyn Environment>) -> Self {
        Self {
            engine,
            store,
            pulls,
            env,
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    fn load(&self, name: &str) -> Result<ProjectDefinition> {
        let project = self
            .store
            .get(name)
            .ok_or_else(|| BerthError::NotFound(format!("project {}", name)))?;
        project.ensure_valid()?;
        Ok(project)
    }

    /// Load and translate a project without touching the engine
    pub fn plan(&self, name: &str) -> Result<ProjectPlan> {
        let project = self.load(name)?;
        translate_project(&project.name, &project.def, self.env.as_ref())
    }

    /// Bring a project up
    pub async fn project_up(&self, name: &str) -> Result<ProjectReport> {
        let plan = self.plan(name)?;
        info!(
            "Project {} up: {} service(s), {} network(s), {} volume(s)",
            name,
            plan.services.len(),
            plan.networks.len(),
            plan.volumes.len()
        );
        let mut report = ProjectReport {
            project: name.to_string(),
            ..Default::default()
        };

        self.pull_images(&plan).await?;

        for network in plan.networks.values() {
            if self.ensure_network(name, network).await? {
                report.networks_created.push(network.name.clone());
            }
        }
        for volume in plan.volumes.values() {
            if self.ensure_volume(name, volume).await? {
                report.volumes_created.push(volume.name.clone());
            }
        }

        for service in &plan.services {
            let image_id = self
                .engine
                .inspect_image(&service.image)
                .await?
                .and_then(|image| image.id)
                .ok_or_else(|| BerthError::NotFound(format!("image {}", service.image)))?;

            for index in 1..=service.replicas {
                let container_name = labels::container_name(name, &service.name, index);
                let mut params = service.params.clone();
                let container_labels = params.labels.get_or_insert_with(HashMap::new);
                container_labels.insert(labels::SERVICE.to_string(), service.name.clone());
                container_labels.insert(labels::PROJECT.to_string(), name.to_string());
                container_labels.insert(labels::VERSION.to_string(), labels::version().to_string());
                container_labels.insert(labels::IMAGE.to_string(), image_id.clone());
                container_labels.insert(labels::CONTAINER_NUMBER.to_string(), index.to_string());
                if let Some(networking) = params.networking_config.as_mut() {
                    for endpoint in networking.endpoints_config.values_mut() {
                        let aliases = endpoint.aliases.get_or_insert_with(Vec::new);
                        aliases.push(service.name.clone());
                        aliases.push(container_name.clone());
                    }
                }

                let replacing = match self.engine.inspect_container(&container_name).await? {
                    Some(existing) => {
                        let current_hash = existing.label(labels::CONFIG_HASH);
                        if current_hash == Some(service.config_hash.as_str()) {
                            debug!("Container {} is up to date", container_name);
                            report.unchanged.push(container_name);
                            continue;
                        }
                        info!("Container {} is outdated, replacing", container_name);
                        if existing.is_active() {
                            self.engine.stop_container(existing.id_str()).await?;
                        }
                        self.engine.delete_container(existing.id_str(), false).await?;
                        true
                    }
                    None => false,
                };

                let created = self
                    .engine
                    .create_container(&container_name, service.platform.as_deref(), &params)
                    .await?;
                for warning in &created.warnings {
                    warn!("Container {}: {}", container_name, warning);
                }
                self.engine.start_container(&created.id).await?;
                info!("Started container {}", container_name);
                if replacing {
                    report.replaced.push(container_name);
                } else {
                    report.created.push(container_name);
                }
            }

            report
                .removed
                .extend(self.scale_down(name, &service.name, service.replicas).await?);
        }

        info!(
            "Project {} is up: {} created, {} replaced, {} unchanged, {} removed",
            name,
            report.created.len(),
            report.replaced.len(),
            report.unchanged.len(),
            report.removed.len()
        );
        Ok(report)
    }

    /// Enqueue every image at once, then wait for all of them
    async fn pull_images(&self, plan: &ProjectPlan) -> Result<()> {
        let mut tickets: Vec<PullTicket> = Vec::new();
        for image in plan.images() {
            tickets.push(self.pulls.enqueue(&image).await?);
        }
        let mut first_error = None;
        for ticket in tickets {
            let image = ticket.image_tag.clone();
            match ticket.wait().await {
                Ok(task) => debug!(
                    "Image {} ready (local: {:?})",
                    task.image_tag, task.local_exists
                ),
                Err(e) => {
                    warn!("Pull of {} failed: {}", image, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Create a network unless it exists; returns whether it was created
    async fn ensure_network(&self, project: &str, network: &TranslatedNetwork) -> Result<bool> {
        if self.engine.inspect_network(&network.name).await?.is_some() {
            debug!("Network {} exists", network.name);
            return Ok(false);
        }
        if network.external {
            return Err(BerthError::ExternalResourceMissing {
                kind: "network",
                name: network.name.clone(),
            });
        }
        let mut params = network.params.clone();
        params
            .labels
            .insert(labels::NETWORK.to_string(), network.reference.clone());
        params
            .labels
            .insert(labels::PROJECT.to_string(), project.to_string());
        params
            .labels
            .insert(labels::VERSION.to_string(), labels::version().to_string());
        self.engine.create_network(&params).await?;
        info!("Created network {}", network.name);
        Ok(true)
    }

    /// Create a volume unless it exists; returns whether it was created
    async fn ensure_volume(&self, project: &str, volume: &TranslatedVolume) -> Result<bool> {
        if self.engine.inspect_volume(&volume.name).await?.is_some() {
            debug!("Volume {} exists", volume.name);
            return Ok(false);
        }
        if volume.external {
            return Err(BerthError::ExternalResourceMissing {
                kind: "volume",
                name: volume.name.clone(),
            });
        }
        let mut params = volume.params.clone();
        params
            .labels
            .insert(labels::VOLUME.to_string(), volume.reference.clone());
        params
            .labels
            .insert(labels::PROJECT.to_string(), project.to_string());
        params
            .labels
            .insert(labels::VERSION.to_string(), labels::version().to_string());
        self.engine.create_volume(&params).await?;
        info!("Created volume {}", volume.name);
        Ok(true)
    }

    /// Remove replicas numbered above `replicas`
    async fn scale_down(&self, project: &str, service: &str, replicas: u32) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        let filter = labels::service_filter(project, service);
        for container in self.engine.list_containers(true, &filter).await? {
            let number = container
                .label(labels::CONTAINER_NUMBER)
                .and_then(|n| n.parse::<u32>().ok());
            if !matches!(number, Some(n) if n > replicas) {
                continue;
            }
            info!("Removing surplus container {}", container.display_name());
            if container.is_active() {
                self.engine.stop_container(container.id_str()).await?;
            }
            self.engine.delete_container(container.id_str(), false).await?;
            removed.push(container.display_name().to_string());
        }
        Ok(removed)
    }

    /// Take a project down, keeping its volumes
    pub async fn project_down(&self, name: &str) -> Result<ProjectReport> {
        let plan = self.plan(name)?;
        info!("Project {} down", name);
        let mut report = ProjectReport {
            project: name.to_string(),
            ..Default::default()
        };

        // found by label so renamed and orphaned containers go too
        let containers = self
            .engine
            .list_containers(true, &labels::project_filter(name))
            .await?;
        for container in containers {
            if container.is_active() {
                self.engine.stop_container(container.id_str()).await?;
            }
            self.engine.delete_container(container.id_str(), false).await?;
            info!("Removed container {}", container.display_name());
            report.removed.push(container.display_name().to_string());
        }

        for network in plan.networks.values().filter(|n| !n.external) {
            if self.engine.inspect_network(&network.name).await?.is_some() {
                self.engine.remove_network(&network.name).await?;
                info!("Removed network {}", network.name);
                report.networks_removed.push(network.name.clone());
            }
        }
        Ok(report)
    }

    /// Containers of a project, ordered by service and replica
    pub async fn project_status(&self, name: &str) -> Result<Vec<ContainerStatus>> {
        let containers = self
            .engine
            .list_containers(true, &labels::project_filter(name))
            .await?;
        let mut statuses = Vec::with_capacity(containers.len());
        for container in containers {
            let detail = self.engine.inspect_container(container.id_str()).await?;
            let (health, aliases) = match &detail {
                Some(detail) => (detail.health_status(), detail.network_aliases()),
                None => (None, BTreeMap::new()),
            };
            statuses.push(ContainerStatus {
                name: container.display_name().to_string(),
                id: container.id_str().to_string(),
                service: container.label(labels::SERVICE).map(String::from),
                replica: container
                    .label(labels::CONTAINER_NUMBER)
                    .and_then(|n| n.parse().ok()),
                image: container.image.clone().unwrap_or_default(),
                state: engine_name(&container.state).unwrap_or_default(),
                status: container.status.clone().unwrap_or_default(),
                health,
                aliases,
                config_hash: container.label(labels::CONFIG_HASH).map(String::from),
            });
        }
        statuses.sort_by(|a, b| (&a.service, a.replica).cmp(&(&b.service, b.replica)));
        Ok(statuses)
    }
}
