//! In-memory Docker engine shared by the integration tests

#![allow(dead_code)]

use berth::compose::{Orchestrator, ProjectDefinition};
use berth::engine::*;
use berth::error::{BerthError, Result};
use bollard::auth::DockerCredentials;
use bollard::container::Config;
use bollard::models::{
    ContainerConfig, ContainerCreateResponse, ContainerInspectResponse, ContainerState,
    ContainerSummary, CreateImageInfo, DistributionInspect, ErrorDetail, EventMessage,
    ImageInspect, Network, NetworkSettings, OciDescriptor, ProgressDetail, Volume,
};
use bollard::network::CreateNetworkOptions;
use bollard::volume::CreateVolumeOptions;
use serde_json::json;
use berth::image::{normalize_tag, PullHandle, PullQueue, RegistryAuth, StaticTokenProvider};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the fake answers one `create_image` call
#[derive(Debug, Clone)]
pub enum PullScript {
    /// Two layers, then the completion banner
    Complete,
    /// One layer line, then nothing until the stream is dropped
    Hang,
    /// An error message in the stream
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub params: Config<String>,
    pub running: bool,
}

#[derive(Default)]
pub struct EngineState {
    pub containers: BTreeMap<String, FakeContainer>,
    pub networks: BTreeMap<String, CreateNetworkOptions<String>>,
    pub volumes: BTreeMap<String, CreateVolumeOptions<String>>,
    pub images: BTreeSet<String>,
    pub missing_remote: BTreeSet<String>,
    pub scripts: HashMap<String, VecDeque<PullScript>>,
    pub calls: Vec<String>,
    next_id: usize,
}

#[derive(Default)]
pub struct FakeEngine {
    pub state: Mutex<EngineState>,
    active_pulls: Arc<AtomicUsize>,
    max_active_pulls: Arc<AtomicUsize>,
    pull_delay: Option<Duration>,
}

fn not_found(kind: &str, name: &str) -> BerthError {
    BerthError::EngineRequest {
        method: "GET".to_string(),
        path: format!("/{}/{}", kind, name),
        status: 404,
        message: format!("No such {}: {}", kind, name),
    }
}

fn conflict(path: String, message: String) -> BerthError {
    BerthError::EngineRequest {
        method: "POST".to_string(),
        path,
        status: 409,
        message,
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pulls take `delay` before finishing, to overlap queued requests
    pub fn with_pull_delay(delay: Duration) -> Self {
        Self {
            pull_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn add_image(&self, image: &str) {
        self.state.lock().unwrap().images.insert(normalize_tag(image));
    }

    pub fn add_network(&self, name: &str) {
        self.state.lock().unwrap().networks.insert(
            name.to_string(),
            CreateNetworkOptions {
                name: name.to_string(),
                ..Default::default()
            },
        );
    }

    pub fn add_volume(&self, name: &str) {
        self.state.lock().unwrap().volumes.insert(
            name.to_string(),
            CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            },
        );
    }

    pub fn script_pull(&self, image: &str, scripts: impl IntoIterator<Item = PullScript>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(image.to_string())
            .or_default()
            .extend(scripts);
    }

    pub fn hide_remote(&self, image: &str) {
        self.state
            .lock()
            .unwrap()
            .missing_remote
            .insert(image.to_string());
    }

    /// Number of recorded calls starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn network_names(&self) -> Vec<String> {
        self.state.lock().unwrap().networks.keys().cloned().collect()
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state.lock().unwrap().volumes.keys().cloned().collect()
    }

    /// Most concurrent `create_image` streams seen so far
    pub fn max_active_pulls(&self) -> usize {
        self.max_active_pulls.load(Ordering::SeqCst)
    }

    fn find<'a>(state: &'a EngineState, id: &str) -> Option<&'a FakeContainer> {
        state
            .containers
            .get(id)
            .or_else(|| state.containers.values().find(|c| c.id == id))
    }
}

impl FakeContainer {
    fn labels(&self) -> HashMap<String, String> {
        self.params.labels.clone().unwrap_or_default()
    }

    fn state_name(&self) -> &'static str {
        if self.running {
            "running"
        } else {
            "exited"
        }
    }
}

fn progress(status: &str, id: Option<&str>, detail: Option<(i64, i64)>) -> CreateImageInfo {
    CreateImageInfo {
        status: Some(status.to_string()),
        id: id.map(String::from),
        progress_detail: detail.map(|(current, total)| ProgressDetail {
            current: Some(current),
            total: Some(total),
        }),
        ..Default::default()
    }
}

impl DockerEngine for FakeEngine {
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInspectResponse>> {
        let state = self.state.lock().unwrap();
        Ok(Self::find(&state, id).map(|c| ContainerInspectResponse {
            id: Some(c.id.clone()),
            name: Some(format!("/{}", c.name)),
            state: Some(ContainerState {
                running: Some(c.running),
                status: from_engine_json(json!(c.state_name())).unwrap(),
                ..Default::default()
            }),
            config: Some(ContainerConfig {
                image: c.params.image.clone(),
                labels: Some(c.labels()),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: c
                    .params
                    .networking_config
                    .as_ref()
                    .map(|networking| networking.endpoints_config.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }))
    }

    async fn list_containers(&self, all: bool, filter: &LabelFilter) -> Result<Vec<ContainerSummary>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .values()
            .filter(|c| (all || c.running) && filter.matches(&c.labels()))
            .map(|c| ContainerSummary {
                id: Some(c.id.clone()),
                names: Some(vec![format!("/{}", c.name)]),
                image: c.params.image.clone(),
                state: from_engine_json(json!(c.state_name())).unwrap(),
                labels: Some(c.labels()),
                ..Default::default()
            })
            .collect())
    }

    async fn create_container(
        &self,
        name: &str,
        _platform: Option<&str>,
        params: &Config<String>,
    ) -> Result<ContainerCreateResponse> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create_container {}", name));
        if state.containers.contains_key(name) {
            return Err(conflict(
                "/containers/create".to_string(),
                format!("Conflict. The container name \"/{}\" is already in use", name),
            ));
        }
        state.next_id += 1;
        let id = format!("c{:04}", state.next_id);
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                params: params.clone(),
                running: false,
            },
        );
        Ok(ContainerCreateResponse {
            id,
            warnings: Vec::new(),
        })
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("start_container {}", id));
        let container = state
            .containers
            .values_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found("containers", id))?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("stop_container {}", id));
        let container = state
            .containers
            .values_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found("containers", id))?;
        container.running = false;
        Ok(())
    }

    async fn delete_container(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete_container {}", id));
        let name = Self::find(&state, id)
            .map(|c| (c.name.clone(), c.running))
            .ok_or_else(|| not_found("containers", id))?;
        if name.1 && !force {
            return Err(conflict(
                format!("/containers/{}", id),
                "You cannot remove a running container".to_string(),
            ));
        }
        state.containers.remove(&name.0);
        Ok(())
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<Network>> {
        let state = self.state.lock().unwrap();
        Ok(state.networks.get(name).map(|n| Network {
            id: Some(format!("net-{}", n.name)),
            name: Some(n.name.clone()),
            driver: Some(if n.driver.is_empty() { "bridge" } else { &n.driver }.to_string()),
            labels: Some(n.labels.clone()),
            ..Default::default()
        }))
    }

    async fn create_network(&self, params: &CreateNetworkOptions<String>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create_network {}", params.name));
        if state.networks.contains_key(&params.name) {
            return Err(conflict(
                "/networks/create".to_string(),
                format!("network with name {} already exists", params.name),
            ));
        }
        state.networks.insert(params.name.clone(), params.clone());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove_network {}", name));
        state
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("networks", name))
    }

    async fn inspect_volume(&self, name: &str) -> Result<Option<Volume>> {
        let state = self.state.lock().unwrap();
        Ok(state.volumes.get(name).map(|v| Volume {
            name: v.name.clone(),
            driver: if v.driver.is_empty() { "local" } else { &v.driver }.to_string(),
            mountpoint: format!("/var/lib/docker/volumes/{}/_data", v.name),
            labels: v.labels.clone(),
            ..Default::default()
        }))
    }

    async fn create_volume(&self, params: &CreateVolumeOptions<String>) -> Result<Volume> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create_volume {}", params.name));
        state.volumes.insert(params.name.clone(), params.clone());
        Ok(Volume {
            name: params.name.clone(),
            driver: "local".to_string(),
            labels: params.labels.clone(),
            ..Default::default()
        })
    }

    async fn inspect_image(&self, name: &str) -> Result<Option<ImageInspect>> {
        let state = self.state.lock().unwrap();
        Ok(state.images.get(&normalize_tag(name)).map(|image| ImageInspect {
            id: Some(format!("sha256:{}", image)),
            repo_tags: Some(vec![image.clone()]),
            ..Default::default()
        }))
    }

    async fn distribution_info(
        &self,
        tag: &str,
        _credentials: Option<&DockerCredentials>,
    ) -> Result<Option<DistributionInspect>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("distribution_info {}", tag));
        if state.missing_remote.contains(tag) {
            return Ok(None);
        }
        Ok(Some(DistributionInspect {
            descriptor: OciDescriptor {
                media_type: Some("application/vnd.docker.distribution.manifest.v2+json".to_string()),
                digest: Some(format!("sha256:{}", tag)),
                size: Some(1024),
                ..Default::default()
            },
            ..Default::default()
        }))
    }

    async fn create_image(
        &self,
        from_image: &str,
        tag: &str,
        _credentials: Option<&DockerCredentials>,
    ) -> Result<EngineStream<CreateImageInfo>> {
        let image = format!("{}:{}", from_image, tag);
        let script = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("create_image {}", image));
            state
                .scripts
                .get_mut(&image)
                .and_then(VecDeque::pop_front)
                .unwrap_or(PullScript::Complete)
        };

        let active = self.active_pulls.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_pulls.fetch_max(active, Ordering::SeqCst);

        let (tx, stream) = EngineStream::channel(16);
        let active_pulls = self.active_pulls.clone();
        let delay = self.pull_delay;
        let banner = progress(&format!("Pulling from {}", from_image), Some(tag), None);
        match script {
            PullScript::Complete => {
                // images become visible before the final message is sent
                let done = progress(
                    &format!("Status: Downloaded newer image for {}", image),
                    None,
                    None,
                );
                self.add_image(&image);
                tokio::spawn(async move {
                    let _ = tx.send(Ok(banner)).await;
                    let _ = tx.send(Ok(progress("Pulling fs layer", Some("a1"), None))).await;
                    let _ = tx
                        .send(Ok(progress("Downloading", Some("a1"), Some((5, 10)))))
                        .await;
                    let _ = tx.send(Ok(progress("Pull complete", Some("b2"), None))).await;
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    active_pulls.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send(Ok(done)).await;
                });
            }
            PullScript::Hang => {
                tokio::spawn(async move {
                    let _ = tx.send(Ok(banner)).await;
                    let _ = tx.send(Ok(progress("Pulling fs layer", Some("a1"), None))).await;
                    tx.closed().await;
                    active_pulls.fetch_sub(1, Ordering::SeqCst);
                });
            }
            PullScript::Fail(message) => {
                let failure = CreateImageInfo {
                    error: Some(message.clone()),
                    error_detail: Some(ErrorDetail {
                        message: Some(message),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                tokio::spawn(async move {
                    let _ = tx.send(Ok(banner)).await;
                    active_pulls.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send(Ok(failure)).await;
                });
            }
        }
        Ok(stream)
    }

    async fn monitor_events(&self) -> Result<EngineStream<EventMessage>> {
        Ok(EngineStream::from_items(Vec::new()))
    }
}

/// Start a pull queue over `engine` with no private registries
pub fn start_pulls(engine: Arc<FakeEngine>, history_limit: usize) -> PullHandle {
    let auth = RegistryAuth::new(Vec::new(), StaticTokenProvider);
    let (queue, handle) = PullQueue::new(engine, auth, history_limit);
    tokio::spawn(queue.run());
    handle
}

/// Orchestrator over `engine` with in-memory definitions
pub fn orchestrator(
    engine: Arc<FakeEngine>,
    projects: &[(&str, &str)],
) -> Orchestrator<FakeEngine, HashMap<String, ProjectDefinition>> {
    let store: HashMap<String, ProjectDefinition> = projects
        .iter()
        .map(|(name, content)| (name.to_string(), ProjectDefinition::parse(name, content)))
        .collect();
    let env: HashMap<String, String> = HashMap::new();
    let pulls = start_pulls(engine.clone(), 10);
    Orchestrator::new(engine, Arc::new(store), pulls, Arc::new(env))
}
