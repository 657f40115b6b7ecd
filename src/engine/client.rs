//! Docker Engine API client on `bollard`

use super::{forward, DockerEngine, EngineStream, LabelFilter};
use crate::config::BerthConfig;
use crate::error::{BerthError, Result};
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerCreateResponse, ContainerInspectResponse, ContainerSummary, CreateImageInfo,
    DistributionInspect, EventMessage, ImageInspect, Network, Volume,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::system::EventsOptions;
use bollard::volume::CreateVolumeOptions;
use bollard::{ClientVersion, Docker};
use tracing::{debug, warn};

/// Seconds to wait for the engine's response headers
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Items buffered between the engine and a stream consumer
const STREAM_BUFFER: usize = 64;

/// Client for the Docker Engine over its unix socket or TCP
#[derive(Clone)]
pub struct EngineClient {
    docker: Docker,
}

impl EngineClient {
    /// Create a client for the engine described by the configuration
    ///
    /// `docker_host` (`tcp://` or `http://`) wins over `socket_path`.
    pub fn new(config: &BerthConfig) -> Result<Self> {
        let version = client_version(&config.api_version)?;
        let docker = match config.docker_host.as_deref() {
            Some(host) => {
                let addr = match host.strip_prefix("tcp://") {
                    Some(rest) => format!("http://{}", rest),
                    None => host.to_string(),
                };
                debug!("connecting to engine at {}", addr);
                Docker::connect_with_http(&addr, REQUEST_TIMEOUT_SECS, &version)?
            }
            None => {
                let socket = config.socket_path.to_string_lossy();
                debug!("connecting to engine socket {}", socket);
                Docker::connect_with_unix(&socket, REQUEST_TIMEOUT_SECS, &version)?
            }
        };
        Ok(Self { docker })
    }

    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

/// `v1.41` → API version 1.41
pub fn client_version(api_version: &str) -> Result<ClientVersion> {
    let invalid = || BerthError::InvalidConfig(format!("Invalid API version: {}", api_version));
    let (major, minor) = api_version
        .trim_start_matches('v')
        .split_once('.')
        .ok_or_else(invalid)?;
    Ok(ClientVersion {
        major_version: major.parse().map_err(|_| invalid())?,
        minor_version: minor.parse().map_err(|_| invalid())?,
    })
}

/// Turn engine answers outside 2xx into [`BerthError::EngineRequest`]
fn request_error(
    method: &'static str,
    path: impl Into<String>,
) -> impl Fn(bollard::errors::Error) -> BerthError {
    let path = path.into();
    move |e| match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => BerthError::EngineRequest {
            method: method.to_string(),
            path: path.clone(),
            status: status_code,
            message,
        },
        other => BerthError::Docker(other),
    }
}

/// Lookup result with the given statuses meaning "absent"
fn absent_on<T>(result: Result<T>, statuses: &[u16]) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if statuses.iter().any(|s| e.is_status(*s)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl DockerEngine for EngineClient {
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInspectResponse>> {
        let result = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(request_error("GET", format!("/containers/{}/json", id)));
        absent_on(result, &[404])
    }

    async fn list_containers(
        &self,
        all: bool,
        filter: &LabelFilter,
    ) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all,
            filters: filter.to_filters(),
            ..Default::default()
        };
        self.docker
            .list_containers(Some(options))
            .await
            .map_err(request_error("GET", "/containers/json"))
    }

    async fn create_container(
        &self,
        name: &str,
        platform: Option<&str>,
        params: &Config<String>,
    ) -> Result<ContainerCreateResponse> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: platform.map(String::from),
        };
        let response = self
            .docker
            .create_container(Some(options), params.clone())
            .await
            .map_err(request_error("POST", "/containers/create"))?;
        for warning in &response.warnings {
            warn!("create container {}: {}", name, warning);
        }
        debug!("created container {} ({})", name, response.id);
        Ok(response)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(request_error("POST", format!("/containers/{}/start", id)))
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, None::<StopContainerOptions>)
            .await
            .map_err(request_error("POST", format!("/containers/{}/stop", id)))
    }

    async fn delete_container(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(request_error("DELETE", format!("/containers/{}", id)))
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<Network>> {
        let result = self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(request_error("GET", format!("/networks/{}", name)));
        absent_on(result, &[404])
    }

    async fn create_network(&self, params: &CreateNetworkOptions<String>) -> Result<()> {
        let response = self
            .docker
            .create_network(params.clone())
            .await
            .map_err(request_error("POST", "/networks/create"))?;
        debug!("created network {} ({:?})", params.name, response.id);
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.docker
            .remove_network(name)
            .await
            .map_err(request_error("DELETE", format!("/networks/{}", name)))
    }

    async fn inspect_volume(&self, name: &str) -> Result<Option<Volume>> {
        let result = self
            .docker
            .inspect_volume(name)
            .await
            .map_err(request_error("GET", format!("/volumes/{}", name)));
        absent_on(result, &[404])
    }

    async fn create_volume(&self, params: &CreateVolumeOptions<String>) -> Result<Volume> {
        self.docker
            .create_volume(params.clone())
            .await
            .map_err(request_error("POST", "/volumes/create"))
    }

    async fn inspect_image(&self, name: &str) -> Result<Option<ImageInspect>> {
        let result = self
            .docker
            .inspect_image(name)
            .await
            .map_err(request_error("GET", format!("/images/{}/json", name)));
        absent_on(result, &[404])
    }

    async fn distribution_info(
        &self,
        tag: &str,
        credentials: Option<&DockerCredentials>,
    ) -> Result<Option<DistributionInspect>> {
        let result = self
            .docker
            .inspect_registry_image(tag, credentials.cloned())
            .await
            .map_err(request_error("GET", format!("/distribution/{}/json", tag)));
        // the registry answers 401/403 for unknown repositories as well
        absent_on(result, &[401, 403, 404])
    }

    async fn create_image(
        &self,
        from_image: &str,
        tag: &str,
        credentials: Option<&DockerCredentials>,
    ) -> Result<EngineStream<CreateImageInfo>> {
        let options = CreateImageOptions {
            from_image: from_image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let credentials = credentials.cloned();
        let docker = self.docker.clone();
        let on_error = request_error("POST", "/images/create");
        let (tx, stream) = EngineStream::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let source = docker.create_image(Some(options), None, credentials);
            forward(source, tx, on_error).await;
        });
        Ok(stream)
    }

    async fn monitor_events(&self) -> Result<EngineStream<EventMessage>> {
        let docker = self.docker.clone();
        let on_error = request_error("GET", "/events");
        let (tx, stream) = EngineStream::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let source = docker.events(None::<EventsOptions<String>>);
            forward(source, tx, on_error).await;
        });
        Ok(stream)
    }
}
