//! Sequential project request consumer
//!
//! Up and down requests are queued on a channel and executed one after the
//! other, whichever project they target, so two requests never touch the
//! engine's shared networks at the same time.

use super::orchestrator::{Orchestrator, ProjectReport};
use super::project::DefinitionStore;
use crate::engine::DockerEngine;
use crate::error::{BerthError, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

const REQUEST_CAPACITY: usize = 32;

/// Operation requested on a project
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectAction {
    Up,
    Down,
}

struct ManagerRequest {
    action: ProjectAction,
    project: String,
    reply: oneshot::Sender<Result<ProjectReport>>,
}

/// Submits requests to a running [`ProjectManager`]
#[derive(Clone)]
pub struct ManagerHandle {
    requests: mpsc::Sender<ManagerRequest>,
}

impl ManagerHandle {
    /// Queue a request and wait for its result
    pub async fn submit(&self, action: ProjectAction, project: &str) -> Result<ProjectReport> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(ManagerRequest {
                action,
                project: project.to_string(),
                reply,
            })
            .await
            .map_err(|_| BerthError::Closed("project manager"))?;
        rx.await.map_err(|_| BerthError::Closed("project manager"))?
    }

    pub async fn project_up(&self, project: &str) -> Result<ProjectReport> {
        self.submit(ProjectAction::Up, project).await
    }

    pub async fn project_down(&self, project: &str) -> Result<ProjectReport> {
        self.submit(ProjectAction::Down, project).await
    }
}

/// Single consumer executing project requests in arrival order
pub struct ProjectManager<E: DockerEngine, S: DefinitionStore> {
    orchestrator: Orchestrator<E, S>,
    requests: mpsc::Receiver<ManagerRequest>,
}

impl<E: DockerEngine, S: DefinitionStore> ProjectManager<E, S> {
    pub fn new(orchestrator: Orchestrator<E, S>) -> (Self, ManagerHandle) {
        let (tx, requests) = mpsc::channel(REQUEST_CAPACITY);
        (
            Self {
                orchestrator,
                requests,
            },
            ManagerHandle { requests: tx },
        )
    }

    /// Run until every [`ManagerHandle`] has been dropped
    pub async fn run(mut self) {
        info!("Project manager started");
        while let Some(request) = self.requests.recv().await {
            info!("Processing {:?} for project {}", request.action, request.project);
            let result = match request.action {
                ProjectAction::Up => self.orchestrator.project_up(&request.project).await,
                ProjectAction::Down => self.orchestrator.project_down(&request.project).await,
            };
            if let Err(e) = &result {
                error!(
                    "{:?} of project {} failed: {}",
                    request.action, request.project, e
                );
            }
            // the requester may have given up waiting
            let _ = request.reply.send(result);
        }
        info!("Project manager stopped");
    }
}
