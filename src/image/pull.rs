//! Image pull queue
//!
//! Pull requests are queued FIFO and executed one at a time. A dispatcher
//! task owns the queue, the active task and the history; the active pull runs
//! on a worker task it spawns, and a new worker is only spawned after the
//! previous one has returned.
//!
//! ```text
//! PullHandle --Command--> dispatcher --spawn--> worker (one at a time)
//!     ^                      |   ^                  |
//!     |  oneshot (result)    |   +----- updates ----+
//!     +----------------------+
//!              broadcast (progress), watch (snapshot)
//! ```
//!
//! Each task walks `queueing -> generate_token -> check_local -> check_remote
//! -> pull_image` and ends `completed` or `aborted`. A failing task never
//! stops the queue.

use super::registry::{normalize_tag, split_tag, RegistryAuth, TokenProvider};
use crate::engine::DockerEngine;
use crate::error::{BerthError, Result};
use bollard::models::CreateImageInfo;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info};

const COMMAND_CAPACITY: usize = 64;
const PROGRESS_CAPACITY: usize = 256;

/// Stage of a pull task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullStatus {
    Queueing,
    GenerateToken,
    CheckLocal,
    CheckRemote,
    PullImage,
    Completed,
    Aborted,
}

impl PullStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PullStatus::Completed | PullStatus::Aborted)
    }
}

/// Download progress of one layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerProgress {
    pub id: String,
    pub status: String,
    pub current: u64,
    pub total: u64,
}

/// One image pull
#[derive(Debug, Clone, Serialize)]
pub struct PullTask {
    pub task_id: String,
    /// Normalized reference, always tagged
    pub image_tag: String,
    pub status: PullStatus,
    /// Layer ids in first-seen order
    pub layers: Vec<String>,
    pub layer_status: BTreeMap<String, LayerProgress>,
    pub local_exists: Option<bool>,
    pub remote_exists: Option<bool>,
    /// Why the task was aborted
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PullTask {
    pub fn new(image: &str) -> Self {
        let now = Utc::now();
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            image_tag: normalize_tag(image),
            status: PullStatus::Queueing,
            layers: Vec::new(),
            layer_status: BTreeMap::new(),
            local_exists: None,
            remote_exists: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn set_status(&mut self, status: PullStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    fn abort(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.set_status(PullStatus::Aborted);
    }

    fn reset_layers(&mut self) {
        self.layers.clear();
        self.layer_status.clear();
        self.updated_at = Utc::now();
    }

    /// Fold one progress message from the engine into the task
    pub fn apply(&mut self, msg: &CreateImageInfo) {
        let error = msg
            .error_detail
            .as_ref()
            .and_then(|d| d.message.clone())
            .or_else(|| msg.error.clone());
        if let Some(error) = error {
            self.abort(error);
            return;
        }
        let status = msg.status.as_deref().unwrap_or_default();
        if status.starts_with("Pulling from ") {
            // repository banner
        } else if let Some(id) = &msg.id {
            if !self.layer_status.contains_key(id) {
                self.layers.push(id.clone());
            }
            let layer = self
                .layer_status
                .entry(id.clone())
                .or_insert_with(|| LayerProgress {
                    id: id.clone(),
                    status: status.to_string(),
                    current: 0,
                    total: 0,
                });
            if let Some(detail) = &msg.progress_detail {
                if let Some(total) = detail.total.filter(|t| *t > 0) {
                    layer.current = detail.current.unwrap_or(0).max(0) as u64;
                    layer.total = total as u64;
                }
            }
            layer.status = status.to_string();
        } else if status.starts_with("Status: Downloaded newer image for")
            || status.starts_with("Status: Image is up to date")
        {
            self.status = PullStatus::Completed;
        }
        self.updated_at = Utc::now();
    }
}

/// Current queue state
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub current: Option<PullTask>,
    pub queue: Vec<PullTask>,
    pub history: Vec<PullTask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Refresh,
    Stop,
}

enum Command {
    Enqueue {
        task: PullTask,
        done: oneshot::Sender<Result<PullTask>>,
    },
    Refresh,
    Stop,
}

/// A queued pull whose outcome can be awaited
pub struct PullTicket {
    pub task_id: String,
    pub image_tag: String,
    done: oneshot::Receiver<Result<PullTask>>,
}

impl PullTicket {
    /// Wait until the task completes; aborted tasks yield
    /// [`BerthError::PullAborted`]
    pub async fn wait(self) -> Result<PullTask> {
        self.done
            .await
            .map_err(|_| BerthError::Closed("pull queue"))?
    }
}

/// Client side of the pull queue
#[derive(Clone)]
pub struct PullHandle {
    commands: mpsc::Sender<Command>,
    progress: broadcast::Sender<PullTask>,
    snapshot: watch::Receiver<QueueSnapshot>,
}

impl PullHandle {
    /// Queue a pull of `image` (`:latest` is assumed when untagged)
    pub async fn enqueue(&self, image: &str) -> Result<PullTicket> {
        let task = PullTask::new(image);
        let (done, rx) = oneshot::channel();
        let ticket = PullTicket {
            task_id: task.task_id.clone(),
            image_tag: task.image_tag.clone(),
            done: rx,
        };
        self.commands
            .send(Command::Enqueue { task, done })
            .await
            .map_err(|_| BerthError::Closed("pull queue"))?;
        Ok(ticket)
    }

    /// Queue a pull and wait for it
    pub async fn pull(&self, image: &str) -> Result<PullTask> {
        self.enqueue(image).await?.wait().await
    }

    /// Restart the download of the active task
    pub async fn refresh(&self) -> Result<()> {
        self.commands
            .send(Command::Refresh)
            .await
            .map_err(|_| BerthError::Closed("pull queue"))
    }

    /// Abort the active task
    pub async fn stop(&self) -> Result<()> {
        self.commands
            .send(Command::Stop)
            .await
            .map_err(|_| BerthError::Closed("pull queue"))
    }

    /// Every change to a task, including its final state
    pub fn subscribe_progress(&self) -> broadcast::Receiver<PullTask> {
        self.progress.subscribe()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified whenever the snapshot changes
    pub fn watch(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot.clone()
    }
}

struct Pending {
    task: PullTask,
    done: oneshot::Sender<Result<PullTask>>,
}

struct Active {
    task: PullTask,
    done: oneshot::Sender<Result<PullTask>>,
    control: mpsc::UnboundedSender<Control>,
    worker: JoinHandle<PullTask>,
}

/// Dispatcher of the pull queue; drive it with [`PullQueue::run`]
pub struct PullQueue<E: DockerEngine, T: TokenProvider> {
    engine: Arc<E>,
    auth: Arc<Mutex<RegistryAuth<T>>>,
    commands: mpsc::Receiver<Command>,
    updates: mpsc::UnboundedReceiver<PullTask>,
    updates_tx: mpsc::UnboundedSender<PullTask>,
    queue: VecDeque<Pending>,
    current: Option<Active>,
    history: VecDeque<PullTask>,
    history_limit: usize,
    progress: broadcast::Sender<PullTask>,
    snapshot: watch::Sender<QueueSnapshot>,
}

impl<E: DockerEngine, T: TokenProvider> PullQueue<E, T> {
    pub fn new(engine: Arc<E>, auth: RegistryAuth<T>, history_limit: usize) -> (Self, PullHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (updates_tx, updates) = mpsc::unbounded_channel();
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        let (snapshot, snapshot_rx) = watch::channel(QueueSnapshot::default());
        let handle = PullHandle {
            commands: commands_tx,
            progress: progress.clone(),
            snapshot: snapshot_rx,
        };
        let queue = Self {
            engine,
            auth: Arc::new(Mutex::new(auth)),
            commands,
            updates,
            updates_tx,
            queue: VecDeque::new(),
            current: None,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            progress,
            snapshot,
        };
        (queue, handle)
    }

    /// Run until every [`PullHandle`] has been dropped
    pub async fn run(mut self) {
        info!("Pull queue started");
        loop {
            self.start_next();
            // updates first so a finished task's progress is drained before it is retired
            tokio::select! {
                biased;
                Some(task) = self.updates.recv() => self.on_update(task),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                finished = join_active(&mut self.current) => self.finish(finished),
            }
        }
        if let Some(active) = self.current.take() {
            active.worker.abort();
        }
        info!("Pull queue stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { task, done } => {
                info!("Queued pull of {} ({})", task.image_tag, task.task_id);
                self.queue.push_back(Pending { task, done });
                self.publish();
            }
            Command::Refresh => self.signal(Control::Refresh),
            Command::Stop => self.signal(Control::Stop),
        }
    }

    fn signal(&self, control: Control) {
        match &self.current {
            Some(active) => {
                debug!("{:?} pull of {}", control, active.task.image_tag);
                let _ = active.control.send(control);
            }
            None => debug!("No active pull to {:?}", control),
        }
    }

    fn start_next(&mut self) {
        if self.current.is_some() {
            return;
        }
        let Some(pending) = self.queue.pop_front() else {
            return;
        };
        info!("Start pulling image {}", pending.task.image_tag);
        let (control, control_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_task(
            self.engine.clone(),
            self.auth.clone(),
            pending.task.clone(),
            control_rx,
            self.updates_tx.clone(),
        ));
        self.current = Some(Active {
            task: pending.task,
            done: pending.done,
            control,
            worker,
        });
        self.publish();
    }

    fn on_update(&mut self, task: PullTask) {
        let Some(active) = self.current.as_mut() else {
            return;
        };
        if active.task.task_id != task.task_id {
            return;
        }
        active.task = task.clone();
        let _ = self.progress.send(task);
        self.publish();
    }

    fn finish(&mut self, finished: std::result::Result<PullTask, JoinError>) {
        let Some(active) = self.current.take() else {
            return;
        };
        let task = match finished {
            Ok(task) => task,
            Err(e) => {
                let mut task = active.task;
                task.abort(format!("pull worker failed: {}", e));
                task
            }
        };

        let outcome = if task.status == PullStatus::Completed {
            info!("Pull image {}: completed", task.image_tag);
            Ok(task.clone())
        } else {
            let reason = task.error.clone().unwrap_or_else(|| "aborted".to_string());
            info!("Pull image {}: aborted ({})", task.image_tag, reason);
            Err(BerthError::PullAborted {
                image: task.image_tag.clone(),
                reason,
            })
        };
        // the caller may have stopped waiting
        let _ = active.done.send(outcome);
        let _ = self.progress.send(task.clone());

        self.history.push_back(task);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_replace(QueueSnapshot {
            current: self.current.as_ref().map(|a| a.task.clone()),
            queue: self.queue.iter().map(|p| p.task.clone()).collect(),
            history: self.history.iter().cloned().collect(),
        });
    }
}

async fn join_active(current: &mut Option<Active>) -> std::result::Result<PullTask, JoinError> {
    match current {
        Some(active) => (&mut active.worker).await,
        None => std::future::pending().await,
    }
}

/// Outcome of waiting on a stage while watching for control signals
enum Guarded<T> {
    Done(T),
    Refresh,
    Stop,
}

async fn guarded<F: Future>(control: &mut mpsc::UnboundedReceiver<Control>, fut: F) -> Guarded<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return Guarded::Done(output),
            signal = control.recv() => match signal {
                Some(Control::Refresh) => return Guarded::Refresh,
                Some(Control::Stop) | None => return Guarded::Stop,
            },
        }
    }
}

fn report(updates: &mpsc::UnboundedSender<PullTask>, task: &PullTask) {
    let _ = updates.send(task.clone());
}

/// Drive one task to a terminal state
async fn run_task<E: DockerEngine, T: TokenProvider>(
    engine: Arc<E>,
    auth: Arc<Mutex<RegistryAuth<T>>>,
    mut task: PullTask,
    mut control: mpsc::UnboundedReceiver<Control>,
    updates: mpsc::UnboundedSender<PullTask>,
) -> PullTask {
    macro_rules! stage {
        ($fut:expr) => {
            loop {
                match guarded(&mut control, $fut).await {
                    Guarded::Done(Ok(value)) => break value,
                    Guarded::Done(Err(e)) => {
                        task.abort(e.to_string());
                        return task;
                    }
                    // only the download itself can be restarted
                    Guarded::Refresh => continue,
                    Guarded::Stop => {
                        task.abort("stopped");
                        return task;
                    }
                }
            }
        };
    }

    task.set_status(PullStatus::GenerateToken);
    report(&updates, &task);
    let credentials = stage!(async { auth.lock().await.credentials(&task.image_tag).await });

    task.set_status(PullStatus::CheckLocal);
    report(&updates, &task);
    if stage!(engine.inspect_image(&task.image_tag)).is_some() {
        debug!("Image {} exists locally", task.image_tag);
        task.local_exists = Some(true);
        task.set_status(PullStatus::Completed);
        return task;
    }
    task.local_exists = Some(false);

    task.set_status(PullStatus::CheckRemote);
    report(&updates, &task);
    let remote = stage!(engine.distribution_info(&task.image_tag, credentials.as_ref()));
    if remote.is_none() {
        task.remote_exists = Some(false);
        task.abort(format!("image {} does not exist remotely", task.image_tag));
        return task;
    }
    task.remote_exists = Some(true);

    task.set_status(PullStatus::PullImage);
    let image_tag = task.image_tag.clone();
    let (from_image, tag) = split_tag(&image_tag);
    'request: loop {
        task.reset_layers();
        report(&updates, &task);
        let mut stream = stage!(engine.create_image(from_image, tag, credentials.as_ref()));
        loop {
            let item = match guarded(&mut control, stream.next()).await {
                Guarded::Done(item) => item,
                Guarded::Refresh => {
                    info!("Restarting pull of {}", task.image_tag);
                    continue 'request;
                }
                Guarded::Stop => {
                    task.abort("stopped");
                    return task;
                }
            };
            match item {
                Some(Ok(msg)) => {
                    task.apply(&msg);
                    report(&updates, &task);
                    if task.status.is_terminal() {
                        return task;
                    }
                }
                Some(Err(e)) => {
                    task.abort(e.to_string());
                    return task;
                }
                None => {
                    task.abort("pull stream ended before completion");
                    return task;
                }
            }
        }
    }
}
