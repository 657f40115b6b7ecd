//! Docker Engine access
//!
//! [`DockerEngine`] is the seam between reconciliation and the engine: the
//! orchestrator and the pull queue only talk to this trait, [`EngineClient`]
//! implements it on `bollard` and tests substitute an in-memory engine.
//! Payloads and responses are the `bollard` models throughout.

pub mod client;
pub mod models;

pub use client::EngineClient;
pub use models::*;

use crate::error::{BerthError, Result};
use bollard::auth::DockerCredentials;
use bollard::container::Config;
use bollard::models::{
    ContainerCreateResponse, ContainerInspectResponse, ContainerSummary, CreateImageInfo,
    DistributionInspect, EventMessage, ImageInspect, Network, Volume,
};
use bollard::network::CreateNetworkOptions;
use bollard::volume::CreateVolumeOptions;
use futures::{Stream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use tokio::sync::mpsc;

/// Label filters for list calls: `label=key=value` or `label=key`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    labels: BTreeMap<String, Option<String>>,
}

impl LabelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key=value`
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), Some(value.into()));
        self
    }

    /// Require the label to be present with any value
    pub fn has(mut self, key: impl Into<String>) -> Self {
        self.labels.insert(key.into(), None);
        self
    }

    /// Whether a label set satisfies every filter
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.labels.iter().all(|(key, value)| match value {
            Some(value) => labels.get(key) == Some(value),
            None => labels.contains_key(key),
        })
    }

    /// `{"label": ["k=v", ...]}`, the `filters` argument of list calls
    pub fn to_filters(&self) -> HashMap<String, Vec<String>> {
        let values: Vec<String> = self
            .labels
            .iter()
            .map(|(key, value)| match value {
                Some(value) => format!("{}={}", key, value),
                None => key.clone(),
            })
            .collect();
        HashMap::from([("label".to_string(), values)])
    }
}

/// Items of a streaming engine call
///
/// A background task feeds the stream; dropping it stops the task and with
/// it the underlying request.
pub struct EngineStream<T> {
    rx: mpsc::Receiver<Result<T>>,
}

impl<T: Send + 'static> EngineStream<T> {
    /// Stream backed by a channel, for callers that produce items themselves
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<T>>, EngineStream<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, EngineStream { rx })
    }

    /// Stream over a fixed set of items
    pub fn from_items<I>(items: I) -> EngineStream<T>
    where
        I: IntoIterator<Item = T>,
    {
        let items: Vec<T> = items.into_iter().collect();
        let (tx, stream) = Self::channel(items.len());
        for item in items {
            // capacity equals the number of items
            let _ = tx.try_send(Ok(item));
        }
        stream
    }

    /// Next item, `None` once the engine has closed the stream
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.rx.recv().await
    }
}

/// Copy `source` into `tx` until either side is done
///
/// Returns as soon as the receiving [`EngineStream`] is dropped, which drops
/// `source` and releases its connection.
pub(crate) async fn forward<T, E, S>(
    source: S,
    tx: mpsc::Sender<Result<T>>,
    map_err: impl Fn(E) -> BerthError,
) where
    S: Stream<Item = std::result::Result<T, E>>,
{
    tokio::pin!(source);
    loop {
        tokio::select! {
            _ = tx.closed() => return,
            item = source.next() => match item {
                Some(Ok(item)) => {
                    if tx.send(Ok(item)).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(map_err(e))).await;
                    return;
                }
                None => return,
            },
        }
    }
}

/// Operations the orchestrator and the pull queue need from the engine
///
/// Lookups of a single object return `Ok(None)` when the engine answers 404.
pub trait DockerEngine: Send + Sync + 'static {
    fn inspect_container(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<ContainerInspectResponse>>> + Send;

    fn list_containers(
        &self,
        all: bool,
        filter: &LabelFilter,
    ) -> impl Future<Output = Result<Vec<ContainerSummary>>> + Send;

    fn create_container(
        &self,
        name: &str,
        platform: Option<&str>,
        params: &Config<String>,
    ) -> impl Future<Output = Result<ContainerCreateResponse>> + Send;

    fn start_container(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    fn stop_container(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    fn delete_container(&self, id: &str, force: bool) -> impl Future<Output = Result<()>> + Send;

    fn inspect_network(&self, name: &str)
        -> impl Future<Output = Result<Option<Network>>> + Send;

    fn create_network(
        &self,
        params: &CreateNetworkOptions<String>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn remove_network(&self, name: &str) -> impl Future<Output = Result<()>> + Send;

    fn inspect_volume(&self, name: &str) -> impl Future<Output = Result<Option<Volume>>> + Send;

    fn create_volume(
        &self,
        params: &CreateVolumeOptions<String>,
    ) -> impl Future<Output = Result<Volume>> + Send;

    fn inspect_image(&self, name: &str)
        -> impl Future<Output = Result<Option<ImageInspect>>> + Send;

    /// Registry-side manifest lookup
    fn distribution_info(
        &self,
        tag: &str,
        credentials: Option<&DockerCredentials>,
    ) -> impl Future<Output = Result<Option<DistributionInspect>>> + Send;

    /// Start a pull; the stream yields the engine's progress messages
    fn create_image(
        &self,
        from_image: &str,
        tag: &str,
        credentials: Option<&DockerCredentials>,
    ) -> impl Future<Output = Result<EngineStream<CreateImageInfo>>> + Send;

    /// Engine event feed
    fn monitor_events(&self) -> impl Future<Output = Result<EngineStream<EventMessage>>> + Send;
}
