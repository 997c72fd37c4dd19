//! Resumable watch over one resource kind.
//!
//! [`resumable_watch`] turns the API server's finite watch responses into an
//! infinite stream of [`QueueEvent`]s:
//!
//! - the stream ending normally reopens the watch from the last seen version
//! - transient failures (network, 5xx, 429) sleep and retry from the same version
//! - an expired version (410 Gone) resets to [`ResourceVersion::RESYNC`] and
//!   accepts a full replay of current objects as ADDED events
//! - anything else is yielded as an error and ends the stream

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use kube::api::{Api, WatchEvent, WatchParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::queue::{EventType, QueueEvent};
use super::state::{ModuleState, ResourceVersion};

/// Raw watch events as delivered by the API server.
pub type EventStream<K> = BoxStream<'static, kube::Result<WatchEvent<K>>>;

/// Opens watch streams. Implemented for [`Api`]; tests script their own.
#[async_trait]
pub trait WatchSource<K>: Send + Sync {
    async fn open(&self, params: &WatchParams, version: &str) -> kube::Result<EventStream<K>>;
}

#[async_trait]
impl<K> WatchSource<K> for Api<K>
where
    K: Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn open(&self, params: &WatchParams, version: &str) -> kube::Result<EventStream<K>> {
        Ok(self.watch(params, version).await?.boxed())
    }
}

/// Unrecoverable watch failure.
#[derive(Error, Debug)]
pub enum WatchError {
    /// The watch request itself failed.
    #[error("watch request failed: {0}")]
    Api(#[source] kube::Error),

    /// The server sent an error event that is neither expiry nor transient.
    #[error("watch stream error {code}: {message}")]
    Stream { code: u16, message: String },
}

/// How a watch failure is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// Sleep, then reopen from the last known version.
    Retry,
    /// Reopen from the resync sentinel.
    Resync,
    /// Stop the watch.
    Fatal,
}

/// Classify an HTTP status carried by a watch failure.
pub fn classify_code(code: u16) -> Recovery {
    match code {
        410 => Recovery::Resync,
        429 | 500..=599 => Recovery::Retry,
        _ => Recovery::Fatal,
    }
}

/// Classify a client error.
pub fn classify_error(error: &kube::Error) -> Recovery {
    match error {
        kube::Error::Api(e) => classify_code(e.code),
        kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::ReadEvents(_) => {
            Recovery::Retry
        }
        _ => Recovery::Fatal,
    }
}

enum Phase<K> {
    Connect,
    Streaming(EventStream<K>),
    Done,
}

struct Watch<K> {
    module: String,
    source: Arc<dyn WatchSource<K>>,
    params: WatchParams,
    state: ModuleState,
    retry_delay: Duration,
}

impl<K> Watch<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn record_version(&self, version: ResourceVersion) {
        self.state.write().await.last_resource_version = version;
    }

    async fn reset(&self) {
        warn!(module = %self.module, "Watch resourceVersion expired, resyncing from scratch");
        self.record_version(ResourceVersion::resync()).await;
    }

    async fn backoff(&self, reason: &str) {
        warn!(
            module = %self.module,
            reason = %reason,
            delay_ms = self.retry_delay.as_millis() as u64,
            "Transient watch failure, retrying from last resourceVersion"
        );
        tokio::time::sleep(self.retry_delay).await;
    }

    async fn emit(&self, event_type: EventType, object: K) -> QueueEvent<K> {
        if let Some(version) = object.resource_version() {
            self.record_version(ResourceVersion::new(version)).await;
        }
        QueueEvent::new(event_type, object)
    }

    /// Advance until the next event or fatal error.
    async fn step(&self, mut phase: Phase<K>) -> Option<(Result<QueueEvent<K>, WatchError>, Phase<K>)> {
        loop {
            phase = match phase {
                Phase::Done => return None,
                Phase::Connect => {
                    let version = self.state.read().await.last_resource_version.clone();
                    info!(module = %self.module, resource_version = %version, "Opening watch");
                    match self.source.open(&self.params, version.as_str()).await {
                        Ok(stream) => Phase::Streaming(stream),
                        Err(e) => match classify_error(&e) {
                            Recovery::Retry => {
                                self.backoff(&e.to_string()).await;
                                Phase::Connect
                            }
                            Recovery::Resync => {
                                self.reset().await;
                                Phase::Connect
                            }
                            Recovery::Fatal => return Some((Err(WatchError::Api(e)), Phase::Done)),
                        },
                    }
                }
                Phase::Streaming(mut stream) => match stream.next().await {
                    Some(Ok(WatchEvent::Added(obj))) => {
                        let event = self.emit(EventType::Added, obj).await;
                        return Some((Ok(event), Phase::Streaming(stream)));
                    }
                    Some(Ok(WatchEvent::Modified(obj))) => {
                        let event = self.emit(EventType::Modified, obj).await;
                        return Some((Ok(event), Phase::Streaming(stream)));
                    }
                    Some(Ok(WatchEvent::Deleted(obj))) => {
                        let event = self.emit(EventType::Deleted, obj).await;
                        return Some((Ok(event), Phase::Streaming(stream)));
                    }
                    Some(Ok(WatchEvent::Bookmark(bm))) => {
                        self.record_version(ResourceVersion::new(bm.metadata.resource_version))
                            .await;
                        Phase::Streaming(stream)
                    }
                    Some(Ok(WatchEvent::Error(err))) => match classify_code(err.code) {
                        Recovery::Resync => {
                            self.reset().await;
                            Phase::Connect
                        }
                        Recovery::Retry => {
                            self.backoff(&err.message).await;
                            Phase::Connect
                        }
                        Recovery::Fatal => {
                            let error = WatchError::Stream {
                                code: err.code,
                                message: err.message.clone(),
                            };
                            return Some((Err(error), Phase::Done));
                        }
                    },
                    Some(Err(e)) => match classify_error(&e) {
                        Recovery::Retry => {
                            self.backoff(&e.to_string()).await;
                            Phase::Connect
                        }
                        Recovery::Resync => {
                            self.reset().await;
                            Phase::Connect
                        }
                        Recovery::Fatal => return Some((Err(WatchError::Api(e)), Phase::Done)),
                    },
                    None => {
                        debug!(module = %self.module, "Watch ended, reopening from last resourceVersion");
                        Phase::Connect
                    }
                },
            };
        }
    }
}

/// Infinite, restartable watch. Ends only after yielding a fatal error.
///
/// Every emitted object's resourceVersion is written into `state` before the
/// event is yielded.
pub fn resumable_watch<K>(
    module: impl Into<String>,
    source: Arc<dyn WatchSource<K>>,
    params: WatchParams,
    state: ModuleState,
    retry_delay: Duration,
) -> impl Stream<Item = Result<QueueEvent<K>, WatchError>> + Send
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let watch = Arc::new(Watch {
        module: module.into(),
        source,
        params,
        state,
        retry_delay,
    });
    futures::stream::unfold(Phase::Connect, move |phase| {
        let watch = watch.clone();
        async move { watch.step(phase).await }
    })
}
