//! Service trait and the manager that runs a set of them.
//!
//! Each protocol handler and background component implements
//! [`MeshService`]. The [`ServiceManager`] binds every service's protocol id
//! to an accept loop on the substrate, starts services in registration
//! order, and stops them in reverse on shutdown.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::context::ServiceContext;
use crate::substrate::{PeerStream, SubstrateError};
use crate::upstream::UpstreamError;
use crate::wire::WireError;

/// How long shutdown waits for background tasks to notice the signal.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("service {name} failed to start: {reason}")]
    Start { name: &'static str, reason: String },

    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

#[async_trait]
pub trait MeshService: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Protocol whose inbound streams go to [`MeshService::handle_stream`].
    fn protocol_id(&self) -> Option<&'static str> {
        None
    }

    async fn start(self: Arc<Self>) -> Result<(), MeshError>;

    async fn stop(&self) {}

    async fn handle_stream(self: Arc<Self>, stream: PeerStream) {
        log::debug!(
            "{}: no handler, dropping stream from {}",
            self.name(),
            stream.peer()
        );
    }
}

/// Background tasks owned by one service.
#[derive(Debug, Default)]
pub struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Waits for every task, aborting the ones still running after `grace`.
    pub async fn join(&self, grace: Duration) {
        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            for abort in aborts {
                abort.abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ServiceManager {
    ctx: ServiceContext,
    services: Vec<Arc<dyn MeshService>>,
    accept_loops: TaskSet,
}

impl ServiceManager {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            services: Vec::new(),
            accept_loops: TaskSet::default(),
        }
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    /// Adds a service and binds its protocol handler, if it has one.
    pub fn register(&mut self, service: Arc<dyn MeshService>) -> Result<(), MeshError> {
        if let Some(protocol) = service.protocol_id() {
            let mut inbound = self.ctx.substrate.accept(protocol)?;
            let shutdown = self.ctx.shutdown.clone();
            let handler = Arc::clone(&service);
            self.accept_loops.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = inbound.recv() => match next {
                            Some(stream) => {
                                tokio::spawn(Arc::clone(&handler).handle_stream(stream));
                            }
                            None => break,
                        },
                    }
                }
                log::debug!("{}: accept loop for {} ended", handler.name(), protocol);
            });
            log::info!("services: {} handles {}", service.name(), protocol);
        }
        self.services.push(service);
        Ok(())
    }

    /// Starts every service in registration order; the first failure aborts.
    pub async fn start_all(&self) -> Result<(), MeshError> {
        for service in &self.services {
            log::info!("services: starting {}", service.name());
            Arc::clone(service).start().await?;
        }
        Ok(())
    }

    /// Signals shutdown and stops services in reverse order.
    pub async fn shutdown(&self) {
        self.ctx.shutdown.cancel();
        for service in self.services.iter().rev() {
            log::info!("services: stopping {}", service.name());
            service.stop().await;
        }
        self.accept_loops.join(STOP_GRACE).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::memory::MemoryNetwork;
    use crate::substrate::Substrate;
    use crate::upstream::HttpUpstream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;

    struct Counting {
        started: AtomicUsize,
        streams: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MeshService for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn protocol_id(&self) -> Option<&'static str> {
            Some("/tuns/counting/1.0.0")
        }

        async fn start(self: Arc<Self>) -> Result<(), MeshError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MeshError::Start {
                    name: "counting",
                    reason: "asked to fail".into(),
                });
            }
            Ok(())
        }

        async fn handle_stream(self: Arc<Self>, _stream: PeerStream) {
            self.streams.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn context(node: Arc<crate::memory::MemoryNode>) -> ServiceContext {
        let upstream = Arc::new(HttpUpstream::new(Duration::from_secs(1)).unwrap());
        ServiceContext::new(node, upstream, MeshConfig::default())
    }

    #[tokio::test]
    async fn routes_inbound_streams_to_handler() {
        let net = MemoryNetwork::new();
        let server = net.add_node();
        let client = net.add_node();
        let service = Arc::new(Counting {
            started: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
            fail: false,
        });
        let mut manager = ServiceManager::new(context(server.clone()));
        manager.register(service.clone()).unwrap();
        manager.start_all().await.unwrap();
        assert_eq!(service.started.load(Ordering::SeqCst), 1);

        client.connect(server.local_peer_id(), vec![]).await.unwrap();
        let mut stream = client
            .open_stream(server.local_peer_id(), "/tuns/counting/1.0.0")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();

        for _ in 0..50 {
            if service.streams.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(service.streams.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
        assert!(manager.context().shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn failed_start_aborts() {
        let net = MemoryNetwork::new();
        let node = net.add_node();
        let mut manager = ServiceManager::new(context(node));
        manager
            .register(Arc::new(Counting {
                started: AtomicUsize::new(0),
                streams: AtomicUsize::new(0),
                fail: true,
            }))
            .unwrap();
        assert!(matches!(
            manager.start_all().await,
            Err(MeshError::Start { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_protocol_registration_fails() {
        let net = MemoryNetwork::new();
        let node = net.add_node();
        let mut manager = ServiceManager::new(context(node));
        let make = || {
            Arc::new(Counting {
                started: AtomicUsize::new(0),
                streams: AtomicUsize::new(0),
                fail: false,
            })
        };
        manager.register(make()).unwrap();
        assert!(matches!(
            manager.register(make()),
            Err(MeshError::Substrate(SubstrateError::AlreadyRegistered(_)))
        ));
        assert_eq!(manager.service_names(), vec!["counting"]);
    }
}
