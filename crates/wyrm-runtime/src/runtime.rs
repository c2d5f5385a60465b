//! Runtime orchestration.
//!
//! [`WyrmRuntime`] owns the registered handler types. Registration resolves
//! the handler's bindings, declares its outbound topology and builds its
//! pipeline; starting the runtime starts one [`HostLifecycle`] per handler
//! type.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use wyrm_runtime::{HandlerOptions, WyrmRuntime};
//! use wyrm_core::EventBinding;
//!
//! let runtime = WyrmRuntime::builder().build()?;
//! runtime
//!     .register_request_handler(
//!         "uppercase",
//!         Uppercase,
//!         [
//!             EventBinding::queue("text.requests"),
//!             EventBinding::queue("text.results").outbound(),
//!         ],
//!         HandlerOptions::new().instances(2),
//!     )
//!     .await?;
//! runtime.run().await?;
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use tokio::signal;
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info, warn};

use wyrm_core::{
    BoxedBroker, ConfigurationError, EventBinding, HandlerDescriptor, HandlerKey,
    ensure_destination,
};
use wyrm_framework::{
    Behavior, BoxedHandler, EventHandler, RequestHandler, event_handler, handler_pipeline,
    request_handler, resolve,
};
use wyrm_transport::InMemoryBroker;

use crate::config::{ConfigLoader, WyrmConfig};
use crate::error::{RuntimeError, RuntimeResult};
use crate::host::{HostLifecycle, HostStatus};
use crate::logging;

/// Registration options of a handler type.
#[derive(Clone)]
pub struct HandlerOptions {
    instances: usize,
    before: Vec<Arc<dyn Behavior>>,
    after: Vec<Arc<dyn Behavior>>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self {
            instances: 1,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    /// Number of concurrent workers. A handler entry in the configuration
    /// overrides this value.
    pub fn instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    /// Adds a behavior that runs before the handler is invoked.
    pub fn before(mut self, behavior: impl Behavior) -> Self {
        self.before.push(Arc::new(behavior));
        self
    }

    /// Adds a behavior that runs after the result was published.
    pub fn after(mut self, behavior: impl Behavior) -> Self {
        self.after.push(Arc::new(behavior));
        self
    }

    pub fn before_shared(mut self, behavior: Arc<dyn Behavior>) -> Self {
        self.before.push(behavior);
        self
    }

    pub fn after_shared(mut self, behavior: Arc<dyn Behavior>) -> Self {
        self.after.push(behavior);
        self
    }
}

/// The Wyrm runtime.
pub struct WyrmRuntime {
    config: WyrmConfig,
    broker: BoxedBroker,
    hosts: RwLock<BTreeMap<HandlerKey, HostLifecycle>>,
    running: RwLock<bool>,
}

impl WyrmRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a runtime on `broker` and initializes logging from `config`.
    pub fn from_config(config: &WyrmConfig, broker: BoxedBroker) -> Self {
        logging::init_from_config(&config.logging);

        info!(
            log_level = %config.logging.level,
            log_format = ?config.logging.format,
            handler_overrides = config.handlers.len(),
            "Runtime initialized from configuration"
        );

        Self {
            config: config.clone(),
            broker,
            hosts: RwLock::new(BTreeMap::new()),
            running: RwLock::new(false),
        }
    }

    pub fn config(&self) -> &WyrmConfig {
        &self.config
    }

    pub fn broker(&self) -> &BoxedBroker {
        &self.broker
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Registers an [`EventHandler`] under `key`.
    pub async fn register_event_handler<H: EventHandler>(
        &self,
        key: impl Into<HandlerKey>,
        handler: H,
        bindings: impl IntoIterator<Item = EventBinding>,
        options: HandlerOptions,
    ) -> RuntimeResult<()> {
        self.register_handler(key, event_handler(handler), bindings, options)
            .await
    }

    /// Registers a [`RequestHandler`] under `key`.
    pub async fn register_request_handler<H: RequestHandler>(
        &self,
        key: impl Into<HandlerKey>,
        handler: H,
        bindings: impl IntoIterator<Item = EventBinding>,
        options: HandlerOptions,
    ) -> RuntimeResult<()> {
        self.register_handler(key, request_handler(handler), bindings, options)
            .await
    }

    /// Registers an erased handler under `key`.
    ///
    /// Configured instance counts and non-empty configured bindings replace
    /// the ones given here. A failure leaves other handler keys untouched.
    /// If the runtime is already running the new host is started right
    /// away.
    pub async fn register_handler(
        &self,
        key: impl Into<HandlerKey>,
        handler: BoxedHandler,
        bindings: impl IntoIterator<Item = EventBinding>,
        options: HandlerOptions,
    ) -> RuntimeResult<()> {
        let key = key.into();
        let running = self.running.read().await;
        let mut hosts = self.hosts.write().await;

        if hosts.contains_key(&key) {
            return Err(RuntimeError::configuration(
                key.as_str(),
                ConfigurationError::DuplicateHandler(key.to_string()),
            ));
        }

        let mut bindings: Vec<EventBinding> = bindings.into_iter().collect();
        let mut instances = options.instances;
        if let Some(overrides) = self.config.handler(key.as_str()) {
            if !overrides.bindings.is_empty() {
                debug!(handler = %key, "Using bindings from configuration");
                bindings.clone_from(&overrides.bindings);
            }
            if let Some(configured) = overrides.instances {
                instances = configured;
            }
        }
        if instances == 0 {
            return Err(RuntimeError::configuration(
                key.as_str(),
                ConfigurationError::InvalidInstanceCount {
                    handler: key.to_string(),
                },
            ));
        }

        let descriptor = resolve(&key, handler.shape(), &bindings)
            .map_err(|source| RuntimeError::configuration(key.as_str(), source))?;

        if let Some(destination) = &descriptor.outbound {
            ensure_destination(self.broker.as_ref(), destination)
                .await
                .map_err(|source| RuntimeError::Topology {
                    key: key.to_string(),
                    source,
                })?;
        }

        let pipeline = handler_pipeline(
            &descriptor,
            handler,
            self.broker.clone(),
            &options.before,
            &options.after,
        )
        .map_err(|source| RuntimeError::configuration(key.as_str(), source))?;

        let mut host = HostLifecycle::new(descriptor, pipeline, self.broker.clone(), instances);
        if *running {
            host.start().await?;
        }

        info!(
            handler = %key,
            inbound = %host.descriptor().inbound,
            outbound = ?host.descriptor().outbound.as_ref().map(ToString::to_string),
            instances,
            "Registered handler"
        );
        hosts.insert(key, host);
        Ok(())
    }

    /// Keys of all registered handlers, sorted.
    pub async fn handler_keys(&self) -> Vec<HandlerKey> {
        self.hosts.read().await.keys().cloned().collect()
    }

    pub async fn descriptor(&self, key: &str) -> Option<HandlerDescriptor> {
        let hosts = self.hosts.read().await;
        hosts
            .get(&HandlerKey::new(key))
            .map(|h| h.descriptor().clone())
    }

    /// Worker count of a registered handler.
    pub async fn instances(&self, key: &str) -> Option<usize> {
        let hosts = self.hosts.read().await;
        hosts.get(&HandlerKey::new(key)).map(HostLifecycle::instances)
    }

    pub async fn status(&self, key: &str) -> Option<HostStatus> {
        let hosts = self.hosts.read().await;
        hosts.get(&HandlerKey::new(key)).map(HostLifecycle::status)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts every registered host that has not run yet.
    ///
    /// Hosts run once: after [`stop`](Self::stop) a host is not started
    /// again. If one host fails to start, the hosts started before it are
    /// disposed and the error is returned.
    pub async fn start(&self) -> RuntimeResult<()> {
        let mut running = self.running.write().await;
        if *running {
            warn!("Runtime is already running");
            return Ok(());
        }

        info!("Starting Wyrm runtime");
        let mut hosts = self.hosts.write().await;
        let keys: Vec<HandlerKey> = hosts.keys().cloned().collect();
        let mut started: Vec<HandlerKey> = Vec::new();

        for key in keys {
            let Some(host) = hosts.get_mut(&key) else {
                continue;
            };
            if host.status() != HostStatus::Idle {
                continue;
            }
            if let Err(e) = host.start().await {
                error!(handler = %key, error = %e, "Failed to start host");
                for key in &started {
                    if let Some(host) = hosts.get_mut(key) {
                        host.dispose().await;
                    }
                }
                return Err(e.into());
            }
            started.push(key);
        }

        *running = true;
        info!(hosts = hosts.len(), "Runtime started");
        Ok(())
    }

    /// Stops every host concurrently.
    ///
    /// Waits at most `host.stop_timeout_ms` and reports whether all
    /// in-flight messages drained.
    pub async fn stop(&self) -> bool {
        {
            let mut running = self.running.write().await;
            if !*running {
                warn!("Runtime is not running");
                return true;
            }
            *running = false;
        }

        info!("Stopping Wyrm runtime");
        let timeout = self.config.host.stop_timeout();
        let mut hosts = self.hosts.write().await;
        let drained = join_all(hosts.values_mut().map(|host| host.stop(timeout)))
            .await
            .into_iter()
            .all(|drained| drained);

        if drained {
            info!("Runtime stopped");
        } else {
            warn!(
                timeout_ms = self.config.host.stop_timeout_ms,
                "Runtime stopped with undrained messages"
            );
        }
        drained
    }

    /// Runs until Ctrl+C, SIGTERM or the first host failure.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs until `shutdown` completes or the first host failure.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        info!("Wyrm runtime is now running");

        let watchers: Vec<_> = self
            .hosts
            .read()
            .await
            .iter()
            .map(|(key, host)| (key.clone(), host.subscribe()))
            .collect();

        let outcome = tokio::select! {
            _ = shutdown => Ok(()),
            (key, worker, reason) = first_failure(watchers) => {
                error!(handler = %key, worker = %worker, reason = %reason, "Host failed, shutting down");
                Err(RuntimeError::HostFailed {
                    key: key.to_string(),
                    worker,
                    reason,
                })
            }
        };

        self.stop().await;
        outcome
    }
}

/// Resolves with the first host that reports [`HostStatus::Failed`].
async fn first_failure(
    watchers: Vec<(HandlerKey, watch::Receiver<HostStatus>)>,
) -> (HandlerKey, String, String) {
    let mut pending: FuturesUnordered<_> = watchers
        .into_iter()
        .map(|(key, mut rx)| async move {
            let status = match rx
                .wait_for(|s| matches!(s, HostStatus::Failed { .. }))
                .await
            {
                Ok(status) => Some(status.clone()),
                Err(_) => None,
            };
            (key, status)
        })
        .collect();

    while let Some((key, status)) = pending.next().await {
        if let Some(HostStatus::Failed { worker, reason }) = status {
            return (key, worker, reason);
        }
    }
    futures::future::pending().await
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`WyrmRuntime`] with loaded configuration.
///
/// ```rust,ignore
/// let runtime = WyrmRuntime::builder()
///     .config_file("config/wyrm.toml")
///     .profile("production")
///     .build()?;
/// ```
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    broker: Option<BoxedBroker>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new(),
            broker: None,
        }
    }

    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g., "development", "production").
    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    /// Enables loading environment variables (enabled by default).
    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    pub fn merge(mut self, config: WyrmConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Uses `broker` instead of an [`InMemoryBroker`] built from the
    /// `broker` section of the configuration.
    pub fn broker(mut self, broker: BoxedBroker) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn build(self) -> RuntimeResult<WyrmRuntime> {
        let config = self.config_loader.load()?;
        let broker = match self.broker {
            Some(broker) => broker,
            None => Arc::new(InMemoryBroker::with_config(config.broker.clone())),
        };
        Ok(WyrmRuntime::from_config(&config, broker))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
