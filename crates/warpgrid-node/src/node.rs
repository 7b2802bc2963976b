//! Node lifecycle controller.
//!
//! ```text
//!   Node::new ──▶ start() ──▶ Active ──▶ shutdown() ──▶ inactive
//!                   │  ▲        │                         │
//!                   │  └────────┘ restart (bounded)       │ terminate()
//!                   ▼                                     ▼
//!             join failure                       CompletelyShutdown
//! ```
//!
//! A [`Node`] is a cheap `Clone` handle; every subsystem that needs to
//! call back into the node holds one.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warpgrid_cluster::{
    Address, AddressResolver, ClusterError, ClusterState, Discovery, DiscoveryStrategy,
    GroupSecurityContext, JoinCoordinator, JoinInfo, Member, MemberList, MembershipListener,
    MembershipRegistry, SecurityContext, ServiceContext,
};

use crate::config::{NodeConfig, Timings};
use crate::connection::TcpConnectionManager;
use crate::error::{NodeError, NodeResult};
use crate::hook;
use crate::services::{
    ConnectionManager, DefaultInitializer, ManagedService, NodeInitializer, NoopPartitionService,
    NoopService, PartitionService,
};
use crate::shutdown::ShutdownCoordinator;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

/// Subsystems plugged into a node. Anything left at its default is a
/// no-op, except the connection manager and registry, which default to
/// the join handshake listener and an in-memory member list.
pub struct Collaborators {
    pub partition_service: Arc<dyn PartitionService>,
    pub client_service: Arc<dyn ManagedService>,
    pub executor_service: Arc<dyn ManagedService>,
    pub text_protocol_service: Arc<dyn ManagedService>,
    pub initializer: Arc<dyn NodeInitializer>,
    pub connection_manager: Option<Arc<dyn ConnectionManager>>,
    pub registry: Option<Box<dyn MembershipRegistry>>,
    /// Overrides the group-password context used when security is enabled.
    pub security: Option<Arc<dyn SecurityContext>>,
    /// Used instead of the configured discovery mechanisms.
    pub discovery: Option<Arc<dyn DiscoveryStrategy>>,
    /// Told about every member added to or removed from the list.
    pub membership_listeners: Vec<Arc<dyn MembershipListener>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            partition_service: Arc::new(NoopPartitionService),
            client_service: Arc::new(NoopService("client service")),
            executor_service: Arc::new(NoopService("executor service")),
            text_protocol_service: Arc::new(NoopService("text protocol service")),
            initializer: Arc::new(DefaultInitializer),
            connection_manager: None,
            registry: None,
            security: None,
            discovery: None,
            membership_listeners: Vec::new(),
        }
    }
}

/// Tasks owned by one run of the node, torn down by shutdown.
#[derive(Default)]
pub(crate) struct BackgroundTasks {
    pub(crate) signal: Option<watch::Sender<bool>>,
    pub(crate) handles: Vec<(String, JoinHandle<()>)>,
    pub(crate) hook: Option<JoinHandle<()>>,
}

pub(crate) struct NodeInner {
    pub(crate) id: u64,
    pub(crate) config: NodeConfig,
    pub(crate) timings: Timings,
    pub(crate) state: Arc<ClusterState>,
    pub(crate) service: Arc<ServiceContext>,
    pub(crate) coordinator: Arc<JoinCoordinator>,
    pub(crate) connection_manager: Arc<dyn ConnectionManager>,
    pub(crate) partition_service: Arc<dyn PartitionService>,
    pub(crate) client_service: Arc<dyn ManagedService>,
    pub(crate) executor_service: Arc<dyn ManagedService>,
    pub(crate) text_protocol_service: Arc<dyn ManagedService>,
    pub(crate) initializer: Arc<dyn NodeInitializer>,
    pub(crate) security: Option<Arc<dyn SecurityContext>>,
    custom_discovery: Option<Arc<dyn DiscoveryStrategy>>,
    pub(crate) tasks: Mutex<BackgroundTasks>,
    pub(crate) shutdown_lock: tokio::sync::Mutex<()>,
    /// Bumped on every shutdown request; a start that sees it move gives up.
    shutdown_requests: AtomicU64,
    restarting: AtomicBool,
    terminated: watch::Sender<bool>,
}

/// Handle to a cluster node.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl Node {
    /// Resolve the local address and wire up the node. Nothing runs
    /// until [`Node::start`].
    pub fn new(config: NodeConfig, collaborators: Collaborators) -> NodeResult<Self> {
        let timings = config.validate()?;
        let resolved = AddressResolver::new(config.resolver_config()).resolve()?;
        let address = resolved.address;
        let id = NEXT_NODE_ID.fetch_add(1, Ordering::SeqCst);

        let state = Arc::new(ClusterState::new(address, config.role()));
        let registry = collaborators
            .registry
            .unwrap_or_else(|| Box::new(MemberList::new(address)));
        let service = Arc::new(ServiceContext::new(registry).with_timeout(timings.service_timeout));
        for listener in collaborators.membership_listeners {
            service.add_listener(listener);
        }

        let security = collaborators.security.or_else(|| {
            config.security.enabled.then(|| {
                Arc::new(GroupSecurityContext::new(
                    config.group.name.clone(),
                    &config.group.password,
                )) as Arc<dyn SecurityContext>
            })
        });

        let mut coordinator = JoinCoordinator::new(
            Arc::clone(&state),
            Arc::clone(&service),
            collaborators.initializer.build_id(),
            config.fingerprint(),
            config.join_settings(&timings),
        );
        if let Some(security) = &security {
            coordinator = coordinator.with_security(Arc::clone(security));
        }
        let coordinator = Arc::new(coordinator);

        let connection_manager: Arc<dyn ConnectionManager> = match collaborators.connection_manager {
            Some(manager) => manager,
            None => Arc::new(TcpConnectionManager::new(
                Arc::clone(&coordinator),
                resolved.listener,
            )
            .map_err(ClusterError::from)?),
        };

        info!(node_id = id, %address, role = %config.role(), "node created");

        let (terminated, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(NodeInner {
                id,
                config,
                timings,
                state,
                service,
                coordinator,
                connection_manager,
                partition_service: collaborators.partition_service,
                client_service: collaborators.client_service,
                executor_service: collaborators.executor_service,
                text_protocol_service: collaborators.text_protocol_service,
                initializer: collaborators.initializer,
                security,
                custom_discovery: collaborators.discovery,
                tasks: Mutex::new(BackgroundTasks::default()),
                shutdown_lock: tokio::sync::Mutex::new(()),
                shutdown_requests: AtomicU64::new(0),
                restarting: AtomicBool::new(false),
                terminated,
            }),
        })
    }

    /// Start the node and join a cluster.
    ///
    /// Failures are logged, never returned: the node is torn down and
    /// started again, up to `max_restart_attempts` times, after which it
    /// is left inactive. A shutdown requested while an attempt is in
    /// flight ends the loop without another attempt.
    pub async fn start(&self) {
        let max_attempts = self.inner.config.properties.max_restart_attempts;
        let mut attempt = 0u32;

        loop {
            if self.inner.state.is_completely_shutdown() {
                return;
            }
            let requests = self.shutdown_requests();
            let result = self.start_once(requests).await;
            if self.shutdown_requests() != requests || self.inner.state.is_completely_shutdown() {
                debug!(node_id = self.inner.id, "node stopped while starting; not restarting");
                self.teardown_after_failed_start().await;
                return;
            }
            let err = match result {
                Ok(()) => return,
                Err(e) => e,
            };

            if attempt >= max_attempts {
                error!(
                    node_id = self.inner.id,
                    error = %err,
                    attempts = attempt,
                    "node could not start; leaving it inactive"
                );
                self.teardown_after_failed_start().await;
                return;
            }

            attempt += 1;
            warn!(
                node_id = self.inner.id,
                error = %err,
                attempt,
                max_attempts,
                "node start failed; restarting"
            );
            self.inner.restarting.store(true, Ordering::SeqCst);
            self.teardown_after_failed_start().await;
            self.inner.partition_service.reset();
            self.inner.restarting.store(false, Ordering::SeqCst);
        }
    }

    async fn start_once(&self, shutdown_requests: u64) -> NodeResult<()> {
        let inner = &self.inner;
        let state = &inner.state;
        if state.is_completely_shutdown() {
            debug!(node_id = inner.id, "start ignored; node is completely shut down");
            return Ok(());
        }
        if state.is_active() {
            return Ok(());
        }

        inner
            .initializer
            .before_initialize()
            .await
            .map_err(|e| startup("initializer", e))?;

        let uuid = state.regenerate_uuid();
        inner.service.start(
            &self.thread_name("service"),
            inner.config.properties.service_thread_priority,
        )?;
        inner
            .service
            .submit("reset members", |registry| registry.reset())
            .await?;

        let (signal_tx, signal_rx) = watch::channel(false);
        inner.tasks.lock().signal = Some(signal_tx);

        inner
            .connection_manager
            .start()
            .await
            .map_err(|e| startup("connection manager", e))?;

        let discovery = Discovery::from_config(
            &inner.config.network.discovery,
            Arc::clone(state),
            &inner.config.group.name,
            inner.config.network.port,
            inner.custom_discovery.clone(),
        );
        if let Some(multicast) = discovery.as_ref().and_then(Discovery::multicast) {
            self.spawn_task("multicast", Arc::clone(multicast).run(signal_rx));
        }
        inner.coordinator.install_discovery(discovery);

        if self.shutdown_requests() != shutdown_requests || !state.set_active(true) {
            return Err(NodeError::NotActive);
        }
        let hook = hook::install(self);
        inner.tasks.lock().hook = Some(hook);

        let bound = self.join_bound();
        match tokio::time::timeout(bound, inner.coordinator.join()).await {
            Ok(joined) => joined?,
            Err(_) => return Err(NodeError::JoinTimeout(bound)),
        }

        self.warn_if_ports_occupied();

        if let Err(e) = inner.initializer.after_initialize().await {
            warn!(node_id = inner.id, error = %e, "after-initialize hook failed");
        }

        info!(
            node_id = inner.id,
            address = %state.this_address(),
            %uuid,
            master = ?state.master(),
            members = inner.service.members().len(),
            "node started"
        );
        Ok(())
    }

    fn join_bound(&self) -> Duration {
        let t = &self.inner.timings;
        t.join_timeout + t.handshake_timeout + t.service_timeout
    }

    fn warn_if_ports_occupied(&self) {
        let configured = u32::from(self.inner.config.network.port);
        if configured == 0 {
            return;
        }
        let port = u32::from(self.this_address().port());
        let cluster_size = self.inner.service.members().len() as u32;
        if port >= configured + cluster_size {
            warn!(
                configured_port = configured,
                port,
                cluster_size,
                "some of the configured ports seem occupied"
            );
        }
    }

    fn shutdown_requests(&self) -> u64 {
        self.inner.shutdown_requests.load(Ordering::SeqCst)
    }

    pub(crate) fn note_shutdown_request(&self) {
        self.inner.shutdown_requests.fetch_add(1, Ordering::SeqCst);
    }

    async fn teardown_after_failed_start(&self) {
        if self.inner.state.is_active() {
            self.shutdown(true, true).await;
        } else {
            self.shutdown_coordinator().release().await;
        }
    }

    /// Forced teardown followed by a fresh start.
    pub async fn restart(&self) {
        if self.inner.state.is_completely_shutdown() {
            return;
        }
        info!(node_id = self.inner.id, "restarting node");
        self.inner.restarting.store(true, Ordering::SeqCst);
        self.shutdown(true, true).await;
        self.inner.partition_service.reset();
        self.inner.restarting.store(false, Ordering::SeqCst);
        self.start().await;
    }

    /// React to memory exhaustion: stop talking to peers, tear down in
    /// the background, and mark the node degraded.
    pub async fn on_out_of_memory(&self, cause: impl fmt::Display) {
        let degraded = NodeError::OutOfMemoryDegradation(cause.to_string());
        error!(node_id = self.inner.id, error = %degraded, "shutting node down");

        if let Err(e) = self.inner.connection_manager.shutdown().await {
            debug!(error = %e, "connection manager shutdown after out-of-memory failed");
        }
        drop(self.shutdown_coordinator().shutdown_in_background(true));
        self.inner.state.set_out_of_memory();
    }

    /// The master could not be reached: rejoin, restarting if that fails.
    pub async fn on_master_unreachable(&self) {
        if !self.inner.state.is_active() {
            return;
        }
        let master = self.inner.state.master();
        warn!(node_id = self.inner.id, ?master, "master unreachable; rejoining");
        if let Err(e) = self.inner.coordinator.rejoin().await {
            warn!(node_id = self.inner.id, error = %e, "rejoin failed");
            self.restart().await;
        }
    }

    pub fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.inner.service.add_listener(listener);
    }

    /// Fail fast unless the node is running.
    pub fn check_node_state(&self) -> NodeResult<()> {
        if self.inner.restarting.load(Ordering::SeqCst) {
            return Err(NodeError::Restarting);
        }
        if !self.inner.state.is_active() {
            return Err(NodeError::NotActive);
        }
        Ok(())
    }

    pub async fn shutdown(&self, force: bool, synchronous: bool) {
        self.shutdown_coordinator().shutdown(force, synchronous).await
    }

    /// Shut down for good; later `start` calls do nothing.
    pub async fn terminate(&self, force: bool) {
        self.inner.state.mark_completely_shutdown();
        self.shutdown(force, true).await;
        self.notify_terminated();
    }

    /// Resolves once the node is completely shut down.
    pub async fn wait_terminated(&self) {
        let mut rx = self.inner.terminated.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub(crate) fn notify_terminated(&self) {
        self.inner.terminated.send_replace(true);
    }

    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        ShutdownCoordinator::new(self.clone())
    }

    /// Spawn a task that is stopped by the shutdown sequence.
    pub fn spawn_task<F>(&self, name: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = self.thread_name(name);
        debug!(task = %name, "spawning background task");
        let handle = tokio::spawn(task);
        self.inner.tasks.lock().handles.push((name, handle));
    }

    /// A watch receiver flipped by shutdown, for tasks started with
    /// [`Node::spawn_task`].
    pub fn shutdown_signal(&self) -> Option<watch::Receiver<bool>> {
        self.inner.tasks.lock().signal.as_ref().map(|tx| tx.subscribe())
    }

    /// `warpgrid.{id}.{name}`
    pub fn thread_name(&self, name: &str) -> String {
        format!("warpgrid.{}.{}", self.inner.id, name)
    }

    // ── accessors ──────────────────────────────────────────────

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.inner.state
    }

    pub fn coordinator(&self) -> &Arc<JoinCoordinator> {
        &self.inner.coordinator
    }

    pub fn this_address(&self) -> Address {
        self.inner.state.this_address()
    }

    pub fn master_address(&self) -> Option<Address> {
        self.inner.state.master()
    }

    pub fn is_master(&self) -> bool {
        self.inner.state.is_master()
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.is_active()
    }

    /// Returns whether the node could be marked active.
    pub fn set_active(&self, active: bool) -> bool {
        self.inner.state.set_active(active)
    }

    pub fn joined(&self) -> bool {
        self.inner.state.is_joined()
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.inner.state.is_out_of_memory()
    }

    pub fn is_completely_shutdown(&self) -> bool {
        self.inner.state.is_completely_shutdown()
    }

    pub fn is_restarting(&self) -> bool {
        self.inner.restarting.load(Ordering::SeqCst)
    }

    pub fn local_member(&self) -> Member {
        self.inner.state.local_member()
    }

    pub fn members(&self) -> Vec<Member> {
        self.inner.service.members().as_ref().clone()
    }

    pub fn failed_connections(&self) -> Vec<Address> {
        self.inner.state.failed_connections()
    }

    /// Record a peer the connection layer could not reach.
    pub fn failed_connection(&self, address: Address) {
        self.inner.state.failed_connection(address);
    }

    pub fn create_join_info(&self, with_credentials: bool) -> JoinInfo {
        self.inner.coordinator.create_join_info(true, with_credentials)
    }
}

fn startup(subsystem: &'static str, err: anyhow::Error) -> NodeError {
    NodeError::Startup {
        subsystem,
        reason: format!("{err:#}"),
    }
}
