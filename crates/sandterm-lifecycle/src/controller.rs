use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use sandterm_eventbus::{SessionEvent, SessionEventBus, SessionEventSubscription};
use sandterm_protocol::{
    DirEntry, FileTree, ProcessId, RemoveOptions, SandboxBooter, SandboxError, SandboxInstance,
    SandboxResult, ServiceReadyStream, SpawnRequest,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::process::{ProcessHandle, ProcessKiller};
use crate::state::{BootState, ChainStep, KillOutcome};
use crate::surface::{DetachedSurface, OutputObserver, PreviewSlot, PreviewSurface};
use crate::tree::initial_file_tree;

/// Install step followed by the long-running server step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerChain {
    pub install: SpawnRequest,
    pub run: SpawnRequest,
}

impl ServerChain {
    pub fn new(install: SpawnRequest, run: SpawnRequest) -> Self {
        Self { install, run }
    }
}

impl Default for ServerChain {
    fn default() -> Self {
        Self {
            install: SpawnRequest::new("npm", ["install"]),
            run: SpawnRequest::new("npm", ["run", "dev"]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SandboxLifecyclePerfSnapshot {
    pub state: BootState,
    pub active_readiness_tasks: usize,
    pub boot_requests_total: u64,
    pub boot_success_total: u64,
    pub boot_failures_total: u64,
    pub spawn_requests_total: u64,
    pub spawn_failures_total: u64,
    pub install_failures_total: u64,
    pub kill_requests_total: u64,
    pub preview_bindings_total: u64,
    pub teardowns_total: u64,
}

#[derive(Debug, Default)]
struct SandboxLifecyclePerfCounters {
    boot_requests_total: AtomicU64,
    boot_success_total: AtomicU64,
    boot_failures_total: AtomicU64,
    spawn_requests_total: AtomicU64,
    spawn_failures_total: AtomicU64,
    install_failures_total: AtomicU64,
    kill_requests_total: AtomicU64,
    preview_bindings_total: AtomicU64,
    teardowns_total: AtomicU64,
}

impl SandboxLifecyclePerfCounters {
    fn snapshot(&self, state: BootState, active_readiness_tasks: usize) -> SandboxLifecyclePerfSnapshot {
        SandboxLifecyclePerfSnapshot {
            state,
            active_readiness_tasks,
            boot_requests_total: self.boot_requests_total.load(Ordering::Relaxed),
            boot_success_total: self.boot_success_total.load(Ordering::Relaxed),
            boot_failures_total: self.boot_failures_total.load(Ordering::Relaxed),
            spawn_requests_total: self.spawn_requests_total.load(Ordering::Relaxed),
            spawn_failures_total: self.spawn_failures_total.load(Ordering::Relaxed),
            install_failures_total: self.install_failures_total.load(Ordering::Relaxed),
            kill_requests_total: self.kill_requests_total.load(Ordering::Relaxed),
            preview_bindings_total: self.preview_bindings_total.load(Ordering::Relaxed),
            teardowns_total: self.teardowns_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct LifecycleInner {
    state: BootState,
    instance: Option<Arc<dyn SandboxInstance>>,
    /// Bumped on every boot attempt and teardown; work started under an older
    /// generation must not touch the current instance.
    generation: u64,
    last_failure: Option<SandboxError>,
    readiness_tasks: HashMap<ProcessId, JoinHandle<()>>,
}

/// Owns the single sandbox instance of a session and everything spawned in it.
#[derive(Clone)]
pub struct SandboxLifecycle {
    booter: Arc<dyn SandboxBooter>,
    eventbus: Arc<SessionEventBus>,
    surface: Arc<dyn PreviewSurface>,
    initial_tree: Arc<FileTree>,
    inner: Arc<RwLock<LifecycleInner>>,
    preview: Arc<PreviewSlot>,
    perf: Arc<SandboxLifecyclePerfCounters>,
}

impl SandboxLifecycle {
    pub fn new(booter: Arc<dyn SandboxBooter>, eventbus: Arc<SessionEventBus>) -> Self {
        Self {
            booter,
            eventbus,
            surface: Arc::new(DetachedSurface),
            initial_tree: Arc::new(initial_file_tree()),
            inner: Arc::new(RwLock::new(LifecycleInner::default())),
            preview: Arc::new(PreviewSlot::default()),
            perf: Arc::new(SandboxLifecyclePerfCounters::default()),
        }
    }

    pub fn with_surface(mut self, surface: Arc<dyn PreviewSurface>) -> Self {
        self.surface = surface;
        self
    }

    pub fn with_initial_tree(mut self, tree: FileTree) -> Self {
        self.initial_tree = Arc::new(tree);
        self
    }

    pub fn eventbus(&self) -> Arc<SessionEventBus> {
        Arc::clone(&self.eventbus)
    }

    pub fn subscribe_events(&self) -> SessionEventSubscription {
        self.eventbus.subscribe()
    }

    pub async fn state(&self) -> BootState {
        self.inner.read().await.state
    }

    pub fn preview_url(&self) -> Option<String> {
        self.preview.url()
    }

    /// Boots the sandbox and mounts the initial file tree.
    ///
    /// Single-flight: while a boot is in flight or the sandbox is ready,
    /// further calls return immediately without booting again.
    pub async fn boot(&self) -> SandboxResult<()> {
        self.perf.boot_requests_total.fetch_add(1, Ordering::Relaxed);
        let generation = {
            let mut inner = self.inner.write().await;
            if inner.state.is_boot_in_flight_or_done() {
                tracing::debug!(state = ?inner.state, "boot already requested");
                return Ok(());
            }
            inner.state = BootState::Booting;
            inner.generation += 1;
            inner.last_failure = None;
            inner.generation
        };
        self.eventbus.publish(SessionEvent::BootStarted);
        tracing::info!(generation, "booting sandbox");

        let result = self.boot_and_mount().await;

        let mut inner = self.inner.write().await;
        let still_current = inner.generation == generation && inner.state == BootState::Booting;
        match result {
            Ok(instance) if still_current => {
                inner.state = BootState::Ready;
                inner.instance = Some(instance);
                drop(inner);
                self.perf.boot_success_total.fetch_add(1, Ordering::Relaxed);
                self.eventbus.publish(SessionEvent::BootCompleted);
                tracing::info!(generation, "sandbox ready");
                Ok(())
            }
            Ok(instance) => {
                drop(inner);
                tracing::debug!(generation, "discarding sandbox booted after teardown");
                teardown_quietly(instance.as_ref()).await;
                Err(SandboxError::NotReady)
            }
            Err(error) => {
                if still_current {
                    inner.state = BootState::Unbooted;
                    inner.last_failure = Some(error.clone());
                }
                drop(inner);
                self.perf.boot_failures_total.fetch_add(1, Ordering::Relaxed);
                self.eventbus.publish(SessionEvent::BootFailed {
                    reason: error.to_string(),
                });
                tracing::warn!(error = %error, "sandbox boot failed");
                Err(error)
            }
        }
    }

    /// Tears down whatever is running and boots a fresh sandbox.
    pub async fn reboot(&self) -> SandboxResult<()> {
        self.teardown().await;
        self.boot().await
    }

    pub async fn list_dir(&self, path: &str) -> SandboxResult<Vec<DirEntry>> {
        let (instance, _) = self.ready_instance().await?;
        instance.list_dir(path).await
    }

    pub async fn make_dir(&self, path: &str) -> SandboxResult<()> {
        let (instance, _) = self.ready_instance().await?;
        instance.make_dir(path).await
    }

    /// Removal is always recursive.
    pub async fn remove_dir(&self, path: &str) -> SandboxResult<()> {
        let (instance, _) = self.ready_instance().await?;
        instance
            .remove_dir(path, RemoveOptions { recursive: true })
            .await
    }

    /// Runs the install step to completion, then starts the server step.
    ///
    /// The run step is never spawned when install exits non-zero. The
    /// readiness subscription is taken before the run step starts so an early
    /// announcement cannot be missed; only the first one binds the preview.
    pub async fn open_server(
        &self,
        chain: &ServerChain,
        observer: Arc<dyn OutputObserver>,
    ) -> SandboxResult<ServerHandle> {
        let (instance, generation) = self.ready_instance().await?;
        self.eventbus.publish(SessionEvent::ServerStarting);

        tracing::info!(command = %chain.install.display_command(), "running install step");
        let mut install = self
            .spawn_process(Arc::clone(&instance), chain.install.clone())
            .await?;
        let code = install
            .run_to_exit(observer.as_ref(), ChainStep::Install)
            .await?;
        if code != 0 {
            self.perf
                .install_failures_total
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(code, "install step failed; server not started");
            return Err(SandboxError::InstallFailed { code });
        }

        let readiness = instance.subscribe_service_ready().await?;
        let mut run = self.spawn_process(instance, chain.run.clone()).await?;
        let owner = run.id().clone();
        let killer = run.killer();
        {
            let mut inner = self.inner.write().await;
            if inner.generation != generation {
                drop(inner);
                let _ = killer.kill().await;
                return Err(SandboxError::NotReady);
            }
            let task = self.spawn_readiness_task(owner.clone(), readiness);
            inner.readiness_tasks.insert(owner.clone(), task);
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let lifecycle = self.clone();
        let monitor_stopping = Arc::clone(&stopping);
        let monitor_killer = killer.clone();
        tokio::spawn(async move {
            let code = match run.run_to_exit(observer.as_ref(), ChainStep::Run).await {
                Ok(code) => code,
                Err(error) => {
                    tracing::warn!(process = %run.id(), error = %error, "lost server exit status");
                    monitor_killer.mark_exited();
                    -1
                }
            };
            lifecycle
                .finish_server(
                    run.id(),
                    generation,
                    code,
                    monitor_stopping.load(Ordering::Acquire),
                )
                .await;
        });

        self.eventbus.publish(SessionEvent::ServerOpened);
        tracing::info!(process = %owner, command = %chain.run.display_command(), "server started");
        Ok(ServerHandle {
            process: killer,
            generation,
            stopping,
            lifecycle: self.clone(),
        })
    }

    /// Kills the server step and releases its preview binding.
    ///
    /// A server that already exited, or that belongs to a torn-down sandbox,
    /// is reported as [`KillOutcome::AlreadyExited`] without touching anything else.
    pub async fn kill_server(&self, server: &ServerHandle) -> SandboxResult<KillOutcome> {
        self.perf.kill_requests_total.fetch_add(1, Ordering::Relaxed);
        let owner = server.process.id().clone();
        self.abort_readiness_task(&owner).await;

        let current = self.inner.read().await.generation == server.generation;
        if !current || server.process.has_exited() {
            self.release_preview(&owner);
            return Ok(KillOutcome::AlreadyExited);
        }

        server.stopping.store(true, Ordering::Release);
        let outcome = server.process.kill().await?;
        self.release_preview(&owner);
        if outcome == KillOutcome::Killed {
            self.eventbus.publish(SessionEvent::ServerClosed);
            tracing::info!(process = %owner, "server stopped");
        }
        Ok(outcome)
    }

    /// Spawns a program for an interactive passthrough session.
    pub async fn open_interactive(&self, request: SpawnRequest) -> SandboxResult<ProcessHandle> {
        let (instance, _) = self.ready_instance().await?;
        tracing::info!(command = %request.display_command(), "opening interactive program");
        self.spawn_process(instance, request).await
    }

    /// Kills everything, releases the preview, and drops the instance.
    ///
    /// Every operation afterwards fails with `NotReady` until the next boot.
    pub async fn teardown(&self) {
        let (instance, tasks) = {
            let mut inner = self.inner.write().await;
            inner.state = BootState::Unbooted;
            inner.generation += 1;
            inner.last_failure = None;
            let tasks = inner
                .readiness_tasks
                .drain()
                .map(|(_, task)| task)
                .collect::<Vec<_>>();
            (inner.instance.take(), tasks)
        };
        for task in tasks {
            task.abort();
        }
        if self.preview.release_any(self.surface.as_ref()) {
            self.eventbus.publish(SessionEvent::PreviewUnbound);
        }
        if let Some(instance) = instance {
            teardown_quietly(instance.as_ref()).await;
            self.perf.teardowns_total.fetch_add(1, Ordering::Relaxed);
            self.eventbus.publish(SessionEvent::TornDown);
            tracing::info!("sandbox torn down");
        }
    }

    pub async fn perf_snapshot(&self) -> SandboxLifecyclePerfSnapshot {
        let inner = self.inner.read().await;
        self.perf.snapshot(inner.state, inner.readiness_tasks.len())
    }

    async fn boot_and_mount(&self) -> SandboxResult<Arc<dyn SandboxInstance>> {
        let instance = self.booter.boot().await.map_err(|error| match error {
            SandboxError::BootFailed(_) => error,
            other => SandboxError::BootFailed(other.to_string()),
        })?;
        if let Err(error) = instance.mount(&self.initial_tree).await {
            teardown_quietly(instance.as_ref()).await;
            return Err(match error {
                SandboxError::MountFailed(_) => error,
                other => SandboxError::MountFailed(other.to_string()),
            });
        }
        Ok(instance)
    }

    async fn ready_instance(&self) -> SandboxResult<(Arc<dyn SandboxInstance>, u64)> {
        let inner = self.inner.read().await;
        match (inner.state, inner.instance.as_ref()) {
            (BootState::Ready, Some(instance)) => Ok((Arc::clone(instance), inner.generation)),
            _ => Err(inner
                .last_failure
                .clone()
                .unwrap_or(SandboxError::NotReady)),
        }
    }

    async fn spawn_process(
        &self,
        instance: Arc<dyn SandboxInstance>,
        request: SpawnRequest,
    ) -> SandboxResult<ProcessHandle> {
        self.perf
            .spawn_requests_total
            .fetch_add(1, Ordering::Relaxed);
        let command = request.display_command();
        match ProcessHandle::spawn(instance, request).await {
            Ok(handle) => Ok(handle),
            Err(error) => {
                self.perf
                    .spawn_failures_total
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(command = %command, error = %error, "sandbox spawn failed");
                Err(error)
            }
        }
    }

    fn spawn_readiness_task(&self, owner: ProcessId, mut readiness: ServiceReadyStream) -> JoinHandle<()> {
        let lifecycle = self.clone();
        tokio::spawn(async move {
            let event = match readiness.next_ready().await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    tracing::debug!(process = %owner, "readiness stream closed before any server");
                    lifecycle.inner.write().await.readiness_tasks.remove(&owner);
                    return;
                }
                Err(error) => {
                    tracing::warn!(process = %owner, error = %error, "readiness stream failed");
                    lifecycle.inner.write().await.readiness_tasks.remove(&owner);
                    return;
                }
            };

            let mut inner = lifecycle.inner.write().await;
            if inner.readiness_tasks.remove(&owner).is_none() {
                return;
            }
            if lifecycle
                .preview
                .bind(lifecycle.surface.as_ref(), &owner, &event.url)
            {
                lifecycle
                    .perf
                    .preview_bindings_total
                    .fetch_add(1, Ordering::Relaxed);
                drop(inner);
                lifecycle.eventbus.publish(SessionEvent::PreviewBound {
                    url: event.url.clone(),
                });
                tracing::info!(process = %owner, port = event.port, url = %event.url, "preview bound");
            }
        })
    }

    async fn finish_server(&self, owner: &ProcessId, generation: u64, code: i32, stopped: bool) {
        self.abort_readiness_task(owner).await;
        if stopped || self.inner.read().await.generation != generation {
            return;
        }
        self.release_preview(owner);
        self.eventbus.publish(SessionEvent::ServerExited { code });
        tracing::info!(process = %owner, code, "server exited");
    }

    async fn abort_readiness_task(&self, owner: &ProcessId) {
        let mut inner = self.inner.write().await;
        if let Some(task) = inner.readiness_tasks.remove(owner) {
            task.abort();
        }
    }

    fn release_preview(&self, owner: &ProcessId) {
        if self.preview.release(self.surface.as_ref(), owner) {
            self.eventbus.publish(SessionEvent::PreviewUnbound);
        }
    }
}

/// Kill capability for a server started by [`SandboxLifecycle::open_server`].
#[derive(Clone)]
pub struct ServerHandle {
    process: ProcessKiller,
    generation: u64,
    stopping: Arc<AtomicBool>,
    lifecycle: SandboxLifecycle,
}

impl ServerHandle {
    pub fn id(&self) -> &ProcessId {
        self.process.id()
    }

    pub fn is_running(&self) -> bool {
        !self.process.has_exited()
    }

    pub async fn kill(&self) -> SandboxResult<KillOutcome> {
        self.lifecycle.kill_server(self).await
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("id", self.process.id())
            .field("generation", &self.generation)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn teardown_quietly(instance: &dyn SandboxInstance) {
    if let Err(error) = instance.teardown().await {
        tracing::warn!(error = %error, "sandbox teardown failed");
    }
}
