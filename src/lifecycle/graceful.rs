//! The per-generation server state and its signal-driven control loop.
//!
//! ```text
//! Starting ──start()──▶ Serving ──SIGINT/SIGTERM──▶ Stopping ──▶ Terminated
//!                          │
//!                          ├──reload signal──▶ Reloading ──spawn ok──▶ Terminated
//!                          │                      ├──stop()──▶ Stopping
//!                          │                      └──spawn failed──▶ Serving
//!                          └──accept loop error──▶ Terminated
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::mpsc;

use crate::config::LifecycleConfig;
use crate::error::GracefulError;
use crate::http::{HttpServer, RunningServer};
use crate::lifecycle::handoff::{ChildSpec, ProcessSpawner, Spawner};
use crate::lifecycle::hooks::{HookPoint, HookRegistry};
use crate::lifecycle::signals::{Control, SignalSubscription};
use crate::net::listener::{self, ListenerHandle};
use crate::observability::metrics;

/// Lifecycle phase of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Serving,
    Stopping,
    Reloading,
    Terminated,
}

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Drained after a stop request.
    Stopped,
    /// Handed the listener to `child_pid` and drained.
    Reloaded { child_pid: u32 },
}

/// Sends stop and reload requests to a running [`Graceful`].
#[derive(Debug, Clone)]
pub struct GracefulHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl GracefulHandle {
    /// Request a graceful stop. Returns `false` if the control loop is gone.
    pub fn stop(&self) -> bool {
        self.tx.send(Control::Stop).is_ok()
    }

    /// Request a handoff. Returns `false` if the control loop is gone.
    pub fn reload(&self) -> bool {
        self.tx.send(Control::Reload).is_ok()
    }
}

enum Event {
    Control(Control),
    ServeFailed(std::io::Error),
}

/// State of one server generation.
pub struct Graceful {
    config: LifecycleConfig,
    grace_period: Duration,
    hooks: HookRegistry,
    spawner: Arc<dyn Spawner>,
    phase: Phase,
    listener: Option<ListenerHandle>,
    local_addr: Option<SocketAddr>,
    server: Option<RunningServer>,
    last_error: Option<GracefulError>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Graceful {
    /// A generation with default settings: 10 second grace period, SIGUSR2
    /// reload, signals handled.
    pub fn new() -> Self {
        Self::with_config(LifecycleConfig::default())
    }

    pub fn with_config(config: LifecycleConfig) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            grace_period: config.grace_period(),
            hooks: HookRegistry::new(config.hook_failure_policy),
            spawner: Arc::new(ProcessSpawner),
            phase: Phase::Starting,
            listener: None,
            local_addr: None,
            server: None,
            last_error: None,
            control_tx,
            control_rx,
            config,
        }
    }

    /// Replace the process spawner used for handoffs.
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Change the grace period. Only allowed before the server starts.
    pub fn set_grace_period(&mut self, grace: Duration) -> Result<&mut Self, GracefulError> {
        if self.phase != Phase::Starting {
            return Err(GracefulError::AlreadyStarted);
        }
        self.grace_period = grace;
        Ok(self)
    }

    pub fn add_before_stop_hook<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() + Send + 'static,
    {
        self.hooks.push(HookPoint::BeforeStop, hook);
        self
    }

    pub fn add_after_stop_hook<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() + Send + 'static,
    {
        self.hooks.push(HookPoint::AfterStop, hook);
        self
    }

    pub fn add_before_reload_hook<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() + Send + 'static,
    {
        self.hooks.push(HookPoint::BeforeReload, hook);
        self
    }

    pub fn add_after_reload_hook<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() + Send + 'static,
    {
        self.hooks.push(HookPoint::AfterReload, hook);
        self
    }

    /// Direct access to the registry, e.g. to register several hooks at once.
    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    /// A handle for requesting stop or reload from other tasks.
    pub fn handle(&self) -> GracefulHandle {
        GracefulHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// The most recent recorded failure, if any.
    pub fn last_error(&self) -> Option<&GracefulError> {
        self.last_error.as_ref()
    }

    /// Address of the listener once started. Still reported after the
    /// generation has drained and closed it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The listening socket, until the generation has drained.
    pub fn listener(&self) -> Option<&ListenerHandle> {
        self.listener.as_ref()
    }

    /// Bind a fresh server for `router` on `addr` (or adopt the inherited
    /// socket) and run the control loop until the generation ends.
    pub async fn listen_and_serve(
        &mut self,
        addr: &str,
        router: Router,
    ) -> Result<Exit, GracefulError> {
        self.run_server(HttpServer::new(addr, router)).await
    }

    /// Start `server` and run the control loop until the generation ends.
    ///
    /// Signal handlers are installed before the listener goes live, so a
    /// signal arriving as soon as the first request is answered is handled.
    pub async fn run_server(&mut self, server: HttpServer) -> Result<Exit, GracefulError> {
        let signals = self.subscribe()?;
        self.start(server).await?;
        self.dispatch(signals).await
    }

    /// Acquire the listener and start accepting, without waiting for signals.
    pub async fn start(&mut self, server: HttpServer) -> Result<(), GracefulError> {
        if self.phase != Phase::Starting {
            return Err(GracefulError::AlreadyStarted);
        }

        let listener = match listener::acquire(server.bind_address()).await {
            Ok(listener) => listener,
            Err(e) => return Err(self.record(e.into())),
        };

        tracing::info!(
            address = %listener.local_addr(),
            origin = ?listener.origin(),
            grace_ms = self.grace_period.as_millis() as u64,
            "Serving"
        );

        self.server = Some(server.start(listener.shared()));
        self.local_addr = Some(listener.local_addr());
        self.listener = Some(listener);
        self.phase = Phase::Serving;
        Ok(())
    }

    /// Run the control loop: wait for a stop or reload request and carry it
    /// out. Returns when the generation has ended.
    pub async fn run(&mut self) -> Result<Exit, GracefulError> {
        if self.phase != Phase::Serving {
            return Err(GracefulError::NotServing);
        }
        let signals = self.subscribe()?;
        self.dispatch(signals).await
    }

    fn subscribe(&mut self) -> Result<Option<SignalSubscription>, GracefulError> {
        if !self.config.handle_signals {
            return Ok(None);
        }
        SignalSubscription::subscribe(self.config.reload_signal)
            .map(Some)
            .map_err(|e| self.record(GracefulError::Signal(Arc::new(e))))
    }

    async fn dispatch(
        &mut self,
        mut signals: Option<SignalSubscription>,
    ) -> Result<Exit, GracefulError> {
        loop {
            match self.next_event(&mut signals).await {
                Event::Control(Control::Stop) => {
                    if let Err(e) = self.enter_stop() {
                        tracing::warn!(error = %e, "Ignoring stop request");
                        continue;
                    }
                    if let Some(subscription) = signals.take() {
                        subscription.unsubscribe();
                    }
                    let result = self.drain().await;
                    self.invoke_hooks(HookPoint::AfterStop);
                    return result.map(|()| Exit::Stopped);
                }
                Event::Control(Control::Reload) => {
                    self.invoke_hooks(HookPoint::BeforeReload);
                    let child_pid = match self.reload() {
                        Ok(pid) => pid,
                        Err(e) => {
                            tracing::error!(error = %e, "Reload aborted, still serving");
                            continue;
                        }
                    };
                    if let Some(subscription) = signals.take() {
                        subscription.unsubscribe();
                    }
                    let result = self.drain().await;
                    self.invoke_hooks(HookPoint::AfterReload);
                    return result.map(|()| Exit::Reloaded { child_pid });
                }
                Event::ServeFailed(e) => {
                    if let Some(subscription) = signals.take() {
                        subscription.unsubscribe();
                    }
                    let error = self.record(GracefulError::Serve(Arc::new(e)));
                    self.phase = Phase::Stopping;
                    if let Err(drain_error) = self.drain().await {
                        tracing::warn!(error = %drain_error, "Drain after accept failure timed out");
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Stop accepting, drain, and close the listening socket.
    ///
    /// From `Serving` the before-stop hooks run first. After a successful
    /// [`reload`](Self::reload) this drains the handed-off generation
    /// without them. The after-stop hooks belong to the caller: the control
    /// loop fires them once this returns.
    pub async fn stop(&mut self) -> Result<(), GracefulError> {
        if self.phase == Phase::Reloading {
            tracing::info!(from = ?self.phase, to = ?Phase::Stopping, "Lifecycle transition");
            self.phase = Phase::Stopping;
        } else {
            self.enter_stop()?;
        }
        self.drain().await
    }

    fn enter_stop(&mut self) -> Result<(), GracefulError> {
        self.begin(Phase::Stopping)?;
        self.invoke_hooks(HookPoint::BeforeStop);
        Ok(())
    }

    /// Spawn the next generation with the listening socket. Does not drain;
    /// follow with [`stop`](Self::stop) to release this generation.
    ///
    /// On failure the error is recorded and this generation goes back to
    /// serving.
    pub fn reload(&mut self) -> Result<u32, GracefulError> {
        self.begin(Phase::Reloading)?;
        match self.spawn_replacement() {
            Ok(pid) => Ok(pid),
            Err(e) => {
                self.phase = Phase::Serving;
                Err(self.record(e))
            }
        }
    }

    fn spawn_replacement(&self) -> Result<u32, GracefulError> {
        let listener = self.listener.as_ref().ok_or(GracefulError::NotServing)?;

        let fd = listener.duplicate_fd().map_err(|e| {
            metrics::record_handoff("descriptor_error");
            GracefulError::Descriptor(Arc::new(e))
        })?;

        let spawn_error = |e: std::io::Error| {
            metrics::record_handoff("spawn_error");
            GracefulError::Spawn(Arc::new(e))
        };
        let spec = ChildSpec::for_current_process(fd).map_err(spawn_error)?;
        tracing::info!(program = ?spec.program, args = ?spec.args, "Starting replacement generation");
        let pid = self.spawner.spawn(spec).map_err(spawn_error)?;

        metrics::record_handoff("spawned");
        Ok(pid)
    }

    async fn drain(&mut self) -> Result<(), GracefulError> {
        let server = self.server.as_mut().ok_or(GracefulError::NotServing)?;
        let result = server.shutdown(self.grace_period).await;
        // The accept task has been joined, so this is the last reference in
        // this process.
        self.listener = None;
        self.phase = Phase::Terminated;
        let outcome = if result.is_ok() { "clean" } else { "timeout" };
        tracing::info!(outcome, "Generation drained");
        result.map_err(|e| self.record(e))
    }

    async fn next_event(&mut self, signals: &mut Option<SignalSubscription>) -> Event {
        let Some(server) = self.server.as_mut() else {
            return Event::ServeFailed(std::io::Error::other("server not started"));
        };

        tokio::select! {
            control = recv_signal(signals) => Event::Control(control),
            Some(control) = self.control_rx.recv() => Event::Control(control),
            error = server.serve_error() => Event::ServeFailed(error),
        }
    }

    fn begin(&mut self, next: Phase) -> Result<(), GracefulError> {
        match self.phase {
            Phase::Serving => {
                tracing::info!(from = ?self.phase, to = ?next, "Lifecycle transition");
                self.phase = next;
                Ok(())
            }
            Phase::Starting => Err(GracefulError::NotServing),
            Phase::Stopping | Phase::Reloading | Phase::Terminated => {
                Err(GracefulError::AlreadyTerminating)
            }
        }
    }

    fn invoke_hooks(&self, point: HookPoint) {
        let report = self.hooks.invoke(point);
        if report.failed > 0 {
            tracing::warn!(hook_point = %point, failed = report.failed, "Some lifecycle hooks failed");
        }
    }

    fn record(&mut self, error: GracefulError) -> GracefulError {
        if error.is_recordable() {
            self.last_error = Some(error.clone());
        }
        error
    }
}

impl Default for Graceful {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graceful {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graceful")
            .field("phase", &self.phase)
            .field("grace_period", &self.grace_period)
            .field("listener", &self.listener)
            .field("hooks", &self.hooks)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

async fn recv_signal(signals: &mut Option<SignalSubscription>) -> Control {
    match signals {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Serve `router` on `addr` with a default [`Graceful`] until stopped or
/// reloaded.
pub async fn listen_and_serve(addr: &str, router: Router) -> Result<Exit, GracefulError> {
    Graceful::new().listen_and_serve(addr, router).await
}

/// Run `server` with a default [`Graceful`] until stopped or reloaded.
pub async fn run_server(server: HttpServer) -> Result<Exit, GracefulError> {
    Graceful::new().run_server(server).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn quiet_config() -> LifecycleConfig {
        LifecycleConfig {
            handle_signals: false,
            grace_period_ms: 1_000,
            ..LifecycleConfig::default()
        }
    }

    fn local_server() -> HttpServer {
        HttpServer::new("127.0.0.1:0", Router::new())
    }

    struct FailingSpawner;

    impl Spawner for FailingSpawner {
        fn spawn(&self, _spec: ChildSpec) -> std::io::Result<u32> {
            Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
        }
    }

    #[derive(Default)]
    struct RecordingSpawner {
        specs: Mutex<Vec<(std::ffi::OsString, Vec<std::ffi::OsString>)>>,
    }

    impl Spawner for RecordingSpawner {
        fn spawn(&self, spec: ChildSpec) -> std::io::Result<u32> {
            self.specs.lock().unwrap().push((spec.program, spec.args));
            Ok(4242)
        }
    }

    #[tokio::test]
    async fn test_grace_period_defaults_to_ten_seconds() {
        let graceful = Graceful::new();
        assert_eq!(graceful.grace_period(), Duration::from_secs(10));
        assert_eq!(graceful.phase(), Phase::Starting);
    }

    #[tokio::test]
    async fn test_grace_period_is_fixed_once_started() {
        let mut graceful = Graceful::with_config(quiet_config());
        graceful.set_grace_period(Duration::from_millis(200)).unwrap();
        assert_eq!(graceful.grace_period(), Duration::from_millis(200));

        graceful.start(local_server()).await.unwrap();
        let err = graceful.set_grace_period(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, GracefulError::AlreadyStarted));
        assert_eq!(graceful.grace_period(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_rejected() {
        let mut graceful = Graceful::with_config(quiet_config());
        assert!(matches!(graceful.stop().await, Err(GracefulError::NotServing)));
        assert!(graceful.last_error().is_none());
    }

    #[tokio::test]
    async fn test_stop_and_reload_are_mutually_exclusive() {
        let mut graceful = Graceful::with_config(quiet_config())
            .with_spawner(Arc::new(RecordingSpawner::default()));
        graceful.start(local_server()).await.unwrap();

        graceful.stop().await.unwrap();
        assert_eq!(graceful.phase(), Phase::Terminated);
        assert!(matches!(graceful.reload(), Err(GracefulError::AlreadyTerminating)));
        assert!(matches!(graceful.stop().await, Err(GracefulError::AlreadyTerminating)));
        assert!(graceful.last_error().is_none());
    }

    #[tokio::test]
    async fn test_stop_after_reload_drains_without_stop_hooks() {
        let spawner = Arc::new(RecordingSpawner::default());
        let before_stop = Arc::new(AtomicUsize::new(0));
        let mut graceful = Graceful::with_config(quiet_config()).with_spawner(spawner.clone());
        let count = before_stop.clone();
        graceful.add_before_stop_hook(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        graceful.start(local_server()).await.unwrap();
        let addr = graceful.local_addr().unwrap();

        assert_eq!(graceful.reload().unwrap(), 4242);
        assert_eq!(graceful.phase(), Phase::Reloading);
        assert!(matches!(graceful.reload(), Err(GracefulError::AlreadyTerminating)));

        graceful.stop().await.unwrap();
        assert_eq!(graceful.phase(), Phase::Terminated);
        assert_eq!(before_stop.load(Ordering::SeqCst), 0);
        assert!(graceful.listener().is_none());
        assert_eq!(graceful.local_addr(), Some(addr));
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());

        assert!(matches!(graceful.stop().await, Err(GracefulError::AlreadyTerminating)));
        assert_eq!(spawner.specs.lock().unwrap().len(), 1);
        assert!(graceful.last_error().is_none());
    }

    #[tokio::test]
    async fn test_failed_spawn_is_recorded_and_keeps_serving() {
        let mut graceful =
            Graceful::with_config(quiet_config()).with_spawner(Arc::new(FailingSpawner));
        graceful.start(local_server()).await.unwrap();

        let err = graceful.reload().unwrap_err();
        assert!(matches!(err, GracefulError::Spawn(_)));
        assert!(matches!(graceful.last_error(), Some(GracefulError::Spawn(_))));
        assert_eq!(graceful.phase(), Phase::Serving);

        let addr = graceful.local_addr().unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());
        graceful.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_fires_before_stop_hooks_once() {
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let mut graceful = Graceful::with_config(quiet_config());
        let (b, a) = (before.clone(), after.clone());
        graceful
            .add_before_stop_hook(move || {
                b.fetch_add(1, Ordering::SeqCst);
            })
            .add_after_stop_hook(move || {
                a.fetch_add(1, Ordering::SeqCst);
            });

        graceful.start(local_server()).await.unwrap();
        graceful.stop().await.unwrap();

        assert_eq!(before.load(Ordering::SeqCst), 1);
        // After-stop hooks belong to the control loop.
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut graceful = Graceful::with_config(quiet_config());
        graceful.start(local_server()).await.unwrap();
        assert!(matches!(
            graceful.start(local_server()).await,
            Err(GracefulError::AlreadyStarted)
        ));
        graceful.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_surfaced() {
        let mut graceful = Graceful::with_config(quiet_config());
        let err = graceful
            .start(HttpServer::new("no-port-here", Router::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, GracefulError::Listener(_)));
        assert_eq!(graceful.phase(), Phase::Starting);
    }
}
