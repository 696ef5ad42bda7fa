//! Copyright (c) 2024-2025 Hyflux, Inc.
//!
//! This file is part of Hyflux
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU Affero General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU Affero General Public License for more details.
//!
//! You should have received a copy of the GNU Affero General Public License
//! along with this program.  If not, see <http://www.gnu.org/licenses/>.

use derivative::Derivative;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::config::args::ServiceArgs;
use crate::config::settings::Settings;
use crate::config::store::Config;
use crate::error::{Error, Result};
use crate::network::fd::{CONTROL_FD, LISTEN_FD_START};
use crate::network::listener::{ListenerHandle, ListenerSet};
use crate::observability::init_logging;

use super::counter::ConnectionCounter;
use super::monitor::{drain, DrainPolicy, StopStatus, SupervisorMonitor, DRAIN_POLL_INTERVAL};
use super::privilege::PrivilegeContext;
use super::runtime::raise_open_files_limit;

/// lifecycle callback, runs at most once
pub type Hook = Box<dyn FnOnce() + Send + 'static>;

/// custom listener shutdown, replaces closing the listeners directly
pub type OnStop = Box<dyn FnOnce(ListenerHandle) + Send + 'static>;

/// application callbacks around the worker lifecycle
#[derive(Derivative, Default)]
#[derivative(Debug)]
pub struct Hooks {
    /// runs before privileges are dropped
    #[derivative(Debug = "ignore")]
    pub on_pre_jail: Option<Hook>,
    /// runs after privileges are dropped, before accepting
    #[derivative(Debug = "ignore")]
    pub on_init: Option<Hook>,
    /// runs once after draining, before the process exits
    #[derivative(Debug = "ignore")]
    pub on_exit: Option<Hook>,
}

impl Hooks {
    pub fn new() -> Self {
        Hooks::default()
    }

    pub fn on_pre_jail(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_pre_jail = Some(Box::new(hook));
        self
    }

    pub fn on_init(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_init = Some(Box::new(hook));
        self
    }

    pub fn on_exit(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(hook));
        self
    }
}

/// where the listeners come from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// addresses given by the operator, bound by the worker
    Standalone,
    /// sockets inherited from the supervisor
    Supervised,
}

/// worker lifecycle states, `Stopped` is terminal
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Init,
    Configuring,
    PrivilegeDropping,
    AcquiringListeners,
    Running,
    Draining,
    Stopped,
}

/// lifecycle construction options
#[derive(Clone, Debug)]
pub struct LifecycleOptions {
    pub args: ServiceArgs,
    /// use this configuration instead of loading `args.conf_path`
    pub config: Option<Config>,
    pub control_fd: RawFd,
    pub listen_fd_start: RawFd,
    /// stop on SIGTERM, SIGINT or SIGQUIT in standalone mode
    pub handle_signals: bool,
    pub drain_poll_interval: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        LifecycleOptions {
            args: ServiceArgs::default(),
            config: None,
            control_fd: CONTROL_FD,
            listen_fd_start: LISTEN_FD_START,
            handle_signals: true,
            drain_poll_interval: DRAIN_POLL_INTERVAL,
        }
    }
}

impl LifecycleOptions {
    pub fn new(args: ServiceArgs) -> Self {
        LifecycleOptions {
            args,
            ..LifecycleOptions::default()
        }
    }

    /// options from the arguments this process was started with
    pub fn from_env() -> Self {
        Self::new(ServiceArgs::from_env())
    }
}

/// state shared between the coordinator and its background tasks
struct Shared {
    options: LifecycleOptions,
    settings: OnceCell<Arc<Settings>>,
    counter: ConnectionCounter,
    state: watch::Sender<LifecycleState>,
    stopping: AtomicBool,
    hooks: Mutex<Hooks>,
    on_stop: Mutex<Option<OnStop>>,
    listeners: OnceCell<ListenerHandle>,
    stop_trigger: Arc<watch::Sender<bool>>,
    completion: Mutex<Option<oneshot::Sender<StopStatus>>>,
}

impl Shared {
    fn set_state(&self, state: LifecycleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(?previous, current = ?state, "lifecycle state changed");
        }
    }

    fn run_hook<F>(&self, pick: F)
    where
        F: FnOnce(&mut Hooks) -> Option<Hook>,
    {
        let hook = {
            let mut hooks = self.hooks.lock();
            pick(&mut *hooks)
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    /// running -> draining, happens once whatever triggered it
    async fn begin_drain(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(LifecycleState::Draining);
        let on_stop = self.on_stop.lock().take();
        match (on_stop, self.listeners.get()) {
            (Some(on_stop), Some(handle)) => on_stop(handle.clone()),
            (None, Some(handle)) => {
                handle.close_all();
            }
            (_, None) => warn!("draining without listeners"),
        }
        let settings = self.settings.get().cloned().unwrap_or_default();
        let policy = DrainPolicy::from_settings(&settings)
            .with_poll_interval(self.options.drain_poll_interval);
        let status = drain(&self.counter, &policy).await;
        info!(?status, "drain finished");
        if let Some(completion) = self.completion.lock().take() {
            let _ = completion.send(status);
        }
    }
}

/// cheap handle used to request a graceful stop
#[derive(Clone, Debug)]
pub struct StopHandle {
    trigger: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// start draining, later calls do nothing
    pub fn stop(&self) {
        self.trigger.send_replace(true);
    }
}

/// coordinates configuration, privileges, listeners, supervision and drain
/// for one worker process
pub struct Lifecycle {
    shared: Arc<Shared>,
    initialized: AtomicBool,
    completion: Mutex<Option<oneshot::Receiver<StopStatus>>>,
    mode: OnceCell<RunMode>,
    status: OnceCell<StopStatus>,
}

impl Lifecycle {
    pub fn new(options: LifecycleOptions, hooks: Hooks) -> Self {
        let (state, _) = watch::channel(LifecycleState::Init);
        let (stop_trigger, _) = watch::channel(false);
        let (completion_send, completion_recv) = oneshot::channel();
        let shared = Shared {
            options,
            settings: OnceCell::new(),
            counter: ConnectionCounter::new(),
            state,
            stopping: AtomicBool::new(false),
            hooks: Mutex::new(hooks),
            on_stop: Mutex::new(None),
            listeners: OnceCell::new(),
            stop_trigger: Arc::new(stop_trigger),
            completion: Mutex::new(Some(completion_send)),
        };
        Lifecycle {
            shared: Arc::new(shared),
            initialized: AtomicBool::new(false),
            completion: Mutex::new(Some(completion_recv)),
            mode: OnceCell::new(),
            status: OnceCell::new(),
        }
    }

    /// load configuration, set up logging & raise the open files limit
    ///
    /// runs once, later calls return the settings loaded by the first one
    pub fn prepare(&self) -> Result<Arc<Settings>> {
        self.shared
            .settings
            .get_or_try_init(|| {
                self.shared.set_state(LifecycleState::Configuring);
                let options = &self.shared.options;
                let config = match &options.config {
                    Some(config) => config.clone(),
                    None => Config::load(&options.args.conf_path)?,
                };
                let settings = Settings::from_config(&config);
                init_logging(settings.log_path().as_deref(), options.args.verbose);
                raise_open_files_limit();
                info!(
                    args = %settings.master_args,
                    access_allow = %settings.access_allow,
                    socket_count = options.args.socket_count,
                    service_type = %options.args.service_type,
                    service = %options.args.service_name,
                    "configuration loaded"
                );
                Ok(Arc::new(settings))
            })
            .cloned()
    }

    /// acquire the listeners and bring the worker to `Running`
    ///
    /// non-empty `addresses` selects standalone mode, an empty one inherits
    /// the supervisor's descriptors. privileges are dropped after the
    /// listeners exist and before they are handed back
    pub async fn initialize(&self, addresses: &str, on_stop: Option<OnStop>) -> Result<ListenerSet> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }
        let settings = self.prepare()?;
        let options = &self.shared.options;

        // acquire listeners
        self.shared.set_state(LifecycleState::AcquiringListeners);
        let mode = if addresses.trim().is_empty() {
            RunMode::Supervised
        } else {
            RunMode::Standalone
        };
        let listeners = match mode {
            RunMode::Standalone => ListenerSet::bind(addresses).await,
            RunMode::Supervised => {
                ListenerSet::inherit(options.listen_fd_start, options.args.socket_count)
            }
        }
        .map_err(|e| {
            error!(?mode, "acquire listeners failed: {e}");
            e
        })?;
        let _ = self.mode.set(mode);

        // drop privileges
        self.shared.run_hook(|hooks| hooks.on_pre_jail.take());
        self.shared.set_state(LifecycleState::PrivilegeDropping);
        PrivilegeContext::new(&options.args, &settings).apply();
        self.shared.run_hook(|hooks| hooks.on_init.take());

        let _ = self.shared.listeners.set(listeners.handle());
        *self.shared.on_stop.lock() = on_stop;

        // watch for the stop trigger
        let monitor = match mode {
            RunMode::Supervised => Some(SupervisorMonitor::open(options.control_fd)?),
            RunMode::Standalone => None,
        };
        let handle_signals = options.handle_signals && mode == RunMode::Standalone;
        let shared = Arc::clone(&self.shared);
        let mut trigger = self.shared.stop_trigger.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = supervisor_gone(monitor) => {}
                _ = trigger.wait_for(|stop| *stop) => info!("stop requested"),
                _ = stop_signal(handle_signals) => {}
            }
            shared.begin_drain().await;
        });

        self.shared.set_state(LifecycleState::Running);
        info!(?mode, listeners = listeners.len(), "service started");
        Ok(listeners)
    }

    /// wait until draining finished, run the exit hook and report how it ended
    pub async fn wait(&self) -> StopStatus {
        let completion = self.completion.lock().take();
        let status = match completion {
            Some(completion) => completion.await.unwrap_or(StopStatus::Forced),
            None => {
                let mut state = self.shared.state.subscribe();
                let _ = state.wait_for(|s| *s == LifecycleState::Stopped).await;
                return self.status.get().copied().unwrap_or(StopStatus::Forced);
            }
        };
        let _ = self.status.set(status);
        self.shared.run_hook(|hooks| hooks.on_exit.take());
        self.shared.set_state(LifecycleState::Stopped);
        match status {
            StopStatus::Normal => info!("service stopped normal"),
            StopStatus::Forced => warn!("service stopped abnormal"),
        }
        status
    }

    /// handle to request a graceful stop
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            trigger: Arc::clone(&self.shared.stop_trigger),
        }
    }

    /// the live connection counter service adapters report to
    pub fn counter(&self) -> ConnectionCounter {
        self.shared.counter.clone()
    }

    pub fn settings(&self) -> Option<Arc<Settings>> {
        self.shared.settings.get().cloned()
    }

    pub fn run_mode(&self) -> Option<RunMode> {
        self.mode.get().copied()
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.shared.state.subscribe()
    }

    /// true once draining has begun
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }
}

async fn supervisor_gone(monitor: Option<SupervisorMonitor>) {
    match monitor {
        Some(monitor) => monitor.wait_disconnect().await,
        None => futures::future::pending().await,
    }
}

/// resolves on the first shutdown signal, never when disabled
async fn stop_signal(enabled: bool) {
    if !enabled {
        return futures::future::pending().await;
    }
    let signals = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::quit()),
    );
    let (mut terminate, mut interrupt, mut quit) = match signals {
        (Ok(terminate), Ok(interrupt), Ok(quit)) => (terminate, interrupt, quit),
        _ => {
            error!("failed to install signal handlers");
            return futures::future::pending().await;
        }
    };
    tokio::select! {
        _ = terminate.recv() => info!("SIGTERM: graceful shutdown"),
        _ = interrupt.recv() => info!("SIGINT: graceful shutdown"),
        _ = quit.recv() => info!("SIGQUIT: graceful shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn options(config: &str) -> LifecycleOptions {
        LifecycleOptions {
            config: Some(Config::parse(config)),
            handle_signals: false,
            drain_poll_interval: Duration::from_millis(20),
            ..LifecycleOptions::default()
        }
    }

    #[test]
    fn prepare_loads_configuration_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"app_wait_limit = 3\n").unwrap();
        let args = ServiceArgs {
            conf_path: file.path().to_string_lossy().into_owned(),
            ..ServiceArgs::default()
        };
        let lifecycle = Lifecycle::new(LifecycleOptions::new(args), Hooks::new());
        let first = lifecycle.prepare().unwrap();
        std::io::Write::write_all(&mut file, b"app_wait_limit = 7\n").unwrap();
        let second = lifecycle.prepare().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.wait_limit, 3);
        assert_eq!(lifecycle.state(), LifecycleState::Configuring);
    }

    #[tokio::test]
    async fn initialize_twice_is_rejected() {
        let lifecycle = Lifecycle::new(options(""), Hooks::new());
        let listeners = lifecycle.initialize("127.0.0.1:0", None).await.unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(lifecycle.run_mode(), Some(RunMode::Standalone));
        assert_eq!(lifecycle.state(), LifecycleState::Running);
        let err = lifecycle.initialize("127.0.0.1:0", None).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized));
    }

    #[tokio::test]
    async fn hooks_run_once_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (order.clone(), order.clone(), order.clone());
        let hooks = Hooks::new()
            .on_pre_jail(move || a.lock().push("pre_jail"))
            .on_init(move || b.lock().push("init"))
            .on_exit(move || c.lock().push("exit"));
        let lifecycle = Lifecycle::new(options(""), hooks);
        let _listeners = lifecycle.initialize("127.0.0.1:0", None).await.unwrap();
        assert_eq!(*order.lock(), vec!["pre_jail", "init"]);
        lifecycle.stop_handle().stop();
        assert_eq!(lifecycle.wait().await, StopStatus::Normal);
        assert_eq!(lifecycle.wait().await, StopStatus::Normal);
        assert_eq!(*order.lock(), vec!["pre_jail", "init", "exit"]);
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn listeners_exist_before_pre_jail_hook() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jail.sock");
        let reached = Arc::new(AtomicUsize::new(0));
        let hooks = {
            let (pre_jail, init) = (reached.clone(), reached.clone());
            let (jail_path, init_path) = (path.clone(), path.clone());
            Hooks::new()
                .on_pre_jail(move || {
                    if std::os::unix::net::UnixStream::connect(&jail_path).is_ok() {
                        pre_jail.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .on_init(move || {
                    if std::os::unix::net::UnixStream::connect(&init_path).is_ok() {
                        init.fetch_add(1, Ordering::SeqCst);
                    }
                })
        };
        let lifecycle = Lifecycle::new(options(""), hooks);
        let listeners = lifecycle
            .initialize(path.to_str().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(reached.load(Ordering::SeqCst), 2);
        // both hook connections wait in the backlog
        let endpoint = listeners.into_endpoints().remove(0);
        assert!(endpoint.accept_stream().await.is_ok());
        assert!(endpoint.accept_stream().await.is_ok());
    }

    #[tokio::test]
    async fn failed_acquisition_reports_error() {
        let lifecycle = Lifecycle::new(options(""), Hooks::new());
        let err = lifecycle
            .initialize("127.0.0.1:99999", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoListeners));
    }

    #[tokio::test]
    async fn custom_on_stop_replaces_listener_close() {
        let calls = Arc::new(AtomicUsize::new(0));
        let open_on_entry = Arc::new(AtomicBool::new(false));
        let (seen, open) = (calls.clone(), open_on_entry.clone());
        let on_stop: OnStop = Box::new(move |handle| {
            seen.fetch_add(1, Ordering::SeqCst);
            open.store(!handle.is_closed(), Ordering::SeqCst);
            handle.close_all();
        });
        let lifecycle = Lifecycle::new(options(""), Hooks::new());
        let listeners = lifecycle.initialize("127.0.0.1:0", Some(on_stop)).await.unwrap();
        let handle = listeners.handle();
        lifecycle.stop_handle().stop();
        lifecycle.stop_handle().stop();
        lifecycle.wait().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(open_on_entry.load(Ordering::SeqCst));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn stop_closes_listeners_before_draining() {
        let lifecycle = Lifecycle::new(options(""), Hooks::new());
        let listeners = lifecycle.initialize("127.0.0.1:0", None).await.unwrap();
        let handle = listeners.handle();
        let guard = lifecycle.counter().track();
        let mut state = lifecycle.subscribe_state();
        lifecycle.stop_handle().stop();
        state
            .wait_for(|s| *s == LifecycleState::Draining)
            .await
            .unwrap();
        assert!(lifecycle.is_stopping());
        // a live connection keeps the worker draining
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.is_closed());
        assert_eq!(lifecycle.state(), LifecycleState::Draining);
        drop(guard);
        assert_eq!(lifecycle.wait().await, StopStatus::Normal);
    }
}
