//! Process supervision.
//!
//! The `Supervisor` owns every service definition and the single live process
//! handle per service. It gates spawns on dependencies, probes readiness,
//! narrates everything into the `LogStore`, and publishes a `StateChange` for
//! every lifecycle transition.
//!
//! All bookkeeping sits behind one mutex per supervisor. Spawning, killing and
//! restarting a given service is additionally serialized by a per-service async
//! lock, so a new handle is only created after the previous one's exit has been
//! observed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{lock, subscribe, StateChange, Subscribers, Subscription};
use crate::log_store::LogStore;
use crate::process::{BoxedReader, ChildProcess, ExitOutcome, KillSignal, Launcher, OsLauncher};
use crate::ready::{self, ReadyError};
use crate::service::{ProcessState, ServiceDefinition, ServiceFlags};

// How long output readers may keep draining after the process exits.
const READER_DRAIN: Duration = Duration::from_secs(1);

/// Tunables for the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// How often a dependency wait re-checks its dependencies.
    pub dependency_poll: Duration,
    /// Give up waiting for dependencies after this long. `None` waits forever.
    pub dependency_timeout: Option<Duration>,
    /// Grace period between a terminate request and a forced kill.
    pub kill_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            dependency_poll: Duration::from_millis(500),
            dependency_timeout: None,
            kill_timeout: Duration::from_millis(5000),
        }
    }
}

/// Point-in-time view of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ProcessState,
    pub color: String,
    pub flags: ServiceFlags,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    Restart,
    Stop,
}

struct LiveHandle {
    generation: u64,
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<KillSignal>,
    exited: watch::Receiver<Option<ExitOutcome>>,
    kill_reason: Option<KillReason>,
    // Cancelled once this generation exits, so its readiness probe stops.
    probe: CancellationToken,
}

impl LiveHandle {
    // Asks the watcher task to terminate the child and returns its exit notification.
    fn request_kill(&mut self, reason: KillReason) -> watch::Receiver<Option<ExitOutcome>> {
        self.kill_reason = Some(reason);
        let _ = self.kill_tx.send(KillSignal::Terminate);
        self.exited.clone()
    }
}

struct ServiceSlot {
    state: ProcessState,
    flags: ServiceFlags,
    color: String,
    cancel: CancellationToken,
    generation: u64,
    handle: Option<LiveHandle>,
}

enum DependencyWait {
    Cancelled,
    TimedOut(Vec<String>),
}

struct Inner {
    definitions: Vec<ServiceDefinition>,
    log_store: LogStore,
    launcher: Arc<dyn Launcher>,
    options: SupervisorOptions,
    services: Mutex<HashMap<String, ServiceSlot>>,
    lifecycles: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    state_subscribers: Arc<Mutex<Subscribers<StateChange>>>,
}

/// Cheaply clonable handle to one supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Creates a supervisor that launches real OS processes.
    pub fn new(
        definitions: Vec<ServiceDefinition>,
        log_store: LogStore,
        options: SupervisorOptions,
    ) -> Self {
        Self::with_launcher(definitions, log_store, options, Arc::new(OsLauncher))
    }

    pub fn with_launcher(
        definitions: Vec<ServiceDefinition>,
        log_store: LogStore,
        options: SupervisorOptions,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let mut services = HashMap::new();
        let mut lifecycles = HashMap::new();
        for definition in &definitions {
            services
                .entry(definition.name.clone())
                .or_insert_with(|| ServiceSlot {
                    state: ProcessState::Pending,
                    flags: ServiceFlags::default(),
                    color: definition.color.clone(),
                    cancel: CancellationToken::new(),
                    generation: 0,
                    handle: None,
                });
            lifecycles
                .entry(definition.name.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())));
        }
        Self {
            inner: Arc::new(Inner {
                definitions,
                log_store,
                launcher,
                options,
                services: Mutex::new(services),
                lifecycles,
                state_subscribers: Arc::default(),
            }),
        }
    }

    pub fn log_store(&self) -> &LogStore {
        &self.inner.log_store
    }

    pub fn definitions(&self) -> &[ServiceDefinition] {
        &self.inner.definitions
    }

    pub fn service_names(&self) -> Vec<String> {
        self.inner
            .definitions
            .iter()
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn state(&self, name: &str) -> Option<ProcessState> {
        lock(&self.inner.services).get(name).map(|slot| slot.state)
    }

    pub fn color(&self, name: &str) -> Option<String> {
        lock(&self.inner.services)
            .get(name)
            .map(|slot| slot.color.clone())
    }

    pub fn pid(&self, name: &str) -> Option<u32> {
        lock(&self.inner.services)
            .get(name)
            .and_then(|slot| slot.handle.as_ref())
            .and_then(|handle| handle.pid)
    }

    /// Whether a process handle is currently live for `name`.
    pub fn is_running(&self, name: &str) -> bool {
        lock(&self.inner.services)
            .get(name)
            .map(|slot| slot.handle.is_some())
            .unwrap_or(false)
    }

    /// Flags for `name`, or the defaults for an unknown service.
    pub fn get_service_flags(&self, name: &str) -> ServiceFlags {
        lock(&self.inner.services)
            .get(name)
            .map(|slot| slot.flags)
            .unwrap_or_default()
    }

    /// Flags of every service, keyed by name.
    pub fn all_flags(&self) -> HashMap<String, ServiceFlags> {
        lock(&self.inner.services)
            .iter()
            .map(|(name, slot)| (name.clone(), slot.flags))
            .collect()
    }

    /// Snapshot of every service in definition order.
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        let services = lock(&self.inner.services);
        self.inner
            .definitions
            .iter()
            .filter_map(|definition| {
                services.get(&definition.name).map(|slot| ServiceStatus {
                    name: definition.name.clone(),
                    state: slot.state,
                    color: slot.color.clone(),
                    flags: slot.flags,
                    pid: slot.handle.as_ref().and_then(|h| h.pid),
                })
            })
            .collect()
    }

    pub fn subscribe_states(&self) -> Subscription<StateChange> {
        subscribe(&self.inner.state_subscribers)
    }

    pub fn toggle_mute(&self, name: &str) -> bool {
        let mut services = lock(&self.inner.services);
        let Some(slot) = services.get_mut(name) else {
            return false;
        };
        slot.flags.mute = !slot.flags.mute;
        let word = if slot.flags.mute { "muted" } else { "unmuted" };
        self.inner
            .log_store
            .add_system_log(format!("{} is now {}.", name, word));
        true
    }

    pub fn toggle_solo(&self, name: &str) -> bool {
        let mut services = lock(&self.inner.services);
        let Some(slot) = services.get_mut(name) else {
            return false;
        };
        slot.flags.solo = !slot.flags.solo;
        let word = if slot.flags.solo { "solo" } else { "unsolo" };
        self.inner
            .log_store
            .add_system_log(format!("{} is now {}.", name, word));
        true
    }

    /// Issues a start for every service in definition order without waiting on any of them.
    pub fn start_all(&self) -> Vec<JoinHandle<()>> {
        self.inner
            .definitions
            .iter()
            .map(|definition| {
                self.inner
                    .log_store
                    .add_system_log(format!("Starting {}...", definition.name));
                let supervisor = self.clone();
                let name = definition.name.clone();
                tokio::spawn(async move { supervisor.start(&name).await })
            })
            .collect()
    }

    /// Waits for dependencies, spawns the service and probes its readiness.
    ///
    /// Resolves once the service is healthy, has failed, or the attempt was
    /// superseded by a restart or stop.
    pub async fn start(&self, name: &str) {
        let Some(definition) = self.definition(name) else {
            self.inner
                .log_store
                .add_system_log(format!("Configuration for {} not found.", name));
            return;
        };
        let cancel = match lock(&self.inner.services).get(name) {
            Some(slot) => slot.cancel.clone(),
            None => return,
        };
        self.run_pipeline(definition, cancel).await;
    }

    /// Kills the live handle (if any), waits for its exit, then starts again.
    pub async fn restart(&self, name: &str) {
        let Some(definition) = self.definition(name) else {
            self.inner
                .log_store
                .add_system_log(format!("Configuration for {} not found.", name));
            return;
        };
        self.inner
            .log_store
            .add_system_log(format!("Restarting process {}...", name));
        let Some(cancel) = self.replace_token(name) else {
            return;
        };

        {
            let Some(lifecycle) = self.inner.lifecycles.get(name) else {
                return;
            };
            let _guard = lifecycle.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            if let Some(mut exited) = self.kill_live(name, KillReason::Restart) {
                let _ = exited.wait_for(|outcome| outcome.is_some()).await;
            }
            if cancel.is_cancelled() {
                return;
            }
            self.set_state(name, ProcessState::Restarting);
        }

        self.run_pipeline(definition, cancel).await;
    }

    /// Cancels pending work for `name`, kills its live handle and waits for the exit.
    pub async fn stop(&self, name: &str) {
        if self.definition(name).is_none() {
            self.inner
                .log_store
                .add_system_log(format!("Configuration for {} not found.", name));
            return;
        }
        self.inner
            .log_store
            .add_system_log(format!("Stopping process {}...", name));
        let Some(cancel) = self.replace_token(name) else {
            return;
        };
        let Some(lifecycle) = self.inner.lifecycles.get(name) else {
            return;
        };
        let _guard = lifecycle.lock().await;
        if cancel.is_cancelled() {
            return;
        }
        match self.kill_live(name, KillReason::Stop) {
            Some(mut exited) => {
                let _ = exited.wait_for(|outcome| outcome.is_some()).await;
            }
            None => self.set_state(name, ProcessState::Stopped),
        }
    }

    /// Best-effort teardown of every live process. Never fails.
    pub async fn cleanup(&self) {
        let pending: Vec<(String, watch::Receiver<Option<ExitOutcome>>)> = {
            let mut services = lock(&self.inner.services);
            services
                .iter_mut()
                .filter_map(|(name, slot)| {
                    slot.cancel.cancel();
                    slot.handle
                        .as_mut()
                        .map(|handle| (name.clone(), handle.request_kill(KillReason::Stop)))
                })
                .collect()
        };

        let budget = self.inner.options.kill_timeout + Duration::from_secs(2);
        for (name, mut exited) in pending {
            let waited =
                tokio::time::timeout(budget, exited.wait_for(|outcome| outcome.is_some())).await;
            if waited.is_err() {
                warn!("{} did not exit during cleanup", name);
            }
        }
    }

    fn definition(&self, name: &str) -> Option<ServiceDefinition> {
        self.inner
            .definitions
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    // Cancels the current token so stale waits and probes stop, and installs a fresh one.
    fn replace_token(&self, name: &str) -> Option<CancellationToken> {
        let mut services = lock(&self.inner.services);
        let slot = services.get_mut(name)?;
        slot.cancel.cancel();
        slot.cancel = CancellationToken::new();
        Some(slot.cancel.clone())
    }

    fn kill_live(
        &self,
        name: &str,
        reason: KillReason,
    ) -> Option<watch::Receiver<Option<ExitOutcome>>> {
        let mut services = lock(&self.inner.services);
        let slot = services.get_mut(name)?;
        let exited = slot.handle.as_mut()?.request_kill(reason);
        self.transition(name, slot, ProcessState::Stopping);
        Some(exited)
    }

    fn set_state(&self, name: &str, state: ProcessState) {
        let mut services = lock(&self.inner.services);
        if let Some(slot) = services.get_mut(name) {
            self.transition(name, slot, state);
        }
    }

    fn transition(&self, name: &str, slot: &mut ServiceSlot, state: ProcessState) {
        if slot.state == state {
            return;
        }
        debug!("{}: {} -> {}", name, slot.state, state);
        slot.state = state;
        lock(&self.inner.state_subscribers).publish(StateChange {
            service: name.to_string(),
            state,
        });
    }

    async fn run_pipeline(&self, definition: ServiceDefinition, cancel: CancellationToken) {
        let name = definition.name.as_str();
        let log_store = &self.inner.log_store;

        if !definition.depends_on.is_empty() {
            log_store.add_log(
                name,
                format!(
                    "Waiting for dependencies: {}",
                    definition.depends_on.join(", ")
                ),
            );
            match self.wait_for_dependencies(&definition, &cancel).await {
                Ok(()) => {
                    log_store.add_log(name, "Dependencies are ready.");
                }
                Err(DependencyWait::Cancelled) => return,
                Err(DependencyWait::TimedOut(missing)) => {
                    log_store.add_log(
                        name,
                        format!("Dependency wait timed out: {}", missing.join(", ")),
                    );
                    self.set_state(name, ProcessState::Failed);
                    return;
                }
            }
        }

        let Some((generation, probe)) = self.spawn(&definition, &cancel).await else {
            return;
        };

        let Some(check) = &definition.ready_check else {
            return;
        };
        if probe.is_cancelled() {
            return;
        }
        log_store.add_log(name, "Performing ready check...");
        let result = ready::wait_until_ready(check, &probe).await;

        let mut services = lock(&self.inner.services);
        let Some(slot) = services.get_mut(name) else {
            return;
        };
        if probe.is_cancelled() || slot.generation != generation {
            return;
        }
        match result {
            Ok(()) => {
                log_store.add_log(name, "Ready check passed.");
                if slot.state == ProcessState::Starting {
                    self.transition(name, slot, ProcessState::Healthy);
                }
            }
            Err(ReadyError::Cancelled) => {}
            Err(err) => {
                // The process is left running; only its status reflects the failure.
                log_store.add_log(name, format!("Ready check failed: {}", err));
                if slot.state == ProcessState::Starting {
                    self.transition(name, slot, ProcessState::Failed);
                }
            }
        }
    }

    async fn wait_for_dependencies(
        &self,
        definition: &ServiceDefinition,
        cancel: &CancellationToken,
    ) -> Result<(), DependencyWait> {
        let poll = self.inner.options.dependency_poll;
        let deadline = self
            .inner
            .options
            .dependency_timeout
            .map(|timeout| Instant::now() + timeout);
        let mut last_missing = definition.depends_on.clone();

        loop {
            let missing = self.unhealthy(&definition.depends_on);
            if missing.is_empty() {
                return Ok(());
            }
            if missing != last_missing {
                self.inner.log_store.add_log(
                    &definition.name,
                    format!("Waiting for dependencies: {}", missing.join(", ")),
                );
                last_missing = missing.clone();
            }
            let mut tick = Instant::now() + poll;
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(DependencyWait::TimedOut(missing));
                }
                tick = tick.min(deadline);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(DependencyWait::Cancelled),
                _ = tokio::time::sleep_until(tick) => {}
            }
        }
    }

    fn unhealthy(&self, deps: &[String]) -> Vec<String> {
        let services = lock(&self.inner.services);
        deps.iter()
            .filter(|dep| {
                services.get(dep.as_str()).map(|slot| slot.state) != Some(ProcessState::Healthy)
            })
            .cloned()
            .collect()
    }

    // Spawns under the service's lifecycle lock. Returns the new generation and
    // the token its readiness probe runs under.
    async fn spawn(
        &self,
        definition: &ServiceDefinition,
        cancel: &CancellationToken,
    ) -> Option<(u64, CancellationToken)> {
        let name = definition.name.as_str();
        let lifecycle = self.inner.lifecycles.get(name)?;
        let _guard = lifecycle.lock().await;
        if cancel.is_cancelled() {
            return None;
        }

        let log_store = &self.inner.log_store;
        let mut services = lock(&self.inner.services);
        let slot = services.get_mut(name)?;
        if slot.handle.is_some() {
            log_store.add_log(name, format!("{} is already running.", name));
            return None;
        }
        self.transition(name, slot, ProcessState::Starting);

        let launched = match self.inner.launcher.launch(definition) {
            Ok(launched) => launched,
            Err(err) => {
                log_store.add_log(name, format!("Failed to start: {}", err));
                self.transition(name, slot, ProcessState::Failed);
                return None;
            }
        };
        slot.generation += 1;
        let generation = slot.generation;
        debug!(
            "spawned {} ({}) pid={:?}",
            name,
            definition.command_line(),
            launched.pid
        );

        let mut readers = Vec::new();
        if let Some(stdout) = launched.stdout {
            readers.push(tokio::spawn(forward_output(
                log_store.clone(),
                name.to_string(),
                stdout,
                false,
            )));
        }
        if let Some(stderr) = launched.stderr {
            readers.push(tokio::spawn(forward_output(
                log_store.clone(),
                name.to_string(),
                stderr,
                true,
            )));
        }

        let probe = cancel.child_token();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise_child(
            self.clone(),
            name.to_string(),
            generation,
            launched.child,
            kill_rx,
            readers,
            exit_tx,
        ));
        slot.handle = Some(LiveHandle {
            generation,
            pid: launched.pid,
            kill_tx,
            exited: exit_rx,
            kill_reason: None,
            probe: probe.clone(),
        });

        if definition.ready_check.is_none() {
            log_store.add_log(name, "No ready check defined; marking as healthy.");
            self.transition(name, slot, ProcessState::Healthy);
        }
        Some((generation, probe))
    }

    fn on_exit(&self, name: &str, generation: u64, outcome: ExitOutcome) {
        let mut services = lock(&self.inner.services);
        let Some(slot) = services.get_mut(name) else {
            return;
        };
        self.inner.log_store.add_log(name, outcome.to_string());
        let current = slot
            .handle
            .as_ref()
            .map(|handle| handle.generation == generation)
            .unwrap_or(false);
        if !current {
            return;
        }
        let reason = slot.handle.take().and_then(|handle| {
            handle.probe.cancel();
            handle.kill_reason
        });
        match reason {
            // The restart in progress owns the state from here on.
            Some(KillReason::Restart) => {}
            Some(KillReason::Stop) => self.transition(name, slot, ProcessState::Stopped),
            None if outcome.is_failure() => self.transition(name, slot, ProcessState::Failed),
            None => self.transition(name, slot, ProcessState::Stopped),
        }
    }
}

// Owns the child until it exits: relays kill requests, escalates to a forced
// kill after the grace period, then reports the exit.
async fn supervise_child(
    supervisor: Supervisor,
    name: String,
    generation: u64,
    mut child: Box<dyn ChildProcess>,
    mut kill_rx: mpsc::UnboundedReceiver<KillSignal>,
    readers: Vec<JoinHandle<()>>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    let log_store = supervisor.inner.log_store.clone();
    let kill_timeout = supervisor.inner.options.kill_timeout;
    let mut escalate_at: Option<Instant> = None;

    let result = loop {
        tokio::select! {
            result = child.wait() => break result,
            Some(signal) = kill_rx.recv() => {
                if let Err(err) = child.signal(signal) {
                    log_store.add_system_log(format!("Error killing {}: {}", name, err));
                }
                if signal == KillSignal::Terminate && escalate_at.is_none() {
                    escalate_at = Some(Instant::now() + kill_timeout);
                }
            }
            _ = tokio::time::sleep_until(escalate_at.unwrap_or_else(Instant::now)), if escalate_at.is_some() => {
                escalate_at = None;
                if let Err(err) = child.signal(KillSignal::Kill) {
                    log_store.add_system_log(format!("Error killing {}: {}", name, err));
                }
            }
        }
    };

    for reader in readers {
        let _ = tokio::time::timeout(READER_DRAIN, reader).await;
    }

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            log_store.add_system_log(format!("Failed to wait for {}: {}", name, err));
            ExitOutcome::default()
        }
    };
    supervisor.on_exit(&name, generation, outcome);
    let _ = exit_tx.send(Some(outcome));
}

// Splits a stream into lines, drops blank ones and tags stderr.
async fn forward_output(log_store: LogStore, name: String, reader: BoxedReader, is_stderr: bool) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if line.trim().is_empty() {
                    continue;
                }
                if is_stderr {
                    log_store.add_log(&name, format!("ERROR: {}", line));
                } else {
                    log_store.add_log(&name, line);
                }
            }
            Err(err) => {
                debug!("output stream of {} closed: {}", name, err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::process::LaunchedProcess;
    use crate::service::ReadyCheck;

    fn sh(name: &str, script: &str) -> ServiceDefinition {
        ServiceDefinition::new(name, "sh", vec!["-c".into(), script.into()])
    }

    fn texts(store: &LogStore, process: &str) -> Vec<String> {
        store
            .get_logs()
            .into_iter()
            .filter(|e| e.process == process)
            .map(|e| e.text)
            .collect()
    }

    fn position(store: &LogStore, process: &str, text: &str) -> Option<u64> {
        store
            .get_logs()
            .into_iter()
            .find(|e| e.process == process && e.text.contains(text))
            .map(|e| e.index)
    }

    async fn wait_for_state(supervisor: &Supervisor, name: &str, state: ProcessState) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while supervisor.state(name) != Some(state) {
            assert!(
                Instant::now() < deadline,
                "{} stuck in {:?} waiting for {:?}",
                name,
                supervisor.state(name),
                state
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_log(store: &LogStore, process: &str, text: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while position(store, process, text).is_none() {
            assert!(Instant::now() < deadline, "no {:?} log from {}", text, process);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn services_without_dependencies_settle() {
        let store = LogStore::new();
        let supervisor = Supervisor::new(
            vec![
                ServiceDefinition::new("ok", "true", Vec::new()),
                sh("bad", "exit 3"),
                ServiceDefinition::new("ghost", "/definitely/not/here", Vec::new()),
            ],
            store.clone(),
            SupervisorOptions::default(),
        );
        supervisor.start_all();

        wait_for_state(&supervisor, "ok", ProcessState::Stopped).await;
        wait_for_state(&supervisor, "bad", ProcessState::Failed).await;
        wait_for_state(&supervisor, "ghost", ProcessState::Failed).await;

        assert!(texts(&store, "ok").contains(&"exited with code 0".to_string()));
        assert!(texts(&store, "bad").contains(&"exited with code 3".to_string()));
        assert!(texts(&store, "ghost")
            .iter()
            .any(|t| t.starts_with("Failed to start:")));
        assert!(texts(&store, "SYSTEM").contains(&"Starting ok...".to_string()));
        for status in supervisor.statuses() {
            assert!(status.state.is_settled());
            assert_eq!(status.pid, None);
        }
    }

    #[tokio::test]
    async fn dependent_waits_for_healthy_dependency() {
        let store = LogStore::new();
        let a = ServiceDefinition::new("a", "sleep", vec!["30".into()]).with_ready_check(
            ReadyCheck::command("true")
                .interval(Duration::from_millis(200))
                .timeout(Duration::from_secs(5)),
        );
        let b = sh("b", "echo b-started; sleep 30").with_depends_on(&["a"]);
        let supervisor = Supervisor::new(
            vec![b, a],
            store.clone(),
            SupervisorOptions {
                dependency_poll: Duration::from_millis(20),
                ..SupervisorOptions::default()
            },
        );
        let mut states = supervisor.subscribe_states();
        supervisor.start_all();

        wait_for_log(&store, "b", "b-started").await;
        let ready = position(&store, "a", "Ready check passed.").unwrap();
        let started = position(&store, "b", "b-started").unwrap();
        assert!(ready < started);

        let mut order = Vec::new();
        while let Some(change) = states.try_recv() {
            order.push((change.service, change.state));
        }
        let a_healthy = order
            .iter()
            .position(|c| *c == ("a".to_string(), ProcessState::Healthy))
            .unwrap();
        let b_starting = order
            .iter()
            .position(|c| *c == ("b".to_string(), ProcessState::Starting))
            .unwrap();
        assert!(a_healthy < b_starting);

        supervisor.cleanup().await;
        assert_eq!(supervisor.state("a"), Some(ProcessState::Stopped));
        assert_eq!(supervisor.state("b"), Some(ProcessState::Stopped));
    }

    #[tokio::test]
    async fn dependency_timeout_marks_service_failed() {
        let store = LogStore::new();
        let supervisor = Supervisor::new(
            vec![ServiceDefinition::new("b", "true", Vec::new()).with_depends_on(&["missing"])],
            store.clone(),
            SupervisorOptions {
                dependency_poll: Duration::from_millis(10),
                dependency_timeout: Some(Duration::from_millis(100)),
                ..SupervisorOptions::default()
            },
        );
        supervisor.start("b").await;
        assert_eq!(supervisor.state("b"), Some(ProcessState::Failed));
        assert!(texts(&store, "b").contains(&"Dependency wait timed out: missing".to_string()));
        assert!(!supervisor.is_running("b"));
    }

    #[tokio::test]
    async fn ready_check_timeout_fails_but_leaves_process_running() {
        let store = LogStore::new();
        let supervisor = Supervisor::new(
            vec![
                ServiceDefinition::new("slow", "sleep", vec!["30".into()]).with_ready_check(
                    ReadyCheck::command("false")
                        .interval(Duration::from_millis(20))
                        .timeout(Duration::from_millis(200)),
                ),
            ],
            store.clone(),
            SupervisorOptions::default(),
        );
        supervisor.start("slow").await;

        assert_eq!(supervisor.state("slow"), Some(ProcessState::Failed));
        assert!(texts(&store, "slow").contains(&"Ready check failed: Ready check timed out".to_string()));
        assert!(supervisor.is_running("slow"));
        assert!(supervisor.pid("slow").is_some());

        supervisor.cleanup().await;
        assert!(!supervisor.is_running("slow"));
        assert_eq!(supervisor.state("slow"), Some(ProcessState::Stopped));
    }

    #[tokio::test]
    async fn exit_during_ready_check_ends_the_probe() {
        let store = LogStore::new();
        let supervisor = Supervisor::new(
            vec![sh("brief", "sleep 0.2").with_ready_check(
                ReadyCheck::command("false")
                    .interval(Duration::from_millis(20))
                    .timeout(Duration::from_secs(20)),
            )],
            store.clone(),
            SupervisorOptions::default(),
        );
        let started = Instant::now();
        supervisor.start("brief").await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(supervisor.state("brief"), Some(ProcessState::Stopped));
        let lines = texts(&store, "brief");
        assert!(lines.contains(&"exited with code 0".to_string()));
        assert!(lines.iter().all(|l| !l.starts_with("Ready check")));
    }

    #[tokio::test]
    async fn output_lines_are_split_trimmed_and_tagged() {
        let store = LogStore::new();
        let supervisor = Supervisor::new(
            vec![sh("chatty", "echo out; echo err 1>&2; echo; echo '   '; printf 'tail  '")],
            store.clone(),
            SupervisorOptions::default(),
        );
        supervisor.start("chatty").await;
        wait_for_state(&supervisor, "chatty", ProcessState::Stopped).await;

        let lines = texts(&store, "chatty");
        assert!(lines.contains(&"out".to_string()));
        assert!(lines.contains(&"ERROR: err".to_string()));
        assert!(lines.contains(&"tail".to_string()));
        assert!(lines.iter().all(|l| !l.trim().is_empty()));
        let exit = lines.iter().position(|l| l == "exited with code 0").unwrap();
        let out = lines.iter().position(|l| l == "out").unwrap();
        assert!(out < exit);
    }

    #[tokio::test]
    async fn restart_walks_through_stopping_and_restarting() {
        let store = LogStore::new();
        let supervisor = Supervisor::new(
            vec![ServiceDefinition::new("svc", "sleep", vec!["30".into()])],
            store.clone(),
            SupervisorOptions::default(),
        );
        supervisor.start("svc").await;
        let first_pid = supervisor.pid("svc").unwrap();
        let mut states = supervisor.subscribe_states();

        supervisor.restart("svc").await;

        let mut seen = Vec::new();
        while let Some(change) = states.try_recv() {
            seen.push(change.state);
        }
        assert_eq!(
            seen,
            vec![
                ProcessState::Stopping,
                ProcessState::Restarting,
                ProcessState::Starting,
                ProcessState::Healthy,
            ]
        );
        assert_ne!(supervisor.pid("svc"), Some(first_pid));
        assert!(texts(&store, "SYSTEM").contains(&"Restarting process svc...".to_string()));
        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn stop_kills_and_settles_stopped() {
        let store = LogStore::new();
        let supervisor = Supervisor::new(
            vec![ServiceDefinition::new("svc", "sleep", vec!["30".into()])],
            store.clone(),
            SupervisorOptions::default(),
        );
        supervisor.start("svc").await;
        assert_eq!(supervisor.state("svc"), Some(ProcessState::Healthy));

        supervisor.stop("svc").await;
        assert_eq!(supervisor.state("svc"), Some(ProcessState::Stopped));
        assert!(!supervisor.is_running("svc"));
    }

    #[tokio::test]
    async fn stop_cancels_a_pending_dependency_wait() {
        let store = LogStore::new();
        let supervisor = Supervisor::new(
            vec![ServiceDefinition::new("b", "true", Vec::new()).with_depends_on(&["never"])],
            store.clone(),
            SupervisorOptions {
                dependency_poll: Duration::from_millis(10),
                ..SupervisorOptions::default()
            },
        );
        let pending = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.start("b").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.stop("b").await;

        tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(supervisor.state("b"), Some(ProcessState::Stopped));
        assert!(!supervisor.is_running("b"));
    }

    #[tokio::test]
    async fn unknown_services_are_reported_not_fatal() {
        let store = LogStore::new();
        let supervisor = Supervisor::new(Vec::new(), store.clone(), SupervisorOptions::default());
        supervisor.restart("ghost").await;
        supervisor.start("ghost").await;
        assert_eq!(
            texts(&store, "SYSTEM"),
            vec![
                "Configuration for ghost not found.".to_string(),
                "Configuration for ghost not found.".to_string(),
            ]
        );
        assert!(!supervisor.toggle_mute("ghost"));
        assert!(!supervisor.toggle_solo("ghost"));
        assert_eq!(supervisor.get_service_flags("ghost"), ServiceFlags::default());
    }

    #[tokio::test]
    async fn toggles_flip_flags_and_narrate() {
        let store = LogStore::new();
        let supervisor = Supervisor::new(
            vec![ServiceDefinition::new("api", "true", Vec::new()).with_color("#00FF00")],
            store.clone(),
            SupervisorOptions::default(),
        );
        assert!(supervisor.toggle_mute("api"));
        assert!(supervisor.toggle_solo("api"));
        assert!(supervisor.toggle_mute("api"));
        assert_eq!(
            supervisor.get_service_flags("api"),
            ServiceFlags {
                mute: false,
                solo: true
            }
        );
        assert_eq!(
            texts(&store, "SYSTEM"),
            vec!["api is now muted.", "api is now solo.", "api is now unmuted."]
        );
        assert_eq!(supervisor.color("api").as_deref(), Some("#00FF00"));
        assert_eq!(supervisor.state("api"), Some(ProcessState::Pending));
    }

    // Fake children exit only when signalled and count how many are alive at once.
    #[derive(Default)]
    struct CountingLauncher {
        live: Arc<AtomicUsize>,
        max_live: Arc<AtomicUsize>,
        launches: AtomicUsize,
    }

    struct FakeChild {
        live: Arc<AtomicUsize>,
        killed: watch::Receiver<bool>,
        kill_tx: watch::Sender<bool>,
    }

    #[async_trait]
    impl ChildProcess for FakeChild {
        fn signal(&mut self, _signal: KillSignal) -> io::Result<()> {
            let _ = self.kill_tx.send(true);
            Ok(())
        }

        async fn wait(&mut self) -> io::Result<ExitOutcome> {
            let _ = self.killed.wait_for(|killed| *killed).await;
            self.live.fetch_sub(1, Ordering::SeqCst);
            Ok(ExitOutcome::signaled(15))
        }
    }

    impl Launcher for CountingLauncher {
        fn launch(&self, _definition: &ServiceDefinition) -> io::Result<LaunchedProcess> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(now, Ordering::SeqCst);
            let (kill_tx, killed) = watch::channel(false);
            Ok(LaunchedProcess {
                pid: None,
                stdout: None,
                stderr: None,
                child: Box::new(FakeChild {
                    live: self.live.clone(),
                    killed,
                    kill_tx,
                }),
            })
        }
    }

    #[tokio::test]
    async fn back_to_back_restarts_never_overlap_handles() {
        let launcher = Arc::new(CountingLauncher::default());
        let supervisor = Supervisor::with_launcher(
            vec![ServiceDefinition::new("svc", "fake", Vec::new())],
            LogStore::new(),
            SupervisorOptions::default(),
            launcher.clone(),
        );
        supervisor.start("svc").await;
        assert_eq!(launcher.live.load(Ordering::SeqCst), 1);

        tokio::join!(supervisor.restart("svc"), supervisor.restart("svc"));

        assert_eq!(launcher.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.live.load(Ordering::SeqCst), 1);
        assert!(launcher.launches.load(Ordering::SeqCst) >= 2);
        assert!(supervisor.is_running("svc"));
        assert_eq!(supervisor.state("svc"), Some(ProcessState::Healthy));

        supervisor.cleanup().await;
        assert_eq!(launcher.live.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.state("svc"), Some(ProcessState::Stopped));
    }

    #[tokio::test]
    async fn start_on_a_live_service_is_a_no_op() {
        let launcher = Arc::new(CountingLauncher::default());
        let store = LogStore::new();
        let supervisor = Supervisor::with_launcher(
            vec![ServiceDefinition::new("svc", "fake", Vec::new())],
            store.clone(),
            SupervisorOptions::default(),
            launcher.clone(),
        );
        supervisor.start("svc").await;
        supervisor.start("svc").await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(texts(&store, "svc").contains(&"svc is already running.".to_string()));
        supervisor.cleanup().await;
    }
}
