//! The coordinating actor.
//!
//! One task owns the process supervisor, both state machines and the
//! in-flight request. Everything else talks to it through messages:
//!
//! - caller commands arrive on a bounded channel from [`CoordinatorHandle`]
//! - process output and exits arrive from the supervisor's reader tasks
//! - expiry timers post [`ExpiryFired`] when their delay elapses
//! - the HTTP request, progress poller and image writer post their results
//!
//! State is published on a `watch` channel after every message, so
//! observers only ever see snapshots.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use diffuse_api::{ApiError, ApiResult, GenerationBackend, GenerationRequest};
use diffuse_runner::{
    LogEvent, LogEventParser, ProcessLifecycleState, ProcessSupervisor, RunnerError,
    SupervisorEvent,
};
use diffuse_store::{ImageWriter, SavedImages};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::catalog::ModelCatalog;
use crate::config::SupervisorConfig;
use crate::error::{CoreError, CoreResult, GenerationError};
use crate::expiry::{ExpiryFired, ExpiryTimer, TimerKind};
use crate::generation::{progress_percent, GenerationMachine};
use crate::model_load::ModelLoadMachine;
use crate::snapshot::{GenerationResult, SupervisorSnapshot};

const COMMAND_BUFFER: usize = 32;

/// What `submit` resolves to.
pub type GenerationOutcome = Result<GenerationResult, GenerationError>;

enum Command {
    Start {
        executable: Option<PathBuf>,
        reply: oneshot::Sender<CoreResult<u64>>,
    },
    Terminate {
        reply: oneshot::Sender<bool>,
    },
    Submit {
        request: GenerationRequest,
        reply: oneshot::Sender<GenerationOutcome>,
    },
    SelectModel {
        name: String,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    RequestModelLoad {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Results of work the actor spawned.
enum Internal {
    Response {
        ticket: u64,
        result: ApiResult<Vec<String>>,
    },
    Progress {
        ticket: u64,
        fraction: f64,
    },
    Persisted {
        ticket: u64,
        result: Result<SavedImages, String>,
    },
    CheckpointSwitched {
        name: String,
        result: ApiResult<()>,
    },
}

struct InFlight {
    ticket: u64,
    reply: oneshot::Sender<GenerationOutcome>,
    tasks: Vec<AbortHandle>,
    images: Vec<String>,
}

impl InFlight {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Cheap, cloneable access to a running coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SupervisorSnapshot>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start { .. } => "Start",
            Self::Terminate { .. } => "Terminate",
            Self::Submit { .. } => "Submit",
            Self::SelectModel { .. } => "SelectModel",
            Self::RequestModelLoad { .. } => "RequestModelLoad",
            Self::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl CoordinatorHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> CoreResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CoreError::CoordinatorStopped)?;
        rx.await.map_err(|_| CoreError::CoordinatorStopped)
    }

    /// Launch the backend, optionally with another launch script.
    /// Returns the run id.
    pub async fn start(&self, executable: Option<PathBuf>) -> CoreResult<u64> {
        self.call(|reply| Command::Start { executable, reply }).await?
    }

    /// Stop the backend. Returns false if nothing was running.
    pub async fn terminate(&self) -> CoreResult<bool> {
        self.call(|reply| Command::Terminate { reply }).await
    }

    /// Run one generation and wait for its result.
    pub async fn submit(&self, request: GenerationRequest) -> GenerationOutcome {
        match self.call(|reply| Command::Submit { request, reply }).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GenerationError::CoordinatorStopped),
        }
    }

    /// Select the checkpoint used for generation.
    pub async fn select_model(&self, name: impl Into<String>) -> CoreResult<()> {
        let name = name.into();
        self.call(|reply| Command::SelectModel { name, reply }).await?
    }

    /// Start a new model load explicitly.
    pub async fn request_model_load(&self) -> CoreResult<()> {
        self.call(|reply| Command::RequestModelLoad { reply }).await
    }

    /// Stop the backend and the actor.
    pub async fn shutdown(&self) -> CoreResult<()> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    /// Latest published state.
    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that is notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until a snapshot satisfies `predicate`, or `timeout` elapses.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Option<SupervisorSnapshot>
    where
        F: FnMut(&SupervisorSnapshot) -> bool,
    {
        let mut rx = self.subscribe();
        let found = match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(snapshot)) => Some(SupervisorSnapshot::clone(&snapshot)),
            _ => None,
        };
        found
    }
}

/// Owner of all supervisor state. Lives inside its own task.
pub struct Coordinator {
    config: SupervisorConfig,
    supervisor: ProcessSupervisor,
    parser: LogEventParser,
    model: ModelLoadMachine,
    generation: GenerationMachine,
    backend: Arc<dyn GenerationBackend>,
    writer: Arc<dyn ImageWriter>,
    service_url: Option<String>,
    selected_model: Option<String>,
    in_flight: Option<InFlight>,
    next_ticket: u64,
    last_result: Option<GenerationResult>,
    last_error: Option<String>,
    /// Generation outcomes, delivered once the matching snapshot is out
    replies: Vec<(oneshot::Sender<GenerationOutcome>, GenerationOutcome)>,
    internal: mpsc::UnboundedSender<Internal>,
    snapshots: watch::Sender<SupervisorSnapshot>,
}

impl Coordinator {
    /// Start the actor on the current tokio runtime.
    pub fn spawn(
        config: SupervisorConfig,
        backend: Arc<dyn GenerationBackend>,
        writer: Arc<dyn ImageWriter>,
    ) -> CoreResult<CoordinatorHandle> {
        config.validate()?;
        let parser = LogEventParser::new()?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (supervisor_tx, supervisor_rx) = mpsc::unbounded_channel();
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let model = ModelLoadMachine::new(
            ExpiryTimer::new(TimerKind::ModelLoad, config.model_load_expiry(), expiry_tx.clone()),
            config.block_generation_on_load_failure,
        );
        let generation = GenerationMachine::new(ExpiryTimer::new(
            TimerKind::Generation,
            config.generation_expiry(),
            expiry_tx,
        ));

        let (snapshot_tx, snapshot_rx) = watch::channel(SupervisorSnapshot::default());
        let coordinator = Self {
            supervisor: ProcessSupervisor::new(config.launch_config(), supervisor_tx),
            selected_model: config.selected_model.clone(),
            config,
            parser,
            model,
            generation,
            backend,
            writer,
            service_url: None,
            in_flight: None,
            next_ticket: 0,
            last_result: None,
            last_error: None,
            replies: Vec::new(),
            internal: internal_tx,
            snapshots: snapshot_tx,
        };
        coordinator.publish();

        tokio::spawn(coordinator.run(command_rx, supervisor_rx, expiry_rx, internal_rx));

        Ok(CoordinatorHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut supervisor_events: mpsc::UnboundedReceiver<SupervisorEvent>,
        mut expiries: mpsc::UnboundedReceiver<ExpiryFired>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!("Coordinator started ({})", self.supervisor.state());

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("All handles dropped");
                        break;
                    };
                    if !self.on_command(command) {
                        break;
                    }
                }
                Some(event) = supervisor_events.recv() => self.on_supervisor_event(event),
                Some(fired) = expiries.recv() => self.on_expiry(fired),
                Some(message) = internal.recv() => self.on_internal(message),
            }
            self.publish();
            self.flush_replies();
        }

        self.teardown();
        self.publish();
        self.flush_replies();
        info!("Coordinator stopped");
    }

    fn reply(&mut self, to: oneshot::Sender<GenerationOutcome>, outcome: GenerationOutcome) {
        self.replies.push((to, outcome));
    }

    fn flush_replies(&mut self) {
        for (to, outcome) in self.replies.drain(..) {
            let _ = to.send(outcome);
        }
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn snapshot(&self) -> SupervisorSnapshot {
        let exit = self.supervisor.last_exit();
        SupervisorSnapshot {
            process: self.supervisor.state(),
            crashed: exit.map(|e| e.crashed).unwrap_or(false),
            exit_code: exit.and_then(|e| e.code),
            service_url: self.service_url.clone(),
            model_load: self.model.phase(),
            model_load_elapsed_secs: self.model.elapsed_secs(),
            generation: self.generation.phase(),
            generation_allowed: self.gate().is_ok(),
            selected_model: self.selected_model.clone(),
            last_result: self.last_result.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn base_url(&self) -> String {
        self.service_url
            .clone()
            .unwrap_or_else(|| self.config.base_url.clone())
    }

    // Commands

    fn on_command(&mut self, command: Command) -> bool {
        debug!("Command: {:?}", command);
        match command {
            Command::Start { executable, reply } => {
                let result = self.start(executable);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Terminate { reply } => {
                let stopping = self.terminate();
                self.publish();
                self.flush_replies();
                let _ = reply.send(stopping);
            }
            Command::Submit { request, reply } => self.submit(request, reply),
            Command::SelectModel { name, reply } => {
                let result = self.select_model(name);
                self.publish();
                let _ = reply.send(result);
            }
            Command::RequestModelLoad { reply } => {
                self.model.request_load();
                self.publish();
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.teardown();
                self.publish();
                self.flush_replies();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn start(&mut self, executable: Option<PathBuf>) -> CoreResult<u64> {
        match self.supervisor.start(executable) {
            Ok(run) => {
                self.model.expect_load();
                self.service_url = None;
                self.last_error = None;
                Ok(run)
            }
            Err(RunnerError::AlreadyRunning) => Err(RunnerError::AlreadyRunning.into()),
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    fn terminate(&mut self) -> bool {
        if !self.supervisor.terminate() {
            return false;
        }
        self.fail_in_flight(GenerationError::ProcessTerminated);
        self.model.reset();
        self.generation.reset();
        true
    }

    fn teardown(&mut self) {
        self.supervisor.terminate();
        self.fail_in_flight(GenerationError::ProcessTerminated);
        self.model.reset();
        self.generation.reset();
    }

    fn select_model(&mut self, name: String) -> CoreResult<()> {
        if let Some(dir) = &self.config.models_dir {
            match ModelCatalog::scan(dir) {
                Ok(catalog) if catalog.find(&name).is_none() => {
                    return Err(CoreError::Catalog(format!(
                        "no checkpoint named '{}' in {}",
                        name,
                        dir.display()
                    )));
                }
                Ok(_) => {}
                Err(e) => warn!("Could not verify checkpoint '{}': {}", name, e),
            }
        }

        info!("Selected model {}", name);
        self.selected_model = Some(name.clone());

        if self.supervisor.state() == ProcessLifecycleState::Active {
            self.model.request_load();

            let backend = self.backend.clone();
            let base_url = self.base_url();
            let tx = self.internal.clone();
            tokio::spawn(async move {
                let result = backend.set_checkpoint(&base_url, &name).await;
                let _ = tx.send(Internal::CheckpointSwitched { name, result });
            });
        }

        Ok(())
    }

    /// Checks that do not depend on the request itself.
    fn gate(&self) -> Result<(), GenerationError> {
        let state = self.supervisor.state();
        if state != ProcessLifecycleState::Active {
            return Err(GenerationError::Precondition(format!("backend is {}", state)));
        }
        if self.in_flight.is_some() || !self.generation.phase().accepts_request() {
            return Err(GenerationError::Precondition(
                "a generation is already in progress".to_string(),
            ));
        }
        if !self.model.allows_generation() {
            return Err(GenerationError::Precondition(format!(
                "model load is {}",
                self.model.phase()
            )));
        }
        if self.selected_model.is_none() {
            return Err(GenerationError::Precondition("no model selected".to_string()));
        }
        Ok(())
    }

    fn submit(&mut self, request: GenerationRequest, reply: oneshot::Sender<GenerationOutcome>) {
        if let Err(e) = self.gate().and_then(|_| request.validate().map_err(GenerationError::from)) {
            warn!("Generation rejected: {}", e);
            self.reply(reply, Err(e));
            return;
        }

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.generation.begin();

        let base_url = self.base_url();
        let payload = request.to_payload();
        info!(
            "Generation {} submitted ({}x{}, {} steps, seed {})",
            ticket, payload.width, payload.height, payload.steps, payload.seed
        );

        let mut tasks = Vec::with_capacity(2);

        let backend = self.backend.clone();
        let tx = self.internal.clone();
        let timeout = self.config.request_timeout();
        let url = base_url.clone();
        let request_task = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, backend.txt2img(&url, &payload)).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::Timeout),
            };
            let _ = tx.send(Internal::Response { ticket, result });
        });
        tasks.push(request_task.abort_handle());

        if let Some(every) = self.config.progress_interval() {
            let backend = self.backend.clone();
            let tx = self.internal.clone();
            let poller = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match backend.progress(&base_url).await {
                        Ok(fraction) => {
                            if tx.send(Internal::Progress { ticket, fraction }).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("Progress poll failed: {}", e),
                    }
                }
            });
            tasks.push(poller.abort_handle());
        }

        self.in_flight = Some(InFlight {
            ticket,
            reply,
            tasks,
            images: Vec::new(),
        });
    }

    fn fail_in_flight(&mut self, error: GenerationError) {
        if let Some(mut flight) = self.in_flight.take() {
            warn!("Generation {} failed: {}", flight.ticket, error);
            flight.abort_tasks();
            self.last_error = Some(error.to_string());
            self.reply(flight.reply, Err(error));
        }
    }

    fn current_flight(&mut self, ticket: u64) -> Option<&mut InFlight> {
        self.in_flight.as_mut().filter(|f| f.ticket == ticket)
    }

    // Supervisor events

    fn on_supervisor_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::OutputStarted { run } => self.mark_active(run),
            SupervisorEvent::Line { run, line } => {
                if !self.supervisor.is_current(run) {
                    return;
                }
                // A line can overtake the other stream's first-output notice.
                self.mark_active(run);
                self.on_log_line(&line.message);
            }
            SupervisorEvent::Exited {
                run,
                code,
                requested,
            } => {
                let Some(report) = self.supervisor.on_exit(run, code, requested) else {
                    return;
                };
                self.fail_in_flight(GenerationError::ProcessTerminated);
                self.model.reset();
                self.generation.reset();
                self.service_url = None;
                if report.crashed {
                    self.last_error = Some(match code {
                        Some(code) => format!("backend exited unexpectedly with code {}", code),
                        None => "backend was killed unexpectedly".to_string(),
                    });
                }
            }
        }
    }

    fn mark_active(&mut self, run: u64) {
        if self.supervisor.mark_active(run) {
            self.model.on_backend_active();
        }
    }

    fn on_log_line(&mut self, message: &str) {
        match self.parser.parse(message) {
            LogEvent::ServiceReady(url) => {
                info!("Backend serving at {}", url);
                self.service_url = Some(url);
            }
            LogEvent::Unrecognized(line) => debug!("Unrecognized backend line: {}", line),
            event => {
                if !self.model.on_event(&event) {
                    debug!("Ignoring {:?} while model load is {}", event, self.model.phase());
                } else if let LogEvent::ModelLoadTiming(secs) = event {
                    info!("Model loaded in {:.1}s", secs);
                } else if event == LogEvent::ModelLoadFailureMarker {
                    warn!("Model failed to load: {}", message);
                }
            }
        }
    }

    // Timers

    fn on_expiry(&mut self, fired: ExpiryFired) {
        let reverted = match fired.kind {
            TimerKind::ModelLoad => self.model.on_expired(fired.epoch),
            TimerKind::Generation => self.generation.on_expired(fired.epoch),
        };
        if !reverted {
            debug!("Discarding superseded {:?} expiry (epoch {})", fired.kind, fired.epoch);
        }
    }

    // Spawned work

    fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Response { ticket, result } => self.on_response(ticket, result),
            Internal::Progress { ticket, fraction } => {
                if self.current_flight(ticket).is_some() {
                    self.generation.on_progress(progress_percent(fraction));
                }
            }
            Internal::Persisted { ticket, result } => self.on_persisted(ticket, result),
            Internal::CheckpointSwitched { name, result } => match result {
                Ok(()) => info!("Backend switched to checkpoint {}", name),
                Err(e) => {
                    warn!("Backend rejected checkpoint {}: {}", name, e);
                    self.last_error = Some(format!("checkpoint switch to {} failed: {}", name, e));
                    self.model.fail();
                }
            },
        }
    }

    fn on_response(&mut self, ticket: u64, result: ApiResult<Vec<String>>) {
        let output_dir = self.config.generation_output_dir();
        let writer = self.writer.clone();
        let tx = self.internal.clone();

        let Some(flight) = self.current_flight(ticket) else {
            debug!("Discarding response of stale generation {}", ticket);
            return;
        };
        flight.abort_tasks();

        let images = match result {
            Ok(images) => images,
            Err(e) => {
                self.generation.fail();
                self.fail_in_flight(e.into());
                return;
            }
        };

        debug!("Generation {} returned {} image(s)", ticket, images.len());
        flight.images = images.clone();
        let persist = tokio::spawn(async move {
            let result = writer
                .save_images(&images, &output_dir)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(Internal::Persisted { ticket, result });
        });
        flight.tasks.push(persist.abort_handle());

        self.generation.finishing();
    }

    fn on_persisted(&mut self, ticket: u64, saved: Result<SavedImages, String>) {
        if self.current_flight(ticket).is_none() {
            debug!("Discarding persistence result of stale generation {}", ticket);
            return;
        }
        let Some(flight) = self.in_flight.take() else {
            return;
        };

        let mut result = GenerationResult::new(flight.images);
        match saved {
            Ok(saved) => {
                info!("Generation {} saved {} image(s)", ticket, saved.saved_paths.len());
                result = result.with_saved(saved);
            }
            Err(e) => {
                warn!("Generation {} succeeded but images were not saved: {}", ticket, e);
                self.last_error = Some(format!("failed to save images: {}", e));
                result = result.with_persistence_error(e);
            }
        }

        self.generation.complete();
        self.last_result = Some(result.clone());
        self.reply(flight.reply, Ok(result));
    }
}

#[cfg(test)]
mod tests {
    use diffuse_api::MockBackend;
    use diffuse_store::RecordingWriter;

    use super::*;

    fn spawn_default() -> CoordinatorHandle {
        Coordinator::spawn(
            SupervisorConfig::default(),
            Arc::new(MockBackend::new()),
            Arc::new(RecordingWriter::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_initial_snapshot() {
        let handle = spawn_default();
        let snapshot = handle.snapshot();

        assert_eq!(snapshot.process, ProcessLifecycleState::NotConfigured);
        assert!(!snapshot.generation_allowed);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn test_submit_without_backend_is_precondition_error() {
        let backend = MockBackend::new();
        let handle = Coordinator::spawn(
            SupervisorConfig::default(),
            Arc::new(backend.clone()),
            Arc::new(RecordingWriter::new()),
        )
        .unwrap();

        let err = handle.submit(GenerationRequest::new("x")).await.unwrap_err();
        assert_eq!(err.kind(), "precondition");
        assert!(backend.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_without_executable() {
        let handle = spawn_default();
        let err = handle.start(None).await.unwrap_err();

        assert!(matches!(err, CoreError::Runner(RunnerError::Launch(_))));
        assert!(handle.snapshot().last_error.is_some());
        assert!(!handle.terminate().await.unwrap());
    }

    #[tokio::test]
    async fn test_select_model_while_stopped_only_records() {
        let backend = MockBackend::new();
        let handle = Coordinator::spawn(
            SupervisorConfig::default(),
            Arc::new(backend.clone()),
            Arc::new(RecordingWriter::new()),
        )
        .unwrap();

        handle.select_model("v1-5-pruned-emaonly.safetensors").await.unwrap();
        assert_eq!(
            handle.snapshot().selected_model.as_deref(),
            Some("v1-5-pruned-emaonly.safetensors")
        );
        assert_eq!(backend.call_count("set_checkpoint"), 0);
    }

    #[tokio::test]
    async fn test_select_unknown_model_from_catalog() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("known.safetensors"), b"").unwrap();
        let config = SupervisorConfig {
            models_dir: Some(dir.path().to_path_buf()),
            ..SupervisorConfig::default()
        };
        let handle =
            Coordinator::spawn(config, Arc::new(MockBackend::new()), Arc::new(RecordingWriter::new()))
                .unwrap();

        assert!(matches!(
            handle.select_model("missing.ckpt").await,
            Err(CoreError::Catalog(_))
        ));
        handle.select_model("known.safetensors").await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_actor() {
        let handle = spawn_default();
        handle.shutdown().await.unwrap();

        assert!(matches!(
            handle.start(None).await,
            Err(CoreError::CoordinatorStopped)
        ));
        assert_eq!(
            handle.submit(GenerationRequest::new("x")).await.unwrap_err(),
            GenerationError::CoordinatorStopped
        );
    }
}
