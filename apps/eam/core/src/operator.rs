//! One automation session: engine handles, tasker profile and lifecycle.
//!
//! Lifecycle per activation:
//! `Created -> ToolkitReady -> TaskerReady -> ResourceBound -> ControllerBound
//! -> Connected -> Running -> {Completed | Cancelled | Failed} -> Destroyed`.
//! Any failed step is terminal for the activation and the caller must
//! [`Operator::destroy`]. A destroyed operator can be activated again.

use std::{fmt, path::PathBuf, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{AppConfig, ControllerConfig, TaskerProfile},
    custom::CustomRegistry,
    engine::{Controller, ControllerSpec, Engine, Resource, Tasker},
    error::{EngineError, OperatorError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    Created,
    ToolkitReady,
    TaskerReady,
    ResourceBound,
    ControllerBound,
    Connected,
    Running,
    Completed,
    Cancelled,
    Failed,
    Destroyed,
}

impl OperatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            OperatorState::Created => "created",
            OperatorState::ToolkitReady => "toolkit-ready",
            OperatorState::TaskerReady => "tasker-ready",
            OperatorState::ResourceBound => "resource-bound",
            OperatorState::ControllerBound => "controller-bound",
            OperatorState::Connected => "connected",
            OperatorState::Running => "running",
            OperatorState::Completed => "completed",
            OperatorState::Cancelled => "cancelled",
            OperatorState::Failed => "failed",
            OperatorState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for OperatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide collaborators shared by every operator.
pub struct OperatorEnv {
    pub engine: Arc<dyn Engine>,
    pub resource_dir: PathBuf,
    pub agent_dir: PathBuf,
    pub adb_path: PathBuf,
    pub user_dir: PathBuf,
}

impl OperatorEnv {
    pub fn from_config(engine: Arc<dyn Engine>, config: &AppConfig) -> Self {
        Self {
            engine,
            resource_dir: config.resource_dir.clone(),
            agent_dir: config.agent_dir.clone(),
            adb_path: config.adb_path.clone(),
            user_dir: config.log.dir.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub total: usize,
}

impl RunReport {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Every task was attempted; individual failures are listed in the report.
    Completed(RunReport),
    Cancelled(RunReport),
    Failed(OperatorError),
}

/// Stops a running task sequence from outside the lifecycle lock.
#[derive(Clone)]
pub struct Stopper {
    tasker: Arc<dyn Tasker>,
}

impl Stopper {
    /// Cancels `token` and waits for the engine to acknowledge the abort.
    pub async fn stop(&self, token: &CancellationToken) -> bool {
        token.cancel();
        self.tasker.post_stop().await
    }
}

pub struct Operator {
    id: String,
    profile: TaskerProfile,
    env: Arc<OperatorEnv>,
    state: OperatorState,
    toolkit_ready: bool,
    tasker: Option<Arc<dyn Tasker>>,
    resource: Option<Arc<dyn Resource>>,
    controller: Option<Arc<dyn Controller>>,
}

impl Operator {
    /// Creates the operator and prepares the engine toolkit. A toolkit failure
    /// leaves the operator in `Created`; `init_tasker` retries it.
    pub fn new(profile: TaskerProfile, env: Arc<OperatorEnv>) -> Self {
        let mut operator = Self {
            id: profile.id.clone(),
            profile,
            env,
            state: OperatorState::Created,
            toolkit_ready: false,
            tasker: None,
            resource: None,
            controller: None,
        };
        if let Err(err) = operator.init_toolkit() {
            warn!(tasker_id = %operator.id, error = %err, "toolkit init deferred");
        }
        operator
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> OperatorState {
        self.state
    }

    pub fn profile(&self) -> &TaskerProfile {
        &self.profile
    }

    fn init_toolkit(&mut self) -> Result<(), EngineError> {
        self.env.engine.init_toolkit(&self.env.user_dir)?;
        self.toolkit_ready = true;
        self.state = OperatorState::ToolkitReady;
        info!(tasker_id = %self.id, user_dir = %self.env.user_dir.display(), "toolkit ready");
        Ok(())
    }

    fn expect_state(
        &self,
        op: &'static str,
        allowed: &[OperatorState],
    ) -> Result<(), OperatorError> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(OperatorError::InvalidState {
            id: self.id.clone(),
            op,
            state: self.state,
        })
    }

    fn tasker(&self) -> Result<Arc<dyn Tasker>, OperatorError> {
        self.tasker.clone().ok_or_else(|| OperatorError::InvalidState {
            id: self.id.clone(),
            op: "use tasker",
            state: self.state,
        })
    }

    pub fn init_tasker(&mut self) -> Result<(), OperatorError> {
        self.expect_state(
            "init tasker",
            &[
                OperatorState::Created,
                OperatorState::ToolkitReady,
                OperatorState::Destroyed,
            ],
        )?;
        if !self.toolkit_ready {
            self.init_toolkit().map_err(|err| {
                error!(tasker_id = %self.id, error = %err, "failed to init toolkit");
                OperatorError::EngineInit(err.to_string())
            })?;
        }

        let tasker = self.env.engine.new_tasker().map_err(|err| {
            error!(tasker_id = %self.id, error = %err, "failed to init tasker");
            OperatorError::EngineInit(err.to_string())
        })?;
        self.tasker = Some(tasker);
        self.state = OperatorState::TaskerReady;
        info!(tasker_id = %self.id, "tasker ready");
        Ok(())
    }

    pub async fn init_resource(&mut self) -> Result<(), OperatorError> {
        self.expect_state("init resource", &[OperatorState::TaskerReady])?;
        let tasker = self.tasker()?;

        let resource = self.env.engine.new_resource().map_err(|err| {
            error!(tasker_id = %self.id, error = %err, "failed to create resource");
            OperatorError::ResourceLoad(err.to_string())
        })?;
        self.resource = Some(Arc::clone(&resource));

        let bundle = &self.env.resource_dir;
        if !resource.load_bundle(bundle).await {
            error!(tasker_id = %self.id, path = %bundle.display(), "failed to load resource bundle");
            return Err(OperatorError::ResourceLoad(format!(
                "bundle {} did not load",
                bundle.display()
            )));
        }

        let customs = CustomRegistry::for_profile(self.env.adb_path.clone(), &self.profile);
        if !resource.register_customs(&customs) {
            error!(tasker_id = %self.id, customs = ?customs.names(), "failed to register customs");
            return Err(OperatorError::ResourceLoad(
                "custom registration rejected".to_string(),
            ));
        }

        if !tasker.bind_resource(&resource) {
            error!(tasker_id = %self.id, "failed to bind resource");
            return Err(OperatorError::ResourceLoad("bind rejected".to_string()));
        }
        self.state = OperatorState::ResourceBound;
        info!(
            tasker_id = %self.id,
            path = %bundle.display(),
            customs = customs.len(),
            "resource bound"
        );
        Ok(())
    }

    pub fn init_controller(&mut self) -> Result<(), OperatorError> {
        self.expect_state("init controller", &[OperatorState::ResourceBound])?;
        let tasker = self.tasker()?;

        let spec = self.controller_spec().inspect_err(|err| {
            error!(
                tasker_id = %self.id,
                controller = self.profile.controller.kind(),
                error = %err,
                "invalid controller config"
            );
        })?;
        let controller = self.env.engine.new_controller(&spec).map_err(|err| {
            error!(tasker_id = %self.id, error = %err, "failed to create controller");
            OperatorError::ControllerInit(err.to_string())
        })?;
        self.controller = Some(Arc::clone(&controller));

        if !tasker.bind_controller(&controller) {
            error!(tasker_id = %self.id, "failed to bind controller");
            return Err(OperatorError::ControllerInit("bind rejected".to_string()));
        }
        self.state = OperatorState::ControllerBound;
        info!(tasker_id = %self.id, spec = ?spec, "controller bound");
        Ok(())
    }

    fn controller_spec(&self) -> Result<ControllerSpec, OperatorError> {
        let invalid = |err: EngineError| OperatorError::ControllerInit(err.to_string());
        match &self.profile.controller {
            ControllerConfig::Adb(device) => {
                if device.serial.trim().is_empty() {
                    return Err(OperatorError::ControllerInit(
                        "adb serial is empty".to_string(),
                    ));
                }
                let config = serde_json::to_string(&device.config)
                    .map_err(|err| OperatorError::ControllerInit(err.to_string()))?;
                Ok(ControllerSpec::Adb {
                    adb_path: self.env.adb_path.clone(),
                    serial: device.serial.clone(),
                    screencap: device.screencap.parse().map_err(invalid)?,
                    input: device.input.parse().map_err(invalid)?,
                    config,
                    agent_dir: self.env.agent_dir.clone(),
                })
            }
            ControllerConfig::Win32(window) => {
                let screencap = window.screencap.parse().map_err(invalid)?;
                let input = window.input.parse().map_err(invalid)?;
                let handle = self
                    .env
                    .engine
                    .find_desktop_windows()
                    .into_iter()
                    .find(|found| {
                        found.window_name == window.window_name
                            && found.class_name == window.class_name
                    })
                    .map(|found| found.handle)
                    .ok_or_else(|| {
                        invalid(EngineError::WindowNotFound {
                            name: window.window_name.clone(),
                            class: window.class_name.clone(),
                        })
                    })?;
                Ok(ControllerSpec::Win32 {
                    handle,
                    screencap,
                    input,
                })
            }
            ControllerConfig::Unsupported => Err(OperatorError::ControllerInit(
                "unsupported controller type".to_string(),
            )),
        }
    }

    pub async fn connect(&mut self) -> Result<(), OperatorError> {
        self.expect_state("connect", &[OperatorState::ControllerBound])?;
        let tasker = self.tasker()?;
        let controller = self
            .controller
            .clone()
            .ok_or_else(|| OperatorError::Connect("controller missing".to_string()))?;

        if !controller.connect().await {
            error!(tasker_id = %self.id, "failed to connect device");
            return Err(OperatorError::Connect("device refused connection".to_string()));
        }
        if !tasker.initialized() {
            error!(tasker_id = %self.id, "tasker not initialized after connect");
            return Err(OperatorError::Connect("tasker not initialized".to_string()));
        }
        self.state = OperatorState::Connected;
        info!(tasker_id = %self.id, "device connected");
        Ok(())
    }

    /// Runs the four initialisation steps in order, stopping at the first
    /// failure. The caller destroys the operator on error.
    pub async fn activate(&mut self) -> Result<(), OperatorError> {
        self.init_tasker()?;
        self.init_resource().await?;
        self.init_controller()?;
        self.connect().await
    }

    pub fn stopper(&self) -> Option<Stopper> {
        self.tasker.clone().map(|tasker| Stopper { tasker })
    }

    /// Runs the configured tasks in order. A failed task is logged and the
    /// next one is attempted; only cancellation ends the sequence early.
    pub async fn run(&mut self, token: &CancellationToken) -> RunOutcome {
        if let Err(err) = self.expect_state("run", &[OperatorState::Connected]) {
            return RunOutcome::Failed(err);
        }
        let tasker = match self.tasker() {
            Ok(tasker) => tasker,
            Err(err) => return RunOutcome::Failed(err),
        };

        let mut tasks = Vec::with_capacity(self.profile.tasks.len());
        for task in &self.profile.tasks {
            match serde_json::to_string(&task.param) {
                Ok(param) => tasks.push((task.entry.clone(), param)),
                Err(source) => {
                    self.state = OperatorState::Failed;
                    error!(tasker_id = %self.id, entry = %task.entry, error = %source, "failed to serialize task param");
                    return RunOutcome::Failed(OperatorError::TaskParam {
                        entry: task.entry.clone(),
                        source,
                    });
                }
            }
        }

        self.state = OperatorState::Running;
        let mut report = RunReport {
            total: tasks.len(),
            ..RunReport::default()
        };
        info!(tasker_id = %self.id, tasks = report.total, "run started");

        for (entry, param) in &tasks {
            if token.is_cancelled() {
                break;
            }
            info!(tasker_id = %self.id, entry = %entry, "run task");
            let ok = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                ok = tasker.run_pipeline(entry, param) => ok,
            };
            if ok {
                debug!(tasker_id = %self.id, entry = %entry, "task succeeded");
                report.succeeded.push(entry.clone());
            } else if token.is_cancelled() {
                break;
            } else {
                warn!(tasker_id = %self.id, entry = %entry, "task failed; continuing");
                report.failed.push(entry.clone());
            }
        }

        if token.is_cancelled() {
            self.state = OperatorState::Cancelled;
            info!(
                tasker_id = %self.id,
                attempted = report.attempted(),
                total = report.total,
                "run cancelled"
            );
            RunOutcome::Cancelled(report)
        } else {
            self.state = OperatorState::Completed;
            info!(
                tasker_id = %self.id,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "run completed"
            );
            RunOutcome::Completed(report)
        }
    }

    /// Releases controller, resource and tasker. Safe from any state.
    pub fn destroy(&mut self) {
        if self.state == OperatorState::Destroyed {
            debug!(tasker_id = %self.id, "operator already destroyed");
            return;
        }
        let controller = self.controller.take().is_some();
        let resource = self.resource.take().is_some();
        let tasker = self.tasker.take().is_some();
        let previous = self.state;
        self.state = OperatorState::Destroyed;
        info!(
            tasker_id = %self.id,
            from = %previous,
            controller,
            resource,
            tasker,
            "operator destroyed"
        );
    }
}

impl Drop for Operator {
    fn drop(&mut self) {
        self.destroy();
    }
}
