//! In-process engine whose behaviour is scripted up front.
//!
//! Used by the test suites and as the server's dry-run backend. Every call is
//! recorded in a [`Journal`] so callers can assert on what the operator asked
//! the engine to do.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{Controller, ControllerSpec, DesktopWindow, Engine, Resource, Tasker};
use crate::{custom::CustomRegistry, error::EngineError};

/// Initialisation step that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Toolkit,
    Tasker,
    Resource,
    Controller,
    Connect,
}

#[derive(Debug, Clone, Default)]
pub struct Journal {
    pub toolkit_dirs: Vec<PathBuf>,
    pub bundles: Vec<PathBuf>,
    pub customs: Vec<&'static str>,
    pub controllers: Vec<ControllerSpec>,
    pub submitted: Vec<(String, String)>,
    pub completed: Vec<String>,
    pub stop_requests: usize,
}

impl Journal {
    pub fn submitted_entries(&self) -> Vec<&str> {
        self.submitted.iter().map(|(entry, _)| entry.as_str()).collect()
    }
}

#[derive(Default)]
struct Rules {
    task_delay: Duration,
    connect_delay: Duration,
    fail_stage: Option<Stage>,
    fail_entries: HashSet<String>,
    block_entries: HashSet<String>,
    refuse_stop: bool,
    windows: Vec<DesktopWindow>,
}

#[derive(Default)]
struct Script {
    rules: Mutex<Rules>,
    journal: Mutex<Journal>,
    live_handles: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Script>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_delay(self, delay: Duration) -> Self {
        self.script.rules.lock().task_delay = delay;
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.script.rules.lock().connect_delay = delay;
        self
    }

    pub fn fail_stage(self, stage: Stage) -> Self {
        self.script.rules.lock().fail_stage = Some(stage);
        self
    }

    pub fn fail_entry(self, entry: impl Into<String>) -> Self {
        self.script.rules.lock().fail_entries.insert(entry.into());
        self
    }

    /// The entry never finishes on its own; it resolves as failed once a
    /// stop is posted.
    pub fn block_entry(self, entry: impl Into<String>) -> Self {
        self.script.rules.lock().block_entries.insert(entry.into());
        self
    }

    /// `post_stop` answers `false` and leaves blocked pipelines waiting.
    pub fn refuse_stop(self) -> Self {
        self.script.rules.lock().refuse_stop = true;
        self
    }

    pub fn with_windows(self, windows: Vec<DesktopWindow>) -> Self {
        self.script.rules.lock().windows = windows;
        self
    }

    pub fn journal(&self) -> Journal {
        self.script.journal.lock().clone()
    }

    /// Handles created and not yet dropped.
    pub fn live_handles(&self) -> usize {
        self.script.live_handles.load(Ordering::SeqCst)
    }

    fn fails_at(&self, stage: Stage) -> bool {
        self.script.rules.lock().fail_stage == Some(stage)
    }

    fn track(&self) -> HandleGuard {
        self.script.live_handles.fetch_add(1, Ordering::SeqCst);
        HandleGuard {
            script: Arc::clone(&self.script),
        }
    }
}

struct HandleGuard {
    script: Arc<Script>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.script.live_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn version(&self) -> String {
        format!("scripted-{}", env!("CARGO_PKG_VERSION"))
    }

    fn init_toolkit(&self, user_dir: &Path) -> Result<(), EngineError> {
        if self.fails_at(Stage::Toolkit) {
            return Err(EngineError::Refused("toolkit"));
        }
        self.script.journal.lock().toolkit_dirs.push(user_dir.to_path_buf());
        Ok(())
    }

    fn new_tasker(&self) -> Result<Arc<dyn Tasker>, EngineError> {
        if self.fails_at(Stage::Tasker) {
            return Err(EngineError::Refused("tasker"));
        }
        Ok(Arc::new(ScriptedTasker {
            engine: self.clone(),
            resource_bound: AtomicBool::new(false),
            controller: Mutex::new(None),
            stop: Notify::new(),
            _guard: self.track(),
        }))
    }

    fn new_resource(&self) -> Result<Arc<dyn Resource>, EngineError> {
        Ok(Arc::new(ScriptedResource {
            engine: self.clone(),
            _guard: self.track(),
        }))
    }

    fn new_controller(&self, spec: &ControllerSpec) -> Result<Arc<dyn Controller>, EngineError> {
        if self.fails_at(Stage::Controller) {
            return Err(EngineError::Refused("controller"));
        }
        self.script.journal.lock().controllers.push(spec.clone());
        Ok(Arc::new(ScriptedController {
            engine: self.clone(),
            connected: AtomicBool::new(false),
            _guard: self.track(),
        }))
    }

    fn find_desktop_windows(&self) -> Vec<DesktopWindow> {
        self.script.rules.lock().windows.clone()
    }
}

struct ScriptedResource {
    engine: ScriptedEngine,
    _guard: HandleGuard,
}

#[async_trait]
impl Resource for ScriptedResource {
    async fn load_bundle(&self, path: &Path) -> bool {
        self.engine.script.journal.lock().bundles.push(path.to_path_buf());
        !self.engine.fails_at(Stage::Resource)
    }

    fn register_customs(&self, customs: &CustomRegistry) -> bool {
        let names = customs.recognitions().iter().map(|custom| custom.name());
        self.engine.script.journal.lock().customs.extend(names);
        true
    }
}

struct ScriptedController {
    engine: ScriptedEngine,
    connected: AtomicBool,
    _guard: HandleGuard,
}

#[async_trait]
impl Controller for ScriptedController {
    async fn connect(&self) -> bool {
        let delay = self.engine.script.rules.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let ok = !self.engine.fails_at(Stage::Connect);
        self.connected.store(ok, Ordering::SeqCst);
        ok
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct ScriptedTasker {
    engine: ScriptedEngine,
    resource_bound: AtomicBool,
    controller: Mutex<Option<Arc<dyn Controller>>>,
    stop: Notify,
    _guard: HandleGuard,
}

#[async_trait]
impl Tasker for ScriptedTasker {
    fn bind_resource(&self, _resource: &Arc<dyn Resource>) -> bool {
        self.resource_bound.store(true, Ordering::SeqCst);
        true
    }

    fn bind_controller(&self, controller: &Arc<dyn Controller>) -> bool {
        *self.controller.lock() = Some(Arc::clone(controller));
        true
    }

    fn initialized(&self) -> bool {
        let controller_ready = self
            .controller
            .lock()
            .as_ref()
            .map(|controller| controller.connected())
            .unwrap_or(false);
        self.resource_bound.load(Ordering::SeqCst) && controller_ready
    }

    async fn run_pipeline(&self, entry: &str, param: &str) -> bool {
        let script = &self.engine.script;
        script
            .journal
            .lock()
            .submitted
            .push((entry.to_string(), param.to_string()));

        let (blocked, delay, fails) = {
            let rules = script.rules.lock();
            (
                rules.block_entries.contains(entry),
                rules.task_delay,
                rules.fail_entries.contains(entry),
            )
        };

        if blocked {
            self.stop.notified().await;
            return false;
        }

        tokio::select! {
            _ = self.stop.notified() => return false,
            _ = tokio::time::sleep(delay) => {}
        }

        if fails {
            return false;
        }
        script.journal.lock().completed.push(entry.to_string());
        true
    }

    async fn post_stop(&self) -> bool {
        self.engine.script.journal.lock().stop_requests += 1;
        if self.engine.script.rules.lock().refuse_stop {
            return false;
        }
        self.stop.notify_one();
        true
    }
}
