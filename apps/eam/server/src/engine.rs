use std::{sync::Arc, time::Duration};

use eam_core::{
    config::{AppConfig, ControllerConfig},
    engine::{scripted::ScriptedEngine, DesktopWindow, Engine},
};
use tracing::info;

/// Engine backend used when no native binding is linked. Pipelines succeed
/// after `task_delay`, and every configured win32 window is reported present.
pub fn dry_run_engine(config: &AppConfig, task_delay: Duration) -> Arc<dyn Engine> {
    let windows: Vec<DesktopWindow> = config
        .taskers
        .iter()
        .filter_map(|tasker| match &tasker.controller {
            ControllerConfig::Win32(window) => Some(window),
            _ => None,
        })
        .zip(1u64..)
        .map(|(window, handle)| DesktopWindow {
            handle,
            class_name: window.class_name.clone(),
            window_name: window.window_name.clone(),
        })
        .collect();
    info!(
        taskers = config.taskers.len(),
        windows = windows.len(),
        task_delay_ms = task_delay.as_millis() as u64,
        "using dry-run engine"
    );
    Arc::new(
        ScriptedEngine::new()
            .with_task_delay(task_delay)
            .with_windows(windows),
    )
}
