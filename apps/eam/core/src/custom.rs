//! Application-provided recognitions registered into every resource handle.

use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    adb,
    config::{ControllerConfig, TaskerProfile},
};

/// Arguments the engine passes to a custom recognition.
#[derive(Debug, Clone, Copy)]
pub struct CustomArgs<'a> {
    pub task: &'a str,
    pub param: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecognitionHit {
    pub detail: String,
}

pub trait CustomRecognition: Send + Sync {
    fn name(&self) -> &'static str;

    fn recognize(&self, args: CustomArgs<'_>) -> Option<RecognitionHit>;
}

#[derive(Clone, Default)]
pub struct CustomRegistry {
    recognitions: Vec<Arc<dyn CustomRecognition>>,
}

impl CustomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Customs shipped for a tasker profile.
    pub fn for_profile(adb_path: PathBuf, profile: &TaskerProfile) -> Self {
        let mut registry = Self::new();
        if let ControllerConfig::Adb(device) = &profile.controller {
            registry.add_recognition(IsAppInactive {
                adb_path,
                serial: device.serial.clone(),
            });
        }
        registry
    }

    pub fn add_recognition(&mut self, recognition: impl CustomRecognition + 'static) {
        self.recognitions.push(Arc::new(recognition));
    }

    pub fn recognitions(&self) -> &[Arc<dyn CustomRecognition>] {
        &self.recognitions
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.recognitions.iter().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.recognitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hits when the configured package is not in the foreground.
pub struct IsAppInactive {
    adb_path: PathBuf,
    serial: String,
}

#[derive(Debug, Deserialize)]
struct IsAppInactiveParam {
    package: String,
}

impl IsAppInactive {
    pub const NAME: &'static str = "IsAppInactive";

    fn evaluate(foreground: Option<&str>, package: &str) -> Option<RecognitionHit> {
        if foreground == Some(package) {
            return None;
        }
        Some(RecognitionHit {
            detail: foreground.unwrap_or_default().to_string(),
        })
    }
}

impl CustomRecognition for IsAppInactive {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn recognize(&self, args: CustomArgs<'_>) -> Option<RecognitionHit> {
        let param: IsAppInactiveParam = match serde_json::from_str(args.param) {
            Ok(param) => param,
            Err(err) => {
                warn!(task = args.task, error = %err, "invalid IsAppInactive param");
                return None;
            }
        };
        let foreground = match adb::foreground_package(&self.adb_path, &self.serial) {
            Ok(foreground) => foreground,
            Err(err) => {
                warn!(serial = %self.serial, error = %err, "failed to query foreground app");
                return None;
            }
        };
        debug!(
            package = %param.package,
            foreground = ?foreground,
            "checked foreground app"
        );
        Self::evaluate(foreground.as_deref(), &param.package)
    }
}
