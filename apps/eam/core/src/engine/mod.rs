//! Collaborator interface to the automation engine.
//!
//! The engine owns screen capture, recognition, input injection and pipeline
//! execution. The operator only needs to create handles, bind them together
//! and post work that resolves to a success flag.

use std::{path::Path, str::FromStr, sync::Arc};

use async_trait::async_trait;

use crate::{custom::CustomRegistry, error::EngineError};

pub mod scripted;

#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> String;

    /// Prepares the engine option directory. Called once per operator.
    fn init_toolkit(&self, user_dir: &Path) -> Result<(), EngineError>;

    fn new_tasker(&self) -> Result<Arc<dyn Tasker>, EngineError>;

    fn new_resource(&self) -> Result<Arc<dyn Resource>, EngineError>;

    fn new_controller(&self, spec: &ControllerSpec) -> Result<Arc<dyn Controller>, EngineError>;

    fn find_desktop_windows(&self) -> Vec<DesktopWindow>;
}

#[async_trait]
pub trait Resource: Send + Sync {
    async fn load_bundle(&self, path: &Path) -> bool;

    fn register_customs(&self, customs: &CustomRegistry) -> bool;
}

#[async_trait]
pub trait Controller: Send + Sync {
    async fn connect(&self) -> bool;

    fn connected(&self) -> bool;
}

#[async_trait]
pub trait Tasker: Send + Sync {
    fn bind_resource(&self, resource: &Arc<dyn Resource>) -> bool;

    fn bind_controller(&self, controller: &Arc<dyn Controller>) -> bool;

    fn initialized(&self) -> bool;

    /// Posts `entry` with its JSON override and waits for the result.
    async fn run_pipeline(&self, entry: &str, param: &str) -> bool;

    /// Asks the engine to abort the current pipeline and waits for the
    /// acknowledgement.
    async fn post_stop(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopWindow {
    pub handle: u64,
    pub class_name: String,
    pub window_name: String,
}

/// Validated controller construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerSpec {
    Adb {
        adb_path: std::path::PathBuf,
        serial: String,
        screencap: AdbScreencap,
        input: AdbInput,
        config: String,
        agent_dir: std::path::PathBuf,
    },
    Win32 {
        handle: u64,
        screencap: Win32Screencap,
        input: Win32Input,
    },
}

macro_rules! method_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub enum $name {
            #[default]
            Default,
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $name::Default => "Default",
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            /// Empty means the engine default; matching ignores case.
            fn from_str(value: &str) -> Result<Self, Self::Err> {
                let value = value.trim();
                if value.is_empty() || value.eq_ignore_ascii_case("default") {
                    return Ok($name::Default);
                }
                $(
                    if value.eq_ignore_ascii_case($text) {
                        return Ok($name::$variant);
                    }
                )+
                Err(EngineError::UnknownMethod {
                    kind: $kind,
                    value: value.to_string(),
                })
            }
        }
    };
}

method_enum!(AdbScreencap, "adb screencap", {
    EncodeToFileAndPull => "EncodeToFileAndPull",
    Encode => "Encode",
    RawWithGzip => "RawWithGzip",
    RawByNetcat => "RawByNetcat",
    MinicapDirect => "MinicapDirect",
    MinicapStream => "MinicapStream",
    EmulatorExtras => "EmulatorExtras",
});

method_enum!(AdbInput, "adb input", {
    AdbShell => "AdbShell",
    MinitouchAndAdbKey => "MinitouchAndAdbKey",
    Maatouch => "Maatouch",
    EmulatorExtras => "EmulatorExtras",
});

method_enum!(Win32Screencap, "win32 screencap", {
    Gdi => "GDI",
    FramePool => "FramePool",
    DxgiDesktopDup => "DXGI_DesktopDup",
});

method_enum!(Win32Input, "win32 input", {
    Seize => "Seize",
    SendMessage => "SendMessage",
});
