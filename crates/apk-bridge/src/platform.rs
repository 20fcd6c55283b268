use std::path::Path;

use parking_lot::Mutex;
use tracing::info;

pub const ACTION_VIEW: &str = "android.intent.action.VIEW";
pub const ACTION_MANAGE_UNKNOWN_APP_SOURCES: &str =
    "android.settings.action.MANAGE_UNKNOWN_APP_SOURCES";
pub const APK_MIME_TYPE: &str = "application/vnd.android.package-archive";

pub const FLAG_GRANT_READ_URI_PERMISSION: i32 = 0x0000_0001;
pub const FLAG_ACTIVITY_NEW_TASK: i32 = 0x1000_0000;

/// Description of an activity launch, independent of the host OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRequest {
    pub action: String,
    pub data: Option<String>,
    pub mime_type: Option<String>,
    pub flags: i32,
}

impl IntentRequest {
    /// "View this package file", with a read grant so the installer process
    /// can open it.
    pub fn install_package(path: &Path) -> Self {
        Self {
            action: ACTION_VIEW.to_string(),
            data: Some(file_uri(path)),
            mime_type: Some(APK_MIME_TYPE.to_string()),
            flags: FLAG_ACTIVITY_NEW_TASK | FLAG_GRANT_READ_URI_PERMISSION,
        }
    }

    pub fn unknown_sources_settings() -> Self {
        Self {
            action: ACTION_MANAGE_UNKNOWN_APP_SOURCES.to_string(),
            data: None,
            mime_type: None,
            flags: FLAG_ACTIVITY_NEW_TASK,
        }
    }

    /// Local filesystem path behind a `file://` data URI, if any.
    pub fn file_path(&self) -> Option<&str> {
        self.data.as_deref()?.strip_prefix("file://")
    }
}

pub fn file_uri(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if raw.starts_with("file://") {
        raw.into_owned()
    } else {
        format!("file://{raw}")
    }
}

/// The host OS as seen by the bridge: something that can start activities.
pub trait Platform: Send + Sync {
    fn start_activity(&self, intent: &IntentRequest) -> anyhow::Result<()>;
}

/// Logs and remembers every launch instead of performing it. Used for
/// headless hosts and tests.
#[derive(Debug, Default)]
pub struct RecordingPlatform {
    launched: Mutex<Vec<IntentRequest>>,
    failing_action: Mutex<Option<String>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every launch of `action` fail.
    pub fn failing_on(action: &str) -> Self {
        let platform = Self::default();
        *platform.failing_action.lock() = Some(action.to_string());
        platform
    }

    pub fn launched(&self) -> Vec<IntentRequest> {
        self.launched.lock().clone()
    }

    pub fn launched_actions(&self) -> Vec<String> {
        self.launched.lock().iter().map(|i| i.action.clone()).collect()
    }
}

impl Platform for RecordingPlatform {
    fn start_activity(&self, intent: &IntentRequest) -> anyhow::Result<()> {
        if self.failing_action.lock().as_deref() == Some(intent.action.as_str()) {
            anyhow::bail!("no activity found to handle {}", intent.action);
        }
        info!(
            "[Platform] start_activity {} {}",
            intent.action,
            intent.data.as_deref().unwrap_or("")
        );
        self.launched.lock().push(intent.clone());
        Ok(())
    }
}
