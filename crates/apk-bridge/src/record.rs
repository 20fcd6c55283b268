use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Lifecycle of a tracked package, as reported to the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    #[default]
    Pending,
    Downloading,
    Downloaded,
    Installing,
    Installed,
    Error,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Pending => "pending",
            ArtifactStatus::Downloading => "downloading",
            ArtifactStatus::Downloaded => "downloaded",
            ArtifactStatus::Installing => "installing",
            ArtifactStatus::Installed => "installed",
            ArtifactStatus::Error => "error",
        }
    }

    /// States in which the record must point at a file on disk.
    pub fn has_local_file(&self) -> bool {
        matches!(
            self,
            ArtifactStatus::Downloaded | ArtifactStatus::Installing | ArtifactStatus::Installed
        )
    }

    pub fn can_move_to(&self, next: ArtifactStatus) -> bool {
        use ArtifactStatus::{Downloaded, Downloading, Error, Installed, Installing, Pending};

        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Downloaded | Error)
                | (Error, Downloading | Pending)
                | (Downloaded, Installing | Pending | Downloading)
                | (Installing, Installed | Downloaded | Pending | Downloading)
                | (Installed, Pending | Downloading)
        )
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registry entry per caller-supplied package id.
///
/// Fields are public for reading; status changes go through the transition
/// methods so `local_path` stays in step with `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub id: String,
    pub source_url: String,
    pub file_name: String,
    #[serde(default)]
    pub status: ArtifactStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ArtifactRecord {
    pub fn new(id: &str, source_url: &str) -> Self {
        Self {
            id: id.to_string(),
            source_url: source_url.to_string(),
            file_name: file_name_for(id),
            status: ArtifactStatus::Pending,
            local_path: None,
            downloaded_at: None,
            last_error: None,
        }
    }

    fn move_to(&mut self, next: ArtifactStatus) -> Result<()> {
        if !self.status.can_move_to(next) {
            return Err(BridgeError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn begin_download(&mut self, source_url: &str) -> Result<()> {
        if self.install_in_progress() {
            return Err(BridgeError::InvalidTransition {
                from: self.status,
                to: ArtifactStatus::Downloading,
            });
        }
        self.move_to(ArtifactStatus::Downloading)?;
        self.file_name = file_name_for(&self.id);
        self.source_url = source_url.to_string();
        self.local_path = None;
        self.downloaded_at = None;
        self.last_error = None;
        Ok(())
    }

    pub fn complete_download(&mut self, local_path: PathBuf, at: DateTime<Utc>) -> Result<()> {
        self.move_to(ArtifactStatus::Downloaded)?;
        self.local_path = Some(local_path);
        self.downloaded_at = Some(at);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.move_to(ArtifactStatus::Error)?;
        self.local_path = None;
        self.downloaded_at = None;
        self.last_error = Some(message.into());
        Ok(())
    }

    pub fn begin_install(&mut self) -> Result<()> {
        self.move_to(ArtifactStatus::Installing)?;
        self.last_error = None;
        Ok(())
    }

    /// Installer launched. The platform installer runs out of process, so
    /// this state is never confirmed.
    pub fn mark_installed(&mut self) -> Result<()> {
        self.move_to(ArtifactStatus::Installed)
    }

    pub fn cancel_install(&mut self) -> Result<()> {
        self.move_to(ArtifactStatus::Downloaded)
    }

    /// Back to `pending`, forgetting the local file. No-op on a pending record.
    pub fn reset(&mut self) -> Result<()> {
        if self.status != ArtifactStatus::Pending {
            self.move_to(ArtifactStatus::Pending)?;
        }
        self.local_path = None;
        self.downloaded_at = None;
        Ok(())
    }

    /// `installing` with no launch failure recorded: the permission prompt
    /// or the installer launch has not finished, so the file must stay put.
    /// A failed launch leaves `last_error` set and may be recovered.
    pub fn install_in_progress(&self) -> bool {
        self.status == ArtifactStatus::Installing && self.last_error.is_none()
    }

    /// True when the status claims a file and that file is gone.
    pub fn file_vanished(&self) -> bool {
        self.status.has_local_file()
            && self
                .local_path
                .as_ref()
                .is_none_or(|path| !path.is_file())
    }
}

/// Storage file name for an id. Keyed on the id rather than the URL so two
/// packages named `app.apk` on different hosts never collide. Anything
/// outside `[A-Za-z0-9._~-]` is percent-encoded, `%` included, so distinct
/// ids always map to distinct names and no separator reaches the path.
pub fn file_name_for(id: &str) -> String {
    format!("{}.apk", urlencoding::encode(id))
}
