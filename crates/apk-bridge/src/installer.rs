use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    error::{BridgeError, Result},
    permission::PermissionFlow,
    platform::{IntentRequest, Platform},
    record::{ArtifactRecord, ArtifactStatus},
    registry::Registry,
};

#[derive(Debug, Clone, PartialEq)]
pub enum InstallOutcome {
    /// The system installer was started. Whether the user finished the
    /// install is not observable from here.
    Launched(ArtifactRecord),
    /// The user declined the unknown-sources prompt.
    Cancelled(ArtifactRecord),
}

impl InstallOutcome {
    pub fn record(&self) -> &ArtifactRecord {
        match self {
            InstallOutcome::Launched(record) | InstallOutcome::Cancelled(record) => record,
        }
    }
}

#[derive(Clone)]
pub struct InstallLauncher {
    registry: Registry,
    permission: PermissionFlow,
    platform: Arc<dyn Platform>,
}

impl InstallLauncher {
    pub fn new(registry: Registry, permission: PermissionFlow, platform: Arc<dyn Platform>) -> Self {
        Self {
            registry,
            permission,
            platform,
        }
    }

    pub async fn request_install(&self, id: &str) -> Result<InstallOutcome> {
        let id = id.trim();
        if id.is_empty() {
            return Err(BridgeError::InvalidRequest("missing apkId".to_string()));
        }

        // Preconditions are checked inside the registry writer so nothing can
        // slip in between the check and the move to `installing`.
        let record = self
            .registry
            .update(id, |slot| {
                let record = slot.as_mut().ok_or(BridgeError::NotFound)?;
                if record.status != ArtifactStatus::Downloaded {
                    return Err(BridgeError::NotDownloaded);
                }
                if record.file_vanished() {
                    return Err(BridgeError::FileMissing);
                }
                record.begin_install()
            })
            .await?
            .ok_or(BridgeError::NotFound)?;

        let Some(path) = record.local_path.clone() else {
            return Err(BridgeError::FileMissing);
        };
        let intent = IntentRequest::install_package(&path);
        let platform = &self.platform;

        let launched = self
            .permission
            .gate(&format!("install {id}"), move || async move {
                platform.start_activity(&intent)
            })
            .await;

        match launched {
            None => {
                info!("[Install] {id} cancelled at the permission prompt");
                let record = self
                    .transition(id, |record| record.cancel_install())
                    .await?;
                Ok(InstallOutcome::Cancelled(record))
            }
            Some(Ok(())) => {
                info!("📦 [Install] Installer launched for {id}");
                let record = self
                    .transition(id, |record| record.mark_installed())
                    .await?;
                Ok(InstallOutcome::Launched(record))
            }
            Some(Err(err)) => {
                warn!("❌ [Install] Could not launch installer for {id}: {err:#}");
                let message = format!("{err:#}");
                if let Err(record_err) = self
                    .registry
                    .update(id, move |slot| {
                        if let Some(record) = slot.as_mut() {
                            record.last_error = Some(message);
                        }
                        Ok(())
                    })
                    .await
                {
                    warn!("[Install] Failed to record error for {id}: {record_err}");
                }
                Err(BridgeError::Platform(err))
            }
        }
    }

    pub async fn open_installer(&self, id: &str) -> Result<InstallOutcome> {
        self.request_install(id).await
    }

    async fn transition<F>(&self, id: &str, apply: F) -> Result<ArtifactRecord>
    where
        F: FnOnce(&mut ArtifactRecord) -> Result<()> + Send + 'static,
    {
        self.registry
            .update(id, |slot| match slot.as_mut() {
                Some(record) => apply(record),
                None => Err(BridgeError::NotFound),
            })
            .await?
            .ok_or(BridgeError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::{
        permission::PromptReceiver,
        platform::{ACTION_VIEW, RecordingPlatform},
        store::MemoryStore,
    };

    struct Fixture {
        launcher: InstallLauncher,
        registry: Registry,
        platform: Arc<RecordingPlatform>,
        prompts: PromptReceiver,
        dir: tempfile::TempDir,
    }

    fn fixture(platform: RecordingPlatform) -> Fixture {
        let platform = Arc::new(platform);
        let registry = Registry::spawn(Arc::new(MemoryStore::new()));
        let (permission, prompts) = PermissionFlow::channel(platform.clone(), Duration::ZERO);
        Fixture {
            launcher: InstallLauncher::new(registry.clone(), permission, platform.clone()),
            registry,
            platform,
            prompts,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    async fn seed_downloaded(fixture: &Fixture, id: &str) {
        let path = fixture.dir.path().join(format!("{id}.apk"));
        std::fs::write(&path, b"PK").unwrap();
        let mut record = ArtifactRecord::new(id, "https://x/a.apk");
        record.begin_download("https://x/a.apk").unwrap();
        record.complete_download(path, Utc::now()).unwrap();
        fixture.registry.put(record).await;
    }

    fn answer_all(mut prompts: PromptReceiver, confirm: bool) {
        tokio::spawn(async move {
            while let Some(prompt) = prompts.recv().await {
                if confirm {
                    prompt.confirm();
                } else {
                    prompt.cancel();
                }
            }
        });
    }

    #[tokio::test]
    async fn test_install_before_download_is_not_found() {
        let fixture = fixture(RecordingPlatform::new());
        let err = fixture.launcher.request_install("app1").await.unwrap_err();
        assert_eq!(err.to_string(), "APK not found or not downloaded");
        assert!(fixture.platform.launched().is_empty());
    }

    #[tokio::test]
    async fn test_install_while_pending_is_not_downloaded() {
        let fixture = fixture(RecordingPlatform::new());
        fixture
            .registry
            .put(ArtifactRecord::new("app1", "https://x/a.apk"))
            .await;
        let err = fixture.launcher.request_install("app1").await.unwrap_err();
        assert_eq!(err.to_string(), "APK not downloaded yet");
    }

    #[tokio::test]
    async fn test_install_with_vanished_file() {
        let fixture = fixture(RecordingPlatform::new());
        seed_downloaded(&fixture, "app1").await;
        std::fs::remove_file(fixture.dir.path().join("app1.apk")).unwrap();

        let err = fixture.launcher.request_install("app1").await.unwrap_err();
        assert_eq!(err.to_string(), "APK file not found");
        assert_eq!(
            fixture.registry.get("app1").await.unwrap().status,
            ArtifactStatus::Downloaded
        );
    }

    #[tokio::test]
    async fn test_confirmed_install_launches_view_intent() {
        let fixture = fixture(RecordingPlatform::new());
        seed_downloaded(&fixture, "app1").await;
        let Fixture {
            launcher,
            registry,
            platform,
            prompts,
            dir: _dir,
        } = fixture;
        answer_all(prompts, true);

        let outcome = launcher.request_install("app1").await.unwrap();
        assert!(matches!(outcome, InstallOutcome::Launched(_)));
        assert_eq!(outcome.record().status, ArtifactStatus::Installed);

        let launched = platform.launched();
        assert_eq!(launched.len(), 2);
        assert_eq!(launched[1].action, ACTION_VIEW);
        assert_eq!(launched[1].flags, 268_435_457);
        assert_eq!(
            registry.get("app1").await.unwrap().status,
            ArtifactStatus::Installed
        );
    }

    #[tokio::test]
    async fn test_cancelled_prompt_returns_to_downloaded() {
        let fixture = fixture(RecordingPlatform::new());
        seed_downloaded(&fixture, "app1").await;
        let Fixture {
            launcher,
            registry,
            platform,
            prompts,
            dir: _dir,
        } = fixture;
        answer_all(prompts, false);

        let outcome = launcher.open_installer("app1").await.unwrap();
        assert!(matches!(outcome, InstallOutcome::Cancelled(_)));
        assert!(platform.launched().is_empty());
        let record = registry.get("app1").await.unwrap();
        assert_eq!(record.status, ArtifactStatus::Downloaded);
        assert!(record.local_path.is_some());
    }

    #[tokio::test]
    async fn test_platform_failure_leaves_installing() {
        let fixture = fixture(RecordingPlatform::failing_on(ACTION_VIEW));
        seed_downloaded(&fixture, "app1").await;
        let Fixture {
            launcher,
            registry,
            prompts,
            dir: _dir,
            ..
        } = fixture;
        answer_all(prompts, true);

        let err = launcher.request_install("app1").await.unwrap_err();
        assert!(matches!(err, BridgeError::Platform(_)));

        let record = registry.get("app1").await.unwrap();
        assert_eq!(record.status, ArtifactStatus::Installing);
        assert!(record.last_error.is_some());
        assert!(record.local_path.is_some());
    }
}
