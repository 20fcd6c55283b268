use std::sync::Arc;

use anyhow::Context;
use reqwest::Client;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    config::BridgeConfig,
    downloader::DownloadEngine,
    installer::InstallLauncher,
    permission::{PermissionFlow, PromptReceiver},
    platform::Platform,
    protocol::BridgeEvent,
    registry::Registry,
    router::HostRouter,
    store::{FileStore, KvStore},
    update::UpdateService,
};

const EVENT_BUFFER: usize = 256;

/// Everything the transport needs, wired once at startup.
#[derive(Clone)]
pub struct BridgeState {
    pub config: Arc<BridgeConfig>,
    pub registry: Registry,
    pub downloads: DownloadEngine,
    pub installer: InstallLauncher,
    pub permission: PermissionFlow,
    pub updates: UpdateService,
    pub router: HostRouter,
    /// Callback scripts for whichever pages are connected to `/events`.
    pub events: broadcast::Sender<String>,
}

impl BridgeState {
    /// Builds the bridge over a file-backed store in `config.storage_dir`.
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: BridgeConfig,
        platform: Arc<dyn Platform>,
    ) -> anyhow::Result<(Self, PromptReceiver)> {
        std::fs::create_dir_all(&config.storage_dir).with_context(|| {
            format!("creating storage dir {}", config.storage_dir.display())
        })?;
        let store: Arc<dyn KvStore> = Arc::new(FileStore::new(config.storage_dir.clone()));
        Self::with_store(config, platform, store)
    }

    pub fn with_store(
        config: BridgeConfig,
        platform: Arc<dyn Platform>,
        store: Arc<dyn KvStore>,
    ) -> anyhow::Result<(Self, PromptReceiver)> {
        let client = build_http_client(&config).context("building HTTP client")?;
        let registry = Registry::spawn(store.clone());
        let (permission, prompts) =
            PermissionFlow::channel(platform.clone(), config.settings_grace);
        let downloads =
            DownloadEngine::new(client.clone(), registry.clone(), config.download_dir.clone());
        let installer = InstallLauncher::new(registry.clone(), permission.clone(), platform);
        let updates = UpdateService::new(client, store, &config);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let router = HostRouter::new(
            downloads.clone(),
            installer.clone(),
            permission.clone(),
            updates.clone(),
            Arc::new(events.clone()),
        );

        info!(
            "🗂️ [Bridge] Downloads in {}, storage in {}",
            config.download_dir.display(),
            config.storage_dir.display()
        );

        Ok((
            Self {
                config: Arc::new(config),
                registry,
                downloads,
                installer,
                permission,
                updates,
                router,
                events,
            },
            prompts,
        ))
    }

    /// Startup housekeeping: recover interrupted downloads, then run the
    /// throttled update check and announce anything pending.
    pub async fn on_start(&self) {
        self.downloads.recover_interrupted().await;
        if !self.config.check_updates_on_start {
            return;
        }
        if let Some(info) = self.updates.check_on_start().await {
            let _ = self
                .events
                .send(BridgeEvent::UpdateAvailable { info }.to_script());
        }
    }
}

pub fn build_http_client(config: &BridgeConfig) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.connect_timeout)
        .build()
}
